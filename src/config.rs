//! Session configuration
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::time::Duration;

/// Session configuration.
///
/// Immutable once the session is running; setters on the session fail
/// with `ConfigurationImmutable` after `init`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Drop inbound RTP whose sequence number is at or below the last
    /// one seen from the same source
    pub discard_out_of_order: bool,
    /// Socket send buffer size in bytes
    pub send_buffer_size: usize,
    /// Socket receive buffer (and receive allocation) size in bytes
    pub receive_buffer_size: usize,
    /// Foreign-origin collisions tolerated before declaring a loop
    pub max_collisions_before_considering_loop: u32,
    /// Whether the engine emits and consumes RTCP on its own; when set,
    /// explicit control sends are rejected except for APP packets
    pub automated_rtcp_handling: bool,
    /// Interval between routine RTCP report compounds
    pub report_interval: Duration,
    /// Informational host name, not interpreted by the engine
    pub host: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            discard_out_of_order: true,
            send_buffer_size: 1500,
            receive_buffer_size: 1500,
            max_collisions_before_considering_loop: 3,
            automated_rtcp_handling: true,
            report_interval: Duration::from_secs(5),
            host: None,
        }
    }
}
