//! Error types for the RTP session engine
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


use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur in the session engine
#[derive(Error, Debug)]
pub enum SessionError {
    /// Payload type outside the RTP range
    #[error("Invalid payload type: {0} (must be in 0..=127)")]
    InvalidPayloadType(u8),

    /// Transport could not be bound
    #[error("Transport bind failure: {0}")]
    BindFailure(String),

    /// Configuration change attempted while the session is running
    #[error("Configuration is immutable while the session is running")]
    ConfigurationImmutable,

    /// Transport has already been closed
    #[error("Transport is closed")]
    TransportClosed,

    /// Packet parsing error
    #[error("Packet parse error: {0}")]
    PacketParse(String),

    /// Network error
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
}
