//! Datagram transport abstraction and UDP implementation
//!
//! The engine talks to two connectionless endpoints (data and control)
//! through these traits; tests substitute an in-memory factory.
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


use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Receiver of inbound datagrams
#[async_trait]
pub trait DatagramSink: Send + Sync {
    /// Deliver one datagram received from `origin`
    async fn deliver(&self, origin: SocketAddr, data: Bytes);
}

/// A bound connectionless endpoint
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send one datagram to `peer`
    async fn send(&self, data: &[u8], peer: SocketAddr) -> SessionResult<()>;

    /// The address this endpoint is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Start delivering inbound datagrams to `sink`
    async fn start(&self, sink: Arc<dyn DatagramSink>);

    /// Stop delivery and release the endpoint
    async fn close(&self);
}

/// Creates bound transports; the seam tests use to avoid real sockets
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Bind an endpoint to `addr` with the given buffer sizes
    async fn bind(
        &self,
        addr: SocketAddr,
        send_buffer_size: usize,
        receive_buffer_size: usize,
    ) -> SessionResult<Arc<dyn PacketTransport>>;
}

/// UDP transport over a tokio socket.
///
/// The receive loop reads into a fixed `receive_buffer_size`-byte buffer
/// and runs on its own task until `close`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receive_buffer_size: usize,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind a UDP endpoint to `addr`
    pub async fn bind(addr: SocketAddr, receive_buffer_size: usize) -> SessionResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SessionError::BindFailure(format!("Failed to bind UDP {}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SessionError::BindFailure(format!("Failed to bind UDP {}: {}", addr, e)))?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
            receive_buffer_size,
            closed: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            receiver: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send(&self, data: &[u8], peer: SocketAddr) -> SessionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::TransportClosed);
        }
        self.socket.send_to(data, peer).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn start(&self, sink: Arc<dyn DatagramSink>) {
        let socket = self.socket.clone();
        let shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; self.receive_buffer_size];

        let handle = tokio::spawn(async move {
            loop {
                let stopped = shutdown.notified();
                tokio::select! {
                    _ = stopped => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, origin)) => {
                            sink.deliver(origin, Bytes::copy_from_slice(&buf[..len])).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "UDP receive error");
                        }
                    },
                }
            }
        });

        *self.receiver.lock().await = Some(handle);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // notify_one leaves a permit, so a receiver busy delivering a
        // packet still observes the shutdown on its next loop turn
        self.shutdown.notify_one();
        // Detach rather than join: close may run on the receiver task
        // itself when inbound processing terminates the session
        drop(self.receiver.lock().await.take());
    }
}

/// Default factory producing `UdpTransport` endpoints
#[derive(Debug, Default)]
pub struct UdpTransportFactory;

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn bind(
        &self,
        addr: SocketAddr,
        _send_buffer_size: usize,
        receive_buffer_size: usize,
    ) -> SessionResult<Arc<dyn PacketTransport>> {
        Ok(Arc::new(UdpTransport::bind(addr, receive_buffer_size).await?))
    }
}
