// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TCP transport: accept loop, per-connection frame pump, and teardown.
//!
//! Identity note: the wire header carries no serviceId field (spec.md §3
//! defines it only as a map key, not a header field), so a connection's
//! serviceId is minted at accept time as a fresh UUIDv4 and held for the
//! lifetime of the socket. `system.service.register` then attaches a
//! human-readable name/description to that same id; it never changes it.

use crate::broker::Broker;
use crate::codec::FrameCodec;
use crate::config::BrokerConfig;
use crate::connection::ConnectionHandle;
use crate::router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The broker's TCP front door: owns the listener and the shared
/// `Broker` state, and fans accepted connections out to per-connection
/// tasks.
#[derive(Clone)]
pub struct Server {
    config: Arc<BrokerConfig>,
    broker: Broker,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: BrokerConfig) -> Result<Self, ServerError> {
        config.validate().map_err(|e| ServerError::Config(e.to_string()))?;
        let config = Arc::new(config);
        Ok(Self {
            broker: Broker::new((*config).clone()),
            config,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle to the broker's state, for embedding callers (tests, an
    /// admin surface) that want to inspect or drive it directly.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Binds the listener and runs the accept loop until `shutdown` is
    /// signalled.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        info!("topic broker listening on {}", addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let broker = self.broker.clone();
                            let config = self.config.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                let service_id = Uuid::new_v4().to_string();
                                info!(%peer_addr, service_id = %service_id, "connection accepted");
                                handle_connection(stream, service_id.clone(), broker.clone(), config, shutdown).await;
                                broker.disconnect(&service_id).await;
                                debug!(service_id = %service_id, "connection torn down");
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.broker.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Pumps frames for one connection until the socket closes, a frame
/// violates the size limit, or the broker asks the connection to close
/// (via `ConnectionHandle::close`, e.g. after a restricted system-topic
/// lookup failure) or the server shuts down.
async fn handle_connection(
    stream: TcpStream,
    service_id: String,
    broker: Broker,
    config: Arc<BrokerConfig>,
    shutdown: Arc<Notify>,
) {
    let peer_addr: Option<SocketAddr> = stream.peer_addr().ok();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(128);
    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
    broker
        .connect(&service_id, ConnectionHandle::new(outbound_tx, close_tx))
        .await;

    let mut codec = FrameCodec::new(config.max_frame_len);
    let mut read_buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = read_half.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!(service_id = %service_id, "connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        codec.push(&read_buf[..n]);
                        loop {
                            match codec.next_frame() {
                                Ok(Some(frame)) => router::dispatch(&broker, &service_id, &frame).await,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(service_id = %service_id, error = %e, "frame error, closing connection");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(service_id = %service_id, ?peer_addr, error = %e, "read error");
                        break;
                    }
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!(service_id = %service_id, error = %e, "write error");
                    break;
                }
            }
            _ = close_rx.recv() => {
                debug!(service_id = %service_id, "broker requested connection close");
                break;
            }
            _ = shutdown.notified() => {
                debug!(service_id = %service_id, "connection handler shutting down");
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;
}

/// Server-level error types.
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Bind(String),
    AlreadyRunning,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {s}"),
            Self::Bind(s) => write!(f, "bind error: {s}"),
            Self::AlreadyRunning => write!(f, "server already running"),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{serialize_message, Action, Header};

    #[tokio::test]
    async fn test_accept_and_respond_to_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = BrokerConfig::default();
        config.bind_address = addr.ip();
        config.port = addr.port();
        let server = Server::new(config).unwrap();
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = Header {
            action: Action::Request,
            topic: "system.heartbeat".to_string(),
            version: "1.0.0".to_string(),
            request_id: Some(Uuid::new_v4()),
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, b"{}", false);
        let frame = FrameCodec::encode(&body);
        stream.write_all(&frame).await.unwrap();

        let mut reply_buf = vec![0u8; 256];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), stream.read(&mut reply_buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 4);

        server.shutdown().await;
        let _ = server_task.await;
    }
}
