// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Connection facade: send-by-serviceId, close, and the channel handles a
//! transport's read loop registers on behalf of a connected service.

use std::collections::HashMap;
use tokio::sync::mpsc;

/// A handle to a connected service's outbound channel. The transport's
/// write-side task owns the receiving end and drains it onto the wire.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Vec<u8>>,
    close: mpsc::Sender<()>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<Vec<u8>>, close: mpsc::Sender<()>) -> Self {
        Self { outbound, close }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self) {
        let _ = self.close.send(()).await;
    }
}

/// Tracks one `ConnectionHandle` per connected serviceId and mediates
/// send-by-serviceId / close-by-serviceId, the only two operations the
/// router and registry need from a transport.
#[derive(Default)]
pub struct ConnectionManager {
    connections: HashMap<String, ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service_id: impl Into<String>, handle: ConnectionHandle) {
        self.connections.insert(service_id.into(), handle);
    }

    pub fn unregister(&mut self, service_id: &str) {
        self.connections.remove(service_id);
    }

    pub fn is_connected(&self, service_id: &str) -> bool {
        self.connections.contains_key(service_id)
    }

    /// Sends a framed message to a connected service. Failure is the
    /// caller's to log: a fan-out to one dead subscriber must not abort
    /// delivery to the others.
    pub async fn send_to(&self, service_id: &str, frame: Vec<u8>) -> Result<(), ConnectionError> {
        match self.connections.get(service_id) {
            Some(handle) => handle.send(frame).await,
            None => Err(ConnectionError::NotConnected),
        }
    }

    pub async fn close(&mut self, service_id: &str) {
        if let Some(handle) = self.connections.remove(service_id) {
            handle.close().await;
        }
    }
}

/// Connection facade errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    NotConnected,
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "service is not connected"),
            Self::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}
