// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outstanding-request table: tracks in-flight REQUEST forwards awaiting
//! a RESPONSE, with timeout and oldest-by-`createdAt` eviction.

use crate::codec::Header;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Key identifying one outstanding request: the service it was forwarded
/// to, and the broker-minted requestId it was forwarded under.
pub type RequestKey = (String, Uuid);

/// A REQUEST forwarded to a target service, awaiting correlation with its
/// RESPONSE.
pub struct OutstandingRequest {
    pub origin_service_id: String,
    pub target_service_id: String,
    pub original_header: Header,
    pub target_request_id: Uuid,
    pub timer: Option<tokio::task::AbortHandle>,
    pub created_at: Instant,
}

impl OutstandingRequest {
    pub fn key(&self) -> RequestKey {
        (self.target_service_id.clone(), self.target_request_id)
    }
}

/// The `(targetServiceId, targetRequestId) -> OutstandingRequest` map.
#[derive(Default)]
pub struct RequestTable {
    entries: HashMap<RequestKey, OutstandingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: OutstandingRequest) {
        self.entries.insert(entry.key(), entry);
    }

    /// Removes and returns the entry at `key`, cancelling its timer. This
    /// is the single removal path used by response-correlation, timeout,
    /// eviction, and shutdown, so the invariant "exactly one of those
    /// removes a given request" holds by construction.
    pub fn remove(&mut self, key: &RequestKey) -> Option<OutstandingRequest> {
        let mut entry = self.entries.remove(key)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some(entry)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The key of the entry with the smallest `created_at`, if any.
    pub fn oldest(&self) -> Option<RequestKey> {
        self.entries
            .values()
            .min_by_key(|e| e.created_at)
            .map(|e| e.key())
    }

    /// Removes every entry, cancelling all timers (shutdown path).
    pub fn clear(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}
