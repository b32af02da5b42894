// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The broker's process-wide state: subscription tries, service
//! registry, outstanding-request table, connection handles, and metrics,
//! behind a single lock. Cross-structure operations (oldest-eviction,
//! deregistration unsubscribing from both tries) need atomic moves
//! across these structures, so they share one `tokio::sync::Mutex`
//! rather than per-subsystem locks.

use crate::codec::{serialize_message, Action, FrameCodec, Header};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::metrics::{MetricsSink, SlotKind};
use crate::registry::{HeartbeatState, ServiceRegistry};
use crate::request_table::RequestTable;
use crate::subscription::SubscriptionManager;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub const METRIC_MESSAGE_COUNT: &str = "message.count";
pub const METRIC_MESSAGE_RATE: &str = "message.rate";
pub const METRIC_MESSAGE_SIZE_AVG: &str = "message.size.avg";
pub const METRIC_MESSAGE_SIZE_MAX: &str = "message.size.max";
pub const METRIC_PUBLISH_DROPPED: &str = "publish.dropped";
pub const METRIC_REQUEST_DROPPED: &str = "request.dropped";
pub const METRIC_RESPONSE_ERROR: &str = "response.error";
pub const METRIC_REQUEST_TIMEOUT: &str = "request.timeout";
pub const METRIC_MALFORMED: &str = "message.malformed";
pub const METRIC_CORE_UPTIME: &str = "core.uptime";
pub const METRIC_INTERNAL_ERROR: &str = "internal.error";

fn register_default_metrics(metrics: &mut MetricsSink) {
    metrics.register(METRIC_MESSAGE_COUNT, SlotKind::Rate);
    metrics.register(METRIC_MESSAGE_RATE, SlotKind::Rate);
    metrics.register(METRIC_MESSAGE_SIZE_AVG, SlotKind::Average);
    metrics.register(METRIC_MESSAGE_SIZE_MAX, SlotKind::Maximum);
    metrics.register(METRIC_PUBLISH_DROPPED, SlotKind::Rate);
    metrics.register(METRIC_REQUEST_DROPPED, SlotKind::Rate);
    metrics.register(METRIC_RESPONSE_ERROR, SlotKind::Rate);
    metrics.register(METRIC_REQUEST_TIMEOUT, SlotKind::Rate);
    metrics.register(METRIC_MALFORMED, SlotKind::Rate);
    metrics.register(METRIC_CORE_UPTIME, SlotKind::Uptime);
    metrics.register(METRIC_INTERNAL_ERROR, SlotKind::Rate);
}

/// Everything the broker mutates while handling a message.
pub struct BrokerState {
    pub subscriptions: SubscriptionManager,
    pub registry: ServiceRegistry,
    pub requests: RequestTable,
    pub connections: ConnectionManager,
    pub metrics: MetricsSink,
}

/// A cheaply-cloneable handle to the broker's shared state and config.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let mut metrics = MetricsSink::new();
        register_default_metrics(&mut metrics);
        let state = BrokerState {
            subscriptions: SubscriptionManager::new(),
            registry: ServiceRegistry::new(),
            requests: RequestTable::new(),
            connections: ConnectionManager::new(),
            metrics,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().await
    }

    /// Registers a new connection and arms its heartbeat timers.
    pub async fn connect(&self, service_id: &str, handle: ConnectionHandle) {
        self.lock().await.connections.register(service_id, handle);
        self.reset_heartbeat(service_id).await;
    }

    /// Cancels and reschedules both heartbeat timers from now, and
    /// returns the registration to `Healthy`. Called on every inbound
    /// message and on initial connect.
    pub async fn reset_heartbeat(&self, service_id: &str) {
        let retry = self.arm_retry_timer(service_id.to_string());
        let deregister = self.arm_deregister_timer(service_id.to_string());

        let mut state = self.lock().await;
        if let Some(reg) = state.registry.get_mut(service_id) {
            reg.timers.cancel();
            reg.timers.retry = Some(retry);
            reg.timers.deregister = Some(deregister);
            reg.state = HeartbeatState::Healthy;
            reg.last_heartbeat = std::time::Instant::now();
        } else {
            // Not yet registered via system.service.register: these
            // timers have nowhere to land, and if left running they
            // could misfire against a registration created later.
            // Abort outright rather than just dropping the handle.
            retry.abort();
            deregister.abort();
        }
    }

    fn arm_retry_timer(&self, service_id: String) -> tokio::task::AbortHandle {
        let broker = self.clone();
        let duration = self.config.heartbeat_retry_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            broker.on_retry_fire(&service_id).await;
        })
        .abort_handle()
    }

    fn arm_deregister_timer(&self, service_id: String) -> tokio::task::AbortHandle {
        let broker = self.clone();
        let duration = self.config.heartbeat_deregister_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            broker.on_deregister_fire(&service_id).await;
        })
        .abort_handle()
    }

    async fn on_retry_fire(&self, service_id: &str) {
        let mut state = self.lock().await;
        let Some(reg) = state.registry.get_mut(service_id) else {
            return;
        };
        if reg.state != HeartbeatState::Healthy {
            return;
        }
        reg.state = HeartbeatState::Probing;
        debug!(service_id, "heartbeat retry fired, probing");

        let header = Header {
            action: Action::Request,
            topic: "system.heartbeat".to_string(),
            version: "1.0.0".to_string(),
            request_id: None,
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, b"{}", false);
        let frame = FrameCodec::encode(&body);
        if state.connections.send_to(service_id, frame).await.is_err() {
            warn!(service_id, "failed to send heartbeat probe");
        }
    }

    async fn on_deregister_fire(&self, service_id: &str) {
        let mut state = self.lock().await;
        if !state.registry.contains(service_id) {
            return;
        }
        debug!(service_id, "heartbeat deregister fired");
        state.subscriptions.unsubscribe(service_id);
        state.registry.remove(service_id);
        state.connections.close(service_id).await;
        drop(state);
        self.emit_log("info", &format!("service {service_id} deregistered after missed heartbeat")).await;
    }

    /// Full connection-close teardown: deregister, unsubscribe from
    /// both tries, drop the connection handle. Idempotent.
    pub async fn disconnect(&self, service_id: &str) {
        let mut state = self.lock().await;
        state.subscriptions.unsubscribe(service_id);
        state.registry.remove(service_id);
        state.connections.unregister(service_id);
    }

    /// Clears every piece of process-wide state, in the order the
    /// design notes specify: requests, subscriptions, services,
    /// connections.
    pub async fn shutdown(&self) {
        let mut state = self.lock().await;
        state.requests.clear();
        let service_ids: Vec<String> = state.registry.iter().map(|(id, _)| id.clone()).collect();
        for id in service_ids {
            state.subscriptions.unsubscribe(&id);
            state.registry.remove(&id);
            state.connections.unregister(&id);
        }
    }

    /// Fans a log record out to every service whose `system.log.subscribe`
    /// level set and optional regex both accept it, as a `system.log`
    /// RESPONSE (no requestId: this is a push, not a correlated reply).
    pub async fn emit_log(&self, level: &str, message: &str) {
        let (subscribers, body) = {
            let state = self.lock().await;
            let subscribers = state.registry.log_subscribers(level, message);
            if subscribers.is_empty() {
                return;
            }
            let header = Header {
                action: Action::Response,
                topic: "system.log".to_string(),
                version: "1.0.0".to_string(),
                request_id: None,
                parent_request_id: None,
                timeout: None,
            };
            let payload = serde_json::json!({ "level": level, "message": message });
            let json = serde_json::to_vec(&payload).expect("log payload always serializes");
            (subscribers, serialize_message(&header, &json, false))
        };
        let frame = FrameCodec::encode(&body);
        let state = self.lock().await;
        for service_id in &subscribers {
            if state.connections.send_to(service_id, frame.clone()).await.is_err() {
                warn!(service_id = %service_id, "failed to deliver log record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistration;
    use tokio::sync::mpsc;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = mpsc::channel(1);
        (ConnectionHandle::new(tx, close_tx), rx)
    }

    #[tokio::test]
    async fn test_reset_heartbeat_arms_timers_for_registered_service() {
        let broker = Broker::new(BrokerConfig::default());
        {
            let mut state = broker.lock().await;
            state.registry.insert(ServiceRegistration::new("A", "a".into(), "".into()));
        }
        broker.reset_heartbeat("A").await;
        let state = broker.lock().await;
        let reg = state.registry.get("A").unwrap();
        assert!(reg.timers.retry.is_some());
        assert!(reg.timers.deregister.is_some());
        assert_eq!(reg.state, HeartbeatState::Healthy);
    }

    #[tokio::test]
    async fn test_retry_fire_probes_and_transitions() {
        let mut config = BrokerConfig::default();
        config.heartbeat_retry_timeout_ms = 10;
        config.heartbeat_deregister_timeout_ms = 10_000;
        let broker = Broker::new(config);
        let (h, mut rx) = handle();
        {
            let mut state = broker.lock().await;
            state.registry.insert(ServiceRegistration::new("A", "a".into(), "".into()));
            state.connections.register("A", h);
        }
        broker.reset_heartbeat("A").await;

        let frame = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());

        let state = broker.lock().await;
        assert_eq!(state.registry.get("A").unwrap().state, HeartbeatState::Probing);
    }

    #[tokio::test]
    async fn test_deregister_fire_removes_service() {
        let mut config = BrokerConfig::default();
        config.heartbeat_retry_timeout_ms = 100_000;
        config.heartbeat_deregister_timeout_ms = 10;
        let broker = Broker::new(config);
        {
            let mut state = broker.lock().await;
            state.registry.insert(ServiceRegistration::new("A", "a".into(), "".into()));
            state.subscriptions.subscribe_publish("A", "t.x");
        }
        broker.reset_heartbeat("A").await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let state = broker.lock().await;
        assert!(!state.registry.contains("A"));
        assert!(state.subscriptions.get_publish_subscribers("t.x").is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_everything() {
        let broker = Broker::new(BrokerConfig::default());
        let (h, _rx) = handle();
        {
            let mut state = broker.lock().await;
            state.registry.insert(ServiceRegistration::new("A", "a".into(), "".into()));
            state.subscriptions.subscribe_publish("A", "t.x");
            state.connections.register("A", h);
        }
        broker.disconnect("A").await;
        let state = broker.lock().await;
        assert!(!state.registry.contains("A"));
        assert!(!state.connections.is_connected("A"));
        assert!(state.subscriptions.get_publish_subscribers("t.x").is_empty());
    }

    #[tokio::test]
    async fn test_emit_log_reaches_matching_subscriber_only() {
        let broker = Broker::new(BrokerConfig::default());
        let (h_a, mut rx_a) = handle();
        let (h_b, mut rx_b) = handle();
        {
            let mut state = broker.lock().await;
            let mut a = ServiceRegistration::new("A", "a".into(), "".into());
            a.log_subscription.levels.insert("error".to_string());
            state.registry.insert(a);
            state.connections.register("A", h_a);

            let mut b = ServiceRegistration::new("B", "b".into(), "".into());
            b.log_subscription.levels.insert("info".to_string());
            state.registry.insert(b);
            state.connections.register("B", h_b);
        }

        broker.emit_log("error", "disk full").await;

        let frame = tokio::time::timeout(std::time::Duration::from_millis(500), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());
        assert!(rx_b.try_recv().is_err());
    }
}
