// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Action dispatch: publish fan-out, priority-weighted request routing
//! with response correlation, and the system-topic control plane.

use crate::broker::{
    Broker, METRIC_INTERNAL_ERROR, METRIC_MALFORMED, METRIC_MESSAGE_COUNT, METRIC_MESSAGE_SIZE_AVG,
    METRIC_MESSAGE_SIZE_MAX, METRIC_PUBLISH_DROPPED, METRIC_REQUEST_DROPPED,
    METRIC_REQUEST_TIMEOUT, METRIC_RESPONSE_ERROR,
};
use crate::codec::{serialize_message, Action, FrameCodec, Header, ParsedMessage};
use crate::error::{error_body, ErrorKind};
use crate::registry::{validate_name_description, ServiceRegistration};
use crate::request_table::OutstandingRequest;
use crate::subscription::SubscriptionKind;
use crate::topic;
use futures::FutureExt;
use rand::Rng;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// System topics a client may target with `system.topic.subscribe`/
/// `system.topic.unsubscribe` when the target itself begins with
/// `system.`. Every other `system.*` target is rejected as restricted.
const ALLOWED_SYSTEM_SUBSCRIBE_TARGETS: &[&str] = &[
    "system.log",
    "system.message",
    "system.service.register",
    "system.topic.subscribe",
    "system.topic.unsubscribe",
];

/// Entry point: parses and dispatches one framed message body received
/// from `sender_id`. The dispatch body runs behind a panic boundary —
/// a bug in any handler degrades to an `InternalError` RESPONSE instead
/// of taking the connection's task down with it.
pub async fn dispatch(broker: &Broker, sender_id: &str, frame_body: &[u8]) {
    let caught = AssertUnwindSafe(dispatch_inner(broker, sender_id, frame_body))
        .catch_unwind()
        .await;
    if caught.is_err() {
        warn!(sender_id, "dispatch panicked, degrading to internal error");
        broker.lock().await.metrics.increment(METRIC_INTERNAL_ERROR);
        send_error(broker, sender_id, None, ErrorKind::InternalError, "internal error", None).await;
    }
}

async fn dispatch_inner(broker: &Broker, sender_id: &str, frame_body: &[u8]) {
    let config = broker.config();
    let parsed = match ParsedMessage::parse(
        frame_body,
        config.max_header_len,
        config.max_payload_len,
        config.request_timeout_max_ms,
    ) {
        Ok(p) => p,
        Err(e) => {
            send_error(broker, sender_id, None, ErrorKind::MalformedMessage, &e.to_string(), None).await;
            broker.lock().await.metrics.increment(METRIC_MALFORMED);
            broker.emit_log("error", &format!("malformed message from {sender_id}: {e}")).await;
            return;
        }
    };

    broker.reset_heartbeat(sender_id).await;

    {
        let mut state = broker.lock().await;
        state.metrics.increment(METRIC_MESSAGE_COUNT);
        state.metrics.record(METRIC_MESSAGE_SIZE_AVG, frame_body.len() as f64);
        state.metrics.record(METRIC_MESSAGE_SIZE_MAX, frame_body.len() as f64);
    }

    match parsed.header.action {
        Action::Publish => handle_publish(broker, sender_id, &parsed).await,
        Action::Request => handle_request(broker, sender_id, &parsed).await,
        Action::Response => handle_response(broker, sender_id, &parsed).await,
    }
}

async fn handle_publish(broker: &Broker, sender_id: &str, parsed: &ParsedMessage<'_>) {
    if topic::is_system_topic(&parsed.header.topic) {
        dispatch_system(broker, sender_id, parsed).await;
        return;
    }

    let subscribers = broker.lock().await.subscriptions.get_publish_subscribers(&parsed.header.topic);
    if subscribers.is_empty() {
        send_error(
            broker,
            sender_id,
            parsed.header.request_id,
            ErrorKind::NoRouteFound,
            "no subscribers for topic",
            None,
        )
        .await;
        broker.lock().await.metrics.increment(METRIC_PUBLISH_DROPPED);
        return;
    }

    let forward_header = Header {
        action: Action::Publish,
        topic: parsed.header.topic.clone(),
        version: parsed.header.version.clone(),
        request_id: Some(Uuid::new_v4()),
        parent_request_id: None,
        timeout: None,
    };
    let body = serialize_message(&forward_header, parsed.raw_payload, parsed.has_error);
    let frame = FrameCodec::encode(&body);

    {
        let state = broker.lock().await;
        for subscriber in &subscribers {
            if let Err(e) = state.connections.send_to(subscriber, frame.clone()).await {
                warn!(subscriber = %subscriber, error = %e, "publish fan-out send failed");
            }
        }
    }

    if let Some(request_id) = parsed.header.request_id {
        send_success(broker, sender_id, request_id, &parsed.header.topic, &parsed.header.version).await;
    }
}

async fn handle_request(broker: &Broker, sender_id: &str, parsed: &ParsedMessage<'_>) {
    if topic::is_system_topic(&parsed.header.topic) {
        dispatch_system(broker, sender_id, parsed).await;
        return;
    }

    let top_cohort = broker.lock().await.subscriptions.get_top_request_subscribers(&parsed.header.topic);
    if top_cohort.is_empty() {
        send_error(
            broker,
            sender_id,
            parsed.header.request_id,
            ErrorKind::NoRouteFound,
            "no subscribers for topic",
            None,
        )
        .await;
        broker.lock().await.metrics.increment(METRIC_REQUEST_DROPPED);
        return;
    }

    let chosen = if top_cohort.len() == 1 {
        top_cohort.into_iter().next().unwrap()
    } else {
        let idx = rand::thread_rng().gen_range(0..top_cohort.len());
        top_cohort.into_iter().nth(idx).unwrap()
    };
    let target_service_id = chosen.service_id;
    let target_request_id = Uuid::new_v4();

    let forward_header = Header {
        action: Action::Request,
        topic: parsed.header.topic.clone(),
        version: parsed.header.version.clone(),
        request_id: Some(target_request_id),
        parent_request_id: parsed.header.parent_request_id,
        timeout: None,
    };
    let body = serialize_message(&forward_header, parsed.raw_payload, parsed.has_error);
    let frame = FrameCodec::encode(&body);

    if parsed.header.request_id.is_some() {
        let effective_timeout = broker.config().effective_request_timeout(parsed.header.timeout);
        let timer = arm_request_timeout(broker, target_service_id.clone(), target_request_id, effective_timeout);

        let mut state = broker.lock().await;
        if state.requests.len() >= broker.config().max_outstanding_requests {
            if let Some(oldest_key) = state.requests.oldest() {
                if let Some(evicted) = state.requests.remove(&oldest_key) {
                    state.metrics.increment(METRIC_REQUEST_DROPPED);
                    let evicted_request_id = evicted
                        .original_header
                        .request_id
                        .expect("outstanding requests always carry their origin's requestId");
                    drop(state);
                    send_error(
                        broker,
                        &evicted.origin_service_id,
                        Some(evicted_request_id),
                        ErrorKind::ServiceUnavailable,
                        "broker is busy",
                        None,
                    )
                    .await;
                    state = broker.lock().await;
                }
            }
        }

        state.requests.insert(OutstandingRequest {
            origin_service_id: sender_id.to_string(),
            target_service_id: target_service_id.clone(),
            original_header: parsed.header.clone(),
            target_request_id,
            timer: Some(timer),
            created_at: Instant::now(),
        });

        if state.connections.send_to(&target_service_id, frame).await.is_err() {
            warn!(target_service_id = %target_service_id, "failed to forward request");
        }
    } else {
        let state = broker.lock().await;
        if state.connections.send_to(&target_service_id, frame).await.is_err() {
            warn!(target_service_id = %target_service_id, "failed to forward fire-and-forget request");
        }
    }
}

fn arm_request_timeout(
    broker: &Broker,
    target_service_id: String,
    target_request_id: Uuid,
    timeout: std::time::Duration,
) -> tokio::task::AbortHandle {
    let broker = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        on_request_timeout(&broker, target_service_id, target_request_id).await;
    })
    .abort_handle()
}

async fn on_request_timeout(broker: &Broker, target_service_id: String, target_request_id: Uuid) {
    let key = (target_service_id.clone(), target_request_id);
    let mut state = broker.lock().await;
    let Some(entry) = state.requests.remove(&key) else {
        return;
    };
    state.metrics.increment(METRIC_REQUEST_TIMEOUT);
    drop(state);

    let origin_request_id = entry
        .original_header
        .request_id
        .expect("outstanding requests always carry their origin's requestId");
    let details = serde_json::json!({ "targetServiceId": target_service_id });
    send_error(
        broker,
        &entry.origin_service_id,
        Some(origin_request_id),
        ErrorKind::Timeout,
        "request timed out",
        Some(details),
    )
    .await;
}

async fn handle_response(broker: &Broker, sender_id: &str, parsed: &ParsedMessage<'_>) {
    if topic::is_system_topic(&parsed.header.topic) {
        dispatch_system(broker, sender_id, parsed).await;
        return;
    }

    let Some(request_id) = parsed.header.request_id else {
        send_error(
            broker,
            sender_id,
            None,
            ErrorKind::InvalidRequestId,
            "response missing requestId",
            None,
        )
        .await;
        return;
    };

    let key = (sender_id.to_string(), request_id);
    let entry = {
        let mut state = broker.lock().await;
        state.requests.remove(&key)
    };
    let Some(entry) = entry else {
        send_error(
            broker,
            sender_id,
            Some(request_id),
            ErrorKind::InvalidRequestId,
            "no matching outstanding request",
            None,
        )
        .await;
        return;
    };

    if parsed.has_error {
        broker.lock().await.metrics.increment(METRIC_RESPONSE_ERROR);
    }

    let origin_request_id = entry
        .original_header
        .request_id
        .expect("outstanding requests always carry their origin's requestId");
    let forward_header = Header {
        action: Action::Response,
        topic: entry.original_header.topic.clone(),
        version: parsed.header.version.clone(),
        request_id: Some(origin_request_id),
        parent_request_id: None,
        timeout: None,
    };
    let body = serialize_message(&forward_header, parsed.raw_payload, parsed.has_error);
    let frame = FrameCodec::encode(&body);
    let state = broker.lock().await;
    if state.connections.send_to(&entry.origin_service_id, frame).await.is_err() {
        warn!(origin = %entry.origin_service_id, "failed to forward response");
    }
}

// ---------------------------------------------------------------------
// System-topic control plane
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct LogSubscribePayload {
    levels: Vec<String>,
    #[serde(default)]
    regex: Option<String>,
}

#[derive(Deserialize)]
struct LogUnsubscribePayload {
    #[serde(default)]
    levels: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ServiceSubscriptionsPayload {
    #[serde(rename = "serviceId")]
    service_id: String,
}

#[derive(Deserialize)]
struct ServiceRegisterPayload {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct TopicSubscribersPayload {
    topic: String,
}

#[derive(Deserialize)]
struct TopicSubscribePayload {
    topic: String,
    action: String,
    #[serde(default)]
    priority: Option<f64>,
}

async fn dispatch_system(broker: &Broker, sender_id: &str, parsed: &ParsedMessage<'_>) {
    let topic = parsed.header.topic.as_str();
    let request_id = parsed.header.request_id;

    let action_ok = if topic == "system.heartbeat" {
        matches!(parsed.header.action, Action::Request | Action::Response)
    } else {
        parsed.header.action == Action::Request
    };
    if !action_ok {
        send_error(
            broker,
            sender_id,
            request_id,
            ErrorKind::InvalidRequest,
            "system topic does not accept this action",
            None,
        )
        .await;
        return;
    }

    match topic {
        "system.heartbeat" => {
            // reset_heartbeat already ran for every inbound message; a
            // probe RESPONSE needs no further reply, only a REQUEST does.
            if parsed.header.action == Action::Request {
                send_success(broker, sender_id, request_id.unwrap_or_else(Uuid::nil), topic, &parsed.header.version).await;
            }
        }
        "system.log.subscribe" => match parsed.parse_payload::<LogSubscribePayload>() {
            Ok(payload) => {
                let regex = match payload.regex.as_deref().map(regex::Regex::new) {
                    Some(Ok(re)) => Some(re),
                    Some(Err(e)) => {
                        send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &format!("invalid regex: {e}"), None).await;
                        return;
                    }
                    None => None,
                };
                let mut state = broker.lock().await;
                match state.registry.get_mut(sender_id) {
                    Some(reg) => {
                        for level in payload.levels {
                            reg.log_subscription.levels.insert(level);
                        }
                        if regex.is_some() {
                            reg.log_subscription.regex = regex;
                        }
                        drop(state);
                        send_success_payload(broker, sender_id, request_id, topic).await;
                    }
                    None => {
                        drop(state);
                        service_unavailable_and_disconnect(broker, sender_id, request_id).await;
                    }
                }
            }
            Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
        },
        "system.log.unsubscribe" => match parsed.parse_payload::<LogUnsubscribePayload>() {
            Ok(payload) => {
                let mut state = broker.lock().await;
                match state.registry.get_mut(sender_id) {
                    Some(reg) => {
                        match payload.levels {
                            Some(levels) => {
                                for level in levels {
                                    reg.log_subscription.levels.remove(&level);
                                }
                            }
                            None => {
                                reg.log_subscription.levels.clear();
                                reg.log_subscription.regex = None;
                            }
                        }
                        drop(state);
                        send_success_payload(broker, sender_id, request_id, topic).await;
                    }
                    None => {
                        drop(state);
                        service_unavailable_and_disconnect(broker, sender_id, request_id).await;
                    }
                }
            }
            Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
        },
        "system.metrics" => {
            let state = broker.lock().await;
            let snapshot = state.metrics.snapshot();
            drop(state);
            reply_with_json(broker, sender_id, request_id, topic, &snapshot).await;
        }
        "system.service.list" => {
            let state = broker.lock().await;
            let services: Vec<_> = state
                .registry
                .iter()
                .map(|(id, reg)| {
                    serde_json::json!({
                        "id": id,
                        "name": reg.name,
                        "description": reg.description,
                    })
                })
                .collect();
            drop(state);
            reply_with_json(broker, sender_id, request_id, topic, &services).await;
        }
        "system.service.subscriptions" => match parsed.parse_payload::<ServiceSubscriptionsPayload>() {
            Ok(payload) => {
                let state = broker.lock().await;
                if !state.registry.contains(&payload.service_id) {
                    drop(state);
                    service_unavailable_and_disconnect(broker, sender_id, request_id).await;
                    return;
                }
                let topics: Vec<_> = state
                    .subscriptions
                    .get_subscribed_topics(&payload.service_id)
                    .into_iter()
                    .map(|(t, kind)| {
                        let kind_str = match kind {
                            SubscriptionKind::Publish => "publish",
                            SubscriptionKind::Request => "request",
                        };
                        serde_json::json!({ "topic": t, "action": kind_str })
                    })
                    .collect();
                drop(state);
                reply_with_json(broker, sender_id, request_id, topic, &topics).await;
            }
            Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
        },
        "system.service.register" => match parsed.parse_payload::<ServiceRegisterPayload>() {
            Ok(payload) => {
                if let Err(e) = validate_name_description(&payload.name, &payload.description) {
                    send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e, None).await;
                    return;
                }
                {
                    let mut state = broker.lock().await;
                    match state.registry.get_mut(sender_id) {
                        Some(reg) => {
                            reg.name = payload.name;
                            reg.description = payload.description;
                        }
                        None => {
                            state.registry.insert(ServiceRegistration::new(sender_id, payload.name, payload.description));
                        }
                    }
                }
                broker.reset_heartbeat(sender_id).await;
                send_success_payload(broker, sender_id, request_id, topic).await;
            }
            Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
        },
        "system.topic.list" => {
            let state = broker.lock().await;
            let mut topics: Vec<String> = state
                .subscriptions
                .get_all_subscriptions()
                .into_values()
                .flat_map(|set| set.into_iter().map(|(t, _)| t))
                .collect();
            drop(state);
            topics.sort();
            topics.dedup();
            reply_with_json(broker, sender_id, request_id, topic, &topics).await;
        }
        "system.topic.subscribers" => match parsed.parse_payload::<TopicSubscribersPayload>() {
            Ok(payload) => {
                let state = broker.lock().await;
                let publishers = state.subscriptions.get_publish_subscribers(&payload.topic);
                let requesters: Vec<String> = state
                    .subscriptions
                    .get_request_subscribers(&payload.topic)
                    .into_iter()
                    .map(|s| s.service_id)
                    .collect();
                drop(state);
                reply_with_json(
                    broker,
                    sender_id,
                    request_id,
                    topic,
                    &serde_json::json!({ "publishers": publishers, "requesters": requesters }),
                )
                .await;
            }
            Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
        },
        "system.topic.subscribe" | "system.topic.unsubscribe" => {
            match parsed.parse_payload::<TopicSubscribePayload>() {
                Ok(payload) => {
                    if topic::is_system_topic(&payload.topic)
                        && !ALLOWED_SYSTEM_SUBSCRIBE_TARGETS.contains(&payload.topic.as_str())
                    {
                        send_error(
                            broker,
                            sender_id,
                            request_id,
                            ErrorKind::InvalidRequest,
                            "restricted system topic",
                            None,
                        )
                        .await;
                        return;
                    }
                    let mut state = broker.lock().await;
                    let ok = match (topic, payload.action.as_str()) {
                        ("system.topic.subscribe", "publish") => {
                            state.subscriptions.subscribe_publish(sender_id, &payload.topic)
                        }
                        ("system.topic.subscribe", "request") => state.subscriptions.subscribe_request(
                            sender_id,
                            &payload.topic,
                            payload.priority.unwrap_or(0.0),
                        ),
                        ("system.topic.unsubscribe", "publish") => {
                            state.subscriptions.unsubscribe_publish(sender_id, &payload.topic)
                        }
                        ("system.topic.unsubscribe", "request") => {
                            state.subscriptions.unsubscribe_request(sender_id, &payload.topic)
                        }
                        _ => false,
                    };
                    drop(state);
                    if ok {
                        send_success_payload(broker, sender_id, request_id, topic).await;
                    } else {
                        send_error(
                            broker,
                            sender_id,
                            request_id,
                            ErrorKind::InvalidRequest,
                            "invalid topic or action",
                            None,
                        )
                        .await;
                    }
                }
                Err(e) => send_error(broker, sender_id, request_id, ErrorKind::InvalidRequest, &e.to_string(), None).await,
            }
        }
        _ => {
            send_error(broker, sender_id, request_id, ErrorKind::TopicNotSupported, "unknown system topic", None).await;
        }
    }
}

async fn service_unavailable_and_disconnect(broker: &Broker, sender_id: &str, request_id: Option<Uuid>) {
    send_error(
        broker,
        sender_id,
        request_id,
        ErrorKind::ServiceUnavailable,
        "service lookup failed",
        None,
    )
    .await;
    broker.disconnect(sender_id).await;
}

async fn reply_with_json<T: serde::Serialize>(
    broker: &Broker,
    sender_id: &str,
    request_id: Option<Uuid>,
    topic: &str,
    payload: &T,
) {
    let Some(request_id) = request_id else { return };
    let header = Header {
        action: Action::Response,
        topic: topic.to_string(),
        version: "1.0.0".to_string(),
        request_id: Some(request_id),
        parent_request_id: None,
        timeout: None,
    };
    let json = serde_json::to_vec(payload).expect("system response payload always serializes");
    let body = serialize_message(&header, &json, false);
    let frame = FrameCodec::encode(&body);
    let state = broker.lock().await;
    if state.connections.send_to(sender_id, frame).await.is_err() {
        warn!(sender_id, "failed to send system response");
    }
}

async fn send_success_payload(broker: &Broker, sender_id: &str, request_id: Option<Uuid>, topic: &str) {
    reply_with_json(broker, sender_id, request_id, topic, &serde_json::json!({ "status": "success" })).await;
}

async fn send_success(broker: &Broker, sender_id: &str, request_id: Uuid, topic: &str, version: &str) {
    let header = Header {
        action: Action::Response,
        topic: topic.to_string(),
        version: version.to_string(),
        request_id: Some(request_id),
        parent_request_id: None,
        timeout: None,
    };
    let json = serde_json::to_vec(&serde_json::json!({ "status": "success" })).unwrap();
    let body = serialize_message(&header, &json, false);
    let frame = FrameCodec::encode(&body);
    let state = broker.lock().await;
    if state.connections.send_to(sender_id, frame).await.is_err() {
        warn!(sender_id, "failed to send success response");
    }
}

async fn send_error(
    broker: &Broker,
    sender_id: &str,
    request_id: Option<Uuid>,
    kind: ErrorKind,
    message: &str,
    details: Option<serde_json::Value>,
) {
    let header = Header {
        action: Action::Response,
        topic: "system.error".to_string(),
        version: "1.0.0".to_string(),
        request_id,
        parent_request_id: None,
        timeout: None,
    };
    let json = error_body(kind, message, details);
    let body = serialize_message(&header, &json, true);
    let frame = FrameCodec::encode(&body);
    let state = broker.lock().await;
    if state.connections.send_to(sender_id, frame).await.is_err() {
        warn!(sender_id, code = kind.code(), "failed to deliver error response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::connection::ConnectionHandle;
    use crate::registry::ServiceRegistration;
    use tokio::sync::mpsc;

    async fn connected(broker: &Broker, id: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        let (close_tx, _close_rx) = mpsc::channel(1);
        broker.connect(id, ConnectionHandle::new(tx, close_tx)).await;
        rx
    }

    async fn recv_body(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let frame = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        let mut codec = FrameCodec::new(usize::MAX);
        codec.push(&frame);
        codec.next_frame().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_publish_fanout_s1() {
        let broker = Broker::new(BrokerConfig::default());
        let mut a_rx = connected(&broker, "A").await;
        let mut b_rx = connected(&broker, "B").await;
        let _c_rx = connected(&broker, "C").await;
        {
            let mut state = broker.lock().await;
            state.subscriptions.subscribe_publish("A", "baggage.events");
            state.subscriptions.subscribe_publish("B", "baggage.events");
        }

        let header = Header {
            action: Action::Publish,
            topic: "baggage.events".into(),
            version: "1.0.0".into(),
            request_id: None,
            parent_request_id: None,
            timeout: None,
        };
        let frame_body = {
            let body = serialize_message(&header, br#"{"n":1}"#, false);
            body
        };
        dispatch(&broker, "C", &frame_body).await;

        let a_body = recv_body(&mut a_rx).await;
        let b_body = recv_body(&mut b_rx).await;
        assert!(String::from_utf8_lossy(&a_body).ends_with(r#"{"n":1}"#));
        assert!(String::from_utf8_lossy(&b_body).ends_with(r#"{"n":1}"#));
    }

    #[tokio::test]
    async fn test_publish_with_request_id_gets_success_response_s2() {
        let broker = Broker::new(BrokerConfig::default());
        let mut a_rx = connected(&broker, "A").await;
        let mut c_rx = connected(&broker, "C").await;
        broker.lock().await.subscriptions.subscribe_publish("A", "baggage.events");

        let r1 = Uuid::new_v4();
        let header = Header {
            action: Action::Publish,
            topic: "baggage.events".into(),
            version: "1.0.0".into(),
            request_id: Some(r1),
            parent_request_id: None,
            timeout: None,
        };
        let frame_body = serialize_message(&header, br#"{"n":1}"#, false);
        dispatch(&broker, "C", &frame_body).await;

        recv_body(&mut a_rx).await;
        let c_body = recv_body(&mut c_rx).await;
        let text = String::from_utf8_lossy(&c_body);
        assert!(text.contains(&format!(":{r1}")));
        assert!(text.ends_with(r#"{"status":"success"}"#));
    }

    #[tokio::test]
    async fn test_priority_request_routing_s3() {
        let broker = Broker::new(BrokerConfig::default());
        let mut a_rx = connected(&broker, "A").await;
        let mut b_rx = connected(&broker, "B").await;
        let mut c_rx = connected(&broker, "C").await;
        let mut client_rx = connected(&broker, "client").await;
        {
            let mut state = broker.lock().await;
            state.subscriptions.subscribe_request("A", "svc.echo", 1.0);
            state.subscriptions.subscribe_request("B", "svc.echo", 2.0);
            state.subscriptions.subscribe_request("C", "svc.echo", 2.0);
        }

        let q1 = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "svc.echo".into(),
            version: "1.0.0".into(),
            request_id: Some(q1),
            parent_request_id: None,
            timeout: None,
        };
        let frame_body = serialize_message(&header, b"{}", false);
        dispatch(&broker, "client", &frame_body).await;

        assert!(a_rx.try_recv().is_err());

        let (winner_body, winner_name) =
            if let Ok(b) = tokio::time::timeout(std::time::Duration::from_millis(200), b_rx.recv()).await {
                (b.unwrap(), "B")
            } else {
                (c_rx.recv().await.unwrap(), "C")
            };
        let mut codec = FrameCodec::new(usize::MAX);
        codec.push(&winner_body);
        let body = codec.next_frame().unwrap().unwrap();
        let text = String::from_utf8_lossy(&body);
        let (forwarded_header, _) = text.split_once('\n').unwrap();
        assert!(!forwarded_header.ends_with(&format!(":{q1}")));
        assert!(!text.contains(&format!(":{q1}\n")));

        let target_request_id: Uuid = forwarded_header.split(':').nth(3).unwrap().parse().unwrap();

        let response_header = Header {
            action: Action::Response,
            topic: "svc.echo".into(),
            version: "1.0.0".into(),
            request_id: Some(target_request_id),
            parent_request_id: None,
            timeout: None,
        };
        let response_body = serialize_message(&response_header, br#"{"ok":true}"#, false);
        dispatch(&broker, winner_name, &response_body).await;

        let client_body = recv_body(&mut client_rx).await;
        let client_text = String::from_utf8_lossy(&client_body);
        assert!(client_text.contains(&format!(":{q1}")));
        assert!(client_text.ends_with(r#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn test_request_timeout_s4() {
        let mut config = BrokerConfig::default();
        config.request_timeout_max_ms = 100_000;
        let broker = Broker::new(config);
        let _s_rx = connected(&broker, "S").await;
        let mut client_rx = connected(&broker, "client").await;
        broker.lock().await.subscriptions.subscribe_request("S", "slow", 1.0);

        let q2 = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "slow".into(),
            version: "1.0.0".into(),
            request_id: Some(q2),
            parent_request_id: None,
            timeout: Some(100),
        };
        let frame_body = serialize_message(&header, b"{}", false);
        dispatch(&broker, "client", &frame_body).await;

        let body = tokio::time::timeout(std::time::Duration::from_millis(1000), async {
            recv_body(&mut client_rx).await
        })
        .await
        .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(&format!(":{q2}")));
        assert!(text.contains("TIMEOUT"));
        assert!(text.contains(r#""targetServiceId":"S""#));
    }

    #[tokio::test]
    async fn test_backpressure_eviction_s5() {
        let mut config = BrokerConfig::default();
        config.max_outstanding_requests = 2;
        config.request_timeout_max_ms = 100_000;
        config.request_timeout_default_ms = 100_000;
        let broker = Broker::new(config);
        let _silent_rx = connected(&broker, "silent").await;
        let mut c1_rx = connected(&broker, "c1").await;
        let _c2_rx = connected(&broker, "c2").await;
        let _c3_rx = connected(&broker, "c3").await;
        broker.lock().await.subscriptions.subscribe_request("silent", "slow", 1.0);

        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for (i, client) in ["c1", "c2", "c3"].iter().enumerate() {
            let header = Header {
                action: Action::Request,
                topic: "slow".into(),
                version: "1.0.0".into(),
                request_id: Some(ids[i]),
                parent_request_id: None,
                timeout: None,
            };
            let body = serialize_message(&header, b"{}", false);
            dispatch(&broker, client, &body).await;
        }

        let body = recv_body(&mut c1_rx).await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("SERVICE_UNAVAILABLE"));
        assert!(text.contains(&format!(":{}", ids[0])));
    }

    #[tokio::test]
    async fn test_heartbeat_deregistration_s7() {
        let mut config = BrokerConfig::default();
        config.heartbeat_retry_timeout_ms = 20;
        config.heartbeat_deregister_timeout_ms = 60;
        let broker = Broker::new(config);
        let mut s_rx = connected(&broker, "S").await;
        broker.lock().await.registry.insert(ServiceRegistration::new("S", "s".into(), "".into()));
        broker.reset_heartbeat("S").await;

        let probe = tokio::time::timeout(std::time::Duration::from_millis(500), s_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!probe.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let state = broker.lock().await;
        assert!(!state.registry.contains("S"));
    }

    #[tokio::test]
    async fn test_system_service_register_and_list() {
        let broker = Broker::new(BrokerConfig::default());
        let mut rx = connected(&broker, "A").await;
        let req_id = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "system.service.register".into(),
            version: "1.0.0".into(),
            request_id: Some(req_id),
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, br#"{"name":"svc-a","description":"test"}"#, false);
        dispatch(&broker, "A", &body).await;

        let reply = recv_body(&mut rx).await;
        assert!(String::from_utf8_lossy(&reply).contains("success"));
        let state = broker.lock().await;
        assert_eq!(state.registry.get("A").unwrap().name, "svc-a");
    }

    #[tokio::test]
    async fn test_unknown_system_topic_rejected() {
        let broker = Broker::new(BrokerConfig::default());
        let mut rx = connected(&broker, "A").await;
        let req_id = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "system.frobnicate".into(),
            version: "1.0.0".into(),
            request_id: Some(req_id),
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, b"{}", false);
        dispatch(&broker, "A", &body).await;

        let reply = recv_body(&mut rx).await;
        assert!(String::from_utf8_lossy(&reply).contains("TOPIC_NOT_SUPPORTED"));
    }

    #[tokio::test]
    async fn test_topic_subscribe_restricted_system_target() {
        let broker = Broker::new(BrokerConfig::default());
        let mut rx = connected(&broker, "A").await;
        let req_id = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "system.topic.subscribe".into(),
            version: "1.0.0".into(),
            request_id: Some(req_id),
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, br#"{"topic":"system.service.list","action":"publish"}"#, false);
        dispatch(&broker, "A", &body).await;

        let reply = recv_body(&mut rx).await;
        assert!(String::from_utf8_lossy(&reply).contains("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn test_topic_subscribe_allowed_system_target() {
        let broker = Broker::new(BrokerConfig::default());
        let mut rx = connected(&broker, "A").await;
        let req_id = Uuid::new_v4();
        let header = Header {
            action: Action::Request,
            topic: "system.topic.subscribe".into(),
            version: "1.0.0".into(),
            request_id: Some(req_id),
            parent_request_id: None,
            timeout: None,
        };
        let body = serialize_message(&header, br#"{"topic":"system.log","action":"publish"}"#, false);
        dispatch(&broker, "A", &body).await;

        let reply = recv_body(&mut rx).await;
        assert!(String::from_utf8_lossy(&reply).ends_with(r#"{"status":"success"}"#));
        let state = broker.lock().await;
        assert!(state.subscriptions.get_publish_subscribers("system.log").contains(&"A".to_string()));
    }
}
