// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Subscription manager: wraps the publish and request topic tries and
//! exposes service-centric queries over both.

use crate::topic;
use crate::trie::{Leaf, PrioritySetCollection, Prioritized, SetCollection, Trie};
use std::collections::{BTreeMap, BTreeSet};

/// A request subscriber: a service id paired with its priority.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSubscriber {
    pub service_id: String,
    pub priority: f64,
}

impl Leaf for RequestSubscriber {
    fn service_id(&self) -> &str {
        &self.service_id
    }
}

impl Prioritized for RequestSubscriber {
    fn priority(&self) -> f64 {
        self.priority
    }
}

type PublishTrie = Trie<String, SetCollection<String>>;
type RequestTrie = Trie<RequestSubscriber, PrioritySetCollection<RequestSubscriber>>;

/// The kind of subscription a service holds on a topic, used when listing
/// a service's full subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubscriptionKind {
    Publish,
    Request,
}

/// Tracks every `(service, topic)` pair directly (outside the tries) so
/// that per-service and whole-map queries don't require a trie walk.
#[derive(Default)]
pub struct SubscriptionManager {
    publish_trie: PublishTrie,
    request_trie: RequestTrie,
    /// service -> topic -> kind -> priority (priority only meaningful for Request)
    by_service: BTreeMap<String, BTreeMap<(String, SubscriptionKind), Option<f64>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_publish(&mut self, service_id: &str, topic: &str) -> bool {
        if !topic::is_valid_subscription(topic) {
            return false;
        }
        let canonical = topic::canonical(topic);
        let key = (canonical.clone(), SubscriptionKind::Publish);
        let entry = self.by_service.entry(service_id.to_string()).or_default();
        if entry.contains_key(&key) {
            return false;
        }
        entry.insert(key, None);
        self.publish_trie.set(&canonical, service_id.to_string());
        true
    }

    pub fn subscribe_request(&mut self, service_id: &str, topic: &str, priority: f64) -> bool {
        if !topic::is_valid_subscription(topic) || !priority.is_finite() {
            return false;
        }
        let canonical = topic::canonical(topic);
        let key = (canonical.clone(), SubscriptionKind::Request);
        let entry = self.by_service.entry(service_id.to_string()).or_default();
        let already = entry.contains_key(&key);
        entry.insert(key, Some(priority));
        self.request_trie.set(
            &canonical,
            RequestSubscriber {
                service_id: service_id.to_string(),
                priority,
            },
        );
        !already
    }

    pub fn unsubscribe_publish(&mut self, service_id: &str, topic: &str) -> bool {
        if !topic::is_valid_subscription(topic) {
            return false;
        }
        let canonical = topic::canonical(topic);
        let removed = self.publish_trie.delete(&canonical, service_id);
        if removed {
            if let Some(entry) = self.by_service.get_mut(service_id) {
                entry.remove(&(canonical, SubscriptionKind::Publish));
                if entry.is_empty() {
                    self.by_service.remove(service_id);
                }
            }
        }
        removed
    }

    pub fn unsubscribe_request(&mut self, service_id: &str, topic: &str) -> bool {
        if !topic::is_valid_subscription(topic) {
            return false;
        }
        let canonical = topic::canonical(topic);
        let removed = self.request_trie.delete(&canonical, service_id);
        if removed {
            if let Some(entry) = self.by_service.get_mut(service_id) {
                entry.remove(&(canonical, SubscriptionKind::Request));
                if entry.is_empty() {
                    self.by_service.remove(service_id);
                }
            }
        }
        removed
    }

    /// Removes `service_id` from every topic in both tries. Returns
    /// whether any removal occurred.
    pub fn unsubscribe(&mut self, service_id: &str) -> bool {
        let Some(topics) = self.by_service.remove(service_id) else {
            return false;
        };
        for (topic, kind) in topics.keys() {
            match kind {
                SubscriptionKind::Publish => {
                    self.publish_trie.delete(topic, service_id);
                }
                SubscriptionKind::Request => {
                    self.request_trie.delete(topic, service_id);
                }
            }
        }
        true
    }

    pub fn get_publish_subscribers(&self, topic: &str) -> Vec<String> {
        if !topic::is_valid_publishable(topic) {
            return Vec::new();
        }
        self.publish_trie.get(&topic::canonical(topic))
    }

    /// Matches in descending-priority order.
    pub fn get_request_subscribers(&self, topic: &str) -> Vec<RequestSubscriber> {
        if !topic::is_valid_publishable(topic) {
            return Vec::new();
        }
        self.request_trie.get(&topic::canonical(topic))
    }

    /// Only the strictly highest-priority cohort from the matched
    /// sequence.
    pub fn get_top_request_subscribers(&self, topic: &str) -> Vec<RequestSubscriber> {
        let matched = self.get_request_subscribers(topic);
        let Some(top) = matched.first().map(|s| s.priority) else {
            return Vec::new();
        };
        matched.into_iter().take_while(|s| s.priority == top).collect()
    }

    /// Full per-service topic list, sorted by topic then kind.
    pub fn get_subscribed_topics(&self, service_id: &str) -> Vec<(String, SubscriptionKind)> {
        self.by_service
            .get(service_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Map view over every service's subscriptions, sorted by service id.
    pub fn get_all_subscriptions(&self) -> BTreeMap<String, BTreeSet<(String, SubscriptionKind)>> {
        self.by_service
            .iter()
            .map(|(service, topics)| (service.clone(), topics.keys().cloned().collect()))
            .collect()
    }
}
