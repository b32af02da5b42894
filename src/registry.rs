// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Service registry: `serviceId -> ServiceRegistration`, heartbeat
//! liveness state, and the log-fanout subscription a service holds.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

pub const MAX_NAME_LEN: usize = 36;
pub const MAX_DESCRIPTION_LEN: usize = 1024;

/// Liveness state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Healthy,
    Probing,
    Deregistered,
}

/// A service's subscription to the `system.log` fanout: which levels it
/// wants, optionally filtered by a message regex.
#[derive(Debug, Clone)]
pub struct LogSubscription {
    pub levels: HashSet<String>,
    pub regex: Option<Regex>,
}

impl LogSubscription {
    pub fn matches(&self, level: &str, message: &str) -> bool {
        self.levels.contains(level) && self.regex.as_ref().map_or(true, |re| re.is_match(message))
    }
}

/// Abort handles for a registration's two live timers. Dropping either
/// handle does not stop the task; `abort()` must be called explicitly,
/// and is safe to call on an already-finished task (idempotent).
#[derive(Default)]
pub struct HeartbeatTimers {
    pub retry: Option<tokio::task::AbortHandle>,
    pub deregister: Option<tokio::task::AbortHandle>,
}

impl HeartbeatTimers {
    pub fn cancel(&mut self) {
        if let Some(h) = self.retry.take() {
            h.abort();
        }
        if let Some(h) = self.deregister.take() {
            h.abort();
        }
    }
}

/// A registered service.
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub description: String,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub log_subscription: LogSubscription,
    pub state: HeartbeatState,
    pub timers: HeartbeatTimers,
}

impl ServiceRegistration {
    pub fn new(id: impl Into<String>, name: String, description: String) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            name,
            description,
            connected_at: now,
            last_heartbeat: now,
            log_subscription: LogSubscription {
                levels: HashSet::new(),
                regex: None,
            },
            state: HeartbeatState::Healthy,
            timers: HeartbeatTimers::default(),
        }
    }
}

/// Validates a service name/description against the length limits in the
/// data model.
pub fn validate_name_description(name: &str, description: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!("name must be 1-{MAX_NAME_LEN} chars"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(format!("description must be at most {MAX_DESCRIPTION_LEN} chars"));
    }
    Ok(())
}

/// The `serviceId -> ServiceRegistration` map. Heartbeat timer lifecycle
/// (arming/cancelling the underlying tokio tasks) is owned by the broker,
/// which has the shared state handle timers need to lock on fire; this
/// map only tracks state transitions and bookkeeping.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceRegistration>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceRegistration> {
        self.services.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServiceRegistration> {
        self.services.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn insert(&mut self, reg: ServiceRegistration) {
        self.services.insert(reg.id.clone(), reg);
    }

    /// Removes a registration, cancelling its timers. The caller is
    /// responsible for unsubscribing it from both tries and closing its
    /// connection.
    pub fn remove(&mut self, id: &str) -> Option<ServiceRegistration> {
        let mut reg = self.services.remove(id)?;
        reg.timers.cancel();
        Some(reg)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceRegistration)> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services whose log subscription accepts this record.
    pub fn log_subscribers(&self, level: &str, message: &str) -> Vec<String> {
        self.services
            .values()
            .filter(|r| r.log_subscription.matches(level, message))
            .map(|r| r.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut reg = ServiceRegistry::new();
        reg.insert(ServiceRegistration::new("A", "svc-a".into(), "".into()));
        assert!(reg.contains("A"));
        assert_eq!(reg.get("A").unwrap().state, HeartbeatState::Healthy);
    }

    #[test]
    fn test_remove_cancels_timers_and_returns_registration() {
        let mut reg = ServiceRegistry::new();
        reg.insert(ServiceRegistration::new("A", "svc-a".into(), "".into()));
        let removed = reg.remove("A").unwrap();
        assert_eq!(removed.id, "A");
        assert!(!reg.contains("A"));
    }

    #[test]
    fn test_validate_name_description() {
        assert!(validate_name_description("ok", "fine").is_ok());
        assert!(validate_name_description("", "fine").is_err());
        assert!(validate_name_description(&"x".repeat(40), "fine").is_err());
        assert!(validate_name_description("ok", &"x".repeat(2000)).is_err());
    }

    #[test]
    fn test_log_subscription_match() {
        let sub = LogSubscription {
            levels: ["error".to_string()].into_iter().collect(),
            regex: Some(Regex::new("timeout").unwrap()),
        };
        assert!(sub.matches("error", "request timeout hit"));
        assert!(!sub.matches("error", "all good"));
        assert!(!sub.matches("info", "request timeout hit"));
    }

    #[test]
    fn test_log_subscribers_filters_by_level_and_regex() {
        let mut reg = ServiceRegistry::new();
        let mut a = ServiceRegistration::new("A", "a".into(), "".into());
        a.log_subscription.levels.insert("error".to_string());
        reg.insert(a);
        let mut b = ServiceRegistration::new("B", "b".into(), "".into());
        b.log_subscription.levels.insert("info".to_string());
        reg.insert(b);

        let subs = reg.log_subscribers("error", "boom");
        assert_eq!(subs, vec!["A".to_string()]);
    }
}
