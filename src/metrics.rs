// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Metrics surface: the core only *writes* to registered slots.
//! Aggregation and exposition are external collaborators.

use std::collections::HashMap;

/// The kind of a registered metric slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Set/get the last written value.
    Gauge,
    /// Events per window; each `record` bumps the window's event count.
    Rate,
    /// Running mean over every value added.
    Average,
    /// Monotone maximum of every value added.
    Maximum,
    /// Seconds since a settable start instant.
    Uptime,
}

#[derive(Debug, Clone)]
struct Slot {
    kind: SlotKind,
    value: f64,
    count: u64,
    started_at: Option<std::time::Instant>,
}

impl Slot {
    fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            value: 0.0,
            count: 0,
            started_at: if kind == SlotKind::Uptime {
                Some(std::time::Instant::now())
            } else {
                None
            },
        }
    }

    fn record(&mut self, amount: f64) {
        match self.kind {
            SlotKind::Gauge => self.value = amount,
            SlotKind::Rate => {
                self.value += amount;
                self.count += 1;
            }
            SlotKind::Average => {
                self.count += 1;
                self.value += (amount - self.value) / self.count as f64;
            }
            SlotKind::Maximum => {
                if amount > self.value {
                    self.value = amount;
                }
            }
            SlotKind::Uptime => {
                self.started_at = Some(std::time::Instant::now());
            }
        }
    }

    fn read(&self) -> f64 {
        match self.kind {
            SlotKind::Uptime => self
                .started_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            _ => self.value,
        }
    }
}

/// Substitutes `{serviceId}`/`{core}` placeholders in a parameterized
/// metric name.
pub fn expand_name(template: &str, service_id: Option<&str>) -> String {
    let mut out = template.replace("{core}", "core");
    if let Some(id) = service_id {
        out = out.replace("{serviceId}", id);
    }
    out
}

/// Registry of named metric slots. Registration happens at construction;
/// the core only writes through `record`/`set`.
#[derive(Default)]
pub struct MetricsSink {
    slots: HashMap<String, Slot>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a (name, kind) pair. Idempotent: re-registering the same
    /// name with the same kind is a no-op; a previously unseen name
    /// creates a fresh slot.
    pub fn register(&mut self, name: impl Into<String>, kind: SlotKind) {
        self.slots.entry(name.into()).or_insert_with(|| Slot::new(kind));
    }

    /// Writes a value into a registered slot, per its kind's semantics.
    /// Writing to an unregistered slot is a no-op (the caller is expected
    /// to have registered every metric it touches at construction).
    pub fn record(&mut self, name: &str, amount: f64) {
        if let Some(slot) = self.slots.get_mut(name) {
            slot.record(amount);
        }
    }

    /// Increments a counter-like slot (Rate, Average, Maximum) by one.
    pub fn increment(&mut self, name: &str) {
        self.record(name, 1.0);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.slots.get(name).map(Slot::read)
    }

    /// Snapshot of every registered metric's current value.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.slots.iter().map(|(k, v)| (k.clone(), v.read())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_last_value_wins() {
        let mut m = MetricsSink::new();
        m.register("conns", SlotKind::Gauge);
        m.record("conns", 3.0);
        m.record("conns", 5.0);
        assert_eq!(m.get("conns"), Some(5.0));
    }

    #[test]
    fn test_average_running_mean() {
        let mut m = MetricsSink::new();
        m.register("size", SlotKind::Average);
        m.record("size", 10.0);
        m.record("size", 20.0);
        assert_eq!(m.get("size"), Some(15.0));
    }

    #[test]
    fn test_maximum_is_monotone() {
        let mut m = MetricsSink::new();
        m.register("peak", SlotKind::Maximum);
        m.record("peak", 10.0);
        m.record("peak", 4.0);
        m.record("peak", 30.0);
        assert_eq!(m.get("peak"), Some(30.0));
    }

    #[test]
    fn test_rate_accumulates_events() {
        let mut m = MetricsSink::new();
        m.register("errors", SlotKind::Rate);
        m.increment("errors");
        m.increment("errors");
        assert_eq!(m.get("errors"), Some(2.0));
    }

    #[test]
    fn test_unregistered_slot_is_noop() {
        let mut m = MetricsSink::new();
        m.record("ghost", 1.0);
        assert_eq!(m.get("ghost"), None);
    }

    #[test]
    fn test_expand_name_placeholders() {
        assert_eq!(expand_name("svc.{serviceId}.count", Some("A")), "svc.A.count");
        assert_eq!(expand_name("{core}.uptime", None), "core.uptime");
    }
}
