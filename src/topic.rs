// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Topic name validation, canonicalization, and comparison.
//!
//! A topic is a dotted sequence of 1-5 ASCII segments, each a letter
//! followed by letters/digits. The *publishable* dialect forbids
//! wildcards; the *subscription* dialect allows `+` at any segment and `#`
//! only as the final segment.

const MAX_TOPIC_LEN: usize = 255;
const MAX_SEGMENTS: usize = 5;

/// System-topic prefix; messages on a topic with this prefix are
/// dispatched in-process by the service registry rather than routed.
pub const SYSTEM_PREFIX: &str = "system.";

fn is_segment_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_segment_rest(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

fn is_valid_exact_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if is_segment_start(c) => {}
        _ => return false,
    }
    chars.all(is_segment_rest)
}

/// Splits and validates a topic's shape (length, segment count), without
/// checking segment content or wildcard placement.
fn split_segments(topic: &str) -> Option<Vec<&str>> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return None;
    }
    let segments: Vec<&str> = topic.split('.').collect();
    if segments.is_empty() || segments.len() > MAX_SEGMENTS {
        return None;
    }
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// Validates a topic for publishing: no wildcards allowed.
pub fn is_valid_publishable(topic: &str) -> bool {
    match split_segments(topic) {
        Some(segments) => segments.iter().all(|s| is_valid_exact_segment(s)),
        None => false,
    }
}

/// Validates a topic for subscription: `+` allowed at any segment, `#`
/// allowed only as the final segment.
pub fn is_valid_subscription(topic: &str) -> bool {
    let segments = match split_segments(topic) {
        Some(s) => s,
        None => return false,
    };
    let last = segments.len() - 1;
    segments.iter().enumerate().all(|(i, seg)| {
        if *seg == "+" {
            true
        } else if *seg == "#" {
            i == last
        } else {
            is_valid_exact_segment(seg)
        }
    })
}

/// Lower-cases a topic string. Idempotent and segment-count-preserving by
/// construction (lower-casing ASCII never merges or splits segments).
pub fn canonical(topic: &str) -> String {
    topic.to_ascii_lowercase()
}

/// Returns the parent topic (all but the last segment), or `None` if the
/// topic has only one segment.
pub fn parent(topic: &str) -> Option<String> {
    let idx = topic.rfind('.')?;
    Some(topic[..idx].to_string())
}

/// Returns true if `b` is `a` or a dot-descendant of `a` (segment-wise
/// prefix, not a raw string prefix: `"a.bc"` is not a descendant of
/// `"a.b"`).
pub fn is_descendant(a: &str, b: &str) -> bool {
    let a_segs: Vec<&str> = a.split('.').collect();
    let b_segs: Vec<&str> = b.split('.').collect();
    if b_segs.len() < a_segs.len() {
        return false;
    }
    a_segs.iter().zip(b_segs.iter()).all(|(x, y)| x == y)
}

/// Returns true if `topic` begins with the literal `system.` prefix.
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with(SYSTEM_PREFIX)
}
