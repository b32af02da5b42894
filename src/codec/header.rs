// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message header grammar: `action:topic:version[:requestId[:parentRequestId[:timeout]]]`.

use crate::topic;
use uuid::Uuid;

/// Message action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Request,
    Response,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Request => "request",
            Self::Response => "response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(Self::Publish),
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed, validated message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub action: Action,
    pub topic: String,
    pub version: String,
    pub request_id: Option<Uuid>,
    pub parent_request_id: Option<Uuid>,
    pub timeout: Option<u64>,
}

/// Header parse/validation errors.
#[derive(Debug, Clone)]
pub enum HeaderError {
    Malformed(String),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(s) => write!(f, "malformed header: {}", s),
        }
    }
}

impl std::error::Error for HeaderError {}

fn parse_uuid_v4(field: &str, name: &str) -> Result<Option<Uuid>, HeaderError> {
    if field.is_empty() {
        return Ok(None);
    }
    let id = Uuid::parse_str(field).map_err(|_| HeaderError::Malformed(format!("{name} is not a UUID")))?;
    if id.get_version() != Some(uuid::Version::Random) {
        return Err(HeaderError::Malformed(format!("{name} is not a UUIDv4")));
    }
    Ok(Some(id))
}

impl Header {
    /// Parses a header line (without the trailing `\n`), validating every
    /// field per the wire grammar.
    pub fn parse(line: &str, max_timeout_ms: u64) -> Result<Self, HeaderError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || fields.len() > 6 {
            return Err(HeaderError::Malformed(format!(
                "expected 3-6 fields, got {}",
                fields.len()
            )));
        }

        let action = Action::parse(fields[0])
            .ok_or_else(|| HeaderError::Malformed(format!("unknown action {:?}", fields[0])))?;

        let topic_raw = fields[1];
        if !topic::is_valid_publishable(topic_raw) {
            return Err(HeaderError::Malformed(format!("invalid topic {:?}", topic_raw)));
        }
        let topic = topic::canonical(topic_raw);

        let version = fields[2].to_string();
        semver::Version::parse(&version)
            .map_err(|_| HeaderError::Malformed(format!("invalid semver {:?}", version)))?;

        let request_id = if fields.len() >= 4 {
            parse_uuid_v4(fields[3], "requestId")?
        } else {
            None
        };
        let parent_request_id = if fields.len() >= 5 {
            parse_uuid_v4(fields[4], "parentRequestId")?
        } else {
            None
        };
        let timeout = if fields.len() == 6 {
            let raw = fields[5];
            if raw.is_empty() {
                None
            } else {
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| HeaderError::Malformed("timeout is not an integer".into()))?;
                if ms == 0 || ms > max_timeout_ms {
                    return Err(HeaderError::Malformed(format!(
                        "timeout {ms} out of range (0, {max_timeout_ms}]"
                    )));
                }
                if action != Action::Request {
                    return Err(HeaderError::Malformed(
                        "timeout only valid on request action".into(),
                    ));
                }
                Some(ms)
            }
        } else {
            None
        };

        Ok(Self {
            action,
            topic,
            version,
            request_id,
            parent_request_id,
            timeout,
        })
    }

    /// Serializes the header line per the precedence rule in spec.md §4.2:
    /// if `timeout` is set, emit all three trailing fields (empty strings
    /// for absent request/parent ids); else if `parentRequestId` is set,
    /// emit `:requestId:parentRequestId`; else if `requestId` is set, emit
    /// `:requestId`.
    pub fn serialize(&self) -> String {
        let mut out = format!("{}:{}:{}", self.action, self.topic, self.version);
        if let Some(timeout) = self.timeout {
            out.push(':');
            out.push_str(&self.request_id.map(|u| u.to_string()).unwrap_or_default());
            out.push(':');
            out.push_str(
                &self
                    .parent_request_id
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            );
            out.push(':');
            out.push_str(&timeout.to_string());
        } else if let Some(parent) = self.parent_request_id {
            out.push(':');
            out.push_str(&self.request_id.map(|u| u.to_string()).unwrap_or_default());
            out.push(':');
            out.push_str(&parent.to_string());
        } else if let Some(request_id) = self.request_id {
            out.push(':');
            out.push_str(&request_id.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(action: Action, topic: &str) -> Header {
        Header {
            action,
            topic: topic.to_string(),
            version: "1.0.0".to_string(),
            request_id: None,
            parent_request_id: None,
            timeout: None,
        }
    }

    #[test]
    fn test_parse_minimal() {
        let h = Header::parse("publish:a.b:1.0.0", 60_000).unwrap();
        assert_eq!(h.action, Action::Publish);
        assert_eq!(h.topic, "a.b");
        assert_eq!(h.version, "1.0.0");
        assert_eq!(h.request_id, None);
    }

    #[test]
    fn test_parse_with_request_id() {
        let id = Uuid::new_v4();
        let line = format!("request:a.b:1.0.0:{id}");
        let h = Header::parse(&line, 60_000).unwrap();
        assert_eq!(h.request_id, Some(id));
    }

    #[test]
    fn test_parse_with_timeout_requires_request_action() {
        let id = Uuid::new_v4();
        let line = format!("publish:a.b:1.0.0:{id}::5000");
        assert!(Header::parse(&line, 60_000).is_err());
    }

    #[test]
    fn test_parse_timeout_out_of_range() {
        let id = Uuid::new_v4();
        let line = format!("request:a.b:1.0.0:{id}::999999");
        assert!(Header::parse(&line, 60_000).is_err());
    }

    #[test]
    fn test_parse_invalid_action() {
        assert!(Header::parse("frob:a.b:1.0.0", 60_000).is_err());
    }

    #[test]
    fn test_parse_invalid_topic() {
        assert!(Header::parse("publish:a.+:1.0.0", 60_000).is_err());
    }

    #[test]
    fn test_parse_invalid_version() {
        assert!(Header::parse("publish:a.b:not-semver", 60_000).is_err());
    }

    #[test]
    fn test_parse_invalid_uuid() {
        assert!(Header::parse("request:a.b:1.0.0:not-a-uuid", 60_000).is_err());
    }

    #[test]
    fn test_parse_lowercases_topic() {
        let h = Header::parse("publish:A.B:1.0.0", 60_000).unwrap();
        assert_eq!(h.topic, "a.b");
    }

    #[test]
    fn test_serialize_roundtrip_minimal() {
        let h = header(Action::Publish, "a.b");
        let line = h.serialize();
        assert_eq!(line, "publish:a.b:1.0.0");
        let parsed = Header::parse(&line, 60_000).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_serialize_roundtrip_with_timeout() {
        let mut h = header(Action::Request, "a.b");
        h.request_id = Some(Uuid::new_v4());
        h.timeout = Some(5000);
        let line = h.serialize();
        let parsed = Header::parse(&line, 60_000).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_serialize_roundtrip_with_parent_only() {
        let mut h = header(Action::Response, "a.b");
        h.parent_request_id = Some(Uuid::new_v4());
        let line = h.serialize();
        let parsed = Header::parse(&line, 60_000).unwrap();
        assert_eq!(parsed, h);
    }
}
