// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message parsing: locates the header line within a frame, exposes
//! zero-copy byte views, and defers JSON decoding until requested.

use super::header::{Header, HeaderError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Literal byte prefix marking an error payload.
pub const ERROR_PREFIX: &str = "error:";

/// A parsed message: validated header plus a borrowed view of the raw
/// payload bytes. JSON decoding is deferred to `parse_payload`/`parse_error`.
pub struct ParsedMessage<'a> {
    pub header: Header,
    pub raw_payload: &'a [u8],
    pub has_error: bool,
}

/// Payload parse errors.
#[derive(Debug, Clone)]
pub enum PayloadError {
    Header(HeaderError),
    NoHeaderTerminator,
    PayloadTooLarge { len: usize, max: usize },
    InvalidJson(String),
    InvalidErrorObject(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Header(e) => write!(f, "{e}"),
            Self::NoHeaderTerminator => write!(f, "no header terminator found"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload length {len} exceeds max {max}")
            }
            Self::InvalidJson(s) => write!(f, "invalid JSON payload: {s}"),
            Self::InvalidErrorObject(s) => write!(f, "invalid error payload: {s}"),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<HeaderError> for PayloadError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

/// The structured form of an `error:`-prefixed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<'a> ParsedMessage<'a> {
    /// Parses a single frame's body: locates the `\n`-terminated header
    /// line within `max_header` bytes, validates it, and exposes the
    /// remaining bytes as the payload view.
    pub fn parse(
        frame: &'a [u8],
        max_header: usize,
        max_payload: usize,
        max_timeout_ms: u64,
    ) -> Result<Self, PayloadError> {
        let search_len = frame.len().min(max_header);
        let newline_idx = frame[..search_len]
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(PayloadError::NoHeaderTerminator)?;

        let header_bytes = &frame[..newline_idx];
        let header_str =
            std::str::from_utf8(header_bytes).map_err(|_| PayloadError::NoHeaderTerminator)?;
        let header = Header::parse(header_str, max_timeout_ms)?;

        let raw_payload = &frame[newline_idx + 1..];
        if raw_payload.len() > max_payload {
            return Err(PayloadError::PayloadTooLarge {
                len: raw_payload.len(),
                max: max_payload,
            });
        }

        let has_error = raw_payload.starts_with(ERROR_PREFIX.as_bytes());

        Ok(Self {
            header,
            raw_payload,
            has_error,
        })
    }

    fn json_bytes(&self) -> &[u8] {
        if self.has_error {
            &self.raw_payload[ERROR_PREFIX.len()..]
        } else {
            self.raw_payload
        }
    }

    /// Decodes the payload (minus the `error:` prefix, if present) as `T`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(self.json_bytes()).map_err(|e| PayloadError::InvalidJson(e.to_string()))
    }

    /// Decodes the payload as an `ErrorPayload`, validating that `code`,
    /// `message`, and `timestamp` are all present. Only valid when
    /// `has_error` is set.
    pub fn parse_error(&self) -> Result<ErrorPayload, PayloadError> {
        let value: serde_json::Value = serde_json::from_slice(self.json_bytes())
            .map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| PayloadError::InvalidErrorObject("not a JSON object".into()))?;
        for field in ["code", "message", "timestamp"] {
            if !obj.contains_key(field) {
                return Err(PayloadError::InvalidErrorObject(format!(
                    "missing required field {field:?}"
                )));
            }
        }
        serde_json::from_value(value).map_err(|e| PayloadError::InvalidErrorObject(e.to_string()))
    }
}

/// Serializes a header plus JSON payload into a complete message body
/// (header line + `\n` + payload bytes), ready to hand to the frame layer.
pub fn serialize_message(header: &Header, payload_json: &[u8], is_error: bool) -> Vec<u8> {
    let mut out = header.serialize().into_bytes();
    out.push(b'\n');
    if is_error {
        out.extend_from_slice(ERROR_PREFIX.as_bytes());
    }
    out.extend_from_slice(payload_json);
    out
}
