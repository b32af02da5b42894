// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The broker-wide error taxonomy (kinds, not type names). Every
//! user-visible failure is surfaced as a RESPONSE carrying an
//! `error:{code,message,timestamp,details?}` payload; the broker never
//! throws through a connection.

use serde_json::Value;

/// A user-visible error kind, each mapped to a wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedMessage,
    InvalidRequest,
    InvalidRequestId,
    NoRouteFound,
    ServiceUnavailable,
    Timeout,
    TopicNotSupported,
    InternalError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidRequestId => "INVALID_REQUEST_ID",
            Self::NoRouteFound => "NO_ROUTE_FOUND",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::TopicNotSupported => "TOPIC_NOT_SUPPORTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Builds the JSON body of an `error:`-prefixed payload.
pub fn error_body(kind: ErrorKind, message: &str, details: Option<Value>) -> Vec<u8> {
    let mut obj = serde_json::json!({
        "code": kind.code(),
        "message": message,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(details) = details {
        obj["details"] = details;
    }
    serde_json::to_vec(&obj).expect("error payload always serializes")
}
