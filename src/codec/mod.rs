// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Framed message codec: length-prefix framing plus header/payload parsing.

pub mod frame;
pub mod header;
pub mod payload;

pub use frame::{FrameCodec, FrameError};
pub use header::{Action, Header, HeaderError};
pub use payload::{serialize_message, ErrorPayload, ParsedMessage, PayloadError};

/// Aggregate codec error covering both the frame and the header/payload
/// layers.
#[derive(Debug, Clone)]
pub enum CodecError {
    Frame(FrameError),
    Payload(PayloadError),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "{e}"),
            Self::Payload(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<FrameError> for CodecError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<PayloadError> for CodecError {
    fn from(e: PayloadError) -> Self {
        Self::Payload(e)
    }
}
