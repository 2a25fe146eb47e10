//! JSON encoding and decoding for backend bodies and push frames.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::wire::{MessageRow, PageBody, PushFrame};

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The payload did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encodes any wire value as JSON bytes.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a history page body.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the bytes are not a valid page.
pub fn decode_page(bytes: &[u8]) -> Result<PageBody, CodecError> {
    decode(bytes)
}

/// Decodes a single message row (send response, single fetch).
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the bytes are not a valid row.
pub fn decode_row(bytes: &[u8]) -> Result<MessageRow, CodecError> {
    decode(bytes)
}

/// Decodes one change-feed frame.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the bytes are not a valid frame.
pub fn decode_push(bytes: &[u8]) -> Result<PushFrame, CodecError> {
    decode(bytes)
}
