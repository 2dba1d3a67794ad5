//! Opaque encode/decode of flow continuation state.
//!
//! The scheduler never looks inside the bytes; only the flow registry
//! decodes them back into a typed flow.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{AppError, Result};

/// Encode a continuation into bytes.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the state cannot be encoded.
pub fn encode<T: Serialize>(state: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(state).map_err(AppError::from)
}

/// Decode a continuation from bytes.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the bytes do not describe a `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| AppError::Serialization(format!("undecodable continuation: {err}")))
}
