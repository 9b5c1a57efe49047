//! Versioned envelope for records kept in the shared store.
//!
//! The store is the only persistence for sessions, operations, plans and
//! handover contexts, so every record is written as `{"v": N, "data": ...}`
//! and a reader refuses versions it does not understand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    v: u32,
    data: T,
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&EnvelopeRef {
        v: RECORD_VERSION,
        data: value,
    })?)
}

pub fn decode_record<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    let envelope: Envelope<T> = serde_json::from_str(raw)?;
    if envelope.v != RECORD_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: envelope.v,
            expected: RECORD_VERSION,
        });
    }
    Ok(envelope.data)
}
