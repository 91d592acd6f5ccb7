//! Pluggable user-payload serialization.
//!
//! The cluster runtime treats call arguments and results as opaque byte
//! strings produced and consumed by a [`PayloadCodec`]. The default
//! [`JsonCodec`] is human-readable and convenient for debugging; swap in a
//! binary codec for production workloads.
//!
//! # Example
//!
//! ```
//! use procmesh_core::{JsonCodec, PayloadCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Job { seq: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Job { seq: 1 }).unwrap();
//! let back: Job = codec.decode(&bytes).unwrap();
//! assert_eq!(back, Job { seq: 1 });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for payload codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode failed: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes into a value.
    #[error("decode failed: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable serialization format for user payloads.
///
/// Implementations must be cheap to clone; the runtime stores one copy per
/// node and hands clones to producer tasks. Types crossing the wire must
/// implement serde's `Serialize`/`DeserializeOwned`.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
///
/// The default codec. Self-describing output makes wire captures readable,
/// at some size cost over binary formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
