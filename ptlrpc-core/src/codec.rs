//! Pluggable body serialization.
//!
//! Request and reply bodies travel as opaque bytes inside the message
//! envelope. [`MessageCodec`] turns typed bodies into those bytes; the default
//! [`JsonCodec`] is human-readable and handy in tests.
//!
//! # Example
//!
//! ```rust
//! use ptlrpc_core::{MessageCodec, JsonCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Getattr {
//!     ino: u64,
//! }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Getattr { ino: 42 }).expect("encode");
//! let decoded: Getattr = codec.decode(&bytes).expect("decode");
//! assert_eq!(decoded.ino, 42);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a body to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a body.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable body serialization format.
///
/// Codecs are stored inside endpoints shared across tasks, hence the
/// `Send + Sync` bound.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable body to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable body.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
