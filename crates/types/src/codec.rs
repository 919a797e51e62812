//! Centralized record serialization.
//!
//! All durable records and command bodies go through these two functions.
//! Postcard's encoding is canonical for the types in this crate: no maps, no
//! floats, options encode presence explicitly. Replicas applying the same
//! command sequence therefore produce byte-identical bucket contents, which
//! the cross-replica checksum probe relies on.

use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Encodes a value to its canonical byte form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes a value from its canonical byte form.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}
