//! Durable state for a curator node.
//!
//! This crate sits between the embedded key-value store (redb) and the apply
//! engine (`curator-durable`), providing:
//!
//! - A storage engine wrapper with file-backed and in-memory constructors
//! - Fixed table (bucket) definitions and big-endian composite key encoding
//! - Typed read-only and read-write transactions over the store
//! - RS chunk piece lookup and tract-in-chunk resolution
//! - The known-tractserver cache and the cross-replica checksum fold
//! - Logical full-state snapshot images for the consensus layer
//!
//! All mutation happens through [`WriteTxn`], exactly one of which exists at
//! a time; the applied log index is stamped into the store atomically with
//! each commit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod keys;
mod rschunk;
mod snapshot;
mod state;
mod tables;

pub use engine::StorageEngine;
pub use keys::{
    decode_blob_key, decode_partition_key, decode_rschunk_key, encode_blob_key,
    encode_partition_key, encode_rschunk_key,
};
pub use rschunk::lookup_tract_in_chunk;
pub use state::{BlobIter, ReadOnlyTxn, State, StateError, WriteTxn};
pub use tables::Tables;
