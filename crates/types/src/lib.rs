//! Core types for the curator metadata service.
//!
//! This crate is the bottom of the dependency stack: identifier newtypes,
//! the durable record structures shared by the state layer and the apply
//! engine, the wire-visible error code enumeration, and the centralized
//! record codec.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod ids;
mod records;

pub use codec::{decode, encode, CodecError};
pub use error::ErrorCode;
pub use ids::{
    BlobId, BlobKey, CuratorId, PartitionId, RsChunkId, TractId, TractKey, TractserverId,
    MAX_BLOB_KEY, MAX_PARTITION_NUMBER, MAX_RS_CHUNK_KEY, RS_PARTITION_TAG,
};
pub use records::{
    Blob, EncodedTract, Partition, PlacementHint, RsChunk, RsChunkData, StorageClass, TimeUpdate,
    Tract, TractPointer,
};
