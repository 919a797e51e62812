//! Identifier types.
//!
//! All identifiers are thin newtypes over fixed-width integers so that the
//! big-endian key encodings used by the state layer order the same way the
//! semantic identifiers do.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bits the partition type tag is shifted left by.
const PARTITION_TYPE_SHIFT: u32 = 30;

/// Type tag of an erasure-coded (Reed-Solomon) partition.
///
/// The high two bits of a [`PartitionId`] carry the type; replicated
/// partitions use tag 0.
pub const RS_PARTITION_TAG: u32 = 2;

/// Largest partition number representable in the low 30 bits.
pub const MAX_PARTITION_NUMBER: u32 = (1 << PARTITION_TYPE_SHIFT) - 1;

/// Reserved blob key marking a partition as full. `next_blob_key` reaching
/// this value disqualifies the partition from new allocations.
pub const MAX_BLOB_KEY: BlobKey = u32::MAX;

/// Largest RS chunk key. Chunk keys are 48 bits wide so that the
/// pseudo-tract-id encoding (blob key high 32 bits, tract key low 16 bits)
/// is lossless.
pub const MAX_RS_CHUNK_KEY: u64 = (1 << 48) - 1;

/// Blob key within a partition. Allocated monotonically starting at 1.
pub type BlobKey = u32;

/// Tract index within a blob. Positional, 0-based.
pub type TractKey = u16;

/// Partition identifier.
///
/// The high two bits are a type tag ([`RS_PARTITION_TAG`] for erasure-coded
/// partitions, 0 for replicated ones); the low 30 bits are the partition
/// number assigned by the cluster master.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a partition id from its raw 32-bit representation (tag bits
    /// included).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Creates a replicated (untagged) partition id from a partition number.
    #[inline]
    pub const fn from_number(number: u32) -> Self {
        Self(number & MAX_PARTITION_NUMBER)
    }

    /// Returns the raw 32-bit value, tag bits included.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the partition number (low 30 bits).
    #[inline]
    pub const fn number(self) -> u32 {
        self.0 & MAX_PARTITION_NUMBER
    }

    /// Returns the type tag (high 2 bits).
    #[inline]
    pub const fn type_tag(self) -> u32 {
        self.0 >> PARTITION_TYPE_SHIFT
    }

    /// True if this id names an erasure-coded partition.
    #[inline]
    pub const fn is_rs(self) -> bool {
        self.type_tag() == RS_PARTITION_TAG
    }

    /// Returns the RS-tagged id for the same partition number.
    #[inline]
    pub const fn as_rs(self) -> Self {
        Self((RS_PARTITION_TAG << PARTITION_TYPE_SHIFT) | self.number())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{:#010x}", self.0)
    }
}

/// Blob identifier: a partition id in the high 32 bits, a blob key in the
/// low 32 bits. The integer ordering of a `BlobId` equals the lexicographic
/// ordering of (partition, blob key).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BlobId(u64);

impl BlobId {
    /// The zero blob id. Not a valid blob; used as the "start from the
    /// beginning" sentinel for scans and checksums.
    pub const ZERO: BlobId = BlobId(0);

    /// Builds a blob id from its parts.
    #[inline]
    pub const fn from_parts(partition: PartitionId, key: BlobKey) -> Self {
        Self(((partition.raw() as u64) << 32) | key as u64)
    }

    /// Creates a blob id from its raw 64-bit representation.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The partition this blob lives in.
    #[inline]
    pub const fn partition(self) -> PartitionId {
        PartitionId::from_raw((self.0 >> 32) as u32)
    }

    /// The blob key within the partition.
    #[inline]
    pub const fn blob_key(self) -> BlobKey {
        self.0 as u32
    }

    /// True for any id other than [`BlobId::ZERO`].
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}:{}", self.partition().raw(), self.blob_key())
    }
}

/// Tract identifier: a blob plus a positional tract key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TractId {
    /// The blob this tract belongs to.
    pub blob: BlobId,
    /// The tract's 0-based index within the blob.
    pub index: TractKey,
}

impl TractId {
    /// Builds a tract id from its parts.
    #[inline]
    pub const fn from_parts(blob: BlobId, index: TractKey) -> Self {
        Self { blob, index }
    }

    /// Reinterprets this id as an RS chunk id.
    ///
    /// This is the inverse of [`RsChunkId::to_tract_id`]: chunk piece
    /// addresses travel through tract-shaped ids on the read path, with the
    /// 48-bit chunk key split as blob-key (high 32) and tract-key (low 16).
    #[inline]
    pub const fn to_rs_chunk_id(self) -> RsChunkId {
        RsChunkId {
            partition: self.blob.partition(),
            key: ((self.blob.blob_key() as u64) << 16) | self.index as u64,
        }
    }
}

impl fmt::Display for TractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.blob, self.index)
    }
}

/// RS chunk identifier: an RS-tagged partition plus a 48-bit chunk key.
///
/// `id.add(i)` for `0 <= i < n + m` addresses the chunk's i-th piece.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct RsChunkId {
    /// The erasure-coded partition the chunk was allocated in.
    pub partition: PartitionId,
    /// The chunk key within the partition.
    pub key: u64,
}

impl RsChunkId {
    /// Builds a chunk id from its parts.
    #[inline]
    pub const fn from_parts(partition: PartitionId, key: u64) -> Self {
        Self { partition, key }
    }

    /// The id of the piece `offset` positions after this chunk's base.
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self { partition: self.partition, key: self.key + offset }
    }

    /// Encodes this chunk id as a pseudo tract id for piece lookups.
    #[inline]
    pub const fn to_tract_id(self) -> TractId {
        TractId {
            blob: BlobId::from_parts(self.partition, (self.key >> 16) as u32),
            index: (self.key & 0xffff) as u16,
        }
    }
}

impl fmt::Display for RsChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.key)
    }
}

/// Generates a newtype wrapper around a numeric type for type-safe
/// identifiers: standard derives, transparent serde, `Display` with a
/// semantic prefix, and a zero-is-invalid validity check.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident, $inner:ty, $prefix:expr
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            /// Creates a new identifier from a raw value.
            #[inline]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Returns the raw numeric value.
            #[inline]
            pub const fn value(self) -> $inner {
                self.0
            }

            /// True for any value other than the reserved zero.
            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $prefix, self.0)
            }
        }
    };
}

define_id!(
    /// A storage host holding tract replicas or RS chunk pieces.
    TractserverId, u32, "ts"
);

define_id!(
    /// The set-once identifier of this curator replica group.
    CuratorId, u32, "curator"
);
