//! Durable record structures.
//!
//! These are the values stored in the partition, blob, and rschunk buckets.
//! Every field is encoded with the deterministic record codec; replicas that
//! apply the same command sequence must produce byte-identical records, so
//! none of these structs may contain map-valued or platform-dependent fields.

use serde::{Deserialize, Serialize};

use crate::ids::{BlobId, BlobKey, PartitionId, RsChunkId, TractId, TractserverId};

/// Storage class of a blob or RS chunk.
///
/// Replicated data keeps `repl` full copies of each tract; erasure-coded
/// classes pack tracts into chunks of `n` data plus `m` parity pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageClass {
    /// Fully replicated tracts. The default for new blobs.
    #[default]
    Replicated,
    /// Reed-Solomon 6 data + 3 parity.
    Rs63,
    /// Reed-Solomon 8 data + 3 parity.
    Rs83,
    /// Reed-Solomon 10 data + 3 parity.
    Rs103,
    /// Reed-Solomon 12 data + 5 parity.
    Rs125,
}

impl StorageClass {
    /// Returns (data, parity) piece counts for erasure-coded classes.
    pub const fn rs_params(self) -> Option<(usize, usize)> {
        match self {
            StorageClass::Replicated => None,
            StorageClass::Rs63 => Some((6, 3)),
            StorageClass::Rs83 => Some((8, 3)),
            StorageClass::Rs103 => Some((10, 3)),
            StorageClass::Rs125 => Some((12, 5)),
        }
    }

    /// Total pieces (data + parity) for erasure-coded classes.
    pub const fn total_pieces(self) -> Option<usize> {
        match self.rs_params() {
            Some((n, m)) => Some(n + m),
            None => None,
        }
    }
}

/// Placement preference recorded on a blob at creation.
///
/// Advisory: the allocator spreads replicas across the named failure domain
/// where it can; the state machine only stores the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlacementHint {
    /// No preference.
    #[default]
    Default,
    /// Spread replicas across disks.
    SpreadDisks,
    /// Spread replicas across hosts.
    SpreadHosts,
    /// Spread replicas across racks.
    SpreadRacks,
}

/// One tract of a blob: the hosts holding its replicas and its version.
///
/// The tract's index within the blob is positional and not stored. The host
/// list length always equals the blob's replication factor, and the version
/// only ever advances by exactly one per successful reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tract {
    /// Hosts holding replicas of this tract, in placement order.
    pub hosts: Vec<TractserverId>,
    /// Monotonic version, starting at 1.
    pub version: u32,
}

/// Per-blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Blob {
    /// Replication factor; every tract's host list has this length.
    pub repl: u32,
    /// Placement preference.
    pub hint: PlacementHint,
    /// Modification time, unix nanos. 0 if never set.
    pub mtime: i64,
    /// Access time, unix nanos. 0 if never set.
    pub atime: i64,
    /// Expiry time, unix nanos, if the blob was created with a lease.
    pub expires: Option<i64>,
    /// Soft-delete timestamp. A blob with this set is invisible to ordinary
    /// reads until undeleted or permanently removed.
    pub deleted: Option<i64>,
    /// Opaque client metadata.
    pub metadata: Vec<u8>,
    /// Storage class.
    pub storage: StorageClass,
    /// Tracts, in positional order.
    pub tracts: Vec<Tract>,
}

/// Per-partition allocation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// The partition's id (untagged; tag bits are applied when deriving
    /// RS chunk ids).
    pub id: PartitionId,
    /// Next blob key to hand out. Reaching the reserved maximum marks the
    /// partition full.
    pub next_blob_key: BlobKey,
    /// Next RS chunk key to hand out. 0 until the first allocation, which
    /// starts at 1.
    pub next_rs_chunk_key: u64,
}

impl Partition {
    /// A freshly created partition: blob keys start at 1, chunk keys at the
    /// first allocation.
    pub const fn new(id: PartitionId) -> Self {
        Self { id, next_blob_key: 1, next_rs_chunk_key: 0 }
    }
}

/// One packed tract within an RS chunk data piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTract {
    /// The tract stored in this piece.
    pub id: TractId,
    /// Byte offset of the tract within the piece.
    pub offset: u32,
    /// Length of the tract in bytes.
    pub length: u32,
}

/// Contents of one data piece of an RS chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RsChunkData {
    /// Tracts packed into this piece, in pack order.
    pub tracts: Vec<EncodedTract>,
}

/// An erasure-coded chunk: n data pieces and m parity pieces, one host per
/// piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RsChunk {
    /// Host of each piece, data pieces first, then parity. Length is n + m.
    pub hosts: Vec<TractserverId>,
    /// Per-piece packed tract lists. Length is n + m; parity entries are
    /// empty.
    pub data: Vec<RsChunkData>,
}

/// Resolved location of a tract stored inside an RS chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TractPointer {
    /// Id of the specific piece holding the tract (base chunk + piece index).
    pub chunk: RsChunkId,
    /// Byte offset of the tract within the piece.
    pub offset: u32,
    /// Length of the tract in bytes.
    pub length: u32,
    /// Host of the piece.
    pub tsid: TractserverId,
    /// Storage class the chunk was encoded with.
    pub class: StorageClass,
    /// Id of the chunk's base (piece 0).
    pub base_chunk: RsChunkId,
    /// Hosts of all pieces of the chunk, for reconstruction.
    pub other_tsids: Vec<TractserverId>,
}

/// One entry in a batched mtime/atime update. A value of 0 leaves the
/// corresponding field untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeUpdate {
    /// The blob to touch.
    pub blob: BlobId,
    /// New modification time, or 0 to leave as is.
    pub mtime: i64,
    /// New access time, or 0 to leave as is.
    pub atime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn storage_class_shapes() {
        assert_eq!(StorageClass::Replicated.rs_params(), None);
        assert_eq!(StorageClass::Rs63.rs_params(), Some((6, 3)));
        assert_eq!(StorageClass::Rs63.total_pieces(), Some(9));
        assert_eq!(StorageClass::Rs125.total_pieces(), Some(17));
    }

    #[test]
    fn blob_record_roundtrip() {
        let blob = Blob {
            repl: 3,
            hint: PlacementHint::SpreadRacks,
            mtime: 100,
            atime: 200,
            expires: Some(5_000),
            deleted: None,
            metadata: b"owner=ingest".to_vec(),
            storage: StorageClass::Replicated,
            tracts: vec![Tract {
                hosts: vec![TractserverId::new(4), TractserverId::new(5), TractserverId::new(6)],
                version: 1,
            }],
        };
        let bytes = codec::encode(&blob).unwrap();
        let back: Blob = codec::decode(&bytes).unwrap();
        assert_eq!(blob, back);
    }

    #[test]
    fn encoding_is_deterministic() {
        // Two equal records must serialize to identical bytes; the checksum
        // probe depends on it.
        let chunk = RsChunk {
            hosts: (1..=9).map(TractserverId::new).collect(),
            data: vec![RsChunkData::default(); 9],
        };
        assert_eq!(codec::encode(&chunk).unwrap(), codec::encode(&chunk.clone()).unwrap());
    }

    #[test]
    fn unset_options_encode_smaller() {
        // Absent optional fields must be absent on the wire, not zero-valued.
        let bare = Blob::default();
        let expiring = Blob { expires: Some(0), ..Blob::default() };
        assert!(codec::encode(&bare).unwrap().len() < codec::encode(&expiring).unwrap().len());
    }

    #[test]
    fn new_partition_counters() {
        let p = Partition::new(PartitionId::from_number(1));
        assert_eq!(p.next_blob_key, 1);
        assert_eq!(p.next_rs_chunk_key, 0);
    }
}
