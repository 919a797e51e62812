//! The command model.
//!
//! Every mutation of curator state travels through the consensus log as a
//! tagged envelope: a big-endian u16 tag followed by the command body in the
//! canonical record codec. The tag table below is a wire protocol shared by
//! all replicas of a group; tags are never reused, and a replica that
//! receives a tag it doesn't know must halt rather than guess (the apply
//! engine enforces this).

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use curator_types::{
    decode, encode, BlobId, CodecError, CuratorId, ErrorCode, PartitionId, PlacementHint,
    RsChunkData, RsChunkId, StorageClass, TimeUpdate, TractId, TractKey, TractserverId,
};

const TAG_SET_REGISTRATION: u16 = 1;
const TAG_ADD_PARTITION: u16 = 2;
const TAG_SYNC_PARTITIONS: u16 = 3;
const TAG_CREATE_BLOB: u16 = 4;
const TAG_DELETE_BLOB: u16 = 5;
const TAG_UNDELETE_BLOB: u16 = 6;
const TAG_FINISH_DELETE: u16 = 7;
const TAG_SET_METADATA: u16 = 8;
const TAG_EXTEND_BLOB: u16 = 9;
const TAG_CHANGE_TRACT: u16 = 10;
const TAG_UPDATE_TIMES: u16 = 11;
const TAG_ALLOCATE_RS_CHUNK_IDS: u16 = 12;
const TAG_COMMIT_RS_CHUNK: u16 = 13;
const TAG_UPDATE_RS_HOSTS: u16 = 14;
const TAG_UPDATE_STORAGE_CLASS: u16 = 15;
const TAG_CREATE_TSID_CACHE: u16 = 16;
const TAG_SET_READ_ONLY_MODE: u16 = 17;
const TAG_CHECKSUM: u16 = 18;
const TAG_VERIFY_CHECKSUM: u16 = 19;

/// Sets the curator's registration id, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRegistrationCmd {
    /// The id assigned by the cluster master.
    pub id: CuratorId,
}

/// Adds a partition to the set this curator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPartitionCmd {
    /// The partition to add.
    pub id: PartitionId,
}

/// Adds every listed partition that isn't already present. Duplicates are
/// expected and silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPartitionsCmd {
    /// Partitions this curator should own.
    pub partitions: Vec<PartitionId>,
}

/// Creates a new blob in the lowest-id partition with room for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBlobCmd {
    /// Replication factor for the blob's tracts.
    pub repl: u32,
    /// Placement preference.
    pub hint: PlacementHint,
    /// Initial mtime and atime.
    pub initial_time: i64,
    /// Optional expiry.
    pub expires: Option<i64>,
}

/// Soft-deletes a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBlobCmd {
    /// The blob to delete.
    pub id: BlobId,
    /// Deletion timestamp to stamp on the record.
    pub when: i64,
}

/// Clears a blob's soft-delete stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeleteBlobCmd {
    /// The blob to restore.
    pub id: BlobId,
}

/// Permanently removes blobs and purges their tracts from RS chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishDeleteCmd {
    /// The blobs to remove. They are expected to be soft-deleted already.
    pub blobs: Vec<BlobId>,
}

/// Replaces a blob's opaque metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMetadataCmd {
    /// The blob to modify.
    pub id: BlobId,
    /// The new metadata.
    pub metadata: Vec<u8>,
}

/// Appends tracts to a blob.
///
/// `first_tract_key` must equal the blob's current tract count; a leader
/// retry that was already applied observes the grown count and is rejected,
/// which makes extension idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendBlobCmd {
    /// The blob to extend.
    pub id: BlobId,
    /// Expected index of the first new tract.
    pub first_tract_key: TractKey,
    /// One host vector per new tract; each must match the blob's
    /// replication factor.
    pub hosts: Vec<Vec<TractserverId>>,
}

/// Reconfigures one tract's replica set.
///
/// The new version must be exactly one past the current version, so at most
/// one reconfiguration can succeed per version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTractCmd {
    /// The tract to change.
    pub id: TractId,
    /// The replacement host vector; must have the same length as the
    /// current one.
    pub new_hosts: Vec<TractserverId>,
    /// The new version; must be current + 1.
    pub new_version: u32,
}

/// Applies a batch of mtime/atime advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTimesCmd {
    /// The updates, applied in order.
    pub updates: Vec<TimeUpdate>,
}

/// Reserves a contiguous range of RS chunk ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRsChunkIdsCmd {
    /// How many ids to reserve.
    pub count: u32,
}

/// Writes an RS chunk record after client-side encoding completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRsChunkCmd {
    /// The chunk's base id.
    pub id: RsChunkId,
    /// The erasure-coding class the chunk was encoded with.
    pub storage: StorageClass,
    /// Host of each piece, data first then parity.
    pub hosts: Vec<TractserverId>,
    /// Packed tract lists, one entry per piece.
    pub data: Vec<RsChunkData>,
}

/// Replaces an RS chunk's host vector after re-replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRsHostsCmd {
    /// The chunk to update.
    pub id: RsChunkId,
    /// The replacement host vector.
    pub hosts: Vec<TractserverId>,
}

/// Changes a blob's storage class (typically after its tracts were packed
/// into RS chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStorageClassCmd {
    /// The blob to update.
    pub id: BlobId,
    /// The new storage class.
    pub storage: StorageClass,
}

/// Bootstraps the known-tractserver cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTsidCacheCmd;

/// Sets or clears read-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReadOnlyModeCmd {
    /// Whether mutating commands should be rejected.
    pub read_only: bool,
}

/// Asks every replica to checksum a slice of the blob table. The leader
/// emits these periodically; each replica caches its result for the
/// follow-up [`VerifyChecksumCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumCmd {
    /// First blob id to include.
    pub start: BlobId,
    /// Maximum number of records to fold.
    pub count: u64,
}

/// Carries the leader's checksum for comparison against each replica's
/// cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyChecksumCmd {
    /// Log index of the checksum command this verifies.
    pub index: u64,
    /// The leader's checksum at that index.
    pub checksum: u64,
}

/// A decoded log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Command {
    SetRegistration(SetRegistrationCmd),
    AddPartition(AddPartitionCmd),
    SyncPartitions(SyncPartitionsCmd),
    CreateBlob(CreateBlobCmd),
    DeleteBlob(DeleteBlobCmd),
    UndeleteBlob(UndeleteBlobCmd),
    FinishDelete(FinishDeleteCmd),
    SetMetadata(SetMetadataCmd),
    ExtendBlob(ExtendBlobCmd),
    ChangeTract(ChangeTractCmd),
    UpdateTimes(UpdateTimesCmd),
    AllocateRsChunkIds(AllocateRsChunkIdsCmd),
    CommitRsChunk(CommitRsChunkCmd),
    UpdateRsHosts(UpdateRsHostsCmd),
    UpdateStorageClass(UpdateStorageClassCmd),
    CreateTsidCache(CreateTsidCacheCmd),
    SetReadOnlyMode(SetReadOnlyModeCmd),
    Checksum(ChecksumCmd),
    VerifyChecksum(VerifyChecksumCmd),
}

/// Envelope decode failures. All of them are fatal at apply time: they mean
/// the replicas disagree about the protocol.
#[derive(Debug, Snafu)]
pub enum EnvelopeError {
    /// The payload is shorter than the tag itself.
    #[snafu(display("command envelope shorter than its tag"))]
    Truncated,

    /// The tag is not in this replica's tag table.
    #[snafu(display("unknown command tag {tag}"))]
    UnknownTag {
        /// The unrecognized tag.
        tag: u16,
    },

    /// The body doesn't decode as the tag's command type.
    #[snafu(display("malformed body for command tag {tag}: {source}"))]
    Body {
        /// The envelope's tag.
        tag: u16,
        /// The underlying codec error.
        source: CodecError,
    },
}

/// Encodes a command into its log entry payload.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, CodecError> {
    let (tag, body) = match cmd {
        Command::SetRegistration(c) => (TAG_SET_REGISTRATION, encode(c)?),
        Command::AddPartition(c) => (TAG_ADD_PARTITION, encode(c)?),
        Command::SyncPartitions(c) => (TAG_SYNC_PARTITIONS, encode(c)?),
        Command::CreateBlob(c) => (TAG_CREATE_BLOB, encode(c)?),
        Command::DeleteBlob(c) => (TAG_DELETE_BLOB, encode(c)?),
        Command::UndeleteBlob(c) => (TAG_UNDELETE_BLOB, encode(c)?),
        Command::FinishDelete(c) => (TAG_FINISH_DELETE, encode(c)?),
        Command::SetMetadata(c) => (TAG_SET_METADATA, encode(c)?),
        Command::ExtendBlob(c) => (TAG_EXTEND_BLOB, encode(c)?),
        Command::ChangeTract(c) => (TAG_CHANGE_TRACT, encode(c)?),
        Command::UpdateTimes(c) => (TAG_UPDATE_TIMES, encode(c)?),
        Command::AllocateRsChunkIds(c) => (TAG_ALLOCATE_RS_CHUNK_IDS, encode(c)?),
        Command::CommitRsChunk(c) => (TAG_COMMIT_RS_CHUNK, encode(c)?),
        Command::UpdateRsHosts(c) => (TAG_UPDATE_RS_HOSTS, encode(c)?),
        Command::UpdateStorageClass(c) => (TAG_UPDATE_STORAGE_CLASS, encode(c)?),
        Command::CreateTsidCache(c) => (TAG_CREATE_TSID_CACHE, encode(c)?),
        Command::SetReadOnlyMode(c) => (TAG_SET_READ_ONLY_MODE, encode(c)?),
        Command::Checksum(c) => (TAG_CHECKSUM, encode(c)?),
        Command::VerifyChecksum(c) => (TAG_VERIFY_CHECKSUM, encode(c)?),
    };
    let mut payload = Vec::with_capacity(2 + body.len());
    payload.extend_from_slice(&tag.to_be_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decodes a log entry payload back into a command.
pub fn decode_command(payload: &[u8]) -> Result<Command, EnvelopeError> {
    if payload.len() < 2 {
        return TruncatedSnafu.fail();
    }
    let tag = u16::from_be_bytes([payload[0], payload[1]]);
    let body = &payload[2..];
    let cmd = match tag {
        TAG_SET_REGISTRATION => Command::SetRegistration(decode(body).context(BodySnafu { tag })?),
        TAG_ADD_PARTITION => Command::AddPartition(decode(body).context(BodySnafu { tag })?),
        TAG_SYNC_PARTITIONS => Command::SyncPartitions(decode(body).context(BodySnafu { tag })?),
        TAG_CREATE_BLOB => Command::CreateBlob(decode(body).context(BodySnafu { tag })?),
        TAG_DELETE_BLOB => Command::DeleteBlob(decode(body).context(BodySnafu { tag })?),
        TAG_UNDELETE_BLOB => Command::UndeleteBlob(decode(body).context(BodySnafu { tag })?),
        TAG_FINISH_DELETE => Command::FinishDelete(decode(body).context(BodySnafu { tag })?),
        TAG_SET_METADATA => Command::SetMetadata(decode(body).context(BodySnafu { tag })?),
        TAG_EXTEND_BLOB => Command::ExtendBlob(decode(body).context(BodySnafu { tag })?),
        TAG_CHANGE_TRACT => Command::ChangeTract(decode(body).context(BodySnafu { tag })?),
        TAG_UPDATE_TIMES => Command::UpdateTimes(decode(body).context(BodySnafu { tag })?),
        TAG_ALLOCATE_RS_CHUNK_IDS => {
            Command::AllocateRsChunkIds(decode(body).context(BodySnafu { tag })?)
        }
        TAG_COMMIT_RS_CHUNK => Command::CommitRsChunk(decode(body).context(BodySnafu { tag })?),
        TAG_UPDATE_RS_HOSTS => Command::UpdateRsHosts(decode(body).context(BodySnafu { tag })?),
        TAG_UPDATE_STORAGE_CLASS => {
            Command::UpdateStorageClass(decode(body).context(BodySnafu { tag })?)
        }
        TAG_CREATE_TSID_CACHE => Command::CreateTsidCache(decode(body).context(BodySnafu { tag })?),
        TAG_SET_READ_ONLY_MODE => {
            Command::SetReadOnlyMode(decode(body).context(BodySnafu { tag })?)
        }
        TAG_CHECKSUM => Command::Checksum(decode(body).context(BodySnafu { tag })?),
        TAG_VERIFY_CHECKSUM => Command::VerifyChecksum(decode(body).context(BodySnafu { tag })?),
        tag => return UnknownTagSnafu { tag }.fail(),
    };
    Ok(cmd)
}

/// Successful tract reconfiguration details.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TractInfo {
    /// The reconfigured tract.
    pub tract: TractId,
    /// Its new version.
    pub version: u32,
    /// Its new host vector.
    pub hosts: Vec<TractserverId>,
}

/// Result of applying one log entry, correlated back to the submitting
/// request by the consensus layer. The command outcome sits in a uniform
/// position, reachable through [`Response::error_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Response {
    /// The entry's index was at or below the applied index: crash-recovery
    /// replay of an already-persisted entry, applied as a no-op.
    Replayed,
    /// The curator's id (pre-existing or just set).
    SetRegistration { id: CuratorId },
    AddPartition { err: ErrorCode },
    SyncPartitions { err: ErrorCode },
    CreateBlob { id: BlobId, err: ErrorCode },
    DeleteBlob { err: ErrorCode },
    UndeleteBlob { err: ErrorCode },
    FinishDelete { err: ErrorCode },
    SetMetadata { err: ErrorCode },
    ExtendBlob { new_size: u32, err: ErrorCode },
    ChangeTract { info: Option<TractInfo>, err: ErrorCode },
    UpdateTimes { err: ErrorCode },
    AllocateRsChunkIds { id: RsChunkId, err: ErrorCode },
    CommitRsChunk { err: ErrorCode },
    UpdateRsHosts { err: ErrorCode },
    UpdateStorageClass { err: ErrorCode },
    CreateTsidCache { err: ErrorCode },
    SetReadOnlyMode { err: ErrorCode },
    Checksum { next: BlobId, checksum: u64, index: u64 },
    VerifyChecksum,
    /// A mutating command arrived while read-only mode was set. The entry
    /// still advanced the applied index; only the command was refused.
    Rejected { err: ErrorCode },
}

impl Response {
    /// The command outcome, for translation to a wire error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Response::Replayed
            | Response::SetRegistration { .. }
            | Response::Checksum { .. }
            | Response::VerifyChecksum => ErrorCode::NoError,
            Response::AddPartition { err }
            | Response::SyncPartitions { err }
            | Response::CreateBlob { err, .. }
            | Response::DeleteBlob { err }
            | Response::UndeleteBlob { err }
            | Response::FinishDelete { err }
            | Response::SetMetadata { err }
            | Response::ExtendBlob { err, .. }
            | Response::ChangeTract { err, .. }
            | Response::UpdateTimes { err }
            | Response::AllocateRsChunkIds { err, .. }
            | Response::CommitRsChunk { err }
            | Response::UpdateRsHosts { err }
            | Response::UpdateStorageClass { err }
            | Response::CreateTsidCache { err }
            | Response::SetReadOnlyMode { err }
            | Response::Rejected { err } => *err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(cmd: Command) {
        let payload = encode_command(&cmd).expect("encode");
        let back = decode_command(&payload).expect("decode");
        assert_eq!(cmd, back);
    }

    #[test]
    fn all_commands_roundtrip() {
        let bid = BlobId::from_parts(PartitionId::from_number(1), 1);
        roundtrip(Command::SetRegistration(SetRegistrationCmd { id: CuratorId::new(7) }));
        roundtrip(Command::AddPartition(AddPartitionCmd { id: PartitionId::from_number(1) }));
        roundtrip(Command::SyncPartitions(SyncPartitionsCmd {
            partitions: vec![PartitionId::from_number(1), PartitionId::from_number(3)],
        }));
        roundtrip(Command::CreateBlob(CreateBlobCmd {
            repl: 3,
            hint: PlacementHint::SpreadRacks,
            initial_time: 100,
            expires: Some(500),
        }));
        roundtrip(Command::DeleteBlob(DeleteBlobCmd { id: bid, when: 42 }));
        roundtrip(Command::UndeleteBlob(UndeleteBlobCmd { id: bid }));
        roundtrip(Command::FinishDelete(FinishDeleteCmd { blobs: vec![bid] }));
        roundtrip(Command::SetMetadata(SetMetadataCmd { id: bid, metadata: b"m".to_vec() }));
        roundtrip(Command::ExtendBlob(ExtendBlobCmd {
            id: bid,
            first_tract_key: 0,
            hosts: vec![vec![TractserverId::new(4), TractserverId::new(5)]],
        }));
        roundtrip(Command::ChangeTract(ChangeTractCmd {
            id: TractId::from_parts(bid, 0),
            new_hosts: vec![TractserverId::new(7)],
            new_version: 2,
        }));
        roundtrip(Command::UpdateTimes(UpdateTimesCmd {
            updates: vec![TimeUpdate { blob: bid, mtime: 1, atime: 2 }],
        }));
        roundtrip(Command::AllocateRsChunkIds(AllocateRsChunkIdsCmd { count: 64 }));
        roundtrip(Command::CommitRsChunk(CommitRsChunkCmd {
            id: RsChunkId::from_parts(PartitionId::from_number(1).as_rs(), 1),
            storage: StorageClass::Rs63,
            hosts: (1..=9).map(TractserverId::new).collect(),
            data: vec![RsChunkData::default(); 9],
        }));
        roundtrip(Command::UpdateRsHosts(UpdateRsHostsCmd {
            id: RsChunkId::from_parts(PartitionId::from_number(1).as_rs(), 1),
            hosts: vec![TractserverId::new(1)],
        }));
        roundtrip(Command::UpdateStorageClass(UpdateStorageClassCmd {
            id: bid,
            storage: StorageClass::Rs63,
        }));
        roundtrip(Command::CreateTsidCache(CreateTsidCacheCmd));
        roundtrip(Command::SetReadOnlyMode(SetReadOnlyModeCmd { read_only: true }));
        roundtrip(Command::Checksum(ChecksumCmd { start: BlobId::ZERO, count: 1000 }));
        roundtrip(Command::VerifyChecksum(VerifyChecksumCmd { index: 5, checksum: 0xdead }));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let payload = [0xff, 0xfe, 0, 0];
        assert!(matches!(
            decode_command(&payload),
            Err(EnvelopeError::UnknownTag { tag: 0xfffe })
        ));
    }

    #[test]
    fn truncated_envelope_is_an_error() {
        assert!(matches!(decode_command(&[]), Err(EnvelopeError::Truncated)));
        assert!(matches!(decode_command(&[1]), Err(EnvelopeError::Truncated)));
    }

    #[test]
    fn malformed_body_is_an_error() {
        // A DeleteBlob body that's too short to hold its fields.
        let payload = [0u8, TAG_DELETE_BLOB as u8, 1];
        assert!(matches!(
            decode_command(&payload),
            Err(EnvelopeError::Body { tag: TAG_DELETE_BLOB, .. })
        ));
    }

    #[test]
    fn error_code_position_is_uniform() {
        assert_eq!(Response::Replayed.error_code(), ErrorCode::NoError);
        assert_eq!(
            Response::CreateBlob { id: BlobId::ZERO, err: ErrorCode::GenBlobId }.error_code(),
            ErrorCode::GenBlobId
        );
        assert_eq!(
            Response::Rejected { err: ErrorCode::ReadOnlyMode }.error_code(),
            ErrorCode::ReadOnlyMode
        );
    }

    proptest! {
        #[test]
        fn delete_blob_roundtrips(raw in any::<u64>(), when in any::<i64>()) {
            roundtrip(Command::DeleteBlob(DeleteBlobCmd { id: BlobId::from_raw(raw), when }));
        }

        #[test]
        fn checksum_roundtrips(start in any::<u64>(), count in any::<u64>()) {
            roundtrip(Command::Checksum(ChecksumCmd { start: BlobId::from_raw(start), count }));
        }
    }
}
