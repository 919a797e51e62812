//! The apply engine.
//!
//! [`StateHandler`] implements the [`Fsm`] seam the consensus layer drives.
//! Apply is never called concurrently; every committed entry runs in exactly
//! one write transaction, and the applied index advances with the commit even
//! when the command itself was refused. Recoverable command failures travel
//! back to the submitter as [`ErrorCode`]s; protocol mismatches, checksum
//! divergence at a matching index, and store failures halt the process,
//! because continuing past any of them means replicas silently drift apart.

use parking_lot::{Mutex, RwLock};

use curator_state::{ReadOnlyTxn, State, StateError, WriteTxn};
use curator_types::{Blob, BlobId, ErrorCode, Partition, PartitionId, RsChunkId, Tract,
    MAX_BLOB_KEY, MAX_RS_CHUNK_KEY};

use crate::cmd::{
    decode_command, AddPartitionCmd, AllocateRsChunkIdsCmd, ChangeTractCmd, ChecksumCmd, Command,
    CommitRsChunkCmd, CreateBlobCmd, DeleteBlobCmd, ExtendBlobCmd, FinishDeleteCmd, Response,
    SetMetadataCmd, SetRegistrationCmd, SyncPartitionsCmd, TractInfo, UndeleteBlobCmd,
    UpdateRsHostsCmd, UpdateStorageClassCmd, UpdateTimesCmd, VerifyChecksumCmd,
};

/// One committed consensus log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The entry's log index.
    pub index: u64,
    /// The command envelope.
    pub payload: Vec<u8>,
}

/// Callback invoked on every leadership change with the new leader flag.
pub type LeadershipHook = Box<dyn Fn(bool) + Send + Sync>;

/// Leadership and membership as last reported by the consensus layer.
///
/// Advisory only: none of it participates in apply, and none of it is
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leadership {
    /// Whether this replica currently leads the group.
    pub is_leader: bool,
    /// The leader's term.
    pub term: u64,
    /// The leader's node id, empty if unknown.
    pub leader: String,
    /// Current group members.
    pub members: Vec<String>,
}

#[derive(Debug, Default)]
struct ChecksumCache {
    index: u64,
    value: u64,
}

/// The state machine seam consumed by the consensus layer.
pub trait Fsm {
    /// Applies one committed entry and returns its result. Never invoked
    /// concurrently with itself.
    fn apply(&self, entry: &LogEntry) -> Response;

    /// Serializes the full state for snapshot transfer.
    fn snapshot(&self) -> Result<Vec<u8>, StateError>;

    /// Atomically replaces the full state with a snapshot image.
    fn restore(&self, image: &[u8]) -> Result<(), StateError>;

    /// Reports a leadership change.
    fn on_leadership_change(&self, is_leader: bool, term: u64, leader: String);

    /// Reports the group's current membership.
    fn on_membership_change(&self, members: Vec<String>);
}

/// The curator's durable state machine.
pub struct StateHandler {
    state: State,
    // Serial by construction: only touched from apply.
    checksum: Mutex<ChecksumCache>,
    // Written by the consensus callback thread, read by server threads.
    leadership: RwLock<Leadership>,
    on_leadership: LeadershipHook,
}

impl StateHandler {
    /// Wraps a state and a leadership hook into a handler.
    pub fn new(state: State, on_leadership: LeadershipHook) -> Self {
        Self {
            state,
            checksum: Mutex::new(ChecksumCache::default()),
            leadership: RwLock::new(Leadership::default()),
            on_leadership,
        }
    }

    /// The underlying state, for request-serving reads.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Whether this replica currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.leadership.read().is_leader
    }

    /// A copy of the last reported leadership and membership.
    pub fn leadership(&self) -> Leadership {
        self.leadership.read().clone()
    }

    fn try_apply(&self, entry: &LogEntry) -> Result<Response, StateError> {
        let rtx = self.state.read_only_txn()?;
        if entry.index <= rtx.index()? {
            // Crash recovery replays committed entries from the log; anything
            // the store has already absorbed must not be applied twice.
            return Ok(Response::Replayed);
        }

        let cmd = match decode_command(&entry.payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                // A tag or body this replica can't parse means the replicas
                // no longer share a protocol.
                panic!("unintelligible command at log index {}: {err}", entry.index);
            }
        };

        // Checksum commands only need the read snapshot.
        match cmd {
            Command::Checksum(c) => return self.checksum_request(&rtx, c, entry.index),
            Command::VerifyChecksum(c) => {
                drop(rtx);
                self.verify_checksum(c);
                return Ok(Response::VerifyChecksum);
            }
            _ => {}
        }
        drop(rtx);

        let mut txn = self.state.write_txn(entry.index)?;

        let response = if let Command::SetReadOnlyMode(c) = &cmd {
            // Mode changes bypass the gate, or the flag could never be
            // cleared.
            txn.set_read_only_mode(c.read_only)?;
            Response::SetReadOnlyMode { err: ErrorCode::NoError }
        } else if txn.read_only_mode()? {
            Response::Rejected { err: ErrorCode::ReadOnlyMode }
        } else {
            dispatch(&mut txn, cmd)?
        };

        // The entry is consensus-committed, so the applied index advances no
        // matter what the handler decided.
        txn.commit()?;
        Ok(response)
    }

    fn checksum_request(
        &self,
        rtx: &ReadOnlyTxn,
        cmd: ChecksumCmd,
        index: u64,
    ) -> Result<Response, StateError> {
        let (value, next) = rtx.checksum(cmd.start, cmd.count)?;
        let mut cache = self.checksum.lock();
        cache.index = index;
        cache.value = value;
        Ok(Response::Checksum { next, checksum: value, index })
    }

    fn verify_checksum(&self, cmd: VerifyChecksumCmd) {
        let cache = self.checksum.lock();
        if cache.index != cmd.index {
            // Happens around restarts, leader elections, and membership
            // changes. Harmless.
            tracing::info!(
                have = cache.index,
                want = cmd.index,
                "got checksum for a different index; ignoring"
            );
        } else if cache.value != cmd.checksum {
            panic!(
                "replica state divergence: checksum {:#018x} != {:#018x} at log index {}",
                cache.value, cmd.checksum, cmd.index
            );
        } else {
            tracing::debug!(index = cache.index, checksum = cache.value, "consistency check passed");
        }
    }
}

impl Fsm for StateHandler {
    fn apply(&self, entry: &LogEntry) -> Response {
        match self.try_apply(entry) {
            Ok(response) => response,
            Err(err) => {
                // The store refused a committed entry; the replica can't make
                // progress without diverging.
                panic!("failed to apply log entry {}: {err}", entry.index);
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, StateError> {
        self.state.snapshot_image()
    }

    fn restore(&self, image: &[u8]) -> Result<(), StateError> {
        self.state.restore_image(image)
    }

    fn on_leadership_change(&self, is_leader: bool, term: u64, leader: String) {
        {
            let mut leadership = self.leadership.write();
            leadership.is_leader = is_leader;
            leadership.term = term;
            leadership.leader = leader;
        }
        tracing::info!(is_leader, term, "leadership changed");
        (self.on_leadership)(is_leader);
    }

    fn on_membership_change(&self, members: Vec<String>) {
        tracing::info!(?members, "membership changed");
        self.leadership.write().members = members;
    }
}

// ============================================================================
// Command handlers
// ============================================================================
//
// Each handler is a pure function of (transaction, command); everything it
// reads and writes goes through the transaction, so a replayed transaction
// produces the same response without touching the store.

fn dispatch(txn: &mut WriteTxn, cmd: Command) -> Result<Response, StateError> {
    match cmd {
        Command::SetRegistration(c) => set_registration(txn, c),
        Command::AddPartition(c) => add_partition_cmd(txn, c),
        Command::SyncPartitions(c) => sync_partitions(txn, c),
        Command::CreateBlob(c) => create_blob(txn, c),
        Command::DeleteBlob(c) => delete_blob(txn, c),
        Command::UndeleteBlob(c) => undelete_blob(txn, c),
        Command::FinishDelete(c) => finish_delete(txn, c),
        Command::SetMetadata(c) => set_metadata(txn, c),
        Command::ExtendBlob(c) => extend_blob(txn, c),
        Command::ChangeTract(c) => change_tract(txn, c),
        Command::UpdateTimes(c) => update_times(txn, c),
        Command::AllocateRsChunkIds(c) => allocate_rs_chunk_ids(txn, c),
        Command::CommitRsChunk(c) => commit_rs_chunk(txn, c),
        Command::UpdateRsHosts(c) => update_rs_hosts(txn, c),
        Command::UpdateStorageClass(c) => update_storage_class(txn, c),
        Command::CreateTsidCache(_) => create_tsid_cache(txn),
        Command::Checksum(_) | Command::VerifyChecksum(_) | Command::SetReadOnlyMode(_) => {
            unreachable!("handled before dispatch")
        }
    }
}

/// Sets the curator's registration if it hasn't been set; either way,
/// reports the current registration.
fn set_registration(txn: &mut WriteTxn, cmd: SetRegistrationCmd) -> Result<Response, StateError> {
    let id = match txn.curator_id()? {
        Some(existing) => existing,
        None => {
            txn.set_curator_id(cmd.id)?;
            cmd.id
        }
    };
    Ok(Response::SetRegistration { id })
}

fn add_partition(txn: &mut WriteTxn, id: PartitionId) -> Result<ErrorCode, StateError> {
    if txn.partition(id)?.is_some() {
        // Don't add a partition twice; the layer above chooses how to error.
        return Ok(ErrorCode::AlreadyExists);
    }
    txn.put_partition(&Partition::new(id))?;
    Ok(ErrorCode::NoError)
}

fn add_partition_cmd(txn: &mut WriteTxn, cmd: AddPartitionCmd) -> Result<Response, StateError> {
    Ok(Response::AddPartition { err: add_partition(txn, cmd.id)? })
}

/// Adds any partitions we don't have yet. Duplicates are expected here, so
/// their errors are deliberately dropped.
fn sync_partitions(txn: &mut WriteTxn, cmd: SyncPartitionsCmd) -> Result<Response, StateError> {
    for id in cmd.partitions {
        add_partition(txn, id)?;
    }
    Ok(Response::SyncPartitions { err: ErrorCode::NoError })
}

/// Creates a new blob in the lowest-id partition that still has key space.
fn create_blob(txn: &mut WriteTxn, cmd: CreateBlobCmd) -> Result<Response, StateError> {
    let candidate =
        txn.partitions()?.into_iter().find(|p| p.next_blob_key != MAX_BLOB_KEY);
    let Some(mut partition) = candidate else {
        // Not fatal: the curator should ask the master for another partition.
        return Ok(Response::CreateBlob { id: BlobId::ZERO, err: ErrorCode::GenBlobId });
    };

    let key = partition.next_blob_key;
    partition.next_blob_key += 1;
    txn.put_partition(&partition)?;

    let id = BlobId::from_parts(partition.id, key);
    let blob = Blob {
        repl: cmd.repl,
        hint: cmd.hint,
        mtime: cmd.initial_time,
        atime: cmd.initial_time,
        expires: cmd.expires,
        // Storage defaults to replicated.
        ..Blob::default()
    };
    txn.put_blob(id, &blob)?;
    Ok(Response::CreateBlob { id, err: ErrorCode::NoError })
}

fn delete_blob(txn: &mut WriteTxn, cmd: DeleteBlobCmd) -> Result<Response, StateError> {
    Ok(Response::DeleteBlob { err: txn.delete_blob(cmd.id, cmd.when)? })
}

fn undelete_blob(txn: &mut WriteTxn, cmd: UndeleteBlobCmd) -> Result<Response, StateError> {
    Ok(Response::UndeleteBlob { err: txn.undelete_blob(cmd.id)? })
}

fn finish_delete(txn: &mut WriteTxn, cmd: FinishDeleteCmd) -> Result<Response, StateError> {
    txn.finish_delete_blobs(&cmd.blobs)?;
    Ok(Response::FinishDelete { err: ErrorCode::NoError })
}

fn set_metadata(txn: &mut WriteTxn, cmd: SetMetadataCmd) -> Result<Response, StateError> {
    Ok(Response::SetMetadata { err: txn.set_blob_metadata(cmd.id, &cmd.metadata)? })
}

/// Appends tracts to a blob.
fn extend_blob(txn: &mut WriteTxn, cmd: ExtendBlobCmd) -> Result<Response, StateError> {
    let Some(mut blob) = txn.blob(cmd.id)? else {
        return Ok(Response::ExtendBlob { new_size: 0, err: ErrorCode::NoSuchBlob });
    };

    // The first new tract key must match the current tract count. A retried
    // extension that already landed sees the grown count and is refused.
    if cmd.first_tract_key as usize != blob.tracts.len() {
        return Ok(Response::ExtendBlob { new_size: 0, err: ErrorCode::ExtendConflict });
    }

    if cmd.hosts.iter().any(|hosts| hosts.len() != blob.repl as usize) {
        return Ok(Response::ExtendBlob { new_size: 0, err: ErrorCode::InvalidArgument });
    }

    for hosts in cmd.hosts {
        blob.tracts.push(Tract { hosts, version: 1 });
    }
    let new_size = blob.tracts.len() as u32;
    txn.put_blob(cmd.id, &blob)?;
    Ok(Response::ExtendBlob { new_size, err: ErrorCode::NoError })
}

/// Reconfigures one tract's replica group. Versions advance by exactly one
/// so that only a single reconfiguration can succeed per version.
fn change_tract(txn: &mut WriteTxn, cmd: ChangeTractCmd) -> Result<Response, StateError> {
    let fail = |err| Ok(Response::ChangeTract { info: None, err });

    let Some(mut blob) = txn.blob(cmd.id.blob)? else {
        return fail(ErrorCode::NoSuchBlob);
    };
    let Some(tract) = blob.tracts.get_mut(cmd.id.index as usize) else {
        return fail(ErrorCode::NoSuchTract);
    };
    if tract.hosts.len() != cmd.new_hosts.len() {
        tracing::error!(
            tract = %cmd.id,
            from = tract.hosts.len(),
            to = cmd.new_hosts.len(),
            "change-tract can't change the number of replicas"
        );
        return fail(ErrorCode::InvalidArgument);
    }
    if tract.version + 1 != cmd.new_version {
        tracing::error!(
            tract = %cmd.id,
            current = tract.version,
            proposed = cmd.new_version,
            "change-tract with a version that isn't current + 1"
        );
        return fail(ErrorCode::ConflictingState);
    }

    tract.version += 1;
    tract.hosts = cmd.new_hosts;
    let info = TractInfo { tract: cmd.id, version: tract.version, hosts: tract.hosts.clone() };
    txn.put_blob(cmd.id.blob, &blob)?;
    Ok(Response::ChangeTract { info: Some(info), err: ErrorCode::NoError })
}

fn update_times(txn: &mut WriteTxn, cmd: UpdateTimesCmd) -> Result<Response, StateError> {
    txn.batch_update_times(&cmd.updates)?;
    Ok(Response::UpdateTimes { err: ErrorCode::NoError })
}

/// Reserves `count` RS chunk ids from the lowest-id partition with room.
fn allocate_rs_chunk_ids(
    txn: &mut WriteTxn,
    cmd: AllocateRsChunkIdsCmd,
) -> Result<Response, StateError> {
    let candidate = txn
        .partitions()?
        .into_iter()
        .find(|p| p.next_rs_chunk_key + cmd.count as u64 <= MAX_RS_CHUNK_KEY);
    let Some(mut partition) = candidate else {
        return Ok(Response::AllocateRsChunkIds {
            id: RsChunkId::default(),
            err: ErrorCode::GenBlobId,
        });
    };

    // Chunk keys start at 1; 0 marks a partition that has never allocated.
    let mut key = partition.next_rs_chunk_key;
    if key == 0 {
        key = 1;
    }
    partition.next_rs_chunk_key = key + cmd.count as u64;
    txn.put_partition(&partition)?;

    Ok(Response::AllocateRsChunkIds {
        id: RsChunkId::from_parts(partition.id.as_rs(), key),
        err: ErrorCode::NoError,
    })
}

fn commit_rs_chunk(txn: &mut WriteTxn, cmd: CommitRsChunkCmd) -> Result<Response, StateError> {
    Ok(Response::CommitRsChunk {
        err: txn.put_rs_chunk(cmd.id, cmd.storage, cmd.hosts, cmd.data)?,
    })
}

fn update_rs_hosts(txn: &mut WriteTxn, cmd: UpdateRsHostsCmd) -> Result<Response, StateError> {
    Ok(Response::UpdateRsHosts { err: txn.update_rs_hosts(cmd.id, cmd.hosts)? })
}

fn update_storage_class(
    txn: &mut WriteTxn,
    cmd: UpdateStorageClassCmd,
) -> Result<Response, StateError> {
    Ok(Response::UpdateStorageClass { err: txn.update_storage_class(cmd.id, cmd.storage)? })
}

fn create_tsid_cache(txn: &mut WriteTxn) -> Result<Response, StateError> {
    txn.create_tsid_cache()?;
    Ok(Response::CreateTsidCache { err: ErrorCode::NoError })
}
