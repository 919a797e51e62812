//! The durable state handle and its typed transactions.
//!
//! [`State`] wraps the store and hands out [`ReadOnlyTxn`] snapshots and
//! single-writer [`WriteTxn`]s. Every write transaction carries the log index
//! of the entry being applied; committing stamps that index into the meta
//! table in the same transaction, so the store and the consensus log can
//! never disagree about what has been applied.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use xxhash_rust::xxh64::Xxh64;

use curator_types::{
    decode, encode, Blob, BlobId, CodecError, CuratorId, ErrorCode, Partition, PartitionId,
    RsChunk, RsChunkData, RsChunkId, StorageClass, TimeUpdate, TractId, TractPointer,
    TractserverId,
};

use crate::engine::StorageEngine;
use crate::keys::{decode_blob_key, encode_blob_key, encode_partition_key, encode_rschunk_key};
use crate::rschunk;
use crate::tables::Tables;

/// State layer error types.
///
/// These are operational failures (store I/O, codec mismatches), not command
/// outcomes; command outcomes travel as [`ErrorCode`] values inside `Ok`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StateError {
    /// Underlying storage operation failed.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying redb storage error.
        source: redb::StorageError,
    },

    /// Table open failed.
    #[snafu(display("table error: {source}"))]
    Table {
        /// The underlying redb table error.
        source: redb::TableError,
    },

    /// Transaction begin failed.
    #[snafu(display("transaction error: {source}"))]
    Transaction {
        /// The underlying redb transaction error.
        source: redb::TransactionError,
    },

    /// Durable commit failed.
    #[snafu(display("commit error: {source}"))]
    Commit {
        /// The underlying redb commit error.
        source: redb::CommitError,
    },

    /// Database open failed.
    #[snafu(display("database error: {source}"))]
    Database {
        /// The underlying redb database error.
        source: redb::DatabaseError,
    },

    /// Record (de)serialization failed.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: CodecError,
    },

    /// A stored key does not decode to its expected fixed-width shape.
    #[snafu(display("corrupt key in {table} table"))]
    CorruptKey {
        /// Name of the table holding the bad key.
        table: &'static str,
    },

    /// A meta record does not decode to its expected fixed-width shape.
    #[snafu(display("corrupt meta record under key {key}"))]
    CorruptMeta {
        /// The meta key holding the bad record.
        key: &'static str,
    },

    /// The known-tractserver cache has not been created yet.
    #[snafu(display("tractserver id cache has not been created"))]
    TsidCacheMissing,
}

/// The durable state of one curator replica.
pub struct State {
    db: Arc<Database>,
}

impl State {
    /// Wraps an open database, creating the tables if they don't exist yet
    /// so that a fresh database reads as empty.
    pub fn new(db: Arc<Database>) -> Result<Self, StateError> {
        let txn = db.begin_write().context(TransactionSnafu)?;
        {
            txn.open_table(Tables::META).context(TableSnafu)?;
            txn.open_table(Tables::PARTITION).context(TableSnafu)?;
            txn.open_table(Tables::BLOB).context(TableSnafu)?;
            txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        }
        txn.commit().context(CommitSnafu)?;
        Ok(Self { db })
    }

    /// Opens or creates the state database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        Self::new(StorageEngine::open(path)?.db())
    }

    /// Creates a fresh in-memory state, for tests.
    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::new(StorageEngine::open_in_memory()?.db())
    }

    /// Begins a read-only transaction over a stable snapshot. Many may run
    /// concurrently with each other and with one writer; dropping the
    /// transaction (and any iterators it produced) releases the snapshot.
    pub fn read_only_txn(&self) -> Result<ReadOnlyTxn, StateError> {
        Ok(ReadOnlyTxn { txn: self.db.begin_read().context(TransactionSnafu)? })
    }

    /// Begins the write transaction for the log entry at `index`.
    ///
    /// If `index` is at or below the stored applied index, the entry is a
    /// crash-recovery replay: the transaction runs normally but commits with
    /// no effect on any table.
    pub fn write_txn(&self, index: u64) -> Result<WriteTxn, StateError> {
        let txn = self.db.begin_write().context(TransactionSnafu)?;
        let stored = {
            let meta = txn.open_table(Tables::META).context(TableSnafu)?;
            meta_index(&meta)?
        };
        Ok(WriteTxn { txn, index, replay: index <= stored })
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }
}

// ============================================================================
// Shared record accessors
// ============================================================================
//
// Read operations are identical on both transaction kinds; these helpers are
// generic over the table handle so each public method is a thin wrapper.

fn get_record<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<T>, StateError> {
    match table.get(key).context(StorageSnafu)? {
        Some(guard) => Ok(Some(decode(guard.value()).context(CodecSnafu)?)),
        None => Ok(None),
    }
}

fn get_blob_record(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    id: BlobId,
    include_deleted: bool,
) -> Result<Option<Blob>, StateError> {
    let blob: Option<Blob> = get_record(table, &encode_blob_key(id))?;
    Ok(blob.filter(|b| include_deleted || b.deleted.is_none()))
}

fn all_partitions(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<Vec<Partition>, StateError> {
    let mut out = Vec::new();
    for item in table.range::<&[u8]>(..).context(StorageSnafu)? {
        let (_, value) = item.context(StorageSnafu)?;
        out.push(decode(value.value()).context(CodecSnafu)?);
    }
    Ok(out)
}

fn meta_index(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<u64, StateError> {
    match meta.get(Tables::META_APPLIED_INDEX).context(StorageSnafu)? {
        Some(guard) => {
            let raw: [u8; 8] = guard
                .value()
                .try_into()
                .map_err(|_| StateError::CorruptMeta { key: Tables::META_APPLIED_INDEX })?;
            Ok(u64::from_be_bytes(raw))
        }
        None => Ok(0),
    }
}

fn meta_curator_id(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Option<CuratorId>, StateError> {
    match meta.get(Tables::META_CURATOR_ID).context(StorageSnafu)? {
        Some(guard) => {
            let raw: [u8; 4] = guard
                .value()
                .try_into()
                .map_err(|_| StateError::CorruptMeta { key: Tables::META_CURATOR_ID })?;
            Ok(Some(CuratorId::new(u32::from_be_bytes(raw))))
        }
        None => Ok(None),
    }
}

fn meta_read_only(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<bool, StateError> {
    match meta.get(Tables::META_READ_ONLY).context(StorageSnafu)? {
        Some(guard) => Ok(guard.value() == [1]),
        None => Ok(false),
    }
}

fn meta_known_tsids(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Vec<TractserverId>, StateError> {
    match meta.get(Tables::META_TSIDS).context(StorageSnafu)? {
        Some(guard) => decode(guard.value()).context(CodecSnafu),
        None => TsidCacheMissingSnafu.fail(),
    }
}

/// Folds up to `n` blob records starting at `start` into a 64-bit checksum
/// over raw key and value bytes. Returns the checksum and the id to continue
/// from, or [`BlobId::ZERO`] when the scan reached the end of the table.
fn checksum_blobs(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    start: BlobId,
    n: u64,
) -> Result<(u64, BlobId), StateError> {
    let start_key = encode_blob_key(start);
    let mut hasher = Xxh64::new(0);
    let mut hashed = 0u64;
    let mut next = BlobId::ZERO;
    for item in table.range(start_key.as_slice()..).context(StorageSnafu)? {
        let (key, value) = item.context(StorageSnafu)?;
        if hashed == n {
            next = decode_blob_key(key.value())
                .ok_or(StateError::CorruptKey { table: "blob" })?;
            break;
        }
        hasher.update(key.value());
        hasher.update(value.value());
        hashed += 1;
    }
    Ok((hasher.digest(), next))
}

fn collect_visible_blobs(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    start: BlobId,
) -> Result<Vec<(BlobId, Blob)>, StateError> {
    let start_key = encode_blob_key(start);
    let mut out = Vec::new();
    for item in table.range(start_key.as_slice()..).context(StorageSnafu)? {
        let (key, value) = item.context(StorageSnafu)?;
        let id = decode_blob_key(key.value())
            .ok_or(StateError::CorruptKey { table: "blob" })?;
        let blob: Blob = decode(value.value()).context(CodecSnafu)?;
        if blob.deleted.is_none() {
            out.push((id, blob));
        }
    }
    Ok(out)
}

// ============================================================================
// Read-only transactions
// ============================================================================

/// A read-only snapshot of curator state.
pub struct ReadOnlyTxn {
    txn: ReadTransaction,
}

impl ReadOnlyTxn {
    /// The applied log index as of this snapshot. 0 for a fresh state.
    pub fn index(&self) -> Result<u64, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_index(&meta)
    }

    /// The curator's registered id, if one has been set.
    pub fn curator_id(&self) -> Result<Option<CuratorId>, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_curator_id(&meta)
    }

    /// Whether the state machine is in read-only mode.
    pub fn read_only_mode(&self) -> Result<bool, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_read_only(&meta)
    }

    /// Looks up one partition.
    pub fn partition(&self, id: PartitionId) -> Result<Option<Partition>, StateError> {
        let table = self.txn.open_table(Tables::PARTITION).context(TableSnafu)?;
        get_record(&table, &encode_partition_key(id))
    }

    /// All partitions, ordered by id.
    pub fn partitions(&self) -> Result<Vec<Partition>, StateError> {
        let table = self.txn.open_table(Tables::PARTITION).context(TableSnafu)?;
        all_partitions(&table)
    }

    /// Looks up a blob. Soft-deleted blobs are invisible here.
    pub fn blob(&self, id: BlobId) -> Result<Option<Blob>, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        get_blob_record(&table, id, false)
    }

    /// Looks up a blob, soft-deleted or not.
    pub fn blob_all(&self, id: BlobId) -> Result<Option<Blob>, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        get_blob_record(&table, id, true)
    }

    /// Lazily iterates blobs in ascending (partition, blob key) order,
    /// starting at `start` (inclusive) and skipping soft-deleted records.
    pub fn iter_blobs(&self, start: BlobId) -> Result<BlobIter, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let range = table.range(encode_blob_key(start).as_slice()..).context(StorageSnafu)?;
        Ok(BlobIter { inner: IterInner::Snapshot(range) })
    }

    /// Looks up an RS chunk record.
    pub fn rs_chunk(&self, id: RsChunkId) -> Result<Option<RsChunk>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        get_record(&table, &encode_rschunk_key(id))
    }

    /// Resolves a pseudo tract id naming an RS chunk piece to the host
    /// storing that piece. Returns `None` if no chunk covers the key.
    pub fn lookup_rs_piece(&self, pseudo: TractId) -> Result<Option<TractserverId>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        rschunk::lookup_rs_piece_in(&table, pseudo)
    }

    /// Finds `tract` among the packed tracts of the chunk at `chunk_id`.
    pub fn lookup_tract_in_chunk(
        &self,
        chunk_id: RsChunkId,
        tract: TractId,
        class: StorageClass,
    ) -> Result<Option<TractPointer>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        let chunk: Option<RsChunk> = get_record(&table, &encode_rschunk_key(chunk_id))?;
        Ok(chunk.and_then(|c| rschunk::lookup_tract_in_chunk(&c, tract, chunk_id, class)))
    }

    /// The known-tractserver cache. Fails with
    /// [`StateError::TsidCacheMissing`] until the cache has been created.
    pub fn known_tsids(&self) -> Result<Vec<TractserverId>, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_known_tsids(&meta)
    }

    /// Checksums up to `n` blob records starting at `start`; see
    /// [`WriteTxn::checksum`] for the continuation contract.
    pub fn checksum(&self, start: BlobId, n: u64) -> Result<(u64, BlobId), StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        checksum_blobs(&table, start, n)
    }
}

// ============================================================================
// Write transactions
// ============================================================================

/// The single write transaction applying the log entry at one index.
///
/// Domain outcomes (missing blob, shape violations, version conflicts) are
/// returned as [`ErrorCode`] values; `Err` is reserved for store and codec
/// failures, which the apply engine treats as fatal.
pub struct WriteTxn {
    txn: WriteTransaction,
    index: u64,
    replay: bool,
}

impl WriteTxn {
    /// True when this transaction's index is at or below the stored applied
    /// index, i.e. the entry is being re-applied during recovery. A replay
    /// transaction commits with no effect.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// The applied log index currently stored (not yet including this
    /// transaction's own index).
    pub fn index(&self) -> Result<u64, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_index(&meta)
    }

    /// The curator's registered id, if one has been set.
    pub fn curator_id(&self) -> Result<Option<CuratorId>, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_curator_id(&meta)
    }

    /// Sets the curator id. The apply engine only calls this when the id is
    /// unset; the value never changes afterwards.
    pub fn set_curator_id(&mut self, id: CuratorId) -> Result<(), StateError> {
        let mut meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta.insert(Tables::META_CURATOR_ID, id.value().to_be_bytes().as_slice())
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Whether the state machine is in read-only mode.
    pub fn read_only_mode(&self) -> Result<bool, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_read_only(&meta)
    }

    /// Sets or clears read-only mode.
    pub fn set_read_only_mode(&mut self, read_only: bool) -> Result<(), StateError> {
        let mut meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta.insert(Tables::META_READ_ONLY, [u8::from(read_only)].as_slice())
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Looks up one partition.
    pub fn partition(&self, id: PartitionId) -> Result<Option<Partition>, StateError> {
        let table = self.txn.open_table(Tables::PARTITION).context(TableSnafu)?;
        get_record(&table, &encode_partition_key(id))
    }

    /// All partitions, ordered by id.
    pub fn partitions(&self) -> Result<Vec<Partition>, StateError> {
        let table = self.txn.open_table(Tables::PARTITION).context(TableSnafu)?;
        all_partitions(&table)
    }

    /// Inserts or replaces a partition record.
    pub fn put_partition(&mut self, partition: &Partition) -> Result<(), StateError> {
        let mut table = self.txn.open_table(Tables::PARTITION).context(TableSnafu)?;
        table
            .insert(
                encode_partition_key(partition.id).as_slice(),
                encode(partition).context(CodecSnafu)?.as_slice(),
            )
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Looks up a blob. Soft-deleted blobs are invisible here.
    pub fn blob(&self, id: BlobId) -> Result<Option<Blob>, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        get_blob_record(&table, id, false)
    }

    /// Looks up a blob, soft-deleted or not.
    pub fn blob_all(&self, id: BlobId) -> Result<Option<Blob>, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        get_blob_record(&table, id, true)
    }

    /// Iterates blobs as [`ReadOnlyTxn::iter_blobs`] does. On a write
    /// transaction the matching records are collected eagerly, so the
    /// iterator observes this transaction's own writes.
    pub fn iter_blobs(&self, start: BlobId) -> Result<BlobIter, StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let blobs = collect_visible_blobs(&table, start)?;
        Ok(BlobIter { inner: IterInner::Owned(blobs.into_iter()) })
    }

    /// Inserts or replaces a blob record, feeding any referenced hosts into
    /// the known-tractserver cache.
    pub fn put_blob(&mut self, id: BlobId, blob: &Blob) -> Result<(), StateError> {
        {
            let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
            table
                .insert(
                    encode_blob_key(id).as_slice(),
                    encode(blob).context(CodecSnafu)?.as_slice(),
                )
                .context(StorageSnafu)?;
        }
        let hosts: Vec<TractserverId> =
            blob.tracts.iter().flat_map(|t| t.hosts.iter().copied()).collect();
        self.extend_tsid_cache(&hosts)
    }

    /// Stamps a soft-delete timestamp on a blob. The record stays in place
    /// and invisible until undeleted or finish-deleted.
    pub fn delete_blob(&mut self, id: BlobId, when: i64) -> Result<ErrorCode, StateError> {
        let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let Some(mut blob) = get_blob_record(&table, id, false)? else {
            return Ok(ErrorCode::NoSuchBlob);
        };
        blob.deleted = Some(when);
        table
            .insert(encode_blob_key(id).as_slice(), encode(&blob).context(CodecSnafu)?.as_slice())
            .context(StorageSnafu)?;
        Ok(ErrorCode::NoError)
    }

    /// Clears a blob's soft-delete stamp. A no-op if the blob isn't deleted;
    /// an error if there is no such blob at all.
    pub fn undelete_blob(&mut self, id: BlobId) -> Result<ErrorCode, StateError> {
        let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let Some(mut blob) = get_blob_record(&table, id, true)? else {
            return Ok(ErrorCode::NoSuchBlob);
        };
        if blob.deleted.take().is_some() {
            table
                .insert(
                    encode_blob_key(id).as_slice(),
                    encode(&blob).context(CodecSnafu)?.as_slice(),
                )
                .context(StorageSnafu)?;
        }
        Ok(ErrorCode::NoError)
    }

    /// Permanently removes the listed blobs and purges their packed tracts
    /// from every RS chunk that mentions them.
    pub fn finish_delete_blobs(&mut self, ids: &[BlobId]) -> Result<(), StateError> {
        {
            let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
            for id in ids {
                table.remove(encode_blob_key(*id).as_slice()).context(StorageSnafu)?;
            }
        }

        // Back references from chunks to blobs are not indexed; purge by
        // scanning the whole chunk table within this same transaction.
        let mut table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        let mut updates = Vec::new();
        for item in table.range::<&[u8]>(..).context(StorageSnafu)? {
            let (key, value) = item.context(StorageSnafu)?;
            let mut chunk: RsChunk = decode(value.value()).context(CodecSnafu)?;
            let mut changed = false;
            for piece in &mut chunk.data {
                let before = piece.tracts.len();
                piece.tracts.retain(|t| !ids.contains(&t.id.blob));
                changed |= piece.tracts.len() != before;
            }
            if changed {
                updates.push((key.value().to_vec(), chunk));
            }
        }
        for (key, chunk) in updates {
            table
                .insert(key.as_slice(), encode(&chunk).context(CodecSnafu)?.as_slice())
                .context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Replaces a blob's opaque metadata.
    pub fn set_blob_metadata(&mut self, id: BlobId, metadata: &[u8]) -> Result<ErrorCode, StateError> {
        let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let Some(mut blob) = get_blob_record(&table, id, false)? else {
            return Ok(ErrorCode::NoSuchBlob);
        };
        blob.metadata = metadata.to_vec();
        table
            .insert(encode_blob_key(id).as_slice(), encode(&blob).context(CodecSnafu)?.as_slice())
            .context(StorageSnafu)?;
        Ok(ErrorCode::NoError)
    }

    /// Changes a blob's storage class.
    pub fn update_storage_class(
        &mut self,
        id: BlobId,
        class: StorageClass,
    ) -> Result<ErrorCode, StateError> {
        let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        let Some(mut blob) = get_blob_record(&table, id, false)? else {
            return Ok(ErrorCode::NoSuchBlob);
        };
        blob.storage = class;
        table
            .insert(encode_blob_key(id).as_slice(), encode(&blob).context(CodecSnafu)?.as_slice())
            .context(StorageSnafu)?;
        Ok(ErrorCode::NoError)
    }

    /// Applies a batch of mtime/atime updates. Times only move forward, a
    /// value of 0 leaves the field alone, and updates for blobs that don't
    /// exist are silently skipped.
    pub fn batch_update_times(&mut self, updates: &[TimeUpdate]) -> Result<(), StateError> {
        let mut table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        for update in updates {
            let Some(mut blob) = get_blob_record(&table, update.blob, false)? else {
                continue;
            };
            let mut changed = false;
            if update.mtime > blob.mtime {
                blob.mtime = update.mtime;
                changed = true;
            }
            if update.atime > blob.atime {
                blob.atime = update.atime;
                changed = true;
            }
            if changed {
                table
                    .insert(
                        encode_blob_key(update.blob).as_slice(),
                        encode(&blob).context(CodecSnafu)?.as_slice(),
                    )
                    .context(StorageSnafu)?;
            }
        }
        Ok(())
    }

    /// Looks up an RS chunk record.
    pub fn rs_chunk(&self, id: RsChunkId) -> Result<Option<RsChunk>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        get_record(&table, &encode_rschunk_key(id))
    }

    /// Resolves a pseudo tract id naming an RS chunk piece to the host
    /// storing that piece.
    pub fn lookup_rs_piece(&self, pseudo: TractId) -> Result<Option<TractserverId>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        rschunk::lookup_rs_piece_in(&table, pseudo)
    }

    /// Finds `tract` among the packed tracts of the chunk at `chunk_id`.
    pub fn lookup_tract_in_chunk(
        &self,
        chunk_id: RsChunkId,
        tract: TractId,
        class: StorageClass,
    ) -> Result<Option<TractPointer>, StateError> {
        let table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
        let chunk: Option<RsChunk> = get_record(&table, &encode_rschunk_key(chunk_id))?;
        Ok(chunk.and_then(|c| rschunk::lookup_tract_in_chunk(&c, tract, chunk_id, class)))
    }

    /// Writes an RS chunk record after validating its shape against the
    /// storage class: the chunk id must carry the RS partition tag, and both
    /// the host vector and the per-piece data list must have exactly n + m
    /// entries.
    pub fn put_rs_chunk(
        &mut self,
        id: RsChunkId,
        class: StorageClass,
        hosts: Vec<TractserverId>,
        data: Vec<RsChunkData>,
    ) -> Result<ErrorCode, StateError> {
        if !id.partition.is_rs() {
            return Ok(ErrorCode::InvalidArgument);
        }
        let Some(total) = class.total_pieces() else {
            return Ok(ErrorCode::InvalidArgument);
        };
        if hosts.len() != total || data.len() != total {
            return Ok(ErrorCode::InvalidArgument);
        }
        let chunk = RsChunk { hosts, data };
        {
            let mut table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
            table
                .insert(
                    encode_rschunk_key(id).as_slice(),
                    encode(&chunk).context(CodecSnafu)?.as_slice(),
                )
                .context(StorageSnafu)?;
        }
        self.extend_tsid_cache(&chunk.hosts)?;
        Ok(ErrorCode::NoError)
    }

    /// Replaces an RS chunk's host vector. The piece count can't change.
    pub fn update_rs_hosts(
        &mut self,
        id: RsChunkId,
        hosts: Vec<TractserverId>,
    ) -> Result<ErrorCode, StateError> {
        let chunk = {
            let mut table = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
            let existing: Option<RsChunk> = get_record(&table, &encode_rschunk_key(id))?;
            let Some(mut chunk) = existing else {
                return Ok(ErrorCode::NoSuchBlob);
            };
            if chunk.hosts.len() != hosts.len() {
                return Ok(ErrorCode::InvalidArgument);
            }
            chunk.hosts = hosts;
            table
                .insert(
                    encode_rschunk_key(id).as_slice(),
                    encode(&chunk).context(CodecSnafu)?.as_slice(),
                )
                .context(StorageSnafu)?;
            chunk
        };
        self.extend_tsid_cache(&chunk.hosts)?;
        Ok(ErrorCode::NoError)
    }

    /// The known-tractserver cache. Fails with
    /// [`StateError::TsidCacheMissing`] until the cache has been created.
    pub fn known_tsids(&self) -> Result<Vec<TractserverId>, StateError> {
        let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta_known_tsids(&meta)
    }

    /// Bootstraps the known-tractserver cache by scanning every blob and RS
    /// chunk once. Idempotent: a second call leaves the existing cache
    /// untouched. Once the cache exists, writes maintain it additively; ids
    /// are never removed.
    pub fn create_tsid_cache(&mut self) -> Result<(), StateError> {
        {
            let meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
            if meta.get(Tables::META_TSIDS).context(StorageSnafu)?.is_some() {
                return Ok(());
            }
        }

        let mut ids: Vec<TractserverId> = Vec::new();
        {
            let blobs = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
            for item in blobs.range::<&[u8]>(..).context(StorageSnafu)? {
                let (_, value) = item.context(StorageSnafu)?;
                let blob: Blob = decode(value.value()).context(CodecSnafu)?;
                for tract in &blob.tracts {
                    ids.extend(tract.hosts.iter().copied().filter(|h| h.is_valid()));
                }
            }
            let chunks = self.txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
            for item in chunks.range::<&[u8]>(..).context(StorageSnafu)? {
                let (_, value) = item.context(StorageSnafu)?;
                let chunk: RsChunk = decode(value.value()).context(CodecSnafu)?;
                ids.extend(chunk.hosts.iter().copied().filter(|h| h.is_valid()));
            }
        }
        ids.sort_unstable();
        ids.dedup();

        tracing::debug!(count = ids.len(), "created tractserver id cache");
        let mut meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        meta.insert(Tables::META_TSIDS, encode(&ids).context(CodecSnafu)?.as_slice())
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Checksums up to `n` blob records starting at `start`, returning the
    /// fold value and the id to continue the next probe from
    /// ([`BlobId::ZERO`] once the scan wraps).
    pub fn checksum(&self, start: BlobId, n: u64) -> Result<(u64, BlobId), StateError> {
        let table = self.txn.open_table(Tables::BLOB).context(TableSnafu)?;
        checksum_blobs(&table, start, n)
    }

    /// Adds hosts to the known-tractserver cache, if it exists. The cache
    /// only ever grows.
    fn extend_tsid_cache(&self, hosts: &[TractserverId]) -> Result<(), StateError> {
        let mut meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
        let mut ids: Vec<TractserverId> = match meta.get(Tables::META_TSIDS).context(StorageSnafu)? {
            Some(guard) => decode(guard.value()).context(CodecSnafu)?,
            None => return Ok(()),
        };
        let mut changed = false;
        for host in hosts {
            if !host.is_valid() {
                continue;
            }
            if let Err(pos) = ids.binary_search(host) {
                ids.insert(pos, *host);
                changed = true;
            }
        }
        if changed {
            meta.insert(Tables::META_TSIDS, encode(&ids).context(CodecSnafu)?.as_slice())
                .context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// For a normal transaction this stamps the applied index and durably
    /// commits every write. For a replay transaction it discards all writes,
    /// leaving the store exactly as it was.
    pub fn commit(self) -> Result<(), StateError> {
        if self.replay {
            self.txn.abort().context(StorageSnafu)?;
            return Ok(());
        }
        {
            let mut meta = self.txn.open_table(Tables::META).context(TableSnafu)?;
            meta.insert(Tables::META_APPLIED_INDEX, self.index.to_be_bytes().as_slice())
                .context(StorageSnafu)?;
        }
        self.txn.commit().context(CommitSnafu)
    }
}

// ============================================================================
// Blob iteration
// ============================================================================

/// Iterator over visible blobs in ascending id order.
///
/// Yielded from a read-only transaction it streams lazily from the snapshot;
/// from a write transaction it iterates an eagerly collected copy.
pub struct BlobIter {
    inner: IterInner,
}

enum IterInner {
    Snapshot(redb::Range<'static, &'static [u8], &'static [u8]>),
    Owned(std::vec::IntoIter<(BlobId, Blob)>),
}

impl Iterator for BlobIter {
    type Item = Result<(BlobId, Blob), StateError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IterInner::Snapshot(range) => loop {
                let item = range.next()?;
                let (key, value) = match item {
                    Ok(kv) => kv,
                    Err(source) => return Some(Err(StateError::Storage { source })),
                };
                let Some(id) = decode_blob_key(key.value()) else {
                    return Some(Err(StateError::CorruptKey { table: "blob" }));
                };
                let blob: Blob = match decode(value.value()) {
                    Ok(blob) => blob,
                    Err(source) => return Some(Err(StateError::Codec { source })),
                };
                if blob.deleted.is_some() {
                    continue;
                }
                return Some(Ok((id, blob)));
            },
            IterInner::Owned(iter) => iter.next().map(Ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_types::{PlacementHint, Tract};

    fn test_state() -> State {
        State::open_in_memory().expect("open in-memory state")
    }

    fn blob_id(partition: u32, key: u32) -> BlobId {
        BlobId::from_parts(PartitionId::from_number(partition), key)
    }

    fn repl_blob(hosts: &[&[u32]]) -> Blob {
        Blob {
            repl: 3,
            tracts: hosts
                .iter()
                .map(|h| Tract {
                    hosts: h.iter().copied().map(TractserverId::new).collect(),
                    version: 1,
                })
                .collect(),
            ..Blob::default()
        }
    }

    #[test]
    fn state_basics() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();

        txn.set_curator_id(CuratorId::new(2)).unwrap();
        assert_eq!(txn.curator_id().unwrap(), Some(CuratorId::new(2)));

        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(3))).unwrap();

        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(1, 2), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(3, 1), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(3, 2), &repl_blob(&[])).unwrap();

        let partitions = txn.partitions().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].id, PartitionId::from_number(1));
        assert_eq!(partitions[1].id, PartitionId::from_number(3));
        assert!(txn.partition(PartitionId::from_number(3)).unwrap().is_some());

        assert!(txn.blob(blob_id(1, 1)).unwrap().is_some());
        assert!(txn.blob(blob_id(1, 777)).unwrap().is_none());

        // Soft delete hides the blob from ordinary reads but not from
        // blob_all.
        assert_eq!(txn.delete_blob(blob_id(1, 1), 100).unwrap(), ErrorCode::NoError);
        assert!(txn.blob(blob_id(1, 1)).unwrap().is_none());
        assert!(txn.blob_all(blob_id(1, 1)).unwrap().is_some());

        // Finish-delete removes it entirely.
        txn.finish_delete_blobs(&[blob_id(1, 1)]).unwrap();
        assert!(txn.blob_all(blob_id(1, 1)).unwrap().is_none());

        txn.commit().unwrap();
    }

    #[test]
    fn delete_blob_edge_cases() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();

        // Deleting a missing blob fails.
        assert_eq!(txn.delete_blob(blob_id(1, 9), 5).unwrap(), ErrorCode::NoSuchBlob);
        // Deleting twice fails the second time: the deleted record is no
        // longer visible to the guarding lookup.
        assert_eq!(txn.delete_blob(blob_id(1, 1), 5).unwrap(), ErrorCode::NoError);
        assert_eq!(txn.delete_blob(blob_id(1, 1), 6).unwrap(), ErrorCode::NoSuchBlob);

        // Undelete restores visibility and is a no-op on live blobs.
        assert_eq!(txn.undelete_blob(blob_id(1, 1)).unwrap(), ErrorCode::NoError);
        assert!(txn.blob(blob_id(1, 1)).unwrap().is_some());
        assert_eq!(txn.undelete_blob(blob_id(1, 1)).unwrap(), ErrorCode::NoError);
        assert_eq!(txn.undelete_blob(blob_id(1, 9)).unwrap(), ErrorCode::NoSuchBlob);
        txn.commit().unwrap();
    }

    #[test]
    fn blob_iterator_order() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(3))).unwrap();

        // Insert out of order; iteration must come back sorted.
        txn.put_blob(blob_id(3, 2), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(3, 1), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();
        txn.put_blob(blob_id(1, 2), &repl_blob(&[])).unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let ids: Vec<BlobId> = rtx
            .iter_blobs(BlobId::ZERO)
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(ids, vec![blob_id(1, 1), blob_id(1, 2), blob_id(3, 1), blob_id(3, 2)]);
    }

    #[test]
    fn blob_iterator_skips_soft_deleted_and_honors_start() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        for key in 1..=4 {
            txn.put_blob(blob_id(1, key), &repl_blob(&[])).unwrap();
        }
        assert_eq!(txn.delete_blob(blob_id(1, 2), 7).unwrap(), ErrorCode::NoError);
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let ids: Vec<BlobId> = rtx
            .iter_blobs(blob_id(1, 2))
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(ids, vec![blob_id(1, 3), blob_id(1, 4)]);
    }

    #[test]
    fn read_write_isolation() {
        let state = test_state();
        let mut wtx = state.write_txn(1).unwrap();
        wtx.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        wtx.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();

        // A reader that starts before the writer commits sees nothing.
        let rtx = state.read_only_txn().unwrap();
        assert!(rtx.partition(PartitionId::from_number(1)).unwrap().is_none());
        assert!(rtx.blob(blob_id(1, 1)).unwrap().is_none());
        assert_eq!(rtx.index().unwrap(), 0);

        wtx.commit().unwrap();
        drop(rtx);

        // A reader that starts after sees everything.
        let rtx = state.read_only_txn().unwrap();
        assert!(rtx.partition(PartitionId::from_number(1)).unwrap().is_some());
        assert!(rtx.blob(blob_id(1, 1)).unwrap().is_some());
        assert_eq!(rtx.index().unwrap(), 1);
    }

    #[test]
    fn multiple_write_txns() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.commit().unwrap();

        let mut txn = state.write_txn(2).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        assert!(rtx.partition(PartitionId::from_number(1)).unwrap().is_some());
        assert!(rtx.blob(blob_id(1, 1)).unwrap().is_some());
        assert_eq!(rtx.index().unwrap(), 2);
    }

    #[test]
    fn replayed_write_txn_has_no_effect() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.commit().unwrap();

        // Index 1 is already applied; this transaction must change nothing.
        let mut txn = state.write_txn(1).unwrap();
        assert!(txn.is_replay());
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        assert!(rtx.blob(blob_id(1, 1)).unwrap().is_none());
        assert_eq!(rtx.index().unwrap(), 1);
    }

    #[test]
    fn batch_update_times() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(3))).unwrap();
        let blob = Blob { repl: 3, mtime: 200, atime: 200, ..Blob::default() };
        txn.put_blob(blob_id(3, 1), &blob).unwrap();
        txn.put_blob(blob_id(3, 2), &blob).unwrap();
        txn.commit().unwrap();

        let mut txn = state.write_txn(2).unwrap();
        txn.batch_update_times(&[
            TimeUpdate { blob: blob_id(3, 1), mtime: 300, atime: 0 },
            TimeUpdate { blob: blob_id(3, 2), mtime: 400, atime: 0 },
            TimeUpdate { blob: blob_id(3, 2), mtime: 300, atime: 450 },
            // Doesn't exist; silently skipped.
            TimeUpdate { blob: blob_id(3, 3), mtime: 100, atime: 100 },
        ])
        .unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let b1 = rtx.blob(blob_id(3, 1)).unwrap().unwrap();
        assert_eq!((b1.mtime, b1.atime), (300, 200));
        let b2 = rtx.blob(blob_id(3, 2)).unwrap().unwrap();
        assert_eq!((b2.mtime, b2.atime), (400, 450));
    }

    #[test]
    fn metadata_and_storage_class_updates() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();

        assert_eq!(txn.set_blob_metadata(blob_id(1, 1), b"tag").unwrap(), ErrorCode::NoError);
        assert_eq!(
            txn.set_blob_metadata(blob_id(1, 2), b"tag").unwrap(),
            ErrorCode::NoSuchBlob
        );
        assert_eq!(
            txn.update_storage_class(blob_id(1, 1), StorageClass::Rs63).unwrap(),
            ErrorCode::NoError
        );
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let blob = rtx.blob(blob_id(1, 1)).unwrap().unwrap();
        assert_eq!(blob.metadata, b"tag");
        assert_eq!(blob.storage, StorageClass::Rs63);
    }

    #[test]
    fn known_tsids_cache() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[&[1, 5, 7]])).unwrap();
        txn.commit().unwrap();

        let mut txn = state.write_txn(2).unwrap();
        txn.put_blob(blob_id(1, 2), &repl_blob(&[&[5, 7, 9]])).unwrap();
        txn.commit().unwrap();

        // Not created yet.
        let rtx = state.read_only_txn().unwrap();
        assert!(matches!(rtx.known_tsids(), Err(StateError::TsidCacheMissing)));
        drop(rtx);

        let mut txn = state.write_txn(3).unwrap();
        txn.create_tsid_cache().unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let ids: Vec<u32> = rtx.known_tsids().unwrap().iter().map(|id| id.value()).collect();
        assert_eq!(ids, vec![1, 5, 7, 9]);
        drop(rtx);

        // Later writes extend the cache; rewriting a blob never shrinks it.
        let mut txn = state.write_txn(4).unwrap();
        txn.put_blob(blob_id(1, 2), &repl_blob(&[&[11, 17, 9]])).unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let ids: Vec<u32> = rtx.known_tsids().unwrap().iter().map(|id| id.value()).collect();
        assert_eq!(ids, vec![1, 5, 7, 9, 11, 17]);
    }

    #[test]
    fn create_tsid_cache_is_idempotent_and_covers_chunks() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(5))).unwrap();
        txn.put_blob(blob_id(5, 1), &repl_blob(&[&[2, 4, 6]])).unwrap();
        let cid = RsChunkId::from_parts(PartitionId::from_number(5).as_rs(), 1);
        assert_eq!(
            txn.put_rs_chunk(
                cid,
                StorageClass::Rs63,
                (21..=29).map(TractserverId::new).collect(),
                vec![RsChunkData::default(); 9],
            )
            .unwrap(),
            ErrorCode::NoError
        );
        txn.create_tsid_cache().unwrap();
        // Second creation doesn't rescan or clobber.
        txn.create_tsid_cache().unwrap();
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let ids: Vec<u32> = rtx.known_tsids().unwrap().iter().map(|id| id.value()).collect();
        assert_eq!(ids, vec![2, 4, 6, 21, 22, 23, 24, 25, 26, 27, 28, 29]);
    }

    #[test]
    fn checksum_is_deterministic_across_states() {
        let build = || {
            let state = State::open_in_memory().unwrap();
            let mut txn = state.write_txn(1).unwrap();
            txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
            txn.put_blob(blob_id(1, 1), &repl_blob(&[&[4, 5, 6]])).unwrap();
            txn.put_blob(blob_id(1, 2), &repl_blob(&[&[7, 8, 9]])).unwrap();
            txn.commit().unwrap();
            state
        };
        let (a, b) = (build(), build());
        let ca = a.read_only_txn().unwrap().checksum(BlobId::ZERO, u64::MAX).unwrap();
        let cb = b.read_only_txn().unwrap().checksum(BlobId::ZERO, u64::MAX).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(ca.1, BlobId::ZERO);
    }

    #[test]
    fn checksum_returns_continuation() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        for key in 1..=3 {
            txn.put_blob(blob_id(1, key), &repl_blob(&[])).unwrap();
        }
        txn.commit().unwrap();

        let rtx = state.read_only_txn().unwrap();
        let (_, next) = rtx.checksum(BlobId::ZERO, 2).unwrap();
        assert_eq!(next, blob_id(1, 3));
        // Continuing from there exhausts the table.
        let (_, next) = rtx.checksum(next, 2).unwrap();
        assert_eq!(next, BlobId::ZERO);
    }

    #[test]
    fn checksum_differs_when_state_differs() {
        let state = test_state();
        let mut txn = state.write_txn(1).unwrap();
        txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
        txn.put_blob(blob_id(1, 1), &repl_blob(&[])).unwrap();
        txn.commit().unwrap();
        let (before, _) =
            state.read_only_txn().unwrap().checksum(BlobId::ZERO, u64::MAX).unwrap();

        let mut txn = state.write_txn(2).unwrap();
        txn.put_blob(blob_id(1, 2), &repl_blob(&[])).unwrap();
        txn.commit().unwrap();
        let (after, _) =
            state.read_only_txn().unwrap().checksum(BlobId::ZERO, u64::MAX).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn file_backed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let state = State::open(&path).unwrap();
            let mut txn = state.write_txn(1).unwrap();
            txn.put_partition(&Partition::new(PartitionId::from_number(1))).unwrap();
            txn.put_blob(
                blob_id(1, 1),
                &Blob {
                    repl: 3,
                    hint: PlacementHint::SpreadRacks,
                    mtime: 42,
                    ..Blob::default()
                },
            )
            .unwrap();
            txn.commit().unwrap();
        }
        let state = State::open(&path).unwrap();
        let rtx = state.read_only_txn().unwrap();
        assert_eq!(rtx.index().unwrap(), 1);
        let blob = rtx.blob(blob_id(1, 1)).unwrap().unwrap();
        assert_eq!(blob.hint, PlacementHint::SpreadRacks);
        assert_eq!(blob.mtime, 42);
    }
}
