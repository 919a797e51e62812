//! Table definitions for the redb-backed store.
//!
//! The store has exactly four tables (the spec's buckets). All composite
//! keys are byte arrays; encoding lives in the keys module. The meta table
//! uses short string keys.

use redb::TableDefinition;

/// Table definitions for curator state.
pub struct Tables;

impl Tables {
    /// Curator-wide singletons: curator id, applied log index, read-only
    /// flag, known-tractserver cache.
    pub const META: TableDefinition<'static, &'static str, &'static [u8]> =
        TableDefinition::new("meta");

    /// Partition allocation state: {partition_id:4BE} -> serialized Partition.
    pub const PARTITION: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("partition");

    /// Blob metadata: {partition_id:4BE}{blob_key:4BE} -> serialized Blob.
    pub const BLOB: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("blob");

    /// RS chunk records: {rs_partition_id:4BE}{chunk_key:8BE} -> serialized
    /// RsChunk.
    pub const RSCHUNK: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("rschunk");

    /// Meta key for the set-once curator id (u32 BE).
    pub const META_CURATOR_ID: &'static str = "curator_id";

    /// Meta key for the applied log index (u64 BE).
    pub const META_APPLIED_INDEX: &'static str = "applied_index";

    /// Meta key for the read-only-mode flag (single 0/1 byte).
    pub const META_READ_ONLY: &'static str = "read_only";

    /// Meta key for the known-tractserver cache (serialized sorted id list).
    /// Absent until the cache is explicitly created.
    pub const META_TSIDS: &'static str = "tsids";
}
