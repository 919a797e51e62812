//! Full-state snapshot images.
//!
//! A snapshot is the logical byte image of the whole store at some applied
//! index: every table's contents in key order, encoded with the record codec.
//! The consensus layer ships these between replicas; restoring replaces the
//! store's contents atomically in a single transaction.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use curator_types::{decode, encode};

use crate::state::{
    CodecSnafu, CommitSnafu, State, StateError, StorageSnafu, TableSnafu, TransactionSnafu,
};
use crate::tables::Tables;

/// Serialized contents of every table, in key order.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    meta: Vec<(String, Vec<u8>)>,
    partitions: Vec<(Vec<u8>, Vec<u8>)>,
    blobs: Vec<(Vec<u8>, Vec<u8>)>,
    rschunks: Vec<(Vec<u8>, Vec<u8>)>,
}

fn dump_bytes_table(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
    let mut out = Vec::new();
    for item in table.range::<&[u8]>(..).context(StorageSnafu)? {
        let (key, value) = item.context(StorageSnafu)?;
        out.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(out)
}

impl State {
    /// Serializes the entire store as of a fresh read snapshot.
    pub fn snapshot_image(&self) -> Result<Vec<u8>, StateError> {
        let txn = self.db().begin_read().context(TransactionSnafu)?;

        let meta = {
            let table = txn.open_table(Tables::META).context(TableSnafu)?;
            let mut out = Vec::new();
            for item in table.range::<&str>(..).context(StorageSnafu)? {
                let (key, value) = item.context(StorageSnafu)?;
                out.push((key.value().to_string(), value.value().to_vec()));
            }
            out
        };
        let partitions = {
            let table = txn.open_table(Tables::PARTITION).context(TableSnafu)?;
            dump_bytes_table(&table)?
        };
        let blobs = {
            let table = txn.open_table(Tables::BLOB).context(TableSnafu)?;
            dump_bytes_table(&table)?
        };
        let rschunks = {
            let table = txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
            dump_bytes_table(&table)?
        };

        encode(&SnapshotImage { meta, partitions, blobs, rschunks }).context(CodecSnafu)
    }

    /// Replaces the store's contents with a snapshot image, atomically.
    /// The image carries the applied index it was taken at, so no separate
    /// index bookkeeping is needed.
    pub fn restore_image(&self, image: &[u8]) -> Result<(), StateError> {
        let image: SnapshotImage = decode(image).context(CodecSnafu)?;

        let txn = self.db().begin_write().context(TransactionSnafu)?;
        {
            // Dropping and reopening a table is the cheapest full clear.
            txn.delete_table(Tables::META).context(TableSnafu)?;
            txn.delete_table(Tables::PARTITION).context(TableSnafu)?;
            txn.delete_table(Tables::BLOB).context(TableSnafu)?;
            txn.delete_table(Tables::RSCHUNK).context(TableSnafu)?;

            let mut meta = txn.open_table(Tables::META).context(TableSnafu)?;
            for (key, value) in &image.meta {
                meta.insert(key.as_str(), value.as_slice()).context(StorageSnafu)?;
            }
            let mut partitions = txn.open_table(Tables::PARTITION).context(TableSnafu)?;
            for (key, value) in &image.partitions {
                partitions.insert(key.as_slice(), value.as_slice()).context(StorageSnafu)?;
            }
            let mut blobs = txn.open_table(Tables::BLOB).context(TableSnafu)?;
            for (key, value) in &image.blobs {
                blobs.insert(key.as_slice(), value.as_slice()).context(StorageSnafu)?;
            }
            let mut rschunks = txn.open_table(Tables::RSCHUNK).context(TableSnafu)?;
            for (key, value) in &image.rschunks {
                rschunks.insert(key.as_slice(), value.as_slice()).context(StorageSnafu)?;
            }
        }
        txn.commit().context(CommitSnafu)
    }
}
