//! RS chunk lookups.
//!
//! Chunk piece reads arrive as pseudo tract ids: the 48-bit chunk key plus a
//! piece offset, reinterpreted through the tract id layout. Resolution finds
//! the chunk with the largest key at or below the probe and bounds-checks the
//! offset against the chunk's host vector; chunk keys are allocated in
//! strides wide enough that pieces never collide with the next chunk's base.

use redb::ReadableTable;
use snafu::ResultExt;

use curator_types::{RsChunk, StorageClass, TractId, TractPointer, TractserverId, RsChunkId};

use crate::keys::{decode_rschunk_key, encode_rschunk_key};
use crate::state::{CodecSnafu, StateError, StorageSnafu};

/// Resolves a pseudo tract id naming an RS chunk piece to the host storing
/// that piece. Returns `None` when no chunk in the probe's partition covers
/// the key, or when the offset lands past the chunk's host vector.
pub(crate) fn lookup_rs_piece_in(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    pseudo: TractId,
) -> Result<Option<TractserverId>, StateError> {
    let probe = pseudo.to_rs_chunk_id();
    if !probe.partition.is_rs() {
        return Ok(None);
    }

    // Largest chunk key <= probe, bounded to the probe's partition.
    let low = encode_rschunk_key(RsChunkId::from_parts(probe.partition, 0));
    let high = encode_rschunk_key(probe);
    let mut range = table
        .range(low.as_slice()..=high.as_slice())
        .context(StorageSnafu)?;
    let Some(item) = range.next_back() else {
        return Ok(None);
    };
    let (key, value) = item.context(StorageSnafu)?;
    let base = decode_rschunk_key(key.value())
        .ok_or(StateError::CorruptKey { table: "rschunk" })?;
    let chunk: RsChunk = curator_types::decode(value.value()).context(CodecSnafu)?;

    let piece = (probe.key - base.key) as usize;
    Ok(chunk.hosts.get(piece).copied())
}

/// Searches every data piece of `chunk` for `tract` and, if found, returns a
/// pointer naming the piece chunk id, the byte extent, the piece's host, and
/// the full host vector for reconstruction.
pub fn lookup_tract_in_chunk(
    chunk: &RsChunk,
    tract: TractId,
    base: RsChunkId,
    class: StorageClass,
) -> Option<TractPointer> {
    for (piece, data) in chunk.data.iter().enumerate() {
        for packed in &data.tracts {
            if packed.id == tract {
                return Some(TractPointer {
                    chunk: base.add(piece as u64),
                    offset: packed.offset,
                    length: packed.length,
                    tsid: chunk.hosts.get(piece).copied().unwrap_or_default(),
                    class,
                    base_chunk: base,
                    other_tsids: chunk.hosts.clone(),
                });
            }
        }
    }
    None
}
