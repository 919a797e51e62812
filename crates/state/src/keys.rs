//! Composite key encoding.
//!
//! Keys are big-endian fixed-width concatenations so that the store's native
//! byte ordering equals semantic ordering: partitions by id, blobs by
//! (partition, blob key), RS chunks by (partition, chunk key).

use curator_types::{BlobId, PartitionId, RsChunkId};

/// Encodes a partition table key.
pub fn encode_partition_key(id: PartitionId) -> [u8; 4] {
    id.raw().to_be_bytes()
}

/// Decodes a partition table key.
pub fn decode_partition_key(key: &[u8]) -> Option<PartitionId> {
    let raw: [u8; 4] = key.try_into().ok()?;
    Some(PartitionId::from_raw(u32::from_be_bytes(raw)))
}

/// Encodes a blob table key. The blob id's integer layout (partition high,
/// key low) makes this a plain big-endian u64.
pub fn encode_blob_key(id: BlobId) -> [u8; 8] {
    id.raw().to_be_bytes()
}

/// Decodes a blob table key.
pub fn decode_blob_key(key: &[u8]) -> Option<BlobId> {
    let raw: [u8; 8] = key.try_into().ok()?;
    Some(BlobId::from_raw(u64::from_be_bytes(raw)))
}

/// Encodes an rschunk table key.
pub fn encode_rschunk_key(id: RsChunkId) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&id.partition.raw().to_be_bytes());
    key[4..].copy_from_slice(&id.key.to_be_bytes());
    key
}

/// Decodes an rschunk table key.
pub fn decode_rschunk_key(key: &[u8]) -> Option<RsChunkId> {
    if key.len() != 12 {
        return None;
    }
    let partition = u32::from_be_bytes(key[..4].try_into().ok()?);
    let chunk_key = u64::from_be_bytes(key[4..].try_into().ok()?);
    Some(RsChunkId::from_parts(PartitionId::from_raw(partition), chunk_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_types::{MAX_PARTITION_NUMBER, MAX_RS_CHUNK_KEY};
    use proptest::prelude::*;

    #[test]
    fn partition_key_roundtrip() {
        let id = PartitionId::from_number(0x555).as_rs();
        assert_eq!(decode_partition_key(&encode_partition_key(id)), Some(id));
        assert_eq!(decode_partition_key(&[1, 2, 3]), None);
    }

    #[test]
    fn blob_key_roundtrip() {
        let id = BlobId::from_parts(PartitionId::from_number(3), 17);
        assert_eq!(decode_blob_key(&encode_blob_key(id)), Some(id));
        assert_eq!(decode_blob_key(&[0; 7]), None);
    }

    #[test]
    fn rschunk_key_roundtrip() {
        let id = RsChunkId::from_parts(PartitionId::from_raw(0x8000_0555), 5000);
        assert_eq!(decode_rschunk_key(&encode_rschunk_key(id)), Some(id));
        assert_eq!(decode_rschunk_key(&[0; 11]), None);
    }

    #[test]
    fn blob_keys_sort_by_partition_then_key() {
        let keys = [
            encode_blob_key(BlobId::from_parts(PartitionId::from_number(1), 1)),
            encode_blob_key(BlobId::from_parts(PartitionId::from_number(1), 2)),
            encode_blob_key(BlobId::from_parts(PartitionId::from_number(3), 1)),
            encode_blob_key(BlobId::from_parts(PartitionId::from_number(3), 2)),
        ];
        let mut sorted = keys;
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    proptest! {
        #[test]
        fn blob_key_order_matches_id_order(a in any::<u64>(), b in any::<u64>()) {
            let (a, b) = (BlobId::from_raw(a), BlobId::from_raw(b));
            prop_assert_eq!(
                encode_blob_key(a).cmp(&encode_blob_key(b)),
                a.cmp(&b)
            );
        }

        #[test]
        fn rschunk_key_order_matches_semantic_order(
            p1 in 0u32..=MAX_PARTITION_NUMBER, k1 in 0u64..=MAX_RS_CHUNK_KEY,
            p2 in 0u32..=MAX_PARTITION_NUMBER, k2 in 0u64..=MAX_RS_CHUNK_KEY,
        ) {
            let a = RsChunkId::from_parts(PartitionId::from_number(p1).as_rs(), k1);
            let b = RsChunkId::from_parts(PartitionId::from_number(p2).as_rs(), k2);
            prop_assert_eq!(
                encode_rschunk_key(a).cmp(&encode_rschunk_key(b)),
                (p1, k1).cmp(&(p2, k2))
            );
        }
    }
}
