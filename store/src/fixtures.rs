//! Shared test data builders.

use bytes::Bytes;

use crate::compression::TAG_NONE;
use crate::hashing::HashAlgorithm;
use crate::index::{BlockIndex, ChunkHash, StoredBlock};

/// A block index with explicit chunk hashes and stored sizes. The block
/// hash is derived with blake3 unless `block_hash` is non-zero.
pub fn block_index(block_hash: u64, chunks: &[(ChunkHash, u32)]) -> BlockIndex {
    let chunk_hashes: Vec<u64> = chunks.iter().map(|(h, _)| *h).collect();
    let chunk_sizes: Vec<u32> = chunks.iter().map(|(_, s)| *s).collect();
    let block_hash = if block_hash != 0 {
        block_hash
    } else {
        BlockIndex::compute_block_hash(HashAlgorithm::Blake3, &chunk_hashes, &chunk_sizes, TAG_NONE)
    };
    BlockIndex {
        hash_identifier: HashAlgorithm::Blake3.identifier(),
        tag: TAG_NONE,
        block_hash,
        chunk_hashes,
        chunk_sizes,
    }
}

/// A complete uncompressed stored block over the given chunk contents,
/// with real blake3 chunk and block hashes.
pub fn stored_block_from_chunks(chunks: &[&[u8]]) -> StoredBlock {
    let algorithm = HashAlgorithm::Blake3;
    let chunk_hashes: Vec<u64> = chunks.iter().map(|c| algorithm.hash64(c)).collect();
    let chunk_sizes: Vec<u32> = chunks.iter().map(|c| c.len() as u32).collect();
    let block_hash =
        BlockIndex::compute_block_hash(algorithm, &chunk_hashes, &chunk_sizes, TAG_NONE);
    let mut payload = Vec::new();
    for chunk in chunks {
        payload.extend_from_slice(chunk);
    }
    StoredBlock {
        index: BlockIndex {
            hash_identifier: algorithm.identifier(),
            tag: TAG_NONE,
            block_hash,
            chunk_hashes,
            chunk_sizes,
        },
        payload: Bytes::from(payload),
    }
}
