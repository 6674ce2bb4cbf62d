//! Block and store indexes, their merge semantics, and the byte-exact
//! binary codecs used on the wire and inside blob headers.
//!
//! All integers are little-endian fixed width. Decoders reject truncated
//! input and trailing bytes as [Error::Corruption].

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};

use crate::hashing::HashAlgorithm;
use crate::Error;

/// Identity of a block: active hash over its chunk composition.
pub type BlockHash = u64;
/// Identity of a chunk: active hash over its uncompressed content.
pub type ChunkHash = u64;

pub const STORE_INDEX_VERSION: u8 = 1;

/// Blob key of the authoritative store index (partial-index protocol).
pub const STORE_INDEX_KEY: &str = "store.lsi";
/// Blob key of the legacy content index (generation-CAS protocol).
pub const CONTENT_INDEX_KEY: &str = "store.lci";
/// Prefix under which partial store indexes are published.
pub const PARTIAL_INDEX_PREFIX: &str = "index/";
pub const PARTIAL_INDEX_EXTENSION: &str = ".lsi";

/// Metadata of one block: the chunks it packs and the codec tag its
/// payload was packed with. `chunk_hashes` and `chunk_sizes` are parallel
/// arrays; sizes are stored (post-codec) sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash_identifier: u32,
    pub tag: u32,
    pub block_hash: BlockHash,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

impl BlockIndex {
    /// Derive the block hash from the chunk composition: active hash over
    /// `le64(chunk_hashes) ‖ le32(chunk_sizes) ‖ le32(tag)`, truncated to
    /// 64 bits. Same chunks and tag always give the same block hash.
    pub fn compute_block_hash(
        algorithm: HashAlgorithm,
        chunk_hashes: &[ChunkHash],
        chunk_sizes: &[u32],
        tag: u32,
    ) -> BlockHash {
        let mut buf = Vec::with_capacity(chunk_hashes.len() * 8 + chunk_sizes.len() * 4 + 4);
        for h in chunk_hashes {
            buf.extend_from_slice(&h.to_le_bytes());
        }
        for s in chunk_sizes {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf.extend_from_slice(&tag.to_le_bytes());
        algorithm.hash64(&buf)
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    /// Total payload length, the sum of the stored chunk sizes.
    pub fn payload_len(&self) -> usize {
        self.chunk_sizes.iter().map(|s| *s as usize).sum()
    }

    pub fn encoded_len(&self) -> usize {
        4 + 4 + 8 + 4 + self.chunk_hashes.len() * 8 + self.chunk_sizes.len() * 4
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.hash_identifier);
        buf.put_u32_le(self.tag);
        buf.put_u64_le(self.block_hash);
        buf.put_u32_le(self.chunk_count());
        for h in &self.chunk_hashes {
            buf.put_u64_le(*h);
        }
        for s in &self.chunk_sizes {
            buf.put_u32_le(*s);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one block index, advancing `buf` past it.
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 20 {
            return Err(Error::Corruption("truncated block index header".to_string()));
        }
        let hash_identifier = buf.get_u32_le();
        let tag = buf.get_u32_le();
        let block_hash = buf.get_u64_le();
        let chunk_count = buf.get_u32_le() as usize;
        if buf.remaining() < chunk_count * 12 {
            return Err(Error::Corruption(format!(
                "truncated block index: {} chunks announced, {} bytes left",
                chunk_count,
                buf.remaining()
            )));
        }
        let mut chunk_hashes = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            chunk_hashes.push(buf.get_u64_le());
        }
        let mut chunk_sizes = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            chunk_sizes.push(buf.get_u32_le());
        }
        Ok(BlockIndex {
            hash_identifier,
            tag,
            block_hash,
            chunk_hashes,
            chunk_sizes,
        })
    }
}

/// A block index plus its opaque payload: the concatenation, in
/// `chunk_hashes` order, of each chunk's stored bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub index: BlockIndex,
    pub payload: Bytes,
}

impl StoredBlock {
    pub fn block_hash(&self) -> BlockHash {
        self.index.block_hash
    }

    pub fn encoded_len(&self) -> usize {
        self.index.encoded_len() + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.index.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, Error> {
        let mut buf = data.clone();
        let index = BlockIndex::decode_from(&mut buf)?;
        if buf.remaining() != index.payload_len() {
            return Err(Error::Corruption(format!(
                "block payload length mismatch: expected {}, got {}",
                index.payload_len(),
                buf.remaining()
            )));
        }
        let payload = data.slice(data.len() - buf.remaining()..);
        Ok(StoredBlock { index, payload })
    }

    /// Byte range of one chunk inside the payload, by position.
    pub fn chunk_range(&self, position: usize) -> Option<std::ops::Range<usize>> {
        if position >= self.index.chunk_sizes.len() {
            return None;
        }
        let start: usize = self.index.chunk_sizes[..position]
            .iter()
            .map(|s| *s as usize)
            .sum();
        let len = self.index.chunk_sizes[position] as usize;
        Some(start..start + len)
    }
}

/// The set of known block indexes, keyed by block hash.
///
/// Duplicate block hashes merge idempotently (last observed wins; by the
/// block-hash derivation they must describe the same chunks and tag).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreIndex {
    hash_identifier: u32,
    blocks: BTreeMap<BlockHash, BlockIndex>,
}

impl StoreIndex {
    /// An empty index with no hash identifier yet; the identifier is
    /// adopted from the first merged block or index.
    pub fn empty() -> Self {
        StoreIndex::default()
    }

    pub fn new(hash_identifier: u32) -> Self {
        StoreIndex {
            hash_identifier,
            blocks: BTreeMap::new(),
        }
    }

    pub fn hash_identifier(&self) -> u32 {
        self.hash_identifier
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block hashes in ascending order.
    pub fn block_hashes(&self) -> impl Iterator<Item = BlockHash> + '_ {
        self.blocks.keys().copied()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockIndex> {
        self.blocks.values()
    }

    pub fn get_block(&self, block_hash: BlockHash) -> Option<&BlockIndex> {
        self.blocks.get(&block_hash)
    }

    pub fn contains_block(&self, block_hash: BlockHash) -> bool {
        self.blocks.contains_key(&block_hash)
    }

    pub fn contains_chunk(&self, chunk_hash: ChunkHash) -> bool {
        self.blocks
            .values()
            .any(|b| b.chunk_hashes.contains(&chunk_hash))
    }

    /// Lookup table from chunk hash to the block that stores it. When a
    /// chunk appears in several blocks any one of them serves.
    pub fn chunk_to_block(&self) -> HashMap<ChunkHash, BlockHash> {
        let mut map = HashMap::new();
        for block in self.blocks.values() {
            for chunk in &block.chunk_hashes {
                map.entry(*chunk).or_insert(block.block_hash);
            }
        }
        map
    }

    pub fn add_block(&mut self, block: BlockIndex) -> Result<(), Error> {
        if self.hash_identifier == 0 {
            self.hash_identifier = block.hash_identifier;
        } else if block.hash_identifier != self.hash_identifier {
            return Err(Error::Fatal(format!(
                "hash identifier mismatch: store 0x{:08x}, block 0x{:08x}",
                self.hash_identifier, block.hash_identifier
            )));
        }
        self.blocks.insert(block.block_hash, block);
        Ok(())
    }

    /// Merge all of `other` into `self`. Identity on empty input,
    /// associative, idempotent per block hash.
    pub fn merge_from(&mut self, other: &StoreIndex) -> Result<(), Error> {
        for block in other.blocks.values() {
            self.add_block(block.clone())?;
        }
        Ok(())
    }

    pub fn merge(a: &StoreIndex, b: &StoreIndex) -> Result<StoreIndex, Error> {
        let mut merged = a.clone();
        merged.merge_from(b)?;
        Ok(merged)
    }

    /// Content-addressed name of this index as a partial:
    /// `index/<sha1 of the sorted LE-packed block-hash set>.lsi`. Two
    /// indexes with the same block-hash set share a name regardless of
    /// insertion order.
    pub fn partial_name(&self) -> String {
        let mut hasher = Sha1::new();
        for hash in self.blocks.keys() {
            hasher.update(hash.to_le_bytes());
        }
        let digest = hasher.finalize();
        format!(
            "{}{}{}",
            PARTIAL_INDEX_PREFIX,
            HEXLOWER.encode(&digest),
            PARTIAL_INDEX_EXTENSION
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            9 + self
                .blocks
                .values()
                .map(|b| b.encoded_len())
                .sum::<usize>(),
        );
        buf.put_u8(STORE_INDEX_VERSION);
        buf.put_u32_le(self.hash_identifier);
        buf.put_u32_le(self.blocks.len() as u32);
        for block in self.blocks.values() {
            block.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut buf = data;
        if buf.remaining() < 9 {
            return Err(Error::Corruption("truncated store index header".to_string()));
        }
        let version = buf.get_u8();
        if version != STORE_INDEX_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported store index version {}",
                version
            )));
        }
        let hash_identifier = buf.get_u32_le();
        let block_count = buf.get_u32_le() as usize;
        let mut index = StoreIndex::new(hash_identifier);
        for _ in 0..block_count {
            let block = BlockIndex::decode_from(&mut buf)?;
            index.add_block(block)?;
        }
        if buf.has_remaining() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after store index",
                buf.remaining()
            )));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::fixtures::{block_index, stored_block_from_chunks};

    #[test]
    fn block_index_codec_round_trips_byte_exact() {
        let bi = block_index(0x4711, &[(0x0123, 10), (0xfedc_ba98_7654_3210, 20)]);
        let encoded = bi.encode();
        assert_eq!(encoded.len(), bi.encoded_len());
        let decoded = BlockIndex::decode_from(&mut encoded.clone()).unwrap();
        assert_eq!(decoded, bi);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn block_index_layout_is_fixed() {
        let bi = BlockIndex {
            hash_identifier: 0x0102_0304,
            tag: 0x0506_0708,
            block_hash: 0x1122_3344_5566_7788,
            chunk_hashes: vec![0xaa],
            chunk_sizes: vec![3],
        };
        let encoded = bi.encode();
        // u32 id ‖ u32 tag ‖ u64 block_hash ‖ u32 count ‖ hashes ‖ sizes
        assert_eq!(&encoded[0..4], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &0x0506_0708u32.to_le_bytes());
        assert_eq!(&encoded[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&encoded[16..20], &1u32.to_le_bytes());
        assert_eq!(&encoded[20..28], &0xaau64.to_le_bytes());
        assert_eq!(&encoded[28..32], &3u32.to_le_bytes());
    }

    #[rstest]
    #[case::empty_payload(&[])]
    #[case::one_chunk(&[&b"0123456789"[..]])]
    #[case::two_chunks(&[&b"0123456789"[..], &b"01234567890123456789"[..]])]
    fn stored_block_codec_round_trips(#[case] chunks: &[&[u8]]) {
        let block = stored_block_from_chunks(chunks);
        let encoded = block.encode();
        let decoded = StoredBlock::decode(encoded).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn stored_block_rejects_truncated_and_padded_payloads() {
        let block = stored_block_from_chunks(&[b"0123456789"]);
        let encoded = block.encode();
        assert!(matches!(
            StoredBlock::decode(encoded.slice(..encoded.len() - 1)),
            Err(Error::Corruption(_))
        ));
        let mut padded = BytesMut::from(&encoded[..]);
        padded.put_u8(0);
        assert!(matches!(
            StoredBlock::decode(padded.freeze()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn chunk_ranges_tile_the_payload() {
        let block = stored_block_from_chunks(&[b"aaa", b"bbbbb", b"c"]);
        assert_eq!(block.chunk_range(0), Some(0..3));
        assert_eq!(block.chunk_range(1), Some(3..8));
        assert_eq!(block.chunk_range(2), Some(8..9));
        assert_eq!(block.chunk_range(3), None);
    }

    #[test]
    fn store_index_codec_preserves_blocks() {
        let mut index = StoreIndex::empty();
        index
            .add_block(block_index(2, &[(0xb, 5), (0xc, 6)]))
            .unwrap();
        index.add_block(block_index(1, &[(0xa, 4)])).unwrap();
        let decoded = StoreIndex::decode(&index.encode()).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(
            decoded.block_hashes().collect::<Vec<_>>(),
            vec![1u64, 2u64]
        );
    }

    #[test]
    fn store_index_rejects_trailing_bytes() {
        let index = StoreIndex::empty();
        let mut data = index.encode().to_vec();
        data.push(0);
        assert!(matches!(
            StoreIndex::decode(&data),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn merge_identity_and_associativity() {
        let mut a = StoreIndex::empty();
        a.add_block(block_index(1, &[(0xa, 4)])).unwrap();
        let mut b = StoreIndex::empty();
        b.add_block(block_index(2, &[(0xb, 5)])).unwrap();
        let mut c = StoreIndex::empty();
        c.add_block(block_index(3, &[(0xc, 6)])).unwrap();

        let empty = StoreIndex::empty();
        assert_eq!(StoreIndex::merge(&a, &empty).unwrap(), a);
        assert_eq!(StoreIndex::merge(&empty, &a).unwrap(), a);

        let left = StoreIndex::merge(&StoreIndex::merge(&a, &b).unwrap(), &c).unwrap();
        let right = StoreIndex::merge(&a, &StoreIndex::merge(&b, &c).unwrap()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn merge_is_idempotent_per_block_hash() {
        let mut a = StoreIndex::empty();
        a.add_block(block_index(1, &[(0xa, 4)])).unwrap();
        let merged = StoreIndex::merge(&a, &a).unwrap();
        assert_eq!(merged.block_count(), 1);
    }

    #[test]
    fn merge_rejects_mixed_hash_identifiers() {
        let mut a = StoreIndex::empty();
        a.add_block(block_index(1, &[(0xa, 4)])).unwrap();
        let mut foreign = block_index(2, &[(0xb, 5)]);
        foreign.hash_identifier = 0x1234;
        let mut b = StoreIndex::empty();
        b.add_block(foreign).unwrap();
        assert!(matches!(
            StoreIndex::merge(&a, &b),
            Err(Error::Fatal(_))
        ));
    }

    #[test]
    fn partial_name_depends_only_on_the_block_hash_set() {
        let mut forward = StoreIndex::empty();
        forward.add_block(block_index(1, &[(0xa, 4)])).unwrap();
        forward.add_block(block_index(2, &[(0xb, 5)])).unwrap();
        forward.add_block(block_index(3, &[(0xc, 6)])).unwrap();

        let mut reverse = StoreIndex::empty();
        reverse.add_block(block_index(3, &[(0xc, 6)])).unwrap();
        reverse.add_block(block_index(2, &[(0xb, 5)])).unwrap();
        reverse.add_block(block_index(1, &[(0xa, 4)])).unwrap();

        assert_eq!(forward.partial_name(), reverse.partial_name());

        let mut other = forward.clone();
        other.add_block(block_index(4, &[(0xd, 7)])).unwrap();
        assert_ne!(forward.partial_name(), other.partial_name());
    }

    #[test]
    fn partial_name_shape() {
        let name = StoreIndex::empty().partial_name();
        assert!(name.starts_with(PARTIAL_INDEX_PREFIX));
        assert!(name.ends_with(PARTIAL_INDEX_EXTENSION));
        assert_eq!(name.len(), PARTIAL_INDEX_PREFIX.len() + 40 + PARTIAL_INDEX_EXTENSION.len());
    }
}
