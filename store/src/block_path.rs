//! Deterministic mapping from a block hash to its blob key.
//!
//! Blocks live at `{base}/{hex4}/{hex16}.lsb` where `hex16` is the full
//! lower-hex block hash zero-padded to 16 characters and `hex4` its first
//! four characters. The separator is `/` on every platform; the hash can
//! be recovered from a well-formed path.

use crate::index::BlockHash;

pub const BLOCK_EXTENSION: &str = ".lsb";

/// Blob key for a block, relative to the store prefix.
pub fn block_path(base: &str, block_hash: BlockHash) -> String {
    let hex16 = format!("{:016x}", block_hash);
    format!("{}/{}/{}{}", base, &hex16[..4], hex16, BLOCK_EXTENSION)
}

/// Recover the block hash from a block path, if well-formed.
pub fn parse_block_path(path: &str) -> Option<BlockHash> {
    let name = path.rsplit('/').next()?;
    let hex16 = name.strip_suffix(BLOCK_EXTENSION)?;
    if hex16.len() != 16 || !hex16.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex16, 16).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn shards_on_first_four_hex_chars() {
        assert_eq!(
            block_path("chunks", 0x4711_1147_dead_beef),
            "chunks/4711/47111147deadbeef.lsb"
        );
    }

    #[test]
    fn zero_pads_small_hashes() {
        assert_eq!(block_path("chunks", 0x47), "chunks/0000/0000000000000047.lsb");
    }

    #[rstest]
    #[case(0)]
    #[case(0x47)]
    #[case(0x4711)]
    #[case(u64::MAX)]
    #[case(0x0123_4567_89ab_cdef)]
    fn round_trips(#[case] hash: BlockHash) {
        let path = block_path("chunks", hash);
        assert_eq!(parse_block_path(&path), Some(hash));
    }

    #[rstest]
    #[case::wrong_extension("chunks/0000/0000000000000047.lsi")]
    #[case::short_hex("chunks/0000/047.lsb")]
    #[case::not_hex("chunks/0000/000000000000004z.lsb")]
    #[case::no_name("chunks/0000/.lsb")]
    fn rejects_malformed_paths(#[case] path: &str) {
        assert_eq!(parse_block_path(path), None);
    }
}
