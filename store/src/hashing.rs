//! Hash algorithms for chunk and block identities.
//!
//! Every index carries a 32-bit hash identifier so readers can detect a
//! store written with a different function. Identities are 64-bit: the
//! digest of the active function truncated to its first eight bytes,
//! little-endian.

use blake2::Digest;

use crate::Error;

/// Identifier for the meow hash function. Recognized so stores written by
/// meow-hashing producers fail with a proper mismatch error, but no meow
/// hasher ships in this build.
pub const HASH_IDENT_MEOW: u32 = u32::from_be_bytes(*b"meow");
pub const HASH_IDENT_BLAKE2: u32 = u32::from_be_bytes(*b"blk2");
pub const HASH_IDENT_BLAKE3: u32 = u32::from_be_bytes(*b"blk3");

/// A hash function this build can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake2,
    Blake3,
}

impl HashAlgorithm {
    pub fn identifier(&self) -> u32 {
        match self {
            HashAlgorithm::Blake2 => HASH_IDENT_BLAKE2,
            HashAlgorithm::Blake3 => HASH_IDENT_BLAKE3,
        }
    }

    /// Resolve a persisted identifier back to an algorithm.
    pub fn from_identifier(identifier: u32) -> Result<Self, Error> {
        match identifier {
            HASH_IDENT_BLAKE2 => Ok(HashAlgorithm::Blake2),
            HASH_IDENT_BLAKE3 => Ok(HashAlgorithm::Blake3),
            HASH_IDENT_MEOW => Err(Error::Config(
                "store uses meow hashing, which this build does not provide".to_string(),
            )),
            other => Err(Error::Config(format!(
                "unknown hash identifier 0x{:08x}",
                other
            ))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "blake2" => Ok(HashAlgorithm::Blake2),
            "blake3" => Ok(HashAlgorithm::Blake3),
            "meow" => Err(Error::Config(
                "hash algorithm 'meow' is not provided by this build".to_string(),
            )),
            other => Err(Error::Config(format!(
                "unknown hash algorithm '{}'",
                other
            ))),
        }
    }

    /// 64-bit content identity: first eight digest bytes, little-endian.
    pub fn hash64(&self, data: &[u8]) -> u64 {
        let mut head = [0u8; 8];
        match self {
            HashAlgorithm::Blake2 => {
                let digest = blake2::Blake2b512::digest(data);
                head.copy_from_slice(&digest[..8]);
            }
            HashAlgorithm::Blake3 => {
                let digest = blake3::hash(data);
                head.copy_from_slice(&digest.as_bytes()[..8]);
            }
        }
        u64::from_le_bytes(head)
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Blake2 => write!(f, "blake2"),
            HashAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}
