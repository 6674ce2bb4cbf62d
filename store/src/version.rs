//! Version indexes: the per-version mapping from asset paths to chunk
//! spans, plus the directory indexer that produces one.
//!
//! Asset paths are relative, `/`-separated on every platform; directory
//! assets end in `/` and carry no chunks. Chunk sizes here are
//! uncompressed sizes tiling the asset, unlike the stored sizes a block
//! index carries.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::hashing::HashAlgorithm;
use crate::index::ChunkHash;
use crate::Error;

pub const VERSION_INDEX_VERSION: u8 = 1;

/// Smallest accepted chunking target; FastCDC needs room for its min
/// size of half the target.
pub const MIN_TARGET_CHUNK_SIZE: u32 = 128;
/// Largest accepted chunking target; FastCDC caps the max size at double
/// the target.
pub const MAX_TARGET_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionAsset {
    /// Relative path, `/`-separated; directories end in `/`.
    pub path: String,
    pub size: u64,
    pub permissions: u32,
    pub chunk_hashes: Vec<ChunkHash>,
    /// Uncompressed chunk sizes; they sum to `size` for regular files.
    pub chunk_sizes: Vec<u32>,
}

impl VersionAsset {
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionIndex {
    pub hash_identifier: u32,
    pub target_chunk_size: u32,
    pub assets: Vec<VersionAsset>,
}

impl VersionIndex {
    /// Every chunk reference in asset order, with its uncompressed size.
    pub fn chunks(&self) -> impl Iterator<Item = (ChunkHash, u32)> + '_ {
        self.assets.iter().flat_map(|asset| {
            asset
                .chunk_hashes
                .iter()
                .copied()
                .zip(asset.chunk_sizes.iter().copied())
        })
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION_INDEX_VERSION);
        buf.put_u32_le(self.hash_identifier);
        buf.put_u32_le(self.target_chunk_size);
        buf.put_u32_le(self.assets.len() as u32);
        for asset in &self.assets {
            let path = asset.path.as_bytes();
            if path.len() > u16::MAX as usize {
                return Err(Error::Fatal(format!(
                    "asset path too long ({} bytes)",
                    path.len()
                )));
            }
            if asset.chunk_hashes.len() != asset.chunk_sizes.len() {
                return Err(Error::Fatal(format!(
                    "asset {} has mismatched chunk arrays",
                    asset.path
                )));
            }
            buf.put_u16_le(path.len() as u16);
            buf.put_slice(path);
            buf.put_u64_le(asset.size);
            buf.put_u32_le(asset.permissions);
            buf.put_u32_le(asset.chunk_hashes.len() as u32);
            for hash in &asset.chunk_hashes {
                buf.put_u64_le(*hash);
            }
            for size in &asset.chunk_sizes {
                buf.put_u32_le(*size);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut buf = data;
        if buf.remaining() < 13 {
            return Err(Error::Corruption(
                "truncated version index header".to_string(),
            ));
        }
        let version = buf.get_u8();
        if version != VERSION_INDEX_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported version index version {}",
                version
            )));
        }
        let hash_identifier = buf.get_u32_le();
        let target_chunk_size = buf.get_u32_le();
        let asset_count = buf.get_u32_le() as usize;
        let mut assets = Vec::with_capacity(asset_count);
        for _ in 0..asset_count {
            if buf.remaining() < 2 {
                return Err(Error::Corruption("truncated asset entry".to_string()));
            }
            let path_len = buf.get_u16_le() as usize;
            if buf.remaining() < path_len + 16 {
                return Err(Error::Corruption("truncated asset entry".to_string()));
            }
            let path = String::from_utf8(buf[..path_len].to_vec())
                .map_err(|e| Error::Corruption(format!("asset path is not utf-8: {}", e)))?;
            buf.advance(path_len);
            if path.is_empty() || path.starts_with('/') || path.split('/').any(|p| p == "..") {
                return Err(Error::Corruption(format!("unsafe asset path '{}'", path)));
            }
            let size = buf.get_u64_le();
            let permissions = buf.get_u32_le();
            let chunk_count = buf.get_u32_le() as usize;
            if buf.remaining() < chunk_count * 12 {
                return Err(Error::Corruption("truncated asset chunk list".to_string()));
            }
            let mut chunk_hashes = Vec::with_capacity(chunk_count);
            for _ in 0..chunk_count {
                chunk_hashes.push(buf.get_u64_le());
            }
            let mut chunk_sizes = Vec::with_capacity(chunk_count);
            for _ in 0..chunk_count {
                chunk_sizes.push(buf.get_u32_le());
            }
            assets.push(VersionAsset {
                path,
                size,
                permissions,
                chunk_hashes,
                chunk_sizes,
            });
        }
        if buf.has_remaining() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after version index",
                buf.remaining()
            )));
        }
        Ok(VersionIndex {
            hash_identifier,
            target_chunk_size,
            assets,
        })
    }
}

/// Index a directory tree: walk it deterministically, content-define
/// chunks of every regular file at `target_chunk_size` (FastCDC, min
/// half, max double) and hash them with `algorithm`. An empty or absent
/// directory yields a valid empty index.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn index_directory(
    root: &Path,
    algorithm: HashAlgorithm,
    target_chunk_size: u32,
) -> Result<VersionIndex, Error> {
    if !(MIN_TARGET_CHUNK_SIZE..=MAX_TARGET_CHUNK_SIZE).contains(&target_chunk_size) {
        return Err(Error::Config(format!(
            "target chunk size {} is outside {}..{}",
            target_chunk_size, MIN_TARGET_CHUNK_SIZE, MAX_TARGET_CHUNK_SIZE
        )));
    }

    let entries = {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || scan_tree(&root)).await??
    };

    let mut assets = Vec::with_capacity(entries.len());
    for entry in entries {
        let asset = match entry {
            TreeEntry::Directory { path, permissions } => VersionAsset {
                path,
                size: 0,
                permissions,
                chunk_hashes: Vec::new(),
                chunk_sizes: Vec::new(),
            },
            TreeEntry::File {
                path,
                absolute,
                size,
                permissions,
            } => {
                let (chunk_hashes, chunk_sizes) =
                    chunk_file(&absolute, algorithm, target_chunk_size).await?;
                VersionAsset {
                    path,
                    size,
                    permissions,
                    chunk_hashes,
                    chunk_sizes,
                }
            }
        };
        assets.push(asset);
    }

    debug!(assets = assets.len(), "indexed directory");
    Ok(VersionIndex {
        hash_identifier: algorithm.identifier(),
        target_chunk_size,
        assets,
    })
}

enum TreeEntry {
    Directory {
        path: String,
        permissions: u32,
    },
    File {
        path: String,
        absolute: PathBuf,
        size: u64,
        permissions: u32,
    },
}

fn scan_tree(root: &Path) -> Result<Vec<TreeEntry>, Error> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Fatal(format!("walking {:?}: {}", root, e)))?;
        if entry.path() == root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Fatal(format!("relativizing {:?}: {}", entry.path(), e)))?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let metadata = entry
            .metadata()
            .map_err(|e| Error::Fatal(format!("stat {:?}: {}", entry.path(), e)))?;
        let permissions = file_permissions(&metadata);
        if metadata.is_dir() {
            entries.push(TreeEntry::Directory {
                path: format!("{}/", path),
                permissions,
            });
        } else if metadata.is_file() {
            entries.push(TreeEntry::File {
                path,
                absolute: entry.path().to_path_buf(),
                size: metadata.len(),
                permissions,
            });
        }
        // other kinds (sockets, devices) are not replicated
    }
    Ok(entries)
}

#[cfg(unix)]
fn file_permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_permissions(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

async fn chunk_file(
    path: &Path,
    algorithm: HashAlgorithm,
    target_chunk_size: u32,
) -> Result<(Vec<ChunkHash>, Vec<u32>), Error> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Fatal(format!("open {:?}: {}", path, e)))?;
    let mut chunker = fastcdc::v2020::AsyncStreamCDC::new(
        file,
        target_chunk_size / 2,
        target_chunk_size,
        target_chunk_size * 2,
    );
    let mut chunk_hashes = Vec::new();
    let mut chunk_sizes = Vec::new();
    {
        let stream = chunker.as_stream();
        let mut stream = Box::pin(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fatal(format!("chunking {:?}: {}", path, e)))?;
            chunk_hashes.push(algorithm.hash64(&chunk.data));
            chunk_sizes.push(chunk.length as u32);
        }
    }
    Ok((chunk_hashes, chunk_sizes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> VersionIndex {
        VersionIndex {
            hash_identifier: HashAlgorithm::Blake3.identifier(),
            target_chunk_size: 32768,
            assets: vec![
                VersionAsset {
                    path: "dir/".to_string(),
                    size: 0,
                    permissions: 0o755,
                    chunk_hashes: vec![],
                    chunk_sizes: vec![],
                },
                VersionAsset {
                    path: "dir/file.bin".to_string(),
                    size: 30,
                    permissions: 0o644,
                    chunk_hashes: vec![0x4711, 0x1147],
                    chunk_sizes: vec![10, 20],
                },
            ],
        }
    }

    #[test]
    fn codec_round_trips() {
        let index = sample_index();
        let encoded = index.encode().unwrap();
        assert_eq!(VersionIndex::decode(&encoded).unwrap(), index);
    }

    #[test]
    fn decode_rejects_unsafe_paths() {
        let mut index = sample_index();
        index.assets[1].path = "../escape".to_string();
        let encoded = index.encode().unwrap();
        assert!(matches!(
            VersionIndex::decode(&encoded),
            Err(Error::Corruption(_))
        ));

        let mut index = sample_index();
        index.assets[1].path = "/absolute".to_string();
        let encoded = index.encode().unwrap();
        assert!(matches!(
            VersionIndex::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let encoded = sample_index().encode().unwrap();
        for cut in [1, 10, encoded.len() - 1] {
            assert!(matches!(
                VersionIndex::decode(&encoded[..cut]),
                Err(Error::Corruption(_))
            ));
        }
    }

    #[tokio::test]
    async fn empty_or_absent_directory_gives_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_directory(dir.path(), HashAlgorithm::Blake3, 32768)
            .await
            .unwrap();
        assert!(index.assets.is_empty());

        let index = index_directory(&dir.path().join("nope"), HashAlgorithm::Blake3, 32768)
            .await
            .unwrap();
        assert!(index.assets.is_empty());
    }

    #[tokio::test]
    async fn indexing_is_deterministic_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 1000]).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![2u8; 500_000]).unwrap();
        std::fs::write(dir.path().join("empty.bin"), b"").unwrap();

        let first = index_directory(dir.path(), HashAlgorithm::Blake3, 32768)
            .await
            .unwrap();
        let second = index_directory(dir.path(), HashAlgorithm::Blake3, 32768)
            .await
            .unwrap();
        assert_eq!(first, second);

        let paths: Vec<&str> = first.assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["a.bin", "empty.bin", "sub/", "sub/b.bin"]);

        let big = &first.assets[3];
        assert_eq!(big.size, 500_000);
        assert_eq!(
            big.chunk_sizes.iter().map(|s| *s as u64).sum::<u64>(),
            big.size
        );
        assert!(big.chunk_hashes.len() > 1);
        let empty = &first.assets[1];
        assert!(empty.chunk_hashes.is_empty());
    }

    #[tokio::test]
    async fn too_small_chunk_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            index_directory(dir.path(), HashAlgorithm::Blake3, 64).await,
            Err(Error::Config(_))
        ));
    }
}
