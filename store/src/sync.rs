//! Version publication and materialization: missing-content computation,
//! block packing, and the upsync/downsync drivers.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument};

use crate::blob::{read_blob_with_retry, write_blob_with_retry, BlobStore};
use crate::blockstore::BlockStore;
use crate::compression::CompressionAlgorithm;
use crate::hashing::HashAlgorithm;
use crate::index::{BlockIndex, ChunkHash, StoreIndex, StoredBlock};
use crate::version::{VersionAsset, VersionIndex};
use crate::Error;

#[derive(Clone, Copy, Debug)]
pub struct UpsyncOptions {
    pub target_chunk_size: u32,
    pub target_block_size: u32,
    pub max_chunks_per_block: u32,
    pub compression: CompressionAlgorithm,
    pub hash: HashAlgorithm,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UpsyncSummary {
    pub total_chunks: usize,
    pub missing_chunks: usize,
    pub published_blocks: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct DownsyncOptions {
    pub retain_permissions: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DownsyncSummary {
    pub written_assets: usize,
    pub removed_assets: usize,
}

/// Chunks referenced by `version` that `store_index` does not know,
/// in version order, deduplicated. Sizes are uncompressed.
pub fn compute_missing_chunks(
    store_index: &StoreIndex,
    version: &VersionIndex,
) -> Vec<(ChunkHash, u32)> {
    let known = store_index.chunk_to_block();
    let mut seen = HashSet::new();
    version
        .chunks()
        .filter(|(hash, _)| !known.contains_key(hash) && seen.insert(*hash))
        .collect()
}

/// Pack chunks into block layouts bounded by `target_block_size`
/// (uncompressed bytes) and `max_chunks_per_block`. A chunk bigger than
/// the budget still forms a singleton block.
pub fn pack_blocks(
    chunks: &[(ChunkHash, u32)],
    target_block_size: u32,
    max_chunks_per_block: u32,
) -> Vec<Vec<(ChunkHash, u32)>> {
    let max_chunks = max_chunks_per_block.max(1) as usize;
    let mut blocks = Vec::new();
    let mut current: Vec<(ChunkHash, u32)> = Vec::new();
    let mut current_size = 0u64;
    for (hash, size) in chunks.iter().copied() {
        let would_overflow = current_size + size as u64 > target_block_size as u64;
        if !current.is_empty() && (would_overflow || current.len() >= max_chunks) {
            blocks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size as u64;
        current.push((hash, size));
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Publish a version: compute what the remote lacks, pack and PUT those
/// blocks, then write the version index blob to `target_key`.
#[instrument(skip_all, fields(source = %source_path.display(), target = target_key))]
pub async fn upsync(
    blob_store: &BlobStore,
    block_store: &dyn BlockStore,
    source_path: &Path,
    version: &VersionIndex,
    target_key: &str,
    options: &UpsyncOptions,
) -> Result<UpsyncSummary, Error> {
    let store_index = block_store.get_index(version.hash_identifier).await?;
    let algorithm = HashAlgorithm::from_identifier(version.hash_identifier)?;

    let missing = compute_missing_chunks(&store_index, version);
    let layouts = pack_blocks(
        &missing,
        options.target_block_size,
        options.max_chunks_per_block,
    );
    let summary = UpsyncSummary {
        total_chunks: version.chunks().count(),
        missing_chunks: missing.len(),
        published_blocks: layouts.len(),
    };
    info!(
        chunks = summary.total_chunks,
        missing = summary.missing_chunks,
        blocks = summary.published_blocks,
        "publishing missing content"
    );

    if !layouts.is_empty() {
        let locations = chunk_locations(source_path, version);
        let mut reader = SourceChunkReader::default();
        let max_in_flight = num_cpus::get().max(1) * 2;
        let mut in_flight = FuturesUnordered::new();
        for layout in layouts {
            let block = build_block(&mut reader, &locations, &layout, algorithm, options).await?;
            in_flight.push(block_store.put_stored_block(block));
            if in_flight.len() >= max_in_flight {
                if let Some(result) = in_flight.next().await {
                    result?;
                }
            }
        }
        while let Some(result) = in_flight.next().await {
            result?;
        }
    }

    let client = blob_store.new_client()?;
    write_blob_with_retry(&client, target_key, version.encode()?, || {}).await?;
    Ok(summary)
}

/// Read a version index blob from a user-chosen key.
pub async fn read_version_index(blob_store: &BlobStore, key: &str) -> Result<VersionIndex, Error> {
    let client = blob_store.new_client()?;
    let data = read_blob_with_retry(&client, key, || {}).await?;
    VersionIndex::decode(&data)
}

/// Materialize `target_version` into `target_path`, fetching only blocks
/// whose chunks the local tree lacks, and removing assets the new
/// version no longer has.
#[instrument(skip_all, fields(target = %target_path.display()))]
pub async fn downsync(
    block_store: &dyn BlockStore,
    target_version: &VersionIndex,
    local_version: &VersionIndex,
    target_path: &Path,
    options: &DownsyncOptions,
) -> Result<DownsyncSummary, Error> {
    let store_index = block_store.get_index(target_version.hash_identifier).await?;
    let algorithm = HashAlgorithm::from_identifier(target_version.hash_identifier)?;
    let chunk_to_block = store_index.chunk_to_block();

    let local_by_path: HashMap<&str, &VersionAsset> = local_version
        .assets
        .iter()
        .map(|a| (a.path.as_str(), a))
        .collect();

    tokio::fs::create_dir_all(target_path)
        .await
        .map_err(|e| Error::Fatal(format!("create {:?}: {}", target_path, e)))?;

    let mut summary = DownsyncSummary::default();
    let mut fetched: Option<StoredBlock> = None;
    for asset in &target_version.assets {
        let unchanged = local_by_path
            .get(asset.path.as_str())
            .map(|local| local.chunk_hashes == asset.chunk_hashes)
            .unwrap_or(false);
        let absolute = asset_path(target_path, &asset.path)?;
        if asset.is_directory() {
            tokio::fs::create_dir_all(&absolute)
                .await
                .map_err(|e| Error::Fatal(format!("create {:?}: {}", absolute, e)))?;
        } else if !unchanged {
            write_asset(
                block_store,
                &chunk_to_block,
                algorithm,
                asset,
                &absolute,
                &mut fetched,
            )
            .await?;
            summary.written_assets += 1;
        }
        if options.retain_permissions {
            set_permissions(&absolute, asset.permissions).await?;
        }
    }

    summary.removed_assets = remove_stale_assets(target_path, target_version, local_version).await?;
    debug!(
        written = summary.written_assets,
        removed = summary.removed_assets,
        "version materialized"
    );
    Ok(summary)
}

/// Where each chunk's content lives in the source tree. The first asset
/// carrying a chunk serves as its source.
fn chunk_locations(root: &Path, version: &VersionIndex) -> HashMap<ChunkHash, ChunkLocation> {
    let mut locations = HashMap::new();
    for asset in &version.assets {
        let mut offset = 0u64;
        for (hash, size) in asset
            .chunk_hashes
            .iter()
            .copied()
            .zip(asset.chunk_sizes.iter().copied())
        {
            locations.entry(hash).or_insert_with(|| ChunkLocation {
                path: root.join(asset.path.as_str()),
                offset,
                size,
            });
            offset += size as u64;
        }
    }
    locations
}

struct ChunkLocation {
    path: PathBuf,
    offset: u64,
    size: u32,
}

/// Sequential chunk reader that keeps the current source file open;
/// consecutive chunks usually come from the same file.
#[derive(Default)]
struct SourceChunkReader {
    current: Option<(PathBuf, tokio::fs::File)>,
}

impl SourceChunkReader {
    async fn read(&mut self, location: &ChunkLocation) -> Result<Vec<u8>, Error> {
        if self
            .current
            .as_ref()
            .map(|(path, _)| path != &location.path)
            .unwrap_or(true)
        {
            let file = tokio::fs::File::open(&location.path)
                .await
                .map_err(|e| Error::Fatal(format!("open {:?}: {}", location.path, e)))?;
            self.current = Some((location.path.clone(), file));
        }
        let (path, file) = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Fatal("no open source file".to_string()))?;
        file.seek(SeekFrom::Start(location.offset))
            .await
            .map_err(|e| Error::Fatal(format!("seek {:?}: {}", path, e)))?;
        let mut data = vec![0u8; location.size as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|e| Error::Fatal(format!("read {:?}: {}", path, e)))?;
        Ok(data)
    }
}

async fn build_block(
    reader: &mut SourceChunkReader,
    locations: &HashMap<ChunkHash, ChunkLocation>,
    layout: &[(ChunkHash, u32)],
    algorithm: HashAlgorithm,
    options: &UpsyncOptions,
) -> Result<StoredBlock, Error> {
    let tag = options.compression.tag();
    let mut chunk_hashes = Vec::with_capacity(layout.len());
    let mut chunk_sizes = Vec::with_capacity(layout.len());
    let mut payload = Vec::new();
    for (hash, _) in layout {
        let location = locations.get(hash).ok_or_else(|| {
            Error::Fatal(format!("chunk {:016x} has no source location", hash))
        })?;
        let data = reader.read(location).await?;
        if algorithm.hash64(&data) != *hash {
            return Err(Error::Fatal(format!(
                "source content for chunk {:016x} changed since it was indexed",
                hash
            )));
        }
        let stored = options.compression.pack_chunk(&data)?;
        chunk_hashes.push(*hash);
        chunk_sizes.push(stored.len() as u32);
        payload.extend_from_slice(&stored);
    }
    let block_hash = BlockIndex::compute_block_hash(algorithm, &chunk_hashes, &chunk_sizes, tag);
    Ok(StoredBlock {
        index: BlockIndex {
            hash_identifier: algorithm.identifier(),
            tag,
            block_hash,
            chunk_hashes,
            chunk_sizes,
        },
        payload: Bytes::from(payload),
    })
}

fn asset_path(root: &Path, asset: &str) -> Result<PathBuf, Error> {
    // version index decoding already rejects absolute and `..` paths
    let relative = asset.trim_end_matches('/');
    if relative.is_empty() {
        return Err(Error::Corruption("empty asset path".to_string()));
    }
    Ok(root.join(relative))
}

async fn write_asset(
    block_store: &dyn BlockStore,
    chunk_to_block: &HashMap<ChunkHash, u64>,
    algorithm: HashAlgorithm,
    asset: &VersionAsset,
    absolute: &Path,
    fetched: &mut Option<StoredBlock>,
) -> Result<(), Error> {
    if let Some(parent) = absolute.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Fatal(format!("create {:?}: {}", parent, e)))?;
    }
    let file_name = absolute
        .file_name()
        .ok_or_else(|| Error::Corruption(format!("asset path {:?} has no file name", absolute)))?
        .to_string_lossy()
        .into_owned();
    let tmp = absolute.with_file_name(format!("{}.blocksync.tmp", file_name));
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| Error::Fatal(format!("create {:?}: {}", tmp, e)))?;

    let result = async {
        for (chunk_hash, expected_size) in asset
            .chunk_hashes
            .iter()
            .copied()
            .zip(asset.chunk_sizes.iter().copied())
        {
            let data =
                fetch_chunk(block_store, chunk_to_block, algorithm, chunk_hash, fetched).await?;
            if data.len() != expected_size as usize {
                return Err(Error::Corruption(format!(
                    "chunk {:016x} unpacked to {} bytes, version index says {}",
                    chunk_hash,
                    data.len(),
                    expected_size
                )));
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &data)
                .await
                .map_err(|e| Error::Fatal(format!("write {:?}: {}", tmp, e)))?;
        }
        file.sync_all()
            .await
            .map_err(|e| Error::Fatal(format!("sync {:?}: {}", tmp, e)))?;
        drop(file);
        tokio::fs::rename(&tmp, absolute)
            .await
            .map_err(|e| Error::Fatal(format!("rename {:?}: {}", tmp, e)))
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn fetch_chunk(
    block_store: &dyn BlockStore,
    chunk_to_block: &HashMap<ChunkHash, u64>,
    algorithm: HashAlgorithm,
    chunk_hash: ChunkHash,
    fetched: &mut Option<StoredBlock>,
) -> Result<Vec<u8>, Error> {
    let block_hash = *chunk_to_block.get(&chunk_hash).ok_or_else(|| {
        Error::Fatal(format!(
            "store has no block for chunk {:016x}",
            chunk_hash
        ))
    })?;
    let needs_fetch = fetched
        .as_ref()
        .map(|b| b.block_hash() != block_hash)
        .unwrap_or(true);
    if needs_fetch {
        *fetched = Some(block_store.get_stored_block(block_hash).await?);
    }
    let block = fetched
        .as_ref()
        .ok_or_else(|| Error::Fatal("no block fetched".to_string()))?;

    let position = block
        .index
        .chunk_hashes
        .iter()
        .position(|h| *h == chunk_hash)
        .ok_or_else(|| {
            Error::Corruption(format!(
                "block {:016x} does not carry chunk {:016x}",
                block_hash, chunk_hash
            ))
        })?;
    let range = block.chunk_range(position).ok_or_else(|| {
        Error::Corruption(format!("block {:016x} chunk range out of bounds", block_hash))
    })?;
    let stored = &block.payload[range];
    let codec = CompressionAlgorithm::from_tag(block.index.tag)?;
    let data = codec.unpack_chunk(stored)?;
    if algorithm.hash64(&data) != chunk_hash {
        return Err(Error::Corruption(format!(
            "chunk {:016x} content does not match its hash",
            chunk_hash
        )));
    }
    Ok(data)
}

/// Remove local assets that the target version no longer carries. Files
/// go first, directories deepest-first.
async fn remove_stale_assets(
    root: &Path,
    target_version: &VersionIndex,
    local_version: &VersionIndex,
) -> Result<usize, Error> {
    let keep: HashSet<&str> = target_version
        .assets
        .iter()
        .map(|a| a.path.as_str())
        .collect();
    let mut stale_files = Vec::new();
    let mut stale_dirs = Vec::new();
    for asset in &local_version.assets {
        if keep.contains(asset.path.as_str()) {
            continue;
        }
        if asset.is_directory() {
            stale_dirs.push(asset.path.as_str());
        } else {
            stale_files.push(asset.path.as_str());
        }
    }
    stale_dirs.sort_by_key(|path| std::cmp::Reverse(path.len()));

    let mut removed = 0;
    for path in stale_files {
        let absolute = asset_path(root, path)?;
        match tokio::fs::remove_file(&absolute).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Fatal(format!("remove {:?}: {}", absolute, e))),
        }
    }
    for path in stale_dirs {
        let absolute = asset_path(root, path)?;
        match tokio::fs::remove_dir(&absolute).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // non-empty is fine, something inside it survives
            Err(e) => {
                debug!(path = %absolute.display(), error = %e, "leaving stale directory");
            }
        }
    }
    Ok(removed)
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| Error::Fatal(format!("chmod {:?}: {}", path, e)))
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::block_index;

    fn version_of(chunks: &[(u64, u32)]) -> VersionIndex {
        VersionIndex {
            hash_identifier: HashAlgorithm::Blake3.identifier(),
            target_chunk_size: 32768,
            assets: vec![VersionAsset {
                path: "file.bin".to_string(),
                size: chunks.iter().map(|(_, s)| *s as u64).sum(),
                permissions: 0o644,
                chunk_hashes: chunks.iter().map(|(h, _)| *h).collect(),
                chunk_sizes: chunks.iter().map(|(_, s)| *s).collect(),
            }],
        }
    }

    #[test]
    fn missing_chunks_are_deduplicated_and_ordered() {
        let mut store_index = StoreIndex::empty();
        store_index
            .add_block(block_index(1, &[(0xa, 4), (0xb, 5)]))
            .unwrap();
        let version = version_of(&[(0xa, 4), (0xc, 6), (0xd, 7), (0xc, 6), (0xb, 5)]);

        let missing = compute_missing_chunks(&store_index, &version);
        assert_eq!(missing, vec![(0xc, 6), (0xd, 7)]);
    }

    #[test]
    fn everything_missing_against_an_empty_store() {
        let version = version_of(&[(0xa, 4), (0xb, 5)]);
        let missing = compute_missing_chunks(&StoreIndex::empty(), &version);
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn pack_blocks_respects_both_limits() {
        let chunks: Vec<(u64, u32)> = (0..10).map(|i| (i as u64, 100)).collect();

        // size-bound: 250 bytes → 3 chunks of 100 never fit
        let blocks = pack_blocks(&chunks, 250, 1024);
        assert!(blocks.iter().all(|b| b.len() <= 2));
        assert_eq!(blocks.iter().map(|b| b.len()).sum::<usize>(), 10);

        // count-bound
        let blocks = pack_blocks(&chunks, u32::MAX, 4);
        assert_eq!(
            blocks.iter().map(|b| b.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[test]
    fn oversized_chunk_forms_a_singleton_block() {
        let chunks = vec![(1u64, 10u32), (2, 1000), (3, 10)];
        let blocks = pack_blocks(&chunks, 100, 1024);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1], vec![(2, 1000)]);
    }

    #[test]
    fn pack_blocks_of_nothing_is_empty() {
        assert!(pack_blocks(&[], 100, 10).is_empty());
    }
}
