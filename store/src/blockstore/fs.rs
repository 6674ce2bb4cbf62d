//! Block store backed by a local directory.
//!
//! Same contract as the remote store, same `chunks/` layout. Puts land
//! via write-to-temp, fsync and atomic rename; the store index is
//! rebuilt by walking `chunks/` on the first snapshot request and kept
//! current in memory afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use super::{AtomicStats, BlockStore, Stats};
use crate::block_path::{block_path, parse_block_path, BLOCK_EXTENSION};
use crate::index::{BlockHash, BlockIndex, StoreIndex, StoredBlock};
use crate::Error;

const BLOCKS_DIR: &str = "chunks";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct FsBlockStore {
    root: PathBuf,
    index: tokio::sync::Mutex<Option<StoreIndex>>,
    stats: Arc<AtomicStats>,
}

impl FsBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlockStore {
            root: root.into(),
            index: tokio::sync::Mutex::new(None),
            stats: Arc::new(AtomicStats::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, block_hash: BlockHash) -> PathBuf {
        let mut path = self.root.clone();
        for part in block_path(BLOCKS_DIR, block_hash).split('/') {
            path.push(part);
        }
        path
    }

    /// Walk `chunks/` and decode every block header. Entries whose file
    /// name does not round-trip to the header's block hash are skipped.
    fn scan_blocks(root: PathBuf) -> Result<Vec<BlockIndex>, Error> {
        let blocks_dir = root.join(BLOCKS_DIR);
        if !blocks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut blocks = Vec::new();
        for entry in WalkDir::new(&blocks_dir) {
            let entry = entry.map_err(|e| Error::Fatal(format!("walking {:?}: {}", blocks_dir, e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(BLOCK_EXTENSION) {
                continue;
            }
            let Some(expected_hash) = parse_block_path(&name) else {
                warn!(path = %entry.path().display(), "skipping oddly named block file");
                continue;
            };
            let data = std::fs::read(entry.path())
                .map_err(|e| Error::Fatal(format!("reading {:?}: {}", entry.path(), e)))?;
            let mut buf = &data[..];
            match BlockIndex::decode_from(&mut buf) {
                Ok(block_index) if block_index.block_hash == expected_hash => {
                    blocks.push(block_index)
                }
                Ok(block_index) => warn!(
                    path = %entry.path().display(),
                    content_hash = format_args!("{:016x}", block_index.block_hash),
                    "block file name does not match its content hash, skipping"
                ),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping undecodable block"),
            }
        }
        Ok(blocks)
    }

    async fn record_block(&self, block_index: BlockIndex) {
        let mut cached = self.index.lock().await;
        if let Some(index) = cached.as_mut() {
            if let Err(e) = index.add_block(block_index) {
                warn!(error = %e, "could not record block in cached index");
            }
        }
    }
}

fn io_error(context: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(context.to_string())
    } else {
        Error::Fatal(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block.block_hash())))]
    async fn put_stored_block(&self, block: StoredBlock) -> Result<(), Error> {
        let path = self.file_path(block.block_hash());
        match tokio::fs::metadata(&path).await {
            Ok(_) => {
                AtomicStats::add(&self.stats.blocks_put_count, 1);
                self.record_block(block.index).await;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("stat block", e)),
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::Fatal(format!("block path {:?} has no parent", path)))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create block dir", e))?;

        // unique temp name so concurrent writers of the same block don't
        // interleave
        let tmp = path.with_extension(format!(
            "lsb.tmp.{}.{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let encoded = block.encode();
        let result = async {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .map_err(|e| io_error("create block temp", e))?;
            file.write_all(&encoded)
                .await
                .map_err(|e| io_error("write block", e))?;
            file.sync_all()
                .await
                .map_err(|e| io_error("sync block", e))?;
            drop(file);
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| io_error("rename block", e))
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return result;
        }

        AtomicStats::add(&self.stats.blocks_put_count, 1);
        AtomicStats::add(&self.stats.bytes_put_count, encoded.len() as u64);
        AtomicStats::add(
            &self.stats.chunks_put_count,
            block.index.chunk_count() as u64,
        );
        self.record_block(block.index).await;
        Ok(())
    }

    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block_hash)))]
    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock, Error> {
        let path = self.file_path(block_hash);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&format!("read block {:016x}", block_hash), e))?;
        let len = data.len();
        let block = StoredBlock::decode(Bytes::from(data))?;
        if block.block_hash() != block_hash {
            return Err(Error::Corruption(format!(
                "block file {:?} carries content hash {:016x}",
                path,
                block.block_hash()
            )));
        }
        AtomicStats::add(&self.stats.blocks_get_count, 1);
        AtomicStats::add(&self.stats.bytes_get_count, len as u64);
        AtomicStats::add(
            &self.stats.chunks_get_count,
            block.index.chunk_count() as u64,
        );
        Ok(block)
    }

    #[instrument(skip_all, fields(root = %self.root.display()))]
    async fn get_index(&self, hash_identifier: u32) -> Result<StoreIndex, Error> {
        let mut cached = self.index.lock().await;
        if cached.is_none() {
            let root = self.root.clone();
            let blocks = tokio::task::spawn_blocking(move || Self::scan_blocks(root)).await??;
            let mut index = StoreIndex::empty();
            for block in blocks {
                index.add_block(block)?;
            }
            debug!(blocks = index.block_count(), "rebuilt block store index");
            *cached = Some(index);
        }
        let index = cached.as_ref().cloned().unwrap_or_default();
        AtomicStats::add(&self.stats.index_get_count, 1);
        if index.hash_identifier() == 0 {
            let mut adopted = index;
            if adopted.is_empty() {
                adopted = StoreIndex::new(hash_identifier);
            }
            return Ok(adopted);
        }
        if index.hash_identifier() != hash_identifier {
            return Err(Error::Fatal(format!(
                "hash identifier mismatch: block store uses 0x{:08x}, requested 0x{:08x}",
                index.hash_identifier(),
                hash_identifier
            )));
        }
        Ok(index)
    }

    fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
