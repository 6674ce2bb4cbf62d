//! Block stores: capability set over content-addressed stored blocks.
//!
//! Backends: [remote::RemoteBlockStore] (worker pool over a blob store),
//! [fs::FsBlockStore] (local directory) and [cache::CacheBlockStore]
//! (read-through composition of the two).

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::index::{BlockHash, StoreIndex, StoredBlock};
use crate::Error;

pub mod cache;
mod consolidate;
pub mod fs;
mod index_worker;
pub mod remote;

pub use consolidate::{
    read_store_index, read_store_index_fresh, update_content_index, write_store_index,
};

/// The base trait all block stores implement: publish and fetch stored
/// blocks, snapshot the store index, and shut down cleanly.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Publish one block. Succeeds without overwriting when the block is
    /// already present (content-addressed: presence implies equality).
    /// Ownership of the block transfers on success; on failure nothing
    /// was published.
    async fn put_stored_block(&self, block: StoredBlock) -> Result<(), Error>;

    /// Fetch one block by hash. [Error::NotFound] when absent.
    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock, Error>;

    /// Snapshot of the store index. The snapshot is owned by the caller.
    /// Fails when `hash_identifier` does not match the store's.
    async fn get_index(&self, hash_identifier: u32) -> Result<StoreIndex, Error>;

    /// Hint that the given blocks will be fetched soon. May be a no-op.
    async fn preflight_get(&self, _block_hashes: &[BlockHash]) -> Result<(), Error> {
        Ok(())
    }

    /// Snapshot of the operation counters.
    fn stats(&self) -> Stats;

    /// Clean shutdown: drain queued work, then publish pending index
    /// deltas. Operations after close fail.
    async fn close(&self) -> Result<(), Error>;
}

/// Point-in-time snapshot of a store's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub blocks_put_count: u64,
    pub blocks_get_count: u64,
    pub bytes_put_count: u64,
    pub bytes_get_count: u64,
    pub chunks_put_count: u64,
    pub chunks_get_count: u64,
    pub block_put_fail_count: u64,
    pub block_get_fail_count: u64,
    pub block_put_retry_count: u64,
    pub block_get_retry_count: u64,
    pub index_get_count: u64,
}

/// Shared counters, written with relaxed atomic adds from worker tasks.
#[derive(Debug, Default)]
pub(crate) struct AtomicStats {
    pub blocks_put_count: AtomicU64,
    pub blocks_get_count: AtomicU64,
    pub bytes_put_count: AtomicU64,
    pub bytes_get_count: AtomicU64,
    pub chunks_put_count: AtomicU64,
    pub chunks_get_count: AtomicU64,
    pub block_put_fail_count: AtomicU64,
    pub block_get_fail_count: AtomicU64,
    pub block_put_retry_count: AtomicU64,
    pub block_get_retry_count: AtomicU64,
    pub index_get_count: AtomicU64,
}

impl AtomicStats {
    pub fn snapshot(&self) -> Stats {
        Stats {
            blocks_put_count: self.blocks_put_count.load(Ordering::Relaxed),
            blocks_get_count: self.blocks_get_count.load(Ordering::Relaxed),
            bytes_put_count: self.bytes_put_count.load(Ordering::Relaxed),
            bytes_get_count: self.bytes_get_count.load(Ordering::Relaxed),
            chunks_put_count: self.chunks_put_count.load(Ordering::Relaxed),
            chunks_get_count: self.chunks_get_count.load(Ordering::Relaxed),
            block_put_fail_count: self.block_put_fail_count.load(Ordering::Relaxed),
            block_get_fail_count: self.block_get_fail_count.load(Ordering::Relaxed),
            block_put_retry_count: self.block_put_retry_count.load(Ordering::Relaxed),
            block_get_retry_count: self.block_get_retry_count.load(Ordering::Relaxed),
            index_get_count: self.index_get_count.load(Ordering::Relaxed),
        }
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}
