//! Read-through composition of a fast local block store in front of a
//! slow remote one.
//!
//! Reads try the local store first and fall through to the remote on a
//! miss, backfilling the local store best-effort. Writes fan out to both
//! stores concurrently; the worse outcome wins. Index snapshots are the
//! merge of both indexes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{BlockStore, Stats};
use crate::index::{BlockHash, StoreIndex, StoredBlock};
use crate::Error;

pub struct CacheBlockStore {
    local: Arc<dyn BlockStore>,
    remote: Arc<dyn BlockStore>,
}

impl CacheBlockStore {
    pub fn new(local: Arc<dyn BlockStore>, remote: Arc<dyn BlockStore>) -> Self {
        CacheBlockStore { local, remote }
    }
}

#[async_trait]
impl BlockStore for CacheBlockStore {
    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block.block_hash())))]
    async fn put_stored_block(&self, block: StoredBlock) -> Result<(), Error> {
        let (local, remote) = tokio::join!(
            self.local.put_stored_block(block.clone()),
            self.remote.put_stored_block(block),
        );
        match (local, remote) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(Error::worse_of(a, b)),
        }
    }

    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block_hash)))]
    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock, Error> {
        match self.local.get_stored_block(block_hash).await {
            Ok(block) => return Ok(block),
            Err(Error::NotFound(_)) => {}
            Err(e) => {
                // a sick cache must not fail the read
                warn!(error = %e, "local block store failed, falling through to remote");
            }
        }
        let block = self.remote.get_stored_block(block_hash).await?;
        if let Err(e) = self.local.put_stored_block(block.clone()).await {
            debug!(error = %e, "could not backfill local block store");
        }
        Ok(block)
    }

    #[instrument(skip_all)]
    async fn get_index(&self, hash_identifier: u32) -> Result<StoreIndex, Error> {
        let (local, remote) = tokio::join!(
            self.local.get_index(hash_identifier),
            self.remote.get_index(hash_identifier),
        );
        StoreIndex::merge(&local?, &remote?)
    }

    async fn preflight_get(&self, block_hashes: &[BlockHash]) -> Result<(), Error> {
        self.remote.preflight_get(block_hashes).await
    }

    fn stats(&self) -> Stats {
        self.remote.stats()
    }

    async fn close(&self) -> Result<(), Error> {
        let (local, remote) = tokio::join!(self.local.close(), self.remote.close());
        local?;
        remote
    }
}
