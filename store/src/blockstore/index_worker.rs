//! Single-owner store-index task.
//!
//! Exactly one task owns the in-memory index state: `base`, the last
//! known authoritative view (loaded from the bucket at startup), and
//! `added`, the deltas accumulated since. Merges are cheap per block but
//! serialization is not; a single owner lets consolidation batch deltas
//! and interleave with reads without locking.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use super::consolidate::{read_store_index_fresh, write_store_index};
use super::AtomicStats;
use crate::blob::BlobClient;
use crate::index::{BlockIndex, StoreIndex};
use crate::Error;

pub(crate) enum IndexMessage {
    /// A block was published; fold its index into the pending deltas.
    BlockAdded(BlockIndex),
    /// Snapshot request; the snapshot is a deep copy owned by the caller.
    GetIndex {
        hash_identifier: u32,
        reply: oneshot::Sender<Result<StoreIndex, Error>>,
    },
}

pub(crate) struct IndexWorker {
    pub tx: mpsc::Sender<IndexMessage>,
    pub join: JoinHandle<Result<(), Error>>,
}

pub(crate) fn spawn(client: BlobClient, stats: Arc<AtomicStats>, capacity: usize) -> IndexWorker {
    let (tx, rx) = mpsc::channel(capacity);
    let join = tokio::spawn(run(client, rx, stats));
    IndexWorker { tx, join }
}

#[instrument(skip_all, fields(location = client.location()))]
async fn run(
    client: BlobClient,
    mut rx: mpsc::Receiver<IndexMessage>,
    stats: Arc<AtomicStats>,
) -> Result<(), Error> {
    // Freshest view available at startup; an unreachable bucket degrades
    // to an empty base, consolidation at shutdown still folds the real
    // store back in.
    let base = match read_store_index_fresh(&client).await {
        Ok(index) => index,
        Err(e) => {
            warn!(error = %e, "could not load store index, starting from empty");
            StoreIndex::empty()
        }
    };
    debug!(blocks = base.block_count(), "store index loaded");

    let mut added = StoreIndex::empty();

    // Stop is the closed channel: the inbox drains fully before the
    // pending deltas get consolidated.
    while let Some(message) = rx.recv().await {
        match message {
            IndexMessage::BlockAdded(block_index) => {
                let block_hash = block_index.block_hash;
                if let Err(e) = added.add_block(block_index) {
                    error!(block_hash = format_args!("{:016x}", block_hash), error = %e,
                        "dropping bad block index delta");
                }
            }
            IndexMessage::GetIndex {
                hash_identifier,
                reply,
            } => {
                let snapshot = snapshot(&base, &added, hash_identifier);
                AtomicStats::add(&stats.index_get_count, 1);
                let _ = reply.send(snapshot);
            }
        }
    }

    if !added.is_empty() {
        debug!(blocks = added.block_count(), "consolidating pending deltas");
        write_store_index(&client, &added).await?;
    }
    Ok(())
}

fn snapshot(
    base: &StoreIndex,
    added: &StoreIndex,
    hash_identifier: u32,
) -> Result<StoreIndex, Error> {
    let merged = StoreIndex::merge(base, added)?;
    if merged.hash_identifier() == 0 {
        // empty store adopts the caller's hash function
        return Ok(StoreIndex::new(hash_identifier));
    }
    if merged.hash_identifier() != hash_identifier {
        return Err(Error::Fatal(format!(
            "hash identifier mismatch: store uses 0x{:08x}, requested 0x{:08x}",
            merged.hash_identifier(),
            hash_identifier
        )));
    }
    Ok(merged)
}
