//! Remote block store: a fixed pool of I/O workers over a blob store.
//!
//! Each worker exclusively owns one [BlobClient] and consumes from its
//! own bounded PUT and GET queues; requests are dispatched to the first
//! worker with room, so aggregate queue memory is bounded at
//! `workers · 2048` entries per operation kind and producers block when
//! every queue is full. There is no ordering between PUTs and GETs.
//!
//! Successful PUTs forward the block index to the store-index worker
//! before the caller's completion fires; closing the store drains all
//! queues, quiesces the workers and then stops the index worker, which
//! consolidates any pending deltas into the bucket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::consolidate::{reject_crossed_protocols, Protocol};
use super::index_worker::{self, IndexMessage};
use super::{AtomicStats, BlockStore, Stats};
use crate::blob::{with_retry, BlobClient, BlobStore as BlobStoreFactory};
use crate::block_path::block_path;
use crate::index::{BlockHash, StoreIndex, StoredBlock};
use crate::Error;

/// Per-worker queue capacity for each of PUT and GET.
const QUEUE_CAPACITY: usize = 2048;
/// Base key under which blocks are stored.
const BLOCKS_PREFIX: &str = "chunks";

/// Tuning carried for compatibility with older stores; the protocol does
/// not consult these.
#[derive(Clone, Copy, Debug)]
pub struct RemoteOptions {
    pub target_block_size: u32,
    pub max_chunks_per_block: u32,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            target_block_size: 524288,
            max_chunks_per_block: 1024,
        }
    }
}

struct PutRequest {
    block: StoredBlock,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct GetRequest {
    block_hash: BlockHash,
    reply: oneshot::Sender<Result<StoredBlock, Error>>,
}

/// Live dispatch endpoints; dropped as a unit on close, which closes all
/// worker queues.
struct Senders {
    put: Vec<mpsc::Sender<PutRequest>>,
    get: Vec<mpsc::Sender<GetRequest>>,
    index: mpsc::Sender<IndexMessage>,
}

pub struct RemoteBlockStore {
    location: String,
    options: RemoteOptions,
    senders: parking_lot::Mutex<Option<Arc<Senders>>>,
    rr_put: AtomicUsize,
    rr_get: AtomicUsize,
    worker_joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    index_join: tokio::sync::Mutex<Option<JoinHandle<Result<(), Error>>>>,
    stats: Arc<AtomicStats>,
}

impl RemoteBlockStore {
    /// Open a remote block store over `blob_store` with `num_cpus`
    /// workers. Fails if the bucket is driven by the legacy content-index
    /// protocol.
    pub async fn new(
        blob_store: &BlobStoreFactory,
        options: RemoteOptions,
    ) -> Result<Self, Error> {
        Self::with_worker_count(blob_store, options, num_cpus::get().max(1)).await
    }

    pub async fn with_worker_count(
        blob_store: &BlobStoreFactory,
        options: RemoteOptions,
        worker_count: usize,
    ) -> Result<Self, Error> {
        let index_client = blob_store.new_client()?;
        reject_crossed_protocols(&index_client, Protocol::Partial).await?;

        let stats = Arc::new(AtomicStats::default());
        let index_worker =
            index_worker::spawn(index_client, stats.clone(), worker_count * QUEUE_CAPACITY);

        let mut put = Vec::with_capacity(worker_count);
        let mut get = Vec::with_capacity(worker_count);
        let mut joins = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let client = blob_store.new_client()?;
            let (put_tx, put_rx) = mpsc::channel(QUEUE_CAPACITY);
            let (get_tx, get_rx) = mpsc::channel(QUEUE_CAPACITY);
            put.push(put_tx);
            get.push(get_tx);
            joins.push(tokio::spawn(run_worker(
                client,
                put_rx,
                get_rx,
                index_worker.tx.clone(),
                stats.clone(),
            )));
        }

        debug!(
            location = blob_store.location(),
            workers = worker_count,
            "remote block store open"
        );
        Ok(RemoteBlockStore {
            location: blob_store.location().to_string(),
            options,
            senders: parking_lot::Mutex::new(Some(Arc::new(Senders {
                put,
                get,
                index: index_worker.tx,
            }))),
            rr_put: AtomicUsize::new(0),
            rr_get: AtomicUsize::new(0),
            worker_joins: tokio::sync::Mutex::new(joins),
            index_join: tokio::sync::Mutex::new(Some(index_worker.join)),
            stats,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn options(&self) -> RemoteOptions {
        self.options
    }

    fn senders(&self) -> Result<Arc<Senders>, Error> {
        self.senders
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("block store {} is closed", self.location)))
    }
}

/// Hand `message` to the first worker with queue room, starting the scan
/// at `start`; when every queue is full, block on the scan's first pick.
async fn dispatch<T>(queues: &[mpsc::Sender<T>], start: usize, mut message: T) -> Result<(), Error> {
    let n = queues.len();
    for i in 0..n {
        match queues[(start + i) % n].try_send(message) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(returned)) => message = returned,
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::Cancelled),
        }
    }
    queues[start % n]
        .send(message)
        .await
        .map_err(|_| Error::Cancelled)
}

#[async_trait]
impl BlockStore for RemoteBlockStore {
    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block.block_hash())))]
    async fn put_stored_block(&self, block: StoredBlock) -> Result<(), Error> {
        let senders = self.senders()?;
        let (reply, rx) = oneshot::channel();
        let start = self.rr_put.fetch_add(1, Ordering::Relaxed);
        dispatch(&senders.put, start, PutRequest { block, reply }).await?;
        drop(senders);
        rx.await.map_err(|_| Error::Cancelled)?
    }

    #[instrument(skip_all, fields(block_hash = %format!("{:016x}", block_hash)))]
    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock, Error> {
        let senders = self.senders()?;
        let (reply, rx) = oneshot::channel();
        let start = self.rr_get.fetch_add(1, Ordering::Relaxed);
        dispatch(&senders.get, start, GetRequest { block_hash, reply }).await?;
        drop(senders);
        rx.await.map_err(|_| Error::Cancelled)?
    }

    #[instrument(skip_all)]
    async fn get_index(&self, hash_identifier: u32) -> Result<StoreIndex, Error> {
        let senders = self.senders()?;
        let (reply, rx) = oneshot::channel();
        senders
            .index
            .send(IndexMessage::GetIndex {
                hash_identifier,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        drop(senders);
        rx.await.map_err(|_| Error::Cancelled)?
    }

    fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    #[instrument(skip_all, fields(location = self.location.as_str()))]
    async fn close(&self) -> Result<(), Error> {
        let senders = self.senders.lock().take();
        if senders.is_none() {
            return Ok(());
        }
        drop(senders);

        let joins = std::mem::take(&mut *self.worker_joins.lock().await);
        for join in joins {
            join.await?;
        }
        if let Some(join) = self.index_join.lock().await.take() {
            join.await??;
        }
        debug!("remote block store closed");
        Ok(())
    }
}

async fn run_worker(
    client: BlobClient,
    mut put_rx: mpsc::Receiver<PutRequest>,
    mut get_rx: mpsc::Receiver<GetRequest>,
    index_tx: mpsc::Sender<IndexMessage>,
    stats: Arc<AtomicStats>,
) {
    let mut put_open = true;
    let mut get_open = true;
    // Closed queues drain fully before the worker quiesces.
    while put_open || get_open {
        tokio::select! {
            message = put_rx.recv(), if put_open => match message {
                Some(request) => handle_put(&client, &index_tx, &stats, request).await,
                None => put_open = false,
            },
            message = get_rx.recv(), if get_open => match message {
                Some(request) => handle_get(&client, &stats, request).await,
                None => get_open = false,
            },
        }
    }
}

async fn handle_put(
    client: &BlobClient,
    index_tx: &mpsc::Sender<IndexMessage>,
    stats: &AtomicStats,
    request: PutRequest,
) {
    let PutRequest { block, reply } = request;
    match put_block(client, stats, &block).await {
        Ok(()) => {
            // the delta must reach the index worker before the caller
            // observes completion
            if index_tx
                .send(IndexMessage::BlockAdded(block.index.clone()))
                .await
                .is_err()
            {
                warn!(
                    block_hash = format_args!("{:016x}", block.block_hash()),
                    "index worker gone, delta not recorded"
                );
                let _ = reply.send(Err(Error::Cancelled));
                return;
            }
            let _ = reply.send(Ok(()));
        }
        Err(e) => {
            AtomicStats::add(&stats.block_put_fail_count, 1);
            let _ = reply.send(Err(e));
        }
    }
}

async fn put_block(
    client: &BlobClient,
    stats: &AtomicStats,
    block: &StoredBlock,
) -> Result<(), Error> {
    let key = block_path(BLOCKS_PREFIX, block.block_hash());
    let object = client.new_object(&key)?;
    let object = &object;
    let encoded = block.encode();
    let encoded_ref = &encoded;

    let written = with_retry(
        || async move {
            // content-addressed: presence implies equality
            if object.exists().await? {
                return Ok(false);
            }
            object.write(encoded_ref.clone()).await
        },
        || AtomicStats::add(&stats.block_put_retry_count, 1),
    )
    .await?;

    AtomicStats::add(&stats.blocks_put_count, 1);
    if written {
        AtomicStats::add(&stats.bytes_put_count, encoded.len() as u64);
        AtomicStats::add(&stats.chunks_put_count, block.index.chunk_count() as u64);
    }
    Ok(())
}

async fn handle_get(client: &BlobClient, stats: &AtomicStats, request: GetRequest) {
    let GetRequest { block_hash, reply } = request;
    let result = get_block(client, stats, block_hash).await;
    if let Err(e) = &result {
        if !matches!(e, Error::NotFound(_)) {
            AtomicStats::add(&stats.block_get_fail_count, 1);
        }
    }
    let _ = reply.send(result);
}

async fn get_block(
    client: &BlobClient,
    stats: &AtomicStats,
    block_hash: BlockHash,
) -> Result<StoredBlock, Error> {
    let key = block_path(BLOCKS_PREFIX, block_hash);
    let object = client.new_object(&key)?;
    let object = &object;

    let data = with_retry(
        || object.read(),
        || AtomicStats::add(&stats.block_get_retry_count, 1),
    )
    .await?;

    let block = StoredBlock::decode(data.clone())?;
    if block.block_hash() != block_hash {
        return Err(Error::Corruption(format!(
            "block {} carries content hash {:016x}, which does not match its key",
            key,
            block.block_hash()
        )));
    }

    AtomicStats::add(&stats.blocks_get_count, 1);
    AtomicStats::add(&stats.bytes_get_count, data.len() as u64);
    AtomicStats::add(&stats.chunks_get_count, block.index.chunk_count() as u64);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stored_block_from_chunks;
    use crate::hashing::HashAlgorithm;

    async fn open_test_store(blob_store: &BlobStoreFactory) -> RemoteBlockStore {
        RemoteBlockStore::with_worker_count(blob_store, RemoteOptions::default(), 2)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_block_and_payload() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        let block = stored_block_from_chunks(&[b"0123456789", b"01234567890123456789"]);
        store.put_stored_block(block.clone()).await.unwrap();

        let fetched = store.get_stored_block(block.block_hash()).await.unwrap();
        assert_eq!(fetched.index, block.index);
        assert_eq!(fetched.payload, block.payload);

        let stats = store.stats();
        assert_eq!(stats.blocks_put_count, 1);
        assert_eq!(stats.blocks_get_count, 1);
        assert_eq!(stats.chunks_put_count, 2);
        assert_eq!(stats.chunks_get_count, 2);
        assert_eq!(stats.bytes_put_count, block.encoded_len() as u64);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn synthetic_chunk_hashes_round_trip_untouched() {
        use bytes::Bytes;

        use crate::compression::TAG_NONE;
        use crate::index::BlockIndex;

        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        // the store treats chunk hashes and payload as opaque
        let chunk_hashes = vec![0x4711, 0x1147];
        let chunk_sizes = vec![10, 20];
        let block_hash = BlockIndex::compute_block_hash(
            HashAlgorithm::Blake3,
            &chunk_hashes,
            &chunk_sizes,
            TAG_NONE,
        );
        let block = StoredBlock {
            index: BlockIndex {
                hash_identifier: HashAlgorithm::Blake3.identifier(),
                tag: TAG_NONE,
                block_hash,
                chunk_hashes,
                chunk_sizes,
            },
            payload: Bytes::from(vec![0xabu8; 30]),
        };

        store.put_stored_block(block.clone()).await.unwrap();
        let fetched = store.get_stored_block(block_hash).await.unwrap();
        assert_eq!(fetched.index, block.index);
        assert_eq!(fetched.payload, block.payload);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn putting_a_present_block_counts_no_bytes() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        let block = stored_block_from_chunks(&[b"0123456789"]);
        store.put_stored_block(block.clone()).await.unwrap();
        let after_first = store.stats();
        store.put_stored_block(block.clone()).await.unwrap();
        let after_second = store.stats();

        assert_eq!(after_second.blocks_put_count, 2);
        assert_eq!(after_second.bytes_put_count, after_first.bytes_put_count);
        assert_eq!(after_second.chunks_put_count, after_first.chunks_put_count);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_block_is_not_found_without_retries() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        assert!(matches!(
            store.get_stored_block(0x4711).await,
            Err(Error::NotFound(_))
        ));
        let stats = store.stats();
        assert_eq!(stats.block_get_retry_count, 0);
        assert_eq!(stats.block_get_fail_count, 0);
        assert_eq!(stats.blocks_get_count, 0);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_publishes_deltas_for_fresh_readers() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        let block = stored_block_from_chunks(&[b"0123456789"]);
        store.put_stored_block(block.clone()).await.unwrap();
        store.close().await.unwrap();

        let reader = open_test_store(&blob_store).await;
        let index = reader
            .get_index(HashAlgorithm::Blake3.identifier())
            .await
            .unwrap();
        assert!(index.contains_block(block.block_hash()));
        assert_eq!(reader.stats().index_get_count, 1);
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;
        store.close().await.unwrap();
        store.close().await.unwrap(); // idempotent

        let block = stored_block_from_chunks(&[b"x"]);
        assert!(store.put_stored_block(block).await.is_err());
        assert!(store.get_stored_block(1).await.is_err());
    }

    #[tokio::test]
    async fn deltas_are_visible_to_get_index_before_close() {
        let blob_store = BlobStoreFactory::new("memory://").unwrap();
        let store = open_test_store(&blob_store).await;

        let block = stored_block_from_chunks(&[b"0123456789"]);
        store.put_stored_block(block.clone()).await.unwrap();

        let index = store
            .get_index(HashAlgorithm::Blake3.identifier())
            .await
            .unwrap();
        assert!(index.contains_block(block.block_hash()));

        store.close().await.unwrap();
    }
}
