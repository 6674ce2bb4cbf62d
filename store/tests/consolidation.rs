//! Multi-writer convergence of the store index over one bucket.

use blocksync_store::blockstore::{read_store_index, read_store_index_fresh};
use blocksync_store::fixtures::stored_block_from_chunks;
use blocksync_store::{
    BlobStore, BlockStore, HashAlgorithm, RemoteBlockStore, RemoteOptions, StoredBlock,
};

async fn open_store(blob_store: &BlobStore) -> RemoteBlockStore {
    RemoteBlockStore::with_worker_count(blob_store, RemoteOptions::default(), 2)
        .await
        .expect("open block store")
}

fn chunk(data: &[u8]) -> StoredBlock {
    stored_block_from_chunks(&[data])
}

#[tokio::test]
async fn two_writers_racing_the_same_block_converge_to_one_entry() {
    let blob_store = BlobStore::new("memory://").unwrap();
    let writer_a = open_store(&blob_store).await;
    let writer_b = open_store(&blob_store).await;

    let block = stored_block_from_chunks(&[b"identical", b"content"]);
    let (a, b) = tokio::join!(
        writer_a.put_stored_block(block.clone()),
        writer_b.put_stored_block(block.clone()),
    );
    a.unwrap();
    b.unwrap();

    let (a, b) = tokio::join!(writer_a.close(), writer_b.close());
    a.unwrap();
    b.unwrap();

    let client = blob_store.new_client().unwrap();
    let blocks = client.get_objects("chunks/").await.unwrap();
    assert_eq!(blocks.len(), 1, "content addressing deduplicates the blob");

    let index = read_store_index(&client).await.unwrap();
    assert_eq!(index.block_count(), 1);
    assert!(index.contains_block(block.block_hash()));
}

#[tokio::test]
async fn three_writers_with_overlapping_sets_converge() {
    let blob_store = BlobStore::new("memory://").unwrap();

    let a = chunk(b"block a");
    let b = chunk(b"block b");
    let c = chunk(b"block c");
    let d = chunk(b"block d");

    // {A,B}, {B,C}, {D}
    let sets: Vec<Vec<StoredBlock>> = vec![
        vec![a.clone(), b.clone()],
        vec![b.clone(), c.clone()],
        vec![d.clone()],
    ];
    for set in &sets {
        let writer = open_store(&blob_store).await;
        for block in set {
            writer.put_stored_block(block.clone()).await.unwrap();
        }
        writer.close().await.unwrap();
    }

    let reader = open_store(&blob_store).await;
    let snapshot = reader
        .get_index(HashAlgorithm::Blake3.identifier())
        .await
        .unwrap();
    for block in [&a, &b, &c, &d] {
        assert!(snapshot.contains_block(block.block_hash()));
    }
    assert_eq!(snapshot.block_count(), 4);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_writers_with_disjoint_sets_are_all_observed() {
    let blob_store = BlobStore::new("memory://").unwrap();

    let mut writers = Vec::new();
    let mut all_blocks = Vec::new();
    for i in 0..4u32 {
        let writer = open_store(&blob_store).await;
        let mut blocks = Vec::new();
        for j in 0..3u32 {
            blocks.push(chunk(format!("writer {} block {}", i, j).as_bytes()));
        }
        all_blocks.extend(blocks.iter().map(|b| b.block_hash()));
        writers.push((writer, blocks));
    }

    // publish and shut down all writers concurrently; closes race their
    // consolidation runs against each other
    let mut handles = Vec::new();
    for (writer, blocks) in writers {
        handles.push(async move {
            for block in blocks {
                writer.put_stored_block(block).await?;
            }
            writer.close().await
        });
    }
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    let client = blob_store.new_client().unwrap();
    let observed = read_store_index_fresh(&client).await.unwrap();
    for hash in &all_blocks {
        assert!(observed.contains_block(*hash), "missing {:016x}", hash);
    }
    assert_eq!(observed.block_count(), all_blocks.len());
}

#[tokio::test]
async fn published_deltas_survive_without_any_reader_racing() {
    // a writer that publishes and leaves; a later writer must absorb its
    // partial even if store.lsi was never the freshest view
    let blob_store = BlobStore::new("memory://").unwrap();

    let first = open_store(&blob_store).await;
    let early = chunk(b"early");
    first.put_stored_block(early.clone()).await.unwrap();
    first.close().await.unwrap();

    let second = open_store(&blob_store).await;
    let late = chunk(b"late");
    second.put_stored_block(late.clone()).await.unwrap();
    second.close().await.unwrap();

    let client = blob_store.new_client().unwrap();
    let index = read_store_index(&client).await.unwrap();
    assert!(index.contains_block(early.block_hash()));
    assert!(index.contains_block(late.block_hash()));
}
