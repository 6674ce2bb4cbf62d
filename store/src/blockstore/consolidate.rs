//! Store-index consolidation: multi-writer convergence of `store.lsi`
//! over an eventually-consistent blob namespace, with no coordination
//! service.
//!
//! Writers publish their deltas as content-addressed partials under
//! `index/`, then absorb every other partial they can see, republishing
//! the grown set under its new name, until two consecutive scans show
//! nothing new; only then is `store.lsi` rewritten. The overwrite is
//! unconditional but monotone: whoever writes `store.lsi` merged the
//! previous `store.lsi` first. A reader that needs the freshest view
//! merges `store.lsi` with every readable partial.
//!
//! The legacy single-object protocol (`store.lci`, generation CAS) is
//! kept for backends that guarantee generational writes. The two
//! protocols must never share a bucket.

use std::collections::HashSet;

use tracing::{debug, instrument, warn};

use crate::blob::{read_blob_with_retry, write_blob_with_retry, BlobClient, WriteCondition};
use crate::index::{
    StoreIndex, CONTENT_INDEX_KEY, PARTIAL_INDEX_EXTENSION, PARTIAL_INDEX_PREFIX, STORE_INDEX_KEY,
};
use crate::Error;

/// Which index protocol a bucket is driven with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    /// `store.lsi` plus `index/*.lsi` partials.
    Partial,
    /// `store.lci` updated via generation CAS.
    Legacy,
}

/// A bucket uses exactly one protocol. Opening it in one mode while the
/// other mode's authoritative object exists is a configuration error.
pub(crate) async fn reject_crossed_protocols(
    client: &BlobClient,
    protocol: Protocol,
) -> Result<(), Error> {
    let other_key = match protocol {
        Protocol::Partial => CONTENT_INDEX_KEY,
        Protocol::Legacy => STORE_INDEX_KEY,
    };
    if client.new_object(other_key)?.exists().await? {
        return Err(Error::Config(format!(
            "'{}' exists in {}; refusing to mix index protocols in one bucket",
            other_key,
            client.location()
        )));
    }
    Ok(())
}

/// Read the authoritative store index; an absent `store.lsi` is an empty
/// store, not an error.
#[instrument(skip_all, fields(location = client.location()))]
pub async fn read_store_index(client: &BlobClient) -> Result<StoreIndex, Error> {
    match read_blob_with_retry(client, STORE_INDEX_KEY, || {}).await {
        Ok(data) => StoreIndex::decode(&data),
        Err(Error::NotFound(_)) => Ok(StoreIndex::empty()),
        Err(e) => Err(e),
    }
}

/// The freshest available view: `store.lsi` merged with every readable
/// `index/*.lsi` partial. Partials that vanish mid-read were absorbed by
/// a concurrent consolidator and are covered by what remains; unreadable
/// ones are skipped with a warning.
#[instrument(skip_all, fields(location = client.location()))]
pub async fn read_store_index_fresh(client: &BlobClient) -> Result<StoreIndex, Error> {
    let mut index = read_store_index(client).await?;
    for partial in list_partials(client).await? {
        match read_partial(client, &partial).await {
            Ok(Some(partial_index)) => index.merge_from(&partial_index)?,
            Ok(None) => {}
            Err(e) => warn!(partial, error = %e, "skipping unreadable partial index"),
        }
    }
    Ok(index)
}

/// Publish `added` and drive the bucket towards a single consolidated
/// `store.lsi`.
///
/// The loop reaches a fixed point only after two consecutive scans found
/// no new partial: a writer that saw nothing new once may still be racing
/// a writer that listed but had not published yet. Requiring a second
/// clean scan after the `store.lsi` write guarantees that whoever is
/// ahead re-reads after the write and the partial order converges.
#[instrument(skip_all, fields(location = client.location(), added = added.block_count()))]
pub async fn write_store_index(client: &BlobClient, added: &StoreIndex) -> Result<(), Error> {
    let mut consolidated = added.clone();
    let mut name = consolidated.partial_name();
    write_partial(client, &name, &consolidated).await?;

    // Partials already merged into `consolidated`, plus ones that can
    // never be (unreadable); neither is fetched again.
    let mut absorbed: HashSet<String> = HashSet::new();
    let mut converged_once = false;

    loop {
        let mut absorbed_this_pass = Vec::new();
        for partial in list_partials(client).await? {
            if partial == name || absorbed.contains(&partial) {
                continue;
            }
            match read_partial(client, &partial).await {
                Ok(Some(partial_index)) => {
                    consolidated.merge_from(&partial_index)?;
                    absorbed.insert(partial.clone());
                    absorbed_this_pass.push(partial);
                }
                Ok(None) => {
                    // a concurrent consolidator absorbed it first
                    absorbed.insert(partial);
                }
                Err(e) => {
                    warn!(partial = %partial, error = %e, "leaving unreadable partial in place");
                    absorbed.insert(partial);
                }
            }
        }

        if !absorbed_this_pass.is_empty() {
            converged_once = false;
            let grown = consolidated.partial_name();
            if grown != name {
                write_partial(client, &grown, &consolidated).await?;
            }
            for partial in &absorbed_this_pass {
                if *partial != grown {
                    delete_partial(client, partial).await;
                }
            }
            if grown != name {
                delete_partial(client, &name).await;
                name = grown;
            }
            continue;
        }

        // Nothing new under index/; fold in the authoritative object and
        // publish.
        let store = read_store_index(client).await?;
        consolidated.merge_from(&store)?;
        let new_name = consolidated.partial_name();
        write_partial(client, &new_name, &consolidated).await?;
        write_blob_with_retry(client, STORE_INDEX_KEY, consolidated.encode(), || {}).await?;
        debug!(
            blocks = consolidated.block_count(),
            "published consolidated store index"
        );

        if new_name == name && converged_once {
            // Two-pass fixed point. The final partial stays behind on
            // purpose: readers and later writers fold it in, and it keeps
            // the "every published block is visible in store.lsi or a
            // partial" guarantee through the unconditional overwrite.
            return Ok(());
        }
        if new_name != name {
            delete_partial(client, &name).await;
            name = new_name;
        }
        converged_once = true;
    }
}

/// Update the legacy `store.lci` content index through a generation-CAS
/// loop: read with generation, merge, write-if-unchanged, retry on
/// conflict. Only for backends that support generational writes.
#[instrument(skip_all, fields(location = client.location(), added = added.block_count()))]
pub async fn update_content_index(client: &BlobClient, added: &StoreIndex) -> Result<(), Error> {
    reject_crossed_protocols(client, Protocol::Legacy).await?;
    let object = client.new_object(CONTENT_INDEX_KEY)?;
    loop {
        match object.read_with_generation().await {
            Ok((data, generation)) => {
                let mut merged = StoreIndex::decode(&data)?;
                merged.merge_from(added)?;
                match object
                    .write_if(WriteCondition::GenerationMatch(generation), merged.encode())
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(Error::PreconditionFailed(_)) => {
                        debug!("content index changed under us, retrying");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(Error::NotFound(_)) => {
                match object
                    .write_if(WriteCondition::DoesNotExist, added.encode())
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(Error::PreconditionFailed(_)) => {
                        debug!("content index appeared under us, retrying");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn list_partials(client: &BlobClient) -> Result<Vec<String>, Error> {
    let objects = client.get_objects(PARTIAL_INDEX_PREFIX).await?;
    Ok(objects
        .into_iter()
        .map(|o| o.name)
        .filter(|name| name.ends_with(PARTIAL_INDEX_EXTENSION))
        .collect())
}

/// `Ok(None)` when the partial vanished (absorbed by a racer).
async fn read_partial(client: &BlobClient, name: &str) -> Result<Option<StoreIndex>, Error> {
    match read_blob_with_retry(client, name, || {}).await {
        Ok(data) => Ok(Some(StoreIndex::decode(&data)?)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn write_partial(client: &BlobClient, name: &str, index: &StoreIndex) -> Result<(), Error> {
    // Content-addressed: a racer with the same block set writes the same
    // bytes to the same key, so plain overwrite is idempotent.
    write_blob_with_retry(client, name, index.encode(), || {}).await
}

/// Delete failures are expected: another consolidator may have removed
/// the partial already.
async fn delete_partial(client: &BlobClient, name: &str) {
    let object = match client.new_object(name) {
        Ok(o) => o,
        Err(_) => return,
    };
    if let Err(e) = object.delete().await {
        match e {
            Error::NotFound(_) => {}
            e => debug!(partial = name, error = %e, "could not delete absorbed partial"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::fixtures::block_index;

    fn index_of(blocks: &[u64]) -> StoreIndex {
        let mut index = StoreIndex::empty();
        for b in blocks {
            index.add_block(block_index(*b, &[(*b ^ 0xff, 4)])).unwrap();
        }
        index
    }

    #[tokio::test]
    async fn empty_bucket_reads_as_empty_index() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();
        assert!(read_store_index(&client).await.unwrap().is_empty());
        assert!(read_store_index_fresh(&client).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_writer_consolidates_into_store_lsi() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        write_store_index(&client, &index_of(&[1, 2, 3])).await.unwrap();

        let read = read_store_index(&client).await.unwrap();
        assert_eq!(read.block_hashes().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sequential_writers_accumulate() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        write_store_index(&client, &index_of(&[1, 2])).await.unwrap();
        write_store_index(&client, &index_of(&[2, 3])).await.unwrap();
        write_store_index(&client, &index_of(&[4])).await.unwrap();

        let read = read_store_index(&client).await.unwrap();
        assert_eq!(read.block_hashes().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stranded_partials_are_absorbed_and_removed() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        // a partial left behind by a writer that died before consolidating
        let stranded = index_of(&[7, 8]);
        write_partial(&client, &stranded.partial_name(), &stranded)
            .await
            .unwrap();

        write_store_index(&client, &index_of(&[1])).await.unwrap();

        let read = read_store_index(&client).await.unwrap();
        assert_eq!(read.block_hashes().collect::<Vec<_>>(), vec![1, 7, 8]);
        let partials = list_partials(&client).await.unwrap();
        assert_eq!(partials, vec![read.partial_name()]);
    }

    #[tokio::test]
    async fn fresh_read_sees_unconsolidated_partials() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        write_store_index(&client, &index_of(&[1])).await.unwrap();
        let stranded = index_of(&[9]);
        write_partial(&client, &stranded.partial_name(), &stranded)
            .await
            .unwrap();

        let stale = read_store_index(&client).await.unwrap();
        assert!(!stale.contains_block(9));
        let fresh = read_store_index_fresh(&client).await.unwrap();
        assert!(fresh.contains_block(1));
        assert!(fresh.contains_block(9));
    }

    #[tokio::test]
    async fn legacy_updater_merges_and_survives_races() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        update_content_index(&client, &index_of(&[1, 2])).await.unwrap();
        update_content_index(&client, &index_of(&[3])).await.unwrap();

        let data = client
            .new_object(CONTENT_INDEX_KEY)
            .unwrap()
            .read()
            .await
            .unwrap();
        let read = StoreIndex::decode(&data).unwrap();
        assert_eq!(read.block_hashes().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn protocols_do_not_cross() {
        let store = BlobStore::new("memory://").unwrap();
        let client = store.new_client().unwrap();

        write_store_index(&client, &index_of(&[1])).await.unwrap();
        assert!(matches!(
            update_content_index(&client, &index_of(&[2])).await,
            Err(Error::Config(_))
        ));

        let legacy_store = BlobStore::new("memory://").unwrap();
        let legacy_client = legacy_store.new_client().unwrap();
        update_content_index(&legacy_client, &index_of(&[1])).await.unwrap();
        assert!(matches!(
            reject_crossed_protocols(&legacy_client, Protocol::Partial).await,
            Err(Error::Config(_))
        ));
    }
}
