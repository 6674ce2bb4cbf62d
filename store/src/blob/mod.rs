//! Object-storage surface: [BlobStore] parses a storage URI and hands out
//! [BlobClient]s (one logical connection each); a [BlobObject] is a lazy
//! handle to a single key.
//!
//! Backends are whatever [object_store] supports behind the accepted
//! schemes: `gs://bucket/prefix`, `s3://bucket/prefix`,
//! `file:///absolute/path` and `memory://` (tests). Unknown schemes are
//! rejected at creation. Clients of one `memory://` store share a single
//! in-memory namespace; gs/s3/file clients each carry their own backend
//! connection so a worker task fully owns its client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};
use tracing::debug;
use url::Url;

use crate::Error;

/// Delays between the attempts of the retry ladder: immediate retry,
/// then 500 ms, then 2 s.
const RETRY_DELAYS: [Option<Duration>; 3] = [
    None,
    Some(Duration::from_millis(500)),
    Some(Duration::from_secs(2)),
];

/// Generation token of an object, used for conditional overwrites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    e_tag: Option<String>,
    version: Option<String>,
}

/// Condition attached to a [BlobObject::write_if] call.
#[derive(Clone, Debug)]
pub enum WriteCondition {
    DoesNotExist,
    GenerationMatch(Generation),
}

/// One listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobProperties {
    /// Key relative to the store prefix.
    pub name: String,
    pub size: u64,
}

/// Factory for blob clients against one storage URI.
pub struct BlobStore {
    url: Url,
    location: String,
    // memory:// clients must share one namespace per store.
    shared_memory: Option<Arc<InMemory>>,
}

impl BlobStore {
    pub fn new(uri: &str) -> Result<Self, Error> {
        let url = Url::parse(uri)
            .map_err(|e| Error::Config(format!("unable to parse storage uri: {}", e)))?;
        let shared_memory = match url.scheme() {
            "gs" | "s3" => {
                if !url.has_host() {
                    return Err(Error::Config(format!(
                        "storage uri '{}' is missing a bucket",
                        uri
                    )));
                }
                None
            }
            "file" => {
                if url.has_host() {
                    return Err(Error::Config(
                        "file storage uris must not carry a host".to_string(),
                    ));
                }
                if url.path().is_empty() || url.path() == "/" {
                    return Err(Error::Config(
                        "file storage uris need an absolute path".to_string(),
                    ));
                }
                None
            }
            "memory" => Some(Arc::new(InMemory::new())),
            scheme => {
                return Err(Error::Config(format!(
                    "unknown storage scheme '{}'",
                    scheme
                )))
            }
        };
        Ok(BlobStore {
            location: url.to_string(),
            url,
            shared_memory,
        })
    }

    /// One logical connection. Cheap to create but not free; callers that
    /// run many parallel operations create one client per worker.
    pub fn new_client(&self) -> Result<BlobClient, Error> {
        let (store, base): (Arc<dyn ObjectStore>, Path) = match &self.shared_memory {
            Some(memory) => {
                let trimmed = self.url.path().trim_start_matches('/');
                let base = if trimmed.is_empty() {
                    Path::default()
                } else {
                    Path::parse(trimmed)
                        .map_err(|e| Error::Config(format!("invalid memory prefix: {}", e)))?
                };
                (memory.clone(), base)
            }
            None => {
                let (store, base) = object_store::parse_url(&self.url)
                    .map_err(|e| Error::Config(format!("cannot open {}: {}", self.location, e)))?;
                (Arc::from(store), base)
            }
        };
        Ok(BlobClient {
            store,
            base,
            location: self.location.clone(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

/// One logical connection to a blob store.
#[derive(Clone)]
pub struct BlobClient {
    store: Arc<dyn ObjectStore>,
    base: Path,
    location: String,
}

impl BlobClient {
    /// Handle to one key, relative to the store prefix. Performs no I/O.
    pub fn new_object(&self, key: &str) -> Result<BlobObject, Error> {
        let relative =
            Path::parse(key).map_err(|e| Error::Config(format!("invalid key '{}': {}", key, e)))?;
        let path = Path::from_iter(self.base.parts().chain(relative.parts()));
        Ok(BlobObject {
            store: self.store.clone(),
            path,
            key: key.to_string(),
        })
    }

    /// Unordered listing of all objects under `prefix` (relative to the
    /// store prefix). Names come back relative as well.
    pub async fn get_objects(&self, prefix: &str) -> Result<Vec<BlobProperties>, Error> {
        let relative = Path::parse(prefix.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("invalid prefix '{}': {}", prefix, e)))?;
        let full = Path::from_iter(self.base.parts().chain(relative.parts()));
        let metas: Vec<object_store::ObjectMeta> =
            match self.store.list(Some(&full)).try_collect().await {
                Ok(metas) => metas,
                // an unborn prefix lists as empty on every backend
                Err(object_store::Error::NotFound { .. }) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
        let mut objects = Vec::with_capacity(metas.len());
        for meta in metas {
            let name = match meta.location.prefix_match(&self.base) {
                Some(parts) => parts.map(|p| p.as_ref().to_string()).collect::<Vec<_>>().join("/"),
                None => meta.location.to_string(),
            };
            objects.push(BlobProperties {
                name,
                size: meta.size as u64,
            });
        }
        Ok(objects)
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Handle to one object.
pub struct BlobObject {
    store: Arc<dyn ObjectStore>,
    path: Path,
    key: String,
}

impl BlobObject {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        match self.store.head(&self.path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self) -> Result<Bytes, Error> {
        let result = self.store.get(&self.path).await?;
        Ok(result.bytes().await?)
    }

    /// Read the object together with its generation token, for a later
    /// [BlobObject::write_if] with [WriteCondition::GenerationMatch].
    pub async fn read_with_generation(&self) -> Result<(Bytes, Generation), Error> {
        let result = self.store.get(&self.path).await?;
        let generation = Generation {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        Ok((result.bytes().await?, generation))
    }

    /// Unconditional write. Returns whether bytes were written (always
    /// true on success; presence short-cuts are the caller's business).
    pub async fn write(&self, data: Bytes) -> Result<bool, Error> {
        self.store.put(&self.path, data.into()).await?;
        Ok(true)
    }

    /// Conditional write. Fails with [Error::PreconditionFailed] when the
    /// condition does not hold, distinguishable from generic I/O errors.
    /// Not every backend supports every condition; unsupported ones
    /// surface as [Error::Fatal].
    pub async fn write_if(&self, condition: WriteCondition, data: Bytes) -> Result<(), Error> {
        let mode = match condition {
            WriteCondition::DoesNotExist => PutMode::Create,
            WriteCondition::GenerationMatch(generation) => PutMode::Update(UpdateVersion {
                e_tag: generation.e_tag,
                version: generation.version,
            }),
        };
        let opts = PutOptions::from(mode);
        self.store.put_opts(&self.path, data.into(), opts).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.store.delete(&self.path).await?;
        Ok(())
    }
}

/// The retry ladder: attempt, immediate retry, 500 ms, 2 s. Recovers
/// [Error::Transient] only; anything else short-circuits. `on_retry`
/// fires once per retry (stats counters hook in here). The final failure
/// degrades to [Error::Fatal].
pub(crate) async fn with_retry<T, F, Fut, R>(mut op: F, mut on_retry: R) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    R: FnMut(),
{
    let mut last = match op().await {
        Ok(value) => return Ok(value),
        Err(Error::Transient(msg)) => msg,
        Err(e) => return Err(e),
    };
    for delay in RETRY_DELAYS {
        if let Some(delay) = delay {
            debug!(delay_ms = delay.as_millis() as u64, "delaying retry");
            tokio::time::sleep(delay).await;
        }
        on_retry();
        last = match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Transient(msg)) => msg,
            Err(e) => return Err(e),
        };
    }
    Err(Error::Fatal(format!("retries exhausted: {}", last)))
}

/// [with_retry] over a whole-object read. `NotFound` propagates without
/// retry.
pub(crate) async fn read_blob_with_retry(
    client: &BlobClient,
    key: &str,
    on_retry: impl FnMut(),
) -> Result<Bytes, Error> {
    let object = client.new_object(key)?;
    with_retry(|| object.read(), on_retry).await
}

/// [with_retry] over an unconditional whole-object write.
pub(crate) async fn write_blob_with_retry(
    client: &BlobClient,
    key: &str,
    data: Bytes,
    on_retry: impl FnMut(),
) -> Result<(), Error> {
    let object = client.new_object(key)?;
    let object = &object;
    with_retry(
        || {
            let data = data.clone();
            async move { object.write(data).await.map(|_| ()) }
        },
        on_retry,
    )
    .await
}
