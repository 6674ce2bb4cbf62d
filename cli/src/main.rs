use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use blocksync_store::sync::{self, DownsyncOptions, UpsyncOptions};
use blocksync_store::version::{index_directory, VersionIndex};
use blocksync_store::{
    BlobStore, BlockStore, CacheBlockStore, CompressionAlgorithm, FsBlockStore, HashAlgorithm,
    RemoteBlockStore, RemoteOptions,
};

/// Replicate chunked directory versions through an object store.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Upload a directory version, publishing only blocks the remote lacks.
    Upsync {
        /// Storage URI (gs://, s3://, file:// or memory://).
        #[arg(long)]
        storage_uri: String,
        /// Source directory to publish.
        #[arg(long)]
        source_path: PathBuf,
        /// Optional pre-computed index of source-path.
        #[arg(long)]
        source_index_path: Option<PathBuf>,
        /// Version index key to write, relative to the storage URI.
        #[arg(long)]
        target_path: String,
        /// Target chunk size.
        #[arg(long, default_value_t = 32768)]
        target_chunk_size: u32,
        /// Target block size.
        #[arg(long, default_value_t = 524288)]
        target_block_size: u32,
        /// Max chunks per block.
        #[arg(long, default_value_t = 1024)]
        max_chunks_per_block: u32,
        /// Compression algorithm: none, brotli[_min|_max],
        /// brotli_text[_min|_max], lz4, zstd[_min|_max].
        #[arg(long, default_value = "zstd")]
        compression_algorithm: String,
        /// Hashing algorithm: blake2, blake3.
        #[arg(long, default_value = "blake3")]
        hash_algorithm: String,
    },
    /// Materialize a version into a directory, fetching only blocks the
    /// local cache lacks.
    Downsync {
        /// Storage URI (gs://, s3://, file:// or memory://).
        #[arg(long)]
        storage_uri: String,
        /// Version index key to read, relative to the storage URI.
        #[arg(long)]
        source_path: String,
        /// Target directory.
        #[arg(long)]
        target_path: PathBuf,
        /// Optional pre-computed index of target-path.
        #[arg(long)]
        target_index_path: Option<PathBuf>,
        /// Location for downloaded/cached blocks.
        #[arg(long)]
        content_path: Option<PathBuf>,
        /// Disable setting permissions on files/directories from source.
        #[arg(long)]
        no_retain_permissions: bool,
        /// Hashing algorithm: blake2, blake3.
        #[arg(long, default_value = "blake3")]
        hash_algorithm: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.as_filter()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Upsync {
            storage_uri,
            source_path,
            source_index_path,
            target_path,
            target_chunk_size,
            target_block_size,
            max_chunks_per_block,
            compression_algorithm,
            hash_algorithm,
        } => {
            let hash = HashAlgorithm::from_name(&hash_algorithm)?;
            let compression = CompressionAlgorithm::from_name(&compression_algorithm)?;
            let options = UpsyncOptions {
                target_chunk_size,
                target_block_size,
                max_chunks_per_block,
                compression,
                hash,
            };

            let blob_store = BlobStore::new(&storage_uri)?;
            let block_store = RemoteBlockStore::new(
                &blob_store,
                RemoteOptions {
                    target_block_size,
                    max_chunks_per_block,
                },
            )
            .await?;

            let version = match &source_index_path {
                Some(path) => {
                    let version = read_version_index_file(path).await?;
                    if version.hash_identifier != hash.identifier() {
                        bail!(
                            "index {:?} was not hashed with {}",
                            path,
                            hash_algorithm
                        );
                    }
                    version
                }
                None => index_directory(&source_path, hash, target_chunk_size).await?,
            };

            let result = sync::upsync(
                &blob_store,
                &block_store,
                &source_path,
                &version,
                &target_path,
                &options,
            )
            .await;
            let close_result = block_store.close().await;
            debug!(stats = ?block_store.stats(), "block store stats");
            let summary = result?;
            close_result?;

            info!(
                chunks = summary.total_chunks,
                missing = summary.missing_chunks,
                blocks = summary.published_blocks,
                "upsync complete"
            );
        }
        Command::Downsync {
            storage_uri,
            source_path,
            target_path,
            target_index_path,
            content_path,
            no_retain_permissions,
            hash_algorithm,
        } => {
            let expected_hash = HashAlgorithm::from_name(&hash_algorithm)?;
            let blob_store = BlobStore::new(&storage_uri)?;

            let target_version = sync::read_version_index(&blob_store, &source_path).await?;
            let hash = HashAlgorithm::from_identifier(target_version.hash_identifier)?;
            if hash != expected_hash {
                bail!(
                    "version {} was hashed with {}, but {} was requested",
                    source_path,
                    hash,
                    expected_hash
                );
            }

            let remote: Arc<dyn BlockStore> =
                Arc::new(RemoteBlockStore::new(&blob_store, RemoteOptions::default()).await?);
            let block_store: Arc<dyn BlockStore> = match &content_path {
                Some(cache_dir) => Arc::new(CacheBlockStore::new(
                    Arc::new(FsBlockStore::new(cache_dir.clone())),
                    remote,
                )),
                None => remote,
            };

            let local_version = match &target_index_path {
                Some(path) => read_version_index_file(path).await?,
                None => {
                    index_directory(&target_path, hash, target_version.target_chunk_size).await?
                }
            };

            let result = sync::downsync(
                block_store.as_ref(),
                &target_version,
                &local_version,
                &target_path,
                &DownsyncOptions {
                    retain_permissions: !no_retain_permissions,
                },
            )
            .await;
            let close_result = block_store.close().await;
            debug!(stats = ?block_store.stats(), "block store stats");
            let summary = result?;
            close_result?;

            info!(
                written = summary.written_assets,
                removed = summary.removed_assets,
                "downsync complete"
            );
        }
    }

    Ok(())
}

async fn read_version_index_file(path: &PathBuf) -> anyhow::Result<VersionIndex> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading version index {:?}", path))?;
    Ok(VersionIndex::decode(&data)?)
}
