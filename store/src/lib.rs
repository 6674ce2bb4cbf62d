//! Content-addressed, chunked version replication over an object store.
//!
//! Directory trees are split into content-defined chunks, chunks are
//! packed into blocks, and blocks are synchronized through a remote
//! object store shared by many concurrent writers. The authoritative
//! `store.lsi` index converges without any coordination service; see
//! [blockstore] for the consolidation protocol.

pub mod blob;
pub mod block_path;
pub mod blockstore;
pub mod compression;
pub mod errors;
pub mod fixtures;
pub mod hashing;
pub mod index;
pub mod sync;
pub mod version;

pub use errors::Error;

pub use blob::{BlobClient, BlobObject, BlobStore, WriteCondition};
pub use blockstore::{
    cache::CacheBlockStore,
    fs::FsBlockStore,
    remote::{RemoteBlockStore, RemoteOptions},
    BlockStore, Stats,
};
pub use compression::CompressionAlgorithm;
pub use hashing::HashAlgorithm;
pub use index::{BlockHash, BlockIndex, ChunkHash, StoreIndex, StoredBlock};
pub use version::VersionIndex;
