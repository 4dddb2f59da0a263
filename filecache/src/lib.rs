//! Cache byte ranges of many open files in a shared pool of fixed-size slots.
//!
//! Each file opened through a [FileCache] is divided into [LINE_SIZE] cache lines. Lines are
//! loaded with asynchronous reads of up to one [BLOCK_SIZE] block and copied into slots of a
//! [Pool] shared by every file of a [Cache]. When the pool is full, the [Policy] evicts the least
//! recently used line of any file.
//!
//! Reads never block: [FileCache::read_data] returns the requested bytes when every line they span
//! is resident and otherwise issues the reads needed to load the missing lines and returns `None`,
//! expecting the caller to try again later.
//!
//! # Status
//!
//! `commonware-filecache` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.
//!
//! # Example
//!
//! ```rust
//! use commonware_filecache::{
//!     storage::{memory, Priority},
//!     Cache, Config, FileCache,
//! };
//! use prometheus_client::registry::Registry;
//!
//! let storage = memory::Storage::new(memory::Completion::Deferred);
//! storage.insert("blob", vec![7u8; 100_000]);
//!
//! let cache = Cache::new(Default::default(), &mut Registry::default());
//! let file = FileCache::open(&storage, "blob", Config::new(cache)).unwrap();
//!
//! // The first read misses and schedules the lines it needs.
//! assert!(file.read_data(1_000, 70_000, Priority::Normal).is_none());
//! storage.complete_all();
//!
//! // Once the reads have completed, the same read is served from the pool.
//! let data = file.read_data(1_000, 70_000, Priority::Normal).unwrap();
//! assert_eq!(data.len(), 70_000);
//! file.close();
//! ```

use std::io::Error as IoError;
use thiserror::Error;

mod cache;
pub use cache::{Cache, Config as CacheConfig};
mod file;
pub use file::{Config, Eligibility, FileCache};
pub mod identifier;
pub use identifier::{BlockId, LineId, SlotId};
mod metrics;
pub use metrics::Metrics;
mod policy;
pub use policy::{FileId, Owner, Policy};
mod pool;
pub use pool::Pool;
pub mod residency;
pub use residency::Residency;
pub mod storage;

/// Size of a cache line, and of a slot.
pub const LINE_SIZE: usize = 64 * 1024;

/// Number of lines loaded by one read.
pub const LINES_PER_BLOCK: usize = 8;

/// Largest read issued to storage.
pub const BLOCK_SIZE: usize = LINE_SIZE * LINES_PER_BLOCK;

/// Errors that can occur when interacting with the cache.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open {0}: {1}")]
    OpenFailed(String, #[source] IoError),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("failed to determine size of {0}: {1}")]
    SizeFailed(String, #[source] IoError),
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),
    #[error("read failed")]
    ReadFailed,
    #[error("read returned fewer bytes than requested")]
    ShortRead,
    #[error("read canceled")]
    Canceled,
    #[error("pool has {pool} slots but policy manages {policy}")]
    SlotMismatch { pool: usize, policy: usize },
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
