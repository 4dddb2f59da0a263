//! Asynchronous file reads consumed by [crate::FileCache].
//!
//! A [Reader] issues reads that complete on some other thread by invoking a [Callback] exactly
//! once. The cache never blocks on a read except through [Request::wait].
//!
//! Two implementations are provided:
//! - [disk]: files in a directory, read on a [rayon] thread pool.
//! - [memory]: in-memory files whose reads complete immediately or when the caller decides.

use crate::Error;
use bytes::Bytes;
use std::sync::{Condvar, Mutex};

pub mod disk;
pub mod memory;

/// Scheduling hint attached to a read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Invoked exactly once with the bytes read (exactly the requested length) or the error that
/// prevented the read. The buffer belongs to the callee.
pub type Callback = Box<dyn FnOnce(Result<Bytes, Error>) + Send + 'static>;

/// A source of [Reader]s.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The reader returned by [Storage::open].
    type Reader: Reader;

    /// Open the file called `name`.
    fn open(&self, name: &str) -> Result<Self::Reader, Error>;
}

/// An open file that can be read asynchronously.
pub trait Reader: Send + Sync + 'static {
    /// Handle to an issued read.
    type Request: Request;

    /// The size of the file in bytes.
    fn size(&self) -> Result<u64, Error>;

    /// Read `len` bytes at `offset`, invoking `callback` when done.
    ///
    /// The callback may run on any thread, including (for some implementations) the calling
    /// thread before `read` returns.
    fn read(&self, offset: u64, len: usize, priority: Priority, callback: Callback)
        -> Self::Request;
}

/// An issued read.
pub trait Request: Send + 'static {
    /// Ask for the read to be abandoned. If it has not started, its callback is invoked with
    /// [Error::Canceled].
    fn cancel(&self);

    /// Block until the read's callback has returned.
    fn wait(&self);
}

/// Tracks whether a read's callback has run.
#[derive(Default)]
pub(crate) struct Signal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn finish(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}
