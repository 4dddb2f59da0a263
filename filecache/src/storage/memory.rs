//! In-memory files with caller-controlled completion.

use super::{Callback, Priority, Signal};
use crate::Error;
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// When reads issued against a [Storage] complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// The callback runs on the calling thread before `read` returns.
    #[default]
    Immediate,

    /// The callback runs when the read is completed through [Storage::complete_next],
    /// [Storage::complete_all], or a wait on its [Request].
    Deferred,
}

/// A read observed by a [Storage].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issued {
    pub name: String,
    pub offset: u64,
    pub len: usize,
    pub priority: Priority,
}

struct Pending {
    id: u64,
    result: Result<Bytes, Error>,
    callback: Callback,
    signal: Arc<Signal>,
}

impl Pending {
    fn deliver(self) {
        (self.callback)(self.result);
        self.signal.finish();
    }
}

#[derive(Default)]
struct Inner {
    files: Mutex<HashMap<String, Bytes>>,
    completion: Mutex<Completion>,
    failing: AtomicBool,
    pending: Mutex<VecDeque<Pending>>,
    issued: Mutex<Vec<Issued>>,
    next_id: AtomicU64,
}

impl Inner {
    fn take(&self, id: u64) -> Option<Pending> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.iter().position(|entry| entry.id == id)?;
        pending.remove(index)
    }
}

/// A set of in-memory files.
#[derive(Clone, Default)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    pub fn new(completion: Completion) -> Self {
        let storage = Self::default();
        storage.set_completion(completion);
        storage
    }

    /// Create (or replace) the file called `name`. Readers already open keep the old contents.
    pub fn insert(&self, name: &str, data: impl Into<Bytes>) {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(name.into(), data.into());
    }

    /// Change when subsequently issued reads complete.
    pub fn set_completion(&self, completion: Completion) {
        *self.inner.completion.lock().unwrap() = completion;
    }

    /// Make subsequently issued reads fail with [Error::ReadFailed].
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::Relaxed);
    }

    /// Every read issued so far, oldest first.
    pub fn issued(&self) -> Vec<Issued> {
        self.inner.issued.lock().unwrap().clone()
    }

    /// Number of deferred reads not yet completed.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Complete the oldest deferred read. Returns false if none is pending.
    pub fn complete_next(&self) -> bool {
        let next = self.inner.pending.lock().unwrap().pop_front();
        match next {
            Some(pending) => {
                pending.deliver();
                true
            }
            None => false,
        }
    }

    /// Complete the newest deferred read. Returns false if none is pending.
    pub fn complete_last(&self) -> bool {
        let last = self.inner.pending.lock().unwrap().pop_back();
        match last {
            Some(pending) => {
                pending.deliver();
                true
            }
            None => false,
        }
    }

    /// Complete every deferred read in issue order, returning how many were completed.
    pub fn complete_all(&self) -> usize {
        let pending = mem::take(&mut *self.inner.pending.lock().unwrap());
        let completed = pending.len();
        for entry in pending {
            entry.deliver();
        }
        completed
    }
}

impl super::Storage for Storage {
    type Reader = Reader;

    fn open(&self, name: &str) -> Result<Self::Reader, Error> {
        let data = self
            .inner
            .files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        Ok(Reader {
            name: name.into(),
            data,
            inner: self.inner.clone(),
        })
    }
}

/// A file opened by [Storage].
pub struct Reader {
    name: String,
    data: Bytes,
    inner: Arc<Inner>,
}

impl super::Reader for Reader {
    type Request = Request;

    fn size(&self) -> Result<u64, Error> {
        Ok(self.data.len() as u64)
    }

    fn read(
        &self,
        offset: u64,
        len: usize,
        priority: Priority,
        callback: Callback,
    ) -> Self::Request {
        self.inner.issued.lock().unwrap().push(Issued {
            name: self.name.clone(),
            offset,
            len,
            priority,
        });

        let result = if self.inner.failing.load(Ordering::Relaxed) {
            Err(Error::ReadFailed)
        } else {
            usize::try_from(offset)
                .ok()
                .and_then(|start| Some(start..start.checked_add(len)?))
                .filter(|range| range.end <= self.data.len())
                .map(|range| self.data.slice(range))
                .ok_or(Error::ShortRead)
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(Signal::default());
        let pending = Pending {
            id,
            result,
            callback,
            signal: signal.clone(),
        };
        let completion = *self.inner.completion.lock().unwrap();
        match completion {
            Completion::Immediate => pending.deliver(),
            Completion::Deferred => self.inner.pending.lock().unwrap().push_back(pending),
        }
        Request {
            id,
            signal,
            inner: self.inner.clone(),
        }
    }
}

/// A read issued by [Reader].
pub struct Request {
    id: u64,
    signal: Arc<Signal>,
    inner: Arc<Inner>,
}

impl super::Request for Request {
    fn cancel(&self) {
        if let Some(pending) = self.inner.take(self.id) {
            (pending.callback)(Err(Error::Canceled));
            pending.signal.finish();
        }
    }

    /// Completes the read first if it is still deferred.
    fn wait(&self) {
        if let Some(pending) = self.inner.take(self.id) {
            pending.deliver();
        }
        self.signal.wait();
    }
}
