//! A cached view of one open file.
//!
//! # Reads
//!
//! [FileCache::read_data] never waits for storage. It locks every line the requested range spans
//! and, if all of them are resident, copies the range out of the pool. Lines that are missing are
//! handed to the batcher, which issues reads of up to one [BLOCK_SIZE] block starting at the first
//! missing line, skipping resident lines at the tail of the block and reads identical to one
//! already in flight. At most [Config::max_in_flight] reads are outstanding at once; lines that
//! could not be requested are requested again by a later call.
//!
//! # Completions
//!
//! A completed read only pushes a record onto a lock-free queue. Records are drained at the start
//! of every [FileCache::read_data] (and by [FileCache::wait_all]): each line the read covered that
//! is still unavailable is copied into a slot obtained from the [crate::Policy] and mapped. Lines
//! that became resident in the meantime are discarded.
//!
//! # Teardown
//!
//! [FileCache::close] waits for every outstanding read before evicting the file's lines. Dropping
//! a handle instead cancels outstanding reads and discards whatever they return. Either way, every
//! slot the file owned is free once the handle is gone.

use crate::{
    cache::Cache,
    identifier::{LineId, SlotId},
    policy::{FileId, Owner},
    residency::{Acquire, Residency, Status},
    storage::{Priority, Reader, Request, Storage},
    Error, BLOCK_SIZE, LINE_SIZE,
};
use bytes::{Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use std::{
    collections::HashSet,
    mem,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    thread,
};
use tracing::{debug, trace, warn};

/// When a freshly cached line may be evicted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Eligibility {
    /// As soon as it is mapped. Under heavy pressure a line may be evicted before anyone reads it.
    #[default]
    Immediate,

    /// Once a call to [FileCache::read_data] has returned data covering it. Lines that are never
    /// read hold their slot until the file is closed.
    AfterFirstRead,
}

/// Configuration for a [FileCache].
#[derive(Clone)]
pub struct Config {
    /// The cache whose pool and policy the file shares.
    pub cache: Cache,

    /// Maximum number of reads outstanding at once.
    pub max_in_flight: NonZeroUsize,

    /// When cached lines become eligible for eviction.
    pub eligibility: Eligibility,
}

impl Config {
    /// A configuration with 32 reads in flight and [Eligibility::Immediate].
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            max_in_flight: NonZeroUsize::new(32).unwrap(),
            eligibility: Eligibility::Immediate,
        }
    }
}

struct InFlight<Q> {
    id: u64,
    offset: u64,
    len: usize,
    request: Q,
}

struct Requests<Q> {
    in_flight: Vec<InFlight<Q>>,
    next_id: u64,
}

struct Completed {
    id: u64,
    offset: u64,
    len: usize,
    result: Result<Bytes, Error>,
}

/// Reads byte ranges of one file through a shared [Cache].
pub struct FileCache<R: Reader> {
    id: FileId,
    reader: R,
    size: u64,
    residency: Arc<Residency>,
    cache: Cache,
    max_in_flight: usize,
    eligibility: Eligibility,

    requests: Mutex<Requests<R::Request>>,
    completed: Arc<SegQueue<Completed>>,

    /// Lines mapped but not yet read. Held for the whole of a completion so that lines of this
    /// file are only ever mapped by one thread at a time.
    unread: Mutex<HashSet<LineId>>,
}

impl<R: Reader> FileCache<R> {
    /// Open `name` in `storage`.
    pub fn open<S>(storage: &S, name: &str, cfg: Config) -> Result<Self, Error>
    where
        S: Storage<Reader = R>,
    {
        let reader = storage.open(name)?;
        Self::new(reader, cfg)
    }

    /// Cache an already opened file.
    pub fn new(reader: R, cfg: Config) -> Result<Self, Error> {
        let size = reader.size()?;
        let lines = usize::try_from(LineId::count(size)).map_err(|_| Error::FileTooLarge(size))?;
        let residency = Arc::new(Residency::new(lines));
        let id = cfg.cache.policy().register(residency.clone());
        debug!(file = %id, size, lines, "opened");
        Ok(Self {
            id,
            reader,
            size,
            residency,
            cache: cfg.cache,
            max_in_flight: cfg.max_in_flight.get(),
            eligibility: cfg.eligibility,
            requests: Mutex::new(Requests {
                in_flight: Vec::new(),
                next_id: 0,
            }),
            completed: Arc::new(SegQueue::new()),
            unread: Mutex::new(HashSet::new()),
        })
    }

    pub const fn id(&self) -> FileId {
        self.id
    }

    /// Size of the file in bytes, as of when it was opened.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Number of cache lines in the file.
    pub fn lines(&self) -> usize {
        self.residency.len()
    }

    /// Number of reads issued and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.requests.lock().unwrap().in_flight.len()
    }

    /// Read `len` bytes at `offset`, or return `None` and schedule reads of whatever is missing.
    ///
    /// The range is truncated at the end of the file. Empty ranges (including any range starting
    /// at or past the end of the file) return an empty buffer.
    pub fn read_data(&self, offset: u64, len: usize, priority: Priority) -> Option<Bytes> {
        self.process_completed();

        let end = offset.saturating_add(len as u64).min(self.size);
        if offset >= end {
            return Some(Bytes::new());
        }

        // Lock every line of the range.
        let first = LineId::from_offset(offset);
        let last = LineId::from_offset(end - 1);
        let policy = self.cache.policy();
        let mut locked = Vec::new();
        let mut missing = Vec::new();
        let mut contended = false;
        let mut line = first;
        while line <= last {
            policy.notify_touched(Owner {
                file: self.id,
                line,
            });
            match self.residency.lock(line) {
                Acquire::Acquired(slot) => locked.push((line, slot)),
                Acquire::Contended => contended = true,
                Acquire::Missing => missing.push(line),
            }
            line = line.next();
        }

        // Copy only if the whole range is resident.
        let data = (missing.is_empty() && !contended).then(|| self.copy(offset, end, &locked));
        if data.is_some() && self.eligibility == Eligibility::AfterFirstRead {
            let mut unread = self.unread.lock().unwrap();
            for &(line, slot) in &locked {
                if unread.remove(&line) {
                    policy.make_available_for_eviction(slot);
                }
            }
        }
        for (line, slot) in locked {
            self.residency.unlock(line, slot);
        }

        let metrics = self.cache.metrics();
        if data.is_some() {
            metrics.hits.inc();
        } else {
            metrics.misses.inc();
            trace!(
                file = %self.id,
                offset,
                len,
                missing = missing.len(),
                contended,
                "miss"
            );
        }
        if !missing.is_empty() {
            self.request(&missing, priority);
        }
        data
    }

    fn copy(&self, offset: u64, end: u64, locked: &[(LineId, SlotId)]) -> Bytes {
        let mut buf = BytesMut::with_capacity((end - offset) as usize);
        for &(line, slot) in locked {
            let start = line.offset_in_file();
            let from = (offset.max(start) - start) as usize;
            let to = (end.min(start + LINE_SIZE as u64) - start) as usize;

            // SAFETY: The line is locked, so nothing writes to its slot.
            let bytes = unsafe { self.cache.pool().slot(slot) };
            buf.extend_from_slice(&bytes[from..to]);
        }
        buf.freeze()
    }

    /// Issue the reads needed to load `missing`, which must be sorted.
    fn request(&self, missing: &[LineId], priority: Priority) {
        let metrics = self.cache.metrics();
        let mut requests = self.requests.lock().unwrap();
        let mut index = 0;
        while let Some(&first) = missing.get(index) {
            // Read one block from the first missing line, without re-reading a resident tail.
            let start = first.offset_in_file();
            let end = start.saturating_add(BLOCK_SIZE as u64).min(self.size);
            let mut last = LineId::from_offset(end - 1);
            while last > first && self.residency.is_resident(last) {
                last = last.prev();
            }
            let end = last.next().offset_in_file().min(self.size);
            let len = (end - start) as usize;
            index += missing[index..]
                .iter()
                .take_while(|line| **line <= last)
                .count();

            if requests
                .in_flight
                .iter()
                .any(|entry| entry.offset == start && entry.len == len)
            {
                metrics.reads_deduplicated.inc();
                trace!(file = %self.id, offset = start, len, "read already in flight");
                continue;
            }
            if requests.in_flight.len() >= self.max_in_flight {
                metrics.reads_deferred.inc();
                debug!(
                    file = %self.id,
                    offset = start,
                    in_flight = requests.in_flight.len(),
                    "too many reads in flight"
                );
                return;
            }

            let id = requests.next_id;
            requests.next_id += 1;
            let completed = self.completed.clone();
            let request = self.reader.read(
                start,
                len,
                priority,
                Box::new(move |result| {
                    completed.push(Completed {
                        id,
                        offset: start,
                        len,
                        result,
                    })
                }),
            );
            requests.in_flight.push(InFlight {
                id,
                offset: start,
                len,
                request,
            });
            metrics.reads_issued.inc();
            trace!(file = %self.id, offset = start, len, ?priority, "read issued");
        }
    }

    /// Move the lines of every completed read into the pool.
    ///
    /// Always takes the `unread` lock, so that a caller never returns while records popped by
    /// another thread are still being copied.
    fn process_completed(&self) {
        let mut done = Vec::new();
        {
            let mut unread = self.unread.lock().unwrap();
            while let Some(completed) = self.completed.pop() {
                done.push(completed.id);
                self.complete(&mut unread, completed);
            }
        }
        if done.is_empty() {
            return;
        }
        self.requests
            .lock()
            .unwrap()
            .in_flight
            .retain(|entry| !done.contains(&entry.id));
    }

    fn complete(&self, unread: &mut HashSet<LineId>, completed: Completed) {
        let Completed {
            offset,
            len,
            result,
            ..
        } = completed;
        let result = result.and_then(|data| {
            if data.len() == len {
                Ok(data)
            } else {
                Err(Error::ShortRead)
            }
        });
        let data = match result {
            Ok(data) => data,
            Err(err) => {
                self.cache.metrics().reads_failed.inc();
                warn!(file = %self.id, offset, len, ?err, "read failed");
                return;
            }
        };

        let end = offset + len as u64;
        let mut line = LineId::from_offset(offset);
        while line.offset_in_file() < end {
            let start = line.offset_in_file();
            let stop = start + line.size_in_file(end);
            let chunk = &data[(start - offset) as usize..(stop - offset) as usize];
            if !self.populate(unread, line, chunk) {
                break;
            }
            line = line.next();
        }
    }

    /// Copy `chunk` into a slot and map `line` to it. Returns false if no slot was available.
    fn populate(&self, unread: &mut HashSet<LineId>, line: LineId, chunk: &[u8]) -> bool {
        let metrics = self.cache.metrics();
        if self.residency.status(line) != Status::Unavailable {
            metrics.lines_discarded.inc();
            trace!(file = %self.id, %line, "already resident");
            return true;
        }

        let policy = self.cache.policy();
        let owner = Owner {
            file: self.id,
            line,
        };
        let Some(slot) = policy.find_eviction_candidate(owner) else {
            return false;
        };

        // SAFETY: The slot was just claimed and is not mapped, so no one else can reach it.
        let bytes = unsafe { self.cache.pool().slot_mut(slot) };
        bytes[..chunk.len()].copy_from_slice(chunk);

        if !self.residency.map(line, slot) {
            policy.release(slot);
            metrics.lines_discarded.inc();
            return true;
        }

        // Readers that find the line before it is recorded block on `unread` until it is.
        match self.eligibility {
            Eligibility::Immediate => policy.make_available_for_eviction(slot),
            Eligibility::AfterFirstRead => {
                unread.insert(line);
            }
        }
        metrics.lines_cached.inc();
        trace!(file = %self.id, %line, %slot, "cached");
        true
    }

    /// Block until every outstanding read has completed and been drained.
    pub fn wait_all(&self) {
        loop {
            {
                let requests = self.requests.lock().unwrap();
                if requests.in_flight.is_empty() {
                    return;
                }
                for entry in &requests.in_flight {
                    entry.request.wait();
                }
            }
            self.process_completed();
        }
    }

    /// Wait for outstanding reads, then evict every line of the file.
    pub fn close(self) {
        self.wait_all();
        assert_eq!(self.in_flight(), 0, "{} closed with reads in flight", self.id);
    }
}

impl<R: Reader> Drop for FileCache<R> {
    fn drop(&mut self) {
        let requests = self.requests.get_mut().unwrap();
        let in_flight = mem::take(&mut requests.in_flight);
        for entry in &in_flight {
            entry.request.cancel();
        }
        for entry in &in_flight {
            entry.request.wait();
        }
        while self.completed.pop().is_some() {}

        let policy = self.cache.policy();
        if !policy.evict_all(self.id) {
            if thread::panicking() {
                return;
            }
            panic!("{} dropped while a line is locked", self.id);
        }
        policy.unregister(self.id);
        debug!(file = %self.id, canceled = in_flight.len(), "closed");
    }
}
