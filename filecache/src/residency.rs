//! Per-file residency tracking.
//!
//! A [Residency] holds one atomic status word per cache line of a file. Every transition is a
//! single compare-and-swap on that word, so readers, the completion path, and the eviction
//! policy can all operate on a line without sharing a lock.
//!
//! # Status Encoding
//!
//! Words are decoded into [Status] immediately after every load. `0` is
//! [Status::Unavailable], `1` is [Status::Locked], and `n + 2` is [Status::Resident] in slot `n`.

use crate::identifier::{LineId, SlotId};
use std::sync::atomic::{AtomicU64, Ordering};

const UNAVAILABLE: u64 = 0;
const LOCKED: u64 = 1;
const RESIDENT_BASE: u64 = 2;

/// The state of one cache line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No data is cached for the line.
    Unavailable,

    /// Someone holds the line exclusively. Its slot, if any, is known only to the holder.
    Locked,

    /// The line's bytes live in the given slot.
    Resident(SlotId),
}

impl Status {
    const fn encode(self) -> u64 {
        match self {
            Self::Unavailable => UNAVAILABLE,
            Self::Locked => LOCKED,
            Self::Resident(slot) => slot.get() + RESIDENT_BASE,
        }
    }

    const fn decode(word: u64) -> Self {
        match word {
            UNAVAILABLE => Self::Unavailable,
            LOCKED => Self::Locked,
            slot => Self::Resident(SlotId::new(slot - RESIDENT_BASE)),
        }
    }
}

/// Outcome of [Residency::lock]. Exactly one is reported per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// The line was resident and is now locked by the caller, who must pass the slot back to
    /// [Residency::unlock].
    Acquired(SlotId),

    /// The line is resident (or being evicted) but another holder has it locked.
    Contended,

    /// The line is not resident.
    Missing,
}

/// The residency status of every cache line of one file.
pub struct Residency {
    lines: Box<[AtomicU64]>,
}

impl Residency {
    /// Create a table of `lines` lines, all [Status::Unavailable].
    pub fn new(lines: usize) -> Self {
        Self {
            lines: (0..lines).map(|_| AtomicU64::new(UNAVAILABLE)).collect(),
        }
    }

    /// Number of lines tracked.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the table tracks no lines (the file is empty).
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn word(&self, line: LineId) -> &AtomicU64 {
        &self.lines[line.as_usize()]
    }

    /// The current status of `line`. Stale as soon as it is returned.
    pub fn status(&self, line: LineId) -> Status {
        Status::decode(self.word(line).load(Ordering::Acquire))
    }

    /// Whether `line` is currently resident. Advisory only.
    pub fn is_resident(&self, line: LineId) -> bool {
        matches!(self.status(line), Status::Resident(_))
    }

    /// Try to take exclusive hold of a resident line.
    pub fn lock(&self, line: LineId) -> Acquire {
        let word = self.word(line);
        let mut current = word.load(Ordering::Acquire);
        loop {
            match Status::decode(current) {
                Status::Unavailable => return Acquire::Missing,
                Status::Locked => return Acquire::Contended,
                Status::Resident(slot) => {
                    match word.compare_exchange_weak(
                        current,
                        LOCKED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Acquire::Acquired(slot),
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }

    /// Release a line taken with [Residency::lock], restoring it to resident in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the line is not locked.
    pub fn unlock(&self, line: LineId, slot: SlotId) {
        let restored = Status::Resident(slot).encode();
        if let Err(observed) =
            self.word(line)
                .compare_exchange(LOCKED, restored, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!(
                "unlock of {line} which is {:?}, not locked",
                Status::decode(observed)
            );
        }
    }

    /// Mark an unavailable line resident in `slot`.
    ///
    /// Spins while the line is locked, since a lock is only ever held for a short copy or an
    /// eviction. Returns false, leaving the line untouched, if it turns out to be resident
    /// already; the caller still owns `slot` in that case.
    pub fn map(&self, line: LineId, slot: SlotId) -> bool {
        let word = self.word(line);
        let mapped = Status::Resident(slot).encode();
        loop {
            match word.compare_exchange_weak(
                UNAVAILABLE,
                mapped,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => match Status::decode(observed) {
                    Status::Unavailable => continue,
                    Status::Locked => std::hint::spin_loop(),
                    Status::Resident(_) => return false,
                },
            }
        }
    }

    /// Evict a resident line that nobody holds, returning the slot it occupied.
    ///
    /// Returns `None` if the line is not resident or is locked by someone else.
    pub fn try_evict(&self, line: LineId) -> Option<SlotId> {
        let Acquire::Acquired(slot) = self.lock(line) else {
            return None;
        };
        self.word(line).store(UNAVAILABLE, Ordering::Release);
        Some(slot)
    }
}

impl Drop for Residency {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        for (index, word) in self.lines.iter_mut().enumerate() {
            let status = Status::decode(*word.get_mut());
            assert_eq!(
                status,
                Status::Unavailable,
                "line#{index} still {status:?} when its table was dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::{
        sync::atomic::AtomicBool,
        thread,
        time::Duration,
    };

    #[test_traced]
    fn test_encoding() {
        for status in [
            Status::Unavailable,
            Status::Locked,
            Status::Resident(SlotId::new(0)),
            Status::Resident(SlotId::new(511)),
        ] {
            assert_eq!(Status::decode(status.encode()), status);
        }
    }

    #[test_traced]
    fn test_lock_outcomes() {
        let residency = Residency::new(2);
        let line = LineId::new(1);
        let slot = SlotId::new(5);

        assert_eq!(residency.lock(line), Acquire::Missing);
        assert_eq!(residency.status(line), Status::Unavailable);

        assert!(residency.map(line, slot));
        assert!(residency.is_resident(line));

        assert_eq!(residency.lock(line), Acquire::Acquired(slot));
        assert_eq!(residency.status(line), Status::Locked);
        assert!(!residency.is_resident(line));
        assert_eq!(residency.lock(line), Acquire::Contended);

        residency.unlock(line, slot);
        assert_eq!(residency.status(line), Status::Resident(slot));

        assert_eq!(residency.try_evict(line), Some(slot));
        assert_eq!(residency.status(line), Status::Unavailable);
    }

    #[test_traced]
    fn test_try_evict_refuses_locked_and_missing() {
        let residency = Residency::new(1);
        let line = LineId::new(0);
        let slot = SlotId::new(0);
        assert_eq!(residency.try_evict(line), None);

        assert!(residency.map(line, slot));
        assert_eq!(residency.lock(line), Acquire::Acquired(slot));
        assert_eq!(residency.try_evict(line), None);
        residency.unlock(line, slot);

        assert_eq!(residency.try_evict(line), Some(slot));
    }

    #[test_traced]
    fn test_map_resident_line() {
        let residency = Residency::new(1);
        let line = LineId::new(0);
        assert!(residency.map(line, SlotId::new(1)));
        assert!(!residency.map(line, SlotId::new(2)));
        assert_eq!(residency.status(line), Status::Resident(SlotId::new(1)));
        residency.try_evict(line);
    }

    #[test_traced]
    fn test_map_waits_for_lock() {
        let residency = Residency::new(1);
        let line = LineId::new(0);
        let old = SlotId::new(3);
        let new = SlotId::new(4);
        assert!(residency.map(line, old));
        assert_eq!(residency.lock(line), Acquire::Acquired(old));

        let mapped = AtomicBool::new(false);
        thread::scope(|s| {
            let mapper = s.spawn(|| {
                let result = residency.map(line, new);
                mapped.store(true, Ordering::SeqCst);
                result
            });

            // The mapper cannot make progress while the line is locked.
            thread::sleep(Duration::from_millis(20));
            assert!(!mapped.load(Ordering::SeqCst));

            // Finish an eviction: the mapper then installs the new slot.
            residency.word(line).store(UNAVAILABLE, Ordering::Release);
            assert!(mapper.join().unwrap());
        });
        assert_eq!(residency.status(line), Status::Resident(new));
        assert_eq!(residency.try_evict(line), Some(new));
    }

    #[test_traced]
    #[should_panic(expected = "not locked")]
    fn test_unlock_without_lock() {
        let residency = Residency::new(1);
        residency.unlock(LineId::new(0), SlotId::new(0));
    }

    #[test_traced]
    #[should_panic(expected = "when its table was dropped")]
    fn test_drop_with_resident_line() {
        let residency = Residency::new(1);
        residency.map(LineId::new(0), SlotId::new(0));
        drop(residency);
    }

    #[test_traced]
    fn test_concurrent_lock_is_exclusive() {
        let residency = Residency::new(1);
        let line = LineId::new(0);
        let slot = SlotId::new(7);
        assert!(residency.map(line, slot));

        let holders = AtomicU64::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1_000 {
                        if let Acquire::Acquired(acquired) = residency.lock(line) {
                            assert_eq!(acquired, slot);
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            residency.unlock(line, acquired);
                        }
                    }
                });
            }
        });
        assert_eq!(residency.try_evict(line), Some(slot));
    }
}
