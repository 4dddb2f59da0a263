//! Global least-recently-used slot replacement.
//!
//! The [Policy] decides which slot of the [crate::Pool] a newly read line should occupy. It keeps
//! every _eligible_ slot in a queue ordered by the time the slot was last used, and a reverse map
//! from each owned slot to the `(file, line)` that occupies it.
//!
//! # Eligibility
//!
//! A slot is in the queue when it is free or when its line has been made available for eviction.
//! A slot leaves the queue while it is being claimed and stays out until
//! [Policy::make_available_for_eviction] (or [Policy::release]) is called for it. Free slots are
//! queued with the lowest possible stamp so they are claimed before any resident line is evicted.
//!
//! # Touches
//!
//! Readers report use of a line through [Policy::notify_touched], which only pushes onto a
//! lock-free queue. The queue is applied to the ordering whenever the policy lock is taken, and
//! opportunistically by the reader itself once the backlog exceeds a threshold.

use crate::{
    identifier::{LineId, SlotId},
    metrics::Metrics,
    residency::Residency,
};
use crossbeam_queue::SegQueue;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, trace, warn};

/// Stamp given to free slots.
const FREE: u64 = 0;

/// Identity of an open file, assigned by [Policy::register].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    /// The raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// The line that owns (or is about to own) a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    /// The file the line belongs to.
    pub file: FileId,

    /// The line within that file.
    pub line: LineId,
}

struct Touch {
    owner: Owner,
    stamp: u64,
}

struct State {
    /// Eligible slots, least recently used first.
    queue: BTreeSet<(u64, SlotId)>,

    /// The stamp each slot is queued under, `None` if it is not queued.
    stamps: Vec<Option<u64>>,

    /// The line owning each slot.
    owners: Vec<Option<Owner>>,

    /// Inverse of `owners`.
    slots: HashMap<Owner, SlotId>,

    /// Residency tables of registered files, used to evict their lines.
    files: HashMap<FileId, Arc<Residency>>,
}

/// Decides which slot to reuse when a line is cached. Shared by every file of a [crate::Cache].
pub struct Policy {
    state: Mutex<State>,
    touches: SegQueue<Touch>,
    backlog: AtomicUsize,
    touch_backlog: usize,
    clock: AtomicU64,
    next_file: AtomicU64,
    capacity: usize,
    metrics: Metrics,
}

impl Policy {
    /// Create a policy over `capacity` slots, all initially free.
    ///
    /// Readers drain pending touches themselves once more than `touch_backlog` are queued.
    pub fn new(capacity: NonZeroUsize, touch_backlog: NonZeroUsize, metrics: Metrics) -> Self {
        let capacity = capacity.get();
        let queue = (0..capacity as u64)
            .map(|index| (FREE, SlotId::new(index)))
            .collect();
        Self {
            state: Mutex::new(State {
                queue,
                stamps: vec![Some(FREE); capacity],
                owners: vec![None; capacity],
                slots: HashMap::new(),
                files: HashMap::new(),
            }),
            touches: SegQueue::new(),
            backlog: AtomicUsize::new(0),
            touch_backlog: touch_backlog.get(),
            clock: AtomicU64::new(FREE),
            next_file: AtomicU64::new(0),
            capacity,
            metrics,
        }
    }

    /// Number of slots managed.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register the residency table of a newly opened file.
    pub fn register(&self, residency: Arc<Residency>) -> FileId {
        let file = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().unwrap();
        state.files.insert(file, residency);
        file
    }

    /// Forget a file whose lines have all been evicted.
    ///
    /// # Panics
    ///
    /// Panics if the file still owns a slot.
    pub fn unregister(&self, file: FileId) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.owners.iter().flatten().all(|owner| owner.file != file),
            "{file} unregistered while owning slots"
        );
        state.files.remove(&file);
    }

    /// Record that `owner` was just used. Never blocks.
    pub fn notify_touched(&self, owner: Owner) {
        let stamp = self.next_stamp();

        // Count before pushing so a concurrent drain never observes more touches than counted.
        let backlog = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        self.touches.push(Touch { owner, stamp });
        if backlog <= self.touch_backlog {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            self.drain(&mut state);
        }
    }

    /// Apply queued touches to the ordering.
    fn drain(&self, state: &mut State) {
        while let Some(Touch { owner, stamp }) = self.touches.pop() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);

            // Touches of lines that are not (or no longer) cached are dropped.
            let Some(&slot) = state.slots.get(&owner) else {
                continue;
            };
            let index = slot.as_usize();
            let Some(current) = state.stamps[index] else {
                continue;
            };
            if stamp <= current {
                continue;
            }
            state.queue.remove(&(current, slot));
            state.queue.insert((stamp, slot));
            state.stamps[index] = Some(stamp);
        }
    }

    /// Claim a slot for `owner`, evicting the least recently used line if no slot is free.
    ///
    /// Lines that are locked by a reader are skipped and requeued as if just used. Returns `None`
    /// if every eligible slot was skipped; the caller should try again later.
    ///
    /// The claimed slot is not eligible for eviction until the caller maps it and calls
    /// [Policy::make_available_for_eviction], or gives it back with [Policy::release].
    pub fn find_eviction_candidate(&self, owner: Owner) -> Option<SlotId> {
        let mut state = self.state.lock().unwrap();
        self.drain(&mut state);

        let candidates = state.queue.len();
        for _ in 0..candidates {
            let (_, slot) = state.queue.pop_first()?;
            let index = slot.as_usize();
            state.stamps[index] = None;

            let Some(current) = state.owners[index] else {
                self.claim(&mut state, slot, owner);
                return Some(slot);
            };
            let residency = state
                .files
                .get(&current.file)
                .expect("slot owned by unregistered file");
            if let Some(evicted) = residency.try_evict(current.line) {
                assert_eq!(
                    evicted, slot,
                    "{} {} resident in {evicted}, expected {slot}",
                    current.file, current.line
                );
                trace!(file = %current.file, line = %current.line, %slot, "evicted");
                state.slots.remove(&current);
                state.owners[index] = None;
                self.metrics.slots_owned.dec();
                self.metrics.evictions.inc();
                self.claim(&mut state, slot, owner);
                return Some(slot);
            }

            // A reader holds the line, treat it as just used.
            let stamp = self.next_stamp();
            state.queue.insert((stamp, slot));
            state.stamps[index] = Some(stamp);
        }

        self.metrics.exhausted.inc();
        warn!(
            file = %owner.file,
            line = %owner.line,
            candidates,
            "no slot available"
        );
        None
    }

    fn claim(&self, state: &mut State, slot: SlotId, owner: Owner) {
        state.owners[slot.as_usize()] = Some(owner);
        let previous = state.slots.insert(owner, slot);
        assert!(
            previous.is_none(),
            "{} {} already owns a slot",
            owner.file,
            owner.line
        );
        self.metrics.slots_owned.inc();
    }

    /// Make a claimed slot, now mapped by its line, eligible for eviction. Must be called exactly
    /// once per claim.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not owned or is already eligible.
    pub fn make_available_for_eviction(&self, slot: SlotId) {
        let mut state = self.state.lock().unwrap();
        let index = slot.as_usize();
        assert!(state.owners[index].is_some(), "{slot} is not owned");
        assert!(
            state.stamps[index].is_none(),
            "{slot} already available for eviction"
        );
        let stamp = self.next_stamp();
        state.queue.insert((stamp, slot));
        state.stamps[index] = Some(stamp);
    }

    /// Return a claimed slot that was never mapped.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not owned or is already eligible.
    pub fn release(&self, slot: SlotId) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.stamps[slot.as_usize()].is_none(),
            "{slot} released while eligible"
        );
        self.free(&mut state, slot);
    }

    fn free(&self, state: &mut State, slot: SlotId) {
        let index = slot.as_usize();
        let owner = state.owners[index]
            .take()
            .unwrap_or_else(|| panic!("{slot} is not owned"));
        state.slots.remove(&owner);
        if let Some(stamp) = state.stamps[index].take() {
            state.queue.remove(&(stamp, slot));
        }
        state.queue.insert((FREE, slot));
        state.stamps[index] = Some(FREE);
        self.metrics.slots_owned.dec();
    }

    /// Evict every line of `file` and free the slots they occupied.
    ///
    /// Returns false if some line could not be evicted because it is locked. The file must not
    /// be closed until this returns true.
    pub fn evict_all(&self, file: FileId) -> bool {
        let mut state = self.state.lock().unwrap();
        self.drain(&mut state);
        let Some(residency) = state.files.get(&file).cloned() else {
            return true;
        };

        let mut evicted = 0;
        let mut locked = 0;
        for index in 0..self.capacity {
            let Some(owner) = state.owners[index] else {
                continue;
            };
            if owner.file != file {
                continue;
            }
            let slot = SlotId::new(index as u64);
            match residency.try_evict(owner.line) {
                Some(previous) => {
                    assert_eq!(previous, slot, "{file} {} in {previous}", owner.line);
                    self.free(&mut state, slot);
                    evicted += 1;
                }
                None => locked += 1,
            }
        }
        debug!(%file, evicted, locked, "evicted file");
        locked == 0
    }

    /// Number of slots not owned by any line.
    pub fn free_slots(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.owners.iter().filter(|owner| owner.is_none()).count()
    }

    /// Number of slots that may currently be claimed (free or eligible for eviction).
    pub fn eligible_slots(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// The line owning `slot`, if any.
    pub fn owner(&self, slot: SlotId) -> Option<Owner> {
        self.state.lock().unwrap().owners[slot.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residency::{Acquire, Status};
    use commonware_macros::test_traced;

    fn policy(capacity: usize, touch_backlog: usize) -> Policy {
        Policy::new(
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(touch_backlog).unwrap(),
            Metrics::default(),
        )
    }

    fn owner(file: FileId, line: u64) -> Owner {
        Owner {
            file,
            line: LineId::new(line),
        }
    }

    /// Claim, map, and release a slot the way the completion path does.
    fn load(policy: &Policy, residency: &Residency, file: FileId, line: u64) -> SlotId {
        let slot = policy
            .find_eviction_candidate(owner(file, line))
            .expect("slot available");
        assert!(residency.map(LineId::new(line), slot));
        policy.make_available_for_eviction(slot);
        slot
    }

    fn close(policy: &Policy, file: FileId) {
        assert!(policy.evict_all(file));
        policy.unregister(file);
    }

    #[test_traced]
    fn test_free_slots_first() {
        let policy = policy(3, 1024);
        let residency = Arc::new(Residency::new(3));
        let file = policy.register(residency.clone());

        let slots: Vec<_> = (0..3)
            .map(|line| load(&policy, &residency, file, line))
            .collect();
        assert_eq!(policy.free_slots(), 0);
        assert_eq!(policy.eligible_slots(), 3);
        assert_eq!(policy.metrics.evictions.get(), 0);
        for (line, slot) in slots.into_iter().enumerate() {
            assert_eq!(policy.owner(slot), Some(owner(file, line as u64)));
            assert_eq!(
                residency.status(LineId::new(line as u64)),
                Status::Resident(slot)
            );
        }

        close(&policy, file);
        assert_eq!(policy.free_slots(), 3);
        assert_eq!(policy.metrics.slots_owned.get(), 0);
    }

    #[test_traced]
    fn test_least_recently_used_evicted() {
        let policy = policy(2, 1024);
        let residency = Arc::new(Residency::new(3));
        let file = policy.register(residency.clone());

        let first = load(&policy, &residency, file, 0);
        load(&policy, &residency, file, 1);
        let third = load(&policy, &residency, file, 2);

        assert_eq!(third, first);
        assert_eq!(residency.status(LineId::new(0)), Status::Unavailable);
        assert!(residency.is_resident(LineId::new(1)));
        assert_eq!(policy.owner(third), Some(owner(file, 2)));
        assert_eq!(policy.metrics.evictions.get(), 1);

        close(&policy, file);
    }

    #[test_traced]
    fn test_touch_protects_line() {
        let policy = policy(2, 1024);
        let residency = Arc::new(Residency::new(3));
        let file = policy.register(residency.clone());

        load(&policy, &residency, file, 0);
        let second = load(&policy, &residency, file, 1);
        policy.notify_touched(owner(file, 0));

        let third = load(&policy, &residency, file, 2);
        assert_eq!(third, second);
        assert!(residency.is_resident(LineId::new(0)));
        assert_eq!(residency.status(LineId::new(1)), Status::Unavailable);

        close(&policy, file);
    }

    #[test_traced]
    fn test_touch_of_uncached_line_ignored() {
        let policy = policy(1, 1024);
        let residency = Arc::new(Residency::new(2));
        let file = policy.register(residency.clone());

        policy.notify_touched(owner(file, 1));
        load(&policy, &residency, file, 0);
        assert_eq!(policy.eligible_slots(), 1);

        close(&policy, file);
    }

    #[test_traced]
    fn test_locked_line_skipped() {
        let policy = policy(2, 1024);
        let residency = Arc::new(Residency::new(4));
        let file = policy.register(residency.clone());

        let first = load(&policy, &residency, file, 0);
        let second = load(&policy, &residency, file, 1);

        // A reader holds the least recently used line, so the other one goes.
        assert_eq!(residency.lock(LineId::new(0)), Acquire::Acquired(first));
        let third = load(&policy, &residency, file, 2);
        assert_eq!(third, second);

        // With every candidate locked the search fails without side effects.
        assert_eq!(residency.lock(LineId::new(2)), Acquire::Acquired(third));
        assert_eq!(policy.find_eviction_candidate(owner(file, 3)), None);
        assert_eq!(policy.metrics.exhausted.get(), 1);
        assert_eq!(policy.eligible_slots(), 2);

        // Locked lines also block a full eviction.
        assert!(!policy.evict_all(file));
        residency.unlock(LineId::new(0), first);
        residency.unlock(LineId::new(2), third);
        close(&policy, file);
    }

    #[test_traced]
    fn test_evict_all_leaves_other_files() {
        let policy = policy(4, 1024);
        let a = Arc::new(Residency::new(2));
        let b = Arc::new(Residency::new(2));
        let file_a = policy.register(a.clone());
        let file_b = policy.register(b.clone());
        assert_ne!(file_a, file_b);

        load(&policy, &a, file_a, 0);
        load(&policy, &b, file_b, 0);
        load(&policy, &a, file_a, 1);
        load(&policy, &b, file_b, 1);
        assert_eq!(policy.free_slots(), 0);

        close(&policy, file_a);
        assert_eq!(policy.free_slots(), 2);
        assert!(!a.is_resident(LineId::new(0)) && !a.is_resident(LineId::new(1)));
        assert!(b.is_resident(LineId::new(0)) && b.is_resident(LineId::new(1)));

        // Freed slots are reused before any resident line is evicted.
        let c = Arc::new(Residency::new(2));
        let file_c = policy.register(c.clone());
        load(&policy, &c, file_c, 0);
        load(&policy, &c, file_c, 1);
        assert_eq!(policy.metrics.evictions.get(), 0);

        close(&policy, file_b);
        close(&policy, file_c);
        assert_eq!(policy.free_slots(), 4);
    }

    #[test_traced]
    fn test_release_frees_slot() {
        let policy = policy(1, 1024);
        let residency = Arc::new(Residency::new(1));
        let file = policy.register(residency.clone());

        let slot = policy.find_eviction_candidate(owner(file, 0)).unwrap();
        assert_eq!(policy.free_slots(), 0);
        assert_eq!(policy.eligible_slots(), 0);
        policy.release(slot);
        assert_eq!(policy.free_slots(), 1);
        assert_eq!(policy.eligible_slots(), 1);

        close(&policy, file);
    }

    #[test_traced]
    #[should_panic(expected = "already available for eviction")]
    fn test_double_availability() {
        let policy = policy(1, 1024);
        let residency = Arc::new(Residency::new(1));
        let file = policy.register(residency.clone());
        let slot = load(&policy, &residency, file, 0);
        policy.make_available_for_eviction(slot);
    }

    #[test_traced]
    #[should_panic(expected = "unregistered while owning slots")]
    fn test_unregister_with_slots() {
        let policy = policy(1, 1024);
        let residency = Arc::new(Residency::new(1));
        let file = policy.register(residency.clone());
        load(&policy, &residency, file, 0);
        policy.unregister(file);
    }

    #[test_traced]
    fn test_touch_backlog_bounded() {
        let policy = policy(2, 4);
        let residency = Arc::new(Residency::new(2));
        let file = policy.register(residency.clone());
        load(&policy, &residency, file, 0);

        for _ in 0..100 {
            policy.notify_touched(owner(file, 0));
            assert!(policy.backlog.load(Ordering::Relaxed) <= 4);
        }
        assert!(policy.touches.len() <= 4);

        close(&policy, file);
    }
}
