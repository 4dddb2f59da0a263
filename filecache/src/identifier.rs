//! Strongly-typed block indices.
//!
//! The cache juggles three unrelated index spaces: cache lines within a file, slots within the
//! shared [crate::Pool], and I/O blocks within a file. Each is an [Id] tagged with a different
//! [Kind], so handing a [LineId] to a function that expects a [SlotId] does not compile.

use crate::{BLOCK_SIZE, LINE_SIZE};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// The index space an [Id] belongs to.
pub trait Kind: 'static {
    /// Size, in bytes, of one unit of this kind.
    const SIZE: u64;

    /// Label used when formatting an [Id].
    const NAME: &'static str;
}

/// A cache line of one file.
pub enum Line {}

/// A slot of the shared pool.
pub enum Slot {}

/// A run of [LINES_PER_BLOCK](crate::LINES_PER_BLOCK) consecutive lines of one file.
pub enum Block {}

impl Kind for Line {
    const SIZE: u64 = LINE_SIZE as u64;
    const NAME: &'static str = "line";
}

impl Kind for Slot {
    const SIZE: u64 = LINE_SIZE as u64;
    const NAME: &'static str = "slot";
}

impl Kind for Block {
    const SIZE: u64 = BLOCK_SIZE as u64;
    const NAME: &'static str = "block";
}

/// Index of a cache line within its file.
pub type LineId = Id<Line>;

/// Index of a slot within the pool.
pub type SlotId = Id<Slot>;

/// Index of an I/O block within its file.
pub type BlockId = Id<Block>;

/// An index tagged with the [Kind] of thing it counts.
pub struct Id<K: Kind> {
    index: u64,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind> Id<K> {
    /// Wrap a raw index.
    pub const fn new(index: u64) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    /// The id of the unit containing byte `offset`.
    pub const fn from_offset(offset: u64) -> Self {
        Self::new(offset / K::SIZE)
    }

    /// The number of units needed to cover `total` bytes.
    pub const fn count(total: u64) -> u64 {
        total.div_ceil(K::SIZE)
    }

    /// The raw index.
    pub const fn get(self) -> u64 {
        self.index
    }

    /// The raw index, for addressing in-memory arrays.
    ///
    /// # Panics
    ///
    /// Panics if the index does not fit in a `usize`.
    pub fn as_usize(self) -> usize {
        usize::try_from(self.index).expect("index exceeds usize")
    }

    /// Byte offset of the first byte of this unit.
    pub const fn offset_in_file(self) -> u64 {
        self.index * K::SIZE
    }

    /// Number of bytes of this unit that exist in a file of `file_size` bytes. The last unit of a
    /// file is usually short, and units past the end are empty.
    pub const fn size_in_file(self, file_size: u64) -> u64 {
        let start = self.offset_in_file();
        if start >= file_size {
            return 0;
        }
        let remaining = file_size - start;
        if remaining < K::SIZE {
            remaining
        } else {
            K::SIZE
        }
    }

    /// The following id.
    pub const fn next(self) -> Self {
        Self::new(self.index + 1)
    }

    /// The preceding id.
    ///
    /// # Panics
    ///
    /// Panics when called on index 0.
    pub const fn prev(self) -> Self {
        assert!(self.index > 0, "no id precedes 0");
        Self::new(self.index - 1)
    }
}

impl LineId {
    /// The I/O block this line belongs to.
    pub const fn block(self) -> BlockId {
        BlockId::from_offset(self.offset_in_file())
    }
}

impl BlockId {
    /// The first line of this block.
    pub const fn first_line(self) -> LineId {
        LineId::from_offset(self.offset_in_file())
    }
}

// Implemented by hand so that the uninhabited kind types need no derives.
impl<K: Kind> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kind> Copy for Id<K> {}

impl<K: Kind> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<K: Kind> Eq for Id<K> {}

impl<K: Kind> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Kind> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<K: Kind> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<K: Kind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", K::NAME, self.index)
    }
}

impl<K: Kind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", K::NAME, self.index)
    }
}
