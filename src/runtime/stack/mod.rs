//! Simulated physical thread stack
//!
//! A thread stack is a run of machine words addressed by byte address. It
//! grows downward: `base` is the exclusive high end and `limit` the lowest
//! addressable word. Words are atomics so an asynchronous sampler may read a
//! stack while its owner writes it, without locking.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::vm::errors::{FrameError, FrameResult};

/// Byte address on a thread stack or in the code space
pub type Address = usize;

/// One machine word
pub type Word = usize;

/// Bytes per stack word
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Address `words` stack words away from `addr`.
///
/// Wraps instead of overflowing; callers that work with untrusted values
/// check the result against [`StackBounds`].
#[inline]
pub fn word_offset(
    addr: Address,
    words: isize,
) -> Address {
    addr.wrapping_add_signed(words.wrapping_mul(WORD_SIZE as isize))
}

/// Half-open address range `[low, high)` a reader may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackBounds {
    pub low: Address,
    pub high: Address,
}

impl StackBounds {
    pub fn new(
        low: Address,
        high: Address,
    ) -> Self {
        Self { low, high }
    }

    /// Whether a whole word starting at `addr` lies inside the range
    #[inline]
    pub fn contains(
        &self,
        addr: Address,
    ) -> bool {
        addr >= self.low
            && addr
                .checked_add(WORD_SIZE)
                .is_some_and(|end| end <= self.high)
    }

    /// Whether `addr` is at or below the high end (stack base)
    #[inline]
    pub fn below_base(
        &self,
        addr: Address,
    ) -> bool {
        addr <= self.high
    }

    /// Whether `addr` lies within `[low, high]`; the base itself counts
    #[inline]
    pub fn within(
        &self,
        addr: Address,
    ) -> bool {
        addr >= self.low && addr <= self.high
    }

    pub fn size(&self) -> usize {
        self.high.saturating_sub(self.low)
    }
}

impl fmt::Display for StackBounds {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.low, self.high)
    }
}

/// Word-addressed thread stack
pub struct ThreadStack {
    base: Address,
    words: Box<[AtomicUsize]>,
    faults: AtomicUsize,
}

impl ThreadStack {
    /// Create a zeroed stack of `size_words` words ending at `base`
    pub fn new(
        base: Address,
        size_words: usize,
    ) -> Self {
        assert!(base % WORD_SIZE == 0, "stack base must be word aligned");
        assert!(
            size_words * WORD_SIZE <= base,
            "stack must not extend below address zero"
        );
        let words = (0..size_words).map(|_| AtomicUsize::new(0)).collect();
        Self {
            base,
            words,
            faults: AtomicUsize::new(0),
        }
    }

    /// Exclusive high end
    pub fn base(&self) -> Address {
        self.base
    }

    /// Lowest addressable word
    pub fn limit(&self) -> Address {
        self.base - self.words.len() * WORD_SIZE
    }

    pub fn size_words(&self) -> usize {
        self.words.len()
    }

    pub fn bounds(&self) -> StackBounds {
        StackBounds::new(self.limit(), self.base)
    }

    fn index(
        &self,
        addr: Address,
    ) -> FrameResult<usize> {
        if addr % WORD_SIZE != 0 {
            return Err(FrameError::Misaligned { addr });
        }
        if addr < self.limit() || addr >= self.base {
            self.faults.fetch_add(1, Ordering::Relaxed);
            return Err(FrameError::OutOfBounds { addr });
        }
        Ok((addr - self.limit()) / WORD_SIZE)
    }

    /// Read the word at `addr`
    pub fn read(
        &self,
        addr: Address,
    ) -> FrameResult<Word> {
        let index = self.index(addr)?;
        Ok(self.words[index].load(Ordering::Relaxed))
    }

    /// Write the word at `addr`
    pub fn write(
        &self,
        addr: Address,
        value: Word,
    ) -> FrameResult<()> {
        let index = self.index(addr)?;
        self.words[index].store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Read without ever leaving `bounds`.
    ///
    /// Returns `None` instead of touching a word outside `bounds`, a
    /// misaligned address, or a word this stack does not own.
    pub fn read_within(
        &self,
        bounds: StackBounds,
        addr: Address,
    ) -> Option<Word> {
        if addr % WORD_SIZE != 0 || !bounds.contains(addr) {
            return None;
        }
        self.read(addr).ok()
    }

    /// Copy `count` words from `from` to `to`; ranges may overlap
    pub fn copy_words(
        &self,
        from: Address,
        to: Address,
        count: usize,
    ) -> FrameResult<()> {
        let values = (0..count)
            .map(|i| self.read(word_offset(from, i as isize)))
            .collect::<FrameResult<Vec<_>>>()?;
        for (i, value) in values.into_iter().enumerate() {
            self.write(word_offset(to, i as isize), value)?;
        }
        Ok(())
    }

    /// Fill `count` words starting at `from` with zero
    pub fn zero_words(
        &self,
        from: Address,
        count: usize,
    ) -> FrameResult<()> {
        for i in 0..count {
            self.write(word_offset(from, i as isize), 0)?;
        }
        Ok(())
    }

    /// Number of reads or writes that fell outside the stack
    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ThreadStack {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ThreadStack")
            .field("bounds", &self.bounds())
            .field("faults", &self.faults())
            .finish()
    }
}
