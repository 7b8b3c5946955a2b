//! Session identifier allocation.
//!
//! Identifiers live in `[START_UID, MAX_UID]`. Presence is tracked in a
//! two-level table: a fixed directory of buckets, each bucket a block of
//! atomic present flags created on first use. Reserve and release are O(1)
//! and lock-free; `allocate` walks a rolling cursor so released identifiers
//! are reused round-robin instead of growing without bound.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Session identifier.
pub type Uid = u32;

/// Reserved "unset" identifier.
pub const INVALID_UID: Uid = 0;

/// First identifier handed out (1..9 are reserved).
pub const START_UID: Uid = 10;

/// Last identifier handed out.
pub const MAX_UID: Uid = 4095;

/// Present flags per bucket.
const BUCKET_SLOTS: usize = 64;

type Bucket = Box<[AtomicBool]>;

/// Allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidError {
    /// Every identifier in the space is in use.
    Exhausted,
    /// Release of an identifier that was not reserved.
    NotReserved(Uid),
}

impl std::fmt::Display for UidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UidError::Exhausted => write!(f, "Identifier space exhausted"),
            UidError::NotReserved(uid) => write!(f, "Identifier {} is not reserved", uid),
        }
    }
}

impl std::error::Error for UidError {}

/// Lock-free presence set over the identifier space.
pub struct UidAllocator {
    /// First-level directory; second-level blocks are created lazily.
    buckets: Box<[OnceLock<Bucket>]>,
    /// Rolling offset into the space for round-robin allocation.
    cursor: AtomicU32,
    /// Number of reserved identifiers.
    reserved: AtomicUsize,
    start: Uid,
    max: Uid,
}

impl UidAllocator {
    /// Allocator over the default `[START_UID, MAX_UID]` space.
    pub fn new() -> Self {
        Self::with_range(START_UID, MAX_UID)
    }

    /// Allocator over `[start, max]`. `start` is raised past `INVALID_UID`.
    pub fn with_range(start: Uid, max: Uid) -> Self {
        let start = start.max(INVALID_UID + 1);
        let max = max.max(start);
        let bucket_count = max as usize / BUCKET_SLOTS + 1;

        Self {
            buckets: (0..bucket_count).map(|_| OnceLock::new()).collect(),
            cursor: AtomicU32::new(0),
            reserved: AtomicUsize::new(0),
            start,
            max,
        }
    }

    fn span(&self) -> u32 {
        self.max - self.start + 1
    }

    fn contains(&self, uid: Uid) -> bool {
        (self.start..=self.max).contains(&uid)
    }

    fn locate(uid: Uid) -> (usize, usize) {
        let uid = uid as usize;
        (uid / BUCKET_SLOTS, uid % BUCKET_SLOTS)
    }

    /// Mark `uid` present. Returns `false` without mutation if it already was
    /// or if it lies outside the space.
    pub fn try_reserve(&self, uid: Uid) -> bool {
        if !self.contains(uid) {
            return false;
        }

        let (bucket, slot) = Self::locate(uid);
        let flags = self.buckets[bucket]
            .get_or_init(|| (0..BUCKET_SLOTS).map(|_| AtomicBool::new(false)).collect());

        let won = flags[slot]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.reserved.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    /// Clear the present flag for `uid`.
    pub fn release(&self, uid: Uid) -> Result<(), UidError> {
        if !self.contains(uid) {
            return Err(UidError::NotReserved(uid));
        }

        let (bucket, slot) = Self::locate(uid);
        let flags = self.buckets[bucket]
            .get()
            .ok_or(UidError::NotReserved(uid))?;

        if flags[slot].swap(false, Ordering::AcqRel) {
            self.reserved.fetch_sub(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(UidError::NotReserved(uid))
        }
    }

    /// Whether `uid` is currently reserved.
    pub fn is_reserved(&self, uid: Uid) -> bool {
        if !self.contains(uid) {
            return false;
        }
        let (bucket, slot) = Self::locate(uid);
        self.buckets[bucket]
            .get()
            .is_some_and(|flags| flags[slot].load(Ordering::Acquire))
    }

    /// Reserve the first free identifier at or after `from`, wrapping once
    /// around the space.
    pub fn next_free(&self, from: Uid) -> Result<Uid, UidError> {
        let span = self.span();
        let offset = from.saturating_sub(self.start) % span;

        for step in 0..span {
            let uid = self.start + (offset + step) % span;
            if self.try_reserve(uid) {
                return Ok(uid);
            }
        }
        Err(UidError::Exhausted)
    }

    /// Reserve the next identifier after the last one handed out.
    pub fn allocate(&self) -> Result<Uid, UidError> {
        let span = self.span();
        let from = self.start + self.cursor.load(Ordering::Relaxed) % span;
        let uid = self.next_free(from)?;
        self.cursor
            .store((uid - self.start + 1) % span, Ordering::Relaxed);
        Ok(uid)
    }

    /// Number of reserved identifiers.
    pub fn len(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Number of second-level blocks created so far.
    #[cfg(test)]
    fn buckets_in_use(&self) -> usize {
        self.buckets.iter().filter(|b| b.get().is_some()).count()
    }
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
