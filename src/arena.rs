// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The raw memory arena behind the delegate allocator.
//!
//! An [`Arena`] carves sequential blocks from one fixed [`Region`]. It tracks
//! a growth cursor, and a count of the bytes it has yet to hand out. That
//! count is independent of anything the delegate allocator knows about its
//! own free lists.
//!
//! An arena has no locking of its own. The [`Heap`](crate::Heap) only touches
//! its arena inside an exclusive region.
//!
//! # Examples
//!
//! ```
//! use heapshare::arena::{Arena, Region};
//!
//! let mut storage = [0u8; 4096];
//! let mut arena = Arena::new(Region::from_slice(&mut storage));
//!
//! let block = arena.grow(1024).unwrap();
//! assert_eq!(block, storage.as_mut_ptr());
//! assert_eq!(arena.info().remaining, 3072);
//!
//! assert!(arena.grow(3200).is_err());
//! assert_eq!(arena.info().remaining, 3072);
//! ```

use core::ptr;

/// The bounds of raw memory available to an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// The first byte of the region.
    pub base: *mut u8,
    /// One past the last byte of the region.
    pub limit: *mut u8,
}

impl Region {
    /// Describe the memory between `base` and `limit`.
    ///
    /// If `limit` precedes `base`, the region is empty.
    #[inline]
    pub const fn new(base: *mut u8, limit: *mut u8) -> Self {
        Self { base, limit }
    }

    /// Describe the memory of a slice.
    #[inline]
    pub fn from_slice(slice: &mut [u8]) -> Self {
        let range = slice.as_mut_ptr_range();
        Self::new(range.start, range.end)
    }

    /// The number of bytes between the base and the limit.
    #[inline]
    pub fn len(&self) -> usize {
        (self.limit as usize).saturating_sub(self.base as usize)
    }

    /// Returns `true` if the region has no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the top `bytes` of the region out of the arena.
    ///
    /// Use this to protect an interrupt stack that sits just above the heap.
    /// The limit never drops below the base.
    #[must_use]
    pub fn reserve_top(self, bytes: usize) -> Self {
        let len = self.len().saturating_sub(bytes);
        Self::new(self.base, self.base.wrapping_add(len))
    }
}

/// The arena refused a growth request.
///
/// Nothing about the arena changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Exhausted {
    /// The refused increment.
    pub increment: isize,
    /// The bytes that remained when the request was refused.
    pub remaining: isize,
}

/// A snapshot of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaInfo {
    /// The first byte of the arena.
    pub base: *mut u8,
    /// One past the last byte the arena may hand out.
    pub limit: *mut u8,
    /// The growth cursor. The next block starts here.
    pub current: *mut u8,
    /// The bytes not yet handed out.
    pub remaining: isize,
    /// The bytes between the base and the limit.
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    base: *mut u8,
    capacity: usize,
    /// `current - base`.
    used: usize,
    remaining: isize,
}

impl Cursor {
    fn new(region: Region) -> Self {
        // No object spans more than isize::MAX bytes, so neither does an arena.
        let remaining = isize::try_from(region.len()).unwrap_or(isize::MAX);
        Self {
            base: region.base,
            capacity: remaining.unsigned_abs(),
            used: 0,
            remaining,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Bounds {
    /// Resolved on the first request.
    Deferred(fn() -> Region),
    Ready(Cursor),
}

/// A monotonic growth cursor over a [`Region`].
///
/// Between calls, the arena guarantees `base <= current <= limit`, and
/// `remaining == limit - current`.
#[derive(Debug)]
pub struct Arena {
    bounds: Bounds,
}

impl Arena {
    /// Create an arena over `region`.
    pub fn new(region: Region) -> Self {
        Self {
            bounds: Bounds::Ready(Cursor::new(region)),
        }
    }

    /// Create an arena whose region is resolved on first use.
    ///
    /// This is how a `static` heap finds linker-provided bounds, since their
    /// addresses aren't known in a `const` context.
    pub const fn deferred(region: fn() -> Region) -> Self {
        Self {
            bounds: Bounds::Deferred(region),
        }
    }

    fn cursor(&mut self) -> &mut Cursor {
        if let Bounds::Deferred(region) = self.bounds {
            self.bounds = Bounds::Ready(Cursor::new(region()));
        }
        match &mut self.bounds {
            Bounds::Ready(cursor) => cursor,
            Bounds::Deferred(_) => unreachable!(),
        }
    }

    /// Move the cursor by `increment` bytes.
    ///
    /// On success, returns the cursor's previous position; for a positive
    /// increment, that's the start of the new block. An increment of zero
    /// returns the cursor without moving it. A negative increment gives
    /// bytes back to the arena, but never moves the cursor below the base.
    ///
    /// If the cursor would leave the arena, the request is refused and the
    /// arena isn't modified.
    pub fn grow(&mut self, increment: isize) -> Result<*mut u8, Exhausted> {
        let cursor = self.cursor();

        let next = isize::try_from(cursor.used)
            .ok()
            .and_then(|used| used.checked_add(increment))
            .and_then(|next| usize::try_from(next).ok())
            .filter(|&next| next <= cursor.capacity);

        let Some(next) = next else {
            return Err(Exhausted {
                increment,
                remaining: cursor.remaining,
            });
        };

        let previous = cursor.base.wrapping_add(cursor.used);
        cursor.used = next;
        cursor.remaining -= increment;
        Ok(previous)
    }

    /// Returns the bytes that the arena has yet to hand out.
    pub fn remaining(&mut self) -> isize {
        self.cursor().remaining
    }

    /// Take a snapshot of the arena.
    pub fn info(&mut self) -> ArenaInfo {
        let cursor = *self.cursor();
        ArenaInfo {
            base: cursor.base,
            limit: cursor.base.wrapping_add(cursor.capacity),
            current: cursor.base.wrapping_add(cursor.used),
            remaining: cursor.remaining,
            capacity: cursor.capacity,
        }
    }
}

impl Default for Arena {
    /// An arena with no memory. Every positive request fails.
    fn default() -> Self {
        Self::new(Region::new(ptr::null_mut(), ptr::null_mut()))
    }
}

// Safety: the arena's pointers describe memory that the arena owns. Moving
// the arena to another execution context moves that ownership with it.
unsafe impl Send for Arena {}

#[cfg(test)]
mod tests {
    use super::{Arena, Exhausted, Region};

    #[test]
    fn example_scenario() {
        let mut storage = [0u8; 4096];
        let base = storage.as_mut_ptr();
        let mut arena = Arena::new(Region::from_slice(&mut storage));

        assert_eq!(arena.grow(1024), Ok(base));
        let info = arena.info();
        assert_eq!(info.current, base.wrapping_add(1024));
        assert_eq!(info.remaining, 3072);

        assert_eq!(
            arena.grow(3200),
            Err(Exhausted {
                increment: 3200,
                remaining: 3072
            })
        );
        assert_eq!(arena.info(), info);

        assert_eq!(arena.grow(3072), Ok(base.wrapping_add(1024)));
        assert_eq!(arena.info().remaining, 0);
        assert_eq!(arena.info().current, arena.info().limit);

        assert!(arena.grow(1).is_err());
        assert_eq!(arena.info().remaining, 0);
    }

    #[test]
    fn zero_increment_reports_cursor() {
        let mut storage = [0u8; 64];
        let base = storage.as_mut_ptr();
        let mut arena = Arena::new(Region::from_slice(&mut storage));

        assert_eq!(arena.grow(0), Ok(base));
        arena.grow(16).unwrap();
        assert_eq!(arena.grow(0), Ok(base.wrapping_add(16)));
        assert_eq!(arena.remaining(), 48);
    }

    #[test]
    fn negative_increment_returns_bytes() {
        let mut storage = [0u8; 64];
        let base = storage.as_mut_ptr();
        let mut arena = Arena::new(Region::from_slice(&mut storage));

        arena.grow(40).unwrap();
        assert_eq!(arena.grow(-8), Ok(base.wrapping_add(40)));
        assert_eq!(arena.info().current, base.wrapping_add(32));
        assert_eq!(arena.remaining(), 32);

        // Can't shrink below the base.
        assert!(arena.grow(-33).is_err());
        assert_eq!(arena.info().current, base.wrapping_add(32));
    }

    #[test]
    fn overflowing_increment_is_refused() {
        let mut storage = [0u8; 64];
        let mut arena = Arena::new(Region::from_slice(&mut storage));
        arena.grow(8).unwrap();

        assert!(arena.grow(isize::MAX).is_err());
        assert!(arena.grow(isize::MIN).is_err());
        assert_eq!(arena.remaining(), 56);
    }

    #[test]
    fn deferred_bounds_resolve_once() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static RESOLVED: AtomicUsize = AtomicUsize::new(0);
        static mut STORAGE: [u8; 128] = [0; 128];

        fn linker_region() -> Region {
            RESOLVED.fetch_add(1, Ordering::Relaxed);
            let base = &raw mut STORAGE;
            Region::new(base.cast(), base.cast::<u8>().wrapping_add(128)).reserve_top(32)
        }

        let mut arena = Arena::deferred(linker_region);
        assert_eq!(RESOLVED.load(Ordering::Relaxed), 0);

        assert_eq!(arena.remaining(), 96);
        arena.grow(96).unwrap();
        assert!(arena.grow(1).is_err());
        assert_eq!(RESOLVED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reserve_never_inverts_region() {
        let mut storage = [0u8; 16];
        let region = Region::from_slice(&mut storage).reserve_top(64);
        assert!(region.is_empty());
        assert_eq!(region.limit, region.base);

        let mut arena = Arena::new(region);
        assert_eq!(arena.grow(0), Ok(region.base));
        assert!(arena.grow(1).is_err());
    }

    #[test]
    fn empty_arena_refuses_everything_but_zero() {
        let mut arena = Arena::default();
        assert!(arena.grow(0).is_ok());
        assert!(arena.grow(1).is_err());
        assert_eq!(arena.remaining(), 0);
    }
}
