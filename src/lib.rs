//! A segregated-free-list memory allocator over a single growable arena.
//!
//! The heap is one contiguous byte region that only ever grows at its high
//! end. Every block carries boundary tags (a packed size + allocation-flag
//! word as header and footer), free blocks additionally thread themselves
//! through one of ten size-bucketed free lists, and adjacent free blocks
//! are merged eagerly the moment they appear.
//!
//! ```text
//!          +----------+---------+---------+---------+----------+
//!  arena:  | prologue |  block  |  block  |   ...   | epilogue |
//!          +----------+---------+---------+---------+----------+
//!          ^ lo                                            hi ^
//! ```
//!
//! Callers address memory by payload offset into the arena:
//!
//! ```
//! use segalloc::{Allocator, FixedArena};
//!
//! let mut heap = Allocator::new(FixedArena::new(1 << 20)).unwrap();
//! let ptr = heap.allocate(100);
//! heap.payload_mut(ptr.unwrap())[0] = 42;
//! heap.free(ptr);
//! assert!(heap.check().is_ok());
//! ```
//!
//! The allocator is not reentrant and assumes a single logical caller;
//! concurrent use requires external synchronization.

mod arena;
mod block;
mod check;
mod freelist;
mod utils;

pub use arena::{Arena, FixedArena, SystemArena};
pub use check::HeapCorruption;

use std::error::Error;
use std::fmt;

use block::{DSIZE, MIN_BLOCK_SIZE, WSIZE};
use freelist::SegregatedList;
use utils::round_up;

/// Growth quantum: the arena is never extended by less than this.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// The arena could not be extended any further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("arena exhausted")
    }
}

impl Error for OutOfMemory {}

/// A dynamic memory allocator over an [`Arena`].
///
/// Owns the arena, the segregated bucket heads and the offset of the first
/// block. Between calls every block is in exactly one of two states:
/// allocated, or free and a member of exactly one bucket.
pub struct Allocator<A: Arena> {
    arena: A,
    free_lists: SegregatedList,
    /// Offset of the first real block's header, right after the prologue.
    heap_start: usize,
}

impl<A: Arena> Allocator<A> {
    /// Initializes a heap inside a fresh (empty) arena.
    ///
    /// Writes the prologue and epilogue sentinels and extends the heap
    /// with one free block of [`CHUNK_SIZE`] bytes.
    pub fn new(mut arena: A) -> Result<Self, OutOfMemory> {
        let base = arena.grow(2 * WSIZE).ok_or(OutOfMemory)?;
        debug_assert_eq!(base, arena.low(), "the arena must start out empty");

        let bytes = arena.bytes_mut();
        // Prologue (a block footer) and epilogue (a block header): both
        // zero-size and allocated, so no traversal escapes the heap.
        block::write_word(bytes, base, block::pack(0, true));
        block::write_word(bytes, base + WSIZE, block::pack(0, true));

        let mut allocator = Self {
            arena,
            free_lists: SegregatedList::new(),
            heap_start: base + WSIZE,
        };
        allocator.extend(CHUNK_SIZE).ok_or(OutOfMemory)?;

        Ok(allocator)
    }

    /// Allocates `size` bytes and returns the payload offset.
    ///
    /// Returns `None` for a zero-size request (a defined no-op) and on
    /// arena exhaustion; an exhausted call leaves the heap exactly as it
    /// was. The returned offset is always a multiple of 16.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        self.debug_verify();

        if size == 0 {
            return None;
        }

        // Account for header and footer, then round to the alignment
        // unit. A request so large the arithmetic overflows cannot be
        // satisfied either way.
        let asize = size.checked_add(DSIZE)?.checked_next_multiple_of(DSIZE)?;

        let fit = self.free_lists.find_fit(self.arena.bytes(), asize);
        let b = match fit {
            Some(b) => b,
            None => self.extend(asize.max(CHUNK_SIZE))?,
        };

        debug_assert!(!block::get_alloc(self.arena.bytes(), b));
        let block_size = block::get_size(self.arena.bytes(), b);

        self.free_lists.remove(self.arena.bytes_mut(), b);
        block::write_block(self.arena.bytes_mut(), b, block_size, true);
        self.split(b, asize);

        self.debug_verify();
        Some(block::payload_of(b))
    }

    /// Frees the allocation at `ptr`. `None` is a defined no-op.
    ///
    /// The block is merged eagerly with whichever heap-order neighbours
    /// are free and the result is inserted into its bucket. Passing an
    /// offset that is not a currently-outstanding allocation corrupts the
    /// heap; the corruption is detectable only by [`Self::check`].
    pub fn free(&mut self, ptr: Option<usize>) {
        self.debug_verify();

        let Some(payload) = ptr else { return };
        let b = block::header_of(payload);

        let bytes = self.arena.bytes_mut();
        debug_assert!(block::get_alloc(bytes, b), "freed block is not allocated");
        let size = block::get_size(bytes, b);
        block::write_block(bytes, b, size, false);

        self.coalesce(b);
        self.debug_verify();
    }

    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// `size == 0` frees the block and returns `None`; a `None` pointer
    /// behaves like [`Self::allocate`]. Otherwise a fresh block is
    /// allocated, `min(size, old payload size)` bytes are copied over and
    /// the old block is freed. If allocation fails the original block is
    /// left untouched and `None` is returned.
    pub fn resize(&mut self, ptr: Option<usize>, size: usize) -> Option<usize> {
        let Some(payload) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            self.free(Some(payload));
            return None;
        }

        let new_payload = self.allocate(size)?;

        let old_block = block::header_of(payload);
        let bytes = self.arena.bytes_mut();
        let copy = size.min(block::get_size(bytes, old_block) - DSIZE);
        bytes.copy_within(payload..payload + copy, new_payload);

        self.free(Some(payload));
        Some(new_payload)
    }

    /// Allocates room for `count` elements of `size` bytes each, zeroed.
    ///
    /// A zero `count` returns `None` without failing; a `count * size`
    /// that overflows is reported as exhaustion. Every byte of the
    /// returned payload reads as zero.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let total = count.checked_mul(size)?;

        let payload = self.allocate(total)?;
        let bytes = self.arena.bytes_mut();
        let payload_size = block::get_size(bytes, block::header_of(payload)) - DSIZE;
        bytes[payload..payload + payload_size].fill(0);

        Some(payload)
    }

    /// Validates every structural invariant of the heap.
    ///
    /// Read-only; returns the first violation found with a diagnostic
    /// message naming the offending offset.
    pub fn check(&self) -> Result<(), HeapCorruption> {
        check::check_heap(&self.arena, &self.free_lists, self.heap_start)
    }

    /// The payload bytes of the allocation at `ptr`.
    pub fn payload(&self, ptr: usize) -> &[u8] {
        let bytes = self.arena.bytes();
        let size = block::get_size(bytes, block::header_of(ptr)) - DSIZE;
        &bytes[ptr..ptr + size]
    }

    /// The payload bytes of the allocation at `ptr`, mutably.
    pub fn payload_mut(&mut self, ptr: usize) -> &mut [u8] {
        let bytes = self.arena.bytes_mut();
        let size = block::get_size(bytes, block::header_of(ptr)) - DSIZE;
        &mut bytes[ptr..ptr + size]
    }

    /// Usable size of the allocation at `ptr`. At least the requested
    /// size, possibly more after rounding or an unsplit fit.
    pub fn payload_size(&self, ptr: usize) -> usize {
        block::get_size(self.arena.bytes(), block::header_of(ptr)) - DSIZE
    }

    /// The arena this heap lives in.
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Extends the heap by at least `size` bytes and returns the free
    /// block spanning the growth.
    ///
    /// The new block's header claims the old epilogue's word and a fresh
    /// epilogue is written past the growth, so the heap stays terminated
    /// at every step. The new block is merged with a trailing free
    /// neighbour if there is one.
    fn extend(&mut self, size: usize) -> Option<usize> {
        let size = round_up(size, DSIZE);
        let region = self.arena.grow(size)?;

        let b = region - WSIZE;
        let bytes = self.arena.bytes_mut();
        block::write_block(bytes, b, size, false);
        block::write_epilogue(bytes, b + size);

        Some(self.coalesce(b))
    }

    /// Splits the allocated block at `b` if the remainder past `asize` is
    /// big enough to stand alone; the remainder becomes a free block in
    /// its bucket. Too-small remainders stay attached as internal
    /// fragmentation.
    fn split(&mut self, b: usize, asize: usize) {
        let bytes = self.arena.bytes_mut();
        let block_size = block::get_size(bytes, b);
        debug_assert!(asize <= block_size);

        if block_size - asize >= MIN_BLOCK_SIZE {
            block::write_block(bytes, b, asize, true);
            let rest = b + asize;
            block::write_block(bytes, rest, block_size - asize, false);
            self.free_lists.insert(self.arena.bytes_mut(), rest);
        }
    }

    /// Merges the free block at `b` with whichever heap-order neighbours
    /// are free, inserts the result into its bucket and returns it.
    ///
    /// The four cases are tagged by the pair of neighbour statuses; a
    /// missing previous block (heap start) merges with nothing on that
    /// side. The merged size is the exact sum of the constituents and the
    /// leftmost constituent's address survives.
    fn coalesce(&mut self, b: usize) -> usize {
        let bytes = self.arena.bytes();
        let size = block::get_size(bytes, b);
        let next = block::next_block(bytes, b);
        let prev_free = block::prev_block(bytes, b).filter(|&p| !block::get_alloc(bytes, p));
        let next_free = (!block::get_alloc(bytes, next)).then_some(next);

        let merged = match (prev_free, next_free) {
            // Neither neighbour is free.
            (None, None) => b,
            // Only the previous block is free: it absorbs this one.
            (Some(prev), None) => {
                self.free_lists.remove(self.arena.bytes_mut(), prev);
                let merged_size = block::get_size(self.arena.bytes(), prev) + size;
                block::write_block(self.arena.bytes_mut(), prev, merged_size, false);
                prev
            }
            // Only the next block is free: this one absorbs it.
            (None, Some(next)) => {
                self.free_lists.remove(self.arena.bytes_mut(), next);
                let merged_size = size + block::get_size(self.arena.bytes(), next);
                block::write_block(self.arena.bytes_mut(), b, merged_size, false);
                b
            }
            // Both neighbours are free: all three merge at the previous
            // block's address.
            (Some(prev), Some(next)) => {
                self.free_lists.remove(self.arena.bytes_mut(), prev);
                self.free_lists.remove(self.arena.bytes_mut(), next);
                let merged_size = block::get_size(self.arena.bytes(), prev)
                    + size
                    + block::get_size(self.arena.bytes(), next);
                block::write_block(self.arena.bytes_mut(), prev, merged_size, false);
                prev
            }
        };

        self.free_lists.insert(self.arena.bytes_mut(), merged);
        merged
    }

    /// Verifies the heap on entry and exit of every mutating call in
    /// debug builds. Compiled out in release builds.
    fn debug_verify(&self) {
        #[cfg(debug_assertions)]
        if let Err(err) = self.check() {
            panic!("{err}");
        }
    }
}
