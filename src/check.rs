//! Whole-heap consistency checking.
//!
//! A read-only pass over every structural invariant the allocator
//! maintains: sentinel integrity, boundary-tag consistency, alignment,
//! heap bounds, eager-coalescing (no adjacent free blocks), free-list
//! shape and bucket membership, and the agreement between the heap-order
//! walk and the bucket walks. The first violation found is reported with
//! the offset it was found at; nothing is ever repaired.

use std::error::Error;
use std::fmt;

use crate::arena::Arena;
use crate::block::{self, DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::freelist::{self, BUCKET_COUNT, SegregatedList};

/// A structural invariant violation found by the heap checker.
///
/// Carries a human-readable description naming the offending offset.
/// Corruption is a fatal diagnostic: the heap that produced it must not be
/// trusted for further allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapCorruption {
    message: String,
}

impl HeapCorruption {
    fn new(message: String) -> Self {
        Self { message }
    }

    /// The diagnostic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HeapCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap corruption: {}", self.message)
    }
}

impl Error for HeapCorruption {}

macro_rules! fail {
    ($($arg:tt)*) => {
        return Err(HeapCorruption::new(format!($($arg)*)))
    };
}

/// Validates every structural invariant of the heap.
///
/// `heap_start` is the offset of the first real block's header. Returns
/// the first violation found, in checking order: prologue, heap-order
/// walk, epilogue, bucket walks, free-count cross-check.
pub(crate) fn check_heap<A: Arena>(
    arena: &A,
    lists: &SegregatedList,
    heap_start: usize,
) -> Result<(), HeapCorruption> {
    let bytes = arena.bytes();
    let lo = arena.low();
    let hi = arena.high();

    if hi - lo < 2 * WSIZE {
        fail!("arena of {} bytes cannot hold both sentinels", hi - lo);
    }

    // The prologue: a zero-size allocated sentinel at the arena's first
    // word, standing in for the footer of a block before the heap.
    let prologue = block::read_word(bytes, lo);
    if block::extract_size(prologue) != 0 || !block::extract_alloc(prologue) {
        fail!("prologue at offset {lo} is not a zero-size allocated sentinel");
    }

    // Heap-order walk: every block from heap_start to the epilogue.
    let mut offset = heap_start;
    let mut heap_free_blocks = 0usize;
    let mut prev_was_free = false;
    loop {
        if offset + WSIZE > hi {
            fail!("header at offset {offset} runs past the arena end {hi}");
        }
        let header = block::read_word(bytes, offset);
        let size = block::extract_size(header);
        if size == 0 {
            break;
        }

        if size % DSIZE != 0 {
            fail!("block at offset {offset} has size {size}, not a multiple of {DSIZE}");
        }
        if size < MIN_BLOCK_SIZE {
            fail!("block at offset {offset} has size {size}, below the minimum {MIN_BLOCK_SIZE}");
        }
        let Some(end) = offset.checked_add(size) else {
            fail!("block at offset {offset} has size {size}, overflowing the address space");
        };
        if end > hi - WSIZE {
            fail!("block at offset {offset} of size {size} extends past the epilogue");
        }
        if block::payload_of(offset) % DSIZE != 0 {
            fail!(
                "payload at offset {} is not {DSIZE}-byte aligned",
                block::payload_of(offset)
            );
        }

        let footer = block::read_word(bytes, block::footer_of(bytes, offset));
        if footer != header {
            fail!("block at offset {offset} has header {header:#x} but footer {footer:#x}");
        }

        let free = !block::extract_alloc(header);
        if free && prev_was_free {
            fail!("consecutive free blocks in heap order at offset {offset}");
        }
        if free {
            heap_free_blocks += 1;
        }
        prev_was_free = free;
        offset = end;
    }

    // The epilogue: a zero-size allocated sentinel in the arena's last
    // word. The walk above already saw size zero.
    if offset != hi - WSIZE {
        fail!(
            "heap walk terminated at offset {offset}, expected the epilogue at {}",
            hi - WSIZE
        );
    }
    if !block::extract_alloc(block::read_word(bytes, offset)) {
        fail!("epilogue at offset {offset} is not marked allocated");
    }

    // Bucket walks: every free list must be a symmetric doubly-linked
    // list of in-bounds free blocks of bucket-appropriate sizes.
    let mut list_free_blocks = 0usize;
    for bucket in 0..BUCKET_COUNT {
        let mut cursor = lists.head(bucket);
        let mut expected_prev: Option<usize> = None;

        while let Some(node) = cursor {
            list_free_blocks += 1;
            if list_free_blocks > heap_free_blocks {
                fail!(
                    "bucket {bucket} walk visited more blocks than the {heap_free_blocks} free \
                     blocks in the heap (cycle or stray link at offset {node})"
                );
            }

            if node < lo + WSIZE || node + MIN_BLOCK_SIZE > hi {
                fail!("bucket {bucket} links to offset {node}, outside the heap");
            }
            let header = block::read_word(bytes, node);
            let size = block::extract_size(header);
            if block::extract_alloc(header) {
                fail!("bucket {bucket} holds the allocated block at offset {node}");
            }
            if size % DSIZE != 0 || size < MIN_BLOCK_SIZE || node + size > hi - WSIZE {
                fail!("bucket {bucket} links to offset {node} with corrupt size {size}");
            }
            if block::read_word(bytes, node + size - WSIZE) != header {
                fail!(
                    "free block at offset {node} in bucket {bucket} has mismatched header and \
                     footer"
                );
            }
            if SegregatedList::bucket_index(size) != bucket {
                fail!(
                    "block at offset {node} of size {size} is stored in bucket {bucket}, which \
                     does not own that size"
                );
            }
            if freelist::prev_of(bytes, node) != expected_prev {
                fail!("free list symmetry broken at offset {node} in bucket {bucket}");
            }

            expected_prev = Some(node);
            cursor = freelist::next_of(bytes, node);
        }
    }

    // Cross-check: the heap-order walk and the bucket walks must agree on
    // the population of free blocks.
    if heap_free_blocks != list_free_blocks {
        fail!(
            "heap walk found {heap_free_blocks} free blocks but the buckets hold \
             {list_free_blocks}"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Allocator, FixedArena};

    fn new_heap() -> Allocator<FixedArena> {
        Allocator::new(FixedArena::new(1 << 20)).expect("arena should hold the initial heap")
    }

    fn assert_corrupt(heap: &Allocator<FixedArena>, needle: &str) {
        let err = heap.check().expect_err("corruption should be detected");
        assert!(
            err.message().contains(needle),
            "expected {needle:?} in {:?}",
            err.message()
        );
    }

    #[test]
    fn fresh_heap_is_consistent() {
        let heap = new_heap();
        heap.check().expect("fresh heap should pass");
    }

    #[test]
    fn detects_broken_prologue() {
        let mut heap = new_heap();
        block::write_word(heap.arena.bytes_mut(), 0, block::pack(32, true));
        assert_corrupt(&heap, "prologue");
    }

    #[test]
    fn detects_header_footer_mismatch() {
        let mut heap = new_heap();
        // The fresh heap's single free block starts right after the
        // prologue; flip its header's allocation bit only.
        let first = heap.heap_start;
        let size = block::get_size(heap.arena.bytes(), first);
        block::write_word(heap.arena.bytes_mut(), first, block::pack(size, true));
        assert_corrupt(&heap, "footer");
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut heap = new_heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();

        // Rewrite both blocks as free behind the allocator's back, without
        // coalescing or list insertion.
        for payload in [a, b] {
            let header = block::header_of(payload);
            let size = block::get_size(heap.arena.bytes(), header);
            block::write_block(heap.arena.bytes_mut(), header, size, false);
        }
        assert_corrupt(&heap, "consecutive free blocks");
    }

    #[test]
    fn detects_free_count_mismatch() {
        let mut heap = new_heap();
        let _a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let _c = heap.allocate(100).unwrap();

        // Mark the middle block free without inserting it into a bucket.
        // Its neighbours stay allocated, so the walk itself stays legal.
        let header = block::header_of(b);
        let size = block::get_size(heap.arena.bytes(), header);
        block::write_block(heap.arena.bytes_mut(), header, size, false);
        assert_corrupt(&heap, "free blocks");
    }

    #[test]
    fn detects_wrong_bucket_membership() {
        let mut heap = new_heap();
        // Move the fresh heap's free block from its owning bucket into one
        // that does not cover its size.
        let first = heap.heap_start;
        let size = block::get_size(heap.arena.bytes(), first);
        let owning = SegregatedList::bucket_index(size);
        let wrong = (owning + 1) % BUCKET_COUNT;
        heap.free_lists.heads[owning] = None;
        heap.free_lists.heads[wrong] = Some(first);
        assert_corrupt(&heap, "does not own");
    }

    #[test]
    fn detects_broken_list_symmetry() {
        let mut heap = new_heap();
        // Two same-sized free blocks separated by allocated spacers end up
        // linked in one bucket.
        let a = heap.allocate(100).unwrap();
        let _spacer1 = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        let _spacer2 = heap.allocate(100).unwrap();
        heap.free(Some(a));
        heap.free(Some(c));
        heap.check().expect("two-node bucket should be legal");

        // Sever the second node's back link.
        let tail = block::header_of(a);
        block::write_word(heap.arena.bytes_mut(), tail + 2 * WSIZE, u64::MAX);
        assert_corrupt(&heap, "symmetry");
    }

    #[test]
    fn detects_stray_out_of_bounds_link() {
        let mut heap = new_heap();
        let first = heap.heap_start;
        let size = block::get_size(heap.arena.bytes(), first);
        let bucket = SegregatedList::bucket_index(size);
        heap.free_lists.heads[bucket] = Some(1 << 30);
        assert_corrupt(&heap, "outside the heap");
    }
}
