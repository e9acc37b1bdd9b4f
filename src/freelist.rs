//! Segregated free lists.
//!
//! All currently-free blocks live in one of [`BUCKET_COUNT`] doubly-linked
//! lists, bucketed by power-of-two size ranges. The lists are intrusive:
//! a free block's first two payload words are reinterpreted as its `next`
//! and `prev` links, so tracking free blocks costs no storage of its own.
//! Those words are only meaningful while the block is free; once it is
//! handed out they become payload again.
//!
//! ```text
//! heads[k]
//!    |
//!    v
//! +------+      +------+      +------+
//! | free | <--> | free | <--> | free |
//! +------+      +------+      +------+
//! ```
//!
//! The blocks of one bucket may sit anywhere in the heap; only their sizes
//! relate them. Links are stored as arena offsets, with [`NIL`] marking
//! the end of a list. Insertion is LIFO at the bucket head.

use crate::block::{self, WSIZE};

/// Number of segregated buckets. Bucket `k` owns free blocks whose size
/// falls in `[2^(k+4), 2^(k+5)]`; the last bucket catches everything
/// larger.
pub(crate) const BUCKET_COUNT: usize = 10;

/// Stored link value meaning "no neighbour".
const NIL: u64 = u64::MAX;

fn read_link(bytes: &[u8], offset: usize) -> Option<usize> {
    let word = block::read_word(bytes, offset);
    if word == NIL {
        return None;
    }
    Some(word as usize)
}

fn write_link(bytes: &mut [u8], offset: usize, link: Option<usize>) {
    let word = match link {
        Some(offset) => offset as u64,
        None => NIL,
    };
    block::write_word(bytes, offset, word);
}

/// `next` link of the free block whose header is at `block`.
pub(crate) fn next_of(bytes: &[u8], block: usize) -> Option<usize> {
    read_link(bytes, block + WSIZE)
}

/// `prev` link of the free block whose header is at `block`.
pub(crate) fn prev_of(bytes: &[u8], block: usize) -> Option<usize> {
    read_link(bytes, block + 2 * WSIZE)
}

fn set_next(bytes: &mut [u8], block: usize, link: Option<usize>) {
    write_link(bytes, block + WSIZE, link);
}

fn set_prev(bytes: &mut [u8], block: usize, link: Option<usize>) {
    write_link(bytes, block + 2 * WSIZE, link);
}

/// The array of bucket heads. Owned by the allocator; all link storage
/// lives inside the arena itself.
pub(crate) struct SegregatedList {
    pub(crate) heads: [Option<usize>; BUCKET_COUNT],
}

impl SegregatedList {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; BUCKET_COUNT],
        }
    }

    /// Bucket owning blocks of `size`: the first `k` whose inclusive range
    /// `[2^(k+4), 2^(k+5)]` contains it. A size at a range boundary lands
    /// in the lower of the two overlapping buckets.
    pub(crate) fn bucket_index(size: usize) -> usize {
        for k in 0..BUCKET_COUNT - 1 {
            if size >= (1 << (k + 4)) && size <= (1 << (k + 5)) {
                return k;
            }
        }
        BUCKET_COUNT - 1
    }

    /// Head of `bucket`'s list, if the bucket is non-empty.
    pub(crate) fn head(&self, bucket: usize) -> Option<usize> {
        self.heads[bucket]
    }

    /// Pushes a free block at the head of its bucket (LIFO).
    ///
    /// The block's header must already hold its final size and a cleared
    /// allocation flag, since the bucket is chosen from the header.
    pub(crate) fn insert(&mut self, bytes: &mut [u8], block: usize) {
        debug_assert!(!block::get_alloc(bytes, block));

        let idx = Self::bucket_index(block::get_size(bytes, block));
        let head = self.heads[idx];

        set_next(bytes, block, head);
        set_prev(bytes, block, None);
        if let Some(head) = head {
            set_prev(bytes, head, Some(block));
        }
        self.heads[idx] = Some(block);
    }

    /// Splices a block out of the bucket it currently occupies.
    ///
    /// Must be called before the block's size changes, while the header
    /// still names the bucket the block lives in. Only that bucket is
    /// touched.
    pub(crate) fn remove(&mut self, bytes: &mut [u8], block: usize) {
        let idx = Self::bucket_index(block::get_size(bytes, block));
        let next = next_of(bytes, block);
        let prev = prev_of(bytes, block);

        match (prev, next) {
            // Only node in the bucket.
            (None, None) => {
                self.heads[idx] = None;
            }
            // Head with a successor.
            (None, Some(next)) => {
                set_prev(bytes, next, None);
                self.heads[idx] = Some(next);
            }
            // Tail with a predecessor.
            (Some(prev), None) => {
                set_next(bytes, prev, None);
            }
            // Interior node.
            (Some(prev), Some(next)) => {
                set_next(bytes, prev, Some(next));
                set_prev(bytes, next, Some(prev));
            }
        }
    }

    /// Returns the first free block that can hold `asize` bytes.
    ///
    /// Buckets are scanned upward starting from `asize`'s own bucket, and
    /// each non-empty bucket in LIFO order; the first block large enough
    /// wins. This is first-fit within an ascending bucket scan, not a
    /// global best-fit.
    pub(crate) fn find_fit(&self, bytes: &[u8], asize: usize) -> Option<usize> {
        for idx in Self::bucket_index(asize)..BUCKET_COUNT {
            let mut cursor = self.heads[idx];
            while let Some(block) = cursor {
                if block::get_size(bytes, block) >= asize {
                    return Some(block);
                }
                cursor = next_of(bytes, block);
            }
        }
        None
    }
}
