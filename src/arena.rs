//! The arena: the single contiguous byte region the allocator manages.
//!
//! An arena only ever grows, at its high end, and never moves blocks that
//! were already handed out; the allocator addresses it by byte offset, so
//! the backing storage is free to relocate (as [`FixedArena`] does) or to
//! stay pinned (as [`SystemArena`] does).
//!
//! [`SystemArena`] is the production implementation: it reserves one large
//! range of virtual memory up front and commits pages on demand as the heap
//! grows, which is the classic grow-only `sbrk` discipline. The
//! platform-dependent syscalls live behind [`PlatformMemory`], as the
//! allocator itself has nothing to do with the concrete APIs offered by
//! each kernel.

use std::ptr::NonNull;
use std::slice;

use crate::utils::round_up;

/// A growable byte region addressed by offsets.
///
/// `grow` is the only fallible operation: it extends the region by `bytes`
/// (already rounded by the caller to the alignment unit) and returns the
/// offset of the newly added span, or `None` when the backing resource is
/// exhausted. Bytes handed out by earlier grows keep their offsets and
/// contents forever.
pub trait Arena {
    /// Extends the arena by `bytes` at the high end, returning the offset
    /// of the start of the new span.
    fn grow(&mut self, bytes: usize) -> Option<usize>;

    /// Offset of the first byte of the arena.
    fn low(&self) -> usize {
        0
    }

    /// Offset one past the last byte of the arena.
    fn high(&self) -> usize {
        self.bytes().len()
    }

    /// The arena's current contents.
    fn bytes(&self) -> &[u8];

    /// The arena's current contents, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// This trait provides an abstraction to handle low level memory
/// operations and syscalls: reserving a range of address space, committing
/// pages inside it, and releasing the range on drop.
trait PlatformMemory {
    /// Reserves `len` bytes of address space without backing them yet.
    /// Returns a pointer to the range, or `None` if the underlying syscall
    /// fails.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes starting at `addr` readable and writable.
    /// `addr` and `len` are page-aligned.
    unsafe fn commit(addr: *mut u8, len: usize) -> bool;

    /// Returns the range of `len` bytes starting at `addr` to the kernel.
    unsafe fn release(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// An arena backed by OS virtual memory.
///
/// The full capacity is reserved at construction, so the region is
/// guaranteed contiguous; pages are only committed as [`Arena::grow`]
/// reaches them. Growth past the reserved capacity reports exhaustion.
pub struct SystemArena {
    base: NonNull<u8>,
    len: usize,
    committed: usize,
    capacity: usize,
    page_size: usize,
}

impl SystemArena {
    /// Default reserved capacity: 1 GiB of address space.
    pub const DEFAULT_CAPACITY: usize = 1 << 30;

    /// Reserves [`Self::DEFAULT_CAPACITY`] bytes of address space.
    pub fn new() -> Option<Self> {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Reserves `capacity` bytes of address space, rounded up to the page
    /// size. Returns `None` if the reservation fails.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        let page_size = unsafe { Self::page_size() };
        let capacity = round_up(capacity.max(page_size), page_size);
        let base = unsafe { Self::reserve(capacity) }?;

        Some(Self {
            base,
            len: 0,
            committed: 0,
            capacity,
            page_size,
        })
    }

    /// Bytes of address space this arena may still grow into.
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }
}

impl Arena for SystemArena {
    fn grow(&mut self, bytes: usize) -> Option<usize> {
        let offset = self.len;
        let new_len = offset.checked_add(bytes)?;
        if new_len > self.capacity {
            return None;
        }

        // Commit whole pages covering the new length; capacity is
        // page-aligned, so the commit range never leaves the reservation.
        let commit_end = round_up(new_len, self.page_size);
        if commit_end > self.committed {
            let start = unsafe { self.base.as_ptr().add(self.committed) };
            if !unsafe { Self::commit(start, commit_end - self.committed) } {
                return None;
            }
            self.committed = commit_end;
        }

        self.len = new_len;
        Some(offset)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for SystemArena {
    fn drop(&mut self) {
        unsafe { Self::release(self.base.as_ptr(), self.capacity) }
    }
}

/// An arena with a hard capacity limit, backed by a `Vec`.
///
/// Growth past the configured capacity reports exhaustion, which makes
/// this the arena of choice for tests that need to provoke out-of-memory
/// paths deterministically.
pub struct FixedArena {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FixedArena {
    /// Creates an empty arena that may grow up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
        }
    }
}

impl Arena for FixedArena {
    fn grow(&mut self, bytes: usize) -> Option<usize> {
        let offset = self.bytes.len();
        if bytes > self.capacity - offset {
            return None;
        }
        self.bytes.resize(offset + bytes, 0);
        Some(offset)
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemArena};

    use libc::{mmap, mprotect, munmap, off_t, size_t, sysconf};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for SystemArena {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Inaccessible until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            unsafe {
                mprotect(
                    addr as *mut c_void,
                    len as size_t,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        unsafe fn release(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{PlatformMemory, SystemArena};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemArena {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn release(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
