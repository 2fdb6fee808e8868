//! Page buffers and thread-safe page descriptors.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

/// A fixed-size, page-aligned buffer handle.
///
/// The backing memory is owned by a slab allocator; the handle only moves
/// exclusive access around. Dropping a `PageBuf` does not free anything:
/// buffers are returned with `SlabAllocator::free`, and whatever is still
/// outstanding dies with the allocator's chunks.
pub struct PageBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageBuf {
    pub(crate) fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub(crate) fn into_raw(self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the buffer contents.
    ///
    /// # Safety
    ///
    /// The owning slab allocator must still be alive and no writer may
    /// concurrently mutate the buffer.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Mutable view of the buffer contents.
    ///
    /// # Safety
    ///
    /// The owning slab allocator must still be alive and the caller must be
    /// the buffer's only accessor for the duration of the borrow.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: PageBuf hands out exclusive access to a raw region carved from a
// slab chunk. Access is mediated by the owner (a cache page's lock or the
// io-pending protocol), so moving/sharing the handle across threads is sound.
unsafe impl Send for PageBuf {}
unsafe impl Sync for PageBuf {}

bitflags! {
    /// Page state bits, guarded by the page's short lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Page content differs from the on-disk copy.
        const DIRTY = 1 << 0;
        /// An I/O against this page has been submitted and not completed;
        /// no further I/O may be issued against it.
        const IO_PENDING = 1 << 1;
        /// The flush scanner selected this page and queued a write-back
        /// that has not been dispatched yet.
        const PREPARE_WRITEBACK = 1 << 2;
    }
}

/// Mutable page state; obtained through [`CachePage::lock`].
#[derive(Debug)]
pub struct PageState {
    flags: PageFlags,
    flush_score: u8,
}

impl PageState {
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.flags.set(PageFlags::DIRTY, dirty);
    }

    pub fn is_io_pending(&self) -> bool {
        self.flags.contains(PageFlags::IO_PENDING)
    }

    pub fn set_io_pending(&mut self, pending: bool) {
        self.flags.set(PageFlags::IO_PENDING, pending);
    }

    pub fn is_prepare_writeback(&self) -> bool {
        self.flags.contains(PageFlags::PREPARE_WRITEBACK)
    }

    pub fn set_prepare_writeback(&mut self, prepare: bool) {
        self.flags.set(PageFlags::PREPARE_WRITEBACK, prepare);
    }

    /// Aging measure maintained by the cache's flush scanner; high scores
    /// mean the page has sat in the write-back queue for many scan passes.
    pub fn flush_score(&self) -> u8 {
        self.flush_score
    }

    pub fn set_flush_score(&mut self, score: u8) {
        self.flush_score = score;
    }
}

/// A thread-safe page descriptor.
///
/// Identity within a cache is the file offset. The explicit reference count
/// pins the page against eviction; the short lock guards the flag/score
/// transitions during write-back commit.
pub struct CachePage {
    offset: AtomicU64,
    refcount: AtomicU32,
    state: Mutex<PageState>,
    buf: PageBuf,
}

impl CachePage {
    pub fn new(offset: u64, buf: PageBuf) -> Self {
        Self {
            offset: AtomicU64::new(offset),
            refcount: AtomicU32::new(0),
            state: Mutex::new(PageState {
                flags: PageFlags::empty(),
                flush_score: 0,
            }),
            buf,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Re-key the descriptor when the cache reuses the frame for another
    /// offset. Only the cache calls this, with the page unreferenced.
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    /// Pin the page against eviction.
    pub fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a pin; returns the remaining count.
    pub fn dec_ref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page refcount underflow");
        prev - 1
    }

    pub fn refs(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take the page's short lock. Critical sections must stay bounded; the
    /// lock is a spin lock.
    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// Clear or set the prepare-writeback bit without keeping the lock.
    pub fn set_prepare_writeback(&self, prepare: bool) {
        self.state.lock().set_prepare_writeback(prepare);
    }

    pub fn buf(&self) -> &PageBuf {
        &self.buf
    }
}

impl fmt::Debug for CachePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CachePage")
            .field("offset", &self.offset())
            .field("refs", &self.refs())
            .field("state", &*state)
            .finish()
    }
}
