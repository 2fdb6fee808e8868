//! NUMA-pinned slab allocator for fixed-size objects.
//!
//! Free objects form an intrusive linked list threaded through the freed
//! memory itself, so the freelist has no metadata overhead. The allocator
//! grows in fixed-size NUMA-local chunks up to a configured ceiling and
//! never shrinks before teardown. Threads may opt into a private front-end
//! buffer that batches refills and drains against the shared freelist.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;
use tracing::{debug, error};

use crate::cache::PageBuf;
use crate::context::IoContext;
use crate::numa;
use crate::params::PAGE_SIZE;

/// Construction parameters for one slab allocator.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    /// Base name; the owning context appends a unique suffix.
    pub name: String,
    /// Size of every handed-out object, in bytes.
    pub obj_size: usize,
    /// Growth increment; rounded up to a page multiple.
    pub increase_size: usize,
    /// Ceiling on total reserved bytes.
    pub max_size: usize,
    /// Preferred NUMA node for chunk memory.
    pub node: Option<u32>,
    /// Zero (and fault in) every chunk before carving it.
    pub zero_init: bool,
    /// `mlock` chunks into physical memory.
    pub pinned: bool,
    /// Per-thread front-end buffer length; 0 disables the front-end.
    pub local_buf_size: usize,
}

/// Free-list header written into each free object.
#[repr(C)]
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Intrusive singly-linked list of free objects, with a tail pointer so
/// whole carved chunks splice in O(1).
struct FreeList {
    head: Option<NonNull<FreeObject>>,
    tail: Option<NonNull<FreeObject>>,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn push(&mut self, obj: NonNull<u8>) {
        let header = obj.cast::<FreeObject>();
        // SAFETY: the object is dead (no live reference), large enough for
        // the header (checked at construction), and its chunk stays mapped
        // for the allocator's lifetime.
        unsafe { header.as_ptr().write(FreeObject { next: self.head }) };
        if self.head.is_none() {
            self.tail = Some(header);
        }
        self.head = Some(header);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let header = self.head?;
        // SAFETY: every list node was written by `push`.
        self.head = unsafe { (*header.as_ptr()).next };
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(header.cast::<u8>())
    }

    fn splice(&mut self, other: FreeList) {
        let Some(other_tail) = other.tail else {
            return;
        };
        // SAFETY: `other_tail` is a live node of `other`; linking it to our
        // head preserves both lists' nodes.
        unsafe { (*other_tail.as_ptr()).next = self.head };
        if self.head.is_none() {
            self.tail = other.tail;
        }
        self.head = other.head;
        self.len += other.len;
    }
}

struct SlabInner {
    free: FreeList,
    /// Chunk base pointers, kept for teardown.
    chunks: Vec<NonNull<u8>>,
}

// SAFETY: the raw pointers in the freelist and chunk list are only touched
// under the slab lock, and the memory they reference lives until the shared
// state is dropped.
unsafe impl Send for SlabInner {}

pub(crate) struct SlabShared {
    id: u64,
    name: String,
    obj_size: usize,
    increase_size: usize,
    max_size: usize,
    node: Option<u32>,
    zero_init: bool,
    pinned: bool,
    local_buf_size: usize,
    /// Reserved bytes. Grown under the lock *before* the chunk is mapped,
    /// so observers see the projected size during the long OS call.
    curr_size: AtomicUsize,
    inner: Mutex<SlabInner>,
    ctx: Arc<IoContext>,
}

impl SlabShared {
    fn alloc_batch(&self, n: usize, out: &mut Vec<PageBuf>) -> bool {
        let start = out.len();
        loop {
            {
                let mut inner = self.inner.lock();
                while out.len() - start < n {
                    match inner.free.pop() {
                        Some(obj) => out.push(PageBuf::from_raw(obj, self.obj_size)),
                        None => break,
                    }
                }
            }
            if out.len() - start == n {
                return true;
            }

            // Growth is the rare path; the chunk mapping happens outside the
            // lock with the quota already reserved.
            let reserved = {
                let _inner = self.inner.lock();
                if self.curr_size.load(Ordering::Relaxed) < self.max_size {
                    self.curr_size.fetch_add(self.increase_size, Ordering::Relaxed);
                    self.ctx.add_slab_bytes(self.increase_size);
                    true
                } else {
                    false
                }
            };
            if !reserved {
                // All-or-nothing: put any partial batch back.
                let partial: Vec<PageBuf> = out.drain(start..).collect();
                self.release(partial);
                return false;
            }

            match numa::alloc_chunk(self.increase_size, self.node, self.pinned) {
                Ok(chunk) => {
                    if self.zero_init {
                        // SAFETY: the fresh mapping spans increase_size bytes.
                        unsafe { chunk.as_ptr().write_bytes(0, self.increase_size) };
                    }
                    let mut carved = FreeList::new();
                    let nobjs = self.increase_size / self.obj_size;
                    for i in 0..nobjs {
                        // SAFETY: i * obj_size stays within the chunk.
                        let obj = unsafe {
                            NonNull::new_unchecked(chunk.as_ptr().add(i * self.obj_size))
                        };
                        carved.push(obj);
                    }
                    let mut inner = self.inner.lock();
                    inner.chunks.push(chunk);
                    inner.free.splice(carved);
                    drop(inner);
                    debug!(
                        name = %self.name,
                        curr_mb = self.curr_size.load(Ordering::Relaxed) / 1024 / 1024,
                        "slab grew by one chunk"
                    );
                }
                Err(e) => {
                    error!(name = %self.name, error = %e, "slab chunk mapping failed");
                    self.curr_size.fetch_sub(self.increase_size, Ordering::Relaxed);
                    self.ctx.sub_slab_bytes(self.increase_size);
                    let partial: Vec<PageBuf> = out.drain(start..).collect();
                    self.release(partial);
                    return false;
                }
            }
        }
    }

    fn release<I>(&self, objs: I)
    where
        I: IntoIterator<Item = PageBuf>,
    {
        let mut returned = FreeList::new();
        for obj in objs {
            debug_assert_eq!(obj.len(), self.obj_size);
            returned.push(obj.into_raw());
        }
        if returned.len == 0 {
            return;
        }
        self.inner.lock().free.splice(returned);
    }
}

impl Drop for SlabShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for chunk in inner.chunks.drain(..) {
            // SAFETY: each recorded chunk was mapped with increase_size
            // bytes; nothing references it past this point.
            unsafe { numa::free_chunk(chunk, self.increase_size, self.pinned) };
        }
        self.ctx.sub_slab_bytes(self.curr_size.load(Ordering::Relaxed));
        debug!(name = %self.name, "slab torn down");
    }
}

thread_local! {
    /// Per-thread front-end buffers, keyed by allocator id. Dropped on
    /// thread exit, returning buffered objects to their shared freelists.
    static LOCAL_BUFS: RefCell<HashMap<u64, LocalBuf>> = RefCell::new(HashMap::new());
}

struct LocalBuf {
    slab: Weak<SlabShared>,
    objs: Vec<PageBuf>,
}

impl Drop for LocalBuf {
    fn drop(&mut self) {
        if let Some(shared) = self.slab.upgrade() {
            shared.release(self.objs.drain(..));
        }
        // Without an owner the chunks are already unmapped and the handles
        // are dead; nothing to return.
    }
}

/// A per-name, NUMA-pinned fixed-object-size allocator.
pub struct SlabAllocator {
    shared: Arc<SlabShared>,
}

impl SlabAllocator {
    pub fn new(config: SlabConfig, ctx: &Arc<IoContext>) -> Self {
        assert!(config.obj_size >= std::mem::size_of::<FreeObject>());
        assert_eq!(config.obj_size % std::mem::align_of::<FreeObject>(), 0);
        let increase_size = config.increase_size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        assert!(config.obj_size <= increase_size);

        let id = ctx.next_alloc_id();
        Self {
            shared: Arc::new(SlabShared {
                id,
                name: format!("{}-{}", config.name, id),
                obj_size: config.obj_size,
                increase_size,
                max_size: config.max_size,
                node: config.node,
                zero_init: config.zero_init,
                pinned: config.pinned,
                local_buf_size: config.local_buf_size,
                curr_size: AtomicUsize::new(0),
                inner: Mutex::new(SlabInner {
                    free: FreeList::new(),
                    chunks: Vec::new(),
                }),
                ctx: Arc::clone(ctx),
            }),
        }
    }

    /// Allocate exactly `n` objects into `out`, or none at all.
    ///
    /// On failure any partially collected objects are returned to the
    /// freelist before this returns false.
    pub fn alloc_batch(&self, n: usize, out: &mut Vec<PageBuf>) -> bool {
        self.shared.alloc_batch(n, out)
    }

    /// Return a batch of objects to the shared freelist.
    pub fn free_batch<I>(&self, objs: I)
    where
        I: IntoIterator<Item = PageBuf>,
    {
        self.shared.release(objs);
    }

    /// Single-object allocation, routed through the per-thread front-end
    /// when one is configured.
    pub fn alloc(&self) -> Option<PageBuf> {
        if self.shared.local_buf_size == 0 {
            let mut out = Vec::with_capacity(1);
            if self.shared.alloc_batch(1, &mut out) {
                return out.pop();
            }
            return None;
        }
        LOCAL_BUFS.with(|bufs| {
            let mut bufs = bufs.borrow_mut();
            let local = bufs.entry(self.shared.id).or_insert_with(|| LocalBuf {
                slab: Arc::downgrade(&self.shared),
                objs: Vec::with_capacity(self.shared.local_buf_size),
            });
            if local.objs.is_empty()
                && !self
                    .shared
                    .alloc_batch(self.shared.local_buf_size, &mut local.objs)
            {
                return None;
            }
            local.objs.pop()
        })
    }

    /// Single-object free, buffered in the per-thread front-end when one is
    /// configured.
    pub fn free(&self, obj: PageBuf) {
        if self.shared.local_buf_size == 0 {
            self.shared.release(std::iter::once(obj));
            return;
        }
        LOCAL_BUFS.with(|bufs| {
            let mut bufs = bufs.borrow_mut();
            let local = bufs.entry(self.shared.id).or_insert_with(|| LocalBuf {
                slab: Arc::downgrade(&self.shared),
                objs: Vec::with_capacity(self.shared.local_buf_size),
            });
            if local.objs.len() >= self.shared.local_buf_size {
                let drained: Vec<PageBuf> = local.objs.drain(..).collect();
                self.shared.release(drained);
            }
            local.objs.push(obj);
        });
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn obj_size(&self) -> usize {
        self.shared.obj_size
    }

    /// Reserved bytes; includes quota for chunks still being mapped.
    pub fn curr_size(&self) -> usize {
        self.shared.curr_size.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn node(&self) -> Option<u32> {
        self.shared.node
    }

    /// Objects currently on the shared freelist (excludes per-thread
    /// front-end buffers).
    pub fn free_count(&self) -> usize {
        self.shared.inner.lock().free.len
    }
}
