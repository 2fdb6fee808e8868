//! Process-wide accounting, owned explicitly instead of living in globals.
//!
//! Every slab allocator is created against an [`IoContext`]; the context
//! hands out unique allocator ids and tracks the total bytes held by slabs
//! so operators can see aggregate memory consumption in one place.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct IoContext {
    total_slab_bytes: AtomicUsize,
    next_alloc_id: AtomicU64,
}

impl IoContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total bytes currently reserved by all slab allocators of this context.
    pub fn total_slab_bytes(&self) -> usize {
        self.total_slab_bytes.load(Ordering::Relaxed)
    }

    /// Monotonic id used to make allocator names unique.
    pub(crate) fn next_alloc_id(&self) -> u64 {
        self.next_alloc_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_slab_bytes(&self, n: usize) {
        self.total_slab_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub_slab_bytes(&self, n: usize) {
        self.total_slab_bytes.fetch_sub(n, Ordering::Relaxed);
    }
}
