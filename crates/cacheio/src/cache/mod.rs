//! The narrow page-cache interface the I/O core consumes.
//!
//! Replacement policy, indexing and dirty-bit accounting all live behind
//! [`PageCache`]; the core only searches, solicits flushes, and shrinks.

mod page;

pub use page::{CachePage, PageBuf, PageFlags, PageState};

use std::sync::Arc;

use crate::io::filter::DirtyPageFilter;

pub trait PageCache: Send + Sync {
    /// Look up the page at `offset`. On a hit the page is returned with an
    /// added reference, pinning it against eviction until the caller drops
    /// that reference with [`CachePage::dec_ref`].
    fn search(&self, offset: u64) -> Option<Arc<CachePage>>;

    /// Issue up to `budget` write-back requests for dirty pages accepted by
    /// `filter`, enqueuing them to the low-priority queue of the relevant
    /// disk service. Returns the number of requests enqueued.
    fn flush_dirty_pages(&self, filter: &DirtyPageFilter, budget: usize) -> usize;

    /// Release up to `n` page buffers back to the caller, filling `out`.
    /// Returns false when the cache cannot give anything up.
    fn shrink(&self, n: usize, out: &mut Vec<PageBuf>) -> bool;

    /// Current resident page count.
    fn size(&self) -> usize;
}

/// Instance identity for trait-object caches (the registry compares caches
/// by address, never by content).
pub(crate) fn same_cache(a: &Arc<dyn PageCache>, b: &Arc<dyn PageCache>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}
