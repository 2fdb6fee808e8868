//! Free-page arbitration across a fleet of caches sharing one slab.

use std::sync::Arc;

use spin::Mutex;
use tracing::debug;

use crate::cache::{same_cache, PageBuf, PageCache};
use crate::context::IoContext;
use crate::error::{Error, Result};
use crate::mm::slab::{SlabAllocator, SlabConfig};
use crate::params::{INCREASE_SIZE, PAGE_SIZE, SHRINK_NPAGES};

/// Supplies page buffers to every cache on one NUMA node and, when the slab
/// is exhausted, reclaims pages by shrinking the largest peer cache.
pub struct MemoryManager {
    slab: SlabAllocator,
    caches: Mutex<Vec<Arc<dyn PageCache>>>,
}

impl MemoryManager {
    pub fn new(max_size: usize, node: Option<u32>, ctx: &Arc<IoContext>) -> Self {
        let slab = SlabAllocator::new(
            SlabConfig {
                name: "mem_manager".into(),
                obj_size: PAGE_SIZE,
                increase_size: INCREASE_SIZE.min(max_size),
                max_size,
                node,
                // Pages are pinned but handed out uninitialized; the first
                // reader fills them from disk anyway.
                zero_init: false,
                pinned: true,
                local_buf_size: 0,
            },
            ctx,
        );
        Self {
            slab,
            caches: Mutex::new(Vec::new()),
        }
    }

    /// Register a cache as a candidate for cross-cache shrinkage.
    pub fn register_cache(&self, cache: Arc<dyn PageCache>) {
        self.caches.lock().push(cache);
    }

    /// Get `npages` pages for `requester`.
    ///
    /// When the slab cannot satisfy the request, the largest registered
    /// cache is shrunk by `max(SHRINK_NPAGES, npages)` pages and the freed
    /// pages are returned to the slab before retrying. Shrinking the
    /// requester itself makes no sense (and would livelock), so that case
    /// fails instead.
    pub fn get_free_pages(
        &self,
        npages: usize,
        out: &mut Vec<PageBuf>,
        requester: Option<&Arc<dyn PageCache>>,
    ) -> Result<()> {
        // The slab allocates either all requested pages or none of them.
        if self.slab.alloc_batch(npages, out) {
            return Ok(());
        }

        let victim = {
            let caches = self.caches.lock();
            let mut largest: Option<&Arc<dyn PageCache>> = None;
            let mut size = 0;
            for cache in caches.iter() {
                let s = cache.size();
                if s > size {
                    size = s;
                    largest = Some(cache);
                }
            }
            largest.cloned()
        };
        let Some(victim) = victim else {
            return Err(Error::NoShrinkVictim);
        };
        if let Some(requester) = requester {
            if same_cache(requester, &victim) {
                return Err(Error::SelfShrink);
            }
        }

        let num_shrink = SHRINK_NPAGES.max(npages);
        let mut freed = Vec::with_capacity(num_shrink);
        if !victim.shrink(num_shrink, &mut freed) {
            return Err(Error::ShrinkFailed {
                requested: num_shrink,
            });
        }
        debug!(
            freed = freed.len(),
            requested = npages,
            "shrunk largest peer cache"
        );
        self.slab.free_batch(freed);

        // The victim just returned at least npages, so the retry succeeds
        // unless a concurrent allocator raced us to the freelist.
        if self.slab.alloc_batch(npages, out) {
            Ok(())
        } else {
            Err(Error::SlabExhausted {
                name: self.slab.name().to_string(),
                requested: npages,
                max_bytes: self.slab.max_size(),
            })
        }
    }

    /// Return pages to the slab.
    pub fn free_pages<I>(&self, pages: I)
    where
        I: IntoIterator<Item = PageBuf>,
    {
        self.slab.free_batch(pages);
    }

    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }
}
