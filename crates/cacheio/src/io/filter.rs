//! Dirty-page filtering for one disk.

use std::sync::Arc;

use crate::cache::CachePage;

/// Maps a file offset to the disk that stores it. Injected by the layer
/// that owns the file-to-disk striping; pure and stateless.
pub trait FileMapper: Send + Sync {
    fn map_to_disk(&self, offset: u64) -> u32;
}

/// Selects, out of a batch of flush candidates, the pages whose offsets
/// live on this disk.
pub struct DirtyPageFilter {
    mapper: Arc<dyn FileMapper>,
    disk_id: u32,
}

impl DirtyPageFilter {
    pub fn new(mapper: Arc<dyn FileMapper>, disk_id: u32) -> Self {
        Self { mapper, disk_id }
    }

    pub fn disk_id(&self) -> u32 {
        self.disk_id
    }

    pub fn accepts(&self, page: &CachePage) -> bool {
        self.mapper.map_to_disk(page.offset()) == self.disk_id
    }

    /// Return the subset of `pages` that belong to this disk.
    pub fn filter(&self, pages: &[Arc<CachePage>]) -> Vec<Arc<CachePage>> {
        pages
            .iter()
            .filter(|p| self.accepts(p))
            .cloned()
            .collect()
    }
}
