//! NUMA-aware asynchronous I/O core for the Strata page cache.
//!
//! Each disk gets a long-running service thread bound to a NUMA node that
//! multiplexes two priority classes of requests against one async I/O
//! engine: application reads go through the high-priority queue, dirty-page
//! write-backs solicited from the shared page cache go through the
//! low-priority queue and only use submission slots the high-priority class
//! does not need. Page buffers come from NUMA-pinned slab allocators; a
//! memory manager arbitrates them across caches, shrinking the largest peer
//! when one cache runs dry.
//!
//! The cache itself (replacement, indexing, dirty accounting) and the real
//! async submission backend stay behind the [`cache::PageCache`] and
//! [`io::AsyncIo`] seams.

pub mod cache;
pub mod context;
pub mod error;
pub mod io;
pub mod mm;
pub mod numa;
pub mod params;

pub use context::IoContext;
pub use error::{Error, Result};
