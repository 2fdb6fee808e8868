//! Error types for the I/O core.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The slab reached its ceiling and no growth is possible.
    #[error("slab '{name}' exhausted: {requested} objects requested at ceiling of {max_bytes} bytes")]
    SlabExhausted {
        name: String,
        requested: usize,
        max_bytes: usize,
    },

    /// No page cache is registered that could give pages back.
    #[error("no peer cache available to shrink")]
    NoShrinkVictim,

    /// The largest cache is the one asking for pages; shrinking it would
    /// only move its own pages around.
    #[error("largest cache is the requester; refusing self-shrink")]
    SelfShrink,

    /// The chosen victim cache refused to release pages.
    #[error("peer cache refused to release {requested} pages")]
    ShrinkFailed { requested: usize },

    /// Anonymous memory mapping for a slab chunk failed.
    #[error("memory map of {len} bytes failed")]
    ChunkMap {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The per-disk service thread could not be created. Fatal at startup.
    #[error("failed to spawn disk I/O service thread")]
    Spawn(#[source] io::Error),
}
