//! Tuning parameters for the I/O core.
//!
//! Compile-time defaults match what the storage library ships with; the soft
//! knobs can be overridden from the environment through [`Tunables`].

/// Page buffer size in bytes (one cache page, one slab object).
pub const PAGE_SIZE: usize = 4096;

/// Async I/O submission depth per file partition.
pub const AIO_DEPTH_PER_FILE: usize = 32;

/// Slots of the async engine reserved for high-priority requests.
///
/// Low-priority write-backs are only dispatched while more than this many
/// slots remain free, so high-priority reads never see more than
/// `AIO_DEPTH_PER_FILE - AIO_HIGH_PRIO_SLOTS` write-backs in flight.
pub const AIO_HIGH_PRIO_SLOTS: usize = 7;

/// Dirty pages solicited from the cache per idle round.
pub const NUM_DIRTY_PAGES_TO_FETCH: usize = 16 * 18;

/// Flush-score age past which a queued write-back is discarded instead of
/// dispatched.
pub const DISCARD_FLUSH_THRESHOLD: u8 = 6;

/// Capacity of a service request queue, in messages.
pub const IO_QUEUE_SIZE: usize = 1024;

/// The low-priority queue is practically unbounded; it grows to this many
/// times the high-priority capacity before producers see back-pressure.
pub const LOW_PRIO_QUEUE_GROWTH: usize = 64;

/// Requests carried per message.
pub const IO_MSG_SIZE: usize = 128;

/// Per-thread allocator buffer length; also the number of messages the
/// service drains from its high-priority queue per round.
pub const LOCAL_BUF_SIZE: usize = 100;

/// Pages reclaimed from a peer cache per shrink round.
pub const SHRINK_NPAGES: usize = 1024;

/// Slab growth increment in bytes.
pub const INCREASE_SIZE: usize = 128 * 1024 * 1024;

/// Runtime-overridable knobs.
///
/// Every field defaults to the constant of the same name; `CACHEIO_*`
/// environment variables override individual values.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub aio_depth_per_file: usize,
    pub aio_high_prio_slots: usize,
    pub num_dirty_pages_to_fetch: usize,
    pub discard_flush_threshold: u8,
    pub local_buf_size: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            aio_depth_per_file: AIO_DEPTH_PER_FILE,
            aio_high_prio_slots: AIO_HIGH_PRIO_SLOTS,
            num_dirty_pages_to_fetch: NUM_DIRTY_PAGES_TO_FETCH,
            discard_flush_threshold: DISCARD_FLUSH_THRESHOLD,
            local_buf_size: LOCAL_BUF_SIZE,
        }
    }
}

impl Tunables {
    /// Build tunables from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut t = Self::default();
        t.aio_depth_per_file = env_usize("CACHEIO_AIO_DEPTH", t.aio_depth_per_file);
        t.aio_high_prio_slots = env_usize("CACHEIO_HIGH_PRIO_SLOTS", t.aio_high_prio_slots);
        t.num_dirty_pages_to_fetch =
            env_usize("CACHEIO_DIRTY_FETCH", t.num_dirty_pages_to_fetch);
        t.discard_flush_threshold = env_usize(
            "CACHEIO_DISCARD_FLUSH_THRESHOLD",
            t.discard_flush_threshold as usize,
        ) as u8;
        t.local_buf_size = env_usize("CACHEIO_LOCAL_BUF_SIZE", t.local_buf_size);
        t
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
