//! The per-disk I/O service thread.
//!
//! One long-running worker per disk, bound to a NUMA node, drains a
//! high-priority and a low-priority request queue against a single async
//! engine. High-priority requests (application reads and synchronous
//! writes) are submitted as fast as slots allow; low-priority write-backs
//! solicited from the page cache only run while the engine has more than
//! the reserved slot count free and the high-priority queue is empty.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::io::engine::AsyncIo;
use crate::io::filter::{DirtyPageFilter, FileMapper};
use crate::io::message::Message;
use crate::io::queue::MsgQueue;
use crate::io::request::{IoRequest, RequestOwner};
use crate::io::stats::{ServiceStats, StatsSnapshot};
use crate::numa;
use crate::params::{Tunables, IO_QUEUE_SIZE, LOW_PRIO_QUEUE_GROWTH};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub disk_id: u32,
    pub node: Option<u32>,
    pub tunables: Tunables,
}

struct ServiceShared {
    disk_id: u32,
    node: Option<u32>,
    queue: MsgQueue<Message>,
    low_prio_queue: MsgQueue<Message>,
    running: AtomicBool,
    flush_counter: AtomicU32,
    stats: ServiceStats,
}

/// Producer-side handle to a running service. Cheap to clone; the page
/// cache keeps one to enqueue write-backs, application endpoints keep one
/// to submit reads.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<ServiceShared>,
}

impl ServiceHandle {
    /// Submit a high-priority message. Back-pressure: the message comes
    /// back when the queue is full.
    pub fn submit(&self, msg: Message) -> std::result::Result<(), Message> {
        self.shared.queue.push(msg)
    }

    /// Enqueue a low-priority write-back message and wake the service if it
    /// is parked waiting for high-priority work.
    pub fn submit_low_prio(&self, msg: Message) -> std::result::Result<(), Message> {
        self.shared.low_prio_queue.push(msg)?;
        self.shared.queue.interrupt();
        Ok(())
    }

    /// Ask the service to push buffered submissions to the kernel.
    pub fn flush_requests(&self) {
        self.shared.flush_counter.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.interrupt();
    }

    pub fn disk_id(&self) -> u32 {
        self.shared.disk_id
    }

    pub fn node(&self) -> Option<u32> {
        self.shared.node
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn queue_entries(&self) -> usize {
        self.shared.queue.num_entries()
    }

    pub fn low_prio_queue_entries(&self) -> usize {
        self.shared.low_prio_queue.num_entries()
    }
}

/// A per-disk I/O service. Owns the worker thread; dropping the service
/// shuts it down and joins it.
pub struct DiskIoService {
    handle: ServiceHandle,
    thread: Option<JoinHandle<()>>,
}

impl DiskIoService {
    /// Create the queues and start the worker. Thread creation failure is
    /// fatal at startup and surfaces as an error.
    pub fn spawn(
        config: ServiceConfig,
        engine: Box<dyn AsyncIo>,
        cache: Option<Arc<dyn PageCache>>,
        mapper: Arc<dyn FileMapper>,
    ) -> Result<Self> {
        let shared = Arc::new(ServiceShared {
            disk_id: config.disk_id,
            node: config.node,
            queue: MsgQueue::new(
                format!("io-queue-{}", config.disk_id),
                config.node,
                IO_QUEUE_SIZE,
            ),
            low_prio_queue: MsgQueue::new(
                format!("io-queue-low-prio-{}", config.disk_id),
                config.node,
                IO_QUEUE_SIZE * LOW_PRIO_QUEUE_GROWTH,
            ),
            running: AtomicBool::new(true),
            flush_counter: AtomicU32::new(0),
            stats: ServiceStats::default(),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            engine,
            cache,
            filter: DirtyPageFilter::new(mapper, config.disk_id),
            tunables: config.tunables,
        };
        let thread = std::thread::Builder::new()
            .name(format!("disk-io-{}", config.disk_id))
            .spawn(move || worker.run())
            .map_err(Error::Spawn)?;
        Ok(Self {
            handle: ServiceHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    /// Stop the worker at its next top-of-loop check and join it. Pending
    /// async I/Os are drained before the worker exits.
    pub fn shutdown(&mut self) {
        self.handle.shared.running.store(false, Ordering::Release);
        self.handle.shared.queue.interrupt();
        self.handle.shared.low_prio_queue.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DiskIoService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<ServiceShared>,
    engine: Box<dyn AsyncIo>,
    cache: Option<Arc<dyn PageCache>>,
    filter: DirtyPageFilter,
    tunables: Tunables,
}

impl Worker {
    fn run(mut self) {
        if let Some(node) = self.shared.node {
            numa::bind_to_node(node);
        }
        debug!(
            disk_id = self.shared.disk_id,
            node = ?self.shared.node,
            "disk I/O service running"
        );
        self.engine.init();

        let mut msg_buffer: Vec<Message> = Vec::with_capacity(self.tunables.local_buf_size);
        let mut low_prio_msg: Option<Message> = None;

        while self.shared.running.load(Ordering::Acquire) {
            let mut num = self
                .shared
                .queue
                .non_blocking_fetch(&mut msg_buffer, self.tunables.local_buf_size);

            // The high-priority queue is empty: do background work until it
            // isn't, or until there is nothing left to do.
            while num == 0 {
                if !self.shared.low_prio_queue.is_empty()
                    && self.engine.available_slots() > self.tunables.aio_high_prio_slots
                {
                    if low_prio_msg.is_none() {
                        let mut fetched = Vec::with_capacity(1);
                        let got = self.shared.low_prio_queue.non_blocking_fetch(&mut fetched, 1);
                        // Single consumer: the non-empty check cannot be
                        // invalidated by anyone else.
                        debug_assert_eq!(got, 1);
                        low_prio_msg = fetched.pop();
                    }
                    if let Some(mut msg) = low_prio_msg.take() {
                        let dispatched = self.process_low_prio_msg(&mut msg);
                        self.shared.stats.add_accesses(dispatched);
                        if !msg.is_empty() {
                            low_prio_msg = Some(msg);
                        }
                    }
                } else if self.engine.pending_ios() > 0 {
                    // Only this thread fetches requests; with none incoming,
                    // completing pending I/Os comes first.
                    self.engine.wait_for_complete(1);
                } else if let Some(cache) = self.cache.as_ref() {
                    let solicited = cache
                        .flush_dirty_pages(&self.filter, self.tunables.num_dirty_pages_to_fetch);
                    if solicited == 0 {
                        break;
                    }
                    self.shared.stats.add_requested_flushes(solicited);
                } else {
                    break;
                }

                num = self
                    .shared
                    .queue
                    .non_blocking_fetch(&mut msg_buffer, self.tunables.local_buf_size);
            }

            if num == 0 {
                num = self
                    .shared
                    .queue
                    .fetch(&mut msg_buffer, self.tunables.local_buf_size);
            }

            if self.shared.flush_counter.load(Ordering::Acquire) > 0 {
                // This thread is the only decrementer.
                self.shared.flush_counter.fetch_sub(1, Ordering::AcqRel);
                self.engine.flush_submissions();
            }

            // Interrupted out of the blocking fetch: go back around and try
            // the low-priority work again.
            if num == 0 {
                continue;
            }

            for mut msg in msg_buffer.drain(..) {
                let reqs = msg.take_requests();
                self.shared.stats.add_accesses(reqs.len());
                self.engine.submit(reqs);
            }
        }

        // Drain in-flight operations so their completions are delivered
        // before the engine goes away.
        while self.engine.pending_ios() > 0 {
            self.engine.wait_for_complete(1);
        }
        // A half-processed write-back batch never reached the engine; its
        // requests are delivered as discarded so issuers can release them.
        if let Some(mut msg) = low_prio_msg.take() {
            let mut leftover = Vec::with_capacity(msg.len());
            while let Some(req) = msg.next() {
                if let Some(page) = req.page() {
                    page.set_prepare_writeback(false);
                }
                leftover.push(req);
            }
            notify_ignored_flushes(leftover);
        }
        debug!(disk_id = self.shared.disk_id, "disk I/O service stopped");
    }

    /// Consume one low-priority message, request by request, re-checking
    /// the slot reservation and the high-priority queue before each one.
    /// Returns the number of requests handed to the engine.
    fn process_low_prio_msg(&mut self, msg: &mut Message) -> usize {
        let mut dispatched = 0;
        let mut ignored: Vec<IoRequest> = Vec::new();

        while msg.has_next()
            && self.engine.available_slots() > self.tunables.aio_high_prio_slots
            && self.shared.queue.is_empty()
        {
            let Some(mut req) = msg.next() else {
                break;
            };
            self.shared.stats.inc_low_prio_access();

            let Some(orig_page) = req.page().cloned() else {
                debug_assert!(false, "write-back request without a page");
                ignored.push(req);
                continue;
            };
            let cache = match req.owner() {
                Some(RequestOwner::Cache(cache)) => Arc::clone(cache),
                _ => {
                    debug_assert!(false, "queued write-back not owned by a cache");
                    ignored.push(req);
                    continue;
                }
            };

            // The request held no reference while queued, so the page may
            // have been evicted underneath it. Searching the cache is the
            // only safe way to re-acquire it with a pin.
            match cache.search(req.offset()) {
                None => {
                    // Evicted; nothing at this offset anymore.
                    orig_page.set_prepare_writeback(false);
                    self.shared.stats.inc_ignored_evicted();
                    ignored.push(req);
                }
                Some(found) if !Arc::ptr_eq(&found, &orig_page) => {
                    // Evicted and the slot re-used for a different page.
                    found.dec_ref();
                    orig_page.set_prepare_writeback(false);
                    self.shared.stats.inc_ignored_evicted();
                    ignored.push(req);
                }
                Some(page) => {
                    // The pin from `search` guarantees the page stays.
                    let mut state = page.lock();
                    // The flush scanner's mark comes off no matter what
                    // happens next.
                    state.set_prepare_writeback(false);
                    let aged =
                        state.flush_score() > self.tunables.discard_flush_threshold;
                    if state.is_io_pending() || !state.is_dirty() || aged {
                        drop(state);
                        page.dec_ref();
                        if aged {
                            self.shared.stats.inc_ignored_old();
                        } else {
                            self.shared.stats.inc_ignored_cleaned();
                        }
                        ignored.push(req);
                    } else {
                        state.set_io_pending(true);
                        drop(state);
                        self.shared.stats.record_flush_delay(req.issued_at().elapsed());
                        dispatched += 1;
                        // The request now owns the pinned reference; its
                        // private pointer moves from the cache to the page.
                        req.set_owner(RequestOwner::Page(page));
                        self.engine.submit(vec![req]);
                    }
                }
            }
        }

        if !ignored.is_empty() {
            notify_ignored_flushes(ignored);
        }
        dispatched
    }
}

/// Deliver discarded write-backs to their origin endpoints, one by one.
/// All flush requests of a batch come from the same endpoint instance, but
/// each carries its own handle so no assumption is needed here.
fn notify_ignored_flushes(requests: Vec<IoRequest>) {
    for mut req in requests {
        req.set_discarded(true);
        let endpoint = Arc::clone(req.endpoint());
        endpoint.notify_completion(std::slice::from_mut(&mut req));
    }
}
