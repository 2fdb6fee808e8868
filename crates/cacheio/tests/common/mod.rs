//! Shared test doubles: a controllable async engine, a scriptable page
//! cache, and a recording endpoint. Counters everywhere so tests can watch
//! the service from outside.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use cacheio::cache::{CachePage, PageCache};
use cacheio::io::{
    AsyncIo, DirtyPageFilter, FileMapper, IoEndpoint, IoRequest, Message, Priority, RequestOwner,
    ServiceHandle,
};
use cacheio::mm::{SlabAllocator, SlabConfig};
use cacheio::params::PAGE_SIZE;
use cacheio::IoContext;

pub fn init_tracing() {
    static INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
    once_cell::sync::Lazy::force(&INIT);
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Supplies real slab-backed page buffers for test pages. Keep the fixture
/// alive longer than every page built from it.
pub struct PageFixture {
    slab: SlabAllocator,
}

impl PageFixture {
    pub fn new(npages: usize) -> Self {
        let ctx = IoContext::new();
        let slab = SlabAllocator::new(
            SlabConfig {
                name: "test-pages".into(),
                obj_size: PAGE_SIZE,
                increase_size: npages * PAGE_SIZE,
                max_size: npages * PAGE_SIZE,
                node: None,
                zero_init: true,
                pinned: false,
                local_buf_size: 0,
            },
            &ctx,
        );
        Self { slab }
    }

    pub fn page(&self, offset: u64) -> Arc<CachePage> {
        let buf = self.slab.alloc().expect("fixture out of pages");
        Arc::new(CachePage::new(offset, buf))
    }
}

/// Every offset maps to the given disk.
pub struct SingleDiskMapper(pub u32);

impl FileMapper for SingleDiskMapper {
    fn map_to_disk(&self, _offset: u64) -> u32 {
        self.0
    }
}

/// Records completions with their discarded bit.
#[derive(Default)]
pub struct RecordingEndpoint {
    completed: Mutex<Vec<(u64, bool)>>,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completions(&self) -> Vec<(u64, bool)> {
        self.completed.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn discarded(&self) -> Vec<u64> {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| *d)
            .map(|(o, _)| *o)
            .collect()
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| !*d)
            .map(|(o, _)| *o)
            .collect()
    }
}

impl IoEndpoint for RecordingEndpoint {
    fn notify_completion(&self, requests: &mut [IoRequest]) {
        let mut completed = self.completed.lock().unwrap();
        for req in requests.iter() {
            completed.push((req.offset(), req.is_discarded()));
        }
    }
}

/// Observable state of the fake engine, shared with the test.
pub struct EngineProbe {
    depth: usize,
    fixed_slots: Mutex<Option<usize>>,
    hold_completions: AtomicBool,
    inflight: Mutex<VecDeque<IoRequest>>,
    log: Mutex<Vec<(Priority, u64)>>,
    low_inflight: AtomicUsize,
    max_low_inflight: AtomicUsize,
    flush_calls: AtomicUsize,
}

impl EngineProbe {
    pub fn submissions(&self) -> Vec<(Priority, u64)> {
        self.log.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn pending(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn max_low_inflight(&self) -> usize {
        self.max_low_inflight.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    /// Pin `available_slots` to a fixed value (None restores depth-based
    /// accounting).
    pub fn set_fixed_slots(&self, slots: Option<usize>) {
        *self.fixed_slots.lock().unwrap() = slots;
    }

    /// While held, `wait_for_complete` completes nothing, so submitted
    /// requests stay observable in flight.
    pub fn hold_completions(&self, hold: bool) {
        self.hold_completions.store(hold, Ordering::SeqCst);
    }
}

/// In-memory async engine: fixed depth, completions on demand. A completed
/// write-back cleans its page and releases the pin the request carried.
pub struct FakeEngine {
    probe: Arc<EngineProbe>,
}

impl FakeEngine {
    pub fn new(depth: usize) -> (Self, Arc<EngineProbe>) {
        let probe = Arc::new(EngineProbe {
            depth,
            fixed_slots: Mutex::new(None),
            hold_completions: AtomicBool::new(false),
            inflight: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            low_inflight: AtomicUsize::new(0),
            max_low_inflight: AtomicUsize::new(0),
            flush_calls: AtomicUsize::new(0),
        });
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl AsyncIo for FakeEngine {
    fn submit(&mut self, requests: Vec<IoRequest>) {
        for req in requests {
            self.probe
                .log
                .lock()
                .unwrap()
                .push((req.priority(), req.offset()));
            if req.priority() == Priority::Low {
                let now = self.probe.low_inflight.fetch_add(1, Ordering::SeqCst) + 1;
                self.probe.max_low_inflight.fetch_max(now, Ordering::SeqCst);
            }
            self.probe.inflight.lock().unwrap().push_back(req);
        }
    }

    fn wait_for_complete(&mut self, min: usize) {
        if self.probe.hold_completions.load(Ordering::SeqCst) {
            // Completions are frozen by the test; behave like a wait that
            // returned without progress.
            std::thread::sleep(Duration::from_millis(1));
            return;
        }
        for _ in 0..min.max(1) {
            let Some(mut req) = self.probe.inflight.lock().unwrap().pop_front() else {
                break;
            };
            if req.priority() == Priority::Low {
                self.probe.low_inflight.fetch_sub(1, Ordering::SeqCst);
            }
            if let Some(RequestOwner::Page(page)) = req.owner() {
                let page = Arc::clone(page);
                let mut state = page.lock();
                state.set_io_pending(false);
                state.set_dirty(false);
                drop(state);
                page.dec_ref();
            }
            let endpoint = Arc::clone(req.endpoint());
            endpoint.notify_completion(std::slice::from_mut(&mut req));
        }
    }

    fn available_slots(&self) -> usize {
        if let Some(slots) = *self.probe.fixed_slots.lock().unwrap() {
            return slots;
        }
        self.probe
            .depth
            .saturating_sub(self.probe.inflight.lock().unwrap().len())
    }

    fn pending_ios(&self) -> usize {
        self.probe.inflight.lock().unwrap().len()
    }

    fn flush_submissions(&mut self) {
        self.probe.flush_calls.fetch_add(1, Ordering::SeqCst);
    }
}

type SearchHook = Box<dyn FnMut(usize) + Send>;

/// Scriptable page cache: an offset map for `search`, a staged list of
/// flush candidates handed out on solicitation, and a hook that fires on
/// every `search` call.
pub struct FakeCache {
    weak: Weak<FakeCache>,
    pages: Mutex<HashMap<u64, Arc<CachePage>>>,
    staged: Mutex<Vec<(Arc<CachePage>, Arc<dyn IoEndpoint>)>>,
    handle: OnceLock<ServiceHandle>,
    search_hook: Mutex<Option<SearchHook>>,
    search_count: AtomicUsize,
    msg_cap: AtomicUsize,
}

impl FakeCache {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            pages: Mutex::new(HashMap::new()),
            staged: Mutex::new(Vec::new()),
            handle: OnceLock::new(),
            search_hook: Mutex::new(None),
            search_count: AtomicUsize::new(0),
            msg_cap: AtomicUsize::new(cacheio::params::IO_MSG_SIZE),
        })
    }

    /// Requests packed per low-priority message (defaults to IO_MSG_SIZE).
    pub fn set_msg_cap(&self, cap: usize) {
        self.msg_cap.store(cap, Ordering::SeqCst);
    }

    pub fn attach(&self, handle: ServiceHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn insert(&self, page: Arc<CachePage>) {
        self.pages.lock().unwrap().insert(page.offset(), page);
    }

    pub fn evict(&self, offset: u64) {
        self.pages.lock().unwrap().remove(&offset);
    }

    /// Mark pages dirty + prepare-writeback (what the flush scanner does)
    /// and queue them for the next `flush_dirty_pages` call.
    pub fn stage_flush(&self, pages: Vec<Arc<CachePage>>, endpoint: Arc<dyn IoEndpoint>) {
        let mut staged = self.staged.lock().unwrap();
        for page in pages {
            {
                let mut state = page.lock();
                state.set_dirty(true);
                state.set_prepare_writeback(true);
            }
            staged.push((page, Arc::clone(&endpoint)));
        }
    }

    pub fn set_search_hook(&self, hook: SearchHook) {
        *self.search_hook.lock().unwrap() = Some(hook);
    }

    pub fn search_count(&self) -> usize {
        self.search_count.load(Ordering::SeqCst)
    }
}

impl PageCache for FakeCache {
    fn search(&self, offset: u64) -> Option<Arc<CachePage>> {
        let count = self.search_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.search_hook.lock().unwrap().as_mut() {
            hook(count);
        }
        let page = self.pages.lock().unwrap().get(&offset).cloned()?;
        page.inc_ref();
        Some(page)
    }

    fn flush_dirty_pages(&self, filter: &DirtyPageFilter, budget: usize) -> usize {
        let Some(handle) = self.handle.get() else {
            return 0;
        };
        let batch: Vec<(Arc<CachePage>, Arc<dyn IoEndpoint>)> = {
            let mut staged = self.staged.lock().unwrap();
            let take = budget.min(staged.len());
            staged.drain(..take).collect()
        };
        let me: Arc<dyn PageCache> = self.weak.upgrade().expect("cache alive");
        let cap = self.msg_cap.load(Ordering::SeqCst);

        let mut enqueued = 0;
        let mut msg = Message::with_capacity(cap);
        for (page, endpoint) in batch {
            if !filter.accepts(&page) {
                continue;
            }
            let req = IoRequest::new_write_back(page, Arc::clone(&me), endpoint);
            if let Err(rejected) = msg.add(req) {
                let _ = handle.submit_low_prio(msg);
                msg = Message::with_capacity(cap);
                msg.add(rejected).expect("fresh message accepts a request");
            }
            enqueued += 1;
        }
        if msg.has_next() {
            let _ = handle.submit_low_prio(msg);
        }
        enqueued
    }

    fn shrink(&self, _n: usize, _out: &mut Vec<cacheio::cache::PageBuf>) -> bool {
        false
    }

    fn size(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}
