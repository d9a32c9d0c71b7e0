//! Volume Page Cache
//!
//! Fixed-capacity cache of decoded volume pages with a bounded queue of
//! asynchronous reads.
//!
//! ## Page States
//! ```text
//! EMPTY ──enqueue──▶ READ_QUEUED ──read done──▶ VALID
//!   ▲                    │                        │
//!   └───── invalidate ───┴────── invalidate ──────┘
//! ```
//!
//! ## Concurrency:
//! - One mutex guards slot, location and queue bookkeeping; I/O happens
//!   outside it
//! - Each zone publishes the page it is searching in a lock-free counter
//!   (odd = search pending); a page is never evicted while a search on it is
//!   pending
//! - Pages are handed out as `Arc<CachedPage>`, so eviction never frees a
//!   page a caller still holds
//! - Only zone 0 refreshes LRU recency on hits

mod reader;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::chapter_index::ChapterIndexPage;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::record_page::RecordPage;
use crate::request::{Request, RequestRestart};
use crate::storage::BlockStorage;

const COUNTER_MASK: u64 = 0xffff_ffff;

/// A decoded volume page
#[derive(Debug)]
pub enum CachedPage {
    Index(ChapterIndexPage),
    Record(RecordPage),
}

impl CachedPage {
    /// Decode the image of physical page `physical_page`
    pub fn decode(geometry: &Geometry, physical_page: u32, bytes: &[u8]) -> Result<Self> {
        let (_, page) = geometry.chapter_and_page(physical_page).ok_or_else(|| {
            IndexError::invalid(format!("page {} is not a chapter page", physical_page))
        })?;
        if geometry.is_index_page(page) {
            Ok(CachedPage::Index(ChapterIndexPage::parse(geometry, bytes)?))
        } else {
            Ok(CachedPage::Record(RecordPage::parse(geometry, bytes)?))
        }
    }

    pub fn as_index(&self) -> Option<&ChapterIndexPage> {
        match self {
            CachedPage::Index(page) => Some(page),
            CachedPage::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordPage> {
        match self {
            CachedPage::Record(page) => Some(page),
            CachedPage::Index(_) => None,
        }
    }
}

/// Result of a protected page lookup
#[derive(Debug, Clone)]
pub enum PageLookup {
    Hit(Arc<CachedPage>),
    /// A read was queued; the request will be restarted
    Queued,
    /// The read queue is full
    QueueFull,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Reads added to the queue
    pub queued_reads: u64,
    /// Requests that joined a read already queued for their page
    pub coalesced: u64,
    pub queue_full: u64,
    /// Page reads issued to storage
    pub reads: u64,
    pub read_failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Empty,
    Queued(u64),
    Cached(usize),
}

struct Slot {
    page: u32,
    data: Arc<CachedPage>,
    last_used: u64,
}

struct QueuedRead {
    seq: u64,
    page: u32,
    waiters: Vec<Request>,
    /// The page was invalidated while queued; its data is discarded
    invalid: bool,
    /// A reader thread has taken this read
    reserved: bool,
}

struct CacheState {
    slots: Vec<Option<Slot>>,
    locations: Vec<Location>,
    queue: VecDeque<QueuedRead>,
    next_seq: u64,
    shutdown: bool,
    stats: CacheStats,
}

impl CacheState {
    fn queued_mut(&mut self, seq: u64) -> Option<&mut QueuedRead> {
        self.queue.iter_mut().find(|read| read.seq == seq)
    }
}

/// The volume page cache
pub struct PageCache {
    geometry: Geometry,
    storage: Arc<dyn BlockStorage>,
    queue_capacity: usize,
    state: Mutex<CacheState>,
    /// Signalled when reads are queued or on shutdown
    read_ready: Condvar,
    clock: AtomicU64,
    /// Per zone: (page << 32) | counter, odd counter = search pending
    search_pending: Vec<AtomicU64>,
    restarts: Vec<Sender<RequestRestart>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl PageCache {
    /// Create a cache of `capacity` pages
    ///
    /// `restarts` holds one channel per zone; restarted requests are sent to
    /// the channel of their zone.
    pub fn new(
        geometry: &Geometry,
        storage: Arc<dyn BlockStorage>,
        capacity: usize,
        queue_capacity: usize,
        restarts: Vec<Sender<RequestRestart>>,
    ) -> Self {
        let zones = restarts.len();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity.max(1), || None);
        Self {
            geometry: *geometry,
            storage,
            queue_capacity,
            state: Mutex::new(CacheState {
                slots,
                locations: vec![Location::Empty; geometry.total_pages() as usize],
                queue: VecDeque::new(),
                next_seq: 0,
                shutdown: false,
                stats: CacheStats::default(),
            }),
            read_ready: Condvar::new(),
            clock: AtomicU64::new(0),
            search_pending: (0..zones.max(1)).map(|_| AtomicU64::new(0)).collect(),
            restarts,
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Start `count` reader threads
    pub fn start_readers(self: &Arc<Self>, count: usize) -> Result<()> {
        let mut readers = self.readers.lock();
        for i in 0..count {
            let cache = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("page-reader-{}", i))
                .spawn(move || cache.reader_loop())?;
            readers.push(handle);
        }
        info!(threads = count, "page cache readers started");
        Ok(())
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if self.geometry.chapter_and_page(page).is_none() {
            return Err(IndexError::invalid(format!(
                "page {} out of range for {} pages",
                page,
                self.geometry.total_pages()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Pending Searches
    // =========================================================================

    /// Announce that `zone` is about to use `page`
    pub fn begin_pending_search(&self, page: u32, zone: u32) {
        let counter = &self.search_pending[zone as usize];
        let value = counter.load(Ordering::Acquire);
        debug_assert!(value & 1 == 0, "zone {} already has a pending search", zone);
        let next = (u64::from(page) << 32) | ((value + 1) & COUNTER_MASK);
        counter.store(next, Ordering::SeqCst);
    }

    /// Announce that `zone` no longer uses `page`
    pub fn end_pending_search(&self, page: u32, zone: u32) {
        let counter = &self.search_pending[zone as usize];
        let value = counter.load(Ordering::Acquire);
        debug_assert!(
            Self::is_pending(value, page),
            "zone {} has no pending search on page {}",
            zone,
            page
        );
        let next = (value & !COUNTER_MASK) | ((value + 1) & COUNTER_MASK);
        counter.store(next, Ordering::SeqCst);
    }

    fn is_pending(value: u64, page: u32) -> bool {
        value & 1 == 1 && (value >> 32) as u32 == page
    }

    fn search_pending_on(&self, page: u32) -> bool {
        self.search_pending
            .iter()
            .any(|counter| Self::is_pending(counter.load(Ordering::SeqCst), page))
    }

    /// Wait until no zone that was searching `page` still is
    fn wait_for_searches(&self, page: u32) {
        for counter in &self.search_pending {
            let initial = counter.load(Ordering::SeqCst);
            if Self::is_pending(initial, page) {
                while counter.load(Ordering::SeqCst) == initial {
                    thread::yield_now();
                }
            }
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Find a page for a request whose zone has a pending search on it
    ///
    /// Never blocks on I/O. On a miss the request is queued behind a read of
    /// the page, or turned away when the queue is full.
    pub fn get_page_protected(&self, request: &Request, page: u32) -> Result<PageLookup> {
        self.check_page(page)?;
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(IndexError::Shutdown);
        }
        if let Location::Cached(slot) = state.locations[page as usize] {
            state.stats.hits += 1;
            let zone0 = request.zone == 0;
            let tick = if zone0 { self.clock.fetch_add(1, Ordering::Relaxed) } else { 0 };
            if let Some(entry) = state.slots[slot].as_mut() {
                if zone0 {
                    entry.last_used = tick;
                }
                return Ok(PageLookup::Hit(Arc::clone(&entry.data)));
            }
        }
        state.stats.misses += 1;
        if self.enqueue_locked(&mut state, request, page) {
            Ok(PageLookup::Queued)
        } else {
            Ok(PageLookup::QueueFull)
        }
    }

    /// Queue `request` behind a read of `page`; false when the queue is full
    pub fn enqueue_read(&self, request: &Request, page: u32) -> Result<bool> {
        self.check_page(page)?;
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(IndexError::Shutdown);
        }
        Ok(self.enqueue_locked(&mut state, request, page))
    }

    fn enqueue_locked(&self, state: &mut CacheState, request: &Request, page: u32) -> bool {
        if let Location::Queued(seq) = state.locations[page as usize] {
            if let Some(read) = state.queued_mut(seq) {
                read.waiters.push(request.clone());
                state.stats.coalesced += 1;
                return true;
            }
        }
        if state.queue.len() >= self.queue_capacity {
            state.stats.queue_full += 1;
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(QueuedRead {
            seq,
            page,
            waiters: vec![request.clone()],
            invalid: false,
            reserved: false,
        });
        state.locations[page as usize] = Location::Queued(seq);
        state.stats.queued_reads += 1;
        self.read_ready.notify_one();
        true
    }

    /// Read a page synchronously; for callers holding the read path lock
    pub fn get_page_locked(&self, page: u32) -> Result<Arc<CachedPage>> {
        self.check_page(page)?;
        {
            let mut state = self.state.lock();
            if let Location::Cached(slot) = state.locations[page as usize] {
                state.stats.hits += 1;
                let tick = self.clock.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = state.slots[slot].as_mut() {
                    entry.last_used = tick;
                    return Ok(Arc::clone(&entry.data));
                }
            }
            state.stats.misses += 1;
            state.stats.reads += 1;
        }

        let data = match self.read_page(page) {
            Ok(data) => Arc::new(data),
            Err(err) => {
                self.state.lock().stats.read_failures += 1;
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        if state.locations[page as usize] == Location::Empty {
            if let Some((slot, victim)) = self.pick_victim(&state) {
                let busy = victim.map(|v| self.search_pending_on(v)).unwrap_or(false);
                if !busy {
                    self.install(&mut state, slot, page, Arc::clone(&data));
                }
            }
        }
        Ok(data)
    }

    /// Read and decode one page from storage
    fn read_page(&self, page: u32) -> Result<CachedPage> {
        let bytes = self.storage.read_blocks(u64::from(page), 1)?;
        CachedPage::decode(&self.geometry, page, &bytes)
    }

    /// Least recently used slot, with the page it holds if any
    fn pick_victim(&self, state: &CacheState) -> Option<(usize, Option<u32>)> {
        if let Some(free) = state.slots.iter().position(Option::is_none) {
            return Some((free, None));
        }
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (i, s)))
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, s)| (i, Some(s.page)))
    }

    fn install(&self, state: &mut CacheState, slot: usize, page: u32, data: Arc<CachedPage>) {
        if let Some(old) = state.slots[slot].take() {
            state.locations[old.page as usize] = Location::Empty;
            state.stats.evictions += 1;
        }
        state.slots[slot] = Some(Slot {
            page,
            data,
            last_used: self.clock.fetch_add(1, Ordering::Relaxed),
        });
        state.locations[page as usize] = Location::Cached(slot);
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop a page whose chapter is being overwritten
    ///
    /// No zone may have a pending search on the page.
    pub fn invalidate_page(&self, page: u32) -> Result<()> {
        self.check_page(page)?;
        debug_assert!(
            !self.search_pending_on(page),
            "invalidating page {} with a search pending",
            page
        );
        self.wait_for_searches(page);

        let mut state = self.state.lock();
        match state.locations[page as usize] {
            Location::Empty => return Ok(()),
            Location::Cached(slot) => {
                state.slots[slot] = None;
            }
            Location::Queued(seq) => {
                if let Some(read) = state.queued_mut(seq) {
                    read.invalid = true;
                }
            }
        }
        state.locations[page as usize] = Location::Empty;
        state.stats.invalidations += 1;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Reads queued or in flight
    pub fn queued_reads(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when `page` is cached and valid
    pub fn contains(&self, page: u32) -> bool {
        let state = self.state.lock();
        state
            .locations
            .get(page as usize)
            .is_some_and(|l| matches!(l, Location::Cached(_)))
    }

    /// Stop the readers and fail every request still waiting on a read
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.read_ready.notify_all();

        let readers: Vec<JoinHandle<()>> = self.readers.lock().drain(..).collect();
        for handle in readers {
            if handle.join().is_err() {
                debug!("page reader thread panicked");
            }
        }

        let abandoned: Vec<QueuedRead> = {
            let mut state = self.state.lock();
            let queue: Vec<QueuedRead> = state.queue.drain(..).collect();
            for read in &queue {
                state.locations[read.page as usize] = Location::Empty;
            }
            queue
        };
        for read in abandoned {
            for request in read.waiters {
                self.restart(request, Err(IndexError::Shutdown));
            }
        }
        info!("page cache shut down");
    }

    fn restart(&self, request: Request, status: Result<()>) {
        let zone = request.zone as usize;
        if let Some(sender) = self.restarts.get(zone) {
            if sender.send(RequestRestart { request, status }).is_err() {
                debug!(zone, "restart channel closed, dropping request");
            }
        }
    }
}
