//! Engine Module
//!
//! The request surface of the index.
//!
//! ## Responsibilities
//! - Route each request through the open chapter, the volume index and the
//!   closed chapters of its zone
//! - Search sparse chapters that a hook name led to for names the volume
//!   index no longer holds
//! - Close the open chapter when any zone fills its share
//! - Save and load the whole index through its block layout
//! - Aggregate statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cache::{CacheStats, PageCache};
use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::layout::{IndexLayout, IndexState};
use crate::name::{RecordData, RecordName};
use crate::open_chapter::{load_open_chapter, save_open_chapter, OpenChapterZone};
use crate::request::{Outcome, Request, RequestKind, RequestRestart, Response};
use crate::sparse_cache::SparseCache;
use crate::storage::{BlockStorage, FileStorage, RegionReader, RegionWriter};
use crate::volume::{ChapterSearch, Volume};
use crate::volume_index::{PutOutcome, VolumeIndex, VolumeIndexConfig, VolumeIndexStats};

/// Pause before resubmitting a request turned away by a full read queue
const BUSY_BACKOFF: Duration = Duration::from_micros(200);

/// Per-zone request state
struct IndexZone {
    open_chapter: OpenChapterZone,
}

/// Request counters
#[derive(Debug, Default)]
struct RequestCounters {
    queries: AtomicU64,
    posts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    found: AtomicU64,
    found_in_open_chapter: AtomicU64,
    found_in_sparse_chapter: AtomicU64,
    busy: AtomicU64,
}

/// Snapshot of index statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub volume_index: VolumeIndexStats,
    pub cache: CacheStats,
    /// Virtual chapter currently open
    pub open_chapter: u64,
    /// Oldest chapter still in the volume
    pub oldest_chapter: u64,
    pub open_chapter_records: u64,
    pub queries: u64,
    pub posts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub found: u64,
    pub found_in_open_chapter: u64,
    /// Names found by searching a sparse chapter a hook pointed at
    pub found_in_sparse_chapter: u64,
    /// Sparse chapters currently searched for names outside the hook set
    pub sparse_cached_chapters: u64,
    pub busy: u64,
}

/// The deduplication index
///
/// ## Concurrency Model: one worker per zone
///
/// - Each zone's requests are executed by one thread at a time, serialized
///   by the zone's mutex
/// - Closing a chapter locks every zone in order, so no request of any zone
///   is mid-flight while the chapter is written
/// - Requests that need an uncached page are parked on the page cache and
///   come back on their zone's restart channel
pub struct Engine {
    config: Config,
    geometry: Geometry,
    layout: IndexLayout,
    storage: Arc<dyn BlockStorage>,
    volume_index: VolumeIndex,
    volume: Volume,
    sparse_cache: SparseCache,
    zones: Vec<Mutex<IndexZone>>,
    restarts: Vec<Receiver<RequestRestart>>,
    open_chapter: AtomicU64,
    oldest_chapter: AtomicU64,
    counters: RequestCounters,
    shutdown: AtomicBool,
}

impl Engine {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a new, empty index in the file at `config.data_path`
    pub fn create(config: Config) -> Result<Self> {
        let storage = Self::open_file(&config)?;
        Self::create_with_storage(config, storage)
    }

    /// Create a new, empty index on `storage`
    pub fn create_with_storage(config: Config, storage: Arc<dyn BlockStorage>) -> Result<Self> {
        let engine = Self::build(config, storage)?;
        engine.volume.format()?;
        info!(
            zones = engine.zones.len(),
            chapters = engine.geometry.chapters_per_volume,
            records_per_chapter = engine.geometry.records_per_chapter,
            "index created"
        );
        Ok(engine)
    }

    /// Load a saved index from the file at `config.data_path`
    pub fn open(config: Config) -> Result<Self> {
        let storage = Self::open_file(&config)?;
        Self::load_with_storage(config, storage)
    }

    /// Load a saved index from `storage`
    ///
    /// The zone count may differ from the one the index was saved with.
    ///
    /// On load:
    /// 1. Check the volume header against the configured geometry
    /// 2. Read the state block
    /// 3. Restore the page map
    /// 4. Restore the volume index from every saved zone stream
    /// 5. Redistribute the open chapter records over the current zones
    pub fn load_with_storage(config: Config, storage: Arc<dyn BlockStorage>) -> Result<Self> {
        let engine = Self::build(config, storage)?;

        // Step 1: The volume must have been formatted with this geometry
        engine.volume.check_header()?;

        // Step 2: The state block says where everything else is
        let state = engine.layout.read_state(engine.storage.as_ref())?;
        if state.geometry != engine.geometry || state.nonce != engine.config.nonce {
            return Err(IndexError::format("saved index belongs to a different index"));
        }

        // Step 3: Page map
        let page_map = engine.layout.page_map;
        engine.volume.load_page_map(&mut RegionReader::new(
            engine.storage.as_ref(),
            page_map.start,
            page_map.blocks,
        ))?;

        // Step 4: Volume index, from however many zones saved it
        let mut readers: Vec<RegionReader<'_>> = state
            .streams
            .iter()
            .map(|r| RegionReader::new(engine.storage.as_ref(), r.start, r.blocks))
            .collect();
        engine.volume_index.load(&mut readers)?;
        drop(readers);
        engine.volume_index.set_open_chapter(state.newest_chapter)?;

        // Step 5: Open chapter records, redistributed over the current zones
        let region = engine.layout.open_chapter;
        let (chapter, records) = load_open_chapter(&mut RegionReader::new(
            engine.storage.as_ref(),
            region.start,
            region.blocks,
        ))?;
        if chapter != state.newest_chapter {
            return Err(IndexError::format(format!(
                "open chapter {} saved with state for chapter {}",
                chapter, state.newest_chapter
            )));
        }
        let mut any_full = false;
        for (name, data) in records {
            let zone = engine.volume_index.zone_for_name(&name) as usize;
            let mut guard = engine.zones[zone].lock();
            guard.open_chapter.put(name, data);
            any_full |= guard.open_chapter.is_full();
        }

        engine.open_chapter.store(state.newest_chapter, Ordering::SeqCst);
        engine.oldest_chapter.store(state.oldest_chapter, Ordering::SeqCst);
        info!(
            saved_zones = state.zone_count,
            zones = engine.zones.len(),
            open_chapter = state.newest_chapter,
            "index loaded"
        );

        // A redistributed zone may already be over its share
        if any_full {
            engine.close_chapter(state.newest_chapter)?;
        }
        Ok(engine)
    }

    fn open_file(config: &Config) -> Result<Arc<dyn BlockStorage>> {
        let geometry = config.validate()?;
        let layout = IndexLayout::new(&VolumeIndexConfig::from_config(config, geometry));
        Ok(Arc::new(FileStorage::open(&config.data_path, layout.total_blocks())?))
    }

    fn build(config: Config, storage: Arc<dyn BlockStorage>) -> Result<Self> {
        let geometry = config.validate()?;
        let index_config = VolumeIndexConfig::from_config(&config, geometry);
        let layout = IndexLayout::new(&index_config);
        if storage.block_count() < layout.total_blocks() {
            return Err(IndexError::Config(format!(
                "storage holds {} blocks, the index needs {}",
                storage.block_count(),
                layout.total_blocks()
            )));
        }

        let volume_index = VolumeIndex::new(&index_config)?;
        let (senders, restarts): (Vec<_>, Vec<_>) =
            (0..config.zone_count).map(|_| unbounded()).unzip();
        let cache_pages = config.cache_chapters as usize * geometry.pages_per_chapter as usize;
        let cache = Arc::new(PageCache::new(
            &geometry,
            Arc::clone(&storage),
            cache_pages,
            config.read_queue_capacity,
            senders,
        ));
        cache.start_readers(config.read_threads)?;
        let volume = Volume::new(&geometry, Arc::clone(&storage), cache);
        let sparse_cache = SparseCache::new(config.cache_chapters as usize);

        let zones = (0..config.zone_count)
            .map(|zone| {
                Mutex::new(IndexZone {
                    open_chapter: OpenChapterZone::new(zone_share(&geometry, config.zone_count, zone)),
                })
            })
            .collect();

        Ok(Self {
            config,
            geometry,
            layout,
            storage,
            volume_index,
            volume,
            sparse_cache,
            zones,
            restarts,
            open_chapter: AtomicU64::new(0),
            oldest_chapter: AtomicU64::new(0),
            counters: RequestCounters::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Stop the reader threads; parked requests are restarted with an error
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.volume.cache().shutdown();
            info!("index shut down");
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Zone that must execute requests for `name`
    pub fn zone_for_name(&self, name: &RecordName) -> u32 {
        self.volume_index.zone_for_name(name)
    }

    /// Build a request already routed to its zone
    pub fn request(&self, id: u64, name: RecordName, kind: RequestKind) -> Request {
        Request::new(id, name, self.zone_for_name(&name), kind)
    }

    /// Restarted requests of `zone`
    pub fn restarts(&self, zone: u32) -> Result<&Receiver<RequestRestart>> {
        self.restarts
            .get(zone as usize)
            .ok_or_else(|| IndexError::invalid(format!("zone {} out of range", zone)))
    }

    /// Execute a request without blocking on I/O
    pub fn execute(&self, request: &Request) -> Result<Outcome> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(IndexError::Shutdown);
        }
        let zone_id = request.zone;
        let owner = self.volume_index.zone_for_name(&request.name);
        if zone_id != owner {
            return Err(IndexError::invalid(format!(
                "request for zone {} sent to zone {}",
                owner, zone_id
            )));
        }

        let mut zone = self.zones[zone_id as usize].lock();
        let open = self.open_chapter.load(Ordering::SeqCst);
        self.note_sparse_hook(&request.name, open)?;

        if let Some(old) = zone.open_chapter.search(&request.name) {
            return self.execute_in_open_chapter(&mut zone, request, open, old);
        }

        let mut indexed = true;
        let mut found = match self.search_closed_chapters(request, open)? {
            Ok(found) => found,
            Err(outcome) => return Ok(outcome),
        };
        if found.is_none() && !self.volume_index.is_sample(&request.name) {
            found = match self.search_sparse_chapters(request, open)? {
                Ok(found) => found,
                Err(outcome) => return Ok(outcome),
            };
            indexed = false;
            if found.is_some() {
                self.counters.found_in_sparse_chapter.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Only a name found through its own volume index entry may move it
        let verified = found.is_some() && indexed;
        let response = Response {
            found: found.is_some(),
            virtual_chapter: found.map(|(chapter, _)| chapter),
            old_metadata: found.map(|(_, data)| data),
        };
        self.count(request.kind, response.found, false);

        match request.kind {
            RequestKind::Query => {}
            RequestKind::Post => {
                let data = found.map(|(_, data)| data).unwrap_or(request.new_metadata);
                self.store_in_open_chapter(zone_id, &mut zone, &request.name, data, verified, open)?;
            }
            RequestKind::Update => {
                self.store_in_open_chapter(
                    zone_id,
                    &mut zone,
                    &request.name,
                    request.new_metadata,
                    verified,
                    open,
                )?;
            }
            RequestKind::Delete => {
                if verified {
                    self.volume_index.remove_record(zone_id, &request.name)?;
                }
            }
        }

        let full = zone.open_chapter.is_full();
        drop(zone);
        if full {
            self.close_chapter(open)?;
        }
        Ok(Outcome::Completed(response))
    }

    /// Execute a request, waiting for page reads and retrying while busy
    ///
    /// Must be the only caller for the request's zone while it runs, since it
    /// consumes that zone's restart channel.
    pub fn execute_sync(&self, request: &Request) -> Result<Response> {
        let restarts = self.restarts(request.zone)?;
        loop {
            match self.execute(request)? {
                Outcome::Completed(response) => return Ok(response),
                Outcome::Queued => {
                    let restart = restarts.recv().map_err(|_| IndexError::Shutdown)?;
                    restart.status?;
                }
                Outcome::Busy => thread::sleep(BUSY_BACKOFF),
            }
        }
    }

    fn execute_in_open_chapter(
        &self,
        zone: &mut MutexGuard<'_, IndexZone>,
        request: &Request,
        open: u64,
        old: RecordData,
    ) -> Result<Outcome> {
        self.count(request.kind, true, true);
        match request.kind {
            RequestKind::Query | RequestKind::Post => {}
            RequestKind::Update => {
                zone.open_chapter.put(request.name, request.new_metadata);
            }
            RequestKind::Delete => {
                zone.open_chapter.remove(&request.name);
                self.volume_index.remove_record(request.zone, &request.name)?;
            }
        }
        Ok(Outcome::Completed(Response {
            found: true,
            virtual_chapter: Some(open),
            old_metadata: Some(old),
        }))
    }

    /// Look for the name in the closed chapter its volume index entry names
    ///
    /// The outer error is a failure; the inner `Err` is an outcome that ends
    /// the request for now (queued or busy).
    fn search_closed_chapters(
        &self,
        request: &Request,
        open: u64,
    ) -> Result<std::result::Result<Option<(u64, RecordData)>, Outcome>> {
        let record = self.volume_index.get_record(request.zone, &request.name)?;
        if !record.is_found || record.virtual_chapter >= open {
            return Ok(Ok(None));
        }
        let chapter = record.virtual_chapter;
        let readable = self
            .volume
            .ring()
            .closed_window(open)
            .is_some_and(|window| window.contains(chapter));
        if !readable {
            return Ok(Ok(None));
        }

        self.search_chapter(request, chapter)
    }

    /// Search one closed chapter, synchronously when there are no readers
    fn search_chapter(
        &self,
        request: &Request,
        chapter: u64,
    ) -> Result<std::result::Result<Option<(u64, RecordData)>, Outcome>> {
        let search = if self.config.read_threads == 0 {
            match self.volume.search_locked(&request.name, chapter)? {
                Some(data) => ChapterSearch::Found(data),
                None => ChapterSearch::NotFound,
            }
        } else {
            self.volume.search_page_cache(request, chapter)?
        };
        Ok(match search {
            ChapterSearch::Found(data) => Ok(Some((chapter, data))),
            ChapterSearch::NotFound => Ok(None),
            ChapterSearch::Queued => Err(Outcome::Queued),
            ChapterSearch::QueueFull => {
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                Err(Outcome::Busy)
            }
        })
    }

    // =========================================================================
    // Sparse Chapters
    // =========================================================================

    /// True when `chapter` is closed, still in the volume and past the dense window
    fn is_sparse_chapter(&self, chapter: u64, open: u64) -> bool {
        self.geometry.is_sparse()
            && chapter + u64::from(self.geometry.dense_chapters_per_volume) <= open
            && self
                .volume
                .ring()
                .closed_window(open)
                .is_some_and(|window| window.contains(chapter))
    }

    /// Remember the sparse chapter a hook name points at
    fn note_sparse_hook(&self, name: &RecordName, open: u64) -> Result<()> {
        if !self.volume_index.is_sample(name) {
            return Ok(());
        }
        if let Some(chapter) = self.volume_index.lookup_name(name)? {
            if self.is_sparse_chapter(chapter, open) && self.sparse_cache.note(chapter) {
                debug!(chapter, open_chapter = open, "sparse chapter cached");
            }
        }
        Ok(())
    }

    /// Search the cached sparse chapters for a name the volume index missed
    fn search_sparse_chapters(
        &self,
        request: &Request,
        open: u64,
    ) -> Result<std::result::Result<Option<(u64, RecordData)>, Outcome>> {
        for chapter in self.sparse_cache.chapters() {
            if !self.is_sparse_chapter(chapter, open) {
                continue;
            }
            match self.search_chapter(request, chapter)? {
                Ok(None) => {}
                done => return Ok(done),
            }
        }
        Ok(Ok(None))
    }

    /// Put a record in the open chapter and point its index entry there
    fn store_in_open_chapter(
        &self,
        zone_id: u32,
        zone: &mut MutexGuard<'_, IndexZone>,
        name: &RecordName,
        data: RecordData,
        verified: bool,
        open: u64,
    ) -> Result<()> {
        zone.open_chapter.put(*name, data);
        if verified {
            return self.volume_index.set_record_chapter(zone_id, name, open);
        }
        if self.volume_index.put_record(zone_id, name, open)? == PutOutcome::Overflow {
            // Still found while the open chapter holds it
            debug!(zone = zone_id, chapter = open, "name kept out of the volume index");
        }
        Ok(())
    }

    fn count(&self, kind: RequestKind, found: bool, in_open_chapter: bool) {
        let counter = match kind {
            RequestKind::Query => &self.counters.queries,
            RequestKind::Post => &self.counters.posts,
            RequestKind::Update => &self.counters.updates,
            RequestKind::Delete => &self.counters.deletes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if found {
            self.counters.found.fetch_add(1, Ordering::Relaxed);
        }
        if in_open_chapter {
            self.counters.found_in_open_chapter.fetch_add(1, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // Chapter Rotation
    // =========================================================================

    fn lock_all_zones(&self) -> Vec<MutexGuard<'_, IndexZone>> {
        self.zones.iter().map(|zone| zone.lock()).collect()
    }

    /// Close the open chapter if it is still `expected`
    fn close_chapter(&self, expected: u64) -> Result<()> {
        let mut zones = self.lock_all_zones();
        let open = self.open_chapter.load(Ordering::SeqCst);
        if open != expected {
            return Ok(());
        }
        let records: Vec<_> = zones
            .iter_mut()
            .flat_map(|zone| zone.open_chapter.drain())
            .collect();
        let count = records.len();
        self.volume.write_chapter(open, records)?;

        let next = open + 1;
        self.volume_index.set_open_chapter(next)?;
        self.open_chapter.store(next, Ordering::SeqCst);
        let oldest = next.saturating_sub(u64::from(self.geometry.chapters_per_volume));
        self.oldest_chapter.store(oldest, Ordering::SeqCst);
        self.sparse_cache.expire(oldest);
        debug!(chapter = open, records = count, oldest, "chapter closed");
        Ok(())
    }

    /// Close the open chapter now, even if it is not full
    pub fn flush_open_chapter(&self) -> Result<()> {
        self.close_chapter(self.open_chapter.load(Ordering::SeqCst))
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Save the index so it can be loaded later, possibly with another zone count
    pub fn save(&self) -> Result<()> {
        let zones = self.lock_all_zones();
        let open = self.open_chapter.load(Ordering::SeqCst);
        let storage = self.storage.as_ref();

        let region = self.layout.page_map;
        let mut writer = RegionWriter::new(storage, region.start, region.blocks);
        self.volume.save_page_map(&mut writer)?;
        writer.finish()?;

        let region = self.layout.open_chapter;
        let mut writer = RegionWriter::new(storage, region.start, region.blocks);
        let open_zones: Vec<&OpenChapterZone> = zones.iter().map(|z| &z.open_chapter).collect();
        save_open_chapter(&mut writer, open, &open_zones)?;
        writer.finish()?;

        let streams = self.layout.stream_ranges(self.zones.len() as u32);
        let mut writers: Vec<RegionWriter<'_>> = streams
            .iter()
            .map(|r| RegionWriter::new(storage, r.start, r.blocks))
            .collect();
        self.volume_index.save(&mut writers)?;
        for writer in writers {
            writer.finish()?;
        }

        self.layout.write_state(
            storage,
            &IndexState {
                geometry: self.geometry,
                nonce: self.config.nonce,
                zone_count: self.zones.len() as u32,
                oldest_chapter: self.oldest_chapter.load(Ordering::SeqCst),
                newest_chapter: open,
                streams,
            },
        )?;
        self.volume.sync()?;
        info!(open_chapter = open, zones = self.zones.len(), "index saved");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Snapshot of every counter, taken with all zones held
    pub fn stats(&self) -> IndexStats {
        let zones = self.lock_all_zones();
        let open_chapter_records = zones
            .iter()
            .map(|zone| zone.open_chapter.len() as u64)
            .sum();
        let volume_index = self.volume_index.stats();
        drop(zones);

        let counters = &self.counters;
        IndexStats {
            volume_index,
            cache: self.volume.cache().stats(),
            open_chapter: self.open_chapter.load(Ordering::SeqCst),
            oldest_chapter: self.oldest_chapter.load(Ordering::SeqCst),
            open_chapter_records,
            queries: counters.queries.load(Ordering::Relaxed),
            posts: counters.posts.load(Ordering::Relaxed),
            updates: counters.updates.load(Ordering::Relaxed),
            deletes: counters.deletes.load(Ordering::Relaxed),
            found: counters.found.load(Ordering::Relaxed),
            found_in_open_chapter: counters.found_in_open_chapter.load(Ordering::Relaxed),
            found_in_sparse_chapter: counters.found_in_sparse_chapter.load(Ordering::Relaxed),
            sparse_cached_chapters: self.sparse_cache.len() as u64,
            busy: counters.busy.load(Ordering::Relaxed),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Blocks of storage an index with `config` needs
    pub fn required_blocks(config: &Config) -> Result<u64> {
        let geometry = config.validate()?;
        Ok(IndexLayout::new(&VolumeIndexConfig::from_config(config, geometry)).total_blocks())
    }
}

/// Open chapter records `zone` may hold; the shares add up to one chapter
fn zone_share(geometry: &Geometry, zone_count: u32, zone: u32) -> usize {
    let records = u64::from(geometry.records_per_chapter);
    let zones = u64::from(zone_count);
    let boundary = |zone: u64| zone * records / zones;
    (boundary(u64::from(zone) + 1) - boundary(u64::from(zone))) as usize
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
