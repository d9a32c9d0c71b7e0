//! Volume Module
//!
//! The on-disk ring of closed chapters.
//!
//! ## Responsibilities
//! - Format and check the volume header page
//! - Write closed chapters, invalidating the chapter they overwrite
//! - Search closed chapters through the page cache, or synchronously under
//!   the read path lock
//! - Own the index page map

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::{CachedPage, PageCache, PageLookup};
use crate::chapter::ChapterRing;
use crate::chapter_index::OpenChapterIndex;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::name::{RecordData, RecordName};
use crate::page_map::IndexPageMap;
use crate::record_page::{encode_record_page, Record};
use crate::request::Request;
use crate::storage::{BlockStorage, StreamCursor, BLOCK_SIZE};

const VOLUME_MAGIC: &[u8; 8] = b"DVOLUME1";

/// Result of searching a closed chapter without blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterSearch {
    Found(RecordData),
    NotFound,
    /// The request waits for a page read
    Queued,
    /// The read queue is full
    QueueFull,
}

/// Outcome of one protected page fetch
enum Fetched<T> {
    Done(T),
    Queued,
    QueueFull,
}

/// The chapter volume
pub struct Volume {
    geometry: Geometry,
    ring: ChapterRing,
    storage: Arc<dyn BlockStorage>,
    cache: Arc<PageCache>,
    page_map: RwLock<IndexPageMap>,
    /// Serializes synchronous searches
    read_lock: Mutex<()>,
}

impl Volume {
    pub fn new(geometry: &Geometry, storage: Arc<dyn BlockStorage>, cache: Arc<PageCache>) -> Self {
        Self {
            geometry: *geometry,
            ring: ChapterRing::new(geometry.chapters_per_volume),
            storage,
            cache,
            page_map: RwLock::new(IndexPageMap::new(geometry)),
            read_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn ring(&self) -> ChapterRing {
        self.ring
    }

    // =========================================================================
    // Header Page
    // =========================================================================

    /// Write the header page describing this volume's geometry
    pub fn format(&self) -> Result<()> {
        let geometry = bincode::serialize(&self.geometry)?;
        let mut page = Vec::with_capacity(BLOCK_SIZE);
        page.put_slice(VOLUME_MAGIC);
        page.put_u32_le(geometry.len() as u32);
        page.put_slice(&geometry);
        let crc = crc32fast::hash(&page);
        page.put_u32_le(crc);
        page.resize(BLOCK_SIZE, 0);
        self.storage.write_blocks(0, &page)?;
        self.storage.sync()
    }

    /// Verify the header page matches this volume's geometry
    pub fn check_header(&self) -> Result<()> {
        let page = self.storage.read_blocks(0, 1)?;
        let mut cursor = StreamCursor::new(&page, "volume header");
        if cursor.bytes(VOLUME_MAGIC.len())? != VOLUME_MAGIC {
            return Err(IndexError::format("bad volume header magic"));
        }
        let len = cursor.u32()? as usize;
        let encoded = cursor.bytes(len)?;
        let consumed = page.len() - cursor.remaining();
        if crc32fast::hash(&page[..consumed]) != cursor.u32()? {
            return Err(IndexError::format("volume header checksum mismatch"));
        }
        let saved: Geometry = bincode::deserialize(encoded)
            .map_err(|e| IndexError::format(format!("bad volume geometry: {}", e)))?;
        if saved != self.geometry {
            return Err(IndexError::format(format!(
                "volume geometry {:?} does not match {:?}",
                saved, self.geometry
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Writing Chapters
    // =========================================================================

    /// Drop every cached page of a physical chapter
    pub fn forget_chapter(&self, physical_chapter: u32) -> Result<()> {
        for page in 0..self.geometry.pages_per_chapter {
            self.cache
                .invalidate_page(self.geometry.physical_page(physical_chapter, page))?;
        }
        Ok(())
    }

    /// Seal `records` as `virtual_chapter`, overwriting its physical slot
    ///
    /// No zone may have a search pending on the overwritten chapter.
    pub fn write_chapter(&self, virtual_chapter: u64, mut records: Vec<Record>) -> Result<()> {
        let geometry = &self.geometry;
        if records.len() > geometry.records_per_chapter as usize {
            return Err(IndexError::invalid(format!(
                "{} records exceed a chapter of {}",
                records.len(),
                geometry.records_per_chapter
            )));
        }
        let physical = self.ring.physical(virtual_chapter);
        self.forget_chapter(physical)?;

        records.sort_by(|a, b| a.0.cmp(&b.0));
        let mut index = OpenChapterIndex::new(geometry, virtual_chapter);
        let per_page = geometry.records_per_page as usize;
        let mut record_pages = Vec::with_capacity(geometry.record_pages_per_chapter as usize);
        for page in 0..geometry.record_pages_per_chapter as usize {
            let start = (page * per_page).min(records.len());
            let end = (start + per_page).min(records.len());
            for (name, _) in &records[start..end] {
                index.put_record(name, page as u32)?;
            }
            record_pages.push(encode_record_page(geometry, &records[start..end]));
        }

        let index_pages = index.pack_pages();
        let mut image = Vec::with_capacity(geometry.pages_per_chapter as usize * BLOCK_SIZE);
        {
            let mut page_map = self.page_map.write();
            for (page, (bytes, highest)) in index_pages.iter().enumerate() {
                page_map.update(virtual_chapter, physical, page as u32, *highest)?;
                image.extend_from_slice(bytes);
            }
        }
        for page in &record_pages {
            image.extend_from_slice(page);
        }
        self.storage
            .write_blocks(u64::from(geometry.physical_page(physical, 0)), &image)?;

        debug!(
            chapter = virtual_chapter,
            physical,
            records = records.len(),
            lost = index.lost_records(),
            "chapter written"
        );
        Ok(())
    }

    // =========================================================================
    // Searching Chapters
    // =========================================================================

    /// Index page of `physical` that holds the name's list, as (page number, physical page)
    fn index_page_for(&self, name: &RecordName, physical: u32) -> Result<(u32, u32)> {
        let page = self.page_map.read().find_index_page_number(name, physical)?;
        Ok((page, self.geometry.physical_page(physical, page)))
    }

    fn record_page_for(&self, physical: u32, record_page: u32) -> u32 {
        self.geometry
            .physical_page(physical, self.geometry.index_pages_per_chapter + record_page)
    }

    fn search_index_page(
        &self,
        page: &CachedPage,
        name: &RecordName,
        virtual_chapter: u64,
        page_number: u32,
    ) -> Result<Option<u32>> {
        let index = page
            .as_index()
            .ok_or_else(|| IndexError::format("expected a chapter index page"))?;
        // The slot may hold a newer or older chapter than the one requested
        if index.virtual_chapter() != virtual_chapter {
            return Ok(None);
        }
        let physical = self.ring.physical(virtual_chapter);
        let (low, _) = self.page_map.read().list_number_bounds(physical, page_number)?;
        if index.first_list() != low {
            debug!(
                chapter = virtual_chapter,
                page = page_number,
                first_list = index.first_list(),
                expected = low,
                "index page disagrees with the page map"
            );
            return Ok(None);
        }
        index.search(&self.geometry, name)
    }

    fn search_record_page(page: &CachedPage, name: &RecordName) -> Result<Option<RecordData>> {
        let records = page
            .as_record()
            .ok_or_else(|| IndexError::format("expected a record page"))?;
        Ok(records.search(name))
    }

    /// Fetch `page` under a pending search and apply `search` to it
    fn fetch_protected<T>(
        &self,
        request: &Request,
        page: u32,
        search: impl FnOnce(&CachedPage) -> Result<T>,
    ) -> Result<Fetched<T>> {
        self.cache.begin_pending_search(page, request.zone);
        let result = match self.cache.get_page_protected(request, page) {
            Ok(PageLookup::Hit(data)) => search(&data).map(Fetched::Done),
            Ok(PageLookup::Queued) => Ok(Fetched::Queued),
            Ok(PageLookup::QueueFull) => Ok(Fetched::QueueFull),
            Err(err) => Err(err),
        };
        self.cache.end_pending_search(page, request.zone);
        result
    }

    /// Search a closed chapter for `request.name` without blocking on I/O
    pub fn search_page_cache(&self, request: &Request, virtual_chapter: u64) -> Result<ChapterSearch> {
        let name = &request.name;
        let physical = self.ring.physical(virtual_chapter);

        let (page_number, index_page) = self.index_page_for(name, physical)?;
        let record_page = match self.fetch_protected(request, index_page, |page| {
            self.search_index_page(page, name, virtual_chapter, page_number)
        })? {
            Fetched::Done(Some(record_page)) => record_page,
            Fetched::Done(None) => return Ok(ChapterSearch::NotFound),
            Fetched::Queued => return Ok(ChapterSearch::Queued),
            Fetched::QueueFull => return Ok(ChapterSearch::QueueFull),
        };

        let page = self.record_page_for(physical, record_page);
        Ok(
            match self.fetch_protected(request, page, |page| Self::search_record_page(page, name))? {
                Fetched::Done(Some(data)) => ChapterSearch::Found(data),
                Fetched::Done(None) => ChapterSearch::NotFound,
                Fetched::Queued => ChapterSearch::Queued,
                Fetched::QueueFull => ChapterSearch::QueueFull,
            },
        )
    }

    /// Search a closed chapter synchronously under the read path lock
    pub fn search_locked(&self, name: &RecordName, virtual_chapter: u64) -> Result<Option<RecordData>> {
        let _guard = self.read_lock.lock();
        let physical = self.ring.physical(virtual_chapter);

        let (page_number, index_page) = self.index_page_for(name, physical)?;
        let index_page = self.cache.get_page_locked(index_page)?;
        let Some(record_page) =
            self.search_index_page(&index_page, name, virtual_chapter, page_number)?
        else {
            return Ok(None);
        };
        let page = self
            .cache
            .get_page_locked(self.record_page_for(physical, record_page))?;
        Self::search_record_page(&page, name)
    }

    // =========================================================================
    // Page Map Persistence
    // =========================================================================

    pub fn page_map_last_update(&self) -> u64 {
        self.page_map.read().last_update()
    }

    pub fn save_page_map<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.page_map.read().write(writer)
    }

    pub fn load_page_map<R: Read>(&self, reader: &mut R) -> Result<()> {
        let map = IndexPageMap::read(&self.geometry, reader)?;
        *self.page_map.write() = map;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }
}
