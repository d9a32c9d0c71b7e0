//! Chapter index pages
//!
//! A closed chapter starts with index pages that map each record name to the
//! record page holding it. The chapter's names are bucketed into
//! `delta_lists_per_chapter` delta lists; each index page holds a contiguous
//! run of whole lists.
//!
//! ## Page Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ magic (4) │ virtual chapter (8) │ first list (4)            │
//! │ list count (2) │ reserved (2)                              │
//! ├────────────────────────────────────────────────────────────┤
//! │ directory: [bit length (2) │ code (1)] × list count        │
//! ├────────────────────────────────────────────────────────────┤
//! │ list data, each list starting on a byte boundary           │
//! └────────────────────────────────────────────────────────────┘
//! ```

use bytes::BufMut;
use tracing::warn;

use crate::delta::{search, DeltaCode, DeltaEntry, ListCode, ListCodec, OpenDeltaList};
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::name::RecordName;
use crate::storage::StreamCursor;

pub const INDEX_PAGE_MAGIC: u32 = 0x4449_5850;

/// Fixed header at the start of every index page
pub const PAGE_HEADER_SIZE: usize = 20;

/// Directory bytes per list: bit length and list code
pub const DIRECTORY_ENTRY_SIZE: usize = 3;

/// Number of index pages a chapter needs, with headroom for uneven lists
pub fn estimate_index_pages(
    bytes_per_page: usize,
    records_per_chapter: u32,
    delta_lists: u32,
    mean_delta: u32,
    address_bits: u32,
    payload_bits: u32,
) -> u32 {
    let code = DeltaCode::new(mean_delta);
    let general_bits = u64::from(payload_bits + code.estimated_bits());
    let octet_bits = 8 * u64::from(address_bits.div_ceil(8) + payload_bits.div_ceil(8));
    let entry_bits = general_bits.max(octet_bits);

    let lists = u64::from(delta_lists.max(1));
    // Directory entry plus alignment padding per list
    let list_overhead = lists * (DIRECTORY_ENTRY_SIZE as u64 * 8 + 8);
    let mut total = u64::from(records_per_chapter) * entry_bits + list_overhead;
    total += total / 10;

    // A list never straddles pages, so each page can waste about one list
    let page_bits = (bytes_per_page.saturating_sub(PAGE_HEADER_SIZE) * 8) as u64;
    let usable = page_bits.saturating_sub(total / lists).max(1);
    total.div_ceil(usable).max(1) as u32
}

fn chapter_codec(geometry: &Geometry) -> ListCodec {
    ListCodec::new(
        geometry.chapter_mean_delta,
        geometry.chapter_address_bits,
        geometry.chapter_payload_bits,
    )
}

// =============================================================================
// Open Chapter Index
// =============================================================================

/// Chapter index of a chapter being written
pub struct OpenChapterIndex {
    geometry: Geometry,
    codec: ListCodec,
    virtual_chapter: u64,
    lists: Vec<OpenDeltaList>,
    record_count: usize,
    lost_records: usize,
}

impl OpenChapterIndex {
    pub fn new(geometry: &Geometry, virtual_chapter: u64) -> Self {
        Self {
            geometry: *geometry,
            codec: chapter_codec(geometry),
            virtual_chapter,
            lists: vec![OpenDeltaList::new(); geometry.delta_lists_per_chapter as usize],
            record_count: 0,
            lost_records: 0,
        }
    }

    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Records dropped because the index pages could not hold them
    pub fn lost_records(&self) -> usize {
        self.lost_records
    }

    /// Note that `name` is stored on `record_page` of this chapter
    pub fn put_record(&mut self, name: &RecordName, record_page: u32) -> Result<()> {
        if record_page >= self.geometry.record_pages_per_chapter {
            return Err(IndexError::invalid(format!(
                "record page {} out of range for {} pages",
                record_page, self.geometry.record_pages_per_chapter
            )));
        }
        let list = name.chapter_delta_list(&self.geometry);
        let address = name.chapter_delta_address(&self.geometry);
        self.lists[list as usize].append(address, record_page, name);
        self.record_count += 1;
        Ok(())
    }

    fn list_bytes(&self, list: usize) -> usize {
        let entries = self.lists[list].entries();
        let code = ListCode::for_len(entries.len());
        self.codec.encoded_bits(entries, code).div_ceil(8) as usize
    }

    /// Drop entries from the end of `list` until it needs at most `room` bytes
    fn shrink_list(&mut self, list: usize, room: usize) {
        let before = self.lists[list].len();
        while !self.lists[list].is_empty() && self.list_bytes(list) > room {
            let len = self.lists[list].len();
            self.lists[list].truncate(len - 1);
        }
        let dropped = before - self.lists[list].len();
        if dropped > 0 {
            self.lost_records += dropped;
            warn!(
                chapter = self.virtual_chapter,
                list,
                dropped,
                "chapter delta list does not fit on an index page"
            );
        }
    }

    /// Pack lists starting at `first_list` into one page image
    ///
    /// Returns the page and the number of lists it holds. The last page
    /// takes every remaining list, truncating lists that do not fit.
    pub fn pack_index_page(&mut self, first_list: u32, last_page: bool) -> (Vec<u8>, u32) {
        let page_size = self.geometry.bytes_per_page;
        let total_lists = self.lists.len();
        let first = first_list as usize;

        let mut used = PAGE_HEADER_SIZE;
        let mut count = 0usize;
        while first + count < total_lists {
            let list = first + count;
            if used + DIRECTORY_ENTRY_SIZE > page_size {
                let dropped: usize = self.lists[list..].iter().map(OpenDeltaList::len).sum();
                self.lost_records += dropped;
                warn!(
                    chapter = self.virtual_chapter,
                    first_unpacked = list,
                    dropped,
                    "index pages cannot hold every chapter delta list"
                );
                break;
            }
            let needed = DIRECTORY_ENTRY_SIZE + self.list_bytes(list);
            if used + needed > page_size {
                if count > 0 && !last_page {
                    break;
                }
                let room = page_size.saturating_sub(used + DIRECTORY_ENTRY_SIZE);
                self.shrink_list(list, room);
            }
            used += DIRECTORY_ENTRY_SIZE + self.list_bytes(list);
            count += 1;
        }

        let mut page = Vec::with_capacity(page_size);
        page.put_u32_le(INDEX_PAGE_MAGIC);
        page.put_u64_le(self.virtual_chapter);
        page.put_u32_le(first_list);
        page.put_u16_le(count as u16);
        page.put_u16_le(0);

        let encoded: Vec<(Vec<u8>, u64, ListCode)> = (first..first + count)
            .map(|list| {
                let entries = self.lists[list].entries();
                let code = ListCode::for_len(entries.len());
                let (data, bits) = self.codec.encode(entries, code);
                (data, bits, code)
            })
            .collect();
        for (_, bits, code) in &encoded {
            page.put_u16_le(*bits as u16);
            page.put_u8(*code as u8);
        }
        for (data, bits, _) in &encoded {
            page.put_slice(&data[..bits.div_ceil(8) as usize]);
        }
        page.resize(page_size, 0);
        (page, count as u32)
    }

    /// Pack every index page of the chapter
    ///
    /// Returns each page with the highest list it holds.
    pub fn pack_pages(&mut self) -> Vec<(Vec<u8>, u32)> {
        let pages = self.geometry.index_pages_per_chapter;
        let mut first_list = 0u32;
        let mut packed = Vec::with_capacity(pages as usize);
        for page in 0..pages {
            let (image, count) = self.pack_index_page(first_list, page + 1 == pages);
            first_list += count;
            packed.push((image, first_list.saturating_sub(1)));
        }
        packed
    }
}

// =============================================================================
// Index Page Reader
// =============================================================================

/// A decoded chapter index page
#[derive(Debug)]
pub struct ChapterIndexPage {
    virtual_chapter: u64,
    first_list: u32,
    lists: Vec<Vec<DeltaEntry>>,
}

impl ChapterIndexPage {
    /// Validate and decode a page image
    pub fn parse(geometry: &Geometry, bytes: &[u8]) -> Result<Self> {
        let mut cursor = StreamCursor::new(bytes, "chapter index page");
        if cursor.u32()? != INDEX_PAGE_MAGIC {
            return Err(IndexError::format("bad chapter index page magic"));
        }
        let virtual_chapter = cursor.u64()?;
        let first_list = cursor.u32()?;
        let list_count = u32::from(cursor.u16()?);
        cursor.u16()?;
        if u64::from(first_list) + u64::from(list_count)
            > u64::from(geometry.delta_lists_per_chapter)
        {
            return Err(IndexError::format(format!(
                "index page lists {}..{} exceed {} lists",
                first_list,
                first_list + list_count,
                geometry.delta_lists_per_chapter
            )));
        }

        let mut directory = Vec::with_capacity(list_count as usize);
        for _ in 0..list_count {
            let bits = u64::from(cursor.u16()?);
            let code = ListCode::from_u8(cursor.u8()?)?;
            directory.push((bits, code));
        }

        let codec = chapter_codec(geometry);
        let mut lists = Vec::with_capacity(list_count as usize);
        for (bits, code) in directory {
            let data = cursor.bytes(bits.div_ceil(8) as usize)?;
            lists.push(codec.decode(data, bits, code)?);
        }

        Ok(Self {
            virtual_chapter,
            first_list,
            lists,
        })
    }

    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    pub fn first_list(&self) -> u32 {
        self.first_list
    }

    pub fn list_count(&self) -> u32 {
        self.lists.len() as u32
    }

    /// Record page that may hold `name`
    pub fn search(&self, geometry: &Geometry, name: &RecordName) -> Result<Option<u32>> {
        let list = name.chapter_delta_list(geometry);
        if list < self.first_list || list - self.first_list >= self.list_count() {
            return Err(IndexError::format(format!(
                "list {} is not on the index page holding lists {}..{}",
                list,
                self.first_list,
                self.first_list + self.list_count()
            )));
        }
        let entries = &self.lists[(list - self.first_list) as usize];
        let address = name.chapter_delta_address(geometry);
        Ok(search(entries, address, name).map(|(i, _)| entries[i].value))
    }
}
