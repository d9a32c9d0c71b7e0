//! Index Page Map
//!
//! For every physical chapter, records the highest chapter delta list held
//! by each index page except the last. A name's index page is the first page
//! whose entry is at least the name's list; the last page covers everything
//! above the final entry.
//!
//! ## Save Format
//! ```text
//! ┌───────────┬────────────┬───────────┬───────────┬─────────────┬─────────┬───────┐
//! │ magic (8) │ chapters   │ pages per │ lists per │ last update │ entries │ crc32 │
//! │           │ (4)        │ chapter(4)│ chapter(4)│ (8)         │ (4 each)│ (4)   │
//! └───────────┴────────────┴───────────┴───────────┴─────────────┴─────────┴───────┘
//! ```

use std::io::{Read, Write};

use bytes::BufMut;

use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::name::RecordName;
use crate::storage::StreamCursor;

const PAGE_MAP_MAGIC: &[u8; 8] = b"DPGMAP01";

/// Index page locator for every chapter in the volume
#[derive(Debug, Clone)]
pub struct IndexPageMap {
    geometry: Geometry,
    last_update: u64,
    entries: Vec<u32>,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Self {
        let per_chapter = geometry.index_pages_per_chapter as usize - 1;
        Self {
            geometry: *geometry,
            last_update: 0,
            entries: vec![0; geometry.chapters_per_volume as usize * per_chapter],
        }
    }

    /// Newest virtual chapter recorded
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    fn entries_per_chapter(&self) -> usize {
        self.geometry.index_pages_per_chapter as usize - 1
    }

    fn check_page(&self, chapter_number: u32, page_number: u32) -> Result<()> {
        if chapter_number >= self.geometry.chapters_per_volume {
            return Err(IndexError::invalid(format!(
                "chapter {} out of range for {} chapters",
                chapter_number, self.geometry.chapters_per_volume
            )));
        }
        if page_number >= self.geometry.index_pages_per_chapter {
            return Err(IndexError::invalid(format!(
                "index page {} out of range for {} pages",
                page_number, self.geometry.index_pages_per_chapter
            )));
        }
        Ok(())
    }

    fn chapter_entries(&self, chapter_number: u32) -> &[u32] {
        let per_chapter = self.entries_per_chapter();
        let start = chapter_number as usize * per_chapter;
        &self.entries[start..start + per_chapter]
    }

    /// Record that `page_number` of `chapter_number` ends with list `highest_list`
    pub fn update(
        &mut self,
        virtual_chapter: u64,
        chapter_number: u32,
        page_number: u32,
        highest_list: u32,
    ) -> Result<()> {
        self.check_page(chapter_number, page_number)?;
        self.last_update = self.last_update.max(virtual_chapter);
        if page_number as usize == self.entries_per_chapter() {
            return Ok(());
        }
        let slot = chapter_number as usize * self.entries_per_chapter() + page_number as usize;
        self.entries[slot] = highest_list;
        Ok(())
    }

    /// Index page of `chapter_number` that holds `name`'s delta list
    pub fn find_index_page_number(&self, name: &RecordName, chapter_number: u32) -> Result<u32> {
        self.check_page(chapter_number, 0)?;
        let list = name.chapter_delta_list(&self.geometry);
        let page = self
            .chapter_entries(chapter_number)
            .iter()
            .position(|highest| *highest >= list)
            .unwrap_or(self.entries_per_chapter());
        Ok(page as u32)
    }

    /// Lowest and highest delta list held by an index page
    pub fn list_number_bounds(&self, chapter_number: u32, page_number: u32) -> Result<(u32, u32)> {
        self.check_page(chapter_number, page_number)?;
        let entries = self.chapter_entries(chapter_number);
        let page = page_number as usize;
        let low = if page == 0 { 0 } else { entries[page - 1] + 1 };
        let high = if page == entries.len() {
            self.geometry.delta_lists_per_chapter - 1
        } else {
            entries[page]
        };
        Ok((low, high))
    }

    /// Size of the saved page map in bytes
    pub fn compute_save_size(geometry: &Geometry) -> u64 {
        let entries = u64::from(geometry.chapters_per_volume)
            * u64::from(geometry.index_pages_per_chapter - 1);
        PAGE_MAP_MAGIC.len() as u64 + 3 * 4 + 8 + entries * 4 + 4
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(Self::compute_save_size(&self.geometry) as usize);
        buf.put_slice(PAGE_MAP_MAGIC);
        buf.put_u32_le(self.geometry.chapters_per_volume);
        buf.put_u32_le(self.geometry.index_pages_per_chapter);
        buf.put_u32_le(self.geometry.delta_lists_per_chapter);
        buf.put_u64_le(self.last_update);
        for entry in &self.entries {
            buf.put_u32_le(*entry);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Read a saved page map; trailing bytes after the checksum are ignored
    pub fn read<R: Read>(geometry: &Geometry, reader: &mut R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut cursor = StreamCursor::new(&data, "index page map");
        if cursor.bytes(PAGE_MAP_MAGIC.len())? != PAGE_MAP_MAGIC {
            return Err(IndexError::format("bad index page map magic"));
        }
        let saved = (cursor.u32()?, cursor.u32()?, cursor.u32()?);
        let expected = (
            geometry.chapters_per_volume,
            geometry.index_pages_per_chapter,
            geometry.delta_lists_per_chapter,
        );
        if saved != expected {
            return Err(IndexError::format(format!(
                "index page map saved for geometry {:?}, expected {:?}",
                saved, expected
            )));
        }

        let mut map = Self::new(geometry);
        map.last_update = cursor.u64()?;
        cursor.need(map.entries.len() * 4)?;
        for entry in map.entries.iter_mut() {
            *entry = cursor.u32()?;
        }

        let consumed = data.len() - cursor.remaining();
        if crc32fast::hash(&data[..consumed]) != cursor.u32()? {
            return Err(IndexError::format("index page map checksum mismatch"));
        }

        let per_chapter = map.entries_per_chapter();
        if per_chapter > 0 {
            for (chapter, entries) in map.entries.chunks(per_chapter).enumerate() {
                let sorted = entries.windows(2).all(|w| w[0] <= w[1]);
                let in_range = entries.iter().all(|e| *e < geometry.delta_lists_per_chapter);
                if !sorted || !in_range {
                    return Err(IndexError::format(format!(
                        "index page map entries of chapter {} are not monotonic",
                        chapter
                    )));
                }
            }
        }
        Ok(map)
    }
}
