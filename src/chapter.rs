//! Chapter numbering
//!
//! Virtual chapters count up forever; the volume holds a fixed number of
//! physical chapter slots that are reused in a ring. All wraparound logic
//! lives in [`ChapterRing`] and [`ChapterWindow`].

use serde::{Deserialize, Serialize};

/// Maps virtual chapters onto physical chapter slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterRing {
    chapters_per_volume: u32,
}

impl ChapterRing {
    pub fn new(chapters_per_volume: u32) -> Self {
        debug_assert!(chapters_per_volume > 0);
        Self { chapters_per_volume }
    }

    /// Physical slot of a virtual chapter
    pub fn physical(&self, virtual_chapter: u64) -> u32 {
        (virtual_chapter % u64::from(self.chapters_per_volume)) as u32
    }

    /// Window of closed chapters still readable while `open_chapter` is open
    ///
    /// The open chapter will overwrite the slot of
    /// `open_chapter - chapters_per_volume`, which stays readable until then.
    pub fn closed_window(&self, open_chapter: u64) -> Option<ChapterWindow> {
        if open_chapter == 0 {
            return None;
        }
        let count = u64::from(self.chapters_per_volume);
        Some(ChapterWindow::new(
            open_chapter.saturating_sub(count),
            open_chapter - 1,
        ))
    }
}

/// An inclusive range of virtual chapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChapterWindow {
    pub low: u64,
    pub high: u64,
}

impl ChapterWindow {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high);
        Self { low, high }
    }

    /// Window of `count` chapters ending at `high`
    pub fn ending_at(high: u64, count: u32) -> Self {
        let count = u64::from(count.max(1));
        let low = if high >= count { high - count + 1 } else { 0 };
        Self { low, high }
    }

    pub fn contains(&self, virtual_chapter: u64) -> bool {
        self.low <= virtual_chapter && virtual_chapter <= self.high
    }

    pub fn chapter_count(&self) -> u64 {
        self.high - self.low + 1
    }
}
