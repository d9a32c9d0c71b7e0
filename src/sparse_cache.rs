//! Sparse Chapter Cache
//!
//! Once a chapter leaves the dense window, the volume index only remembers
//! its hook names. When a request finds a hook in such a chapter, the chapter
//! is noted here; requests for other names then search the noted chapters'
//! index pages directly.
//!
//! ## Concurrency:
//! - Any zone may note or read chapters; a Mutex guards the list
//! - The list is small, so readers take a copy

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

/// Recently hooked sparse chapters, most recent first
#[derive(Debug)]
pub struct SparseCache {
    capacity: usize,
    chapters: Mutex<VecDeque<u64>>,
}

impl SparseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chapters: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Note a hook hit in `chapter`; returns true if the chapter was not cached
    pub fn note(&self, chapter: u64) -> bool {
        let mut chapters = self.chapters.lock();
        if let Some(pos) = chapters.iter().position(|c| *c == chapter) {
            if pos > 0 {
                chapters.remove(pos);
                chapters.push_front(chapter);
            }
            return false;
        }
        if chapters.len() == self.capacity {
            if let Some(evicted) = chapters.pop_back() {
                debug!(chapter, evicted, "sparse chapter replaced");
            }
        }
        chapters.push_front(chapter);
        true
    }

    /// Cached chapters, most recently hooked first
    pub fn chapters(&self) -> Vec<u64> {
        self.chapters.lock().iter().copied().collect()
    }

    /// Forget chapters older than `oldest`
    pub fn expire(&self, oldest: u64) {
        self.chapters.lock().retain(|chapter| *chapter >= oldest);
    }

    pub fn len(&self) -> usize {
        self.chapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
