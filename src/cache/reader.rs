//! Page reader threads
//!
//! Each reader takes the oldest unreserved queued read, reads and decodes
//! the page without holding the cache lock, installs it over the least
//! recently used slot, and restarts every request that waited on it in the
//! order they arrived.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{trace, warn};

use crate::error::{IndexError, Result};

use super::{CacheState, CachedPage, Location, PageCache};

impl PageCache {
    pub(super) fn reader_loop(&self) {
        while let Some((seq, page)) = self.next_read() {
            let result = self.read_page(page);
            self.complete_read(seq, page, result);
        }
        trace!("page reader exiting");
    }

    /// Reserve the next read; None on shutdown
    fn next_read(&self) -> Option<(u64, u32)> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(read) = state.queue.iter_mut().find(|read| !read.reserved) {
                read.reserved = true;
                return Some((read.seq, read.page));
            }
            self.read_ready.wait(&mut state);
        }
    }

    fn complete_read(&self, seq: u64, page: u32, result: Result<CachedPage>) {
        let mut state = self.state.lock();
        state.stats.reads += 1;

        let status = match result {
            Ok(data) => {
                self.install_read(&mut state, seq, page, Arc::new(data));
                Ok(())
            }
            Err(err) => {
                state.stats.read_failures += 1;
                if state.locations[page as usize] == Location::Queued(seq) {
                    state.locations[page as usize] = Location::Empty;
                }
                warn!(page, error = %err, "page read failed");
                Err(err.to_string())
            }
        };

        let waiters = match state.queue.iter().position(|read| read.seq == seq) {
            Some(index) => state
                .queue
                .remove(index)
                .map(|read| read.waiters)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        drop(state);

        for request in waiters {
            let status = match &status {
                Ok(()) => Ok(()),
                Err(reason) => Err(IndexError::ReadFailed {
                    page,
                    reason: reason.clone(),
                }),
            };
            self.restart(request, status);
        }
    }

    /// Put a freshly read page into the cache unless it was invalidated
    fn install_read(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        seq: u64,
        page: u32,
        data: Arc<CachedPage>,
    ) {
        loop {
            let invalid = state.queued_mut(seq).map(|read| read.invalid).unwrap_or(true);
            if invalid || state.locations[page as usize] != Location::Queued(seq) {
                trace!(page, "discarding read of invalidated page");
                return;
            }

            let Some((slot, victim)) = self.pick_victim(state) else {
                return;
            };
            if let Some(victim) = victim {
                if self.search_pending_on(victim) {
                    // The victim may change while unlocked, so choose again
                    MutexGuard::unlocked(state, || self.wait_for_searches(victim));
                    continue;
                }
            }
            self.install(state, slot, page, data);
            return;
        }
    }
}
