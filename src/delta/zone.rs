//! Delta list arena for one zone
//!
//! A zone owns a contiguous range of list numbers and one byte arena that
//! holds all of their encoded lists back to back. Each list starts on a byte
//! boundary and is followed by a gap of free space. When a list outgrows its
//! gap the arena is rebalanced: free space is spread evenly again and lists
//! are moved in place.
//!
//! ```text
//! ┌────────┬─────┬────────┬─────┬────────┬─────┐
//! │ list 0 │ gap │ list 1 │ gap │ list 2 │ gap │
//! └────────┴─────┴────────┴─────┴────────┴─────┘
//! ```

use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{IndexError, Result};

/// Result of storing an encoded list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The list fit in its gap
    Stored,
    /// The arena was rebalanced to make room
    Rebalanced,
    /// The arena cannot hold the list; nothing changed
    Overflow,
}

/// Byte arena holding the delta lists of one zone
#[derive(Debug)]
pub struct DeltaZone {
    memory: Vec<u8>,
    first_list: u32,
    /// Byte offset of each list
    starts: Vec<usize>,
    /// Encoded length of each list in bits
    bits: Vec<u64>,
    used_bits: u64,
    rebalance_count: u64,
    rebalance_time: Duration,
}

impl DeltaZone {
    /// Create an arena of `bytes` bytes for lists `first_list..first_list + list_count`
    pub fn new(first_list: u32, list_count: u32, bytes: usize) -> Self {
        let count = list_count as usize;
        let starts = (0..count)
            .map(|i| (i as u64 * bytes as u64 / count.max(1) as u64) as usize)
            .collect();
        Self {
            memory: vec![0u8; bytes],
            first_list,
            starts,
            bits: vec![0; count],
            used_bits: 0,
            rebalance_count: 0,
            rebalance_time: Duration::ZERO,
        }
    }

    /// Build an arena from already encoded lists, spreading free space evenly
    pub fn restore(
        first_list: u32,
        bytes: usize,
        lists: Vec<(Vec<u8>, u64)>,
    ) -> Result<Self> {
        let sizes: Vec<usize> = lists.iter().map(|(_, bits)| bits.div_ceil(8) as usize).collect();
        let total: usize = sizes.iter().sum();
        if total > bytes {
            return Err(IndexError::format(format!(
                "saved lists need {} bytes but the zone holds {}",
                total, bytes
            )));
        }

        let starts = spread(&sizes, bytes);
        let mut memory = vec![0u8; bytes];
        let mut bits = Vec::with_capacity(lists.len());
        let mut used_bits = 0;
        for (i, (data, list_bits)) in lists.into_iter().enumerate() {
            memory[starts[i]..starts[i] + sizes[i]].copy_from_slice(&data[..sizes[i]]);
            used_bits += list_bits;
            bits.push(list_bits);
        }

        Ok(Self {
            memory,
            first_list,
            starts,
            bits,
            used_bits,
            rebalance_count: 0,
            rebalance_time: Duration::ZERO,
        })
    }

    pub fn first_list(&self) -> u32 {
        self.first_list
    }

    pub fn list_count(&self) -> u32 {
        self.starts.len() as u32
    }

    pub fn owns(&self, list: u32) -> bool {
        list >= self.first_list && list - self.first_list < self.list_count()
    }

    /// Total encoded bits of all lists
    pub fn used_bits(&self) -> u64 {
        self.used_bits
    }

    pub fn capacity_bytes(&self) -> usize {
        self.memory.len()
    }

    pub fn rebalance_count(&self) -> u64 {
        self.rebalance_count
    }

    pub fn rebalance_time(&self) -> Duration {
        self.rebalance_time
    }

    fn index(&self, list: u32) -> usize {
        debug_assert!(self.owns(list), "list {} not owned by this zone", list);
        (list - self.first_list) as usize
    }

    fn byte_len(&self, index: usize) -> usize {
        self.bits[index].div_ceil(8) as usize
    }

    fn gap_end(&self, index: usize) -> usize {
        self.starts
            .get(index + 1)
            .copied()
            .unwrap_or(self.memory.len())
    }

    /// Encoded bytes and bit length of `list`
    pub fn list(&self, list: u32) -> (&[u8], u64) {
        let index = self.index(list);
        let start = self.starts[index];
        (&self.memory[start..start + self.byte_len(index)], self.bits[index])
    }

    /// Replace the encoding of `list`
    pub fn store(&mut self, list: u32, data: &[u8], bits: u64) -> StoreOutcome {
        let index = self.index(list);
        let needed = bits.div_ceil(8) as usize;
        debug_assert!(data.len() >= needed);

        let mut outcome = StoreOutcome::Stored;
        if self.starts[index] + needed > self.gap_end(index) {
            let total = self.used_bytes() - self.byte_len(index) + needed;
            if total > self.memory.len() {
                return StoreOutcome::Overflow;
            }
            self.rebalance(index, needed);
            outcome = StoreOutcome::Rebalanced;
        }

        let start = self.starts[index];
        self.memory[start..start + needed].copy_from_slice(&data[..needed]);
        self.used_bits = self.used_bits - self.bits[index] + bits;
        self.bits[index] = bits;
        outcome
    }

    fn used_bytes(&self) -> usize {
        (0..self.bits.len()).map(|i| self.byte_len(i)).sum()
    }

    /// Spread free space evenly, giving list `grow` room for `needed` bytes
    fn rebalance(&mut self, grow: usize, needed: usize) {
        let started = Instant::now();
        let old_lens: Vec<usize> = (0..self.bits.len()).map(|i| self.byte_len(i)).collect();
        let mut sizes = old_lens.clone();
        sizes[grow] = needed;
        let new_starts = spread(&sizes, self.memory.len());

        // Lists moving left go first in ascending order, then lists moving
        // right in descending order; neither pass overwrites an unmoved list.
        for i in 0..new_starts.len() {
            if new_starts[i] < self.starts[i] {
                let old = self.starts[i];
                self.memory.copy_within(old..old + old_lens[i], new_starts[i]);
            }
        }
        for i in (0..new_starts.len()).rev() {
            if new_starts[i] > self.starts[i] {
                let old = self.starts[i];
                self.memory.copy_within(old..old + old_lens[i], new_starts[i]);
            }
        }
        self.starts = new_starts;

        let elapsed = started.elapsed();
        self.rebalance_count += 1;
        self.rebalance_time += elapsed;
        trace!(
            first_list = self.first_list,
            grown = grow,
            elapsed_us = elapsed.as_micros() as u64,
            "rebalanced delta zone"
        );
    }
}

/// Lay out lists of `sizes` bytes in `total` bytes with even gaps after each
fn spread(sizes: &[usize], total: usize) -> Vec<usize> {
    let count = sizes.len();
    if count == 0 {
        return Vec::new();
    }
    let used: usize = sizes.iter().sum();
    let free = total - used;
    let per_list = free / count;
    let extra = free % count;

    let mut starts = Vec::with_capacity(count);
    let mut next = 0;
    for (i, size) in sizes.iter().enumerate() {
        starts.push(next);
        next += size + per_list + usize::from(i < extra);
    }
    starts
}
