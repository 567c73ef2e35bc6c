// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use streaming_config::Timestamp;

use crate::aggregate::{AggregateKind, Partial};
use crate::buffer_pool::{Page, PageEntry, PagePool};
use crate::error::StreamResult;

/// A half-open event-time interval `[index * size, (index + 1) * size)`, the
/// unit of pre-aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    pub index: u64,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Slice {
    pub fn for_index(index: u64, slice_size: u64) -> Self {
        Self {
            index,
            start: index * slice_size,
            end: (index + 1) * slice_size,
        }
    }

    pub fn covers(&self, timestamp: Timestamp) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

/// Slice index of an event time under the given slice size.
pub fn slice_index_for(timestamp: Timestamp, slice_size: u64) -> u64 {
    timestamp / slice_size
}

/// Key hash used for both partition assignment and hash-map probing.
pub(crate) fn hash_key(key: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write_u64(key);
    hasher.finish()
}

/// An open-addressing hash map whose slots live in pool pages.
///
/// Keys map to partial aggregates; an upsert combines with the existing
/// partial. The map starts empty and page-less, so an untouched partition of
/// a slice costs nothing until its first key arrives. Occupancy is tracked in
/// a bitmap sized per page grow, not per tuple.
#[derive(Default)]
pub struct PagedHashMap {
    pages: Vec<Page>,
    occupied: Vec<u64>,
    slots_per_page: usize,
    len: usize,
}

impl PagedHashMap {
    /// Fraction of occupied slots that triggers a grow, as (numerator,
    /// denominator).
    const LOAD_FACTOR: (usize, usize) = (7, 10);

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.pages.len() * self.slots_per_page
    }

    fn is_occupied(&self, slot: usize) -> bool {
        self.occupied[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn mark_occupied(&mut self, slot: usize) {
        self.occupied[slot / 64] |= 1 << (slot % 64);
    }

    fn entry(&self, slot: usize) -> PageEntry {
        self.pages[slot / self.slots_per_page].slots()[slot % self.slots_per_page]
    }

    fn set_entry(&mut self, slot: usize, entry: PageEntry) {
        let per_page = self.slots_per_page;
        self.pages[slot / per_page].slots_mut()[slot % per_page] = entry;
    }

    /// Inserts `partial` for `key`, combining with any existing partial.
    pub fn upsert(
        &mut self,
        pool: &PagePool,
        key: u64,
        partial: Partial,
        aggregate: &AggregateKind,
    ) -> StreamResult<()> {
        if (self.len + 1) * Self::LOAD_FACTOR.1 > self.capacity() * Self::LOAD_FACTOR.0 {
            self.grow(pool)?;
        }
        let capacity = self.capacity();
        let mut slot = (hash_key(key) as usize) % capacity;
        loop {
            if !self.is_occupied(slot) {
                self.set_entry(
                    slot,
                    PageEntry {
                        key,
                        value: partial.0,
                        aux: partial.1,
                    },
                );
                self.mark_occupied(slot);
                self.len += 1;
                return Ok(());
            }
            let existing = self.entry(slot);
            if existing.key == key {
                let combined = aggregate.combine((existing.value, existing.aux), partial);
                self.set_entry(
                    slot,
                    PageEntry {
                        key,
                        value: combined.0,
                        aux: combined.1,
                    },
                );
                return Ok(());
            }
            slot = (slot + 1) % capacity;
        }
    }

    pub fn get(&self, key: u64) -> Option<Partial> {
        if self.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut slot = (hash_key(key) as usize) % capacity;
        for _ in 0..capacity {
            if !self.is_occupied(slot) {
                return None;
            }
            let entry = self.entry(slot);
            if entry.key == key {
                return Some((entry.value, entry.aux));
            }
            slot = (slot + 1) % capacity;
        }
        None
    }

    /// Occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Partial)> + '_ {
        (0..self.capacity()).filter_map(move |slot| {
            if self.is_occupied(slot) {
                let entry = self.entry(slot);
                Some((entry.key, (entry.value, entry.aux)))
            } else {
                None
            }
        })
    }

    fn grow(&mut self, pool: &PagePool) -> StreamResult<()> {
        let new_page_count = (self.pages.len() * 2).max(1);
        let mut grown = PagedHashMap {
            pages: Vec::with_capacity(new_page_count),
            occupied: Vec::new(),
            slots_per_page: pool.page_entries(),
            len: 0,
        };
        for _ in 0..new_page_count {
            grown.pages.push(pool.allocate()?);
        }
        grown
            .occupied
            .resize(grown.capacity().div_ceil(64), 0);

        for slot in 0..self.capacity() {
            if self.is_occupied(slot) {
                let entry = self.entry(slot);
                grown.insert_unique(entry);
            }
        }
        *self = grown;
        Ok(())
    }

    // Rehash path: keys are known to be distinct and capacity is sufficient.
    fn insert_unique(&mut self, entry: PageEntry) {
        let capacity = self.capacity();
        let mut slot = (hash_key(entry.key) as usize) % capacity;
        while self.is_occupied(slot) {
            slot = (slot + 1) % capacity;
        }
        self.set_entry(slot, entry);
        self.mark_occupied(slot);
        self.len += 1;
    }
}

/// An append-only sequence of pages holding the records of one partition of
/// one slice, the build-side state of the hash join.
#[derive(Default)]
pub struct PartitionPages {
    pages: Vec<Page>,
    len: usize,
}

impl PartitionPages {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, pool: &PagePool, entry: PageEntry) -> StreamResult<()> {
        if let Some(page) = self.pages.last_mut() {
            match page.push(entry) {
                Ok(()) => {
                    self.len += 1;
                    return Ok(());
                }
                Err(returned) => {
                    let mut page = pool.allocate()?;
                    // A fresh page always has room for one entry.
                    let _ = page.push(returned);
                    self.pages.push(page);
                    self.len += 1;
                    return Ok(());
                }
            }
        }
        let mut page = pool.allocate()?;
        let _ = page.push(entry);
        self.pages.push(page);
        self.len += 1;
        Ok(())
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> + '_ {
        self.pages.iter().flat_map(|page| page.entries().iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use streaming_config::Parameters;

    fn test_page_pool(page_entries: usize, page_limit: usize) -> PagePool {
        let context = Context::new_for_test(2).with_parameters(Parameters {
            page_entries,
            page_limit,
            ..Default::default()
        });
        PagePool::new(&context)
    }

    #[test]
    fn slice_bounds() {
        let slice = Slice::for_index(3, 10);
        assert_eq!(slice.start, 30);
        assert_eq!(slice.end, 40);
        assert!(slice.covers(30));
        assert!(slice.covers(39));
        assert!(!slice.covers(40));
        assert_eq!(slice_index_for(39, 10), 3);
        assert_eq!(slice_index_for(40, 10), 4);
    }

    #[test]
    fn upsert_combines_partials() {
        let pool = test_page_pool(16, 64);
        let mut map = PagedHashMap::default();
        let agg = AggregateKind::Sum;

        map.upsert(&pool, 1, agg.lift(10), &agg).unwrap();
        map.upsert(&pool, 2, agg.lift(20), &agg).unwrap();
        map.upsert(&pool, 1, agg.lift(30), &agg).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(1), Some((40, 0)));
        assert_eq!(map.get(2), Some((20, 0)));
        assert_eq!(map.get(3), None);
    }

    #[test]
    fn map_grows_past_one_page() {
        let pool = test_page_pool(8, 64);
        let mut map = PagedHashMap::default();
        let agg = AggregateKind::Sum;

        for key in 0..100 {
            map.upsert(&pool, key, agg.lift(key), &agg).unwrap();
        }
        assert_eq!(map.len(), 100);
        for key in 0..100 {
            assert_eq!(map.get(key), Some((key, 0)));
        }
        let mut collected: Vec<_> = map.iter().map(|(key, partial)| (key, partial.0)).collect();
        collected.sort_unstable();
        assert_eq!(collected.len(), 100);
        assert_eq!(collected[0], (0, 0));
        assert_eq!(collected[99], (99, 99));
    }

    #[test]
    fn map_exhaustion_surfaces_as_error() {
        let pool = test_page_pool(4, 1);
        let mut map = PagedHashMap::default();
        let agg = AggregateKind::Sum;

        // One page of 4 slots sustains at most 2 keys under the load factor.
        map.upsert(&pool, 1, agg.lift(1), &agg).unwrap();
        map.upsert(&pool, 2, agg.lift(2), &agg).unwrap();
        assert!(map.upsert(&pool, 3, agg.lift(3), &agg).is_err());
    }

    #[test]
    fn partition_pages_preserve_insertion_order() {
        let pool = test_page_pool(2, 16);
        let mut pages = PartitionPages::default();

        for key in 0..5 {
            pages
                .push(
                    &pool,
                    PageEntry {
                        key,
                        value: key * 100,
                        aux: key,
                    },
                )
                .unwrap();
        }
        assert_eq!(pages.len(), 5);
        let keys: Vec<u64> = pages.iter().map(|entry| entry.key).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    }
}
