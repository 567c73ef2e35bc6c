// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use streaming_config::{OriginId, SequenceNumber, Timestamp};
use tracing::trace;

use crate::aggregate::AggregateKind;
use crate::buffer_pool::PagePool;
use crate::error::{StreamError, StreamResult};
use crate::metrics::Metrics;
use crate::slice::{PagedHashMap, Slice};
use crate::watermark::SequenceRing;

/// Where a backpressured build task left off in its input buffer, so the
/// retry resumes instead of double-applying the already-ingested prefix.
/// Only meaningful on the worker that parked it; retries are pinned to their
/// worker.
#[derive(Clone, Copy, Debug)]
struct ResumePoint {
    origin: OriginId,
    sequence: SequenceNumber,
    record_index: usize,
    watermark: Timestamp,
}

/// Per-worker pre-aggregation state: the open slices this thread is still
/// filling, keyed by slice index, plus the flush cursor.
///
/// Only the owning worker touches the store, so it needs no synchronization of
/// its own. Flushing is dense: every slice index from the cursor up to the
/// flush boundary is handed to the global store, materializing empty state
/// for indices this worker never saw. That keeps the per-slice contribution
/// count at exactly the worker count, which is what seals a global slice.
pub(crate) struct ThreadLocalSliceStore<S> {
    slices: BTreeMap<u64, Vec<S>>,
    partitions: usize,
    /// Next slice index this store will contribute to the global store.
    next_flush_index: u64,
    /// Tuples older than this are late and dropped.
    pub last_local_watermark: Timestamp,
    resume: Option<ResumePoint>,
}

impl<S: Default> ThreadLocalSliceStore<S> {
    pub fn new(partitions: usize) -> Self {
        Self {
            slices: BTreeMap::new(),
            partitions,
            next_flush_index: 0,
            last_local_watermark: 0,
            resume: None,
        }
    }

    /// Records how far into `(origin, sequence)` ingestion got before the
    /// page pool ran dry.
    pub fn park_ingest(
        &mut self,
        origin: OriginId,
        sequence: SequenceNumber,
        record_index: usize,
        watermark: Timestamp,
    ) {
        self.resume = Some(ResumePoint {
            origin,
            sequence,
            record_index,
            watermark,
        });
    }

    /// The record index and partial buffer watermark to resume
    /// `(origin, sequence)` from. Clears the marker; a buffer that was never
    /// parked starts at record zero.
    pub fn resume_ingest(
        &mut self,
        origin: OriginId,
        sequence: SequenceNumber,
    ) -> (usize, Timestamp) {
        match self.resume.take() {
            Some(point) if point.origin == origin && point.sequence == sequence => {
                (point.record_index, point.watermark)
            }
            _ => (0, 0),
        }
    }

    /// The partition state of the given slice, created on first touch.
    pub fn partition_mut(&mut self, slice_index: u64, partition: usize) -> &mut S {
        let partitions = self.partitions;
        let slice = self
            .slices
            .entry(slice_index)
            .or_insert_with(|| (0..partitions).map(|_| S::default()).collect());
        &mut slice[partition]
    }

    /// Smallest open slice index, if any.
    #[cfg(test)]
    pub fn first_open_slice(&self) -> Option<u64> {
        self.slices.keys().next().copied()
    }

    /// Drains every slice index in `[cursor, boundary)` in order, yielding
    /// `(slice_index, per-partition state)`. Indices this worker never opened
    /// yield default (empty) state.
    pub fn drain_until(&mut self, boundary: u64) -> Vec<(u64, Vec<S>)> {
        let partitions = self.partitions;
        let mut drained = Vec::new();
        while self.next_flush_index < boundary {
            let index = self.next_flush_index;
            let state = self
                .slices
                .remove(&index)
                .unwrap_or_else(|| (0..partitions).map(|_| S::default()).collect());
            drained.push((index, state));
            self.next_flush_index += 1;
        }
        drained
    }

    pub fn clear(&mut self) {
        self.slices.clear();
    }
}

/// Shared state of one slice within one partition of the global store.
///
/// Workers contribute their thread-local partition state through a
/// fetch-and-increment slot claim; once `worker_count` contributions have
/// landed the list is sealed and the merge stage folds it into `merged`
/// exactly once.
pub(crate) struct GlobalSlice {
    pub slice: Slice,
    contributions: Box<[OnceLock<PagedHashMap>]>,
    /// Slots handed out to contributors.
    claimed: AtomicUsize,
    /// Contributions fully published. Only this counter may be used to decide
    /// that the slice is sealed: a claimed slot's state is not yet visible.
    completed: AtomicUsize,
    merged: OnceLock<PagedHashMap>,
}

impl GlobalSlice {
    fn new(slice: Slice, worker_count: usize) -> Self {
        let contributions = (0..worker_count)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slice,
            contributions,
            claimed: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            merged: OnceLock::new(),
        }
    }

    /// Adds one worker's partition state and returns how many contributions
    /// the slice now holds. The caller that observes the full count dispatches
    /// the merge task.
    pub fn contribute(&self, state: PagedHashMap) -> StreamResult<usize> {
        let slot = self.claimed.fetch_add(1, Ordering::AcqRel);
        if slot >= self.contributions.len() {
            return Err(StreamError::Internal(format!(
                "slice {} received more contributions than workers",
                self.slice.index
            )));
        }
        if self.contributions[slot].set(state).is_err() {
            return Err(StreamError::Internal(format!(
                "contribution slot {slot} of slice {} claimed twice",
                self.slice.index
            )));
        }
        Ok(self.completed.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Folds the sealed contribution list into the merged per-partition map.
    /// Runs at most once per slice; the contribution list is complete by the
    /// time the merge task exists.
    pub fn merge(
        &self,
        pool: &PagePool,
        aggregate: &AggregateKind,
    ) -> StreamResult<&PagedHashMap> {
        if let Some(merged) = self.merged.get() {
            return Ok(merged);
        }
        let mut merged = PagedHashMap::default();
        for contribution in self.contributions.iter() {
            let Some(state) = contribution.get() else {
                return Err(StreamError::Internal(format!(
                    "merging slice {} before it is sealed",
                    self.slice.index
                )));
            };
            for (key, partial) in state.iter() {
                merged.upsert(pool, key, partial, aggregate)?;
            }
        }
        self.merged
            .set(merged)
            .map_err(|_| StreamError::Internal(format!("slice {} merged twice", self.slice.index)))?;
        Ok(self
            .merged
            .get()
            .expect("merged state was just installed"))
    }

    /// The merged state, if the merge has run.
    pub fn merged(&self) -> Option<&PagedHashMap> {
        self.merged.get()
    }

    #[cfg(test)]
    pub fn contribution_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}

/// A claimed window-aggregate dispatch: the slice range and the trigger
/// sequence number that orders it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TriggerClaim {
    pub start_slice: u64,
    pub end_slice: u64,
    pub trigger_sequence: u64,
}

/// One partition of the global slice store: its open slices, the log that
/// linearizes merge completions, and the trigger/GC bookkeeping.
pub(crate) struct GlobalPartition {
    slices: DashMap<u64, Arc<GlobalSlice>>,
    /// Commits the contiguous prefix of merged slices. An entry for slice `i`
    /// is inserted at sequence `i + 1`.
    pub merged_log: SequenceRing,
    /// Packs `(trigger counter << 32) | dispatched slice bound` so a slice
    /// range and its trigger sequence are claimed in one CAS. Anything else
    /// lets a later range carry an earlier sequence, which would let the GC
    /// watermark overtake an undelivered trigger.
    trigger_state: AtomicU64,
    /// GC watermark over trigger sequences; its committed value is the
    /// exclusive bound of triggered slices.
    pub gc_log: SequenceRing,
}

impl GlobalPartition {
    fn new(log_capacity: usize) -> Self {
        Self {
            slices: DashMap::new(),
            merged_log: SequenceRing::new(log_capacity),
            trigger_state: AtomicU64::new(0),
            gc_log: SequenceRing::new(log_capacity),
        }
    }

    /// Claims the window-aggregate dispatch for every slice up to `sealed`.
    /// Returns `None` when another merge already covered the range; each
    /// slice index is claimed exactly once across all callers.
    pub fn try_claim_trigger(&self, sealed: u64) -> StreamResult<Option<TriggerClaim>> {
        if sealed > u64::from(u32::MAX) {
            return Err(StreamError::Internal(format!(
                "slice index {sealed} exceeds the trigger state's range"
            )));
        }
        loop {
            let state = self.trigger_state.load(Ordering::Acquire);
            let (count, bound) = (state >> 32, state & u64::from(u32::MAX));
            if sealed <= bound {
                return Ok(None);
            }
            let next = ((count + 1) << 32) | sealed;
            if self
                .trigger_state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Some(TriggerClaim {
                    start_slice: bound,
                    end_slice: sealed,
                    trigger_sequence: count + 1,
                }));
            }
        }
    }

    pub fn slice_or_create(&self, index: u64, slice_size: u64, worker_count: usize) -> Arc<GlobalSlice> {
        self.slices
            .entry(index)
            .or_insert_with(|| {
                Arc::new(GlobalSlice::new(Slice::for_index(index, slice_size), worker_count))
            })
            .value()
            .clone()
    }

    pub fn slice(&self, index: u64) -> Option<Arc<GlobalSlice>> {
        self.slices.get(&index).map(|entry| entry.value().clone())
    }

    /// Drops slices whose index lies strictly below `bound`. Dropping a slice
    /// releases its pages back to the pool.
    pub fn remove_slices_below(&self, bound: u64, metrics: &Metrics) {
        let before = self.slices.len();
        self.slices.retain(|index, _| *index >= bound);
        let dropped = before.saturating_sub(self.slices.len());
        if dropped > 0 {
            trace!(bound, dropped, "dropped expired slices");
            metrics.slices_dropped.inc_by(dropped as u64);
        }
    }

    #[cfg(test)]
    pub fn open_slices(&self) -> usize {
        self.slices.len()
    }
}

/// The global half of the two-level slice store: one [`GlobalPartition`] per
/// key-space partition.
pub(crate) struct GlobalSliceStore {
    partitions: Vec<GlobalPartition>,
}

impl GlobalSliceStore {
    pub fn new(partitions: usize, log_capacity: usize) -> Self {
        Self {
            partitions: (0..partitions)
                .map(|_| GlobalPartition::new(log_capacity))
                .collect(),
        }
    }

    pub fn partition(&self, index: u64) -> StreamResult<&GlobalPartition> {
        self.partitions.get(index as usize).ok_or_else(|| {
            StreamError::Internal(format!("partition {index} out of range"))
        })
    }

    pub fn clear(&self) {
        for partition in &self.partitions {
            partition.slices.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use rand::prelude::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use streaming_config::Parameters;

    fn test_pool() -> PagePool {
        let context = Context::new_for_test(4).with_parameters(Parameters {
            page_entries: 16,
            page_limit: 1024,
            ..Default::default()
        });
        PagePool::new(&context)
    }

    #[test]
    fn thread_local_store_drains_densely() {
        let mut store: ThreadLocalSliceStore<PagedHashMap> = ThreadLocalSliceStore::new(2);
        let pool = test_pool();
        let agg = AggregateKind::Sum;

        store
            .partition_mut(2, 1)
            .upsert(&pool, 7, agg.lift(70), &agg)
            .unwrap();
        assert_eq!(store.first_open_slice(), Some(2));

        // Draining to boundary 4 yields slices 0..4, with 0, 1 and 3 empty.
        let drained = store.drain_until(4);
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0].0, 0);
        assert!(drained[0].1.iter().all(|state| state.is_empty()));
        assert_eq!(drained[2].1[1].get(7), Some((70, 0)));
        assert!(store.first_open_slice().is_none());

        // The cursor does not revisit drained indices.
        assert!(store.drain_until(4).is_empty());
        assert_eq!(store.drain_until(5).len(), 1);
    }

    #[test]
    fn resume_marker_survives_one_round_trip() {
        let mut store: ThreadLocalSliceStore<PagedHashMap> = ThreadLocalSliceStore::new(1);

        assert_eq!(store.resume_ingest(0, 1), (0, 0));
        store.park_ingest(0, 1, 7, 42);
        assert_eq!(store.resume_ingest(0, 1), (7, 42));
        // Taken once; a second resume of the same buffer starts over.
        assert_eq!(store.resume_ingest(0, 1), (0, 0));

        // A marker for a different buffer does not apply.
        store.park_ingest(0, 1, 7, 42);
        assert_eq!(store.resume_ingest(0, 2), (0, 0));
    }

    #[test]
    fn contributions_seal_at_worker_count() {
        let slice = GlobalSlice::new(Slice::for_index(3, 10), 4);
        for expected in 1..=4 {
            let count = slice.contribute(PagedHashMap::default()).unwrap();
            assert_eq!(count, expected);
        }
        assert!(slice.contribute(PagedHashMap::default()).is_err());
    }

    #[test]
    fn merge_folds_all_contributions() {
        let pool = test_pool();
        let agg = AggregateKind::Sum;
        let slice = GlobalSlice::new(Slice::for_index(0, 10), 3);

        for worker in 0..3u64 {
            let mut state = PagedHashMap::default();
            state.upsert(&pool, 1, agg.lift(worker + 1), &agg).unwrap();
            if worker == 0 {
                state.upsert(&pool, 2, agg.lift(5), &agg).unwrap();
            }
            slice.contribute(state).unwrap();
        }

        let merged = slice.merge(&pool, &agg).unwrap();
        assert_eq!(merged.get(1), Some((6, 0)));
        assert_eq!(merged.get(2), Some((5, 0)));

        // Merging again is a no-op returning the same state.
        let again = slice.merge(&pool, &agg).unwrap();
        assert_eq!(again.get(1), Some((6, 0)));
    }

    #[test]
    fn merge_order_does_not_change_the_result() {
        let pool = test_pool();
        let agg = AggregateKind::Sum;
        for seed in 0..20u8 {
            let slice = GlobalSlice::new(Slice::for_index(0, 10), 4);
            let mut contributions: Vec<u64> = (1..=4).collect();
            contributions.shuffle(&mut StdRng::from_seed([seed; 32]));
            for value in contributions {
                let mut state = PagedHashMap::default();
                state.upsert(&pool, 9, agg.lift(value), &agg).unwrap();
                slice.contribute(state).unwrap();
            }
            let merged = slice.merge(&pool, &agg).unwrap();
            assert_eq!(merged.get(9), Some((10, 0)));
        }
    }

    #[test]
    fn trigger_claims_cover_each_slice_once() {
        let partition = GlobalPartition::new(64);
        assert_eq!(
            partition.try_claim_trigger(3).unwrap(),
            Some(TriggerClaim {
                start_slice: 0,
                end_slice: 3,
                trigger_sequence: 1
            })
        );
        // A merge that lost the race sees its range already covered.
        assert_eq!(partition.try_claim_trigger(2).unwrap(), None);
        assert_eq!(partition.try_claim_trigger(3).unwrap(), None);
        assert_eq!(
            partition.try_claim_trigger(5).unwrap(),
            Some(TriggerClaim {
                start_slice: 3,
                end_slice: 5,
                trigger_sequence: 2
            })
        );
    }

    #[test]
    fn exactly_one_contributor_observes_the_seal() {
        // Four workers race their contributions for one (slice, partition);
        // across repeated runs exactly one of them sees the full count and
        // would dispatch the merge task.
        for _run in 0..50 {
            let slice = Arc::new(GlobalSlice::new(Slice::for_index(3, 10), 4));
            let mut handles = Vec::new();
            for _worker in 0..4 {
                let slice = slice.clone();
                handles.push(std::thread::spawn(move || {
                    slice.contribute(PagedHashMap::default()).unwrap()
                }));
            }
            let counts: Vec<usize> = handles
                .into_iter()
                .map(|handle| handle.join().expect("contributor should not panic"))
                .collect();
            assert_eq!(counts.iter().filter(|count| **count == 4).count(), 1);
            assert_eq!(slice.contribution_count(), 4);
        }
    }

    #[test]
    fn partition_gc_drops_expired_slices() {
        let store = GlobalSliceStore::new(2, 64);
        let partition = store.partition(0).unwrap();
        for index in 0..5 {
            partition.slice_or_create(index, 10, 1);
        }
        assert_eq!(partition.open_slices(), 5);

        let context = Context::new_for_test(1);
        partition.remove_slices_below(3, &context.metrics);
        assert_eq!(partition.open_slices(), 2);
        assert!(partition.slice(2).is_none());
        assert!(partition.slice(3).is_some());

        // Dropping again is harmless.
        partition.remove_slices_below(3, &context.metrics);
        assert_eq!(partition.open_slices(), 2);
    }
}
