// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The streaming hash join: per-side build stages appending into partitioned
//! slice pages, and a probe stage that fires once a window is complete on
//! both sides.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::TupleBuffer;
use crate::buffer_pool::{PageEntry, PagePool};
use crate::context::Context;
use crate::error::{StreamError, StreamResult};
use crate::metrics::Metrics;
use crate::pipeline::{
    ExecutablePipelineStage, ExecutionStatus, PipelineExecutionContext, WorkerContext,
};
use crate::record::{decode_task, JoinInput, JoinProbeTask, JoinResult};
use crate::slice::{hash_key, slice_index_for, PartitionPages, Slice};
use crate::slice_store::ThreadLocalSliceStore;
use crate::watermark::WatermarkProcessor;
use streaming_config::{OriginId, Timestamp};

/// The two build sides of the join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    fn index(&self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }
}

/// Static description of an equijoin over tumbling windows: the window size
/// (one window per slice), the origin set per side, and the build-side
/// lateness tolerance.
#[derive(Clone, Debug)]
pub struct JoinDefinition {
    pub window_size: u64,
    pub left_origins: Vec<OriginId>,
    pub right_origins: Vec<OriginId>,
    pub allowed_lateness: u64,
}

impl JoinDefinition {
    pub fn new(window_size: u64, left_origins: Vec<OriginId>, right_origins: Vec<OriginId>) -> Self {
        Self {
            window_size,
            left_origins,
            right_origins,
            allowed_lateness: 0,
        }
    }
}

/// One side of a join slice: worker contributions of partitioned pages.
struct JoinSideState {
    contributions: Box<[OnceLock<Vec<PartitionPages>>]>,
    /// Slots handed out to contributors.
    claimed: AtomicUsize,
    /// Contributions fully published; the seal check must use this counter,
    /// not the slot claims, so the probe never reads a half-written side.
    completed: AtomicUsize,
}

impl JoinSideState {
    fn new(worker_count: usize) -> Self {
        Self {
            contributions: (0..worker_count)
                .map(|_| OnceLock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            claimed: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    fn contribute(&self, state: Vec<PartitionPages>) -> StreamResult<usize> {
        let slot = self.claimed.fetch_add(1, Ordering::AcqRel);
        if slot >= self.contributions.len() {
            return Err(StreamError::Internal(
                "join side received more contributions than workers".to_string(),
            ));
        }
        if self.contributions[slot].set(state).is_err() {
            return Err(StreamError::Internal(format!(
                "join contribution slot {slot} claimed twice"
            )));
        }
        Ok(self.completed.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn is_sealed(&self) -> bool {
        self.completed.load(Ordering::Acquire) == self.contributions.len()
    }

    /// Records of one partition, in worker-slot then insertion order.
    fn partition_records(&self, partition: usize) -> impl Iterator<Item = &PageEntry> + '_ {
        self.contributions
            .iter()
            .filter_map(|slot| slot.get())
            .flat_map(move |partitions| partitions[partition].iter())
    }

    fn partition_is_empty(&self, partition: usize) -> bool {
        self.partition_records(partition).next().is_none()
    }
}

/// Shared state of one join window (= one slice): both sides' contributions
/// plus the completion bookkeeping that protects slice teardown.
struct JoinSlice {
    slice: Slice,
    sides: [JoinSideState; 2],
    probe_dispatched: AtomicBool,
    completed_partitions: AtomicUsize,
}

impl JoinSlice {
    fn new(slice: Slice, worker_count: usize) -> Self {
        Self {
            slice,
            sides: [
                JoinSideState::new(worker_count),
                JoinSideState::new(worker_count),
            ],
            probe_dispatched: AtomicBool::new(false),
            completed_partitions: AtomicUsize::new(0),
        }
    }
}

/// Shared state of one streaming hash join.
pub struct JoinOperatorHandler {
    definition: JoinDefinition,
    slice_size: u64,
    worker_count: usize,
    partitions: usize,
    /// Thread-local build state, indexed by side then worker.
    locals: [Vec<Mutex<ThreadLocalSliceStore<PartitionPages>>>; 2],
    slices: DashMap<u64, Arc<JoinSlice>>,
    /// One processor across both sides' origins: a window is only complete
    /// once every input stream has passed it.
    watermark: WatermarkProcessor,
    open_bound: AtomicU64,
    page_pool: PagePool,
    metrics: Arc<Metrics>,
}

impl JoinOperatorHandler {
    pub fn new(context: &Context, definition: JoinDefinition, page_pool: PagePool) -> Self {
        let worker_count = context.parameters.worker_threads;
        let partitions = context.parameters.partitions;
        let mut origins = definition.left_origins.clone();
        origins.extend(&definition.right_origins);
        let make_side = |worker_count: usize, partitions: usize| {
            (0..worker_count)
                .map(|_| Mutex::new(ThreadLocalSliceStore::new(partitions)))
                .collect::<Vec<_>>()
        };
        Self {
            watermark: WatermarkProcessor::new(
                &origins,
                context.parameters.watermark_log_capacity,
            ),
            locals: [
                make_side(worker_count, partitions),
                make_side(worker_count, partitions),
            ],
            slices: DashMap::new(),
            slice_size: definition.window_size,
            worker_count,
            partitions,
            definition,
            open_bound: AtomicU64::new(0),
            page_pool,
            metrics: context.metrics.clone(),
        }
    }

    fn flush_boundary(&self, watermark: Timestamp) -> u64 {
        let by_watermark = watermark.div_ceil(self.slice_size).saturating_sub(1);
        by_watermark.min(self.open_bound.load(Ordering::Acquire))
    }

    fn slice_or_create(&self, index: u64) -> Arc<JoinSlice> {
        self.slices
            .entry(index)
            .or_insert_with(|| {
                Arc::new(JoinSlice::new(
                    Slice::for_index(index, self.slice_size),
                    self.worker_count,
                ))
            })
            .value()
            .clone()
    }

    /// Hands this worker's complete slices of one side to the shared store.
    /// Whoever completes the second side of a slice dispatches its probe
    /// tasks, one per partition.
    fn flush_worker(
        &self,
        side: JoinSide,
        store: &mut ThreadLocalSliceStore<PartitionPages>,
        new_watermark: Timestamp,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let boundary = self.flush_boundary(new_watermark);
        for (slice_index, state) in store.drain_until(boundary) {
            let slice = self.slice_or_create(slice_index);
            slice.sides[side.index()].contribute(state)?;
            if slice.sides[0].is_sealed()
                && slice.sides[1].is_sealed()
                && !slice.probe_dispatched.swap(true, Ordering::AcqRel)
            {
                trace!(slice_index, "join window sealed on both sides");
                for partition in 0..self.partitions {
                    self.dispatch_probe_task(&slice, slice_index, partition as u64, ctx)?;
                }
            }
        }
        store.last_local_watermark = new_watermark;
        Ok(())
    }

    fn dispatch_probe_task(
        &self,
        slice: &JoinSlice,
        slice_index: u64,
        partition_index: u64,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let mut buffer = ctx.try_allocate_buffer().ok_or_else(|| {
            StreamError::ResourceExhausted(format!(
                "no buffer for probe task of slice {slice_index} partition {partition_index}"
            ))
        })?;
        let task = JoinProbeTask {
            window_start: slice.slice.start,
            window_end: slice.slice.end,
            partition_index,
            left_slice: slice_index,
            right_slice: slice_index,
        };
        task.write(buffer.payload_mut(), 0);
        let metadata = buffer.metadata_mut();
        metadata.tuple_count = 1;
        metadata.record_size = JoinProbeTask::SIZE as u32;
        self.metrics.probe_tasks_dispatched.inc();
        ctx.dispatch(buffer)
    }

    /// Marks one partition of a slice probed. The observer of the final
    /// partition tears the slice down on both sides; the atomic counter is
    /// what makes the teardown safe against concurrent probes.
    fn complete_partition(&self, slice_index: u64, slice: &JoinSlice) {
        let completed = slice.completed_partitions.fetch_add(1, Ordering::AcqRel) + 1;
        if completed == self.partitions {
            self.slices.remove(&slice_index);
            self.metrics.slices_dropped.inc();
            trace!(slice_index, "join slice garbage collected");
        }
    }

    fn clear(&self) {
        for side in &self.locals {
            for store in side {
                store.lock().clear();
            }
        }
        self.slices.clear();
    }
}

/// Build stage for one side of the join.
pub struct JoinBuildStage {
    handler: Arc<JoinOperatorHandler>,
    side: JoinSide,
}

impl JoinBuildStage {
    pub fn new(handler: Arc<JoinOperatorHandler>, side: JoinSide) -> Self {
        Self { handler, side }
    }
}

impl ExecutablePipelineStage for JoinBuildStage {
    fn name(&self) -> &'static str {
        match self.side {
            JoinSide::Left => "join_build_left",
            JoinSide::Right => "join_build_right",
        }
    }

    fn setup(&self, ctx: &PipelineExecutionContext) -> StreamResult<()> {
        if ctx.worker_count() != self.handler.worker_count {
            return Err(StreamError::Internal(format!(
                "join state sized for {} workers, pool has {}",
                self.handler.worker_count,
                ctx.worker_count()
            )));
        }
        Ok(())
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let store_index = worker.index() as usize % handler.worker_count;
        let mut store = handler.locals[self.side.index()][store_index].lock();
        // Adopt the current global watermark before ingesting, so a worker
        // that has not flushed recently still drops tuples behind slices
        // other workers already sealed.
        store.last_local_watermark = store
            .last_local_watermark
            .max(handler.watermark.global());

        let metadata = buffer.metadata();
        let payload = buffer.payload();
        let (first_record, parked_watermark) =
            store.resume_ingest(metadata.origin_id, metadata.sequence_number);
        let mut current_watermark: Timestamp = parked_watermark;
        for index in first_record..buffer.tuple_count() {
            let record = JoinInput::read(payload, index);
            if record.timestamp < store.last_local_watermark {
                handler.metrics.tuples_dropped_late.inc();
                continue;
            }
            current_watermark = current_watermark
                .max(record.timestamp.saturating_sub(handler.definition.allowed_lateness));
            let slice_index = slice_index_for(record.timestamp, handler.slice_size);
            handler
                .open_bound
                .fetch_max(slice_index + 1, Ordering::AcqRel);
            let partition = (hash_key(record.key) % handler.partitions as u64) as usize;
            if let Err(error) = store.partition_mut(slice_index, partition).push(
                &handler.page_pool,
                PageEntry {
                    key: record.key,
                    value: record.payload,
                    aux: record.timestamp,
                },
            ) {
                // Running out of pages mid-buffer is backpressure, not a
                // query failure: park the ingest position and yield. The
                // pool refills as probed windows drop.
                if matches!(&error, StreamError::ResourceExhausted(_)) {
                    store.park_ingest(
                        metadata.origin_id,
                        metadata.sequence_number,
                        index,
                        current_watermark,
                    );
                    return Ok(ExecutionStatus::BackpressureRetry);
                }
                return Err(error);
            }
        }
        if metadata.end_of_stream {
            current_watermark = metadata.watermark;
        }

        let update = handler.watermark.update(
            current_watermark,
            metadata.sequence_number,
            metadata.origin_id,
        )?;
        if update.current > store.last_local_watermark {
            handler.flush_worker(self.side, &mut store, update.current, ctx)?;
        }
        Ok(ExecutionStatus::Ok)
    }

    fn flush(
        &self,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let store_index = worker.index() as usize % handler.worker_count;
        let mut store = handler.locals[self.side.index()][store_index].lock();
        let global = handler.watermark.global();
        if global > store.last_local_watermark {
            handler.flush_worker(self.side, &mut store, global, ctx)?;
        }
        Ok(ExecutionStatus::Ok)
    }

    fn close(&self, _ctx: &PipelineExecutionContext) -> StreamResult<()> {
        self.handler.clear();
        Ok(())
    }
}

/// Probe stage: equijoins one partition of a sealed window and emits the
/// concatenated records with the window bounds prepended.
pub struct JoinProbeStage {
    handler: Arc<JoinOperatorHandler>,
}

impl JoinProbeStage {
    pub fn new(handler: Arc<JoinOperatorHandler>) -> Self {
        Self { handler }
    }
}

impl ExecutablePipelineStage for JoinProbeStage {
    fn name(&self) -> &'static str {
        "join_probe"
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let task = decode_task(buffer, JoinProbeTask::read, JoinProbeTask::SIZE)?;
        let slice = handler
            .slices
            .get(&task.left_slice)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                StreamError::Internal(format!(
                    "probe task for vanished slice {}",
                    task.left_slice
                ))
            })?;
        let partition = task.partition_index as usize;
        let (left, right) = (&slice.sides[0], &slice.sides[1]);

        if left.partition_is_empty(partition) || right.partition_is_empty(partition) {
            self.handler.complete_partition(task.left_slice, &slice);
            return Ok(ExecutionStatus::Ok);
        }

        let mut out: Option<TupleBuffer> = None;
        let mut written = 0usize;
        let mut chunk = 0u64;
        // Left-scan order outermost; within one left record, matches follow
        // right insertion order.
        for left_record in left.partition_records(partition) {
            for right_record in right.partition_records(partition) {
                if left_record.key != right_record.key {
                    continue;
                }
                let buffer = out.get_or_insert_with(|| worker.allocate_buffer());
                let record = JoinResult {
                    window_start: task.window_start,
                    window_end: task.window_end,
                    key: left_record.key,
                    left_payload: left_record.value,
                    right_payload: right_record.value,
                };
                record.write(buffer.payload_mut(), written);
                written += 1;
                handler.metrics.join_matches.inc();
                if written == buffer.record_capacity(JoinResult::SIZE) {
                    let full = out.take().expect("buffer was just written");
                    self.emit_chunk(full, written, chunk, false, &task, ctx)?;
                    written = 0;
                    chunk += 1;
                }
            }
        }
        if let Some(buffer) = out.take() {
            if written > 0 {
                self.emit_chunk(buffer, written, chunk, true, &task, ctx)?;
            }
        }

        self.handler.complete_partition(task.left_slice, &slice);
        Ok(ExecutionStatus::Ok)
    }
}

impl JoinProbeStage {
    fn emit_chunk(
        &self,
        mut buffer: TupleBuffer,
        written: usize,
        chunk: u64,
        last_chunk: bool,
        task: &JoinProbeTask,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let metadata = buffer.metadata_mut();
        metadata.origin_id = task.partition_index;
        metadata.sequence_number = task.left_slice + 1;
        metadata.chunk_number = chunk;
        metadata.last_chunk = last_chunk;
        metadata.tuple_count = written as u32;
        metadata.record_size = JoinResult::SIZE as u32;
        metadata.watermark = task.window_end;
        metadata.creation_timestamp = task.window_end;
        ctx.emit(buffer)
    }
}
