// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The windowed aggregation operator: a build stage pre-aggregating into
//! thread-local slices, a merge stage folding sealed contribution lists, and
//! a trigger stage emitting finished windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::TupleBuffer;
use crate::buffer_pool::PagePool;
use crate::context::Context;
use crate::error::{StreamError, StreamResult};
use crate::metrics::Metrics;
use crate::pipeline::{
    ExecutablePipelineStage, ExecutionStatus, PipelineExecutionContext, WorkerContext,
};
use crate::record::{
    decode_task, AggregateInput, PartitionMergeTask, WindowAggregateTask, WindowResult,
};
use crate::slice::{hash_key, slice_index_for, PagedHashMap};
use crate::slice_store::{GlobalSliceStore, ThreadLocalSliceStore};
use crate::watermark::WatermarkProcessor;
use crate::window::WindowDefinition;
use streaming_config::Timestamp;

/// Shared state of one windowed aggregation: the thread-local stores, the
/// global slice store, and the watermark discipline binding them together.
pub struct WindowOperatorHandler {
    definition: WindowDefinition,
    slice_size: u64,
    worker_count: usize,
    partitions: usize,
    /// One store per worker. The mutex is a formality: only the owning worker
    /// ever locks its slot.
    thread_local: Vec<Mutex<ThreadLocalSliceStore<PagedHashMap>>>,
    global: GlobalSliceStore,
    watermark: WatermarkProcessor,
    /// Exclusive upper bound of slice indices any worker has opened. Caps the
    /// dense flush range, which matters once the watermark jumps to the
    /// end-of-stream value.
    open_bound: AtomicU64,
    page_pool: PagePool,
    metrics: Arc<Metrics>,
}

impl WindowOperatorHandler {
    pub fn new(context: &Context, definition: WindowDefinition, page_pool: PagePool) -> Self {
        let worker_count = context.parameters.worker_threads;
        let partitions = context.parameters.partitions;
        let slice_size = definition.window.slice_size();
        let log_capacity = context.parameters.watermark_log_capacity;
        Self {
            watermark: WatermarkProcessor::new(&definition.origins, log_capacity),
            thread_local: (0..worker_count)
                .map(|_| Mutex::new(ThreadLocalSliceStore::new(partitions)))
                .collect(),
            global: GlobalSliceStore::new(partitions, log_capacity),
            definition,
            slice_size,
            worker_count,
            partitions,
            open_bound: AtomicU64::new(0),
            page_pool,
            metrics: context.metrics.clone(),
        }
    }

    pub fn definition(&self) -> &WindowDefinition {
        &self.definition
    }

    /// Slice indices strictly below this bound are complete under the given
    /// watermark (their end lies strictly before it). Capped by the open
    /// bound so an end-of-stream watermark flushes a finite range.
    fn flush_boundary(&self, watermark: Timestamp) -> u64 {
        let by_watermark = watermark.div_ceil(self.slice_size).saturating_sub(1);
        by_watermark.min(self.open_bound.load(Ordering::Acquire))
    }

    /// Hands every complete thread-local slice to the global store, densely
    /// from the store's flush cursor. The W-th contribution to a
    /// `(slice, partition)` dispatches its merge task.
    fn flush_worker(
        &self,
        store: &mut ThreadLocalSliceStore<PagedHashMap>,
        new_watermark: Timestamp,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let boundary = self.flush_boundary(new_watermark);
        for (slice_index, states) in store.drain_until(boundary) {
            for (partition_index, state) in states.into_iter().enumerate() {
                let partition = self.global.partition(partition_index as u64)?;
                let slice =
                    partition.slice_or_create(slice_index, self.slice_size, self.worker_count);
                let contributions = slice.contribute(state)?;
                if contributions == self.worker_count {
                    trace!(slice_index, partition_index, "slice sealed, dispatching merge");
                    self.dispatch_merge_task(slice_index, partition_index as u64, ctx)?;
                }
            }
        }
        store.last_local_watermark = new_watermark;
        Ok(())
    }

    /// Failing to emit a merge task would wedge the trigger chain, so pool
    /// exhaustion here fails the query instead of blocking.
    fn dispatch_merge_task(
        &self,
        slice_index: u64,
        partition_index: u64,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let mut buffer = ctx.try_allocate_buffer().ok_or_else(|| {
            StreamError::ResourceExhausted(format!(
                "no buffer for merge task of slice {slice_index} partition {partition_index}"
            ))
        })?;
        let task = PartitionMergeTask {
            slice_index,
            partition_index,
        };
        task.write(buffer.payload_mut(), 0);
        let metadata = buffer.metadata_mut();
        metadata.tuple_count = 1;
        metadata.record_size = PartitionMergeTask::SIZE as u32;
        self.metrics.merge_tasks_dispatched.inc();
        ctx.dispatch(buffer)
    }

    /// Drops all operator state. Called on query teardown.
    fn clear(&self) {
        for store in &self.thread_local {
            store.lock().clear();
        }
        self.global.clear();
    }
}

/// Build stage: ingests tuples into the worker's thread-local slice store and
/// drives the watermark.
pub struct PreAggregationStage {
    handler: Arc<WindowOperatorHandler>,
}

impl PreAggregationStage {
    pub fn new(handler: Arc<WindowOperatorHandler>) -> Self {
        Self { handler }
    }
}

impl ExecutablePipelineStage for PreAggregationStage {
    fn name(&self) -> &'static str {
        "window_build"
    }

    fn setup(&self, ctx: &PipelineExecutionContext) -> StreamResult<()> {
        if ctx.worker_count() != self.handler.worker_count {
            return Err(StreamError::Internal(format!(
                "operator state sized for {} workers, pool has {}",
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
        let mut store = handler.thread_local[store_index].lock();
        // Adopt the current global watermark before ingesting, so a worker
        // that has not flushed recently still drops tuples behind slices
        // other workers already sealed.
        store.last_local_watermark = store
            .last_local_watermark
            .max(handler.watermark.global());

        let metadata = buffer.metadata();
        let payload = buffer.payload();
        let aggregate = handler.definition.aggregate;
        let (first_record, parked_watermark) =
            store.resume_ingest(metadata.origin_id, metadata.sequence_number);
        let mut current_watermark: Timestamp = parked_watermark;
        for index in first_record..buffer.tuple_count() {
            let record = AggregateInput::read(payload, index);
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
            if let Err(error) = store.partition_mut(slice_index, partition).upsert(
                &handler.page_pool,
                record.key,
                aggregate.lift(record.value),
                &aggregate,
            ) {
                // Running out of pages mid-buffer is backpressure, not a
                // query failure: park the ingest position and yield. The
                // pool refills as triggered slices drop.
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

        // Every buffer updates the processor, keeping the origin's sequence
        // prefix contiguous even when all its tuples were late.
        let update = handler.watermark.update(
            current_watermark,
            metadata.sequence_number,
            metadata.origin_id,
        )?;
        handler
            .metrics
            .global_watermark
            .set(update.current.min(i64::MAX as u64) as i64);
        if update.current > store.last_local_watermark {
            handler.flush_worker(&mut store, update.current, ctx)?;
        }
        Ok(ExecutionStatus::Ok)
    }

    /// End-of-input: hand the remaining open slices of this worker's store to
    /// the global store under the final watermark.
    fn flush(
        &self,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let store_index = worker.index() as usize % handler.worker_count;
        let mut store = handler.thread_local[store_index].lock();
        let global = handler.watermark.global();
        if global > store.last_local_watermark {
            handler.flush_worker(&mut store, global, ctx)?;
        }
        Ok(ExecutionStatus::Ok)
    }

    fn close(&self, _ctx: &PipelineExecutionContext) -> StreamResult<()> {
        self.handler.clear();
        Ok(())
    }
}

/// Merge stage: folds a sealed contribution list into the slice's merged
/// state and advances the trigger chain.
pub struct SliceMergeStage {
    handler: Arc<WindowOperatorHandler>,
}

impl SliceMergeStage {
    pub fn new(handler: Arc<WindowOperatorHandler>) -> Self {
        Self { handler }
    }
}

impl ExecutablePipelineStage for SliceMergeStage {
    fn name(&self) -> &'static str {
        "window_merge"
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let task = decode_task(buffer, PartitionMergeTask::read, PartitionMergeTask::SIZE)?;
        let partition = handler.global.partition(task.partition_index)?;
        let slice = partition.slice(task.slice_index).ok_or_else(|| {
            StreamError::Internal(format!(
                "merge task for unknown slice {} partition {}",
                task.slice_index, task.partition_index
            ))
        })?;
        slice.merge(&handler.page_pool, &handler.definition.aggregate)?;

        // Record the completed merge; the committed prefix of this log is the
        // range of slices safe to trigger.
        partition
            .merged_log
            .insert(task.slice_index + 1, task.slice_index + 1)?;
        let sealed = partition.merged_log.committed_sequence();
        if let Some(claim) = partition.try_claim_trigger(sealed)? {
            let mut out = ctx.try_allocate_buffer().ok_or_else(|| {
                StreamError::ResourceExhausted(format!(
                    "no buffer for window task of partition {}",
                    task.partition_index
                ))
            })?;
            let window_task = WindowAggregateTask {
                partition_index: task.partition_index,
                start_slice: claim.start_slice,
                end_slice: claim.end_slice,
                trigger_sequence: claim.trigger_sequence,
            };
            window_task.write(out.payload_mut(), 0);
            let metadata = out.metadata_mut();
            metadata.tuple_count = 1;
            metadata.record_size = WindowAggregateTask::SIZE as u32;
            handler.metrics.window_tasks_dispatched.inc();
            ctx.dispatch(out)?;
        }
        Ok(ExecutionStatus::Ok)
    }
}

/// Trigger stage: folds merged slices into windows, emits the results, and
/// garbage-collects slices behind the trigger watermark.
pub struct WindowTriggerStage {
    handler: Arc<WindowOperatorHandler>,
}

impl WindowTriggerStage {
    pub fn new(handler: Arc<WindowOperatorHandler>) -> Self {
        Self { handler }
    }
}

impl ExecutablePipelineStage for WindowTriggerStage {
    fn name(&self) -> &'static str {
        "window_trigger"
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        let handler = &self.handler;
        let task = decode_task(buffer, WindowAggregateTask::read, WindowAggregateTask::SIZE)?;
        let partition = handler.global.partition(task.partition_index)?;
        let aggregate = handler.definition.aggregate;
        let slices_per_window = handler.definition.window.slices_per_window();

        let mut out: Option<TupleBuffer> = None;
        let mut written = 0usize;
        let mut chunk = 0u64;
        let mut last_window_end = 0;
        for slice_index in task.start_slice..task.end_slice {
            let (window_start, window_end) =
                handler.definition.window.window_ending_at(slice_index);
            last_window_end = window_end;
            let first_slice = slice_index.saturating_sub(slices_per_window - 1);

            let mut window_state = PagedHashMap::default();
            for index in first_slice..=slice_index {
                let Some(slice) = partition.slice(index) else {
                    continue;
                };
                let Some(merged) = slice.merged() else {
                    continue;
                };
                for (key, partial) in merged.iter() {
                    window_state.upsert(&handler.page_pool, key, partial, &aggregate)?;
                }
            }
            if window_state.is_empty() {
                continue;
            }
            handler.metrics.windows_emitted.inc();
            for (key, partial) in window_state.iter() {
                let buffer = out.get_or_insert_with(|| worker.allocate_buffer());
                let record = WindowResult {
                    window_start,
                    window_end,
                    key,
                    value: aggregate.lower(partial),
                };
                record.write(buffer.payload_mut(), written);
                written += 1;
                if written == buffer.record_capacity(WindowResult::SIZE) {
                    let full = out.take().expect("buffer was just written");
                    self.emit_chunk(full, written, chunk, false, last_window_end, &task, ctx)?;
                    written = 0;
                    chunk += 1;
                }
            }
        }
        if let Some(buffer) = out.take() {
            if written > 0 {
                self.emit_chunk(buffer, written, chunk, true, last_window_end, &task, ctx)?;
            }
        }

        // Advance the trigger watermark and drop slices no future window can
        // reference. Sliding windows keep a tail of merged slices alive.
        partition.gc_log.insert(task.trigger_sequence, task.end_slice)?;
        let triggered_bound = partition.gc_log.committed_value();
        partition.remove_slices_below(
            triggered_bound.saturating_sub(slices_per_window - 1),
            &handler.metrics,
        );
        Ok(ExecutionStatus::Ok)
    }
}

impl WindowTriggerStage {
    fn emit_chunk(
        &self,
        mut buffer: TupleBuffer,
        written: usize,
        chunk: u64,
        last_chunk: bool,
        window_end: Timestamp,
        task: &WindowAggregateTask,
        ctx: &PipelineExecutionContext,
    ) -> StreamResult<()> {
        let metadata = buffer.metadata_mut();
        metadata.origin_id = task.partition_index;
        metadata.sequence_number = task.trigger_sequence;
        metadata.chunk_number = chunk;
        metadata.last_chunk = last_chunk;
        metadata.tuple_count = written as u32;
        metadata.record_size = WindowResult::SIZE as u32;
        metadata.watermark = window_end;
        metadata.creation_timestamp = window_end;
        ctx.emit(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateKind;
    use crate::buffer_pool::BufferPool;
    use std::sync::Weak;
    use streaming_config::Parameters;

    #[test]
    fn page_exhaustion_parks_the_build_and_resumes() {
        // One partition, 4-slot pages, 3 pages total: growing the map from
        // one page to two needs three pages in circulation, so the third key
        // cannot land while the test still holds a page.
        let context = Context::new_for_test(1).with_parameters(Parameters {
            worker_threads: 1,
            partitions: 1,
            page_entries: 4,
            page_limit: 3,
            ..Default::default()
        });
        let page_pool = PagePool::new(&context);
        let buffer_pool = BufferPool::new(&context);
        let definition = WindowDefinition::tumbling(10, AggregateKind::Sum, vec![0]);
        let handler = Arc::new(WindowOperatorHandler::new(
            &context,
            definition,
            page_pool.clone(),
        ));
        let stage = PreAggregationStage::new(handler.clone());
        let ctx =
            PipelineExecutionContext::new(Weak::new(), 0, Some(1), None, buffer_pool.clone(), 1);
        let mut worker = WorkerContext::new(0, buffer_pool.clone());

        let mut buffer = buffer_pool.acquire();
        for key in 1..=3u64 {
            AggregateInput {
                key,
                value: key * 10,
                timestamp: key,
            }
            .write(buffer.payload_mut(), key as usize - 1);
        }
        let metadata = buffer.metadata_mut();
        metadata.origin_id = 0;
        metadata.sequence_number = 1;
        metadata.tuple_count = 3;
        metadata.record_size = AggregateInput::SIZE as u32;

        let parked = page_pool.allocate().expect("first page");
        assert_eq!(
            stage.execute(&buffer, &ctx, &mut worker).unwrap(),
            ExecutionStatus::BackpressureRetry
        );
        // A retry under the same pressure parks again without re-applying
        // the prefix.
        assert_eq!(
            stage.execute(&buffer, &ctx, &mut worker).unwrap(),
            ExecutionStatus::BackpressureRetry
        );
        {
            let mut store = handler.thread_local[0].lock();
            assert_eq!(store.partition_mut(0, 0).get(1), Some((10, 0)));
            assert_eq!(store.partition_mut(0, 0).get(2), Some((20, 0)));
            assert_eq!(store.partition_mut(0, 0).get(3), None);
        }

        // Freeing a page lets the retry finish, each key applied exactly
        // once.
        drop(parked);
        assert_eq!(
            stage.execute(&buffer, &ctx, &mut worker).unwrap(),
            ExecutionStatus::Ok
        );
        let mut store = handler.thread_local[0].lock();
        assert_eq!(store.partition_mut(0, 0).get(1), Some((10, 0)));
        assert_eq!(store.partition_mut(0, 0).get(2), Some((20, 0)));
        assert_eq!(store.partition_mut(0, 0).get(3), Some((30, 0)));
    }

    #[test]
    fn flush_boundary_is_strict_and_capped_by_open_slices() {
        let context = Context::new_for_test(2);
        let pool = PagePool::new(&context);
        let definition = WindowDefinition::tumbling(10, AggregateKind::Sum, vec![0]);
        let handler = WindowOperatorHandler::new(&context, definition, pool);
        handler.open_bound.store(3, Ordering::Release);

        // A slice flushes only once the watermark strictly passes its end.
        assert_eq!(handler.flush_boundary(0), 0);
        assert_eq!(handler.flush_boundary(9), 0);
        assert_eq!(handler.flush_boundary(10), 0);
        assert_eq!(handler.flush_boundary(11), 1);
        assert_eq!(handler.flush_boundary(20), 1);
        assert_eq!(handler.flush_boundary(21), 2);
        // The end-of-stream watermark flushes exactly the opened range.
        assert_eq!(handler.flush_boundary(u64::MAX), 3);
    }
}
