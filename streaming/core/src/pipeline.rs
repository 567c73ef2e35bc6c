// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Weak;

use streaming_config::WorkerIndex;

use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferPool;
use crate::error::{StreamError, StreamResult};
use crate::lifecycle::QueryRuntime;

/// What a successful stage execution tells the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    /// The stage ran out of pooled state mid-task and yielded. The task is
    /// re-enqueued on the same worker; a build stage parks its ingest
    /// position so the retry resumes where it stopped instead of
    /// double-applying records.
    BackpressureRetry,
}

/// A pipeline stage kernel.
///
/// `execute` consumes one input buffer and may hand derived work to the
/// scheduler through the [`PipelineExecutionContext`]. Stages must never
/// block on external I/O; the only sanctioned suspension is a pooled buffer
/// acquisition.
pub trait ExecutablePipelineStage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Called once before the query starts. A failure here fails the query.
    fn setup(&self, _ctx: &PipelineExecutionContext) -> StreamResult<()> {
        Ok(())
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus>;

    /// Invoked on every worker once the query's sources have finished and all
    /// in-flight tasks have drained, so stages can release watermark-held
    /// state. Most stages have nothing to do.
    fn flush(
        &self,
        _ctx: &PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        Ok(ExecutionStatus::Ok)
    }

    /// Called once when the query reaches a terminal state. Best-effort: the
    /// stage may observe partial state after a failure.
    fn close(&self, _ctx: &PipelineExecutionContext) -> StreamResult<()> {
        Ok(())
    }
}

/// Per-thread execution identity plus the thread's buffer provider.
pub struct WorkerContext {
    index: WorkerIndex,
    buffer_provider: BufferPool,
}

impl WorkerContext {
    pub(crate) fn new(index: WorkerIndex, buffer_provider: BufferPool) -> Self {
        Self {
            index,
            buffer_provider,
        }
    }

    pub fn index(&self) -> WorkerIndex {
        self.index
    }

    /// Blocks until a pooled buffer is free.
    pub fn allocate_buffer(&self) -> TupleBuffer {
        self.buffer_provider.acquire()
    }
}

/// Bridges a pipeline stage to its query and worker pool: buffer allocation,
/// downstream dispatch, and the worker count the operator state was sized
/// for.
pub struct PipelineExecutionContext {
    // Upward reference; the runtime owns the stages and their contexts.
    query: Weak<QueryRuntime>,
    stage_index: usize,
    dispatch_to: Option<usize>,
    emit_to: Option<usize>,
    buffer_pool: BufferPool,
    worker_count: usize,
}

impl PipelineExecutionContext {
    pub(crate) fn new(
        query: Weak<QueryRuntime>,
        stage_index: usize,
        dispatch_to: Option<usize>,
        emit_to: Option<usize>,
        buffer_pool: BufferPool,
        worker_count: usize,
    ) -> Self {
        Self {
            query,
            stage_index,
            dispatch_to,
            emit_to,
            buffer_pool,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Blocks until a pooled buffer is free.
    pub fn allocate_buffer(&self) -> TupleBuffer {
        self.buffer_pool.acquire()
    }

    /// Non-blocking allocation for points where exhaustion must fail fast
    /// instead of parking.
    pub fn try_allocate_buffer(&self) -> Option<TupleBuffer> {
        self.buffer_pool.try_acquire()
    }

    /// Enqueues a derived task for this stage's dispatch target.
    pub fn dispatch(&self, buffer: TupleBuffer) -> StreamResult<()> {
        let target = self.dispatch_to.ok_or_else(|| {
            StreamError::Internal(format!("stage {} has no dispatch target", self.stage_index))
        })?;
        let query = self.query.upgrade().ok_or(StreamError::Cancelled)?;
        query.enqueue_execute(target, buffer)
    }

    /// Hands a buffer to the next stage, or to the query's sink when this is
    /// the last stage.
    pub fn emit(&self, buffer: TupleBuffer) -> StreamResult<()> {
        let query = self.query.upgrade().ok_or(StreamError::Cancelled)?;
        match self.emit_to {
            Some(stage) => query.enqueue_execute(stage, buffer),
            None => query.deliver_to_sink(buffer),
        }
    }
}
