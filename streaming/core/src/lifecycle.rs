// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferPool;
use crate::context::Context;
use crate::error::{StreamError, StreamResult};
use crate::pipeline::{ExecutablePipelineStage, PipelineExecutionContext};
use crate::sink::{spawn_sink, Sink};
use crate::source::{spawn_source, Source};
use crate::worker_pool::{Scheduler, Task, TaskKind, WorkerPool};
use streaming_config::QueryId;

/// User-visible state of a query. `SoftStopRequested` is the draining phase
/// between a soft stop and `Stopped`.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum QueryStatus {
    Registered,
    Scheduled,
    Running,
    SoftStopRequested,
    Stopped,
    Failed(String),
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Stopped | QueryStatus::Failed(_))
    }
}

/// How to stop a running query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Sources stop producing and pipelines drain before the query stops.
    Soft,
    /// In-flight buffers are discarded.
    Hard,
}

/// Outcome of a stop request. Stopping a query that is already on its way
/// down is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    Stopping,
    AlreadyStopping,
    AlreadyStopped,
}

/// One stage of a compiled pipeline graph: the kernel plus its edges.
/// `dispatch_to` receives derived tasks, `emit_to` receives emitted buffers;
/// an absent `emit_to` routes emissions to the query's sink.
pub struct StageSpec {
    pub stage: Arc<dyn ExecutablePipelineStage>,
    pub dispatch_to: Option<usize>,
    pub emit_to: Option<usize>,
}

pub struct SourceSpec {
    pub source: Box<dyn Source>,
    /// Index of the stage that receives this source's buffers.
    pub entry_stage: usize,
}

/// A compiled pipeline graph ready for registration.
pub struct QuerySpec {
    pub stages: Vec<StageSpec>,
    pub sources: Vec<SourceSpec>,
    pub sink: Box<dyn Sink>,
}

pub(crate) struct StageRuntime {
    pub stage: Arc<dyn ExecutablePipelineStage>,
    pub context: PipelineExecutionContext,
}

/// The running half of a registered query: its stages, status, and the
/// counters that drive draining and teardown.
pub(crate) struct QueryRuntime {
    pub id: QueryId,
    context: Context,
    scheduler: Arc<Scheduler>,
    stages: Vec<StageRuntime>,
    status: Mutex<QueryStatus>,
    status_changed: Condvar,
    /// Tasks enqueued but not yet finished, across all stages.
    pending_tasks: AtomicUsize,
    /// Sources that have emitted their end-of-stream buffer.
    sources_finished: AtomicUsize,
    source_count: usize,
    /// Set once the end-of-input flush has been broadcast to all workers.
    flush_broadcast: AtomicBool,
    /// Set by a hard stop: workers drop tasks instead of executing them.
    discard_tasks: AtomicBool,
    /// Signals source threads to stop producing.
    pub(crate) source_stop: Arc<AtomicBool>,
    sink_sender: Mutex<Option<SyncSender<TupleBuffer>>>,
    /// Ensures stages are closed exactly once.
    closed: AtomicBool,
}

impl QueryRuntime {
    pub fn accepts_tasks(&self) -> bool {
        if self.discard_tasks.load(Ordering::Acquire) {
            return false;
        }
        matches!(
            *self.status.lock(),
            QueryStatus::Running | QueryStatus::SoftStopRequested
        )
    }

    pub fn stage(&self, index: usize) -> &StageRuntime {
        &self.stages[index]
    }

    pub fn status(&self) -> QueryStatus {
        self.status.lock().clone()
    }

    /// Enqueues an execute task for `stage_index`, charging the pending
    /// ledger. Returns `Cancelled` (and releases the buffer) once the query
    /// no longer accepts work.
    pub fn enqueue_execute(self: &Arc<Self>, stage_index: usize, buffer: TupleBuffer) -> StreamResult<()> {
        if !self.accepts_tasks() {
            return Err(StreamError::Cancelled);
        }
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
        self.scheduler.submit(Task {
            query: self.clone(),
            stage_index,
            kind: TaskKind::Execute(buffer),
        });
        Ok(())
    }

    /// Called by a source thread after it has emitted its end-of-stream
    /// buffer. Runs the drain check itself in case that buffer has already
    /// been processed and no further task completion will.
    pub fn note_source_finished(self: &Arc<Self>) {
        self.sources_finished.fetch_add(1, Ordering::AcqRel);
        if self.pending_tasks.load(Ordering::Acquire) == 0 {
            self.on_drained();
        }
    }

    pub fn deliver_to_sink(&self, buffer: TupleBuffer) -> StreamResult<()> {
        let sender = self.sink_sender.lock().clone();
        match sender {
            // A full channel blocks here; that is the sink's backpressure.
            Some(sender) => sender.send(buffer).map_err(|_| StreamError::Cancelled),
            None => Err(StreamError::Cancelled),
        }
    }

    pub fn discards_tasks(&self) -> bool {
        self.discard_tasks.load(Ordering::Acquire)
    }

    /// Marks one task finished and drives the drain state machine when the
    /// ledger empties.
    pub fn finish_task(self: &Arc<Self>) {
        let remaining = self.pending_tasks.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.on_drained();
        }
    }

    fn on_drained(self: &Arc<Self>) {
        // Drain decisions are serialized under the status lock so the flush
        // accounting and the terminal check cannot interleave. Transitions
        // are short.
        let status = self.status.lock();
        if status.is_terminal() || self.discard_tasks.load(Ordering::Acquire) {
            drop(status);
            self.finalize();
            return;
        }
        if self.sources_finished.load(Ordering::Acquire) < self.source_count {
            // Input is still flowing; nothing to do on a momentary lull.
            return;
        }
        if !self.flush_broadcast.swap(true, Ordering::AcqRel) {
            let workers = self.scheduler.worker_count();
            let total = workers * self.stages.len();
            self.pending_tasks.fetch_add(total, Ordering::AcqRel);
            drop(status);
            self.broadcast_flush(workers);
            return;
        }
        if self.pending_tasks.load(Ordering::Acquire) == 0 {
            // The flush cascade has drained too: every window that can ever
            // fire has fired.
            drop(status);
            self.finalize();
        }
    }

    /// Sends every stage's flush to every worker. Flushes run against the
    /// final global watermark, handing the last open slices to the global
    /// stores. The pending ledger was charged by the caller.
    fn broadcast_flush(self: &Arc<Self>, workers: usize) {
        debug!(
            query = self.id,
            tasks = workers * self.stages.len(),
            "broadcasting end-of-input flush"
        );
        for worker in 0..workers {
            for stage_index in 0..self.stages.len() {
                self.scheduler.submit_to_worker(
                    worker,
                    Task {
                        query: self.clone(),
                        stage_index,
                        kind: TaskKind::Flush,
                    },
                );
            }
        }
    }

    /// Fails the query. The first error wins; later ones are logged.
    pub fn fail(self: &Arc<Self>, error: StreamError) {
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                debug!(query = self.id, %error, "error after terminal state");
                return;
            }
            warn!(query = self.id, %error, "query failed");
            *status = QueryStatus::Failed(error.to_string());
            self.context.metrics.queries_failed.inc();
        }
        self.status_changed.notify_all();
        self.source_stop.store(true, Ordering::Release);
        if self.pending_tasks.load(Ordering::Acquire) == 0 {
            self.finalize();
        }
    }

    /// Closes stages and the sink exactly once, then settles the terminal
    /// status.
    fn finalize(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for stage in &self.stages {
            if let Err(error) = stage.stage.close(&stage.context) {
                warn!(query = self.id, stage = stage.stage.name(), %error, "stage close failed");
            }
        }
        // Dropping the sender ends the sink thread once it has drained.
        self.sink_sender.lock().take();
        {
            let mut status = self.status.lock();
            if !status.is_terminal() {
                *status = QueryStatus::Stopped;
            }
        }
        info!(query = self.id, status = %self.status(), "query reached terminal state");
        self.status_changed.notify_all();
    }
}

struct QueryEntry {
    runtime: Arc<QueryRuntime>,
    /// Sources and sink, held until `start` consumes them.
    io: Option<(Vec<SourceSpec>, Box<dyn Sink>)>,
}

/// Registers compiled pipeline graphs, starts and stops them, and answers
/// status queries.
pub struct QueryLifecycleManager {
    context: Context,
    scheduler: Arc<Scheduler>,
    buffer_pool: BufferPool,
    queries: Mutex<HashMap<QueryId, QueryEntry>>,
    next_query_id: AtomicU64,
}

impl QueryLifecycleManager {
    pub fn new(context: Context, pool: &WorkerPool, buffer_pool: BufferPool) -> Self {
        Self {
            context,
            scheduler: pool.scheduler().clone(),
            buffer_pool,
            queries: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
        }
    }

    /// Accepts a compiled pipeline graph. The query starts in `Registered`.
    pub fn register(&self, spec: QuerySpec) -> StreamResult<QueryId> {
        let id = self.next_query_id.fetch_add(1, Ordering::AcqRel);
        let QuerySpec {
            stages,
            sources,
            sink,
        } = spec;
        for (index, stage) in stages.iter().enumerate() {
            for target in [stage.dispatch_to, stage.emit_to].into_iter().flatten() {
                if target >= stages.len() {
                    return Err(StreamError::Internal(format!(
                        "stage {index} references missing stage {target}"
                    )));
                }
            }
        }
        for source in &sources {
            if source.entry_stage >= stages.len() {
                return Err(StreamError::Internal(format!(
                    "source {} references missing stage {}",
                    source.source.origin(),
                    source.entry_stage
                )));
            }
        }

        let source_count = sources.len();
        let context = self.context.clone();
        let scheduler = self.scheduler.clone();
        let buffer_pool = self.buffer_pool.clone();
        let worker_count = self.scheduler.worker_count();
        let runtime = Arc::new_cyclic(|weak| QueryRuntime {
            id,
            context,
            scheduler,
            stages: stages
                .into_iter()
                .enumerate()
                .map(|(index, spec)| StageRuntime {
                    context: PipelineExecutionContext::new(
                        weak.clone(),
                        index,
                        spec.dispatch_to,
                        spec.emit_to,
                        buffer_pool.clone(),
                        worker_count,
                    ),
                    stage: spec.stage,
                })
                .collect(),
            status: Mutex::new(QueryStatus::Registered),
            status_changed: Condvar::new(),
            pending_tasks: AtomicUsize::new(0),
            sources_finished: AtomicUsize::new(0),
            source_count,
            flush_broadcast: AtomicBool::new(false),
            discard_tasks: AtomicBool::new(false),
            source_stop: Arc::new(AtomicBool::new(false)),
            sink_sender: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        info!(query = id, stages = runtime.stages.len(), sources = source_count, "registered query");
        self.queries.lock().insert(
            id,
            QueryEntry {
                runtime,
                io: Some((sources, sink)),
            },
        );
        Ok(id)
    }

    /// Accepts the placement for a registered query.
    pub fn schedule(&self, id: QueryId) -> StreamResult<()> {
        let runtime = self.runtime(id)?;
        let mut status = runtime.status.lock();
        match &*status {
            QueryStatus::Registered => {
                *status = QueryStatus::Scheduled;
                drop(status);
                runtime.status_changed.notify_all();
                Ok(())
            }
            other => Err(StreamError::Internal(format!(
                "cannot schedule query {id} in state {other}"
            ))),
        }
    }

    /// Runs every stage's setup, then starts the sink and source threads.
    pub fn start(&self, id: QueryId) -> StreamResult<()> {
        let runtime = self.runtime(id)?;
        {
            let status = runtime.status.lock();
            if *status != QueryStatus::Scheduled {
                return Err(StreamError::Internal(format!(
                    "cannot start query {id} in state {status}"
                )));
            }
        }
        let io = {
            let mut queries = self.queries.lock();
            queries
                .get_mut(&id)
                .and_then(|entry| entry.io.take())
        };
        let Some((sources, sink)) = io else {
            return Err(StreamError::Internal(format!(
                "query {id} was already started"
            )));
        };

        for stage in &runtime.stages {
            if let Err(error) = stage.stage.setup(&stage.context) {
                runtime.fail(error.clone());
                return Err(error);
            }
        }

        let (sender, handle) = spawn_sink(
            id,
            sink,
            Arc::downgrade(&runtime),
            self.context.parameters.sink_channel_depth,
        );
        *runtime.sink_sender.lock() = Some(sender);
        drop(handle);

        {
            let mut status = runtime.status.lock();
            *status = QueryStatus::Running;
        }
        runtime.status_changed.notify_all();

        for source in sources {
            let handle = spawn_source(
                source.source,
                source.entry_stage,
                runtime.clone(),
                self.buffer_pool.clone(),
            );
            drop(handle);
        }
        info!(query = id, "query running");
        Ok(())
    }

    /// Requests a stop. Idempotent: stopping a stopping or stopped query
    /// reports so instead of failing.
    pub fn stop(&self, id: QueryId, mode: StopMode) -> StreamResult<StopSignal> {
        let runtime = self.runtime(id)?;
        let mut status = runtime.status.lock();
        let current = status.clone();
        match (current, mode) {
            (QueryStatus::Stopped | QueryStatus::Failed(_), _) => Ok(StopSignal::AlreadyStopped),
            (QueryStatus::SoftStopRequested, StopMode::Soft) => Ok(StopSignal::AlreadyStopping),
            (QueryStatus::SoftStopRequested, StopMode::Hard)
            | (QueryStatus::Running, StopMode::Hard) => {
                drop(status);
                self.hard_stop(&runtime);
                Ok(StopSignal::Stopping)
            }
            (QueryStatus::Running, StopMode::Soft) => {
                *status = QueryStatus::SoftStopRequested;
                drop(status);
                info!(query = id, "soft stop requested");
                runtime.status_changed.notify_all();
                runtime.source_stop.store(true, Ordering::Release);
                Ok(StopSignal::Stopping)
            }
            (QueryStatus::Registered | QueryStatus::Scheduled, _) => {
                // Never ran, so there is nothing to drain.
                *status = QueryStatus::Stopped;
                drop(status);
                runtime.status_changed.notify_all();
                Ok(StopSignal::Stopping)
            }
        }
    }

    fn hard_stop(&self, runtime: &Arc<QueryRuntime>) {
        info!(query = runtime.id, "hard stop requested");
        runtime.discard_tasks.store(true, Ordering::Release);
        runtime.source_stop.store(true, Ordering::Release);
        if runtime.pending_tasks.load(Ordering::Acquire) == 0 {
            runtime.finalize();
        }
    }

    pub fn status(&self, id: QueryId) -> StreamResult<QueryStatus> {
        Ok(self.runtime(id)?.status())
    }

    /// Waits for a terminal state, bounded by the configured status wait.
    pub fn wait_until_terminal(&self, id: QueryId) -> StreamResult<QueryStatus> {
        self.wait_for_status(id, QueryStatus::is_terminal, self.context.parameters.status_wait)
    }

    /// Blocks until `predicate` holds for the query's status, bounded by
    /// `timeout`.
    pub fn wait_for_status(
        &self,
        id: QueryId,
        predicate: impl Fn(&QueryStatus) -> bool,
        timeout: Duration,
    ) -> StreamResult<QueryStatus> {
        let runtime = self.runtime(id)?;
        let deadline = Instant::now() + timeout;
        let mut status = runtime.status.lock();
        loop {
            if predicate(&status) {
                return Ok(status.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::Timeout(format!(
                    "query {id} still {} after {timeout:?}",
                    &*status
                )));
            }
            runtime
                .status_changed
                .wait_for(&mut status, deadline - now);
        }
    }

    fn runtime(&self, id: QueryId) -> StreamResult<Arc<QueryRuntime>> {
        self.queries
            .lock()
            .get(&id)
            .map(|entry| entry.runtime.clone())
            .ok_or_else(|| StreamError::Internal(format!("unknown query {id}")))
    }
}
