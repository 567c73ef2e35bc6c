// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferPool;
use crate::context::Context;
use crate::error::StreamError;
use crate::lifecycle::QueryRuntime;
use crate::pipeline::{ExecutionStatus, WorkerContext};

/// One unit of work: a stage of a query plus its input.
pub(crate) struct Task {
    pub query: Arc<QueryRuntime>,
    pub stage_index: usize,
    pub kind: TaskKind,
}

pub(crate) enum TaskKind {
    /// Run the stage kernel over an input buffer.
    Execute(TupleBuffer),
    /// Run the stage's end-of-input flush on this worker.
    Flush,
}

/// How long an idle worker parks before re-scanning the queues. A notify from
/// a producer wakes it earlier.
const IDLE_PARK: Duration = Duration::from_millis(20);

/// The scheduling core shared by workers and task producers.
///
/// Each worker owns a FIFO deque; producers push to the shared injector or,
/// for worker-targeted work (flushes), to a per-worker mailbox that peers
/// cannot steal from. Idle workers steal from the injector first, then from
/// peers.
pub(crate) struct Scheduler {
    injector: Injector<Task>,
    mailboxes: Box<[SegQueue<Task>]>,
    stealers: Vec<Stealer<Task>>,
    idle: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
    context: Context,
    buffer_pool: BufferPool,
}

impl Scheduler {
    pub fn worker_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Enqueues a task on the shared injector. The caller has already
    /// accounted for it in the query's pending-task ledger.
    pub fn submit(&self, task: Task) {
        self.injector.push(task);
        self.notify();
    }

    /// Enqueues a task that must run on one specific worker.
    pub fn submit_to_worker(&self, worker: usize, task: Task) {
        self.mailboxes[worker].push(task);
        self.notify();
    }

    fn notify(&self) {
        // Touch the lock so the notify cannot slip between a worker's
        // re-check and its wait.
        drop(self.idle.lock());
        self.wake.notify_all();
    }
}

/// A fixed pool of named OS threads executing pipeline tasks.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(context: Context, buffer_pool: BufferPool) -> Self {
        let worker_count = context.parameters.worker_threads;
        let queues: Vec<WorkerQueue<Task>> =
            (0..worker_count).map(|_| WorkerQueue::new_fifo()).collect();
        let stealers = queues.iter().map(|queue| queue.stealer()).collect();
        let mailboxes = (0..worker_count)
            .map(|_| SegQueue::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let scheduler = Arc::new(Scheduler {
            injector: Injector::new(),
            mailboxes,
            stealers,
            idle: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            context,
            buffer_pool,
        });

        let threads = queues
            .into_iter()
            .enumerate()
            .map(|(index, queue)| {
                let scheduler = scheduler.clone();
                thread::Builder::new()
                    .name(format!("streaming-worker-{index}"))
                    .spawn(move || run_worker(index, queue, scheduler))
                    .unwrap()
            })
            .collect();

        Self {
            scheduler,
            threads: Mutex::new(threads),
        }
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    /// Stops the workers once their queues are empty and joins them.
    pub fn shutdown(&self) {
        self.scheduler.shutdown.store(true, Ordering::Release);
        self.scheduler.notify();
        for handle in self.threads.lock().drain(..) {
            handle.join().ok();
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, local: WorkerQueue<Task>, scheduler: Arc<Scheduler>) {
    debug!(worker = index, "started worker thread");
    let mut worker_ctx = WorkerContext::new(index as u32, scheduler.buffer_pool.clone());
    loop {
        match find_task(index, &local, &scheduler) {
            Some(task) => process_task(task, &mut worker_ctx, &scheduler),
            None => {
                if scheduler.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let mut guard = scheduler.idle.lock();
                scheduler.wake.wait_for(&mut guard, IDLE_PARK);
            }
        }
    }
    debug!(worker = index, "worker thread exiting");
}

fn find_task(index: usize, local: &WorkerQueue<Task>, scheduler: &Scheduler) -> Option<Task> {
    if let Some(task) = scheduler.mailboxes[index].pop() {
        return Some(task);
    }
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match scheduler.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
    for (peer, stealer) in scheduler.stealers.iter().enumerate() {
        if peer == index {
            continue;
        }
        loop {
            match stealer.steal() {
                Steal::Success(task) => {
                    scheduler.context.metrics.tasks_stolen.inc();
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

fn process_task(task: Task, worker_ctx: &mut WorkerContext, scheduler: &Scheduler) {
    let Task {
        query,
        stage_index,
        kind,
    } = task;
    let metrics = &scheduler.context.metrics;

    // Stopped and failed queries drain their remaining tasks silently.
    if !query.accepts_tasks() {
        metrics.tasks_cancelled.inc();
        query.finish_task();
        return;
    }

    let stage = query.stage(stage_index);
    let timer = metrics.task_execution_seconds.start_timer();
    let result = match &kind {
        TaskKind::Execute(buffer) => stage.stage.execute(buffer, &stage.context, worker_ctx),
        TaskKind::Flush => stage.stage.flush(&stage.context, worker_ctx),
    };
    timer.observe_duration();
    metrics
        .tasks_executed
        .with_label_values(&[stage.stage.name()])
        .inc();

    match result {
        Ok(ExecutionStatus::Ok) => query.finish_task(),
        Ok(ExecutionStatus::BackpressureRetry) => {
            trace!(stage = stage.stage.name(), "task backpressured, re-enqueueing");
            metrics.backpressure_retries.inc();
            // The pending ledger still counts this task. The retry goes back
            // to this worker's own mailbox, not the injector: a parked build
            // task must resume against the same thread-local store.
            thread::yield_now();
            scheduler.submit_to_worker(
                worker_ctx.index() as usize,
                Task {
                    query: query.clone(),
                    stage_index,
                    kind,
                },
            );
        }
        Err(StreamError::Cancelled) => query.finish_task(),
        Err(error) => {
            query.fail(error);
            query.finish_task();
        }
    }
}
