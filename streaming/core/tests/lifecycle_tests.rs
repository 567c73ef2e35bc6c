// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Query lifecycle: graceful and hard stops, stop idempotence, and failure
//! propagation from a stage to the query status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use streaming_config::{OriginId, Parameters};
use streaming_core::{
    AggregateInput, AggregateKind, BufferPool, CollectSink, CollectedBuffer, Context,
    ExecutablePipelineStage, ExecutionStatus, MemoryBatch, MemorySource, PagePool,
    PipelineExecutionContext, PreAggregationStage, QueryLifecycleManager, QuerySpec, QueryStatus,
    SliceMergeStage, Source, SourceContext, SourceSpec, StageSpec, StopMode, StopSignal,
    StreamError, StreamResult, TupleBuffer, WindowDefinition, WindowOperatorHandler, WindowResult,
    WindowTriggerStage, WorkerContext, WorkerPool, test_metrics,
};

struct Harness {
    context: Context,
    page_pool: PagePool,
    pool: WorkerPool,
    manager: QueryLifecycleManager,
}

fn harness(worker_threads: usize) -> Harness {
    let parameters = Parameters {
        worker_threads,
        partitions: 8,
        pooled_buffers: 256,
        buffer_size_bytes: 1024,
        ..Default::default()
    };
    let context = Context::new(parameters, test_metrics());
    let buffer_pool = BufferPool::new(&context);
    let page_pool = PagePool::new(&context);
    let pool = WorkerPool::start(context.clone(), buffer_pool.clone());
    let manager = QueryLifecycleManager::new(context.clone(), &pool, buffer_pool);
    Harness {
        context,
        page_pool,
        pool,
        manager,
    }
}

fn window_query(
    handler: Arc<WindowOperatorHandler>,
    sources: Vec<SourceSpec>,
    sink: CollectSink,
) -> QuerySpec {
    QuerySpec {
        stages: vec![
            StageSpec {
                stage: Arc::new(PreAggregationStage::new(handler.clone())),
                dispatch_to: Some(1),
                emit_to: None,
            },
            StageSpec {
                stage: Arc::new(SliceMergeStage::new(handler.clone())),
                dispatch_to: Some(2),
                emit_to: None,
            },
            StageSpec {
                stage: Arc::new(WindowTriggerStage::new(handler)),
                dispatch_to: None,
                emit_to: None,
            },
        ],
        sources,
        sink: Box::new(sink),
    }
}

/// Emits one single-tuple buffer every couple of milliseconds until told to
/// stop, counting what it managed to deliver.
struct CountingSource {
    origin: OriginId,
    emitted: Arc<AtomicU64>,
}

impl Source for CountingSource {
    fn origin(&self) -> OriginId {
        self.origin
    }

    fn run(&mut self, ctx: &mut SourceContext) -> StreamResult<()> {
        let mut timestamp = 0u64;
        while !ctx.should_stop() {
            let mut buffer = ctx.allocate();
            let record = AggregateInput {
                key: 1,
                value: 1,
                timestamp,
            };
            record.write(buffer.payload_mut(), 0);
            let sequence = ctx.next_sequence();
            let metadata = buffer.metadata_mut();
            metadata.origin_id = self.origin;
            metadata.sequence_number = sequence;
            metadata.watermark = timestamp;
            metadata.creation_timestamp = timestamp;
            metadata.tuple_count = 1;
            metadata.record_size = AggregateInput::SIZE as u32;
            match ctx.emit(buffer) {
                Ok(()) => {
                    self.emitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(StreamError::Cancelled) => break,
                Err(error) => return Err(error),
            }
            timestamp += 1;
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

/// A kernel that fails its first buffer.
struct ExplodingStage;

impl ExecutablePipelineStage for ExplodingStage {
    fn name(&self) -> &'static str {
        "exploding"
    }

    fn execute(
        &self,
        _buffer: &TupleBuffer,
        _ctx: &PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> StreamResult<ExecutionStatus> {
        Err(StreamError::KernelFailure {
            stage: "exploding".to_string(),
            message: "synthetic kernel fault".to_string(),
        })
    }
}

fn window_sum(collected: &Mutex<Vec<CollectedBuffer>>) -> u64 {
    collected
        .lock()
        .iter()
        .flat_map(|buffer| {
            (0..buffer.metadata.tuple_count as usize)
                .map(|index| WindowResult::read(&buffer.payload, index).value)
                .collect::<Vec<_>>()
        })
        .sum()
}

#[test]
fn soft_stop_drains_everything_already_emitted() {
    let harness = harness(2);
    let definition = WindowDefinition::tumbling(5, AggregateKind::Sum, vec![0]);
    let handler = Arc::new(WindowOperatorHandler::new(
        &harness.context,
        definition,
        harness.page_pool.clone(),
    ));
    let (sink, collected) = CollectSink::new();
    let emitted = Arc::new(AtomicU64::new(0));

    let sources = vec![SourceSpec {
        source: Box::new(CountingSource {
            origin: 0,
            emitted: emitted.clone(),
        }),
        entry_stage: 0,
    }];
    let id = harness
        .manager
        .register(window_query(handler, sources, sink))
        .expect("register");
    harness.manager.schedule(id).expect("schedule");
    harness.manager.start(id).expect("start");

    thread::sleep(Duration::from_millis(100));
    let signal = harness.manager.stop(id, StopMode::Soft).expect("stop");
    assert_eq!(signal, StopSignal::Stopping);
    let observed = harness.manager.status(id).expect("status");
    assert!(
        matches!(
            observed,
            QueryStatus::SoftStopRequested | QueryStatus::Stopped
        ),
        "unexpected status after soft stop: {observed:?}"
    );

    let status = harness
        .manager
        .wait_for_status(id, QueryStatus::is_terminal, Duration::from_secs(20))
        .expect("drain should complete");
    assert_eq!(status, QueryStatus::Stopped);

    // Every tuple the source delivered before observing the stop made it
    // through to the sink.
    let delivered = emitted.load(Ordering::Relaxed);
    assert!(delivered > 0, "source never got going");
    assert_eq!(window_sum(&collected), delivered);

    // Stop is idempotent once the query is down.
    assert_eq!(
        harness.manager.stop(id, StopMode::Soft).expect("stop again"),
        StopSignal::AlreadyStopped
    );
    harness.pool.shutdown();
}

#[test]
fn hard_stop_discards_in_flight_work() {
    let harness = harness(2);
    let definition = WindowDefinition::tumbling(5, AggregateKind::Sum, vec![0]);
    let handler = Arc::new(WindowOperatorHandler::new(
        &harness.context,
        definition,
        harness.page_pool.clone(),
    ));
    let (sink, _collected) = CollectSink::new();
    let emitted = Arc::new(AtomicU64::new(0));

    let sources = vec![SourceSpec {
        source: Box::new(CountingSource {
            origin: 0,
            emitted: emitted.clone(),
        }),
        entry_stage: 0,
    }];
    let id = harness
        .manager
        .register(window_query(handler, sources, sink))
        .expect("register");
    harness.manager.schedule(id).expect("schedule");
    harness.manager.start(id).expect("start");

    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        harness.manager.stop(id, StopMode::Hard).expect("hard stop"),
        StopSignal::Stopping
    );
    let status = harness
        .manager
        .wait_for_status(id, QueryStatus::is_terminal, Duration::from_secs(10))
        .expect("hard stop should complete");
    assert_eq!(status, QueryStatus::Stopped);
    harness.pool.shutdown();
}

#[test]
fn stopping_a_registered_query_has_no_side_effects() {
    let harness = harness(1);
    let definition = WindowDefinition::tumbling(10, AggregateKind::Sum, vec![0]);
    let handler = Arc::new(WindowOperatorHandler::new(
        &harness.context,
        definition,
        harness.page_pool.clone(),
    ));
    let (sink, collected) = CollectSink::new();

    let sources = vec![SourceSpec {
        source: Box::new(MemorySource::new(
            0,
            vec![MemoryBatch::aggregate(&[AggregateInput {
                key: 1,
                value: 1,
                timestamp: 1,
            }])],
        )),
        entry_stage: 0,
    }];
    let id = harness
        .manager
        .register(window_query(handler, sources, sink))
        .expect("register");

    assert_eq!(
        harness.manager.stop(id, StopMode::Soft).expect("stop"),
        StopSignal::Stopping
    );
    assert_eq!(harness.manager.status(id).expect("status"), QueryStatus::Stopped);
    assert_eq!(
        harness.manager.stop(id, StopMode::Soft).expect("stop again"),
        StopSignal::AlreadyStopped
    );
    // The query never ran, so nothing was produced and starting is refused.
    assert!(harness.manager.start(id).is_err());
    assert!(collected.lock().is_empty());
    harness.pool.shutdown();
}

#[test]
fn a_failing_kernel_fails_the_query() {
    let harness = harness(2);
    let (sink, collected) = CollectSink::new();

    let spec = QuerySpec {
        stages: vec![StageSpec {
            stage: Arc::new(ExplodingStage),
            dispatch_to: None,
            emit_to: None,
        }],
        sources: vec![SourceSpec {
            source: Box::new(MemorySource::new(
                0,
                vec![MemoryBatch::aggregate(&[AggregateInput {
                    key: 1,
                    value: 1,
                    timestamp: 1,
                }])],
            )),
            entry_stage: 0,
        }],
        sink: Box::new(sink),
    };
    let id = harness.manager.register(spec).expect("register");
    harness.manager.schedule(id).expect("schedule");
    harness.manager.start(id).expect("start");

    let status = harness
        .manager
        .wait_for_status(id, QueryStatus::is_terminal, Duration::from_secs(10))
        .expect("failure should surface");
    match status {
        QueryStatus::Failed(message) => {
            assert!(message.contains("synthetic kernel fault"), "message: {message}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(harness.context.metrics.queries_failed.get(), 1);
    assert!(collected.lock().is_empty());

    // A failed query reports AlreadyStopped to further stop requests.
    assert_eq!(
        harness.manager.stop(id, StopMode::Soft).expect("stop"),
        StopSignal::AlreadyStopped
    );
    harness.pool.shutdown();
}
