// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The streaming execution runtime: tuple buffers and pools at the bottom, a
//! lock-free multi-origin watermark processor, the two-level slice store
//! feeding the windowed aggregation and hash-join operators, and the worker
//! pool and query lifecycle that drive them.

mod aggregate;
mod buffer;
mod buffer_pool;
mod context;
mod error;
mod hash_join;
mod lifecycle;
mod metrics;
mod pipeline;
mod record;
mod sink;
mod slice;
mod slice_store;
mod source;
mod watermark;
mod window;
mod window_operator;
mod wire;
mod worker_pool;

pub use aggregate::{AggregateKind, Partial};
pub use buffer::{BufferMetadata, TupleBuffer};
pub use buffer_pool::{BufferPool, Page, PageEntry, PagePool};
pub use context::Context;
pub use error::{StreamError, StreamResult};
pub use hash_join::{
    JoinBuildStage, JoinDefinition, JoinOperatorHandler, JoinProbeStage, JoinSide,
};
pub use lifecycle::{
    QueryLifecycleManager, QuerySpec, QueryStatus, SourceSpec, StageSpec, StopMode, StopSignal,
};
pub use metrics::{test_metrics, Metrics};
pub use pipeline::{
    ExecutablePipelineStage, ExecutionStatus, PipelineExecutionContext, WorkerContext,
};
pub use record::{
    AggregateInput, JoinInput, JoinProbeTask, JoinResult, PartitionMergeTask, WindowAggregateTask,
    WindowResult,
};
pub use sink::{CollectSink, CollectedBuffer, Sink};
pub use slice::{slice_index_for, PagedHashMap, PartitionPages, Slice};
pub use source::{MemoryBatch, MemorySource, Source, SourceContext};
pub use watermark::{WatermarkProcessor, WatermarkUpdate};
pub use window::{WindowDefinition, WindowType};
pub use window_operator::{
    PreAggregationStage, SliceMergeStage, WindowOperatorHandler, WindowTriggerStage,
};
pub use wire::{
    decode_frame, encode_frame, MessageType, WireHeader, WIRE_HEADER_SIZE, WIRE_MAGIC,
};
pub use worker_pool::WorkerPool;
