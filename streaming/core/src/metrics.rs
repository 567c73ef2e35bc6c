// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

/// Runtime metrics shared by all components through the [`Context`].
///
/// [`Context`]: crate::context::Context
pub struct Metrics {
    /// Pooled buffers handed out by the buffer pool.
    pub buffers_acquired: IntCounter,
    /// Buffers returned to the pool free list.
    pub buffers_recycled: IntCounter,
    /// Bytes currently outstanding through the unpooled allocation path.
    pub unpooled_bytes: IntGauge,
    /// State pages currently in circulation.
    pub pages_in_use: IntGauge,
    /// Tasks executed, labelled by pipeline stage name.
    pub tasks_executed: IntCounterVec,
    /// Tasks skipped because their query was stopped.
    pub tasks_cancelled: IntCounter,
    /// Tasks re-enqueued after a backpressure signal.
    pub backpressure_retries: IntCounter,
    /// Tasks stolen from a peer worker's queue.
    pub tasks_stolen: IntCounter,
    /// Tuples dropped because they arrived behind the local watermark.
    pub tuples_dropped_late: IntCounter,
    /// Latest global watermark observed by any build stage.
    pub global_watermark: IntGauge,
    /// Partition merge tasks dispatched by the W-th contributor.
    pub merge_tasks_dispatched: IntCounter,
    /// Window aggregate tasks dispatched by the merge stage.
    pub window_tasks_dispatched: IntCounter,
    /// Join probe tasks dispatched when both sides sealed a slice.
    pub probe_tasks_dispatched: IntCounter,
    /// Windows emitted by the trigger stage (per partition).
    pub windows_emitted: IntCounter,
    /// Join output records emitted by the probe stage.
    pub join_matches: IntCounter,
    /// Slices dropped by garbage collection.
    pub slices_dropped: IntCounter,
    /// Queries that transitioned to the Failed state.
    pub queries_failed: IntCounter,
    /// Time spent executing one task, in seconds.
    pub task_execution_seconds: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            buffers_acquired: register_int_counter_with_registry!(
                "buffers_acquired",
                "Pooled buffers handed out by the buffer pool",
                registry,
            )
            .unwrap(),
            buffers_recycled: register_int_counter_with_registry!(
                "buffers_recycled",
                "Buffers returned to the pool free list",
                registry,
            )
            .unwrap(),
            unpooled_bytes: register_int_gauge_with_registry!(
                "unpooled_bytes",
                "Bytes currently outstanding through the unpooled allocation path",
                registry,
            )
            .unwrap(),
            pages_in_use: register_int_gauge_with_registry!(
                "pages_in_use",
                "State pages currently in circulation",
                registry,
            )
            .unwrap(),
            tasks_executed: register_int_counter_vec_with_registry!(
                "tasks_executed",
                "Tasks executed, labelled by pipeline stage name",
                &["stage"],
                registry,
            )
            .unwrap(),
            tasks_cancelled: register_int_counter_with_registry!(
                "tasks_cancelled",
                "Tasks skipped because their query was stopped",
                registry,
            )
            .unwrap(),
            backpressure_retries: register_int_counter_with_registry!(
                "backpressure_retries",
                "Tasks re-enqueued after a backpressure signal",
                registry,
            )
            .unwrap(),
            tasks_stolen: register_int_counter_with_registry!(
                "tasks_stolen",
                "Tasks stolen from a peer worker's queue",
                registry,
            )
            .unwrap(),
            tuples_dropped_late: register_int_counter_with_registry!(
                "tuples_dropped_late",
                "Tuples dropped because they arrived behind the local watermark",
                registry,
            )
            .unwrap(),
            global_watermark: register_int_gauge_with_registry!(
                "global_watermark",
                "Latest global watermark observed by any build stage",
                registry,
            )
            .unwrap(),
            merge_tasks_dispatched: register_int_counter_with_registry!(
                "merge_tasks_dispatched",
                "Partition merge tasks dispatched by the final contributor",
                registry,
            )
            .unwrap(),
            window_tasks_dispatched: register_int_counter_with_registry!(
                "window_tasks_dispatched",
                "Window aggregate tasks dispatched by the merge stage",
                registry,
            )
            .unwrap(),
            probe_tasks_dispatched: register_int_counter_with_registry!(
                "probe_tasks_dispatched",
                "Join probe tasks dispatched when both sides sealed a slice",
                registry,
            )
            .unwrap(),
            windows_emitted: register_int_counter_with_registry!(
                "windows_emitted",
                "Windows emitted by the trigger stage",
                registry,
            )
            .unwrap(),
            join_matches: register_int_counter_with_registry!(
                "join_matches",
                "Join output records emitted by the probe stage",
                registry,
            )
            .unwrap(),
            slices_dropped: register_int_counter_with_registry!(
                "slices_dropped",
                "Slices dropped by garbage collection",
                registry,
            )
            .unwrap(),
            queries_failed: register_int_counter_with_registry!(
                "queries_failed",
                "Queries that transitioned to the Failed state",
                registry,
            )
            .unwrap(),
            task_execution_seconds: register_histogram_with_registry!(
                "task_execution_seconds",
                "Time spent executing one task, in seconds",
                registry,
            )
            .unwrap(),
        }
    }
}

/// Fresh metrics against a throwaway registry, for tests.
pub fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new(&Registry::new()))
}
