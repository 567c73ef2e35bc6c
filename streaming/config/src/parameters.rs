// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operational configuration of a streaming worker.
///
/// All fields only affect throughput and resource usage, never the result of a
/// query. Anything that changes query semantics (window sizes, aggregate
/// functions, origin sets) belongs to the per-query definitions instead.
///
/// NOTE: default values should make sense, so most operators should not need to
/// specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Number of worker threads executing pipeline tasks.
    #[serde(default = "Parameters::default_worker_threads")]
    pub worker_threads: usize,

    /// Number of key-space partitions per slice. Also the unit of merge and
    /// probe parallelism.
    #[serde(default = "Parameters::default_partitions")]
    pub partitions: usize,

    /// Number of fixed-size tuple buffers owned by the pooled allocator.
    #[serde(default = "Parameters::default_pooled_buffers")]
    pub pooled_buffers: usize,

    /// Payload capacity of one pooled tuple buffer, in bytes.
    #[serde(default = "Parameters::default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,

    /// Upper bound on the total bytes handed out through the unpooled
    /// (variable-size) allocation path.
    #[serde(default = "Parameters::default_unpooled_bytes_limit")]
    pub unpooled_bytes_limit: usize,

    /// Number of entries per state page. Pages back the per-slice hash maps
    /// and the join build sides.
    #[serde(default = "Parameters::default_page_entries")]
    pub page_entries: usize,

    /// Maximum number of state pages in circulation before build stages see
    /// backpressure.
    #[serde(default = "Parameters::default_page_limit")]
    pub page_limit: usize,

    /// Capacity of each per-origin watermark log. Exceeding it means the
    /// watermark fell unrecoverably far behind the sequence numbers.
    #[serde(default = "Parameters::default_watermark_log_capacity")]
    pub watermark_log_capacity: usize,

    /// Depth of the bounded channel between the last pipeline stage and a
    /// sink thread. A full channel is how a slow sink applies backpressure.
    #[serde(default = "Parameters::default_sink_channel_depth")]
    pub sink_channel_depth: usize,

    /// Bound for external wait-for-status calls.
    #[serde(default = "Parameters::default_status_wait")]
    pub status_wait: Duration,
}

impl Parameters {
    pub fn default_worker_threads() -> usize {
        4
    }

    pub fn default_partitions() -> usize {
        16
    }

    pub fn default_pooled_buffers() -> usize {
        1024
    }

    pub fn default_buffer_size_bytes() -> usize {
        8192
    }

    pub fn default_unpooled_bytes_limit() -> usize {
        64 * 1024 * 1024
    }

    pub fn default_page_entries() -> usize {
        512
    }

    pub fn default_page_limit() -> usize {
        4096
    }

    pub fn default_watermark_log_capacity() -> usize {
        1024
    }

    pub fn default_sink_channel_depth() -> usize {
        64
    }

    pub fn default_status_wait() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            worker_threads: Parameters::default_worker_threads(),
            partitions: Parameters::default_partitions(),
            pooled_buffers: Parameters::default_pooled_buffers(),
            buffer_size_bytes: Parameters::default_buffer_size_bytes(),
            unpooled_bytes_limit: Parameters::default_unpooled_bytes_limit(),
            page_entries: Parameters::default_page_entries(),
            page_limit: Parameters::default_page_limit(),
            watermark_log_capacity: Parameters::default_watermark_log_capacity(),
            sink_channel_depth: Parameters::default_sink_channel_depth(),
            status_wait: Parameters::default_status_wait(),
        }
    }
}
