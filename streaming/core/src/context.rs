// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use streaming_config::Parameters;

use crate::metrics::Metrics;
#[cfg(test)]
use crate::metrics::test_metrics;

/// Context contains the configuration and metrics shared by all components of
/// this worker process.
#[derive(Clone)]
pub struct Context {
    /// Operational parameters of this worker.
    pub parameters: Parameters,
    /// Metrics of this worker.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(parameters: Parameters, metrics: Arc<Metrics>) -> Self {
        Self {
            parameters,
            metrics,
        }
    }

    /// Create a test context with the given number of worker threads and a
    /// small buffer pool.
    #[cfg(test)]
    pub(crate) fn new_for_test(worker_threads: usize) -> Self {
        let parameters = Parameters {
            worker_threads,
            partitions: 8,
            pooled_buffers: 128,
            buffer_size_bytes: 1024,
            ..Default::default()
        };
        Context::new(parameters, test_metrics())
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}
