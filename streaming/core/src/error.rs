// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors that can occur while executing a streaming query.
///
/// The policy attached to each variant lives with the worker pool and the
/// query lifecycle: `ResourceExhausted` at a non-critical point is retried as
/// backpressure, `Cancelled` is swallowed, everything else fails the query.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The buffer pool, page pool or a watermark log ran out of capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A source or peer violated the buffer protocol, e.g. a duplicate
    /// sequence number, a non-monotone watermark or a malformed wire header.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A compiled pipeline kernel reported failure.
    #[error("kernel failure in stage {stage}: {message}")]
    KernelFailure { stage: String, message: String },

    /// The query was stopped while the task was in flight. Silent by policy;
    /// the buffer is released and the task is dropped.
    #[error("query cancelled")]
    Cancelled,

    /// An internal invariant was violated. Always fatal for the query.
    #[error("invariant violation: {0}")]
    Internal(String),

    /// The worker pool or a handoff channel shut down underneath the caller.
    #[error("shutting down: {0}")]
    Shutdown(String),

    /// A bounded external wait elapsed before its condition held.
    #[error("timed out: {0}")]
    Timeout(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// True for errors that should be retried via backpressure instead of
    /// failing the query.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::ResourceExhausted(_))
    }
}
