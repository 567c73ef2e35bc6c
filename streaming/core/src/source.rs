// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferPool;
use crate::error::{StreamError, StreamResult};
use crate::lifecycle::QueryRuntime;
use crate::record::{AggregateInput, JoinInput};
use streaming_config::{OriginId, SequenceNumber, Timestamp, EOS_WATERMARK};

/// A producer of tuple buffers for one origin.
///
/// `run` is driven on a dedicated thread. It must emit buffers with strictly
/// increasing, gap-free sequence numbers and a watermark no later than any
/// future tuple's event time, and it should return promptly once
/// [`SourceContext::should_stop`] turns true. End-of-stream is emitted by the
/// harness after `run` returns.
pub trait Source: Send + 'static {
    fn origin(&self) -> OriginId;

    fn run(&mut self, ctx: &mut SourceContext) -> StreamResult<()>;
}

/// Capabilities handed to a running source: buffer allocation, validated
/// emission, and the stop signal.
pub struct SourceContext {
    origin: OriginId,
    pool: BufferPool,
    query: Arc<QueryRuntime>,
    entry_stage: usize,
    next_sequence: SequenceNumber,
    last_watermark: Timestamp,
}

impl SourceContext {
    pub fn should_stop(&self) -> bool {
        self.query.source_stop.load(Ordering::Acquire)
    }

    /// The sequence number the next emitted buffer must carry.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Blocks until a pooled buffer is free.
    pub fn allocate(&self) -> TupleBuffer {
        self.pool.acquire()
    }

    /// Validates the buffer against the source contract and hands it to the
    /// entry stage. Violations are protocol errors that fail the query.
    pub fn emit(&mut self, buffer: TupleBuffer) -> StreamResult<()> {
        let metadata = buffer.metadata();
        if metadata.origin_id != self.origin {
            return Err(StreamError::Protocol(format!(
                "source for origin {} emitted origin {}",
                self.origin, metadata.origin_id
            )));
        }
        if metadata.sequence_number != self.next_sequence {
            return Err(StreamError::Protocol(format!(
                "origin {} emitted sequence {}, expected {}",
                self.origin, metadata.sequence_number, self.next_sequence
            )));
        }
        if metadata.watermark < self.last_watermark {
            return Err(StreamError::Protocol(format!(
                "origin {} watermark went backwards: {} < {}",
                self.origin, metadata.watermark, self.last_watermark
            )));
        }
        if metadata.watermark > metadata.creation_timestamp {
            return Err(StreamError::Protocol(format!(
                "origin {} watermark {} ahead of creation timestamp {}",
                self.origin, metadata.watermark, metadata.creation_timestamp
            )));
        }
        self.next_sequence += 1;
        self.last_watermark = metadata.watermark;
        self.query.enqueue_execute(self.entry_stage, buffer)
    }

    /// Emits the zero-tuple end-of-stream buffer for this origin.
    fn finish(&mut self) -> StreamResult<()> {
        let mut buffer = self.pool.acquire();
        let metadata = buffer.metadata_mut();
        metadata.origin_id = self.origin;
        metadata.sequence_number = self.next_sequence;
        metadata.watermark = EOS_WATERMARK;
        metadata.creation_timestamp = EOS_WATERMARK;
        metadata.tuple_count = 0;
        metadata.end_of_stream = true;
        self.emit(buffer)
    }
}

/// Drives a source on a named dedicated thread. After `run` returns (or the
/// stop flag interrupts it), the origin's end-of-stream buffer is emitted and
/// the drain machinery is informed.
pub(crate) fn spawn_source(
    mut source: Box<dyn Source>,
    entry_stage: usize,
    query: Arc<QueryRuntime>,
    pool: BufferPool,
) -> thread::JoinHandle<()> {
    let origin = source.origin();
    thread::Builder::new()
        .name(format!("streaming-source-{origin}"))
        .spawn(move || {
            let mut ctx = SourceContext {
                origin,
                pool,
                query: query.clone(),
                entry_stage,
                next_sequence: 1,
                last_watermark: 0,
            };
            match source.run(&mut ctx) {
                Ok(()) => {
                    match ctx.finish() {
                        Ok(()) | Err(StreamError::Cancelled) => {}
                        Err(error) => {
                            warn!(origin, %error, "failed to emit end of stream");
                            query.fail(error);
                        }
                    }
                    query.note_source_finished();
                    debug!(origin, "source finished");
                }
                Err(StreamError::Cancelled) => {
                    query.note_source_finished();
                    debug!(origin, "source cancelled");
                }
                Err(error) => {
                    // This origin has no other contributor, so a source
                    // failure fails the query.
                    query.fail(error);
                    query.note_source_finished();
                }
            }
        })
        .unwrap()
}

/// One pre-built buffer of a [`MemorySource`].
pub struct MemoryBatch {
    pub payload: Vec<u8>,
    pub record_size: u32,
    pub tuple_count: u32,
    pub watermark: Timestamp,
    pub creation_timestamp: Timestamp,
}

impl MemoryBatch {
    /// A batch of aggregation inputs whose watermark is derived from the
    /// data: `max(ts) - allowed lateness` with lateness zero.
    pub fn aggregate(records: &[AggregateInput]) -> Self {
        let mut payload = vec![0u8; records.len() * AggregateInput::SIZE];
        let mut max_ts = 0;
        for (index, record) in records.iter().enumerate() {
            record.write(&mut payload, index);
            max_ts = max_ts.max(record.timestamp);
        }
        Self {
            payload,
            record_size: AggregateInput::SIZE as u32,
            tuple_count: records.len() as u32,
            watermark: max_ts,
            creation_timestamp: max_ts,
        }
    }

    /// A batch of join inputs, watermark derived like [`Self::aggregate`].
    pub fn join(records: &[JoinInput]) -> Self {
        let mut payload = vec![0u8; records.len() * JoinInput::SIZE];
        let mut max_ts = 0;
        for (index, record) in records.iter().enumerate() {
            record.write(&mut payload, index);
            max_ts = max_ts.max(record.timestamp);
        }
        Self {
            payload,
            record_size: JoinInput::SIZE as u32,
            tuple_count: records.len() as u32,
            watermark: max_ts,
            creation_timestamp: max_ts,
        }
    }

    pub fn with_watermark(mut self, watermark: Timestamp) -> Self {
        self.watermark = watermark;
        self.creation_timestamp = self.creation_timestamp.max(watermark);
        self
    }
}

/// A finite source that replays pre-built batches, optionally pacing them.
/// Intended for tests and local experiments.
pub struct MemorySource {
    origin: OriginId,
    batches: Vec<MemoryBatch>,
    pacing: Option<Duration>,
}

impl MemorySource {
    pub fn new(origin: OriginId, batches: Vec<MemoryBatch>) -> Self {
        Self {
            origin,
            batches,
            pacing: None,
        }
    }

    /// Sleeps between batches, e.g. to give a stop request time to land.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }
}

impl Source for MemorySource {
    fn origin(&self) -> OriginId {
        self.origin
    }

    fn run(&mut self, ctx: &mut SourceContext) -> StreamResult<()> {
        for batch in self.batches.drain(..) {
            if ctx.should_stop() {
                break;
            }
            let mut buffer = ctx.allocate();
            if batch.payload.len() > buffer.capacity() {
                return Err(StreamError::ResourceExhausted(format!(
                    "batch of {} bytes exceeds buffer capacity {}",
                    batch.payload.len(),
                    buffer.capacity()
                )));
            }
            buffer.payload_mut()[..batch.payload.len()].copy_from_slice(&batch.payload);
            let sequence = ctx.next_sequence();
            let metadata = buffer.metadata_mut();
            metadata.origin_id = self.origin;
            metadata.sequence_number = sequence;
            metadata.watermark = batch.watermark;
            metadata.creation_timestamp = batch.creation_timestamp;
            metadata.tuple_count = batch.tuple_count;
            metadata.record_size = batch.record_size;
            match ctx.emit(buffer) {
                Ok(()) => {}
                Err(StreamError::Cancelled) => break,
                Err(error) => return Err(error),
            }
            if let Some(pacing) = self.pacing {
                thread::sleep(pacing);
            }
        }
        Ok(())
    }
}
