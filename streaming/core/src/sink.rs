// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{BufferMetadata, TupleBuffer};
use crate::error::StreamResult;
use crate::lifecycle::QueryRuntime;
use streaming_config::QueryId;

/// A consumer of a query's output buffers.
///
/// Buffers arrive through a bounded channel fed by the last pipeline stage; a
/// sink that cannot keep up fills the channel and the emitting workers block,
/// which is the backpressure path. The sink must release every buffer it
/// receives (dropping it is a release).
pub trait Sink: Send + 'static {
    fn consume(&mut self, buffer: TupleBuffer) -> StreamResult<()>;

    /// Called once after the last buffer, including on failure paths.
    fn close(&mut self) {}
}

/// Runs the sink on a named dedicated thread, returning the channel the
/// pipeline emits into. The thread ends when every sender is dropped.
pub(crate) fn spawn_sink(
    query_id: QueryId,
    mut sink: Box<dyn Sink>,
    query: Weak<QueryRuntime>,
    channel_depth: usize,
) -> (SyncSender<TupleBuffer>, thread::JoinHandle<()>) {
    let (sender, receiver) = sync_channel::<TupleBuffer>(channel_depth);
    let handle = thread::Builder::new()
        .name(format!("streaming-sink-{query_id}"))
        .spawn(move || {
            while let Ok(buffer) = receiver.recv() {
                let discard = query
                    .upgrade()
                    .map(|query| query.discards_tasks())
                    .unwrap_or(true);
                if discard {
                    // Hard stop: in-flight output is dropped, not delivered.
                    continue;
                }
                if let Err(error) = sink.consume(buffer) {
                    warn!(query = query_id, %error, "sink failed");
                    if let Some(query) = query.upgrade() {
                        query.fail(error);
                    }
                    break;
                }
            }
            sink.close();
            debug!(query = query_id, "sink closed");
        })
        .unwrap();
    (sender, handle)
}

/// A buffer captured by [`CollectSink`]: the metadata plus a copy of the
/// payload, so the underlying pooled buffer is released immediately.
#[derive(Clone, Debug)]
pub struct CollectedBuffer {
    pub metadata: BufferMetadata,
    pub payload: Vec<u8>,
}

impl CollectedBuffer {
    /// The used prefix of the payload.
    pub fn records(&self) -> &[u8] {
        let used = self.metadata.tuple_count as usize * self.metadata.record_size as usize;
        &self.payload[..used]
    }
}

/// Collects output buffers into shared memory, for tests and local runs.
pub struct CollectSink {
    collected: Arc<Mutex<Vec<CollectedBuffer>>>,
}

impl CollectSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<CollectedBuffer>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                collected: collected.clone(),
            },
            collected,
        )
    }
}

impl Sink for CollectSink {
    fn consume(&mut self, buffer: TupleBuffer) -> StreamResult<()> {
        self.collected.lock().push(CollectedBuffer {
            metadata: buffer.metadata().clone(),
            payload: buffer.payload().to_vec(),
        });
        Ok(())
    }
}
