// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use streaming_config::{OriginId, SequenceNumber, Timestamp};

use crate::buffer_pool::BufferStorage;

/// Metadata describing the payload of a [`TupleBuffer`].
///
/// All fields are set by the producer before the buffer is emitted into the
/// task queue and are final afterwards. The queue handoff is the
/// happens-before edge between the producer's writes and any reader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferMetadata {
    /// The origin whose sequence-number space this buffer belongs to.
    pub origin_id: OriginId,
    /// Strictly increasing, gap-free per origin.
    pub sequence_number: SequenceNumber,
    /// Position of this buffer within a logical output that spans several
    /// buffers. `(sequence_number, chunk_number)` totally orders output per
    /// origin.
    pub chunk_number: u64,
    /// True on the final chunk of a logical output.
    pub last_chunk: bool,
    /// Promise that no future tuple from this origin has an event time
    /// earlier than this.
    pub watermark: Timestamp,
    /// Wall-clock-ish creation stamp. Invariant: `watermark <= creation_timestamp`.
    pub creation_timestamp: Timestamp,
    /// Number of records in the payload.
    pub tuple_count: u32,
    /// Fixed width of one record in bytes.
    pub record_size: u32,
    /// Set on the zero-tuple buffer that closes an origin. Such a buffer
    /// carries `watermark = EOS_WATERMARK`.
    pub end_of_stream: bool,
}

/// A fixed-capacity block of bytes carrying records or an internal task.
///
/// Buffers are owned by a [`BufferPool`] and return to it when dropped. While
/// a producer holds the buffer it has exclusive access to the payload; once
/// the buffer has been handed to the task queue it is only read.
///
/// [`BufferPool`]: crate::buffer_pool::BufferPool
pub struct TupleBuffer {
    storage: BufferStorage,
    metadata: BufferMetadata,
}

impl TupleBuffer {
    pub(crate) fn new(storage: BufferStorage) -> Self {
        Self {
            storage,
            metadata: BufferMetadata::default(),
        }
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn payload(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    pub fn metadata(&self) -> &BufferMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BufferMetadata {
        &mut self.metadata
    }

    pub fn tuple_count(&self) -> usize {
        self.metadata.tuple_count as usize
    }

    /// Number of whole records of `record_size` bytes that fit in the payload.
    pub fn record_capacity(&self, record_size: usize) -> usize {
        if record_size == 0 {
            return 0;
        }
        self.capacity() / record_size
    }

    /// True when the buffer was drawn from the fixed-size pooled path.
    pub fn is_pooled(&self) -> bool {
        self.storage.is_pooled()
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("metadata", &self.metadata)
            .finish()
    }
}
