// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/// An origin is an independent input stream feeding a query. Every origin owns
/// its own sequence-number space, so buffers from different origins are never
/// ordered against each other.
pub type OriginId = u64;

/// Uniquely identifies a registered query for its whole lifetime.
pub type QueryId = u64;

/// Per-origin buffer sequence number. Strictly increasing and gap-free;
/// sequence numbers start at 1 so that 0 can serve as "nothing seen yet".
pub type SequenceNumber = u64;

/// Event time in milliseconds since the stream epoch.
pub type Timestamp = u64;

/// Each worker thread is uniquely identified by its WorkerIndex in the pool.
/// WorkerIndex is between 0 (inclusive) and the number of workers (exclusive).
pub type WorkerIndex = u32;

/// The watermark value carried by an end-of-stream buffer. No event can ever
/// be later than this, so it releases every open window.
pub const EOS_WATERMARK: Timestamp = Timestamp::MAX;
