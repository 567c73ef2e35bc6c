// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width little-endian record layouts.
//!
//! Data records are dense arrays inside a tuple buffer's payload; task
//! records are single-record buffers that chain pipeline stages together.

use crate::buffer::TupleBuffer;
use crate::error::{StreamError, StreamResult};

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

macro_rules! record_layout {
    ($(#[$meta:meta])* $name:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: u64,)+
        }

        impl $name {
            pub const SIZE: usize = 8 * record_layout!(@count $($field)+);

            /// Reads the record at `index` from a dense payload.
            pub fn read(payload: &[u8], index: usize) -> Self {
                let base = index * Self::SIZE;
                let mut offset = base;
                $(
                    let $field = read_u64(payload, offset);
                    #[allow(unused_assignments)]
                    {
                        offset += 8;
                    }
                )+
                Self { $($field,)+ }
            }

            /// Writes the record at `index` into a dense payload.
            pub fn write(&self, payload: &mut [u8], index: usize) {
                let base = index * Self::SIZE;
                let mut offset = base;
                $(
                    write_u64(payload, offset, self.$field);
                    #[allow(unused_assignments)]
                    {
                        offset += 8;
                    }
                )+
            }
        }
    };
    (@count $head:ident $($tail:ident)*) => { 1usize + record_layout!(@count $($tail)*) };
    (@count) => { 0usize };
}

record_layout! {
    /// Input to the windowed aggregation build stage.
    AggregateInput { key, value, timestamp }
}

record_layout! {
    /// One aggregated key emitted by the window trigger stage.
    WindowResult { window_start, window_end, key, value }
}

record_layout! {
    /// Input to one side of the streaming hash join.
    JoinInput { key, payload, timestamp }
}

record_layout! {
    /// One match emitted by the join probe stage, window bounds prepended.
    JoinResult { window_start, window_end, key, left_payload, right_payload }
}

record_layout! {
    /// Dispatched by the W-th contributor of a `(slice, partition)`.
    PartitionMergeTask { slice_index, partition_index }
}

record_layout! {
    /// Dispatched by the merge stage for each newly covered slice range.
    WindowAggregateTask { partition_index, start_slice, end_slice, trigger_sequence }
}

record_layout! {
    /// Dispatched when a join window is complete on both sides.
    JoinProbeTask { window_start, window_end, partition_index, left_slice, right_slice }
}

/// Decodes a one-record task buffer, validating its shape.
pub(crate) fn decode_task<T>(
    buffer: &TupleBuffer,
    read: impl Fn(&[u8], usize) -> T,
    size: usize,
) -> StreamResult<T> {
    if buffer.tuple_count() != 1 || buffer.metadata().record_size as usize != size {
        return Err(StreamError::Internal(format!(
            "malformed task buffer: {} tuples of {} bytes, expected 1 of {size}",
            buffer.tuple_count(),
            buffer.metadata().record_size,
        )));
    }
    Ok(read(buffer.payload(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_in_place() {
        let mut payload = vec![0u8; AggregateInput::SIZE * 3];
        let records = [
            AggregateInput { key: 1, value: 10, timestamp: 1 },
            AggregateInput { key: 2, value: 20, timestamp: 2 },
            AggregateInput { key: 1, value: 30, timestamp: 9 },
        ];
        for (index, record) in records.iter().enumerate() {
            record.write(&mut payload, index);
        }
        for (index, record) in records.iter().enumerate() {
            assert_eq!(AggregateInput::read(&payload, index), *record);
        }
    }

    #[test]
    fn task_layout_sizes_match_the_wire_contract() {
        assert_eq!(PartitionMergeTask::SIZE, 16);
        assert_eq!(WindowAggregateTask::SIZE, 32);
        assert_eq!(JoinProbeTask::SIZE, 40);
        assert_eq!(AggregateInput::SIZE, 24);
        assert_eq!(WindowResult::SIZE, 32);
        assert_eq!(JoinResult::SIZE, 40);
    }
}
