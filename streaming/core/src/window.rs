// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use streaming_config::{OriginId, Timestamp};

use crate::aggregate::AggregateKind;

/// The window shape of a query. Sizes are in event-time units.
///
/// The slice schedule is anchored at timestamp 0, so slice `i` covers
/// `[i * slice_size, (i + 1) * slice_size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowType {
    Tumbling { size: u64 },
    Sliding { size: u64, slide: u64 },
}

impl WindowType {
    /// The pre-aggregation granularity: tumbling windows slice at their size,
    /// sliding windows at their slide.
    pub fn slice_size(&self) -> u64 {
        match self {
            WindowType::Tumbling { size } => *size,
            WindowType::Sliding { slide, .. } => *slide,
        }
    }

    /// Number of consecutive slices composing one window.
    pub fn slices_per_window(&self) -> u64 {
        match self {
            WindowType::Tumbling { .. } => 1,
            WindowType::Sliding { size, slide } => size / slide,
        }
    }

    /// Bounds of the window that ends at the given slice. Windows that would
    /// start before the stream epoch are clipped at 0.
    pub fn window_ending_at(&self, slice_index: u64) -> (Timestamp, Timestamp) {
        let slice_size = self.slice_size();
        let end = (slice_index + 1) * slice_size;
        let first_slice = slice_index.saturating_sub(self.slices_per_window() - 1);
        (first_slice * slice_size, end)
    }
}

/// Everything the windowed aggregation operator needs to know about a query:
/// the window shape, the aggregate, the input origins, and how much lateness
/// the build stage tolerates before dropping a tuple.
#[derive(Clone, Debug)]
pub struct WindowDefinition {
    pub window: WindowType,
    pub aggregate: AggregateKind,
    pub origins: Vec<OriginId>,
    pub allowed_lateness: u64,
}

impl WindowDefinition {
    pub fn tumbling(size: u64, aggregate: AggregateKind, origins: Vec<OriginId>) -> Self {
        Self {
            window: WindowType::Tumbling { size },
            aggregate,
            origins,
            allowed_lateness: 0,
        }
    }

    pub fn sliding(size: u64, slide: u64, aggregate: AggregateKind, origins: Vec<OriginId>) -> Self {
        Self {
            window: WindowType::Sliding { size, slide },
            aggregate,
            origins,
            allowed_lateness: 0,
        }
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness: u64) -> Self {
        self.allowed_lateness = allowed_lateness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_windows_are_their_slice() {
        let window = WindowType::Tumbling { size: 10 };
        assert_eq!(window.slice_size(), 10);
        assert_eq!(window.slices_per_window(), 1);
        assert_eq!(window.window_ending_at(0), (0, 10));
        assert_eq!(window.window_ending_at(3), (30, 40));
    }

    #[test]
    fn sliding_windows_cover_multiple_slices() {
        let window = WindowType::Sliding { size: 30, slide: 10 };
        assert_eq!(window.slice_size(), 10);
        assert_eq!(window.slices_per_window(), 3);
        assert_eq!(window.window_ending_at(4), (20, 50));
        // Early windows are clipped at the stream epoch.
        assert_eq!(window.window_ending_at(1), (0, 20));
    }
}
