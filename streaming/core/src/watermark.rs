// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use streaming_config::{OriginId, SequenceNumber, Timestamp};

use crate::error::{StreamError, StreamResult};

/// A slot is vacant when its sequence word is zero; valid sequences start at 1.
const VACANT: u64 = 0;

struct RingSlot {
    sequence: AtomicU64,
    value: AtomicU64,
    ready: AtomicBool,
}

/// A bounded lock-free log of `(sequence, value)` observations that commits
/// the longest contiguous sequence prefix.
///
/// Observations may arrive from any thread in any order. `committed_sequence`
/// only moves forward over sequences that are all present, and
/// `committed_value` is the monotone maximum of the values along that prefix.
/// The same structure backs three things: the per-origin watermark logs, the
/// per-partition merged-slice log, and the trigger-sequence GC watermark.
pub(crate) struct SequenceRing {
    slots: Box<[RingSlot]>,
    committed_sequence: AtomicU64,
    committed_value: AtomicU64,
}

impl SequenceRing {
    /// Attempts to claim a slot that is mid-recycle before declaring the ring
    /// wedged.
    const RECYCLE_SPIN_LIMIT: usize = 1 << 16;

    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "sequence ring needs at least two slots");
        let slots = (0..capacity)
            .map(|_| RingSlot {
                sequence: AtomicU64::new(VACANT),
                value: AtomicU64::new(0),
                ready: AtomicBool::new(false),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            committed_sequence: AtomicU64::new(0),
            committed_value: AtomicU64::new(0),
        }
    }

    /// Records `value` at `sequence` and advances the committed prefix as far
    /// as possible. Duplicate sequences are a programming error on the
    /// producer side; overflowing the ring means the committed prefix fell
    /// more than `capacity` sequences behind.
    pub fn insert(&self, sequence: SequenceNumber, value: u64) -> StreamResult<()> {
        if sequence == VACANT {
            return Err(StreamError::Protocol(
                "sequence numbers start at 1".to_string(),
            ));
        }
        if sequence <= self.committed_sequence.load(Ordering::Acquire) {
            return Err(StreamError::Protocol(format!(
                "duplicate sequence {sequence} (already committed)"
            )));
        }
        let slot = &self.slots[(sequence as usize) % self.slots.len()];
        let mut claimed = false;
        for _ in 0..Self::RECYCLE_SPIN_LIMIT {
            match slot.sequence.compare_exchange(
                VACANT,
                sequence,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    claimed = true;
                    break;
                }
                Err(current) if current == sequence => {
                    return Err(StreamError::Protocol(format!(
                        "duplicate sequence {sequence}"
                    )));
                }
                Err(current)
                    if current <= self.committed_sequence.load(Ordering::Acquire) =>
                {
                    // The previous occupant is committed and mid-recycle.
                    std::hint::spin_loop();
                }
                Err(current) => {
                    return Err(StreamError::ResourceExhausted(format!(
                        "sequence log overflow: {sequence} wrapped onto pending {current}"
                    )));
                }
            }
        }
        if !claimed {
            return Err(StreamError::ResourceExhausted(format!(
                "sequence log slot for {sequence} never recycled"
            )));
        }
        slot.value.store(value, Ordering::Release);
        slot.ready.store(true, Ordering::Release);
        self.advance();
        Ok(())
    }

    fn advance(&self) {
        loop {
            let committed = self.committed_sequence.load(Ordering::Acquire);
            let next = committed + 1;
            let slot = &self.slots[(next as usize) % self.slots.len()];
            if slot.sequence.load(Ordering::Acquire) != next || !slot.ready.load(Ordering::Acquire)
            {
                return;
            }
            let value = slot.value.load(Ordering::Acquire);
            if self
                .committed_sequence
                .compare_exchange(committed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.committed_value.fetch_max(value, Ordering::AcqRel);
                slot.ready.store(false, Ordering::Release);
                slot.sequence.store(VACANT, Ordering::Release);
            }
        }
    }

    /// Highest sequence such that all sequences up to it have been inserted.
    pub fn committed_sequence(&self) -> u64 {
        self.committed_sequence.load(Ordering::Acquire)
    }

    /// Maximum value observed along the committed prefix. Monotone.
    pub fn committed_value(&self) -> u64 {
        self.committed_value.load(Ordering::Acquire)
    }
}

/// The result of one watermark update: the global watermark before and after.
/// `previous < current` means a boundary may have been crossed and the caller
/// should flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub previous: Timestamp,
    pub current: Timestamp,
}

impl WatermarkUpdate {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }
}

/// Tracks, per origin, the highest watermark whose sequence prefix is
/// contiguous, and exposes the minimum across origins as the global
/// watermark.
///
/// Wait-free on the happy path: one CAS to publish the observation plus
/// monotone loads to fold the minimum. An origin that never delivers a
/// sequence stalls the global watermark; upstream guarantees gap-free
/// sequences per origin.
pub struct WatermarkProcessor {
    origins: Vec<(OriginId, SequenceRing)>,
    global: AtomicU64,
}

impl WatermarkProcessor {
    pub fn new(origins: &[OriginId], log_capacity: usize) -> Self {
        let origins = origins
            .iter()
            .map(|origin| (*origin, SequenceRing::new(log_capacity)))
            .collect();
        Self {
            origins,
            global: AtomicU64::new(0),
        }
    }

    /// Records `(origin, sequence, watermark)` and returns the global
    /// watermark before and after the update.
    pub fn update(
        &self,
        watermark: Timestamp,
        sequence: SequenceNumber,
        origin: OriginId,
    ) -> StreamResult<WatermarkUpdate> {
        let ring = self
            .origins
            .iter()
            .find(|(id, _)| *id == origin)
            .map(|(_, ring)| ring)
            .ok_or_else(|| StreamError::Protocol(format!("unknown origin {origin}")))?;
        ring.insert(sequence, watermark)?;

        let minimum = self
            .origins
            .iter()
            .map(|(_, ring)| ring.committed_value())
            .min()
            .unwrap_or(0);
        let previous = self.global.fetch_max(minimum, Ordering::AcqRel);
        Ok(WatermarkUpdate {
            previous,
            current: previous.max(minimum),
        })
    }

    /// The current global watermark. Monotone non-decreasing.
    pub fn global(&self) -> Timestamp {
        self.global.load(Ordering::Acquire)
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::sync::Arc;
    use streaming_config::EOS_WATERMARK;

    #[test]
    fn ring_commits_contiguous_prefix() {
        let ring = SequenceRing::new(8);

        ring.insert(2, 20).unwrap();
        assert_eq!(ring.committed_sequence(), 0);
        assert_eq!(ring.committed_value(), 0);

        ring.insert(1, 10).unwrap();
        assert_eq!(ring.committed_sequence(), 2);
        assert_eq!(ring.committed_value(), 20);

        ring.insert(3, 15).unwrap();
        // Values are monotone even when a later sequence carries a smaller one.
        assert_eq!(ring.committed_sequence(), 3);
        assert_eq!(ring.committed_value(), 20);
    }

    #[test]
    fn ring_rejects_duplicates() {
        let ring = SequenceRing::new(8);
        ring.insert(1, 10).unwrap();
        assert!(matches!(
            ring.insert(1, 10),
            Err(StreamError::Protocol(_))
        ));

        ring.insert(3, 30).unwrap();
        assert!(matches!(
            ring.insert(3, 30),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn ring_overflow_is_an_error() {
        let ring = SequenceRing::new(4);
        // Sequence 1 never arrives, so nothing commits and slots fill up.
        ring.insert(2, 2).unwrap();
        ring.insert(3, 3).unwrap();
        ring.insert(4, 4).unwrap();
        ring.insert(5, 5).unwrap();
        assert!(matches!(
            ring.insert(6, 6),
            Err(StreamError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn ring_slots_recycle_after_commit() {
        let ring = SequenceRing::new(4);
        for sequence in 1..=100 {
            ring.insert(sequence, sequence).unwrap();
        }
        assert_eq!(ring.committed_sequence(), 100);
        assert_eq!(ring.committed_value(), 100);
    }

    #[test]
    fn global_watermark_is_minimum_over_origins() {
        let processor = WatermarkProcessor::new(&[0, 1], 16);

        let update = processor.update(9, 1, 0).unwrap();
        // Origin 1 has not reported yet, so the global watermark stalls at 0.
        assert_eq!(update, WatermarkUpdate { previous: 0, current: 0 });

        let update = processor.update(11, 1, 1).unwrap();
        assert_eq!(update, WatermarkUpdate { previous: 0, current: 9 });
        assert!(update.advanced());

        // End of stream on origin 0 releases up to origin 1's watermark.
        let update = processor.update(EOS_WATERMARK, 2, 0).unwrap();
        assert_eq!(update.current, 11);
        assert_eq!(processor.global(), 11);
    }

    #[test]
    fn unknown_origin_is_a_protocol_error() {
        let processor = WatermarkProcessor::new(&[7], 16);
        assert!(matches!(
            processor.update(1, 1, 8),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn global_watermark_is_monotone_under_shuffled_updates() {
        // Feed each origin a contiguous sequence range in random order from
        // several threads and assert every observed global watermark is
        // non-decreasing.
        for seed in 0..10u8 {
            let processor = Arc::new(WatermarkProcessor::new(&[0, 1, 2], 256));
            let mut handles = Vec::new();
            for origin in 0..3u64 {
                let processor = processor.clone();
                let mut updates: Vec<u64> = (1..=100).collect();
                updates.shuffle(&mut StdRng::from_seed([seed.wrapping_add(origin as u8); 32]));
                handles.push(std::thread::spawn(move || {
                    let mut observed = Vec::new();
                    for sequence in updates {
                        let update = processor.update(sequence * 10, sequence, origin).unwrap();
                        observed.push(update);
                    }
                    observed
                }));
            }
            for handle in handles {
                let observed = handle.join().expect("origin thread should not panic");
                for update in observed {
                    assert!(update.current >= update.previous);
                }
            }
            assert_eq!(processor.global(), 1000);
        }
    }
}
