use guardian_common::{block::BlockRef, deposit::DepositEvent};
use serde::{Deserialize, Serialize};

/// One indexed slice of deposit history covering the half-open block range
/// `[from, to)`.
///
/// `tail` is the canonical reference of block `to - 1` as seen while
/// indexing; comparing it against a fresh provider read is how reorgs are
/// detected without rescanning the events themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSegment {
    pub from: u64,
    pub to: u64,
    pub tail: BlockRef,
    pub events: Vec<DepositEvent>,
}

impl EventSegment {
    pub fn new(from: u64, to: u64, tail: BlockRef, mut events: Vec<DepositEvent>) -> Self {
        debug_assert!(from < to, "segment range must be non-empty");
        debug_assert_eq!(tail.number, to - 1, "tail must reference block to - 1");
        events.sort();
        Self {
            from,
            to,
            tail,
            events,
        }
    }

    pub fn file_name(&self) -> String {
        format!("events-{}-{}.bin", self.from, self.to)
    }

    pub fn contains_block(&self, number: u64) -> bool {
        self.from <= number && number < self.to
    }

    /// Sealed segments are immutable: old enough that a reorg across them
    /// is treated as an operator emergency
    pub fn is_sealed_at(&self, head: u64, finalization_depth: u64) -> bool {
        self.to <= head.saturating_sub(finalization_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn segment(from: u64, to: u64) -> EventSegment {
        EventSegment::new(
            from,
            to,
            BlockRef::new(to - 1, B256::with_last_byte((to - 1) as u8), 0),
            vec![],
        )
    }

    #[test]
    fn file_name_encodes_range() {
        assert_eq!(segment(0, 10_000).file_name(), "events-0-10000.bin");
    }

    #[test]
    fn sealing_uses_finalization_depth() {
        let seg = segment(0, 100);
        assert!(seg.is_sealed_at(164, 64));
        assert!(!seg.is_sealed_at(163, 64));
    }

    #[test]
    fn contains_is_half_open() {
        let seg = segment(10, 20);
        assert!(seg.contains_block(10));
        assert!(seg.contains_block(19));
        assert!(!seg.contains_block(20));
    }
}
