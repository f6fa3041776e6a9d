//! Sounding Reference Signal Offsets
//!
//! Every UE sounds the uplink once per period, in the slot matching its
//! offset. Offsets are handed out once, so at most one UE sounds per slot;
//! when they run out the period moves to the next standard value and every
//! UE gets a new offset.

use crate::LayerError;
use common::types::SfnSf;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Periodicities in slots allowed by TS 38.331 for SRS resources
pub const STANDARD_PERIODICITY: [u32; 16] =
    [2, 4, 5, 8, 10, 16, 20, 32, 40, 64, 80, 160, 320, 640, 1280, 2560];

pub fn validate_periodicity(periodicity: u32) -> Result<(), LayerError> {
    if STANDARD_PERIODICITY.contains(&periodicity) {
        Ok(())
    } else {
        Err(LayerError::InvalidConfiguration(format!(
            "SRS periodicity {} is not one of {:?}", periodicity, STANDARD_PERIODICITY
        )))
    }
}

/// Sounding occasion of one UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrsSlot {
    pub periodicity: u32,
    pub offset: u32,
}

impl SrsSlot {
    pub fn is_due(&self, sfn: &SfnSf) -> bool {
        sfn.normalized() % self.periodicity as u64 == self.offset as u64
    }
}

/// Pool of free offsets for the current periodicity
#[derive(Debug, Clone)]
pub struct SrsAllocator {
    periodicity: u32,
    /// Popped from the back, so offset 0 goes first
    available: Vec<u32>,
}

impl SrsAllocator {
    pub fn new(periodicity: u32) -> Result<Self, LayerError> {
        validate_periodicity(periodicity)?;
        Ok(Self { periodicity, available: (0..periodicity).rev().collect() })
    }

    pub fn periodicity(&self) -> u32 {
        self.periodicity
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Next free offset, `None` once every offset is taken
    pub fn add_ue(&mut self) -> Option<SrsSlot> {
        self.available.pop().map(|offset| SrsSlot { periodicity: self.periodicity, offset })
    }

    /// Give an offset back; offsets of an older periodicity are ignored
    pub fn remove_ue(&mut self, slot: SrsSlot) {
        if slot.periodicity == self.periodicity && !self.available.contains(&slot.offset) {
            self.available.push(slot.offset);
        }
    }

    /// Move to the next standard periodicity with a full pool of offsets.
    ///
    /// Returns false, leaving the pool untouched, at the largest periodicity.
    /// Offsets handed out before are stale afterwards.
    pub fn increase_periodicity(&mut self) -> bool {
        let Some(&next) = STANDARD_PERIODICITY.iter().find(|&&p| p > self.periodicity) else {
            return false;
        };
        debug!("SRS periodicity {} -> {}", self.periodicity, next);
        self.periodicity = next;
        self.available = (0..next).rev().collect();
        true
    }

    pub fn is_max_reached(&self) -> bool {
        self.available.is_empty() && STANDARD_PERIODICITY.last() == Some(&self.periodicity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_unique_and_reused() {
        let mut srs = SrsAllocator::new(4).unwrap();
        let slots: Vec<SrsSlot> = (0..4).map(|_| srs.add_ue().unwrap()).collect();
        let offsets: Vec<u32> = slots.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert!(srs.add_ue().is_none());

        srs.remove_ue(slots[2]);
        srs.remove_ue(slots[2]);
        assert_eq!(srs.available(), 1);
        assert_eq!(srs.add_ue().map(|s| s.offset), Some(2));
    }

    #[test]
    fn test_due_once_per_period() {
        let slot = SrsSlot { periodicity: 5, offset: 3 };
        let start = SfnSf::origin(1).unwrap();
        let due: Vec<u64> = (0..20).filter(|&n| slot.is_due(&start.add_slots(n))).collect();
        assert_eq!(due, vec![3, 8, 13, 18]);
    }

    #[test]
    fn test_increase_walks_standard_values() {
        assert!(SrsAllocator::new(3).is_err());
        let mut srs = SrsAllocator::new(1280).unwrap();
        let stale = srs.add_ue().unwrap();
        assert!(srs.increase_periodicity());
        assert_eq!(srs.periodicity(), 2560);
        assert_eq!(srs.available(), 2560);
        srs.remove_ue(stale);
        assert_eq!(srs.available(), 2560);
        assert!(!srs.increase_periodicity());
        assert!(!srs.is_max_reached());
    }
}
