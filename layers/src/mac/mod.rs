//! Medium Access Control (MAC) Layer Implementation
//!
//! gNB MAC scheduler of one BWP: UE and logical channel bookkeeping, HARQ,
//! CQI-driven link adaptation, fronthaul admission and per-slot DCIs.

pub mod alloc;
pub mod config;
pub mod cqi_management;
pub mod fh_control;
pub mod harq;
pub mod lc;
pub mod scheduler;
pub mod slot_pattern;
pub mod srs;
pub mod ue_info;

use crate::LayerError;
use common::types::SfnSf;

pub use alloc::{
    AllocationType, DciFormat, DciInfoElementTdma, DciType, RlcPduInfo, SlotAllocInfo, VarTtiAllocInfo,
};
pub use config::{AccessMode, CarrierConfig, SchedulerConfig};
pub use cqi_management::{CqiManagement, DlCqiInfo};
pub use fh_control::{FhControl, FhControlConfig, FhControlMethod, FhPhyProvider, FhSchedProvider, FhSchedUser};
pub use harq::{FeedbackOutcome, HarqFailure, HarqProcesses};
pub use scheduler::{Coreset0Config, MacScheduler};
pub use slot_pattern::{SlotPattern, SlotType};
pub use srs::{SrsAllocator, SrsSlot};
pub use ue_info::{SchedulerUeInfo, SchedulingPolicy};

/// MAC-PHY interface for scheduling information
pub trait MacPhyInterface {
    /// Allocation the PHY has to transmit (DL) or receive (UL) in `sfn`
    fn get_slot_allocation(&mut self, sfn: SfnSf) -> Result<SlotAllocInfo, LayerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(phy_side: &mut dyn MacPhyInterface, slots: u64) -> Vec<SlotAllocInfo> {
        let start = SfnSf::origin(1).unwrap();
        (0..slots)
            .map(|n| phy_side.get_slot_allocation(start.add_slots(n)).unwrap())
            .collect()
    }

    #[test]
    fn test_phy_pulls_allocations_in_order() {
        let mut config = SchedulerConfig::default();
        config.carrier.numerology = 1;
        let mut mac = MacScheduler::new(config).unwrap();
        let slots = drive(&mut mac, 4);
        assert_eq!(slots.len(), 4);
        for (n, slot) in slots.iter().enumerate() {
            assert_eq!(slot.sfn_sf.normalized(), n as u64);
            assert!(slot.contains_dl_ctrl_allocation());
        }
    }
}
