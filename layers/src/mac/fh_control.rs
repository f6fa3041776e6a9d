//! Fronthaul Control
//!
//! Admission control of DL/UL data allocations against the fronthaul
//! capacity of the cell. Depending on the configured method the scheduler
//! either limits what it allocates (postpone, reduce MCS, cap RBGs) or the
//! PHY drops what does not fit before transmission.

use super::alloc::{DciFormat, DciInfoElementTdma, DciType, SlotAllocInfo};
use crate::LayerError;
use crate::phy::amc::SUBCARRIERS_PER_RB;
use crate::phy::error_model::ErrorModelType;
use crate::phy::mcs_tables::McsTable;
use common::types::Rnti;
use common::utils::cantor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// MAC CRC bytes not counted as queue payload
const MAC_CRC_BYTES: u32 = 3;

/// What happens to allocations exceeding the fronthaul capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FhControlMethod {
    /// PHY drops them before transmission
    Dropping,
    /// Scheduler leaves the UE out of this slot
    Postponing,
    /// Scheduler lowers the modulation order until they fit
    OptimizeMcs,
    /// Scheduler caps the RBGs assigned per UE
    OptimizeRBs,
}

fn default_capacity() -> u32 {
    1000
}

fn default_overhead() -> u32 {
    32
}

/// Fronthaul limits of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FhControlConfig {
    pub method: FhControlMethod,
    /// Mbps
    #[serde(default = "default_capacity")]
    pub capacity_mbps: u32,
    /// Dynamic overhead bits per resource element group
    #[serde(default = "default_overhead")]
    pub overhead_dyn: u32,
}

impl Default for FhControlConfig {
    fn default() -> Self {
        Self {
            method: FhControlMethod::Dropping,
            capacity_mbps: default_capacity(),
            overhead_dyn: default_overhead(),
        }
    }
}

impl FhControlConfig {
    pub fn set_capacity_mbps(&mut self, capacity_mbps: u32) -> Result<(), LayerError> {
        let previous = std::mem::replace(&mut self.capacity_mbps, capacity_mbps);
        self.validate().inspect_err(|_| self.capacity_mbps = previous)
    }

    /// Overhead bits added per resource element group
    pub fn set_overhead_dyn(&mut self, overhead_dyn: u32) -> Result<(), LayerError> {
        let previous = std::mem::replace(&mut self.overhead_dyn, overhead_dyn);
        self.validate().inspect_err(|_| self.overhead_dyn = previous)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if self.capacity_mbps > 50_000 {
            return Err(LayerError::InvalidConfiguration(format!(
                "fronthaul capacity {} Mbps outside 0..=50000", self.capacity_mbps
            )));
        }
        if self.overhead_dyn > 100 {
            return Err(LayerError::InvalidConfiguration(format!(
                "fronthaul dynamic overhead {} outside 0..=100", self.overhead_dyn
            )));
        }
        Ok(())
    }
}

/// Scheduler parameters fronthaul control needs to size allocations
pub trait FhSchedUser: Send + Sync {
    fn num_rb_per_rbg(&self) -> u32;
    fn numerology(&self) -> u8;
}

/// Operations the scheduler performs on fronthaul control
pub trait FhSchedProvider {
    fn method(&self) -> FhControlMethod;
    fn does_allocation_fit(&self, bwp: u16, mcs: u8, n_regs: u32, rank: u8) -> Result<bool, LayerError>;
    fn record_allocation(&mut self, bwp: u16, mcs: u8, n_regs: u32, rank: u8) -> Result<(), LayerError>;
    fn max_mcs_assignable(&self, bwp: u16, n_regs: u32, rank: u8) -> Result<Option<u8>, LayerError>;
    fn max_rbgs_assignable(&self, bwp: u16, mcs: u8, rank: u8, num_sym: u8) -> Result<usize, LayerError>;
    fn set_active_ue(&mut self, bwp: u16, rnti: Rnti, bytes: u32);
    fn update_active_ues_map(&mut self, bwp: u16, allocation: &SlotAllocInfo) -> Result<(), LayerError>;
}

/// Operations the PHY performs on fronthaul control
pub trait FhPhyProvider {
    fn method(&self) -> FhControlMethod;
    fn filter_for_transmission(&mut self, bwp: u16, slot: &mut SlotAllocInfo)
        -> Result<Vec<Arc<DciInfoElementTdma>>, LayerError>;
}

/// Fronthaul admission control of one cell
pub struct FhControl {
    config: FhControlConfig,
    mcs_table: McsTable,
    sched: Option<Arc<dyn FhSchedUser>>,
    /// Bytes queued per cantor(bwp, rnti)
    rnti_queue_size: HashMap<u64, u32>,
    /// UEs with data per BWP
    active_ues: HashMap<u16, HashSet<u16>>,
    /// Mbps committed in the current slot per BWP
    allocated_thr: HashMap<u16, f64>,
}

impl std::fmt::Debug for FhControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhControl")
            .field("config", &self.config)
            .field("mcs_table", &self.mcs_table)
            .field("attached", &self.sched.is_some())
            .field("active_ues", &self.active_ues)
            .finish()
    }
}

impl FhControl {
    pub fn new(config: FhControlConfig, error_model: ErrorModelType) -> Result<Self, LayerError> {
        config.validate()?;
        Ok(Self {
            config,
            mcs_table: error_model.mcs_table(),
            sched: None,
            rnti_queue_size: HashMap::new(),
            active_ues: HashMap::new(),
            allocated_thr: HashMap::new(),
        })
    }

    pub fn config(&self) -> &FhControlConfig {
        &self.config
    }

    pub fn method(&self) -> FhControlMethod {
        self.config.method
    }

    pub fn attach_scheduler(&mut self, sched: Arc<dyn FhSchedUser>) {
        self.sched = Some(sched);
    }

    fn sched(&self) -> Result<&Arc<dyn FhSchedUser>, LayerError> {
        self.sched.as_ref()
            .ok_or_else(|| LayerError::MissingSap("fronthaul control has no scheduler attached".into()))
    }

    pub fn num_rb_per_rbg_from_sched(&self) -> Result<u32, LayerError> {
        Ok(self.sched()?.num_rb_per_rbg())
    }

    /// Forget the throughput committed in the previous slot
    pub fn begin_slot(&mut self) {
        self.allocated_thr.clear();
    }

    pub fn allocated_throughput(&self, bwp: u16) -> f64 {
        self.allocated_thr.get(&bwp).copied().unwrap_or(0.0)
    }

    fn committed(&self) -> f64 {
        self.allocated_thr.values().sum()
    }

    fn required_for_qm(&self, qm: u8, n_regs: u32, rank: u8) -> Result<f64, LayerError> {
        let numerology = self.sched()?.numerology();
        let bits = n_regs as f64 * SUBCARRIERS_PER_RB as f64 * rank as f64 * qm as f64
            + n_regs as f64 * self.config.overhead_dyn as f64;
        Ok(bits * 1000.0 * (1u32 << numerology) as f64 / 1e6)
    }

    /// Mbps needed to carry `n_regs` RB-symbols at `mcs` and `rank`
    pub fn required_throughput(&self, mcs: u8, n_regs: u32, rank: u8) -> Result<f64, LayerError> {
        self.required_for_qm(self.mcs_table.modulation_order(mcs), n_regs, rank)
    }

    fn fits(&self, required: f64) -> bool {
        self.committed() + required <= self.config.capacity_mbps as f64
    }

    /// DL queue bookkeeping of a UE
    pub fn queued_bytes(&self, bwp: u16, rnti: Rnti) -> Option<u32> {
        self.rnti_queue_size.get(&cantor(bwp, rnti.0)).copied()
    }

    pub fn is_active(&self, bwp: u16, rnti: Rnti) -> bool {
        self.active_ues.get(&bwp).is_some_and(|s| s.contains(&rnti.0))
    }

    fn remove_ue(&mut self, bwp: u16, rnti: u16) {
        self.rnti_queue_size.remove(&cantor(bwp, rnti));
        if let Some(set) = self.active_ues.get_mut(&bwp) {
            set.remove(&rnti);
            if set.is_empty() {
                self.active_ues.remove(&bwp);
            }
        }
    }

    /// Drop every trace of a UE
    pub fn release_ue(&mut self, bwp: u16, rnti: Rnti) {
        self.remove_ue(bwp, rnti.0);
    }
}

impl FhSchedProvider for FhControl {
    fn method(&self) -> FhControlMethod {
        self.config.method
    }

    fn does_allocation_fit(&self, bwp: u16, mcs: u8, n_regs: u32, rank: u8) -> Result<bool, LayerError> {
        let required = self.required_throughput(mcs, n_regs, rank)?;
        let fits = self.fits(required);
        trace!(bwp, mcs, n_regs, rank, "FH requires {:.3} Mbps, committed {:.3}, fits={}", required, self.committed(), fits);
        Ok(fits)
    }

    fn record_allocation(&mut self, bwp: u16, mcs: u8, n_regs: u32, rank: u8) -> Result<(), LayerError> {
        let required = self.required_throughput(mcs, n_regs, rank)?;
        *self.allocated_thr.entry(bwp).or_insert(0.0) += required;
        Ok(())
    }

    fn max_mcs_assignable(&self, bwp: u16, n_regs: u32, rank: u8) -> Result<Option<u8>, LayerError> {
        for &qm in self.mcs_table.modulation_orders().iter().rev() {
            if self.fits(self.required_for_qm(qm, n_regs, rank)?) {
                let mcs = self.mcs_table.max_mcs_for_modulation(qm);
                trace!(bwp, "FH max MCS {:?} (Qm {})", mcs, qm);
                return Ok(mcs);
            }
        }
        Ok(None)
    }

    fn max_rbgs_assignable(&self, bwp: u16, mcs: u8, rank: u8, num_sym: u8) -> Result<usize, LayerError> {
        let rb_per_rbg = self.num_rb_per_rbg_from_sched()?;
        let per_rbg = self.required_throughput(mcs, rb_per_rbg * num_sym as u32, rank)?;
        if per_rbg <= 0.0 {
            return Ok(usize::MAX);
        }
        let remaining = (self.config.capacity_mbps as f64 - self.committed()).max(0.0);
        let rbgs = (remaining / per_rbg).floor() as usize;
        trace!(bwp, mcs, rank, num_sym, "FH allows {} RBGs", rbgs);
        Ok(rbgs)
    }

    fn set_active_ue(&mut self, bwp: u16, rnti: Rnti, bytes: u32) {
        let key = cantor(bwp, rnti.0);
        if bytes == 0 {
            self.remove_ue(bwp, rnti.0);
            return;
        }
        self.rnti_queue_size.insert(key, bytes);
        self.active_ues.entry(bwp).or_default().insert(rnti.0);
    }

    fn update_active_ues_map(&mut self, bwp: u16, allocation: &SlotAllocInfo) -> Result<(), LayerError> {
        for alloc in &allocation.var_tti_alloc_info {
            let dci = &alloc.dci;
            if dci.dci_type == DciType::Ctrl || dci.format == DciFormat::Ul {
                continue;
            }
            if self.rnti_queue_size.is_empty() && !self.active_ues.is_empty() {
                return Err(LayerError::InternalInconsistency(
                    "fronthaul has active UEs but no queued bytes".into()
                ));
            }
            let key = cantor(bwp, dci.rnti.0);
            let Some(&queued) = self.rnti_queue_size.get(&key) else {
                debug!(bwp, rnti = %dci.rnti, "FH queue unknown, skipping");
                continue;
            };
            let served = dci.tb_size.saturating_sub(MAC_CRC_BYTES);
            if queued > served {
                self.rnti_queue_size.insert(key, queued - served);
            } else {
                trace!(bwp, rnti = %dci.rnti, "FH queue drained");
                self.remove_ue(bwp, dci.rnti.0);
            }
        }
        Ok(())
    }
}

impl FhPhyProvider for FhControl {
    fn method(&self) -> FhControlMethod {
        self.config.method
    }

    fn filter_for_transmission(&mut self, bwp: u16, slot: &mut SlotAllocInfo)
        -> Result<Vec<Arc<DciInfoElementTdma>>, LayerError>
    {
        let rb_per_rbg = self.num_rb_per_rbg_from_sched()?;
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(slot.var_tti_alloc_info.len());
        for alloc in std::mem::take(&mut slot.var_tti_alloc_info) {
            let dci = &alloc.dci;
            if dci.dci_type != DciType::Data {
                kept.push(alloc);
                continue;
            }
            let n_regs = dci.num_rbgs() as u32 * rb_per_rbg * dci.num_sym as u32;
            if FhSchedProvider::does_allocation_fit(self, bwp, dci.mcs, n_regs, dci.rank)? {
                self.record_allocation(bwp, dci.mcs, n_regs, dci.rank)?;
                kept.push(alloc);
            } else {
                warn!(bwp, rnti = %dci.rnti, "FH capacity exceeded, dropping {} DCI", dci.format);
                dropped.push(alloc.dci);
            }
        }
        slot.var_tti_alloc_info = kept;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::alloc::VarTtiAllocInfo;
    use common::types::SfnSf;

    struct View;

    impl FhSchedUser for View {
        fn num_rb_per_rbg(&self) -> u32 {
            4
        }
        fn numerology(&self) -> u8 {
            0
        }
    }

    fn fh(method: FhControlMethod, capacity: u32) -> FhControl {
        let config = FhControlConfig { method, capacity_mbps: capacity, overhead_dyn: 32 };
        let mut fh = FhControl::new(config, ErrorModelType::EesmCcT1).unwrap();
        fh.attach_scheduler(Arc::new(View));
        fh
    }

    fn dl_data(rnti: u16, rbgs: usize, tb_size: u32) -> VarTtiAllocInfo {
        let mut dci = DciInfoElementTdma::ctrl(DciFormat::Dl, 2, 12, 0, 8);
        dci.dci_type = DciType::Data;
        dci.rnti = Rnti(rnti);
        dci.tb_size = tb_size;
        dci.rbg_bitmask = (0..8).map(|i| i < rbgs).collect();
        VarTtiAllocInfo::new(dci)
    }

    #[test]
    fn test_config_bounds() {
        assert!(FhControlConfig::default().validate().is_ok());
        let mut c = FhControlConfig::default();
        c.capacity_mbps = 50_001;
        assert!(c.validate().is_err());
        c.capacity_mbps = 10;
        c.overhead_dyn = 101;
        assert!(FhControl::new(c, ErrorModelType::EesmCcT1).is_err());
    }

    #[test]
    fn test_required_throughput() {
        let fh = fh(FhControlMethod::Dropping, 1000);
        // 48 REGs, QPSK: 48*12*2 + 48*32 = 2688 bits per 1 ms slot
        let thr = fh.required_throughput(0, 48, 1).unwrap();
        assert!((thr - 2.688).abs() < 1e-9);
    }

    #[test]
    fn test_missing_scheduler_is_reported() {
        let fh = FhControl::new(FhControlConfig::default(), ErrorModelType::EesmCcT1).unwrap();
        assert!(matches!(fh.num_rb_per_rbg_from_sched(), Err(LayerError::MissingSap(_))));
        assert!(fh.does_allocation_fit(0, 0, 48, 1).is_err());
    }

    #[test]
    fn test_fit_is_read_only_and_slot_scoped() {
        let mut fh = fh(FhControlMethod::Postponing, 5);
        assert!(fh.does_allocation_fit(0, 0, 48, 1).unwrap());
        assert!(fh.does_allocation_fit(0, 0, 48, 1).unwrap());
        fh.record_allocation(0, 0, 48, 1).unwrap();
        assert!(!fh.does_allocation_fit(0, 0, 48, 1).unwrap());
        fh.begin_slot();
        assert!(fh.does_allocation_fit(0, 0, 48, 1).unwrap());
    }

    #[test]
    fn test_max_mcs_and_rbgs() {
        let fh = fh(FhControlMethod::OptimizeMcs, 4);
        // 64QAM needs 48*(72+32) = 4.992 Mbps, 16QAM 48*(48+32) = 3.84 Mbps
        assert_eq!(fh.max_mcs_assignable(0, 48, 1).unwrap(), Some(16));
        assert_eq!(fh.max_mcs_assignable(0, 480, 1).unwrap(), None);

        let fh = self::fh(FhControlMethod::OptimizeRBs, 10);
        assert_eq!(fh.max_rbgs_assignable(0, 0, 1, 12).unwrap(), 3);
    }

    #[test]
    fn test_active_ue_map_follows_served_bytes() {
        let mut fh = fh(FhControlMethod::Dropping, 1000);
        fh.set_active_ue(0, Rnti(1), 500);
        fh.set_active_ue(0, Rnti(2), 100);

        let mut slot = SlotAllocInfo::new(SfnSf::origin(0).unwrap());
        slot.var_tti_alloc_info.push(VarTtiAllocInfo::new(DciInfoElementTdma::ctrl(DciFormat::Dl, 0, 1, 0, 8)));
        slot.var_tti_alloc_info.push(dl_data(1, 2, 203));
        slot.var_tti_alloc_info.push(dl_data(2, 2, 203));
        slot.var_tti_alloc_info.push(dl_data(9, 2, 203));
        fh.update_active_ues_map(0, &slot).unwrap();

        assert_eq!(fh.queued_bytes(0, Rnti(1)), Some(300));
        assert!(fh.is_active(0, Rnti(1)));
        assert_eq!(fh.queued_bytes(0, Rnti(2)), None);
        assert!(!fh.is_active(0, Rnti(2)));
    }

    #[test]
    fn test_inconsistent_maps_are_fatal() {
        let mut fh = fh(FhControlMethod::Dropping, 1000);
        fh.active_ues.entry(0).or_default().insert(1);
        let mut slot = SlotAllocInfo::new(SfnSf::origin(0).unwrap());
        slot.var_tti_alloc_info.push(dl_data(1, 1, 50));
        assert!(matches!(fh.update_active_ues_map(0, &slot), Err(LayerError::InternalInconsistency(_))));
    }

    #[test]
    fn test_dropping_filters_excess() {
        // Each 2-RBG, 12-symbol QPSK allocation needs 5.376 Mbps
        let mut fh = fh(FhControlMethod::Dropping, 11);
        let mut slot = SlotAllocInfo::new(SfnSf::origin(0).unwrap());
        for rnti in 1..=3 {
            slot.var_tti_alloc_info.push(dl_data(rnti, 2, 100));
        }
        let dropped = fh.filter_for_transmission(0, &mut slot).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].rnti, Rnti(3));
        assert_eq!(slot.var_tti_alloc_info.len(), 2);
    }
}
