//! Per-UE Scheduling State
//!
//! Link adaptation results, current allocation, throughput averages and
//! queues of one UE, plus the ranking metrics built on top of them.

use super::harq::HarqProcesses;
use super::lc::{self, LogicalChannelGroup};
use super::srs::SrsSlot;
use crate::phy::amc::Amc;
use crate::phy::mimo::ComplexMatrixArray;
use common::types::{LinkDirection, Rnti};
use interfaces::CqiType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Floor of the average throughput in the PF denominator
const MIN_AVG_TPUT: f64 = 1e-9;

/// How UEs are ranked for new data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// Fewest resources first
    RoundRobin,
    /// Potential over average throughput
    ProportionalFair,
    /// Proportional fair weighted by 5QI priority of the active channels
    Qos,
}

/// Latest downlink channel state
#[derive(Debug, Clone, PartialEq)]
pub struct DlCqiState {
    pub cqi_type: CqiType,
    pub wb_cqi: u8,
    pub sb_cqis: Vec<u8>,
    /// Slots until the report expires
    pub timer: u32,
}

impl Default for DlCqiState {
    fn default() -> Self {
        Self { cqi_type: CqiType::Wideband, wb_cqi: 1, sb_cqis: Vec::new(), timer: 0 }
    }
}

/// Latest uplink channel state
#[derive(Debug, Clone, PartialEq)]
pub struct UlCqiState {
    pub cqi_type: CqiType,
    pub wb_cqi: u8,
    /// Linear SINR of the last measured RBs
    pub sinr: Vec<f64>,
    pub timer: u32,
}

impl Default for UlCqiState {
    fn default() -> Self {
        Self { cqi_type: CqiType::Wideband, wb_cqi: 1, sinr: Vec::new(), timer: 0 }
    }
}

/// Allocation and throughput state of one direction
#[derive(Debug, Clone)]
pub struct LinkState {
    pub mcs: u8,
    pub rank: u8,
    /// RBGs assigned in the current slot
    pub rbgs: Vec<usize>,
    /// Symbols assigned in the current slot
    pub sym: u8,
    /// TB size in bytes of the current assignment
    pub tb_size: u32,
    pub curr_tput: f64,
    pub avg_tput: f64,
    pub last_avg_tput: f64,
    pub potential_tput: f64,
    pub lcgs: BTreeMap<u8, LogicalChannelGroup>,
    pub harq: HarqProcesses,
}

impl LinkState {
    fn new(rnti: Rnti, direction: LinkDirection, start_mcs: u8, harq_processes: u8, max_retx: u8) -> Self {
        Self {
            mcs: start_mcs,
            rank: 1,
            rbgs: Vec::new(),
            sym: 0,
            tb_size: 0,
            curr_tput: 0.0,
            avg_tput: 0.0,
            last_avg_tput: 0.0,
            potential_tput: 0.0,
            lcgs: BTreeMap::new(),
            harq: HarqProcesses::new(rnti, direction, harq_processes, max_retx),
        }
    }

    pub fn buffered_bytes(&self) -> u32 {
        lc::total_bytes(&self.lcgs)
    }

    /// Clear the assignment at the start of a slot
    pub fn reset_assignment(&mut self) {
        self.rbgs.clear();
        self.sym = 0;
        self.tb_size = 0;
        self.curr_tput = 0.0;
        self.avg_tput = self.last_avg_tput;
        self.potential_tput = 0.0;
    }

    /// Refresh TB size and throughput averages after an assignment step
    pub fn update_metric(&mut self, amc: &Amc, rb_per_rbg: u32, time_window: f64) {
        let rb_sym = self.rbgs.len() as u32 * rb_per_rbg * self.sym as u32;
        let tb_size = amc.calculate_tb_size(self.mcs, self.rank, rb_sym);
        self.set_transmitted(tb_size, time_window);
    }

    /// Account a TB of `tb_size` bytes over the assigned symbols
    pub fn set_transmitted(&mut self, tb_size: u32, time_window: f64) {
        self.tb_size = tb_size;
        self.curr_tput = if self.sym > 0 { tb_size as f64 / self.sym as f64 } else { 0.0 };
        self.avg_tput = (1.0 - 1.0 / time_window) * self.last_avg_tput + (1.0 / time_window) * self.curr_tput;
    }

    /// Close the slot: commit the average (decaying it when nothing was assigned)
    pub fn commit_average(&mut self, time_window: f64) {
        if self.tb_size == 0 {
            self.curr_tput = 0.0;
            self.avg_tput = (1.0 - 1.0 / time_window) * self.last_avg_tput;
        }
        self.last_avg_tput = self.avg_tput;
    }

    /// Throughput reachable with `rbgs` more RBGs over `sym` symbols
    pub fn calculate_potential_tput(&mut self, amc: &Amc, rbgs: u32, rb_per_rbg: u32, sym: u8) {
        self.potential_tput = if rbgs == 0 || sym == 0 {
            0.0
        } else {
            amc.payload_size(self.mcs, self.rank, rbgs * rb_per_rbg * sym as u32) as f64 / sym as f64
        };
    }

    /// `potential^alpha / max(eps, avg)`
    pub fn pf_metric(&self, fairness_index: f64) -> f64 {
        self.potential_tput.powf(fairness_index) / self.avg_tput.max(MIN_AVG_TPUT)
    }

    /// PF metric weighted by `(100 - priority)` of every active channel
    pub fn qos_metric(&self, fairness_index: f64) -> f64 {
        let pf = self.pf_metric(fairness_index);
        self.lcgs.values()
            .flat_map(|g| g.active_lcs())
            .map(|lc| (100u32.saturating_sub(lc.qci.priority_level() as u32)) as f64 * pf)
            .sum()
    }

    pub fn metric(&self, policy: SchedulingPolicy, fairness_index: f64) -> f64 {
        match policy {
            // Fewer RBG-symbols rank higher
            SchedulingPolicy::RoundRobin => -((self.rbgs.len() * self.sym as usize) as f64),
            SchedulingPolicy::ProportionalFair => self.pf_metric(fairness_index),
            SchedulingPolicy::Qos => self.qos_metric(fairness_index),
        }
    }
}

/// Everything the scheduler tracks about one UE
#[derive(Debug, Clone)]
pub struct SchedulerUeInfo {
    pub rnti: Rnti,
    pub bwp_id: u16,
    pub dl: LinkState,
    pub ul: LinkState,
    pub dl_cqi: DlCqiState,
    pub ul_cqi: UlCqiState,
    pub dl_prec_mats: Option<Arc<ComplexMatrixArray>>,
    /// MCS per DL subband, empty for wideband reports
    pub dl_sb_mcs: Vec<u8>,
    /// Subband index of every RBG
    pub rbg_to_sb: Vec<usize>,
    /// Ceiling imposed by fronthaul control for the current slot
    pub fh_max_mcs: Option<u8>,
    pub ul_fh_max_mcs: Option<u8>,
    /// Sounding occasion, `None` when SRS is off or no offset was left
    pub srs: Option<SrsSlot>,
}

impl SchedulerUeInfo {
    pub fn new(rnti: Rnti, bwp_id: u16, start_dl_mcs: u8, start_ul_mcs: u8, harq_processes: u8, max_retx: u8) -> Self {
        Self {
            rnti,
            bwp_id,
            dl: LinkState::new(rnti, LinkDirection::Downlink, start_dl_mcs, harq_processes, max_retx),
            ul: LinkState::new(rnti, LinkDirection::Uplink, start_ul_mcs, harq_processes, max_retx),
            dl_cqi: DlCqiState::default(),
            ul_cqi: UlCqiState::default(),
            dl_prec_mats: None,
            dl_sb_mcs: Vec::new(),
            rbg_to_sb: Vec::new(),
            fh_max_mcs: None,
            ul_fh_max_mcs: None,
            srs: None,
        }
    }

    pub fn link(&self, direction: LinkDirection) -> &LinkState {
        match direction {
            LinkDirection::Downlink => &self.dl,
            LinkDirection::Uplink => &self.ul,
        }
    }

    pub fn link_mut(&mut self, direction: LinkDirection) -> &mut LinkState {
        match direction {
            LinkDirection::Downlink => &mut self.dl,
            LinkDirection::Uplink => &mut self.ul,
        }
    }

    /// DL MCS to use with the current RBG assignment
    pub fn dl_mcs(&self) -> u8 {
        if let Some(mcs) = self.fh_max_mcs {
            return mcs;
        }
        let sb: Vec<u8> = self.dl.rbgs.iter()
            .filter_map(|&rbg| self.rbg_to_sb.get(rbg))
            .filter_map(|&sb| self.dl_sb_mcs.get(sb).copied())
            .collect();
        if sb.is_empty() {
            self.dl.mcs
        } else {
            (sb.iter().map(|&m| m as u32).sum::<u32>() / sb.len() as u32) as u8
        }
    }

    pub fn ul_mcs(&self) -> u8 {
        self.ul_fh_max_mcs.unwrap_or(self.ul.mcs)
    }

    pub fn mcs(&self, direction: LinkDirection) -> u8 {
        match direction {
            LinkDirection::Downlink => self.dl_mcs(),
            LinkDirection::Uplink => self.ul_mcs(),
        }
    }

    /// Drop the per-slot state of both directions
    pub fn reset_slot(&mut self) {
        self.dl.reset_assignment();
        self.ul.reset_assignment();
        self.fh_max_mcs = None;
        self.ul_fh_max_mcs = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::lc::LogicalChannel;
    use crate::phy::amc::AmcModel;
    use crate::phy::error_model::ErrorModelType;
    use common::types::Qci;

    fn amc() -> Amc {
        Amc::from_type(ErrorModelType::EesmCcT1, AmcModel::ErrorModel, LinkDirection::Downlink)
    }

    fn ue() -> SchedulerUeInfo {
        SchedulerUeInfo::new(Rnti(1), 0, 10, 5, 16, 3)
    }

    #[test]
    fn test_average_uses_time_window() {
        let amc = amc();
        let mut u = ue();
        u.dl.last_avg_tput = 100.0;
        u.dl.rbgs = vec![0, 1];
        u.dl.sym = 10;
        u.dl.update_metric(&amc, 4, 10.0);
        let curr = u.dl.tb_size as f64 / 10.0;
        assert!((u.dl.curr_tput - curr).abs() < 1e-12);
        assert!((u.dl.avg_tput - (0.9 * 100.0 + 0.1 * curr)).abs() < 1e-9);
        u.dl.commit_average(10.0);
        assert_eq!(u.dl.last_avg_tput, u.dl.avg_tput);
    }

    #[test]
    fn test_unserved_average_decays() {
        let mut u = ue();
        u.ul.last_avg_tput = 50.0;
        u.ul.reset_assignment();
        u.ul.commit_average(10.0);
        assert!((u.ul.last_avg_tput - 45.0).abs() < 1e-12);
    }

    #[test]
    fn test_potential_is_fresh_and_zero_without_resources() {
        let amc = amc();
        let mut u = ue();
        u.dl.calculate_potential_tput(&amc, 1, 4, 12);
        let first = u.dl.potential_tput;
        assert!(first > 0.0);
        u.dl.calculate_potential_tput(&amc, 1, 4, 12);
        assert_eq!(u.dl.potential_tput, first);
        u.dl.calculate_potential_tput(&amc, 0, 4, 12);
        assert_eq!(u.dl.potential_tput, 0.0);
    }

    #[test]
    fn test_pf_metric_is_potential_over_average() {
        let mut u = ue();
        u.dl.potential_tput = 30.0;
        u.dl.avg_tput = 10.0;
        assert!((u.dl.pf_metric(1.0) - 3.0).abs() < 1e-12);
        u.dl.avg_tput = 0.0;
        assert!(u.dl.pf_metric(1.0) > 1e9);
    }

    #[test]
    fn test_qos_weights_by_priority() {
        let mut u = ue();
        u.dl.potential_tput = 10.0;
        u.dl.avg_tput = 10.0;
        let mut g = LogicalChannelGroup::default();
        let mut voice = LogicalChannel::new(4, Qci::VOICE);
        voice.tx_queue = 10;
        g.insert(voice);
        u.dl.lcgs.insert(1, g);
        // Priority level 20 gives weight 80
        assert!((u.dl.metric(SchedulingPolicy::Qos, 1.0) - 80.0).abs() < 1e-9);
        assert_eq!(u.dl.metric(SchedulingPolicy::RoundRobin, 1.0), 0.0);
    }

    #[test]
    fn test_dl_mcs_sources() {
        let mut u = ue();
        assert_eq!(u.dl_mcs(), 10);
        u.dl_sb_mcs = vec![4, 20];
        u.rbg_to_sb = vec![0, 0, 1, 1];
        u.dl.rbgs = vec![1, 2];
        assert_eq!(u.dl_mcs(), 12);
        u.fh_max_mcs = Some(3);
        assert_eq!(u.dl_mcs(), 3);
    }
}
