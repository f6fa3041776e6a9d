//! MAC Scheduler Implementation
//!
//! Slot-by-slot DL/UL scheduling of one BWP: control regions, HARQ
//! retransmissions, new data ranked by RR/PF/QoS over OFDMA or TDMA,
//! fronthaul admission and the `SlotAllocInfo` handed to the PHY.

use super::alloc::{
    count_used_symbols, AllocationType, DciFormat, DciInfoElementTdma, DciType, SlotAllocInfo,
    VarTtiAllocInfo,
};
use super::config::{AccessMode, SchedulerConfig};
use super::cqi_management::{CqiManagement, DlCqiInfo};
use super::fh_control::{FhControl, FhControlMethod, FhPhyProvider, FhSchedProvider, FhSchedUser};
use super::harq::{FeedbackOutcome, HarqFailure};
use super::lc::{self, LogicalChannel};
use super::slot_pattern::SlotPattern;
use super::srs::SrsAllocator;
use super::ue_info::SchedulerUeInfo;
use super::MacPhyInterface;
use crate::LayerError;
use crate::phy::amc::Amc;
use common::types::{LinkDirection, Rnti, SfnSf};
use interfaces::{
    HandoverSignal, HarqFeedback, LcConfig, RachIndication, RlcBufferStatus, UlBsr, UlSinrReport,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Smallest DL transport block worth a DCI, in bytes
const MIN_DL_TBS: u32 = 10;
/// Smallest UL transport block worth a DCI, in bytes
const MIN_UL_TBS: u32 = 12;
/// UL allocations older than this can no longer be matched by a SINR report
const UL_ALLOC_MEMORY_SLOTS: u64 = 64;
/// Msg3 is sent at the most robust MCS
const MSG3_MCS: u8 = 0;
/// RRC setup request plus MAC subheader
const MSG3_BYTES: u32 = 7;

/// CORESET#0 configuration based on 3GPP TS 38.213
#[derive(Debug, Clone)]
pub struct Coreset0Config {
    /// Number of resource blocks
    pub num_rbs: u32,
    /// Number of symbols
    pub num_symbols: u32,
    /// RB offset from point A
    pub rb_offset: u32,
}

impl Coreset0Config {
    /// Get CORESET#0 configuration from table index
    /// Based on 3GPP TS 38.213 Table 13-1 for {15, 15} kHz SCS
    pub fn from_index(index: u8) -> Result<Self, LayerError> {
        let config = match index {
            0 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 0 },
            1 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 2 },
            2 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 4 },
            3 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 0 },
            4 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 2 },
            5 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 4 },
            6 => Self { num_rbs: 48, num_symbols: 1, rb_offset: 12 },
            7 => Self { num_rbs: 48, num_symbols: 1, rb_offset: 16 },
            8 => Self { num_rbs: 48, num_symbols: 2, rb_offset: 12 },
            9 => Self { num_rbs: 48, num_symbols: 2, rb_offset: 16 },
            10 => Self { num_rbs: 48, num_symbols: 3, rb_offset: 12 },
            11 => Self { num_rbs: 48, num_symbols: 3, rb_offset: 16 },
            12 => Self { num_rbs: 96, num_symbols: 1, rb_offset: 38 },
            13 => Self { num_rbs: 96, num_symbols: 2, rb_offset: 38 },
            14 => Self { num_rbs: 96, num_symbols: 3, rb_offset: 38 },
            _ => return Err(LayerError::InvalidConfiguration(
                format!("Invalid CORESET#0 index: {}", index)
            )),
        };
        Ok(config)
    }
}

/// Scheduler parameters exposed to fronthaul control
struct SchedulerView {
    rb_per_rbg: u32,
    numerology: u8,
}

impl FhSchedUser for SchedulerView {
    fn num_rb_per_rbg(&self) -> u32 {
        self.rb_per_rbg
    }

    fn numerology(&self) -> u8 {
        self.numerology
    }
}

/// UL allocation kept until its SINR report arrives
#[derive(Debug, Clone)]
struct UlAllocation {
    rbg_mask: Vec<bool>,
    tb_size: u32,
}

/// Symbols given to one direction in the current slot
#[derive(Debug, Clone, Copy)]
struct SymbolRegion {
    start: u8,
    len: u8,
}

impl SymbolRegion {
    fn end(&self) -> u8 {
        self.start + self.len
    }
}

fn format_of(direction: LinkDirection) -> DciFormat {
    match direction {
        LinkDirection::Downlink => DciFormat::Dl,
        LinkDirection::Uplink => DciFormat::Ul,
    }
}

fn direction_of(format: DciFormat) -> LinkDirection {
    match format {
        DciFormat::Dl => LinkDirection::Downlink,
        DciFormat::Ul => LinkDirection::Uplink,
    }
}

fn lookup(ues: &mut BTreeMap<Rnti, SchedulerUeInfo>, rnti: Rnti) -> Result<&mut SchedulerUeInfo, LayerError> {
    ues.get_mut(&rnti).ok_or(LayerError::UnknownRnti(rnti.0))
}

/// MAC scheduler of one BWP
#[derive(Debug)]
pub struct MacScheduler {
    config: SchedulerConfig,
    pattern: SlotPattern,
    coreset0: Coreset0Config,
    cqi: CqiManagement,
    ues: BTreeMap<Rnti, SchedulerUeInfo>,
    fh: Option<FhControl>,
    dl_feedback: Vec<HarqFeedback>,
    ul_feedback: Vec<HarqFeedback>,
    ul_allocations: HashMap<(u64, Rnti), UlAllocation>,
    harq_failures: Vec<HarqFailure>,
    srs: Option<SrsAllocator>,
    /// UEs waiting for a Msg3 grant, oldest first
    pending_msg3: Vec<Rnti>,
}

impl MacScheduler {
    /// Create a new MAC scheduler
    pub fn new(config: SchedulerConfig) -> Result<Self, LayerError> {
        config.validate()?;
        let pattern = config.carrier.slot_pattern()?;
        let coreset0 = Coreset0Config::from_index(config.carrier.coreset0_index)?;

        let dl_amc = Amc::from_type(config.error_model, config.amc_model, LinkDirection::Downlink);
        let ul_amc = Amc::from_type(config.error_model, config.amc_model, LinkDirection::Uplink);
        let cqi = CqiManagement::new(dl_amc, ul_amc, config.start_dl_mcs, config.start_ul_mcs, config.max_ul_mcs());

        let srs = config.srs_periodicity.map(SrsAllocator::new).transpose()?;
        let fh = match &config.fh_control {
            Some(fh_config) => {
                let mut fh = FhControl::new(fh_config.clone(), config.error_model)?;
                fh.attach_scheduler(Arc::new(SchedulerView {
                    rb_per_rbg: config.carrier.rb_per_rbg,
                    numerology: config.carrier.numerology,
                }));
                Some(fh)
            }
            None => None,
        };

        info!(
            "MAC scheduler for cell {} BWP {}: {} RBGs, {:?}/{:?}, error model {:?}, FH {:?}, SRS period {:?}",
            config.carrier.cell_id,
            config.carrier.bwp_id,
            config.carrier.num_rbgs(),
            config.policy,
            config.access,
            config.error_model,
            fh.as_ref().map(|f| f.method()),
            srs.as_ref().map(SrsAllocator::periodicity),
        );

        Ok(Self {
            config,
            pattern,
            coreset0,
            cqi,
            ues: BTreeMap::new(),
            fh,
            dl_feedback: Vec::new(),
            ul_feedback: Vec::new(),
            ul_allocations: HashMap::new(),
            harq_failures: Vec::new(),
            srs,
            pending_msg3: Vec::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_rbgs(&self) -> usize {
        self.config.carrier.num_rbgs()
    }

    pub fn ue(&self, rnti: Rnti) -> Option<&SchedulerUeInfo> {
        self.ues.get(&rnti)
    }

    pub fn ues(&self) -> impl Iterator<Item = &SchedulerUeInfo> {
        self.ues.values()
    }

    pub fn fh_control(&self) -> Option<&FhControl> {
        self.fh.as_ref()
    }

    pub fn dl_amc(&self) -> &Amc {
        self.cqi.dl_amc()
    }

    pub fn ul_amc(&self) -> &Amc {
        self.cqi.ul_amc()
    }

    fn amc(&self, direction: LinkDirection) -> &Amc {
        match direction {
            LinkDirection::Downlink => self.cqi.dl_amc(),
            LinkDirection::Uplink => self.cqi.ul_amc(),
        }
    }

    fn apply_fixed_mcs(config: &SchedulerConfig, ue: &mut SchedulerUeInfo) {
        if let Some(mcs) = config.fixed_dl_mcs {
            ue.dl.mcs = mcs;
            ue.dl_sb_mcs.clear();
        }
        if let Some(mcs) = config.fixed_ul_mcs {
            ue.ul.mcs = mcs;
        }
    }

    /// Register a new UE
    pub fn ue_config_req(&mut self, rnti: Rnti) -> Result<(), LayerError> {
        if self.ues.contains_key(&rnti) {
            return Err(LayerError::InvalidState(format!("RNTI {} already configured", rnti)));
        }
        let mut ue = SchedulerUeInfo::new(
            rnti,
            self.config.carrier.bwp_id,
            self.config.start_dl_mcs,
            self.config.start_ul_mcs,
            self.config.harq_processes,
            self.config.max_harq_retx,
        );
        Self::apply_fixed_mcs(&self.config, &mut ue);
        if let Some(srs) = self.srs.as_mut() {
            ue.srs = srs.add_ue();
            // Out of offsets: every UE moves to the next periodicity
            if ue.srs.is_none() && srs.increase_periodicity() {
                for other in self.ues.values_mut() {
                    other.srs = srs.add_ue();
                }
                ue.srs = srs.add_ue();
            }
            match ue.srs {
                Some(slot) => debug!(%rnti, "SRS every {} slots at offset {}", slot.periodicity, slot.offset),
                None => warn!(%rnti, "no SRS offset left"),
            }
        }
        self.ues.insert(rnti, ue);
        info!(%rnti, "UE added");
        Ok(())
    }

    /// Remove a UE with all its queues, HARQ state and pending reports
    pub fn ue_release(&mut self, rnti: Rnti) -> Result<(), LayerError> {
        let ue = self.ues.remove(&rnti).ok_or(LayerError::UnknownRnti(rnti.0))?;
        if let (Some(srs), Some(slot)) = (self.srs.as_mut(), ue.srs) {
            srs.remove_ue(slot);
        }
        self.pending_msg3.retain(|r| *r != rnti);
        if let Some(fh) = &mut self.fh {
            fh.release_ue(self.config.carrier.bwp_id, rnti);
        }
        self.ul_allocations.retain(|(_, r), _| *r != rnti);
        self.dl_feedback.retain(|f| f.rnti != rnti);
        self.ul_feedback.retain(|f| f.rnti != rnti);
        info!(%rnti, "UE released");
        Ok(())
    }

    /// The UE answered the RAR and needs an UL grant for Msg3
    pub fn rach_indication(&mut self, rach: &RachIndication) -> Result<(), LayerError> {
        if !self.ues.contains_key(&rach.rnti) {
            return Err(LayerError::UnknownRnti(rach.rnti.0));
        }
        if self.pending_msg3.contains(&rach.rnti) {
            return Err(LayerError::InvalidState(format!("RNTI {} already waits for Msg3", rach.rnti)));
        }
        self.pending_msg3.push(rach.rnti);
        debug!(rnti = %rach.rnti, "Msg3 grant pending");
        Ok(())
    }

    /// The UE leaves the cell
    pub fn handover(&mut self, signal: &HandoverSignal) -> Result<(), LayerError> {
        info!(rnti = %signal.rnti, "handover to cell {}, detaching", signal.target_cell.0);
        self.ue_release(signal.rnti)
    }

    /// Add (or replace) a logical channel
    pub fn lc_config(&mut self, config: &LcConfig) -> Result<(), LayerError> {
        let ue = lookup(&mut self.ues, config.rnti)?;
        ue.link_mut(config.direction)
            .lcgs
            .entry(config.lcg)
            .or_default()
            .insert(LogicalChannel::new(config.lcid, config.qci));
        debug!(rnti = %config.rnti, "{:?} LC {} in LCG {} with 5QI {}", config.direction, config.lcid, config.lcg, config.qci.0);
        Ok(())
    }

    pub fn lc_release(&mut self, rnti: Rnti, direction: LinkDirection, lcid: u8) -> Result<(), LayerError> {
        let link = lookup(&mut self.ues, rnti)?.link_mut(direction);
        let removed = link.lcgs.values_mut().any(|g| g.remove(lcid).is_some());
        link.lcgs.retain(|_, g| !g.is_empty());
        if !removed {
            return Err(LayerError::InvalidState(format!("RNTI {} has no {:?} LC {}", rnti, direction, lcid)));
        }
        Ok(())
    }

    /// DL queue report from RLC
    pub fn dl_rlc_buffer_req(&mut self, status: &RlcBufferStatus) -> Result<(), LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let ue = lookup(&mut self.ues, status.rnti)?;
        let group = ue.dl.lcgs.values_mut()
            .find(|g| g.contains(status.lcid))
            .ok_or_else(|| LayerError::InvalidState(format!(
                "RLC report for unknown LC {} of RNTI {}", status.lcid, status.rnti
            )))?;
        group.update_from_rlc(status);
        let bytes = ue.dl.buffered_bytes();
        trace!(rnti = %status.rnti, "DL buffer {} bytes", bytes);
        if let Some(fh) = &mut self.fh {
            fh.set_active_ue(bwp, status.rnti, bytes);
        }
        Ok(())
    }

    /// UL buffer status report
    pub fn ul_bsr(&mut self, bsr: &UlBsr) -> Result<(), LayerError> {
        let ue = lookup(&mut self.ues, bsr.rnti)?;
        let group = ue.ul.lcgs.get_mut(&bsr.lcg).ok_or_else(|| {
            LayerError::InvalidState(format!("BSR for unknown LCG {} of RNTI {}", bsr.lcg, bsr.rnti))
        })?;
        group.update_from_bsr(bsr.buffer_size);
        trace!(rnti = %bsr.rnti, "BSR LCG {} = {} bytes", bsr.lcg, bsr.buffer_size);
        Ok(())
    }

    /// DL CQI report, with the precoders chosen by the UE for MIMO
    pub fn dl_cqi_info_req(&mut self, mut info: DlCqiInfo) -> Result<(), LayerError> {
        let num_rbgs = self.config.carrier.num_rbgs();
        let max_dl_mcs = self.config.max_dl_mcs();
        info.report.rank = info.report.rank.min(self.config.pm_search.rank_limit);
        let ue = lookup(&mut self.ues, info.report.rnti)?;
        self.cqi.dl_cqi_reported(&info, ue, self.config.cqi_expiration, max_dl_mcs, num_rbgs)?;
        Self::apply_fixed_mcs(&self.config, ue);
        Ok(())
    }

    /// UL SINR measured on an earlier UL allocation
    pub fn ul_sinr_report(&mut self, report: &UlSinrReport) -> Result<(), LayerError> {
        let key = (report.sfn_sf.normalized(), report.rnti);
        let alloc = self.ul_allocations.remove(&key).ok_or_else(|| {
            LayerError::InvalidState(format!(
                "UL SINR of RNTI {} for slot {} without a UL allocation", report.rnti, report.sfn_sf
            ))
        })?;
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let ue = lookup(&mut self.ues, report.rnti)?;
        self.cqi.ul_sb_cqi_reported(
            self.config.cqi_expiration,
            alloc.tb_size,
            report,
            ue,
            &alloc.rbg_mask,
            rb_per_rbg,
        )?;
        Self::apply_fixed_mcs(&self.config, ue);
        Ok(())
    }

    /// Queue HARQ feedback; it is applied at the start of the next slot
    ///
    /// Feedback for a process that is not waiting for it, or a second report
    /// for the same process, is refused here rather than at slot time.
    pub fn harq_feedback(&mut self, feedback: HarqFeedback) -> Result<(), LayerError> {
        let ue = self.ues.get(&feedback.rnti).ok_or(LayerError::UnknownRnti(feedback.rnti.0))?;
        ue.link(feedback.direction).harq.expects_feedback(feedback.harq_process_id)?;
        let queue = match feedback.direction {
            LinkDirection::Downlink => &mut self.dl_feedback,
            LinkDirection::Uplink => &mut self.ul_feedback,
        };
        if queue.iter().any(|f| f.rnti == feedback.rnti && f.harq_process_id == feedback.harq_process_id) {
            return Err(LayerError::InvalidState(format!(
                "duplicate {:?} feedback for HARQ process {} of RNTI {}",
                feedback.direction, feedback.harq_process_id, feedback.rnti
            )));
        }
        queue.push(feedback);
        Ok(())
    }

    /// Transport blocks given up since the last call
    pub fn take_harq_failures(&mut self) -> Vec<HarqFailure> {
        std::mem::take(&mut self.harq_failures)
    }

    /// Build the allocation of one slot
    pub fn schedule_slot(&mut self, sfn: SfnSf) -> Result<SlotAllocInfo, LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let num_rbgs = self.config.carrier.num_rbgs();
        let num_symbols = self.config.carrier.num_symbols;
        let slot_type = self.pattern.slot_type(&sfn);

        self.cqi.refresh_dl_cqi_maps(self.ues.values_mut());
        self.cqi.refresh_ul_cqi_maps(self.ues.values_mut());
        for ue in self.ues.values_mut() {
            Self::apply_fixed_mcs(&self.config, ue);
            ue.reset_slot();
        }
        if let Some(fh) = &mut self.fh {
            fh.begin_slot();
        }

        let mut slot = SlotAllocInfo::new(sfn);
        let dl_ctrl = if slot_type.has_dl() { self.coreset0.num_symbols as u8 } else { 0 };
        let ul_ctrl = if slot_type.has_ul() { self.config.carrier.ul_ctrl_symbols } else { 0 };
        if dl_ctrl > 0 {
            slot.var_tti_alloc_info.push(VarTtiAllocInfo::new(
                DciInfoElementTdma::ctrl(DciFormat::Dl, 0, dl_ctrl, bwp, num_rbgs)
            ));
        }
        if ul_ctrl > 0 {
            slot.var_tti_alloc_info.push(VarTtiAllocInfo::new(
                DciInfoElementTdma::ctrl(DciFormat::Ul, num_symbols - ul_ctrl, ul_ctrl, bwp, num_rbgs)
            ));
        }

        // Offsets are unique, so at most one UE sounds in a slot
        let srs_ue = if slot_type.has_ul() {
            self.ues.values().find(|ue| ue.srs.is_some_and(|s| s.is_due(&sfn))).map(|ue| ue.rnti)
        } else {
            None
        };
        let srs_len = if srs_ue.is_some() { self.config.srs_symbols } else { 0 };
        if let Some(rnti) = srs_ue {
            slot.var_tti_alloc_info.push(VarTtiAllocInfo::new(
                DciInfoElementTdma::srs(rnti, num_symbols - ul_ctrl - srs_len, srs_len, bwp, num_rbgs)
            ));
        }

        self.process_feedback(LinkDirection::Downlink)?;
        self.process_feedback(LinkDirection::Uplink)?;

        let data = SymbolRegion { start: dl_ctrl, len: num_symbols - ul_ctrl - srs_len - dl_ctrl };
        let dl_demand = slot_type.has_dl() && self.has_demand(LinkDirection::Downlink);
        let ul_demand = slot_type.has_ul()
            && (self.has_demand(LinkDirection::Uplink) || !self.pending_msg3.is_empty());
        let (dl_len, ul_len) = match (dl_demand, ul_demand) {
            (true, true) => {
                let dl = data.len.div_ceil(2);
                (dl, data.len - dl)
            }
            (true, false) => (data.len, 0),
            (false, true) => (0, data.len),
            (false, false) => (0, 0),
        };
        if dl_len > 0 {
            let region = SymbolRegion { start: data.start, len: dl_len };
            let allocs = self.schedule_direction(LinkDirection::Downlink, region)?;
            slot.var_tti_alloc_info.extend(allocs);
        }
        if ul_len > 0 {
            // UL data sits right before the UL control region
            let region = SymbolRegion { start: data.end() - ul_len, len: ul_len };
            let allocs = self.schedule_direction(LinkDirection::Uplink, region)?;
            slot.var_tti_alloc_info.extend(allocs);
        }

        if let Some(fh) = &mut self.fh {
            if fh.method() == FhControlMethod::Dropping {
                for dci in fh.filter_for_transmission(bwp, &mut slot)? {
                    if let Some(ue) = self.ues.get_mut(&dci.rnti) {
                        let link = ue.link_mut(direction_of(dci.format));
                        link.tb_size = 0;
                        if let Some(failure) = link.harq.mark_dropped(dci.harq_process)? {
                            warn!(
                                rnti = %failure.rnti,
                                "{:?} TB of {} bytes lost on HARQ process {} after repeated fronthaul drops",
                                direction_of(dci.format), failure.tb_size, failure.harq_process
                            );
                            self.harq_failures.push(failure);
                        }
                    }
                }
            }
            fh.update_active_ues_map(bwp, &slot)?;
        }

        slot.var_tti_alloc_info.sort_by_key(|v| v.dci.sym_start);
        let has_dl = slot.var_tti_alloc_info.iter().any(|v| v.dci.format == DciFormat::Dl);
        let has_ul = slot.var_tti_alloc_info.iter().any(|v| v.dci.format == DciFormat::Ul);
        slot.alloc_type = match (has_dl, has_ul) {
            (true, true) => AllocationType::Both,
            (true, false) => AllocationType::Dl,
            (false, true) => AllocationType::Ul,
            (false, false) => AllocationType::None,
        };
        slot.num_sym_alloc = count_used_symbols(0, &slot.var_tti_alloc_info);

        self.remember_ul_allocations(&slot);
        let time_window = self.config.time_window;
        for ue in self.ues.values_mut() {
            ue.dl.commit_average(time_window);
            ue.ul.commit_average(time_window);
        }

        debug!("{} {} slot: {} allocations", sfn, slot_type, slot.var_tti_alloc_info.len());
        trace!("{}", slot);
        Ok(slot)
    }

    fn process_feedback(&mut self, direction: LinkDirection) -> Result<(), LayerError> {
        let queue = match direction {
            LinkDirection::Downlink => std::mem::take(&mut self.dl_feedback),
            LinkDirection::Uplink => std::mem::take(&mut self.ul_feedback),
        };
        for feedback in queue {
            let Some(ue) = self.ues.get_mut(&feedback.rnti) else {
                debug!(rnti = %feedback.rnti, "HARQ feedback for a released UE");
                continue;
            };
            let outcome = match ue.link_mut(direction).harq.feedback(feedback.harq_process_id, feedback.ack) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(rnti = %feedback.rnti, "HARQ feedback ignored: {}", e);
                    continue;
                }
            };
            if let FeedbackOutcome::Failed(failure) = outcome {
                warn!(
                    rnti = %failure.rnti,
                    "{:?} TB of {} bytes lost on HARQ process {}",
                    direction, failure.tb_size, failure.harq_process
                );
                self.harq_failures.push(failure);
            }
        }
        Ok(())
    }

    fn has_demand(&self, direction: LinkDirection) -> bool {
        self.ues.values().any(|ue| {
            let link = ue.link(direction);
            link.harq.pending_retx().next().is_some()
                || (link.buffered_bytes() > 0 && link.harq.can_insert())
        })
    }

    fn schedule_direction(
        &mut self,
        direction: LinkDirection,
        region: SymbolRegion,
    ) -> Result<Vec<VarTtiAllocInfo>, LayerError> {
        let amc = self.amc(direction).clone();
        let notched = match direction {
            LinkDirection::Downlink => &self.config.carrier.dl_notched_rbgs,
            LinkDirection::Uplink => &self.config.carrier.ul_notched_rbgs,
        };
        let mut free = self.config.carrier.rbg_mask(notched);
        let mut out = Vec::new();
        let mut retx_ues = HashSet::new();
        let mut cursor = region.start;

        if direction == LinkDirection::Uplink {
            self.schedule_msg3(&amc, region, &mut free, &mut out)?;
        }
        self.schedule_retx(direction, region, &mut free, &mut cursor, &mut retx_ues, &mut out)?;

        let candidates: Vec<Rnti> = self.ues.iter()
            .filter(|(rnti, _)| !retx_ues.contains(*rnti))
            .filter(|(_, ue)| {
                let link = ue.link(direction);
                link.buffered_bytes() > 0 && link.harq.can_insert()
            })
            .map(|(rnti, _)| *rnti)
            .collect();
        if candidates.is_empty() {
            return Ok(out);
        }

        match self.config.access {
            AccessMode::Ofdma => self.assign_ofdma(direction, &amc, region.len, &mut free, &candidates)?,
            AccessMode::Tdma => self.assign_tdma(direction, &amc, region.end() - cursor, &free, &candidates)?,
        }
        self.fh_limit_new_data(direction, &candidates)?;
        self.create_data_dcis(direction, &amc, region, cursor, &candidates, &mut out)?;
        Ok(out)
    }

    /// Msg3 grants at the lowest MCS on the first free RBGs of the UL region
    fn schedule_msg3(
        &mut self,
        amc: &Amc,
        region: SymbolRegion,
        free: &mut [bool],
        out: &mut Vec<VarTtiAllocInfo>,
    ) -> Result<(), LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let mut waiting = Vec::new();

        for rnti in std::mem::take(&mut self.pending_msg3) {
            let mut rbgs = Vec::new();
            let mut tb_size = 0;
            for (rbg, _) in free.iter().enumerate().filter(|(_, &f)| f) {
                rbgs.push(rbg);
                tb_size = amc.calculate_tb_size(MSG3_MCS, 1, rbgs.len() as u32 * rb_per_rbg * region.len as u32);
                if tb_size >= MSG3_BYTES {
                    break;
                }
            }
            if tb_size < MSG3_BYTES {
                trace!(%rnti, "Msg3 waits: not enough RBGs");
                waiting.push(rnti);
                continue;
            }
            if let Some(fh) = &mut self.fh {
                if fh.method() != FhControlMethod::Dropping {
                    let n_regs = rbgs.len() as u32 * rb_per_rbg * region.len as u32;
                    if !fh.does_allocation_fit(bwp, MSG3_MCS, n_regs, 1)? {
                        debug!(%rnti, "Msg3 waits: fronthaul full");
                        waiting.push(rnti);
                        continue;
                    }
                    fh.record_allocation(bwp, MSG3_MCS, n_regs, 1)?;
                }
            }

            let mut rbg_bitmask = vec![false; free.len()];
            for &r in &rbgs {
                free[r] = false;
                rbg_bitmask[r] = true;
            }
            let dci = Arc::new(DciInfoElementTdma {
                rnti,
                format: DciFormat::Ul,
                dci_type: DciType::Msg3,
                sym_start: region.start,
                num_sym: region.len,
                mcs: MSG3_MCS,
                rank: 1,
                tb_size,
                harq_process: 0,
                ndi: 1,
                rv: 0,
                bwp_index: bwp,
                tpc: 1,
                rbg_bitmask,
                prec_mats: None,
            });
            info!(%rnti, "Msg3 grant {}", dci);
            out.push(VarTtiAllocInfo { dci, rlc_pdu_info: Vec::new() });
        }
        self.pending_msg3 = waiting;
        Ok(())
    }

    /// Place pending retransmissions on their original RBGs and symbol count
    fn schedule_retx(
        &mut self,
        direction: LinkDirection,
        region: SymbolRegion,
        free: &mut [bool],
        cursor: &mut u8,
        retx_ues: &mut HashSet<Rnti>,
        out: &mut Vec<VarTtiAllocInfo>,
    ) -> Result<(), LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let access = self.config.access;

        for (rnti, ue) in self.ues.iter_mut() {
            let pending: Vec<(u8, Arc<DciInfoElementTdma>)> = ue.link(direction).harq
                .pending_retx()
                .filter_map(|(id, p)| p.dci.clone().map(|d| (id, d)))
                .collect();

            for (id, old) in pending {
                if retx_ues.contains(rnti) {
                    trace!(%rnti, "HARQ {} buffered: one retransmission per UE and slot", id);
                    break;
                }
                let rbgs = old.rbg_indices();
                let available = |r: &usize| free.get(*r).copied().unwrap_or(false);
                let sym_start = match access {
                    AccessMode::Ofdma => {
                        if old.num_sym > region.len {
                            trace!(%rnti, "HARQ {} buffered: not enough symbols", id);
                            continue;
                        }
                        if rbgs.len() > free.iter().filter(|&&f| f).count() {
                            trace!(%rnti, "HARQ {} buffered: not enough RBGs", id);
                            continue;
                        }
                        if !rbgs.iter().all(available) {
                            trace!(%rnti, "HARQ {} buffered: RBG collision", id);
                            continue;
                        }
                        region.start
                    }
                    AccessMode::Tdma => {
                        if *cursor + old.num_sym > region.end() || !rbgs.iter().all(available) {
                            trace!(%rnti, "HARQ {} buffered: not enough symbols", id);
                            continue;
                        }
                        *cursor
                    }
                };

                if let Some(fh) = &mut self.fh {
                    if fh.method() != FhControlMethod::Dropping {
                        let n_regs = rbgs.len() as u32 * rb_per_rbg * old.num_sym as u32;
                        if !fh.does_allocation_fit(bwp, old.mcs, n_regs, old.rank)? {
                            debug!(%rnti, "HARQ {} buffered: fronthaul full", id);
                            continue;
                        }
                        fh.record_allocation(bwp, old.mcs, n_regs, old.rank)?;
                    }
                }

                let mut dci = (*old).clone();
                dci.sym_start = sym_start;
                dci.ndi = 0;
                dci.rv = (old.rv + 1) % 4;
                let dci = Arc::new(dci);
                let link = ue.link_mut(direction);
                link.harq.retransmitted(dci.clone())?;
                let rlc_pdu_info = link.harq.get(id)?.rlc_pdu_info.clone();

                match access {
                    AccessMode::Ofdma => rbgs.iter().for_each(|&r| free[r] = false),
                    AccessMode::Tdma => *cursor += old.num_sym,
                }
                retx_ues.insert(*rnti);
                debug!(%rnti, "retransmission {}", dci);
                out.push(VarTtiAllocInfo { dci, rlc_pdu_info });
            }
        }
        Ok(())
    }

    /// Fronthaul RBG ceiling per UE under OptimizeRBs
    fn rbg_caps(&self, direction: LinkDirection, num_sym: u8, candidates: &[Rnti]) -> Result<HashMap<Rnti, usize>, LayerError> {
        let mut caps = HashMap::new();
        let Some(fh) = self.fh.as_ref().filter(|f| f.method() == FhControlMethod::OptimizeRBs) else {
            return Ok(caps);
        };
        for rnti in candidates {
            if let Some(ue) = self.ues.get(rnti) {
                let link = ue.link(direction);
                let cap = fh.max_rbgs_assignable(self.config.carrier.bwp_id, ue.mcs(direction), link.rank, num_sym)?;
                caps.insert(*rnti, cap);
            }
        }
        Ok(caps)
    }

    /// Best-ranked UE among `active`; ties go to the lower RNTI
    fn best_ue(&mut self, direction: LinkDirection, amc: &Amc, active: &[Rnti], rbgs: impl Fn(Rnti) -> u32, sym: u8) -> Option<Rnti> {
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let (policy, alpha) = (self.config.policy, self.config.fairness_index);
        let mut best: Option<(Rnti, f64)> = None;
        for rnti in active {
            let Some(ue) = self.ues.get_mut(rnti) else { continue };
            let link = ue.link_mut(direction);
            link.calculate_potential_tput(amc, rbgs(*rnti), rb_per_rbg, sym);
            let metric = link.metric(policy, alpha);
            if best.map_or(true, |(_, b)| metric > b) {
                best = Some((*rnti, metric));
            }
        }
        best.map(|(rnti, _)| rnti)
    }

    /// One RBG per iteration to the best-ranked UE that still has data
    fn assign_ofdma(
        &mut self,
        direction: LinkDirection,
        amc: &Amc,
        num_sym: u8,
        free: &mut [bool],
        candidates: &[Rnti],
    ) -> Result<(), LayerError> {
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let time_window = self.config.time_window;
        let caps = self.rbg_caps(direction, num_sym, candidates)?;
        let mut active: Vec<Rnti> = candidates.iter()
            .copied()
            .filter(|r| caps.get(r).map_or(true, |&c| c > 0))
            .collect();
        let mut free_rbgs: VecDeque<usize> = free.iter()
            .enumerate()
            .filter(|(_, &f)| f)
            .map(|(i, _)| i)
            .collect();

        while !active.is_empty() {
            let Some(&rbg) = free_rbgs.front() else { break };
            let Some(rnti) = self.best_ue(direction, amc, &active, |_| 1, num_sym) else { break };
            free_rbgs.pop_front();
            free[rbg] = false;

            let link = lookup(&mut self.ues, rnti)?.link_mut(direction);
            link.rbgs.push(rbg);
            link.sym = num_sym;
            link.update_metric(amc, rb_per_rbg, time_window);
            let capped = caps.get(&rnti).is_some_and(|&c| link.rbgs.len() >= c);
            if capped || link.tb_size >= link.buffered_bytes() {
                active.retain(|r| *r != rnti);
            }
        }
        Ok(())
    }

    /// One symbol of the whole band per iteration to the best-ranked UE
    fn assign_tdma(
        &mut self,
        direction: LinkDirection,
        amc: &Amc,
        num_sym: u8,
        free: &[bool],
        candidates: &[Rnti],
    ) -> Result<(), LayerError> {
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let time_window = self.config.time_window;
        let band: Vec<usize> = free.iter().enumerate().filter(|(_, &f)| f).map(|(i, _)| i).collect();
        if band.is_empty() || num_sym == 0 {
            return Ok(());
        }
        let caps = self.rbg_caps(direction, num_sym, candidates)?;
        let ue_band: HashMap<Rnti, usize> = candidates.iter()
            .map(|r| (*r, caps.get(r).map_or(band.len(), |&c| c.min(band.len()))))
            .collect();
        let mut active: Vec<Rnti> = candidates.iter().copied().filter(|r| ue_band[r] > 0).collect();

        let mut remaining = num_sym;
        while remaining > 0 && !active.is_empty() {
            let Some(rnti) = self.best_ue(direction, amc, &active, |r| ue_band[&r] as u32, 1) else { break };
            let link = lookup(&mut self.ues, rnti)?.link_mut(direction);
            if link.rbgs.is_empty() {
                link.rbgs = band[..ue_band[&rnti]].to_vec();
            }
            link.sym += 1;
            link.update_metric(amc, rb_per_rbg, time_window);
            remaining -= 1;
            if link.tb_size >= link.buffered_bytes() {
                active.retain(|r| *r != rnti);
            }
        }
        Ok(())
    }

    /// Postpone, lower the MCS of, or trim new-data assignments so they fit the fronthaul
    fn fh_limit_new_data(&mut self, direction: LinkDirection, candidates: &[Rnti]) -> Result<(), LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let Some(fh) = self.fh.as_mut() else { return Ok(()) };
        let method = fh.method();
        if method == FhControlMethod::Dropping {
            return Ok(());
        }

        for rnti in candidates {
            let Some(ue) = self.ues.get_mut(rnti) else { continue };
            let mut mcs = ue.mcs(direction);
            let link = ue.link_mut(direction);
            if link.rbgs.is_empty() || link.sym == 0 {
                continue;
            }
            let (rank, sym) = (link.rank, link.sym);
            let mut n_regs = link.rbgs.len() as u32 * rb_per_rbg * sym as u32;

            if !fh.does_allocation_fit(bwp, mcs, n_regs, rank)? {
                match method {
                    FhControlMethod::OptimizeMcs => match fh.max_mcs_assignable(bwp, n_regs, rank)? {
                        Some(max) => {
                            mcs = mcs.min(max);
                            debug!(%rnti, "FH lowers {:?} MCS to {}", direction, mcs);
                            match direction {
                                LinkDirection::Downlink => ue.fh_max_mcs = Some(mcs),
                                LinkDirection::Uplink => ue.ul_fh_max_mcs = Some(mcs),
                            }
                        }
                        None => {
                            debug!(%rnti, "FH postpones {:?} data, no MCS fits", direction);
                            link.reset_assignment();
                            continue;
                        }
                    },
                    FhControlMethod::OptimizeRBs => {
                        let max = fh.max_rbgs_assignable(bwp, mcs, rank, sym)?;
                        if max == 0 {
                            link.reset_assignment();
                            continue;
                        }
                        debug!(%rnti, "FH trims {:?} allocation to {} RBGs", direction, max);
                        link.rbgs.truncate(max);
                        n_regs = link.rbgs.len() as u32 * rb_per_rbg * sym as u32;
                    }
                    _ => {
                        debug!(%rnti, "FH postpones {:?} data", direction);
                        link.reset_assignment();
                        continue;
                    }
                }
            }
            fh.record_allocation(bwp, mcs, n_regs, rank)?;
        }
        Ok(())
    }

    /// Turn the assignments into DCIs, reserve HARQ processes and drain the queues
    fn create_data_dcis(
        &mut self,
        direction: LinkDirection,
        amc: &Amc,
        region: SymbolRegion,
        mut cursor: u8,
        candidates: &[Rnti],
        out: &mut Vec<VarTtiAllocInfo>,
    ) -> Result<(), LayerError> {
        let bwp = self.config.carrier.bwp_id;
        let rb_per_rbg = self.config.carrier.rb_per_rbg;
        let num_rbgs = self.config.carrier.num_rbgs();
        let time_window = self.config.time_window;
        let access = self.config.access;
        let min_tbs = match direction {
            LinkDirection::Downlink => MIN_DL_TBS,
            LinkDirection::Uplink => MIN_UL_TBS,
        };

        for rnti in candidates {
            let Some(ue) = self.ues.get_mut(rnti) else { continue };
            let mcs = ue.mcs(direction);
            let prec_mats = match direction {
                LinkDirection::Downlink => ue.dl_prec_mats.clone(),
                LinkDirection::Uplink => None,
            };
            let link = ue.link_mut(direction);
            if link.rbgs.is_empty() || link.sym == 0 {
                continue;
            }
            let rank = link.rank;
            let tb_size = amc.calculate_tb_size(mcs, rank, link.rbgs.len() as u32 * rb_per_rbg * link.sym as u32);
            if tb_size < min_tbs {
                debug!(%rnti, "{:?} TB of {} bytes too small, skipped", direction, tb_size);
                link.reset_assignment();
                continue;
            }
            let Some(harq_process) = link.harq.find_free() else { continue };
            let (sym_start, num_sym) = match access {
                AccessMode::Ofdma => (region.start, region.len),
                AccessMode::Tdma => {
                    let start = cursor;
                    cursor += link.sym;
                    (start, link.sym)
                }
            };
            let mut rbg_bitmask = vec![false; num_rbgs];
            link.rbgs.iter().for_each(|&r| rbg_bitmask[r] = true);

            let dci = Arc::new(DciInfoElementTdma {
                rnti: *rnti,
                format: format_of(direction),
                dci_type: DciType::Data,
                sym_start,
                num_sym,
                mcs,
                rank,
                tb_size,
                harq_process,
                ndi: 1,
                rv: 0,
                bwp_index: bwp,
                tpc: 1,
                rbg_bitmask,
                prec_mats,
            });
            let rlc_pdu_info = lc::assign_bytes(&mut link.lcgs, tb_size);
            link.harq.insert(dci.clone(), rlc_pdu_info.clone())?;
            link.set_transmitted(tb_size, time_window);
            debug!(%rnti, "new data {}", dci);
            out.push(VarTtiAllocInfo { dci, rlc_pdu_info });
        }
        Ok(())
    }

    fn remember_ul_allocations(&mut self, slot: &SlotAllocInfo) {
        let now = slot.sfn_sf.normalized();
        self.ul_allocations.retain(|(s, _), _| now.saturating_sub(*s) < UL_ALLOC_MEMORY_SLOTS);
        // A sounding occasion spans the band and wins over data of the same UE
        let measured = slot.dcis(DciFormat::Ul, DciType::Data).chain(slot.dcis(DciFormat::Ul, DciType::Srs));
        for dci in measured {
            self.ul_allocations.insert(
                (now, dci.rnti),
                UlAllocation { rbg_mask: dci.rbg_bitmask.clone(), tb_size: dci.tb_size },
            );
        }
    }
}

impl MacPhyInterface for MacScheduler {
    fn get_slot_allocation(&mut self, sfn: SfnSf) -> Result<SlotAllocInfo, LayerError> {
        self.schedule_slot(sfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::fh_control::FhControlConfig;
    use crate::mac::srs::SrsSlot;
    use crate::mac::ue_info::SchedulingPolicy;
    use common::types::{BwpId, CellId, DuplexMode, Qci};
    use interfaces::{CqiType, DlCqiReport};

    fn scheduler(config: SchedulerConfig) -> MacScheduler {
        MacScheduler::new(config).unwrap()
    }

    fn add_ue(s: &mut MacScheduler, rnti: u16, dl_bytes: u32, ul_bytes: u32) {
        let rnti = Rnti(rnti);
        s.ue_config_req(rnti).unwrap();
        for direction in [LinkDirection::Downlink, LinkDirection::Uplink] {
            s.lc_config(&LcConfig { rnti, lcid: 4, lcg: 1, qci: Qci::DEFAULT, direction }).unwrap();
        }
        if dl_bytes > 0 {
            s.dl_rlc_buffer_req(&RlcBufferStatus {
                rnti,
                lcid: 4,
                tx_queue_size: dl_bytes,
                tx_queue_hol_delay: 0,
                retx_queue_size: 0,
                retx_queue_hol_delay: 0,
                status_pdu_size: 0,
            }).unwrap();
        }
        if ul_bytes > 0 {
            s.ul_bsr(&UlBsr { rnti, lcg: 1, buffer_size: ul_bytes }).unwrap();
        }
    }

    fn report_cqi(s: &mut MacScheduler, rnti: u16, cqi: u8) {
        let report = DlCqiReport {
            rnti: Rnti(rnti),
            cell_id: CellId(1),
            bwp_id: BwpId(0),
            cqi_type: CqiType::Wideband,
            rank: 1,
            wb_cqi: cqi,
            sb_cqis: vec![],
        };
        s.dl_cqi_info_req(report.into()).unwrap();
    }

    fn feedback_all(s: &mut MacScheduler, slot: &SlotAllocInfo, ack: bool) {
        for v in slot.var_tti_alloc_info.iter().filter(|v| v.dci.dci_type == DciType::Data) {
            s.harq_feedback(HarqFeedback {
                rnti: v.dci.rnti,
                direction: direction_of(v.dci.format),
                harq_process_id: v.dci.harq_process,
                ack,
                bwp_index: 0,
            }).unwrap();
        }
    }

    fn data(slot: &SlotAllocInfo, format: DciFormat) -> Vec<Arc<DciInfoElementTdma>> {
        slot.dcis(format, DciType::Data).cloned().collect()
    }

    fn assert_no_overlap(slot: &SlotAllocInfo) {
        let dcis: Vec<_> = slot.var_tti_alloc_info.iter().map(|v| &v.dci).collect();
        for (i, a) in dcis.iter().enumerate() {
            for b in &dcis[i + 1..] {
                assert!(!a.overlaps(b), "overlap in {}:\n{}\n{}", slot.sfn_sf, a, b);
            }
        }
    }

    #[test]
    fn test_coreset0_config() {
        // Test valid index
        let config = Coreset0Config::from_index(1).unwrap();
        assert_eq!(config.num_rbs, 24);
        assert_eq!(config.num_symbols, 2);
        assert_eq!(config.rb_offset, 2);

        // Test invalid index
        assert!(Coreset0Config::from_index(20).is_err());
    }

    #[test]
    fn test_idle_slot_has_control_only() {
        let mut s = scheduler(SchedulerConfig::default());
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert_eq!(slot.var_tti_alloc_info.len(), 2);
        assert!(slot.contains_dl_ctrl_allocation() && slot.contains_ul_ctrl_allocation());
        assert!(!slot.contains_data_allocation());
        assert_eq!(slot.alloc_type, AllocationType::Both);
        assert_eq!(slot.num_sym_alloc, 14);
    }

    #[test]
    fn test_single_ue_takes_whole_band() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl.len(), 1);
        assert_eq!(dl[0].num_rbgs(), 13);
        assert_eq!((dl[0].sym_start, dl[0].num_sym), (2, 11));
        assert_eq!((dl[0].ndi, dl[0].rv), (1, 0));
        let rlc = &slot.var_tti_alloc_info.iter().find(|v| v.dci.dci_type == DciType::Data).unwrap().rlc_pdu_info;
        assert_eq!(rlc[0].size, dl[0].tb_size);
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.buffered_bytes(), 100_000 - dl[0].tb_size);
    }

    #[test]
    fn test_flexible_slot_splits_symbols() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 5_000, 5_000);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        let ul = data(&slot, DciFormat::Ul);
        assert_eq!((dl[0].sym_start, dl[0].num_sym), (2, 6));
        assert_eq!((ul[0].sym_start, ul[0].num_sym), (8, 5));
        assert_no_overlap(&slot);
    }

    #[test]
    fn test_allocations_never_overlap() {
        for access in [AccessMode::Ofdma, AccessMode::Tdma] {
            for policy in [SchedulingPolicy::RoundRobin, SchedulingPolicy::ProportionalFair, SchedulingPolicy::Qos] {
                let mut config = SchedulerConfig::default();
                config.access = access;
                config.policy = policy;
                let mut s = scheduler(config);
                for rnti in 1..=4 {
                    add_ue(&mut s, rnti, 3_000 * rnti as u32, 2_000);
                }
                let mut sfn = SfnSf::origin(0).unwrap();
                for n in 0..20 {
                    let slot = s.schedule_slot(sfn).unwrap();
                    assert_no_overlap(&slot);
                    feedback_all(&mut s, &slot, n % 3 != 0);
                    sfn = sfn.next();
                }
            }
        }
    }

    #[test]
    fn test_round_robin_shares_rbgs() {
        let mut config = SchedulerConfig::default();
        config.policy = SchedulingPolicy::RoundRobin;
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 0);
        add_ue(&mut s, 2, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl.len(), 2);
        assert_eq!((dl[0].num_rbgs(), dl[1].num_rbgs()), (7, 6));
    }

    #[test]
    fn test_tdma_gives_whole_band_per_ue() {
        let mut config = SchedulerConfig::default();
        config.access = AccessMode::Tdma;
        config.policy = SchedulingPolicy::RoundRobin;
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 0);
        add_ue(&mut s, 2, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl.len(), 2);
        assert!(dl.iter().all(|d| d.num_rbgs() == 13));
        assert_eq!(dl.iter().map(|d| d.num_sym as u32).sum::<u32>(), 11);
        assert_eq!(dl[0].sym_end(), dl[1].sym_start);
    }

    #[test]
    fn test_nack_retransmits_then_fails() {
        let mut config = SchedulerConfig::default();
        config.max_harq_retx = 2;
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 0);

        let mut sfn = SfnSf::origin(0).unwrap();
        let first = s.schedule_slot(sfn).unwrap();
        let original = data(&first, DciFormat::Dl)[0].clone();
        feedback_all(&mut s, &first, false);

        for rv in 1..=2u8 {
            sfn = sfn.next();
            let slot = s.schedule_slot(sfn).unwrap();
            let dl = data(&slot, DciFormat::Dl);
            assert_eq!(dl.len(), 1, "retransmission only");
            assert_eq!((dl[0].ndi, dl[0].rv), (0, rv));
            assert_eq!(dl[0].harq_process, original.harq_process);
            assert_eq!(dl[0].rbg_bitmask, original.rbg_bitmask);
            assert_eq!(dl[0].tb_size, original.tb_size);
            feedback_all(&mut s, &slot, false);
        }
        assert!(s.take_harq_failures().is_empty());

        sfn = sfn.next();
        let slot = s.schedule_slot(sfn).unwrap();
        let failures = s.take_harq_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].tb_size, original.tb_size);
        // The freed process carries new data again
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!((dl[0].ndi, dl[0].rv), (1, 0));
    }

    #[test]
    fn test_ack_frees_process() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 100_000, 0);
        let mut sfn = SfnSf::origin(0).unwrap();
        let slot = s.schedule_slot(sfn).unwrap();
        feedback_all(&mut s, &slot, true);
        sfn = sfn.next();
        let slot = s.schedule_slot(sfn).unwrap();
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.harq.num_active(), 1);
        assert_eq!(data(&slot, DciFormat::Dl)[0].harq_process, 0);
    }

    #[test]
    fn test_cqi_expiry_restores_start_mcs() {
        let mut config = SchedulerConfig::default();
        config.cqi_expiration = 3;
        config.start_dl_mcs = 0;
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 1_000_000, 0);
        report_cqi(&mut s, 1, 15);

        let mut sfn = SfnSf::origin(0).unwrap();
        let mut mcs = Vec::new();
        for _ in 0..4 {
            let slot = s.schedule_slot(sfn).unwrap();
            mcs.push(data(&slot, DciFormat::Dl)[0].mcs);
            feedback_all(&mut s, &slot, true);
            sfn = sfn.next();
        }
        assert_eq!(mcs[0], 28);
        assert_eq!(mcs[3], 0);
        assert_eq!(s.ue(Rnti(1)).unwrap().dl_cqi.wb_cqi, 1);
    }

    #[test]
    fn test_fixed_mcs_ignores_cqi() {
        let mut config = SchedulerConfig::default();
        config.fixed_dl_mcs = Some(7);
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 10_000, 0);
        report_cqi(&mut s, 1, 15);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert_eq!(data(&slot, DciFormat::Dl)[0].mcs, 7);
    }

    fn fh_config(method: FhControlMethod, capacity_mbps: u32) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.fh_control = Some(FhControlConfig { method, capacity_mbps, overhead_dyn: 32 });
        config
    }

    fn fh_load(s: &MacScheduler, slot: &SlotAllocInfo) -> f64 {
        let fh = s.fh_control().unwrap();
        let rb_per_rbg = s.config().carrier.rb_per_rbg;
        slot.var_tti_alloc_info.iter()
            .filter(|v| v.dci.dci_type == DciType::Data)
            .map(|v| {
                let n_regs = v.dci.num_rbgs() as u32 * rb_per_rbg * v.dci.num_sym as u32;
                fh.required_throughput(v.dci.mcs, n_regs, v.dci.rank).unwrap()
            })
            .sum()
    }

    #[test]
    fn test_fronthaul_capacity_is_respected() {
        for method in [
            FhControlMethod::Dropping,
            FhControlMethod::Postponing,
            FhControlMethod::OptimizeMcs,
            FhControlMethod::OptimizeRBs,
        ] {
            let mut s = scheduler(fh_config(method, 20));
            for rnti in 1..=3 {
                add_ue(&mut s, rnti, 50_000, 20_000);
                report_cqi(&mut s, rnti, 15);
            }
            let mut sfn = SfnSf::origin(0).unwrap();
            for n in 0..10 {
                let slot = s.schedule_slot(sfn).unwrap();
                assert!(fh_load(&s, &slot) <= 20.0 + 1e-9, "{:?} exceeded capacity", method);
                assert_no_overlap(&slot);
                feedback_all(&mut s, &slot, n % 2 == 0);
                sfn = sfn.next();
            }
        }
    }

    #[test]
    fn test_optimize_rbs_trims_instead_of_dropping() {
        // One RBG over 11 symbols at QPSK needs 2.464 Mbps
        let mut s = scheduler(fh_config(FhControlMethod::OptimizeRBs, 10));
        add_ue(&mut s, 1, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl.len(), 1);
        assert_eq!(dl[0].num_rbgs(), 4);

        let mut s = scheduler(fh_config(FhControlMethod::Dropping, 10));
        add_ue(&mut s, 1, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert!(data(&slot, DciFormat::Dl).is_empty());
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.harq.pending_retx().count(), 1);
    }

    #[test]
    fn test_repeated_fronthaul_drops_end_in_failure() {
        // The whole band at MCS 0 needs about 32 Mbps, so every attempt is dropped
        let mut config = fh_config(FhControlMethod::Dropping, 10);
        config.max_harq_retx = 3;
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 0);

        let mut sfn = SfnSf::origin(0).unwrap();
        let mut failures = Vec::new();
        for n in 0..12 {
            let slot = s.schedule_slot(sfn).unwrap();
            assert!(data(&slot, DciFormat::Dl).is_empty());
            let harq = &s.ue(Rnti(1)).unwrap().dl.harq;
            assert!(harq.get(0).unwrap().retx_count <= 3);
            let lost = s.take_harq_failures();
            // First transmission plus three retransmissions, then the block is given up
            assert_eq!(lost.len(), usize::from(n % 4 == 3), "slot {}", n);
            failures.extend(lost);
            sfn = sfn.next();
        }
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|f| f.rnti == Rnti(1) && f.tb_size >= MIN_DL_TBS));
    }

    #[test]
    fn test_invalid_feedback_is_refused_on_arrival() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 100_000, 0);
        add_ue(&mut s, 2, 100_000, 0);
        let mut sfn = SfnSf::origin(0).unwrap();
        let slot = s.schedule_slot(sfn).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl.len(), 2);

        let ack = |d: &Arc<DciInfoElementTdma>| HarqFeedback {
            rnti: d.rnti,
            direction: LinkDirection::Downlink,
            harq_process_id: d.harq_process,
            ack: true,
            bwp_index: 0,
        };
        s.harq_feedback(ack(&dl[0])).unwrap();
        assert!(matches!(s.harq_feedback(ack(&dl[0])), Err(LayerError::InvalidState(_))));
        let mut idle = ack(&dl[0]);
        idle.harq_process_id = 9;
        assert!(s.harq_feedback(idle).is_err());
        s.harq_feedback(ack(&dl[1])).unwrap();

        sfn = sfn.next();
        s.schedule_slot(sfn).unwrap();
        // Both ACKs were applied; each UE only holds the process of this slot
        for rnti in [1, 2] {
            assert_eq!(s.ue(Rnti(rnti)).unwrap().dl.harq.num_active(), 1);
        }
    }

    #[test]
    fn test_optimize_mcs_lowers_modulation() {
        let mut s = scheduler(fh_config(FhControlMethod::OptimizeMcs, 30));
        add_ue(&mut s, 1, 100_000, 0);
        report_cqi(&mut s, 1, 15);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        // 572 REGs: 64QAM needs 59.5 Mbps, 16QAM 45.8, QPSK 32.0 -> nothing fits
        assert!(dl.is_empty());

        let mut s = scheduler(fh_config(FhControlMethod::OptimizeMcs, 50));
        add_ue(&mut s, 1, 100_000, 0);
        report_cqi(&mut s, 1, 15);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert_eq!(data(&slot, DciFormat::Dl)[0].mcs, 16);
    }

    #[test]
    fn test_tdd_slots_follow_pattern() {
        let mut config = SchedulerConfig::default();
        config.carrier.duplex = DuplexMode::Tdd;
        config.carrier.tdd_pattern = Some("DL|UL|F".into());
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 100_000);

        let mut sfn = SfnSf::origin(0).unwrap();
        let dl_slot = s.schedule_slot(sfn).unwrap();
        assert_eq!(dl_slot.alloc_type, AllocationType::Dl);
        assert!(data(&dl_slot, DciFormat::Ul).is_empty());
        assert_eq!(data(&dl_slot, DciFormat::Dl)[0].num_sym, 12);

        sfn = sfn.next();
        let ul_slot = s.schedule_slot(sfn).unwrap();
        assert_eq!(ul_slot.alloc_type, AllocationType::Ul);
        let ul = data(&ul_slot, DciFormat::Ul);
        assert_eq!((ul[0].sym_start, ul[0].num_sym), (0, 13));

        sfn = sfn.next();
        let f_slot = s.schedule_slot(sfn).unwrap();
        assert_eq!(f_slot.alloc_type, AllocationType::Both);
        assert_no_overlap(&f_slot);
    }

    #[test]
    fn test_ul_sinr_matches_remembered_allocation() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 0, 50_000);
        let sfn = SfnSf::origin(0).unwrap();
        let slot = s.schedule_slot(sfn).unwrap();
        assert_eq!(data(&slot, DciFormat::Ul).len(), 1);

        let report = UlSinrReport { rnti: Rnti(1), sfn_sf: sfn, sinr_per_rb: vec![1000.0; 52] };
        s.ul_sinr_report(&report).unwrap();
        assert!(s.ue(Rnti(1)).unwrap().ul.mcs > 0);
        // The allocation is consumed by the first report
        assert!(s.ul_sinr_report(&report).is_err());

        let stale = UlSinrReport { sfn_sf: sfn.add_slots(5), ..report };
        assert!(matches!(s.ul_sinr_report(&stale), Err(LayerError::InvalidState(_))));
    }

    #[test]
    fn test_notched_rbgs_stay_empty() {
        let mut config = SchedulerConfig::default();
        config.carrier.dl_notched_rbgs = vec![0, 5];
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 100_000, 0);
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        let dl = data(&slot, DciFormat::Dl);
        assert_eq!(dl[0].num_rbgs(), 11);
        assert!(!dl[0].rbg_bitmask[0] && !dl[0].rbg_bitmask[5]);
    }

    #[test]
    fn test_srs_occasions_sit_before_ul_ctrl() {
        let mut config = SchedulerConfig::default();
        config.srs_periodicity = Some(2);
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 0, 50_000);
        add_ue(&mut s, 2, 0, 50_000);

        let mut sfn = SfnSf::origin(0).unwrap();
        for sounding in [1, 2, 1] {
            let slot = s.schedule_slot(sfn).unwrap();
            let srs: Vec<_> = slot.dcis(DciFormat::Ul, DciType::Srs).collect();
            assert_eq!(srs.len(), 1);
            assert_eq!(srs[0].rnti, Rnti(sounding));
            assert_eq!((srs[0].sym_start, srs[0].num_sym), (12, 1));
            assert_eq!(srs[0].num_rbgs(), 13);
            let ul = data(&slot, DciFormat::Ul);
            assert!(!ul.is_empty());
            assert!(ul.iter().all(|d| d.sym_end() <= 12));
            assert_no_overlap(&slot);
            sfn = sfn.next();
        }
    }

    #[test]
    fn test_srs_periodicity_grows_when_offsets_run_out() {
        let mut config = SchedulerConfig::default();
        config.srs_periodicity = Some(2);
        let mut s = scheduler(config);
        for rnti in 1..=3 {
            add_ue(&mut s, rnti, 0, 0);
        }
        let offsets: Vec<(u32, u32)> = s.ues()
            .map(|ue| ue.srs.map(|x| (x.periodicity, x.offset)).unwrap())
            .collect();
        assert_eq!(offsets, vec![(4, 0), (4, 1), (4, 2)]);

        s.ue_release(Rnti(2)).unwrap();
        add_ue(&mut s, 4, 0, 0);
        assert_eq!(s.ue(Rnti(4)).unwrap().srs, Some(SrsSlot { periodicity: 4, offset: 1 }));
    }

    #[test]
    fn test_srs_measurement_updates_ul_cqi() {
        let mut config = SchedulerConfig::default();
        config.srs_periodicity = Some(5);
        let mut s = scheduler(config);
        add_ue(&mut s, 1, 0, 0);
        let sfn = SfnSf::origin(0).unwrap();
        let slot = s.schedule_slot(sfn).unwrap();
        assert!(!slot.contains_data_allocation());
        assert_eq!(slot.dcis(DciFormat::Ul, DciType::Srs).count(), 1);

        let report = UlSinrReport { rnti: Rnti(1), sfn_sf: sfn, sinr_per_rb: vec![1000.0; 52] };
        s.ul_sinr_report(&report).unwrap();
        let ue = s.ue(Rnti(1)).unwrap();
        assert_eq!(ue.ul_cqi.sinr.len(), 52);
        assert!(ue.ul.mcs > 0);

        // No occasion in the next slot
        let slot = s.schedule_slot(sfn.next()).unwrap();
        assert_eq!(slot.dcis(DciFormat::Ul, DciType::Srs).count(), 0);
    }

    #[test]
    fn test_msg3_granted_after_rach() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 0, 0);
        add_ue(&mut s, 2, 0, 50_000);
        s.rach_indication(&RachIndication { rnti: Rnti(1) }).unwrap();
        assert!(matches!(
            s.rach_indication(&RachIndication { rnti: Rnti(1) }),
            Err(LayerError::InvalidState(_))
        ));
        assert_eq!(
            s.rach_indication(&RachIndication { rnti: Rnti(9) }),
            Err(LayerError::UnknownRnti(9))
        );

        let sfn = SfnSf::origin(0).unwrap();
        let slot = s.schedule_slot(sfn).unwrap();
        assert!(slot.contains_ul_msg3_allocation());
        let msg3: Vec<_> = slot.dcis(DciFormat::Ul, DciType::Msg3).collect();
        assert_eq!(msg3.len(), 1);
        assert_eq!(msg3[0].rnti, Rnti(1));
        assert_eq!(msg3[0].mcs, MSG3_MCS);
        assert!(msg3[0].tb_size >= MSG3_BYTES);
        assert!(msg3[0].num_rbgs() < s.num_rbgs());
        assert_eq!(data(&slot, DciFormat::Ul).len(), 1);
        assert_no_overlap(&slot);

        let slot = s.schedule_slot(sfn.next()).unwrap();
        assert!(!slot.contains_ul_msg3_allocation());
    }

    #[test]
    fn test_release_drops_pending_msg3() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 0, 0);
        s.rach_indication(&RachIndication { rnti: Rnti(1) }).unwrap();
        s.ue_release(Rnti(1)).unwrap();
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert!(!slot.contains_ul_msg3_allocation());
    }

    #[test]
    fn test_release_and_unknown_ue() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 1_000, 0);
        assert!(s.ue_config_req(Rnti(1)).is_err());
        s.handover(&HandoverSignal { rnti: Rnti(1), target_cell: CellId(2) }).unwrap();
        assert!(s.ue(Rnti(1)).is_none());
        assert_eq!(s.ue_release(Rnti(1)), Err(LayerError::UnknownRnti(1)));
        assert!(matches!(
            s.ul_bsr(&UlBsr { rnti: Rnti(1), lcg: 1, buffer_size: 10 }),
            Err(LayerError::UnknownRnti(1))
        ));
        let slot = s.schedule_slot(SfnSf::origin(0).unwrap()).unwrap();
        assert!(!slot.contains_data_allocation());
    }

    #[test]
    fn test_lc_release() {
        let mut s = scheduler(SchedulerConfig::default());
        add_ue(&mut s, 1, 1_000, 0);
        s.lc_release(Rnti(1), LinkDirection::Downlink, 4).unwrap();
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.buffered_bytes(), 0);
        assert!(s.lc_release(Rnti(1), LinkDirection::Downlink, 4).is_err());
    }
}
