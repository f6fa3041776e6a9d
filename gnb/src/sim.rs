//! Slot-Level Scheduler Simulation
//!
//! Drives a `MacScheduler` with synthetic traffic and a fading channel.
//! Transport blocks are decoded through the configured error model, the
//! outcome is fed back as HARQ ACK/NACK, and UEs report CQI periodically
//! (SISO through the AMC, MIMO through the precoding matrix search).

use crate::config::{SimConfig, UeProfile};
use anyhow::Context;
use common::types::{BwpId, CellId, LinkDirection, Rnti, SfnSf};
use common::utils::{db_to_linear, time};
use interfaces::{
    CqiType, DlCqiReport, HarqFeedback, LcConfig, RachIndication, RlcBufferStatus, SchedulerMessage, UlBsr,
    UlSinrReport,
};
use layers::mac::{DciFormat, DciType, DlCqiInfo, MacPhyInterface, MacScheduler, SlotAllocInfo};
use layers::phy::mimo::{CovMat, MimoSignal, PmSearch, PmSearchIdeal};
use layers::phy::{ComplexMatrixArray, ErrorModel, ErrorModelOutput};
use layers::LayerError;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Logical channel every simulated UE carries its traffic on
const DATA_LCID: u8 = 4;
const DATA_LCG: u8 = 1;
/// RLC queues stop growing past this
const MAX_QUEUE_BYTES: u32 = 4_000_000;

/// Per-UE counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UeStats {
    pub rnti: u16,
    pub dl_bytes: u64,
    pub ul_bytes: u64,
    pub dl_tx: u64,
    pub dl_nacks: u64,
    pub ul_tx: u64,
    pub ul_nacks: u64,
    pub harq_failures: u64,
    pub cqi_reports: u64,
    pub msg3_grants: u64,
    /// UL SINR reports measured on a sounding occasion
    pub srs_reports: u64,
    /// Sum of the MCS of every DL transmission
    dl_mcs_sum: u64,
}

impl UeStats {
    pub fn mean_dl_mcs(&self) -> f64 {
        if self.dl_tx == 0 { 0.0 } else { self.dl_mcs_sum as f64 / self.dl_tx as f64 }
    }
}

/// End-of-run statistics
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub slots: u64,
    pub numerology: u8,
    pub ues: Vec<UeStats>,
}

impl SimReport {
    fn seconds(&self) -> f64 {
        self.slots as f64 * time::slot_duration_us(self.numerology) as f64 / 1e6
    }

    /// Goodput of `bytes` over the run, in Mbps
    pub fn mbps(&self, bytes: u64) -> f64 {
        let secs = self.seconds();
        if secs > 0.0 { bytes as f64 * 8.0 / secs / 1e6 } else { 0.0 }
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} slots ({:.3} s)", self.slots, self.seconds())?;
        for ue in &self.ues {
            writeln!(
                f,
                "  RNTI {:>5}: DL {:8.3} Mbps ({} TBs, {} NACK, mean MCS {:.1}) UL {:8.3} Mbps ({} TBs, {} NACK) lost {}",
                ue.rnti,
                self.mbps(ue.dl_bytes),
                ue.dl_tx,
                ue.dl_nacks,
                ue.mean_dl_mcs(),
                self.mbps(ue.ul_bytes),
                ue.ul_tx,
                ue.ul_nacks,
                ue.harq_failures,
            )?;
        }
        Ok(())
    }
}

/// RLC-side state of a simulated UE
#[derive(Debug)]
struct SimUe {
    profile: UeProfile,
    dl_queue: u32,
    ul_queue: u32,
    /// HARQ processes whose bytes already left the queues
    in_flight: HashSet<(LinkDirection, u8)>,
    stats: UeStats,
}

impl SimUe {
    fn new(profile: UeProfile) -> Self {
        Self {
            stats: UeStats { rnti: profile.rnti, ..Default::default() },
            profile,
            dl_queue: 0,
            ul_queue: 0,
            in_flight: HashSet::new(),
        }
    }

    /// Drain the queue on the first transmission a process is seen with.
    /// A block dropped before the air shows up first as a retransmission.
    fn serve(&mut self, direction: LinkDirection, harq_process: u8, new_data: bool, bytes: u32) {
        let key = (direction, harq_process);
        if !new_data && self.in_flight.contains(&key) {
            return;
        }
        self.in_flight.insert(key);
        let queue = match direction {
            LinkDirection::Downlink => &mut self.dl_queue,
            LinkDirection::Uplink => &mut self.ul_queue,
        };
        *queue = queue.saturating_sub(bytes);
    }

    /// The block of a process was acknowledged or given up
    fn finish(&mut self, direction: LinkDirection, harq_process: u8) {
        self.in_flight.remove(&(direction, harq_process));
    }
}

/// Scheduler plus the channel and traffic around it
pub struct Simulator {
    scheduler: MacScheduler,
    ues: BTreeMap<Rnti, SimUe>,
    error_model: Arc<dyn ErrorModel>,
    pm_search: Option<PmSearchIdeal>,
    histories: HashMap<(Rnti, LinkDirection, u8), Vec<ErrorModelOutput>>,
    rng: StdRng,
    unit_normal: Normal<f64>,
    cqi_period: u64,
    sfn: SfnSf,
    slots_run: u64,
    trace: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("sfn", &self.sfn)
            .field("slots_run", &self.slots_run)
            .field("ues", &self.ues.len())
            .finish()
    }
}

impl Simulator {
    pub fn new(config: &SimConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let mut scheduler = MacScheduler::new(config.scheduler.clone())?;
        let pm_search = if config.ues.iter().any(|u| u.mimo) {
            Some(PmSearchIdeal::new(config.scheduler.pm_search.clone(), scheduler.dl_amc().clone())?)
        } else {
            None
        };
        let error_model = config.scheduler.error_model.create();
        let sfn = SfnSf::origin(config.scheduler.carrier.numerology)?;

        let mut ues = BTreeMap::new();
        for profile in &config.ues {
            let rnti = Rnti(profile.rnti);
            scheduler.ue_config_req(rnti)?;
            ues.insert(rnti, SimUe::new(profile.clone()));
        }

        let mut sim = Self {
            scheduler,
            ues,
            error_model,
            pm_search,
            histories: HashMap::new(),
            rng: StdRng::seed_from_u64(config.simulation.seed),
            unit_normal: Normal::new(0.0, 1.0).context("unit normal distribution")?,
            cqi_period: config.simulation.cqi_period as u64,
            sfn,
            slots_run: 0,
            trace: None,
        };
        for profile in &config.ues {
            for direction in [LinkDirection::Downlink, LinkDirection::Uplink] {
                sim.deliver(SchedulerMessage::LcConfig(LcConfig {
                    rnti: Rnti(profile.rnti),
                    lcid: DATA_LCID,
                    lcg: DATA_LCG,
                    qci: profile.qci,
                    direction,
                }))?;
            }
            sim.deliver(SchedulerMessage::RachIndication(RachIndication { rnti: Rnti(profile.rnti) }))?;
        }
        info!("Simulator ready: {} UEs, seed {}", sim.ues.len(), config.simulation.seed);
        Ok(sim)
    }

    /// Record every message given to the scheduler as a JSON line
    pub fn with_trace(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.trace = Some(writer);
        self
    }

    pub fn scheduler(&self) -> &MacScheduler {
        &self.scheduler
    }

    pub fn slots_run(&self) -> u64 {
        self.slots_run
    }

    fn record(&mut self, msg: &SchedulerMessage) -> anyhow::Result<()> {
        if let Some(out) = self.trace.as_mut() {
            writeln!(out, "{}", msg.to_json()?)?;
        }
        Ok(())
    }

    /// Hand one message to the scheduler
    fn deliver(&mut self, msg: SchedulerMessage) -> anyhow::Result<()> {
        self.record(&msg)?;
        trace!(rnti = %msg.rnti(), "deliver {}", msg.kind());
        match msg {
            SchedulerMessage::RlcBufferStatus(m) => self.scheduler.dl_rlc_buffer_req(&m)?,
            SchedulerMessage::UlBsr(m) => self.scheduler.ul_bsr(&m)?,
            SchedulerMessage::DlCqi(m) => self.scheduler.dl_cqi_info_req(m.into())?,
            SchedulerMessage::UlSinr(m) => self.scheduler.ul_sinr_report(&m)?,
            SchedulerMessage::HarqFeedback(m) => self.scheduler.harq_feedback(m)?,
            SchedulerMessage::Handover(m) => self.scheduler.handover(&m)?,
            SchedulerMessage::LcConfig(m) => self.scheduler.lc_config(&m)?,
            SchedulerMessage::RachIndication(m) => self.scheduler.rach_indication(&m)?,
        }
        Ok(())
    }

    /// Per-RB SINR (linear) seen by a UE in this slot
    fn draw_sinr(&mut self, profile: &UeProfile, num_rbs: usize) -> Vec<f64> {
        (0..num_rbs)
            .map(|_| {
                let fade = self.unit_normal.sample(&mut self.rng) * profile.fading_std_db;
                db_to_linear(profile.snr_db + fade)
            })
            .collect()
    }

    /// Rayleigh channel scaled to the UE's SNR, white noise
    fn draw_mimo_signal(&mut self, profile: &UeProfile, num_rbs: usize) -> MimoSignal {
        let (rx, tx) = match &self.pm_search {
            Some(pm) => (pm.config().ue_ports, pm.config().gnb_ports()),
            None => (1, 1),
        };
        let amplitude = (db_to_linear(profile.snr_db) / 2.0).sqrt();
        let mut chan = ComplexMatrixArray::zeros(rx, tx, num_rbs);
        for rb in 0..num_rbs {
            for r in 0..rx {
                for t in 0..tx {
                    let re = self.unit_normal.sample(&mut self.rng);
                    let im = self.unit_normal.sample(&mut self.rng);
                    chan.set(r, t, rb, Complex64::new(re, im) * amplitude);
                }
            }
        }
        MimoSignal { chan_mat: chan, cov_mat: CovMat(ComplexMatrixArray::identity(rx, num_rbs)) }
    }

    fn report_traffic(&mut self) -> anyhow::Result<()> {
        let mut messages = Vec::with_capacity(self.ues.len() * 2);
        for (rnti, ue) in self.ues.iter_mut() {
            ue.dl_queue = ue.dl_queue.saturating_add(ue.profile.dl_bytes_per_slot).min(MAX_QUEUE_BYTES);
            ue.ul_queue = ue.ul_queue.saturating_add(ue.profile.ul_bytes_per_slot).min(MAX_QUEUE_BYTES);
            if ue.profile.dl_bytes_per_slot > 0 {
                messages.push(SchedulerMessage::RlcBufferStatus(RlcBufferStatus {
                    rnti: *rnti,
                    lcid: DATA_LCID,
                    tx_queue_size: ue.dl_queue,
                    tx_queue_hol_delay: 0,
                    retx_queue_size: 0,
                    retx_queue_hol_delay: 0,
                    status_pdu_size: 0,
                }));
            }
            if ue.profile.ul_bytes_per_slot > 0 {
                messages.push(SchedulerMessage::UlBsr(UlBsr { rnti: *rnti, lcg: DATA_LCG, buffer_size: ue.ul_queue }));
            }
        }
        messages.into_iter().try_for_each(|m| self.deliver(m))
    }

    fn report_cqi(&mut self, num_rbs: usize) -> anyhow::Result<()> {
        let carrier = &self.scheduler.config().carrier;
        let (cell_id, bwp_id) = (CellId(carrier.cell_id), BwpId(carrier.bwp_id));
        let profiles: Vec<UeProfile> = self.ues.values().map(|u| u.profile.clone()).collect();

        for profile in profiles {
            let rnti = Rnti(profile.rnti);
            let mut info = None;
            if profile.mimo {
                let signal = self.draw_mimo_signal(&profile, num_rbs);
                if let Some(pm) = &self.pm_search {
                    match pm.create_cqi_feedback_mimo(&signal) {
                        Ok(csi) => {
                            let cqi_type = if csi.sb_cqis.len() > 1 { CqiType::Subband } else { CqiType::Wideband };
                            info = Some(DlCqiInfo {
                                report: DlCqiReport {
                                    rnti,
                                    cell_id,
                                    bwp_id,
                                    cqi_type,
                                    rank: csi.rank,
                                    wb_cqi: csi.wb_cqi,
                                    sb_cqis: csi.sb_cqis,
                                },
                                prec_mats: Some(csi.prec_mats),
                            });
                        }
                        Err(LayerError::CapabilityUnavailable(what)) => {
                            warn!(%rnti, "MIMO CSI unavailable ({}), reporting SISO CQI", what);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            let info = match info {
                Some(info) => info,
                None => {
                    let sinr = self.draw_sinr(&profile, num_rbs);
                    let feedback = self.scheduler.dl_amc().create_cqi_feedback_siso(&sinr)?;
                    DlCqiInfo::from(DlCqiReport {
                        rnti,
                        cell_id,
                        bwp_id,
                        cqi_type: CqiType::Wideband,
                        rank: 1,
                        wb_cqi: feedback.cqi,
                        sb_cqis: Vec::new(),
                    })
                }
            };
            self.record(&SchedulerMessage::DlCqi(info.report.clone()))?;
            debug!(%rnti, "CQI {} rank {}", info.report.wb_cqi, info.report.rank);
            self.scheduler.dl_cqi_info_req(info)?;
            if let Some(ue) = self.ues.get_mut(&rnti) {
                ue.stats.cqi_reports += 1;
            }
        }
        Ok(())
    }

    /// Decode every data allocation of `slot` and send back HARQ feedback and UL SINR
    fn receive(&mut self, slot: &SlotAllocInfo, num_rbs: usize) -> anyhow::Result<()> {
        let rb_per_rbg = self.scheduler.config().carrier.rb_per_rbg as usize;
        let mut sinr_cache: HashMap<Rnti, Vec<f64>> = HashMap::new();
        let mut messages = Vec::new();
        let sounding: HashSet<Rnti> = slot.dcis(DciFormat::Ul, DciType::Srs).map(|d| d.rnti).collect();

        for alloc in slot.var_tti_alloc_info.iter().filter(|v| v.dci.dci_type == DciType::Data) {
            let dci = &alloc.dci;
            let Some(profile) = self.ues.get(&dci.rnti).map(|u| u.profile.clone()) else {
                continue;
            };
            let direction = match dci.format {
                DciFormat::Dl => LinkDirection::Downlink,
                DciFormat::Ul => LinkDirection::Uplink,
            };
            let sinr = match sinr_cache.get(&dci.rnti) {
                Some(s) => s.clone(),
                None => {
                    let s = self.draw_sinr(&profile, num_rbs);
                    sinr_cache.insert(dci.rnti, s.clone());
                    s
                }
            };

            // Layers share the power and sit one after the other in the SINR vector
            let rank = dci.rank.max(1) as usize;
            let layered: Vec<f64> = (0..rank).flat_map(|_| sinr.iter().map(|s| s / rank as f64)).collect();
            let rbs: Vec<usize> = dci.rbg_indices()
                .into_iter()
                .flat_map(|rbg| rbg * rb_per_rbg..((rbg + 1) * rb_per_rbg).min(num_rbs))
                .collect();
            let map: Vec<usize> = (0..rank).flat_map(|l| rbs.iter().map(move |rb| l * num_rbs + rb)).collect();

            let key = (dci.rnti, direction, dci.harq_process);
            if dci.ndi == 1 {
                self.histories.remove(&key);
            }
            let history = self.histories.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let output = self.error_model.tb_decodification_stats(&layered, &map, dci.tb_size, dci.mcs, history)?;
            let ack = self.rng.gen::<f64>() >= output.tbler;
            trace!(rnti = %dci.rnti, "{:?} HARQ {} rv {} tbler {:.3} ack={}", direction, dci.harq_process, dci.rv, output.tbler, ack);
            if ack {
                self.histories.remove(&key);
            } else {
                self.histories.entry(key).or_default().push(output);
            }

            if let Some(ue) = self.ues.get_mut(&dci.rnti) {
                let served: u32 = alloc.rlc_pdu_info.iter().map(|p| p.size).sum();
                ue.serve(direction, dci.harq_process, dci.ndi == 1, served);
                if ack {
                    ue.finish(direction, dci.harq_process);
                }
                let stats = &mut ue.stats;
                match direction {
                    LinkDirection::Downlink => {
                        stats.dl_tx += 1;
                        stats.dl_mcs_sum += dci.mcs as u64;
                        if ack { stats.dl_bytes += dci.tb_size as u64 } else { stats.dl_nacks += 1 }
                    }
                    LinkDirection::Uplink => {
                        stats.ul_tx += 1;
                        if ack { stats.ul_bytes += dci.tb_size as u64 } else { stats.ul_nacks += 1 }
                    }
                }
            }

            messages.push(SchedulerMessage::HarqFeedback(HarqFeedback {
                rnti: dci.rnti,
                direction,
                harq_process_id: dci.harq_process,
                ack,
                bwp_index: dci.bwp_index,
            }));
            if direction == LinkDirection::Uplink && !sounding.contains(&dci.rnti) {
                messages.push(SchedulerMessage::UlSinr(UlSinrReport {
                    rnti: dci.rnti,
                    sfn_sf: slot.sfn_sf,
                    sinr_per_rb: sinr,
                }));
            }
        }

        // The scheduler keeps one UL measurement per UE and slot; a sounding occasion covers the band
        for rnti in sounding {
            let Some(profile) = self.ues.get(&rnti).map(|u| u.profile.clone()) else { continue };
            let sinr = match sinr_cache.remove(&rnti) {
                Some(s) => s,
                None => self.draw_sinr(&profile, num_rbs),
            };
            messages.push(SchedulerMessage::UlSinr(UlSinrReport { rnti, sfn_sf: slot.sfn_sf, sinr_per_rb: sinr }));
            if let Some(ue) = self.ues.get_mut(&rnti) {
                ue.stats.srs_reports += 1;
            }
        }
        if slot.contains_ul_msg3_allocation() {
            for dci in slot.dcis(DciFormat::Ul, DciType::Msg3) {
                if let Some(ue) = self.ues.get_mut(&dci.rnti) {
                    debug!(rnti = %dci.rnti, "Msg3 of {} bytes received", dci.tb_size);
                    ue.stats.msg3_grants += 1;
                }
            }
        }
        messages.into_iter().try_for_each(|m| self.deliver(m))
    }

    /// Run one slot
    pub fn step(&mut self) -> anyhow::Result<SlotAllocInfo> {
        let num_rbs = self.scheduler.config().carrier.num_rbs as usize;
        if self.slots_run % self.cqi_period == 0 {
            self.report_cqi(num_rbs)?;
        }
        self.report_traffic()?;

        let sfn = self.sfn;
        let slot = self.scheduler.get_slot_allocation(sfn)
            .with_context(|| format!("scheduling slot {}", sfn))?;

        // Processes given up while building this slot may already carry new data in it
        for failure in self.scheduler.take_harq_failures() {
            if let Some(ue) = self.ues.get_mut(&failure.rnti) {
                ue.stats.harq_failures += 1;
                ue.finish(failure.direction, failure.harq_process);
            }
            self.histories.remove(&(failure.rnti, failure.direction, failure.harq_process));
        }
        self.receive(&slot, num_rbs)?;

        self.sfn = sfn.next();
        self.slots_run += 1;
        Ok(slot)
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            slots: self.slots_run,
            numerology: self.scheduler.config().carrier.numerology,
            ues: self.ues.values().map(|u| u.stats.clone()).collect(),
        }
    }
}

/// Run `slots` slots, optionally paced in real time, until done or `stop` is raised
pub async fn run(mut sim: Simulator, slots: u64, realtime: bool, stop: Arc<AtomicBool>) -> anyhow::Result<SimReport> {
    let numerology = sim.scheduler().config().carrier.numerology;
    let mut interval = tokio::time::interval(tokio::time::Duration::from_micros(
        time::slot_duration_us(numerology) as u64,
    ));
    info!("Running {} slots{}", slots, if realtime { " in real time" } else { "" });

    while sim.slots_run() < slots && !stop.load(Ordering::Relaxed) {
        if realtime {
            interval.tick().await;
        } else if sim.slots_run() % 256 == 0 {
            tokio::task::yield_now().await;
        }
        sim.step()?;
    }
    if let Some(out) = sim.trace.as_mut() {
        out.flush()?;
    }
    Ok(sim.report())
}
