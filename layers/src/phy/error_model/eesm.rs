//! EESM Error Models
//!
//! Exponential effective SINR mapping with two HARQ combining flavours:
//! Chase combining (every retransmission repeats the same coded bits, SINRs
//! add up per RB) and incremental redundancy (retransmissions carry new parity,
//! the effective code rate drops).

use super::{
    awgn_cbler, tbler_from_cbler, validate_map, ErrorModel, ErrorModelOutput,
};
use crate::LayerError;
use crate::phy::ldpc::CodeBlockSegmentation;
use crate::phy::mcs_tables::McsTable;
use common::utils::linear_to_db;
use std::fmt;
use tracing::trace;

/// EESM calibration factor per MCS, table 1 (64QAM)
const BETA_TABLE1: [f64; 29] = [
    1.60, 1.61, 1.63, 1.65, 1.67, 1.70, 1.73, 1.76, 1.79, 1.82,
    3.97, 4.27, 4.71, 5.16, 5.66, 6.16, 6.50,
    9.64, 10.38, 11.69, 13.28, 15.07, 17.12, 19.35, 21.83, 24.67, 27.71,
    30.77, 33.83,
];

/// EESM calibration factor per MCS, table 2 (256QAM)
const BETA_TABLE2: [f64; 28] = [
    1.60, 1.63, 1.67, 1.73, 1.79,
    4.27, 4.71, 5.16, 5.66, 6.16, 6.50,
    10.38, 11.69, 13.28, 15.07, 17.12, 19.35, 21.83, 24.67, 27.71,
    48.2, 52.1, 58.4, 64.9, 71.6, 78.7, 84.2, 89.8,
];

/// Compress a set of SINR samples (linear) into one effective SINR (linear)
pub fn eesm_sinr_eff<I>(samples: I, beta: f64) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = samples
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), s| (sum + (-s / beta).exp(), count + 1));
    if count == 0 {
        return 0.0;
    }
    let mean = (sum / count as f64).max(f64::MIN_POSITIVE);
    -beta * mean.ln()
}

/// What the combining strategy hands to the BLER curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedSinr {
    /// Effective SINR (linear)
    pub sinr_eff: f64,
    /// Code rate the receiver effectively decodes at
    pub code_rate: f64,
}

/// HARQ combining strategy of an EESM model
pub trait HarqCombining: fmt::Debug + Default + Send + Sync {
    fn name() -> &'static str;

    /// Combine the current attempt with the history into one effective SINR
    fn combine(
        &self,
        table: McsTable,
        beta: f64,
        sinr: &[f64],
        map: &[usize],
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> CombinedSinr;

    /// Equivalent MCS used for the BLER lookup after `retx_count` retransmissions
    fn mcs_eq(&self, table: McsTable, mcs_tx: u8, retx_count: usize) -> u8;
}

/// Chase combining: SINRs of repeated transmissions add up RB by RB
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaseCombining;

impl HarqCombining for ChaseCombining {
    fn name() -> &'static str {
        "CC"
    }

    fn combine(
        &self,
        table: McsTable,
        beta: f64,
        sinr: &[f64],
        map: &[usize],
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> CombinedSinr {
        let attempts = history
            .iter()
            .map(|h| (h.sinr.as_slice(), h.map.as_slice()))
            .chain(std::iter::once((sinr, map)));

        let max_rb_used = attempts.clone().map(|(_, m)| m.len()).max().unwrap_or(0);
        let mut sinr_sum = vec![0.0; max_rb_used];
        for (attempt_sinr, attempt_map) in attempts {
            if attempt_map.is_empty() {
                continue;
            }
            for (j, acc) in sinr_sum.iter_mut().enumerate() {
                *acc += attempt_sinr[attempt_map[j % attempt_map.len()]];
            }
        }

        CombinedSinr {
            sinr_eff: eesm_sinr_eff(sinr_sum, beta),
            code_rate: table.code_rate(mcs),
        }
    }

    fn mcs_eq(&self, _table: McsTable, mcs_tx: u8, _retx_count: usize) -> u8 {
        mcs_tx
    }
}

/// Incremental redundancy: every attempt adds new coded bits over its own RBs
#[derive(Debug, Default, Clone, Copy)]
pub struct IncrementalRedundancy;

impl HarqCombining for IncrementalRedundancy {
    fn name() -> &'static str {
        "IR"
    }

    fn combine(
        &self,
        table: McsTable,
        beta: f64,
        sinr: &[f64],
        map: &[usize],
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> CombinedSinr {
        let previous = history
            .iter()
            .flat_map(|h| h.map.iter().map(move |&rb| h.sinr[rb]));
        let current = map.iter().map(|&rb| sinr[rb]);

        CombinedSinr {
            sinr_eff: eesm_sinr_eff(previous.chain(current), beta),
            code_rate: table.code_rate(mcs) / (history.len() + 1) as f64,
        }
    }

    fn mcs_eq(&self, table: McsTable, mcs_tx: u8, retx_count: usize) -> u8 {
        let qm = table.modulation_order(mcs_tx);
        let target = table.code_rate(mcs_tx) / (retx_count + 1) as f64;
        (0..=table.max_mcs())
            .filter(|&m| table.modulation_order(m) == qm)
            .min_by(|&a, &b| {
                let da = (table.code_rate(a) - target).abs();
                let db = (table.code_rate(b) - target).abs();
                da.total_cmp(&db)
            })
            .unwrap_or(mcs_tx)
    }
}

/// EESM error model parametrised by its HARQ combining strategy
#[derive(Debug, Clone)]
pub struct EesmErrorModel<H: HarqCombining> {
    table: McsTable,
    combining: H,
}

/// EESM with Chase combining
pub type EesmCc = EesmErrorModel<ChaseCombining>;
/// EESM with incremental redundancy
pub type EesmIr = EesmErrorModel<IncrementalRedundancy>;

impl<H: HarqCombining> EesmErrorModel<H> {
    pub fn new(table: McsTable) -> Self {
        Self {
            table,
            combining: H::default(),
        }
    }

    /// EESM beta for an MCS
    pub fn beta(&self, mcs: u8) -> f64 {
        let betas: &[f64] = match self.table {
            McsTable::Table1 => &BETA_TABLE1,
            McsTable::Table2 => &BETA_TABLE2,
        };
        betas[(mcs as usize).min(betas.len() - 1)]
    }

    /// Effective SINR (linear) of the current attempt combined with the history
    pub fn compute_sinr_eff(
        &self,
        sinr: &[f64],
        map: &[usize],
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> Result<f64, LayerError> {
        validate_map(sinr, map)?;
        for h in history {
            validate_map(&h.sinr, &h.map)?;
        }
        Ok(self.combining.combine(self.table, self.beta(mcs), sinr, map, mcs, history).sinr_eff)
    }

    /// Equivalent MCS after `retx_count` retransmissions
    pub fn mcs_eq(&self, mcs_tx: u8, retx_count: usize) -> u8 {
        self.combining.mcs_eq(self.table, mcs_tx, retx_count)
    }
}

impl<H: HarqCombining> ErrorModel for EesmErrorModel<H> {
    fn tb_decodification_stats(
        &self,
        sinr: &[f64],
        map: &[usize],
        size_bytes: u32,
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> Result<ErrorModelOutput, LayerError> {
        if mcs > self.table.max_mcs() {
            return Err(LayerError::InvalidState(
                format!("MCS {} above table maximum {}", mcs, self.table.max_mcs())
            ));
        }
        validate_map(sinr, map)?;
        for h in history {
            validate_map(&h.sinr, &h.map)?;
        }

        let combined = self.combining.combine(self.table, self.beta(mcs), sinr, map, mcs, history);
        let info_bits = size_bytes * 8;
        let segmentation = CodeBlockSegmentation::new(info_bits, self.table.code_rate(mcs));
        let qm = self.table.modulation_order(self.mcs_eq(mcs, history.len()));
        let sinr_eff_db = linear_to_db(combined.sinr_eff.max(f64::MIN_POSITIVE));
        let cbler = awgn_cbler(sinr_eff_db, qm, combined.code_rate, segmentation.code_block_size);
        let tbler = tbler_from_cbler(cbler, segmentation.num_code_blocks);

        trace!(
            "EESM-{}: mcs={} attempts={} sinr_eff={:.2} dB R={:.3} C={} tbler={:.4}",
            H::name(), mcs, history.len() + 1, sinr_eff_db, combined.code_rate,
            segmentation.num_code_blocks, tbler
        );

        Ok(ErrorModelOutput {
            tbler,
            sinr_eff: combined.sinr_eff,
            map: map.to_vec(),
            sinr: sinr.to_vec(),
            mcs,
            info_bits,
            code_bits: (info_bits as f64 / self.table.code_rate(mcs)).round() as u32,
            mi: None,
        })
    }

    fn mcs_table(&self) -> McsTable {
        self.table
    }
}
