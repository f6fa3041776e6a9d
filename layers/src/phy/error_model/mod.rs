//! Link-to-System Error Models
//!
//! Map a set of per-RB SINR samples, an MCS and the HARQ history of a transport
//! block to a transport block error rate. Implementations differ in how they
//! compress the SINR vector (EESM or MIESM) and how retransmissions combine.

pub mod eesm;
pub mod mi;

use crate::LayerError;
use crate::phy::ldpc::CodeBlockSegmentation;
use crate::phy::mcs_tables::McsTable;
use common::types::LinkDirection;
use common::utils::linear_to_db;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use eesm::{ChaseCombining, EesmCc, EesmErrorModel, EesmIr, HarqCombining, IncrementalRedundancy};
pub use mi::LteMiErrorModel;

/// Mutual-information bookkeeping of the MIESM model
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MiStats {
    /// Mean mutual information per bit of this attempt
    pub mi: f64,
    /// Effective mutual information after HARQ accumulation
    pub mi_total: f64,
}

/// Result of evaluating one transmission attempt
///
/// The caller keeps these in a per-process history; models only ever read it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorModelOutput {
    /// Transport block error rate in [0, 1]
    pub tbler: f64,
    /// Effective SINR (linear) the decision was based on
    pub sinr_eff: f64,
    /// RB indices occupied by this attempt
    pub map: Vec<usize>,
    /// Per-RB SINR (linear) seen by this attempt
    pub sinr: Vec<f64>,
    /// MCS of this attempt
    pub mcs: u8,
    /// Information bits of the transport block
    pub info_bits: u32,
    /// Coded bits sent by this attempt
    pub code_bits: u32,
    pub mi: Option<MiStats>,
}

/// Common behaviour of every error model
pub trait ErrorModel: fmt::Debug + Send + Sync {
    /// Evaluate one attempt of a transport block of `size_bytes` over `map`
    fn tb_decodification_stats(
        &self,
        sinr: &[f64],
        map: &[usize],
        size_bytes: u32,
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> Result<ErrorModelOutput, LayerError>;

    /// MCS/CQI tables backing the model
    fn mcs_table(&self) -> McsTable;

    fn spectral_efficiency_for_cqi(&self, cqi: u8) -> f64 {
        self.mcs_table().cqi_spectral_efficiency(cqi)
    }

    fn spectral_efficiency_for_mcs(&self, mcs: u8) -> f64 {
        self.mcs_table().spectral_efficiency(mcs)
    }

    /// Payload in bytes carried by `rb_sym` RB-symbols of `useful_sc` subcarriers
    fn payload_size(&self, useful_sc: u32, mcs: u8, rank: u8, rb_sym: u32, _mode: LinkDirection) -> u32 {
        let table = self.mcs_table();
        let mcs = mcs.min(table.max_mcs());
        let n_re = useful_sc as f64 * rb_sym as f64;
        let n_info = n_re * table.code_rate(mcs) * table.modulation_order(mcs) as f64 * rank.max(1) as f64;
        transport_block_bits(n_info, table.code_rate(mcs)) / 8
    }

    /// Code block size (bits) used for a transport block of `tb_bits`
    fn max_cb_size(&self, tb_bits: u32, mcs: u8) -> u32 {
        CodeBlockSegmentation::new(tb_bits, self.mcs_table().code_rate(mcs)).code_block_size
    }

    fn max_mcs(&self) -> u8 {
        self.mcs_table().max_mcs()
    }
}

/// Selectable error model implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorModelType {
    EesmCcT1,
    EesmCcT2,
    EesmIrT1,
    EesmIrT2,
    LteMi,
}

impl ErrorModelType {
    /// Build a shared instance of the model
    pub fn create(&self) -> Arc<dyn ErrorModel> {
        match self {
            ErrorModelType::EesmCcT1 => Arc::new(EesmCc::new(McsTable::Table1)),
            ErrorModelType::EesmCcT2 => Arc::new(EesmCc::new(McsTable::Table2)),
            ErrorModelType::EesmIrT1 => Arc::new(EesmIr::new(McsTable::Table1)),
            ErrorModelType::EesmIrT2 => Arc::new(EesmIr::new(McsTable::Table2)),
            ErrorModelType::LteMi => Arc::new(LteMiErrorModel::new()),
        }
    }

    /// MCS table the model works with
    pub fn mcs_table(&self) -> McsTable {
        match self {
            ErrorModelType::EesmCcT2 | ErrorModelType::EesmIrT2 => McsTable::Table2,
            _ => McsTable::Table1,
        }
    }
}

impl Default for ErrorModelType {
    fn default() -> Self {
        ErrorModelType::EesmCcT1
    }
}

/// TBS table for N'info <= 3824, TS 38.214 Table 5.1.3.2-1
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144,
    152, 160, 168, 176, 184, 192, 208, 224, 240, 256, 272, 288, 304, 320,
    336, 352, 368, 384, 408, 432, 456, 480, 504, 528, 552, 576, 608, 640,
    672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064, 1128, 1160,
    1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736,
    1800, 1864, 1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600,
    2664, 2728, 2792, 2856, 2976, 3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

/// Transport block size in bits for `n_info` information bits, TS 38.214 5.1.3.2
pub fn transport_block_bits(n_info: f64, code_rate: f64) -> u32 {
    if n_info <= 0.0 {
        return 0;
    }
    if n_info <= 3824.0 {
        let n = (n_info.log2().floor() as i32 - 6).max(3);
        let step = 2f64.powi(n);
        let n_info_p = (step * (n_info / step).floor()).max(24.0) as u32;
        return TBS_TABLE.iter()
            .copied()
            .find(|&tbs| tbs >= n_info_p)
            .unwrap_or(3824);
    }

    let n = ((n_info - 24.0).log2().floor() as i32) - 5;
    let step = 2f64.powi(n);
    let n_info_p = (step * ((n_info - 24.0) / step).round()).max(3840.0);
    let with_crc = n_info_p + 24.0;
    let tbs = if code_rate <= 0.25 {
        let c = (with_crc / 3816.0).ceil();
        8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0
    } else if n_info_p > 8424.0 {
        let c = (with_crc / 8424.0).ceil();
        8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0
    } else {
        8.0 * (with_crc / 8.0).ceil() - 24.0
    };
    tbs as u32
}

/// Complementary error function, Numerical Recipes `erfcc` (fractional error < 1.2e-7)
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.26551223
        + t * (1.00002368
        + t * (0.37409196
        + t * (0.09678418
        + t * (-0.18628806
        + t * (0.27886807
        + t * (-1.13520398
        + t * (1.48851587
        + t * (-0.82215223
        + t * 0.17087277))))))));
    let ans = t * poly.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

/// SINR in dB at which a code block of `cb_size` bits fails half of the time
pub(crate) fn awgn_threshold_db(qm: u8, code_rate: f64, cb_size: u32) -> f64 {
    let se = qm as f64 * code_rate;
    let shannon_db = linear_to_db(2f64.powf(se) - 1.0);
    // Implementation loss grows with the constellation size
    let gap_db = 1.0 + 0.15 * qm as f64;
    let short_block_db = (crate::phy::ldpc::MAX_CB_SIZE_BG1 as f64 / cb_size.max(40) as f64)
        .log10()
        .max(0.0);
    shannon_db + gap_db + short_block_db
}

/// Code block error rate on the parametric AWGN curve
pub(crate) fn awgn_cbler(sinr_eff_db: f64, qm: u8, code_rate: f64, cb_size: u32) -> f64 {
    let threshold = awgn_threshold_db(qm, code_rate, cb_size);
    let sigma = 0.25 + 4.0 / (cb_size.max(1) as f64).sqrt();
    (0.5 * erfc((sinr_eff_db - threshold) / (std::f64::consts::SQRT_2 * sigma))).clamp(0.0, 1.0)
}

/// Transport block error rate from the per code block rate
pub(crate) fn tbler_from_cbler(cbler: f64, num_code_blocks: u32) -> f64 {
    (1.0 - (1.0 - cbler).powi(num_code_blocks.max(1) as i32)).clamp(0.0, 1.0)
}

/// Check that every map entry addresses a SINR sample
pub(crate) fn validate_map(sinr: &[f64], map: &[usize]) -> Result<(), LayerError> {
    if map.is_empty() {
        return Err(LayerError::InvalidState("empty RB map".into()));
    }
    if let Some(&idx) = map.iter().find(|&&idx| idx >= sinr.len()) {
        return Err(LayerError::InternalInconsistency(
            format!("RB index {} outside SINR vector of {} RBs", idx, sinr.len())
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erfc_reference_points() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-7);
        assert!((erfc(1.0) - 0.157_299_207).abs() < 1e-6);
        assert!((erfc(-1.0) - 1.842_700_793).abs() < 1e-6);
        assert!(erfc(6.0) < 1e-15);
    }

    #[test]
    fn test_tbs_small_region() {
        // N'info = 8 * floor(100 / 8) = 96
        assert_eq!(transport_block_bits(100.0, 0.5), 96);
        assert_eq!(transport_block_bits(10.0, 0.5), 24);
        assert_eq!(transport_block_bits(0.0, 0.5), 0);
        assert_eq!(transport_block_bits(3824.0, 0.5), 3824);
    }

    #[test]
    fn test_tbs_large_region_is_byte_aligned() {
        for n_info in [4000.0, 9000.0, 50_000.0, 200_000.0] {
            for rate in [0.2, 0.6] {
                let tbs = transport_block_bits(n_info, rate);
                assert_eq!(tbs % 8, 0);
                assert!((tbs as f64) > n_info * 0.9);
            }
        }
    }

    #[test]
    fn test_cbler_curve_monotonic() {
        let low = awgn_cbler(0.0, 4, 0.5, 2000);
        let mid = awgn_cbler(6.0, 4, 0.5, 2000);
        let high = awgn_cbler(15.0, 4, 0.5, 2000);
        assert!(low > mid && mid > high);
        assert!(low > 0.99);
        assert!(high < 1e-6);
    }

    #[test]
    fn test_tbler_grows_with_code_blocks() {
        assert!((tbler_from_cbler(0.1, 1) - 0.1).abs() < 1e-12);
        assert!(tbler_from_cbler(0.1, 4) > 0.1);
        assert_eq!(tbler_from_cbler(0.0, 12), 0.0);
    }

    #[test]
    fn test_factory_tables() {
        assert_eq!(ErrorModelType::EesmIrT2.mcs_table(), McsTable::Table2);
        assert_eq!(ErrorModelType::LteMi.create().max_mcs(), 28);
        assert_eq!(ErrorModelType::EesmCcT2.create().max_mcs(), 27);
    }
}
