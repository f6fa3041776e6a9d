//! MIESM Error Model
//!
//! Mean mutual information per coded bit over the allocated RBs, mapped to a
//! code block error rate by an erfc curve keyed on effective code rate and code
//! block size. HARQ retransmissions accumulate mutual information weighted by
//! the coded bits each attempt carried (IEEE 802.16m IR model).

use super::{erfc, tbler_from_cbler, validate_map, ErrorModel, ErrorModelOutput, MiStats};
use crate::LayerError;
use crate::phy::ldpc::CodeBlockSegmentation;
use crate::phy::mcs_tables::McsTable;
use tracing::trace;

/// Lowest effective code rate the mapping curves are defined for
const MIN_ECR: f64 = 0.03;

/// Mutual information per coded bit of a `qm`-bit constellation at linear SINR `sinr`
pub fn mi_per_bit(sinr: f64, qm: u8) -> f64 {
    ((1.0 + sinr.max(0.0)).log2() / qm.max(1) as f64).min(1.0)
}

/// Block error rate of a code block of `cb_size` bits at mutual information `mib`
pub fn mi_to_bler(mib: f64, ecr: f64, cb_size: u32) -> f64 {
    let b = ecr.max(MIN_ECR) + 0.03;
    let c = 0.01 + 0.6 / (cb_size.max(1) as f64).sqrt();
    (0.5 * erfc((mib - b) / (std::f64::consts::SQRT_2 * c))).clamp(0.0, 1.0)
}

/// MIESM error model over MCS table 1
#[derive(Debug, Clone, Default)]
pub struct LteMiErrorModel;

impl LteMiErrorModel {
    pub fn new() -> Self {
        Self
    }

    /// Mean mutual information per bit over the mapped RBs
    pub fn mib(&self, sinr: &[f64], map: &[usize], mcs: u8) -> f64 {
        let qm = McsTable::Table1.modulation_order(mcs);
        let sum: f64 = map.iter().map(|&rb| mi_per_bit(sinr[rb], qm)).sum();
        sum / map.len().max(1) as f64
    }
}

impl ErrorModel for LteMiErrorModel {
    fn tb_decodification_stats(
        &self,
        sinr: &[f64],
        map: &[usize],
        size_bytes: u32,
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> Result<ErrorModelOutput, LayerError> {
        let table = McsTable::Table1;
        if mcs > table.max_mcs() {
            return Err(LayerError::InvalidState(
                format!("MCS {} above table maximum {}", mcs, table.max_mcs())
            ));
        }
        validate_map(sinr, map)?;

        let mib = self.mib(sinr, map, mcs);
        let info_bits = size_bytes * 8;
        let code_bits = ((info_bits as f64) / table.code_rate(mcs)).round().max(1.0) as u32;

        let (weighted_mi, total_code_bits) = history
            .iter()
            .filter_map(|h| h.mi.map(|stats| (stats.mi, h.code_bits)))
            .fold((mib * code_bits as f64, code_bits as f64), |(mi_acc, bits_acc), (mi, bits)| {
                (mi_acc + mi * bits as f64, bits_acc + bits as f64)
            });
        let mi_total = weighted_mi / total_code_bits;
        let ecr = info_bits as f64 / total_code_bits;

        let segmentation = CodeBlockSegmentation::new(info_bits, table.code_rate(mcs));
        let cbler = mi_to_bler(mi_total, ecr, segmentation.code_block_size);
        let tbler = tbler_from_cbler(cbler, segmentation.num_code_blocks);

        trace!(
            "MIESM: mcs={} attempts={} mib={:.3} mi_total={:.3} ecr={:.3} tbler={:.4}",
            mcs, history.len() + 1, mib, mi_total, ecr, tbler
        );

        Ok(ErrorModelOutput {
            tbler,
            sinr_eff: 2f64.powf(mi_total * table.modulation_order(mcs) as f64) - 1.0,
            map: map.to_vec(),
            sinr: sinr.to_vec(),
            mcs,
            info_bits,
            code_bits,
            mi: Some(MiStats { mi: mib, mi_total }),
        })
    }

    fn mcs_table(&self) -> McsTable {
        McsTable::Table1
    }
}
