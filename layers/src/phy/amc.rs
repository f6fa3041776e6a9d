//! Adaptive Modulation and Coding
//!
//! Turns SINR measurements into CQI/MCS recommendations and computes
//! transport block sizes for scheduled resources.

use crate::LayerError;
use crate::phy::error_model::{ErrorModel, ErrorModelType};
use crate::phy::mcs_tables::McsTable;
use crate::phy::mimo::SinrMatrix;
use common::types::LinkDirection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Subcarriers in one resource block
pub const SUBCARRIERS_PER_RB: u32 = 12;
/// MAC CRC overhead removed from the payload to obtain the TB size
pub const CRC_BYTES: u32 = 3;
/// Data symbols assumed when sizing a block for CQI evaluation
const CQI_REFERENCE_SYMBOLS: u32 = 12;
/// BER target of the Shannon gap model
const SHANNON_BER: f64 = 0.00005;

/// How CQI is derived from SINR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmcModel {
    /// Shannon capacity with an SNR gap
    Shannon,
    /// Highest MCS the error model decodes at the target BLER
    ErrorModel,
}

/// CQI recommendation with the MCS it maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqiFeedback {
    pub cqi: u8,
    pub mcs: u8,
}

/// Link adaptation result for a MIMO report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McsParams {
    pub mcs: u8,
    pub wb_cqi: u8,
    pub sb_cqis: Vec<u8>,
    /// TB size in bytes over the whole bandwidth
    pub tb_size: u32,
}

/// AMC instance bound to one error model and link direction
#[derive(Debug, Clone)]
pub struct Amc {
    error_model: Arc<dyn ErrorModel>,
    model: AmcModel,
    direction: LinkDirection,
    num_ref_sc_per_rb: u8,
    target_bler: f64,
}

impl Amc {
    /// Create a new AMC on top of an error model
    pub fn new(error_model: Arc<dyn ErrorModel>, model: AmcModel, direction: LinkDirection) -> Self {
        Self {
            error_model,
            model,
            direction,
            num_ref_sc_per_rb: 1,
            target_bler: 0.1,
        }
    }

    /// Convenience constructor from the model type
    pub fn from_type(model_type: ErrorModelType, model: AmcModel, direction: LinkDirection) -> Self {
        Self::new(model_type.create(), model, direction)
    }

    /// Reference-signal subcarriers removed from every RB
    pub fn set_num_ref_sc_per_rb(&mut self, n: u8) -> Result<(), LayerError> {
        if n as u32 >= SUBCARRIERS_PER_RB {
            return Err(LayerError::InvalidConfiguration(
                format!("{} reference subcarriers leave no data in an RB", n)
            ));
        }
        self.num_ref_sc_per_rb = n;
        Ok(())
    }

    /// BLER the recommended MCS must meet
    pub fn set_target_bler(&mut self, bler: f64) -> Result<(), LayerError> {
        if !(bler > 0.0 && bler < 1.0) {
            return Err(LayerError::InvalidConfiguration(format!("target BLER {} not in (0,1)", bler)));
        }
        self.target_bler = bler;
        Ok(())
    }

    pub fn error_model(&self) -> &Arc<dyn ErrorModel> {
        &self.error_model
    }

    pub fn mcs_table(&self) -> McsTable {
        self.error_model.mcs_table()
    }

    pub fn max_mcs(&self) -> u8 {
        self.error_model.max_mcs()
    }

    pub fn model(&self) -> AmcModel {
        self.model
    }

    /// MCS matching a reported CQI
    pub fn mcs_from_cqi(&self, cqi: u8) -> u8 {
        self.mcs_table().mcs_from_cqi(cqi)
    }

    /// CQI a UE would report for an MCS it decodes
    pub fn cqi_from_mcs(&self, mcs: u8) -> u8 {
        let table = self.mcs_table();
        table.cqi_from_spectral_efficiency(table.spectral_efficiency(mcs)).max(1)
    }

    /// Payload in bytes carried by `rb_sym` RB-symbols
    pub fn payload_size(&self, mcs: u8, rank: u8, rb_sym: u32) -> u32 {
        let useful_sc = SUBCARRIERS_PER_RB - self.num_ref_sc_per_rb as u32;
        self.error_model.payload_size(useful_sc, mcs, rank, rb_sym, self.direction)
    }

    /// Transport block size in bytes (payload minus MAC CRC)
    pub fn calculate_tb_size(&self, mcs: u8, rank: u8, rb_sym: u32) -> u32 {
        let payload = self.payload_size(mcs, rank, rb_sym);
        if payload >= CRC_BYTES {
            payload - CRC_BYTES
        } else {
            payload
        }
    }

    /// Wideband CQI over every RB of `sinr`, single layer
    pub fn create_cqi_feedback_siso(&self, sinr: &[f64]) -> Result<CqiFeedback, LayerError> {
        let map: Vec<usize> = (0..sinr.len()).collect();
        self.create_cqi_feedback_wb(sinr, &map)
    }

    /// Wideband CQI over the RBs listed in `map`
    pub fn create_cqi_feedback_wb(&self, sinr: &[f64], map: &[usize]) -> Result<CqiFeedback, LayerError> {
        let feedback = self.search(sinr, map, 1, map.len() as u32)?;
        debug!(
            "{:?} CQI feedback over {} RBs: cqi={} mcs={}",
            self.direction, map.len(), feedback.cqi, feedback.mcs
        );
        Ok(feedback)
    }

    /// MCS/CQI for a precoded multi-layer channel, wideband and per subband
    pub fn max_mcs_params(&self, sinr: &SinrMatrix, subband_size: usize) -> Result<McsParams, LayerError> {
        let layers = sinr.num_layers();
        let rbs = sinr.num_rbs();
        if layers == 0 || rbs == 0 {
            return Err(LayerError::InvalidState("empty SINR matrix".into()));
        }
        if subband_size == 0 {
            return Err(LayerError::InvalidConfiguration("subband size 0".into()));
        }
        // Layer-major concatenation: element (l, rb) sits at l * rbs + rb
        let flat: Vec<f64> = (0..layers)
            .flat_map(|l| (0..rbs).map(move |rb| (l, rb)))
            .map(|(l, rb)| sinr.get(l, rb))
            .collect();
        let rank = layers as u8;

        let wb_map: Vec<usize> = (0..flat.len()).collect();
        let wideband = self.search(&flat, &wb_map, rank, rbs as u32)?;

        let mut sb_cqis = Vec::with_capacity(rbs.div_ceil(subband_size));
        for start in (0..rbs).step_by(subband_size) {
            let end = (start + subband_size).min(rbs);
            let map: Vec<usize> = (0..layers)
                .flat_map(|l| (start..end).map(move |rb| l * rbs + rb))
                .collect();
            sb_cqis.push(self.search(&flat, &map, rank, (end - start) as u32)?.cqi);
        }

        let tb_size = self.calculate_tb_size(wideband.mcs, rank, rbs as u32 * CQI_REFERENCE_SYMBOLS);
        trace!("MIMO MCS params: rank={} mcs={} wb_cqi={} sb={:?}", rank, wideband.mcs, wideband.cqi, sb_cqis);

        Ok(McsParams {
            mcs: wideband.mcs,
            wb_cqi: wideband.cqi,
            sb_cqis,
            tb_size,
        })
    }

    fn search(&self, sinr: &[f64], map: &[usize], rank: u8, rbs: u32) -> Result<CqiFeedback, LayerError> {
        match self.model {
            AmcModel::Shannon => Ok(self.shannon(sinr, map)),
            AmcModel::ErrorModel => self.error_model_search(sinr, map, rank, rbs),
        }
    }

    fn shannon(&self, sinr: &[f64], map: &[usize]) -> CqiFeedback {
        let gamma = -(5.0 * SHANNON_BER).ln() / 1.5;
        let se = map.iter()
            .map(|&rb| (1.0 + sinr.get(rb).copied().unwrap_or(0.0) / gamma).log2())
            .sum::<f64>() / map.len().max(1) as f64;
        let cqi = self.mcs_table().cqi_from_spectral_efficiency(se);
        CqiFeedback { cqi, mcs: self.mcs_from_cqi(cqi) }
    }

    fn error_model_search(&self, sinr: &[f64], map: &[usize], rank: u8, rbs: u32) -> Result<CqiFeedback, LayerError> {
        for mcs in (0..=self.max_mcs()).rev() {
            let size = self.payload_size(mcs, rank, rbs * CQI_REFERENCE_SYMBOLS);
            if size == 0 {
                continue;
            }
            let out = self.error_model.tb_decodification_stats(sinr, map, size, mcs, &[])?;
            if out.tbler <= self.target_bler {
                return Ok(CqiFeedback { cqi: self.cqi_from_mcs(mcs), mcs });
            }
        }
        Ok(CqiFeedback { cqi: 0, mcs: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::db_to_linear;

    fn dl_amc(model: AmcModel) -> Amc {
        Amc::from_type(ErrorModelType::EesmCcT1, model, LinkDirection::Downlink)
    }

    #[test]
    fn test_tb_size_grows_with_resources() {
        let amc = dl_amc(AmcModel::ErrorModel);
        let small = amc.calculate_tb_size(10, 1, 4 * 12);
        let large = amc.calculate_tb_size(10, 1, 40 * 12);
        let mimo = amc.calculate_tb_size(10, 2, 40 * 12);
        assert!(small > 0);
        assert!(large > small * 5);
        assert!(mimo > large);
        assert_eq!(amc.calculate_tb_size(10, 1, 0), 0);
    }

    #[test]
    fn test_cqi_increases_with_sinr() {
        for model in [AmcModel::Shannon, AmcModel::ErrorModel] {
            let amc = dl_amc(model);
            let low = amc.create_cqi_feedback_siso(&vec![db_to_linear(0.0); 20]).unwrap();
            let high = amc.create_cqi_feedback_siso(&vec![db_to_linear(25.0); 20]).unwrap();
            assert!(high.cqi > low.cqi, "{:?}", model);
            assert!(high.mcs > low.mcs, "{:?}", model);
        }
    }

    #[test]
    fn test_out_of_range_channel_gives_cqi_zero() {
        let amc = dl_amc(AmcModel::ErrorModel);
        let fb = amc.create_cqi_feedback_siso(&vec![db_to_linear(-20.0); 10]).unwrap();
        assert_eq!(fb, CqiFeedback { cqi: 0, mcs: 0 });
    }

    #[test]
    fn test_mimo_params_report_subbands() {
        let amc = dl_amc(AmcModel::ErrorModel);
        let mut sinr = SinrMatrix::zeros(2, 10);
        for rb in 0..10 {
            let db = if rb < 5 { 20.0 } else { 3.0 };
            sinr.set(0, rb, db_to_linear(db));
            sinr.set(1, rb, db_to_linear(db - 3.0));
        }
        let params = amc.max_mcs_params(&sinr, 5).unwrap();
        assert_eq!(params.sb_cqis.len(), 2);
        assert!(params.sb_cqis[0] > params.sb_cqis[1]);
        assert!(params.tb_size > 0);
        assert!(amc.max_mcs_params(&sinr, 0).is_err());
    }

    #[test]
    fn test_setters_validate() {
        let mut amc = dl_amc(AmcModel::Shannon);
        assert!(amc.set_num_ref_sc_per_rb(12).is_err());
        assert!(amc.set_num_ref_sc_per_rb(2).is_ok());
        assert!(amc.set_target_bler(0.0).is_err());
        assert!(amc.set_target_bler(0.01).is_ok());
    }
}
