//! Precoding Matrix Search
//!
//! Picks the transmission rank and precoders for a UE from its channel and
//! interference estimate, then asks the AMC for the CQI/MCS that go with them.

use super::{ComplexMatrixArray, CovMat, IntfNormChanMat};
use crate::LayerError;
use crate::phy::amc::Amc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Rank estimation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankAlgorithm {
    /// Count eigenvalues above a fraction of the largest
    Svd,
    /// Count eigenmodes that receive power under water-filling
    WaterFilling,
}

/// Search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmSearchConfig {
    /// Upper bound on the rank on top of the port limits
    pub rank_limit: u8,
    pub rank_algorithm: RankAlgorithm,
    /// Relative eigenvalue threshold of the SVD algorithm
    pub rank_threshold: f64,
    /// RBs per CQI subband
    pub subband_size: usize,
    pub gnb_dual_pol: bool,
    pub gnb_h_ports: usize,
    pub gnb_v_ports: usize,
    pub ue_ports: usize,
    /// Restrict ranks to this set (must contain 1)
    pub supported_ranks: Option<Vec<u8>>,
}

impl Default for PmSearchConfig {
    fn default() -> Self {
        Self {
            rank_limit: u8::MAX,
            rank_algorithm: RankAlgorithm::Svd,
            rank_threshold: f64::EPSILON,
            subband_size: 1,
            gnb_dual_pol: false,
            gnb_h_ports: 1,
            gnb_v_ports: 1,
            ue_ports: 1,
            supported_ranks: None,
        }
    }
}

impl PmSearchConfig {
    /// Total gNB antenna ports
    pub fn gnb_ports(&self) -> usize {
        let ports = self.gnb_h_ports * self.gnb_v_ports;
        if self.gnb_dual_pol { 2 * ports } else { ports }
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if self.gnb_ports() == 0 || self.ue_ports == 0 {
            return Err(LayerError::InvalidConfiguration("antenna port counts must be positive".into()));
        }
        if self.subband_size == 0 {
            return Err(LayerError::InvalidConfiguration("subband size must be positive".into()));
        }
        if !(self.rank_threshold.is_finite() && self.rank_threshold >= 0.0) {
            return Err(LayerError::InvalidConfiguration(
                format!("rank threshold {} not a non-negative number", self.rank_threshold)
            ));
        }
        if self.rank_limit == 0 {
            return Err(LayerError::InvalidConfiguration("rank limit must be at least 1".into()));
        }
        if let Some(ranks) = &self.supported_ranks {
            if !ranks.contains(&1) || ranks.contains(&0) {
                return Err(LayerError::InvalidConfiguration(
                    format!("supported ranks {:?} must contain 1 and no 0", ranks)
                ));
            }
        }
        Ok(())
    }

    /// Ranks that can be selected, ascending
    pub fn allowed_ranks(&self) -> Vec<u8> {
        let max = (self.rank_limit as usize).min(self.ue_ports).min(self.gnb_ports()).max(1);
        (1..=max as u8)
            .filter(|r| self.supported_ranks.as_ref().map_or(true, |s| s.contains(r)))
            .collect()
    }
}

/// Channel and interference seen by a UE over all RBs
#[derive(Debug, Clone)]
pub struct MimoSignal {
    /// rx ports x tx ports x RBs
    pub chan_mat: ComplexMatrixArray,
    /// rx ports x rx ports x RBs
    pub cov_mat: CovMat,
}

/// CSI feedback produced by a search
#[derive(Debug, Clone, PartialEq)]
pub struct PmCqiInfo {
    pub rank: u8,
    pub wb_cqi: u8,
    pub sb_cqis: Vec<u8>,
    pub mcs: u8,
    pub tb_size: u32,
    pub prec_mats: Arc<ComplexMatrixArray>,
    /// Mean capacity (bit/s/Hz) of the selected precoders
    pub perf_metric: f64,
}

/// Precoding matrix search strategy
pub trait PmSearch: fmt::Debug + Send + Sync {
    /// Whiten, select rank and precoders, and derive CQI for one report
    fn create_cqi_feedback_mimo(&self, signal: &MimoSignal) -> Result<PmCqiInfo, LayerError>;

    /// Rank for a wideband correlation matrix, snapped to the allowed set
    fn select_rank(&self, wideband_corr: &IntfNormChanMat) -> Result<u8, LayerError>;
}

/// Unquantized search: precoders are the channel's own eigenvectors
#[derive(Debug, Clone)]
pub struct PmSearchIdeal {
    config: PmSearchConfig,
    ranks: Vec<u8>,
    amc: Amc,
}

impl PmSearchIdeal {
    pub fn new(config: PmSearchConfig, amc: Amc) -> Result<Self, LayerError> {
        config.validate()?;
        let ranks = config.allowed_ranks();
        debug!(
            "PM search: {} gNB ports, {} UE ports, ranks {:?}, {:?}",
            config.gnb_ports(), config.ue_ports, ranks, config.rank_algorithm
        );
        Ok(Self { config, ranks, amc })
    }

    pub fn config(&self) -> &PmSearchConfig {
        &self.config
    }

    pub fn ranks(&self) -> &[u8] {
        &self.ranks
    }
}

impl PmSearch for PmSearchIdeal {
    fn create_cqi_feedback_mimo(&self, signal: &MimoSignal) -> Result<PmCqiInfo, LayerError> {
        let chan = &signal.chan_mat;
        if chan.num_rows() != self.config.ue_ports || chan.num_cols() != self.config.gnb_ports() {
            return Err(LayerError::InternalInconsistency(format!(
                "channel is {}x{}, UE has {} ports and gNB {}",
                chan.num_rows(), chan.num_cols(), self.config.ue_ports, self.config.gnb_ports()
            )));
        }

        let norm_chan = signal.cov_mat.calc_intf_norm_channel(chan)?;
        let corr_avg = norm_chan.correlation()?.wideband_channel();
        let rank = self.select_rank(&corr_avg)?;

        let prec_mats = norm_chan.extract_optimal_precoding_matrices(rank)?;
        let sinr = norm_chan.compute_sinr_for_precoding(&prec_mats)?;
        let perf_metric = sinr.mean_capacity();
        let params = self.amc.max_mcs_params(&sinr, self.config.subband_size)?;

        debug!(
            "MIMO CSI: rank={} wb_cqi={} mcs={} capacity={:.2}",
            rank, params.wb_cqi, params.mcs, perf_metric
        );

        Ok(PmCqiInfo {
            rank,
            wb_cqi: params.wb_cqi,
            sb_cqis: params.sb_cqis,
            mcs: params.mcs,
            tb_size: params.tb_size,
            prec_mats: Arc::new(prec_mats),
            perf_metric,
        })
    }

    fn select_rank(&self, wideband_corr: &IntfNormChanMat) -> Result<u8, LayerError> {
        let max_allowed = self.ranks.last().copied().unwrap_or(1);
        let computed = match self.config.rank_algorithm {
            RankAlgorithm::Svd => wideband_corr.eigen_wideband_rank(self.config.rank_threshold)?,
            RankAlgorithm::WaterFilling => wideband_corr.waterfilling_wideband_rank(max_allowed)?,
        };
        // Largest allowed rank not above the computed one
        Ok(self.ranks.iter().rev().copied().find(|&r| r <= computed).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::amc::AmcModel;
    use crate::phy::error_model::ErrorModelType;
    use common::types::LinkDirection;
    use num_complex::Complex64;

    fn amc() -> Amc {
        Amc::from_type(ErrorModelType::EesmCcT1, AmcModel::ErrorModel, LinkDirection::Downlink)
    }

    fn four_by_four(limit: u8, supported: Option<Vec<u8>>, algo: RankAlgorithm) -> PmSearchIdeal {
        let config = PmSearchConfig {
            rank_limit: limit,
            rank_algorithm: algo,
            gnb_dual_pol: true,
            gnb_h_ports: 2,
            gnb_v_ports: 1,
            ue_ports: 4,
            supported_ranks: supported,
            ..Default::default()
        };
        PmSearchIdeal::new(config, amc()).unwrap()
    }

    /// Deterministic, well-conditioned channel scaled to `gain`
    fn signal(rx: usize, tx: usize, rbs: usize, gain: f64, seed: f64) -> MimoSignal {
        let mut chan = ComplexMatrixArray::zeros(rx, tx, rbs);
        for rb in 0..rbs {
            for r in 0..rx {
                for t in 0..tx {
                    let x = seed + (rb * 31 + r * 7 + t * 3) as f64;
                    chan.set(r, t, rb, Complex64::new(x.sin(), (1.7 * x).cos()) * gain);
                }
            }
        }
        MimoSignal { chan_mat: chan, cov_mat: CovMat(ComplexMatrixArray::identity(rx, rbs)) }
    }

    #[test]
    fn test_config_validation() {
        let bad = PmSearchConfig { supported_ranks: Some(vec![2, 4]), ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = PmSearchConfig { ue_ports: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        assert_eq!(
            PmSearchConfig { gnb_dual_pol: true, gnb_h_ports: 2, gnb_v_ports: 2, ..Default::default() }.gnb_ports(),
            8
        );
    }

    #[test]
    fn test_allowed_ranks_respect_limits() {
        let search = four_by_four(3, None, RankAlgorithm::Svd);
        assert_eq!(search.ranks(), &[1, 2, 3]);
        let search = four_by_four(u8::MAX, Some(vec![1, 4]), RankAlgorithm::Svd);
        assert_eq!(search.ranks(), &[1, 4]);
    }

    #[cfg(feature = "linalg")]
    #[test]
    fn test_selected_rank_is_bounded_and_supported() {
        for (limit, supported) in [(2, None), (u8::MAX, Some(vec![1, 2])), (u8::MAX, Some(vec![1, 3])), (4, None)] {
            for algo in [RankAlgorithm::Svd, RankAlgorithm::WaterFilling] {
                let search = four_by_four(limit, supported.clone(), algo);
                for seed in [0.1, 1.3, 2.9] {
                    for gain in [0.05, 1.0, 30.0] {
                        let info = search.create_cqi_feedback_mimo(&signal(4, 4, 6, gain, seed)).unwrap();
                        assert!(info.rank >= 1);
                        assert!(info.rank <= limit.min(4));
                        assert!(search.ranks().contains(&info.rank));
                        assert_eq!(info.prec_mats.num_cols(), info.rank as usize);
                    }
                }
            }
        }
    }

    #[cfg(feature = "linalg")]
    #[test]
    fn test_rank_snaps_down() {
        // Two strong diagonal streams on a 4-port setup give rank 2
        let search = four_by_four(u8::MAX, Some(vec![1, 4]), RankAlgorithm::Svd);
        let mut corr = ComplexMatrixArray::zeros(4, 4, 1);
        corr.set(0, 0, 0, Complex64::new(100.0, 0.0));
        corr.set(1, 1, 0, Complex64::new(50.0, 0.0));
        assert_eq!(search.select_rank(&IntfNormChanMat(corr)).unwrap(), 1);
    }

    #[cfg(feature = "linalg")]
    #[test]
    fn test_feedback_improves_with_gain() {
        let search = four_by_four(u8::MAX, None, RankAlgorithm::Svd);
        let weak = search.create_cqi_feedback_mimo(&signal(4, 4, 4, 0.3, 0.7)).unwrap();
        let strong = search.create_cqi_feedback_mimo(&signal(4, 4, 4, 10.0, 0.7)).unwrap();
        assert!(strong.perf_metric > weak.perf_metric);
        assert!(strong.wb_cqi >= weak.wb_cqi);
        assert_eq!(strong.sb_cqis.len(), 4);
    }

    #[test]
    fn test_port_mismatch_is_rejected() {
        let search = four_by_four(u8::MAX, None, RankAlgorithm::Svd);
        let err = search.create_cqi_feedback_mimo(&signal(2, 4, 2, 1.0, 0.0)).unwrap_err();
        assert!(matches!(err, LayerError::InternalInconsistency(_)));
    }
}
