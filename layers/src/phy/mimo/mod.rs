//! MIMO Channel Processing
//!
//! Interference whitening, rank estimation and precoder extraction on
//! per-RB channel matrices, plus the precoding matrix search built on top.

pub mod linalg;
pub mod matrix;
pub mod pm_search;

pub use linalg::MimoWorkspace;
pub use matrix::{ComplexMatrixArray, SinrMatrix};
pub use pm_search::{MimoSignal, PmCqiInfo, PmSearch, PmSearchConfig, PmSearchIdeal, RankAlgorithm};

use crate::LayerError;
use num_complex::Complex64;
use std::ops::Deref;
use tracing::trace;

/// Noise plus interference covariance, one Hermitian page per RB
#[derive(Debug, Clone, PartialEq)]
pub struct CovMat(pub ComplexMatrixArray);

impl Deref for CovMat {
    type Target = ComplexMatrixArray;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl CovMat {
    /// Whiten `chan` (rx x tx x RBs): solve `L X = H` where `L L^H` is the
    /// covariance read through its upper triangle
    pub fn calc_intf_norm_channel(&self, chan: &ComplexMatrixArray) -> Result<IntfNormChanMat, LayerError> {
        if self.num_rows() != chan.num_rows() || self.num_cols() != chan.num_rows() {
            return Err(LayerError::InternalInconsistency(format!(
                "covariance {}x{} does not match channel with {} rx ports",
                self.num_rows(), self.num_cols(), chan.num_rows()
            )));
        }
        if self.num_pages() != chan.num_pages() {
            return Err(LayerError::InternalInconsistency(format!(
                "covariance has {} RBs, channel has {}", self.num_pages(), chan.num_pages()
            )));
        }
        let mut out = chan.clone();
        for rb in 0..chan.num_pages() {
            let l = linalg::cholesky(self.page(rb))?;
            linalg::forward_substitute(l.view(), out.page_mut(rb));
        }
        Ok(IntfNormChanMat(out))
    }
}

/// Interference-normalized channel, or a correlation derived from one
#[derive(Debug, Clone, PartialEq)]
pub struct IntfNormChanMat(pub ComplexMatrixArray);

impl Deref for IntfNormChanMat {
    type Target = ComplexMatrixArray;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntfNormChanMat {
    /// Channel correlation `H^H H` per RB
    pub fn correlation(&self) -> Result<IntfNormChanMat, LayerError> {
        Ok(IntfNormChanMat(self.hermitian_transpose().mat_mul(&self.0)?))
    }

    /// Average over RBs
    pub fn wideband_channel(&self) -> IntfNormChanMat {
        IntfNormChanMat(self.page_average())
    }

    /// MSE matrices `((H W)^H (H W) + I)^-1`, one rank x rank page per RB
    pub fn compute_mse_mimo(
        &self,
        prec_mats: &ComplexMatrixArray,
        ws: &mut MimoWorkspace,
    ) -> Result<ComplexMatrixArray, LayerError> {
        self.check_precoders(prec_mats)?;
        let rank = prec_mats.num_cols();
        let mut res = ComplexMatrixArray::zeros(rank, rank, prec_mats.num_pages());
        for rb in 0..prec_mats.num_pages() {
            linalg::mse_page(self.page(rb), prec_mats.page(rb), ws, res.page_mut(rb))?;
        }
        Ok(res)
    }

    /// Post-MMSE SINR per layer and RB for the given precoders
    pub fn compute_sinr_for_precoding(&self, prec_mats: &ComplexMatrixArray) -> Result<SinrMatrix, LayerError> {
        let mut ws = MimoWorkspace::new();
        let mse = self.compute_mse_mimo(prec_mats, &mut ws)?;
        let rank = prec_mats.num_cols();
        let mut sinr = SinrMatrix::zeros(rank, prec_mats.num_pages());
        for rb in 0..mse.num_pages() {
            for layer in 0..rank {
                let m = mse.get(layer, layer, rb).re.max(f64::MIN_POSITIVE);
                sinr.set(layer, rb, (1.0 / m - 1.0).max(0.0));
            }
        }
        Ok(sinr)
    }

    /// Rank as the number of eigenvalues above `threshold` times the largest,
    /// evaluated on the first page
    pub fn eigen_wideband_rank(&self, threshold: f64) -> Result<u8, LayerError> {
        self.page_rank(0, threshold)
    }

    /// Per-page eigen rank
    pub fn eigen_subband_ranks(&self, threshold: f64) -> Result<Vec<u8>, LayerError> {
        (0..self.num_pages()).map(|p| self.page_rank(p, threshold)).collect()
    }

    /// Streams that receive power when water-filling unit power over the
    /// eigenmodes of the first page, capped at `max_rank`
    pub fn waterfilling_wideband_rank(&self, max_rank: u8) -> Result<u8, LayerError> {
        let (values, _) = linalg::hermitian_eigen(self.page(0))?;
        let streams = linalg::waterfilling_streams(&values, 1.0);
        Ok((streams.max(1) as u8).min(max_rank.max(1)))
    }

    /// Dominant right singular vectors of each RB's channel, scaled to
    /// unit total power over `rank` layers
    pub fn extract_optimal_precoding_matrices(&self, rank: u8) -> Result<ComplexMatrixArray, LayerError> {
        let rank = rank as usize;
        if rank == 0 || rank > self.num_cols() {
            return Err(LayerError::InvalidState(format!(
                "rank {} not within 1..={} tx ports", rank, self.num_cols()
            )));
        }
        let corr = self.correlation()?;
        let scale = Complex64::new(1.0 / (rank as f64).sqrt(), 0.0);
        let mut prec = ComplexMatrixArray::zeros(self.num_cols(), rank, self.num_pages());
        for rb in 0..self.num_pages() {
            let (_, vectors) = linalg::hermitian_eigen(corr.page(rb))?;
            for layer in 0..rank {
                for port in 0..self.num_cols() {
                    prec.set(port, layer, rb, vectors[[port, layer]] * scale);
                }
            }
        }
        Ok(prec)
    }

    fn page_rank(&self, page: usize, threshold: f64) -> Result<u8, LayerError> {
        let (values, _) = linalg::hermitian_eigen(self.page(page))?;
        let max = values.first().copied().unwrap_or(0.0);
        let rank = values.iter().filter(|&&v| v > threshold * max).count().max(1);
        trace!("eigenvalues {:?} -> rank {}", values, rank);
        Ok(rank as u8)
    }

    fn check_precoders(&self, prec_mats: &ComplexMatrixArray) -> Result<(), LayerError> {
        if prec_mats.num_rows() != self.num_cols() || prec_mats.num_pages() != self.num_pages() {
            return Err(LayerError::InternalInconsistency(format!(
                "precoder {}x{}x{} does not match channel {}x{}x{}",
                prec_mats.num_rows(), prec_mats.num_cols(), prec_mats.num_pages(),
                self.num_rows(), self.num_cols(), self.num_pages()
            )));
        }
        Ok(())
    }
}
