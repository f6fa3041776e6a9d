//! Paged complex matrices
//!
//! A `ComplexMatrixArray` stacks one rows x cols matrix per resource block.
//! Channel estimates, covariance matrices and precoders all use this shape.

use crate::LayerError;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use num_complex::Complex64;
use num_traits::{One, Zero};

/// Stack of complex matrices, one page per resource block
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexMatrixArray {
    // Stored as (pages, rows, cols) so each page is contiguous
    data: Array3<Complex64>,
}

impl ComplexMatrixArray {
    pub fn zeros(rows: usize, cols: usize, pages: usize) -> Self {
        Self { data: Array3::zeros((pages, rows, cols)) }
    }

    /// `pages` copies of the n x n identity
    pub fn identity(n: usize, pages: usize) -> Self {
        let mut m = Self::zeros(n, n, pages);
        for p in 0..pages {
            for i in 0..n {
                m.data[[p, i, i]] = Complex64::one();
            }
        }
        m
    }

    /// Build from per-page matrices of identical shape
    pub fn from_pages(pages: &[Array2<Complex64>]) -> Result<Self, LayerError> {
        let first = pages.first().ok_or_else(|| {
            LayerError::InvalidState("matrix array needs at least one page".into())
        })?;
        let (rows, cols) = first.dim();
        let mut m = Self::zeros(rows, cols, pages.len());
        for (p, page) in pages.iter().enumerate() {
            if page.dim() != (rows, cols) {
                return Err(LayerError::InternalInconsistency(format!(
                    "page {} is {:?}, expected {:?}", p, page.dim(), (rows, cols)
                )));
            }
            m.data.index_axis_mut(Axis(0), p).assign(page);
        }
        Ok(m)
    }

    pub fn num_rows(&self) -> usize {
        self.data.dim().1
    }

    pub fn num_cols(&self) -> usize {
        self.data.dim().2
    }

    pub fn num_pages(&self) -> usize {
        self.data.dim().0
    }

    pub fn page(&self, page: usize) -> ArrayView2<'_, Complex64> {
        self.data.index_axis(Axis(0), page)
    }

    pub fn page_mut(&mut self, page: usize) -> ArrayViewMut2<'_, Complex64> {
        self.data.index_axis_mut(Axis(0), page)
    }

    pub fn get(&self, row: usize, col: usize, page: usize) -> Complex64 {
        self.data[[page, row, col]]
    }

    pub fn set(&mut self, row: usize, col: usize, page: usize, value: Complex64) {
        self.data[[page, row, col]] = value;
    }

    /// Resize, zeroing the content only when the shape changes
    pub fn set_dimensions(&mut self, rows: usize, cols: usize, pages: usize) {
        if self.data.dim() != (pages, rows, cols) {
            self.data = Array3::zeros((pages, rows, cols));
        }
    }

    /// Conjugate transpose of every page
    pub fn hermitian_transpose(&self) -> Self {
        let mut out = Self::zeros(self.num_cols(), self.num_rows(), self.num_pages());
        for p in 0..self.num_pages() {
            out.page_mut(p).assign(&self.page(p).t().mapv(|v| v.conj()));
        }
        out
    }

    /// Page-wise product `self[p] * rhs[p]`
    pub fn mat_mul(&self, rhs: &ComplexMatrixArray) -> Result<Self, LayerError> {
        if self.num_cols() != rhs.num_rows() || self.num_pages() != rhs.num_pages() {
            return Err(LayerError::InternalInconsistency(format!(
                "cannot multiply {}x{}x{} by {}x{}x{}",
                self.num_rows(), self.num_cols(), self.num_pages(),
                rhs.num_rows(), rhs.num_cols(), rhs.num_pages()
            )));
        }
        let mut out = Self::zeros(self.num_rows(), rhs.num_cols(), self.num_pages());
        for p in 0..self.num_pages() {
            out.page_mut(p).assign(&self.page(p).dot(&rhs.page(p)));
        }
        Ok(out)
    }

    /// Single-page mean over all pages
    pub fn page_average(&self) -> Self {
        let mut out = Self::zeros(self.num_rows(), self.num_cols(), 1);
        if let Some(mean) = self.data.mean_axis(Axis(0)) {
            out.page_mut(0).assign(&mean);
        }
        out
    }

    /// Mean over consecutive groups of `subband_size` pages
    pub fn subband_average(&self, subband_size: usize) -> Result<Self, LayerError> {
        if subband_size == 0 {
            return Err(LayerError::InvalidConfiguration("subband size 0".into()));
        }
        let pages = self.num_pages();
        let num_sb = pages.div_ceil(subband_size);
        let mut out = Self::zeros(self.num_rows(), self.num_cols(), num_sb);
        for sb in 0..num_sb {
            let end = ((sb + 1) * subband_size).min(pages);
            if let Some(mean) = self.data.slice(s![sb * subband_size..end, .., ..]).mean_axis(Axis(0)) {
                out.page_mut(sb).assign(&mean);
            }
        }
        Ok(out)
    }

    /// Repeat each page `factor` times, truncating to `pages` pages
    pub fn expand_pages(&self, factor: usize, pages: usize) -> Self {
        let mut out = Self::zeros(self.num_rows(), self.num_cols(), pages);
        for p in 0..pages {
            let src = (p / factor.max(1)).min(self.num_pages().saturating_sub(1));
            out.page_mut(p).assign(&self.page(src));
        }
        out
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.mapv_inplace(|v| v * factor);
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|v| v.is_zero())
    }
}

/// Post-precoding SINR (linear), one row per layer and one column per RB
#[derive(Debug, Clone, PartialEq)]
pub struct SinrMatrix {
    data: Array2<f64>,
}

impl SinrMatrix {
    pub fn zeros(layers: usize, rbs: usize) -> Self {
        Self { data: Array2::zeros((layers, rbs)) }
    }

    pub fn num_layers(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_rbs(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, layer: usize, rb: usize) -> f64 {
        self.data[[layer, rb]]
    }

    pub fn set(&mut self, layer: usize, rb: usize, value: f64) {
        self.data[[layer, rb]] = value;
    }

    /// Sum over layers of log2(1 + SINR), averaged over RBs
    pub fn mean_capacity(&self) -> f64 {
        if self.num_rbs() == 0 {
            return 0.0;
        }
        self.data.mapv(|v| (1.0 + v.max(0.0)).log2()).sum() / self.num_rbs() as f64
    }
}
