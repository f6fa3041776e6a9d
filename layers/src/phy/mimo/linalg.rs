//! Dense Hermitian kernels
//!
//! Cholesky factorization, triangular solves, the MSE kernel and a cyclic
//! complex Jacobi eigen solver. All of them sit behind the `linalg` feature;
//! without it every kernel reports `CapabilityUnavailable`.

use crate::LayerError;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use num_complex::Complex64;

/// Scratch buffers reused across pages and calls of the MSE kernel
#[derive(Debug, Default)]
pub struct MimoWorkspace {
    chan_prec: Array2<Complex64>,
    gram: Array2<Complex64>,
    chol: Array2<Complex64>,
}

impl MimoWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure buffers fit an `rx` x `rank` precoded channel
    pub fn reserve(&mut self, rx: usize, rank: usize) {
        if self.chan_prec.dim() != (rx, rank) {
            self.chan_prec = Array2::zeros((rx, rank));
        }
        if self.gram.dim() != (rank, rank) {
            self.gram = Array2::zeros((rank, rank));
            self.chol = Array2::zeros((rank, rank));
        }
    }
}

#[cfg(feature = "linalg")]
mod kernels {
    use super::*;
    use ndarray::linalg::general_mat_mul;
    use num_traits::{One, Zero};

    const JACOBI_MAX_SWEEPS: usize = 100;

    fn not_positive_definite(idx: usize, value: f64) -> LayerError {
        LayerError::InvalidState(format!(
            "matrix not positive definite (pivot {} = {:e})", idx, value
        ))
    }

    /// In-place lower Cholesky factor of the Hermitian matrix whose upper
    /// triangle is stored in `a`; the strict upper part of the result is zeroed
    pub fn cholesky_in_place(mut a: ArrayViewMut2<'_, Complex64>) -> Result<(), LayerError> {
        let n = a.nrows();
        // Mirror the upper view into the lower triangle first
        for i in 0..n {
            for j in 0..i {
                a[[i, j]] = a[[j, i]].conj();
            }
        }
        for j in 0..n {
            let mut diag = a[[j, j]].re;
            for k in 0..j {
                diag -= a[[j, k]].norm_sqr();
            }
            if !(diag > 0.0) {
                return Err(not_positive_definite(j, diag));
            }
            let ljj = diag.sqrt();
            a[[j, j]] = Complex64::new(ljj, 0.0);
            for i in (j + 1)..n {
                let mut sum = a[[i, j]];
                for k in 0..j {
                    sum -= a[[i, k]] * a[[j, k]].conj();
                }
                a[[i, j]] = sum / ljj;
            }
            for i in 0..j {
                a[[i, j]] = Complex64::zero();
            }
        }
        Ok(())
    }

    /// Lower Cholesky factor of a Hermitian matrix read through its upper view
    pub fn cholesky(a: ArrayView2<'_, Complex64>) -> Result<Array2<Complex64>, LayerError> {
        if a.nrows() != a.ncols() {
            return Err(LayerError::InternalInconsistency(format!("Cholesky of non-square {:?}", a.dim())));
        }
        let mut l = a.to_owned();
        cholesky_in_place(l.view_mut())?;
        Ok(l)
    }

    /// Solve `L X = B` for lower-triangular `L`, overwriting `b` with `X`
    pub fn forward_substitute(l: ArrayView2<'_, Complex64>, mut b: ArrayViewMut2<'_, Complex64>) {
        let n = l.nrows();
        for col in 0..b.ncols() {
            for i in 0..n {
                let mut sum = b[[i, col]];
                for k in 0..i {
                    sum -= l[[i, k]] * b[[k, col]];
                }
                b[[i, col]] = sum / l[[i, i]];
            }
        }
    }

    /// Solve `L^H X = B` for lower-triangular `L`, overwriting `b` with `X`
    fn backward_substitute_herm(l: ArrayView2<'_, Complex64>, mut b: ArrayViewMut2<'_, Complex64>) {
        let n = l.nrows();
        for col in 0..b.ncols() {
            for i in (0..n).rev() {
                let mut sum = b[[i, col]];
                for k in (i + 1)..n {
                    sum -= l[[k, i]].conj() * b[[k, col]];
                }
                b[[i, col]] = sum / l[[i, i]].conj();
            }
        }
    }

    /// `out = ((H W)^H (H W) + I)^-1` for one page, using only workspace memory
    pub fn mse_page(
        h: ArrayView2<'_, Complex64>,
        w: ArrayView2<'_, Complex64>,
        ws: &mut MimoWorkspace,
        mut out: ArrayViewMut2<'_, Complex64>,
    ) -> Result<(), LayerError> {
        let rank = w.ncols();
        ws.reserve(h.nrows(), rank);

        general_mat_mul(Complex64::one(), &h, &w, Complex64::zero(), &mut ws.chan_prec);

        for i in 0..rank {
            for j in i..rank {
                let mut acc = Complex64::zero();
                for r in 0..ws.chan_prec.nrows() {
                    acc += ws.chan_prec[[r, i]].conj() * ws.chan_prec[[r, j]];
                }
                if i == j {
                    acc += Complex64::one();
                }
                ws.gram[[i, j]] = acc;
            }
        }

        ws.chol.assign(&ws.gram);
        cholesky_in_place(ws.chol.view_mut())?;

        out.fill(Complex64::zero());
        for i in 0..rank {
            out[[i, i]] = Complex64::one();
        }
        forward_substitute(ws.chol.view(), out.view_mut());
        backward_substitute_herm(ws.chol.view(), out.view_mut());
        Ok(())
    }

    /// Eigenvalues (descending) and eigenvectors (columns) of a Hermitian matrix
    pub fn hermitian_eigen(a: ArrayView2<'_, Complex64>) -> Result<(Vec<f64>, Array2<Complex64>), LayerError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LayerError::InternalInconsistency(format!("eigen of non-square {:?}", a.dim())));
        }
        let mut work = a.to_owned();
        let mut v = Array2::<Complex64>::eye(n);

        let scale: f64 = work.iter().map(|x| x.norm_sqr()).sum::<f64>().max(f64::MIN_POSITIVE);
        for _ in 0..JACOBI_MAX_SWEEPS {
            let off: f64 = (0..n)
                .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
                .map(|(i, j)| work[[i, j]].norm_sqr())
                .sum();
            if off <= 1e-26 * scale {
                break;
            }
            for p in 0..n {
                for q in (p + 1)..n {
                    rotate(&mut work, &mut v, p, q);
                }
            }
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&x, &y| work[[y, y]].re.total_cmp(&work[[x, x]].re));
        let values = order.iter().map(|&i| work[[i, i]].re).collect();
        let mut vectors = Array2::zeros((n, n));
        for (dst, &src) in order.iter().enumerate() {
            vectors.column_mut(dst).assign(&v.column(src));
        }
        Ok((values, vectors))
    }

    /// One complex Jacobi rotation zeroing element (p, q)
    fn rotate(a: &mut Array2<Complex64>, v: &mut Array2<Complex64>, p: usize, q: usize) {
        let apq = a[[p, q]];
        let r = apq.norm();
        if r < 1e-300 {
            return;
        }
        let phase = Complex64::from_polar(1.0, -apq.arg());
        let theta = (a[[q, q]].re - a[[p, p]].re) / (2.0 * r);
        let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
        let c = 1.0 / (1.0 + t * t).sqrt();
        let s = t * c;

        let n = a.nrows();
        for k in 0..n {
            let akp = a[[k, p]];
            let akq = a[[k, q]];
            a[[k, p]] = akp * c - akq * phase * s;
            a[[k, q]] = akp * s + akq * phase * c;
        }
        for k in 0..n {
            let apk = a[[p, k]];
            let aqk = a[[q, k]];
            a[[p, k]] = apk * c - aqk * phase.conj() * s;
            a[[q, k]] = apk * s + aqk * phase.conj() * c;
        }
        a[[p, q]] = Complex64::new(0.0, 0.0);
        a[[q, p]] = Complex64::new(0.0, 0.0);
        for k in 0..n {
            let vkp = v[[k, p]];
            let vkq = v[[k, q]];
            v[[k, p]] = vkp * c - vkq * phase * s;
            v[[k, q]] = vkp * s + vkq * phase * c;
        }
    }
}

#[cfg(not(feature = "linalg"))]
mod kernels {
    use super::*;

    fn unavailable(op: &str) -> LayerError {
        LayerError::CapabilityUnavailable(format!("{} requires matrix library (feature `linalg`)", op))
    }

    pub fn cholesky(_a: ArrayView2<'_, Complex64>) -> Result<Array2<Complex64>, LayerError> {
        Err(unavailable("Cholesky factorization"))
    }

    pub fn forward_substitute(_l: ArrayView2<'_, Complex64>, _b: ArrayViewMut2<'_, Complex64>) {}

    pub fn mse_page(
        _h: ArrayView2<'_, Complex64>,
        _w: ArrayView2<'_, Complex64>,
        _ws: &mut MimoWorkspace,
        _out: ArrayViewMut2<'_, Complex64>,
    ) -> Result<(), LayerError> {
        Err(unavailable("MSE computation"))
    }

    pub fn hermitian_eigen(_a: ArrayView2<'_, Complex64>) -> Result<(Vec<f64>, Array2<Complex64>), LayerError> {
        Err(unavailable("eigen decomposition"))
    }
}

pub use kernels::{cholesky, forward_substitute, hermitian_eigen, mse_page};

/// Water-filling over stream gains with unit total power; returns the number
/// of streams that receive power
pub fn waterfilling_streams(gains: &[f64], total_power: f64) -> usize {
    let mut inv: Vec<f64> = gains
        .iter()
        .filter(|&&g| g > 1e-30)
        .map(|&g| 1.0 / g)
        .collect();
    inv.sort_by(|a, b| a.total_cmp(b));

    let mut active = inv.len();
    while active > 0 {
        let mu = (total_power + inv[..active].iter().sum::<f64>()) / active as f64;
        if mu - inv[active - 1] > 0.0 {
            break;
        }
        active -= 1;
    }
    active
}
