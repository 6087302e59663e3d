// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dense linear algebra on small matrices.
//!
//! Model arrays live in `ndarray`; factorizations go through `faer`:
//!
//! - [`solve`] / [`inverse`]: LU with partial pivoting
//! - [`cholesky_solve`]: LLᵀ for the damped normal equations
//! - [`hermitian_eigenvalues`] / [`hermitian_eigh`]: self-adjoint eigensolver
//! - [`complex_cholesky`]: lower factor of a PSD matrix
//! - [`matrix_exp`]: scaling-and-squaring Padé(13)

pub mod expm;

pub use expm::{matrix_exp, matrix_exp_frechet};

use faer::linalg::solvers::Solve;
use faer::{c64, Mat, Side};
use ndarray::{s, Array1, Array2};
use num_complex::Complex64;

use crate::error::{Error, Result};

/// Relative residual above which a solve is reported as singular.
const SOLVE_RESIDUAL_TOL: f64 = 1e-8;

/// Relative diagonal shift used when a PSD matrix has no strict Cholesky factor.
const CHOLESKY_SHIFT: f64 = 1e-12;

fn to_faer(a: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_faer_complex(a: &Array2<Complex64>) -> Mat<c64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| {
        let z = a[[i, j]];
        c64::new(z.re, z.im)
    })
}

fn from_faer(m: &Mat<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn from_faer_complex(m: &Mat<c64>) -> Array2<Complex64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| {
        let z = m[(i, j)];
        Complex64::new(z.re, z.im)
    })
}

fn check_square<T>(a: &Array2<T>, context: &str) -> Result<usize> {
    if a.nrows() != a.ncols() {
        return Err(Error::dimension(format!("{} columns", context), a.nrows(), a.ncols()));
    }
    Ok(a.nrows())
}

/// Solve A·X = B by LU with partial pivoting.
///
/// Fails with [`Error::Numerical`] if A is (numerically) singular.
pub fn solve(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>> {
    let n = check_square(a, "solve")?;
    if b.nrows() != n {
        return Err(Error::dimension("solve right-hand side rows", n, b.nrows()));
    }
    let scale = frobenius_norm(a);
    if scale == 0.0 {
        return Err(Error::Numerical("solve: zero matrix".into()));
    }

    let x = from_faer(&to_faer(a).partial_piv_lu().solve(&to_faer(b)));
    if !x.iter().all(|v| v.is_finite()) {
        return Err(Error::Numerical("solve: singular matrix".into()));
    }
    let residual = frobenius_norm(&(a.dot(&x) - b));
    if residual > SOLVE_RESIDUAL_TOL * (scale * frobenius_norm(&x) + frobenius_norm(b)) {
        return Err(Error::Numerical(format!(
            "solve: singular matrix (residual {:.3e})",
            residual
        )));
    }
    Ok(x)
}

/// Matrix inverse.
pub fn inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    solve(a, &Array2::eye(a.nrows()))
}

/// Solve A·x = b for symmetric positive-definite A via Cholesky.
///
/// Returns `Ok(None)` if A is not numerically positive definite, so callers
/// can raise damping and retry.
pub fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Option<Array1<f64>>> {
    let n = check_square(a, "cholesky_solve")?;
    if b.len() != n {
        return Err(Error::dimension("cholesky_solve right-hand side", n, b.len()));
    }
    let rhs = Mat::from_fn(n, 1, |i, _| b[i]);
    let Ok(llt) = to_faer(a).llt(Side::Lower) else {
        return Ok(None);
    };
    let x = llt.solve(&rhs);
    let x = Array1::from_shape_fn(n, |i| x[(i, 0)]);
    Ok(x.iter().all(|v| v.is_finite()).then_some(x))
}

/// Eigenvalues of a Hermitian matrix (ascending).
pub fn hermitian_eigenvalues(h: &Array2<Complex64>) -> Result<Vec<f64>> {
    Ok(hermitian_eigh(h)?.values)
}

/// Spectral decomposition H = Σ_k λ_k v_k v_k†.
#[derive(Debug, Clone)]
pub struct HermitianEigen {
    /// Eigenvalues, ascending.
    pub values: Vec<f64>,
    /// Orthonormal eigenvectors, column k pairs with `values[k]`.
    pub vectors: Array2<Complex64>,
}

impl HermitianEigen {
    /// f(H) = Σ_k f(λ_k) v_k v_k†.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Array2<Complex64> {
        let n = self.vectors.nrows();
        let mut out = Array2::zeros((n, n));
        for (k, &lambda) in self.values.iter().enumerate() {
            let weight = f(lambda);
            if weight == 0.0 {
                continue;
            }
            let v = self.vectors.column(k);
            for i in 0..n {
                for j in 0..n {
                    out[[i, j]] += v[i] * v[j].conj() * weight;
                }
            }
        }
        out
    }
}

/// Eigendecomposition of a Hermitian matrix (symmetrized against round-off).
pub fn hermitian_eigh(h: &Array2<Complex64>) -> Result<HermitianEigen> {
    let n = check_square(h, "hermitian_eigh")?;
    let sym = (h + &dagger(h)) * Complex64::new(0.5, 0.0);
    let m = to_faer_complex(&sym);
    let eig = m
        .self_adjoint_eigen(Side::Lower)
        .map_err(|e| Error::Numerical(format!("hermitian eigensolver: {:?}", e)))?;
    let u = from_faer_complex(&eig.U().to_owned());

    // Rayleigh quotients are real and pair with the columns of U.
    let h_u = sym.dot(&u);
    let mut order: Vec<(f64, usize)> = (0..n)
        .map(|k| {
            let lambda: f64 = (0..n).map(|i| (u[[i, k]].conj() * h_u[[i, k]]).re).sum();
            (lambda, k)
        })
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0));

    let values = order.iter().map(|&(lambda, _)| lambda).collect();
    let vectors = Array2::from_shape_fn((n, n), |(i, k)| u[[i, order[k].1]]);
    Ok(HermitianEigen { values, vectors })
}

/// Lower-triangular T with T·T† = A for Hermitian PSD A.
///
/// Input that is not strictly positive definite is clipped to its PSD part
/// and factored after a tiny diagonal shift, so every column of T stays
/// nonzero.
pub fn complex_cholesky(a: &Array2<Complex64>) -> Result<Array2<Complex64>> {
    let n = check_square(a, "complex_cholesky")?;
    let scale = (0..n).map(|i| a[[i, i]].re.abs()).fold(0.0, f64::max).max(1e-300);
    let sym = (a + &dagger(a)) * Complex64::new(0.5, 0.0);

    let factor = |src: &Array2<Complex64>, shift: f64| {
        let m = Mat::from_fn(n, n, |i, j| {
            let z = src[[i, j]];
            let d = if i == j { shift } else { 0.0 };
            c64::new(z.re + d, z.im)
        });
        let llt = m.llt(Side::Lower).ok()?;
        let l = llt.L().to_owned();
        let out = Array2::from_shape_fn((n, n), |(i, j)| {
            if j > i {
                Complex64::new(0.0, 0.0)
            } else {
                let z = l[(i, j)];
                Complex64::new(z.re, z.im)
            }
        });
        out.iter().all(|z| z.re.is_finite() && z.im.is_finite()).then_some(out)
    };

    if let Some(l) = factor(&sym, 0.0) {
        return Ok(l);
    }
    let psd = hermitian_eigh(&sym)?.map(|lambda| lambda.max(0.0));
    factor(&psd, CHOLESKY_SHIFT * scale)
        .ok_or_else(|| Error::Numerical("complex_cholesky: factorization failed".into()))
}

/// Kronecker product of two complex matrices.
pub fn kron(a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            let aij = a[[i, j]];
            if aij == Complex64::new(0.0, 0.0) {
                continue;
            }
            out.slice_mut(s![i * br..(i + 1) * br, j * bc..(j + 1) * bc])
                .assign(&b.mapv(|x| x * aij));
        }
    }
    out
}

/// Conjugate transpose (dagger) of a matrix.
pub fn dagger(m: &Array2<Complex64>) -> Array2<Complex64> {
    m.t().mapv(|z| z.conj())
}

/// Frobenius norm of a real matrix.
pub fn frobenius_norm(m: &Array2<f64>) -> f64 {
    m.iter().map(|x| x * x).sum::<f64>().sqrt()
}
