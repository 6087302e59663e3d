// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Parameterized operations (gates).
//!
//! Each operation stores its d² × d² superoperator together with a
//! parameterization policy. The CPTP policy writes the gate as
//!
//!   G = exp(L) · P,   L = Σ_k h_k H_k + Re Σ_ij (T T†)_ij O_ij
//!
//! with T lower-triangular. exp(L) is CPTP for every (h, T), and the fixed
//! post-factor P is the CPTP projection of the matrix the operation was
//! built from, so every parameter vector gives a CPTP map. The starting
//! point carries a weak dissipator (T = εI) so the dissipative parameters
//! have a nonzero gradient; the stored gate is exp(L₀)·P rather than the
//! input matrix exactly.

use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::basis::Basis;
use crate::error::{Error, Result};
use crate::linalg::{dagger, hermitian_eigh, matrix_exp, matrix_exp_frechet};

use super::GaugeGroup;

/// Initial diagonal of the CPTP Cholesky factor.
///
/// A zero factor has zero derivative, so parameterized gates start with a
/// tiny amount of dissipation in the generator.
const CPTP_INITIAL_CHOLESKY: f64 = 1e-3;

/// Tolerance above which a projection onto a policy's constraint is logged.
const PROJECTION_WARN_TOL: f64 = 1e-10;

/// Choi and Kraus-normalization eigenvalues at or below this are dropped.
const KRAUS_TOL: f64 = 1e-12;

/// How a gate, preparation or POVM maps its parameters to its matrix/vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameterization {
    /// No free parameters.
    Static,
    /// Every element is a parameter.
    Full,
    /// Trace-preserving: the first row (or prep element) is fixed.
    Tp,
    /// Completely positive and trace preserving.
    Cptp,
}

impl Parameterization {
    /// Gauge group compatible with a model using this policy everywhere.
    pub fn default_gauge_group(self) -> GaugeGroup {
        match self {
            Parameterization::Static => GaugeGroup::Trivial,
            Parameterization::Full => GaugeGroup::Full,
            Parameterization::Tp => GaugeGroup::Tp,
            Parameterization::Cptp => GaugeGroup::Unitary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Parameterization::Static => "static",
            Parameterization::Full => "full",
            Parameterization::Tp => "tp",
            Parameterization::Cptp => "cptp",
        }
    }
}

impl FromStr for Parameterization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Parameterization::Static),
            "full" => Ok(Parameterization::Full),
            "tp" => Ok(Parameterization::Tp),
            "cptp" => Ok(Parameterization::Cptp),
            other => Err(Error::Config(format!(
                "unknown parameterization '{}' (expected static, full, tp or cptp)",
                other
            ))),
        }
    }
}

/// A gate under one of the parameterization policies.
#[derive(Debug, Clone)]
pub enum Operation {
    Static(Array2<f64>),
    Full(Array2<f64>),
    Tp(Array2<f64>),
    Cptp(LindbladOperation),
}

impl Operation {
    /// Wrap `matrix` under `policy`, projecting onto the policy's constraint.
    pub fn new(matrix: Array2<f64>, policy: Parameterization, basis: &Arc<Basis>) -> Result<Self> {
        let dim = basis.dim();
        check_shape(&matrix, dim)?;
        Ok(match policy {
            Parameterization::Static => Operation::Static(matrix),
            Parameterization::Full => Operation::Full(matrix),
            Parameterization::Tp => Operation::Tp(project_tp(matrix)),
            Parameterization::Cptp => {
                Operation::Cptp(LindbladOperation::from_matrix(&matrix, Arc::clone(basis))?)
            }
        })
    }

    pub fn policy(&self) -> Parameterization {
        match self {
            Operation::Static(_) => Parameterization::Static,
            Operation::Full(_) => Parameterization::Full,
            Operation::Tp(_) => Parameterization::Tp,
            Operation::Cptp(_) => Parameterization::Cptp,
        }
    }

    /// The superoperator matrix.
    pub fn matrix(&self) -> &Array2<f64> {
        match self {
            Operation::Static(m) | Operation::Full(m) | Operation::Tp(m) => m,
            Operation::Cptp(op) => &op.matrix,
        }
    }

    pub fn dim(&self) -> usize {
        self.matrix().nrows()
    }

    pub fn num_params(&self) -> usize {
        let dim = self.dim();
        match self {
            Operation::Static(_) => 0,
            Operation::Full(_) => dim * dim,
            Operation::Tp(_) => dim * dim - dim,
            Operation::Cptp(op) => op.num_params(),
        }
    }

    pub fn to_vector(&self) -> Vec<f64> {
        match self {
            Operation::Static(_) => Vec::new(),
            Operation::Full(m) => m.iter().copied().collect(),
            Operation::Tp(m) => m.rows().into_iter().skip(1).flatten().copied().collect(),
            Operation::Cptp(op) => op.to_vector(),
        }
    }

    /// Load parameters; `v` must have exactly `num_params()` entries.
    pub fn from_vector(&mut self, v: &[f64]) -> Result<()> {
        let expected = self.num_params();
        if v.len() != expected {
            return Err(Error::dimension("operation parameters", expected, v.len()));
        }
        let dim = self.dim();
        match self {
            Operation::Static(_) => {}
            Operation::Full(m) => {
                for (dst, src) in m.iter_mut().zip(v) {
                    *dst = *src;
                }
            }
            Operation::Tp(m) => {
                for (k, src) in v.iter().enumerate() {
                    m[[1 + k / dim, k % dim]] = *src;
                }
            }
            Operation::Cptp(op) => op.from_vector(v),
        }
        Ok(())
    }

    /// dG/dθ_k for every parameter, shape (num_params, dim, dim).
    pub fn deriv(&self) -> Array3<f64> {
        let dim = self.dim();
        let n = self.num_params();
        let mut d = Array3::zeros((n, dim, dim));
        match self {
            Operation::Static(_) => {}
            Operation::Full(_) => {
                for k in 0..n {
                    d[[k, k / dim, k % dim]] = 1.0;
                }
            }
            Operation::Tp(_) => {
                for k in 0..n {
                    d[[k, 1 + k / dim, k % dim]] = 1.0;
                }
            }
            Operation::Cptp(op) => {
                for (k, dk) in op.deriv().into_iter().enumerate() {
                    d.index_axis_mut(Axis(0), k).assign(&dk);
                }
            }
        }
        d
    }

    /// Replace the matrix, keeping the policy (best-effort projection).
    pub fn set_matrix(&mut self, matrix: Array2<f64>) -> Result<()> {
        check_shape(&matrix, self.dim())?;
        match self {
            Operation::Static(m) | Operation::Full(m) => *m = matrix,
            Operation::Tp(m) => *m = project_tp(matrix),
            Operation::Cptp(op) => {
                let basis = Arc::clone(&op.basis);
                *op = LindbladOperation::from_matrix(&matrix, basis)?;
            }
        }
        Ok(())
    }

    /// Re-wrap the current matrix under a different policy.
    pub fn with_policy(&self, policy: Parameterization, basis: &Arc<Basis>) -> Result<Self> {
        Operation::new(self.matrix().clone(), policy, basis)
    }
}

fn check_shape(matrix: &Array2<f64>, dim: usize) -> Result<()> {
    if matrix.nrows() != dim {
        return Err(Error::dimension("operation rows", dim, matrix.nrows()));
    }
    if matrix.ncols() != dim {
        return Err(Error::dimension("operation columns", dim, matrix.ncols()));
    }
    Ok(())
}

fn project_tp(mut matrix: Array2<f64>) -> Array2<f64> {
    let deviation: f64 = matrix
        .row(0)
        .iter()
        .enumerate()
        .map(|(j, &v)| (v - if j == 0 { 1.0 } else { 0.0 }).abs())
        .sum();
    if deviation > PROJECTION_WARN_TOL {
        warn!(deviation, "projecting operation onto trace-preserving subspace");
    }
    let mut first = matrix.row_mut(0);
    first.fill(0.0);
    first[0] = 1.0;
    matrix
}

/// Nearest CPTP map to `matrix` in the Kraus sense.
///
/// Negative Choi eigenvalues are dropped, the remaining Kraus operators are
/// renormalized by (Σ K†K)^(-1/2), and weight lost on the kernel of Σ K†K
/// is restored as the projector onto it. CPTP input is returned unchanged.
pub fn project_cptp(matrix: &Array2<f64>, basis: &Basis) -> Result<Array2<f64>> {
    let d = basis.hilbert_dim();
    let choi = hermitian_eigh(&basis.choi_matrix(matrix))?;

    let mut kraus = Vec::new();
    for (k, &lambda) in choi.values.iter().enumerate() {
        if lambda <= KRAUS_TOL {
            continue;
        }
        let v = choi.vectors.column(k);
        let scale = Complex64::new((d as f64 * lambda).sqrt(), 0.0);
        kraus.push(Array2::from_shape_fn((d, d), |(p, i)| v[p * d + i] * scale));
    }

    let completeness = kraus
        .iter()
        .fold(Array2::<Complex64>::zeros((d, d)), |acc, k| acc + dagger(k).dot(k));
    let normalize = hermitian_eigh(&completeness)?.map(|l| {
        if l > KRAUS_TOL {
            1.0 / l.sqrt()
        } else {
            0.0
        }
    });
    let mut kraus: Vec<Array2<Complex64>> = kraus.iter().map(|k| k.dot(&normalize)).collect();

    let covered = kraus
        .iter()
        .fold(Array2::<Complex64>::zeros((d, d)), |acc, k| acc + dagger(k).dot(k));
    let missing = Array2::<Complex64>::eye(d) - covered;
    let kernel = hermitian_eigh(&missing)?.map(|l| if l > KRAUS_TOL { l.sqrt() } else { 0.0 });
    if kernel.iter().any(|z| z.norm() > KRAUS_TOL) {
        kraus.push(kernel);
    }

    let projected = basis.superop_from_map(|rho| {
        kraus
            .iter()
            .fold(Array2::zeros((d, d)), |acc, k| acc + k.dot(rho).dot(&dagger(k)))
    });
    let deviation = (&projected - matrix).iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    if deviation > PROJECTION_WARN_TOL {
        warn!(deviation, "projecting operation onto CPTP maps");
    }
    Ok(projected)
}

/// CPTP gate G = exp(L(h, T)) · P.
#[derive(Debug, Clone)]
pub struct LindbladOperation {
    basis: Arc<Basis>,
    hamiltonian: Array1<f64>,
    cholesky: Array2<Complex64>,
    postfactor: Array2<f64>,
    generator: Array2<f64>,
    matrix: Array2<f64>,
}

impl LindbladOperation {
    /// Post-factor P = CPTP projection of `matrix`, zero Hamiltonian and a
    /// small diagonal Cholesky factor.
    pub fn from_matrix(matrix: &Array2<f64>, basis: Arc<Basis>) -> Result<Self> {
        let n = basis.dim() - 1;
        let postfactor = project_cptp(matrix, &basis)?;
        let hamiltonian = Array1::zeros(n);
        let cholesky = Array2::from_diag_elem(n, Complex64::new(CPTP_INITIAL_CHOLESKY, 0.0));
        let generator = build_generator(&basis, &hamiltonian, &cholesky);
        let matrix = matrix_exp(&generator).dot(&postfactor);
        Ok(Self {
            basis,
            hamiltonian,
            cholesky,
            postfactor,
            generator,
            matrix,
        })
    }

    /// (d² − 1) Hamiltonian terms plus (d² − 1)² Cholesky entries.
    pub fn num_params(&self) -> usize {
        let n = self.hamiltonian.len();
        n + n * n
    }

    /// The Lindbladian L.
    pub fn generator(&self) -> &Array2<f64> {
        &self.generator
    }

    pub fn to_vector(&self) -> Vec<f64> {
        let mut v = self.hamiltonian.to_vec();
        let n = self.hamiltonian.len();
        for i in 0..n {
            for j in 0..=i {
                let z = self.cholesky[[i, j]];
                v.push(z.re);
                if i != j {
                    v.push(z.im);
                }
            }
        }
        v
    }

    fn from_vector(&mut self, v: &[f64]) {
        let n = self.hamiltonian.len();
        self.hamiltonian.assign(&Array1::from_iter(v[..n].iter().copied()));
        let mut k = n;
        for i in 0..n {
            for j in 0..=i {
                if i == j {
                    self.cholesky[[i, j]] = Complex64::new(v[k], 0.0);
                    k += 1;
                } else {
                    self.cholesky[[i, j]] = Complex64::new(v[k], v[k + 1]);
                    k += 2;
                }
            }
        }
        self.generator = build_generator(&self.basis, &self.hamiltonian, &self.cholesky);
        self.matrix = matrix_exp(&self.generator).dot(&self.postfactor);
    }

    /// dG/dθ_k via the Fréchet derivative of exp at L.
    fn deriv(&self) -> Vec<Array2<f64>> {
        let n = self.hamiltonian.len();
        let gens = self.basis.lindblad_generators();
        let t_dag = dagger(&self.cholesky);
        let mut out = Vec::with_capacity(self.num_params());

        let mut push = |dl: Array2<f64>| {
            let (_, frechet) = matrix_exp_frechet(&self.generator, &dl);
            out.push(frechet.dot(&self.postfactor));
        };

        for k in 0..n {
            push(gens.hamiltonian(k).clone());
        }
        for i in 0..n {
            for j in 0..=i {
                let units = if i == j {
                    vec![Complex64::new(1.0, 0.0)]
                } else {
                    vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)]
                };
                for unit in units {
                    // dC = E T† + T E† with E the unit at (i, j)
                    let mut e = Array2::<Complex64>::zeros((n, n));
                    e[[i, j]] = unit;
                    let dc = e.dot(&t_dag) + self.cholesky.dot(&dagger(&e));
                    push(gens.dissipator_sum(&dc));
                }
            }
        }
        out
    }
}

fn build_generator(
    basis: &Basis,
    hamiltonian: &Array1<f64>,
    cholesky: &Array2<Complex64>,
) -> Array2<f64> {
    let gens = basis.lindblad_generators();
    let c = cholesky.dot(&dagger(cholesky));
    gens.hamiltonian_sum(hamiltonian) + gens.dissipator_sum(&c)
}
