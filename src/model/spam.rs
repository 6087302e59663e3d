// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! State preparations and POVMs.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use num_complex::Complex64;
use tracing::warn;

use crate::basis::Basis;
use crate::error::{Error, Result};
use crate::linalg::{complex_cholesky, dagger};

use super::Parameterization;

const PROJECTION_WARN_TOL: f64 = 1e-10;

/// A vectorized state preparation under one of the parameterization policies.
#[derive(Debug, Clone)]
pub enum SpamVector {
    Static(Array1<f64>),
    Full(Array1<f64>),
    /// First element fixed to 1/√d (unit trace).
    Tp(Array1<f64>),
    /// ρ = T T† / Tr(T T†) with T lower-triangular.
    Cptp(CptpState),
}

impl SpamVector {
    pub fn new(vector: Array1<f64>, policy: Parameterization, basis: &Arc<Basis>) -> Result<Self> {
        check_len(&vector, basis.dim(), "preparation vector")?;
        Ok(match policy {
            Parameterization::Static => SpamVector::Static(vector),
            Parameterization::Full => SpamVector::Full(vector),
            Parameterization::Tp => SpamVector::Tp(project_tp(vector, basis)),
            Parameterization::Cptp => SpamVector::Cptp(CptpState::from_vector(&vector, basis)?),
        })
    }

    pub fn policy(&self) -> Parameterization {
        match self {
            SpamVector::Static(_) => Parameterization::Static,
            SpamVector::Full(_) => Parameterization::Full,
            SpamVector::Tp(_) => Parameterization::Tp,
            SpamVector::Cptp(_) => Parameterization::Cptp,
        }
    }

    pub fn vector(&self) -> &Array1<f64> {
        match self {
            SpamVector::Static(v) | SpamVector::Full(v) | SpamVector::Tp(v) => v,
            SpamVector::Cptp(state) => &state.vector,
        }
    }

    pub fn num_params(&self) -> usize {
        let dim = self.vector().len();
        match self {
            SpamVector::Static(_) => 0,
            SpamVector::Full(_) | SpamVector::Cptp(_) => dim,
            SpamVector::Tp(_) => dim - 1,
        }
    }

    pub fn to_vector(&self) -> Vec<f64> {
        match self {
            SpamVector::Static(_) => Vec::new(),
            SpamVector::Full(v) => v.to_vec(),
            SpamVector::Tp(v) => v.iter().skip(1).copied().collect(),
            SpamVector::Cptp(state) => state.to_params(),
        }
    }

    pub fn from_vector(&mut self, params: &[f64]) -> Result<()> {
        let expected = self.num_params();
        if params.len() != expected {
            return Err(Error::dimension("preparation parameters", expected, params.len()));
        }
        match self {
            SpamVector::Static(_) => {}
            SpamVector::Full(v) => v.assign(&Array1::from_iter(params.iter().copied())),
            SpamVector::Tp(v) => {
                for (k, p) in params.iter().enumerate() {
                    v[k + 1] = *p;
                }
            }
            SpamVector::Cptp(state) => state.load_params(params),
        }
        Ok(())
    }

    /// dρ/dθ_k, shape (num_params, dim).
    pub fn deriv(&self) -> Array2<f64> {
        let dim = self.vector().len();
        let n = self.num_params();
        match self {
            SpamVector::Static(_) => Array2::zeros((0, dim)),
            SpamVector::Full(_) => Array2::eye(dim),
            SpamVector::Tp(_) => {
                let mut d = Array2::zeros((n, dim));
                for k in 0..n {
                    d[[k, k + 1]] = 1.0;
                }
                d
            }
            SpamVector::Cptp(state) => state.deriv(),
        }
    }

    /// Replace the vector, keeping the policy (best-effort projection).
    pub fn set_vector(&mut self, vector: Array1<f64>) -> Result<()> {
        check_len(&vector, self.vector().len(), "preparation vector")?;
        match self {
            SpamVector::Static(v) | SpamVector::Full(v) => *v = vector,
            SpamVector::Tp(v) => {
                let first = v[0];
                *v = vector;
                if (v[0] - first).abs() > PROJECTION_WARN_TOL {
                    warn!(
                        deviation = v[0] - first,
                        "projecting preparation onto unit trace"
                    );
                }
                v[0] = first;
            }
            SpamVector::Cptp(state) => {
                let basis = Arc::clone(&state.basis);
                *state = CptpState::from_vector(&vector, &basis)?;
            }
        }
        Ok(())
    }
}

fn check_len(v: &Array1<f64>, dim: usize, context: &str) -> Result<()> {
    if v.len() != dim {
        return Err(Error::dimension(context, dim, v.len()));
    }
    Ok(())
}

fn project_tp(mut v: Array1<f64>, basis: &Basis) -> Array1<f64> {
    let fixed = 1.0 / (basis.hilbert_dim() as f64).sqrt();
    if (v[0] - fixed).abs() > PROJECTION_WARN_TOL {
        warn!(
            deviation = v[0] - fixed,
            "projecting preparation onto unit trace"
        );
    }
    v[0] = fixed;
    v
}

/// Positive unit-trace density matrix parameterized by its Cholesky factor.
#[derive(Debug, Clone)]
pub struct CptpState {
    basis: Arc<Basis>,
    cholesky: Array2<Complex64>,
    vector: Array1<f64>,
}

impl CptpState {
    fn from_vector(v: &Array1<f64>, basis: &Arc<Basis>) -> Result<Self> {
        let rho = basis.devectorize(v);
        let hermitian = (&rho + &dagger(&rho)) * Complex64::new(0.5, 0.0);
        let cholesky = complex_cholesky(&hermitian)?;
        let mut state = Self {
            basis: Arc::clone(basis),
            cholesky,
            vector: Array1::zeros(v.len()),
        };
        state.refresh();
        Ok(state)
    }

    fn to_params(&self) -> Vec<f64> {
        let d = self.cholesky.nrows();
        let mut out = Vec::with_capacity(d * d);
        for i in 0..d {
            for j in 0..=i {
                let z = self.cholesky[[i, j]];
                out.push(z.re);
                if i != j {
                    out.push(z.im);
                }
            }
        }
        out
    }

    fn load_params(&mut self, params: &[f64]) {
        let d = self.cholesky.nrows();
        let mut k = 0;
        for i in 0..d {
            for j in 0..=i {
                if i == j {
                    self.cholesky[[i, j]] = Complex64::new(params[k], 0.0);
                    k += 1;
                } else {
                    self.cholesky[[i, j]] = Complex64::new(params[k], params[k + 1]);
                    k += 2;
                }
            }
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        let a = self.cholesky.dot(&dagger(&self.cholesky));
        let trace: f64 = (0..a.nrows()).map(|i| a[[i, i]].re).sum();
        let rho = if trace > 0.0 {
            a * Complex64::new(1.0 / trace, 0.0)
        } else {
            let d = a.nrows();
            Array2::<Complex64>::eye(d) * Complex64::new(1.0 / d as f64, 0.0)
        };
        self.vector = self.basis.vectorize(&rho);
    }

    fn deriv(&self) -> Array2<f64> {
        let d = self.cholesky.nrows();
        let a = self.cholesky.dot(&dagger(&self.cholesky));
        let trace: f64 = (0..d).map(|i| a[[i, i]].re).sum();
        let dim = self.vector.len();
        let mut out = Array2::zeros((d * d, dim));
        if trace <= 0.0 {
            return out;
        }

        let mut row = 0;
        for i in 0..d {
            for j in 0..=i {
                let units = if i == j {
                    vec![Complex64::new(1.0, 0.0)]
                } else {
                    vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)]
                };
                for unit in units {
                    let mut e = Array2::<Complex64>::zeros((d, d));
                    e[[i, j]] = unit;
                    let da = e.dot(&dagger(&self.cholesky)) + self.cholesky.dot(&dagger(&e));
                    let dtrace: f64 = (0..d).map(|k| da[[k, k]].re).sum();
                    let drho = da * Complex64::new(1.0 / trace, 0.0)
                        - &a * Complex64::new(dtrace / (trace * trace), 0.0);
                    out.row_mut(row).assign(&self.basis.vectorize(&drho));
                    row += 1;
                }
            }
        }
        out
    }
}

/// A named set of effect vectors.
///
/// Under the TP policy the last effect is the complement
/// `identity − Σ others` and owns no parameters.
#[derive(Debug, Clone)]
pub struct Povm {
    labels: Vec<String>,
    effects: Vec<Array1<f64>>,
    policy: Parameterization,
    identity: Array1<f64>,
}

impl Povm {
    /// CPTP requests are treated as TP.
    pub fn new(
        effects: Vec<(String, Array1<f64>)>,
        policy: Parameterization,
        basis: &Basis,
    ) -> Result<Self> {
        if effects.is_empty() {
            return Err(Error::dimension("POVM effects", 1, 0));
        }
        let dim = basis.dim();
        for (_, e) in &effects {
            check_len(e, dim, "effect vector")?;
        }
        let policy = match policy {
            Parameterization::Cptp => Parameterization::Tp,
            other => other,
        };
        let (labels, effects) = effects.into_iter().unzip();
        let mut povm = Self {
            labels,
            effects,
            policy,
            identity: basis.identity_vector(),
        };
        if policy == Parameterization::Tp {
            povm.complete();
        }
        Ok(povm)
    }

    pub fn policy(&self) -> Parameterization {
        self.policy
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect(&self, k: usize) -> &Array1<f64> {
        &self.effects[k]
    }

    /// Effects paired with their labels.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array1<f64>)> {
        self.labels.iter().map(String::as_str).zip(self.effects.iter())
    }

    fn num_free_effects(&self) -> usize {
        match self.policy {
            Parameterization::Static => 0,
            Parameterization::Tp => self.effects.len() - 1,
            _ => self.effects.len(),
        }
    }

    pub fn num_params(&self) -> usize {
        self.num_free_effects() * self.identity.len()
    }

    pub fn to_vector(&self) -> Vec<f64> {
        self.effects[..self.num_free_effects()]
            .iter()
            .flat_map(|e| e.iter().copied())
            .collect()
    }

    pub fn from_vector(&mut self, params: &[f64]) -> Result<()> {
        let expected = self.num_params();
        if params.len() != expected {
            return Err(Error::dimension("POVM parameters", expected, params.len()));
        }
        let dim = self.identity.len();
        for (k, chunk) in params.chunks(dim).enumerate() {
            self.effects[k].assign(&Array1::from_iter(chunk.iter().copied()));
        }
        if self.policy == Parameterization::Tp {
            self.complete();
        }
        Ok(())
    }

    /// dE_k/dθ, shape (num_params, dim).
    pub fn effect_deriv(&self, k: usize) -> Array2<f64> {
        let dim = self.identity.len();
        let n = self.num_params();
        let free = self.num_free_effects();
        let mut d = Array2::zeros((n, dim));
        if k < free {
            for j in 0..dim {
                d[[k * dim + j, j]] = 1.0;
            }
        } else if self.policy == Parameterization::Tp {
            for other in 0..free {
                for j in 0..dim {
                    d[[other * dim + j, j]] = -1.0;
                }
            }
        }
        d
    }

    /// Replace all effects, keeping the policy.
    pub fn set_effects(&mut self, effects: Vec<Array1<f64>>) -> Result<()> {
        if effects.len() != self.effects.len() {
            return Err(Error::dimension("POVM effects", self.effects.len(), effects.len()));
        }
        for e in &effects {
            check_len(e, self.identity.len(), "effect vector")?;
        }
        self.effects = effects;
        if self.policy == Parameterization::Tp {
            self.complete();
        }
        Ok(())
    }

    /// Re-wrap under a different policy.
    pub fn with_policy(&self, policy: Parameterization, basis: &Basis) -> Result<Self> {
        Povm::new(
            self.labels.iter().cloned().zip(self.effects.iter().cloned()).collect(),
            policy,
            basis,
        )
    }

    fn complete(&mut self) {
        let last = self.effects.len() - 1;
        let mut complement = self.identity.clone();
        for e in &self.effects[..last] {
            complement -= e;
        }
        self.effects[last] = complement;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_1_SQRT_2;

    fn basis() -> Arc<Basis> {
        Arc::new(Basis::pauli_product(1))
    }

    fn mixed_prep() -> Array1<f64> {
        ndarray::array![FRAC_1_SQRT_2, 0.05, -0.02, 0.6]
    }

    #[test]
    fn test_prep_param_counts() {
        let b = basis();
        let counts: Vec<usize> = [
            Parameterization::Static,
            Parameterization::Full,
            Parameterization::Tp,
            Parameterization::Cptp,
        ]
        .iter()
        .map(|&p| SpamVector::new(mixed_prep(), p, &b).unwrap().num_params())
        .collect();
        assert_eq!(counts, vec![0, 4, 3, 4]);
    }

    #[test]
    fn test_prep_round_trip() {
        let b = basis();
        for policy in [
            Parameterization::Full,
            Parameterization::Tp,
            Parameterization::Cptp,
        ] {
            let prep = SpamVector::new(mixed_prep(), policy, &b).unwrap();
            let mut copy = prep.clone();
            copy.from_vector(&prep.to_vector()).unwrap();
            for (a, e) in copy.vector().iter().zip(mixed_prep().iter()) {
                assert_abs_diff_eq!(*a, *e, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_cptp_prep_deriv_matches_finite_difference() {
        let b = basis();
        let prep = SpamVector::new(mixed_prep(), Parameterization::Cptp, &b).unwrap();
        let d = prep.deriv();
        let v = prep.to_vector();
        let h = 1e-6;
        for k in 0..v.len() {
            let mut plus = prep.clone();
            let mut minus = prep.clone();
            let mut vp = v.clone();
            let mut vm = v.clone();
            vp[k] += h;
            vm[k] -= h;
            plus.from_vector(&vp).unwrap();
            minus.from_vector(&vm).unwrap();
            for j in 0..4 {
                let fd = (plus.vector()[j] - minus.vector()[j]) / (2.0 * h);
                assert_abs_diff_eq!(d[[k, j]], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_tp_povm_complement() {
        let b = basis();
        let e0 = ndarray::array![FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2];
        let e1 = ndarray::array![0.0, 0.0, 0.0, 0.0];
        let povm = Povm::new(
            vec![("0".into(), e0), ("1".into(), e1)],
            Parameterization::Tp,
            &b,
        )
        .unwrap();
        assert_eq!(povm.num_params(), 4);
        let sum = povm.effect(0) + povm.effect(1);
        assert_abs_diff_eq!(sum[0], 2.0_f64.sqrt(), epsilon = 1e-14);
        assert_abs_diff_eq!(povm.effect(1)[3], -FRAC_1_SQRT_2, epsilon = 1e-14);

        let d1 = povm.effect_deriv(1);
        assert_eq!(d1[[2, 2]], -1.0);
    }

    #[test]
    fn test_cptp_povm_is_tp() {
        let b = basis();
        let e = ndarray::array![FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2];
        let povm = Povm::new(
            vec![("0".into(), e.clone()), ("1".into(), e)],
            Parameterization::Cptp,
            &b,
        )
        .unwrap();
        assert_eq!(povm.policy(), Parameterization::Tp);
    }

    #[test]
    fn test_povm_rejects_wrong_length() {
        let b = basis();
        let err = Povm::new(
            vec![("0".into(), Array1::zeros(3))],
            Parameterization::Full,
            &b,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Dimension { .. }));
    }
}
