// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Gauge groups: the similarity transforms S that leave every predicted
//! probability unchanged for models of a given parameterization.

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::basis::Basis;
use crate::error::{Error, Result};
use crate::linalg::{frobenius_norm, inverse, matrix_exp};

/// Tolerance used when testing group membership.
const MEMBERSHIP_TOL: f64 = 1e-8;

/// Gauge group of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeGroup {
    /// Only the identity (static models).
    Trivial,
    /// S = exp(Σ θ_k H_k): unitary conjugations, compatible with CPTP models.
    Unitary,
    /// Invertible S with first row [1, 0, …, 0].
    Tp,
    /// Any invertible S.
    Full,
}

impl GaugeGroup {
    /// Number of real parameters θ describing a group element.
    pub fn num_params(self, dim: usize) -> usize {
        match self {
            GaugeGroup::Trivial => 0,
            GaugeGroup::Unitary => dim.saturating_sub(1),
            GaugeGroup::Tp => dim * dim - dim,
            GaugeGroup::Full => dim * dim,
        }
    }

    /// Dimension of the group's effective action on a generic model.
    ///
    /// Scalar multiples of the identity act trivially, so the full group
    /// loses one direction.
    pub fn num_effective_params(self, dim: usize) -> usize {
        match self {
            GaugeGroup::Full => dim * dim - 1,
            other => other.num_params(dim),
        }
    }

    /// Group element S(θ). θ = 0 maps to the identity for every group.
    pub fn element(self, theta: &[f64], basis: &Basis) -> Result<GaugeElement> {
        let dim = basis.dim();
        let expected = self.num_params(dim);
        if theta.len() != expected {
            return Err(Error::dimension("gauge parameter vector", expected, theta.len()));
        }

        let mut s = Array2::<f64>::eye(dim);
        match self {
            GaugeGroup::Trivial => {}
            GaugeGroup::Full => {
                for (k, v) in theta.iter().enumerate() {
                    s[[k / dim, k % dim]] += v;
                }
            }
            GaugeGroup::Tp => {
                let mut block = s.slice_mut(s![1.., ..]);
                for (k, v) in theta.iter().enumerate() {
                    block[[k / dim, k % dim]] += v;
                }
            }
            GaugeGroup::Unitary => {
                let gens = basis.lindblad_generators();
                let mut generator = Array2::<f64>::zeros((dim, dim));
                for (k, &v) in theta.iter().enumerate() {
                    if v != 0.0 {
                        generator.scaled_add(v, gens.hamiltonian(k));
                    }
                }
                s = matrix_exp(&generator);
            }
        }
        GaugeElement::new(s)
    }

    /// Check that `s` belongs to this group.
    pub fn check_membership(self, s: &Array2<f64>) -> Result<()> {
        let dim = s.nrows();
        let first_row_ok = || {
            s.row(0)
                .iter()
                .enumerate()
                .all(|(j, &v)| (v - if j == 0 { 1.0 } else { 0.0 }).abs() < MEMBERSHIP_TOL)
        };

        match self {
            GaugeGroup::Full => Ok(()),
            GaugeGroup::Trivial => {
                if frobenius_norm(&(s - &Array2::<f64>::eye(dim))) < MEMBERSHIP_TOL {
                    Ok(())
                } else {
                    Err(Error::GaugeCompatibility(
                        "trivial gauge group admits only the identity".into(),
                    ))
                }
            }
            GaugeGroup::Tp => {
                if first_row_ok() {
                    Ok(())
                } else {
                    Err(Error::GaugeCompatibility(
                        "TP gauge element must have first row [1, 0, ..., 0]".into(),
                    ))
                }
            }
            GaugeGroup::Unitary => {
                let orthogonality = frobenius_norm(&(s.t().dot(s) - Array2::<f64>::eye(dim)));
                if first_row_ok() && orthogonality < MEMBERSHIP_TOL.sqrt() {
                    Ok(())
                } else {
                    Err(Error::GaugeCompatibility(
                        "unitary gauge element must be orthogonal with first row [1, 0, ..., 0]"
                            .into(),
                    ))
                }
            }
        }
    }
}

/// A gauge transform S together with its inverse.
#[derive(Debug, Clone)]
pub struct GaugeElement {
    matrix: Array2<f64>,
    inverse: Array2<f64>,
}

impl GaugeElement {
    /// Fails with `GaugeCompatibility` if `s` is not square or singular.
    pub fn new(s: Array2<f64>) -> Result<Self> {
        if s.nrows() != s.ncols() {
            return Err(Error::GaugeCompatibility(format!(
                "gauge matrix must be square, got {}x{}",
                s.nrows(),
                s.ncols()
            )));
        }
        let inv = inverse(&s)
            .map_err(|_| Error::GaugeCompatibility("gauge matrix is singular".into()))?;
        Ok(Self {
            matrix: s,
            inverse: inv,
        })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn inverse(&self) -> &Array2<f64> {
        &self.inverse
    }
}
