// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chi-squared and Poisson log-likelihood objectives.
//!
//! Both objectives are sums over (circuit, outcome) elements and expose the
//! same least-squares view: a residual per element whose square is that
//! element's term. Elements of circuits with zero total count contribute
//! exactly zero. Out-of-range predicted probabilities are clipped, never
//! rejected.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::config::ObjectiveConfig;
use crate::dataset::DataSet;
use crate::error::{Error, Result, ValidationError};
use crate::forward::{bulk_jacobian, bulk_probabilities, EvalLayout};
use crate::model::Model;
use crate::optimize::LeastSquaresProblem;

/// Which statistic is minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Σ N (f − p)² / p
    ChiSquared,
    /// 2 Σ N [f ln(f/p) − (f − p)]
    LogLikelihood,
}

/// An objective bound to a model template, a circuit layout and data.
#[derive(Debug, Clone)]
pub struct Objective<'a> {
    kind: ObjectiveKind,
    model: Model,
    layout: &'a EvalLayout,
    counts: Array1<f64>,
    totals: Array1<f64>,
    clip: ObjectiveConfig,
    param_block_size: Option<usize>,
}

impl<'a> Objective<'a> {
    /// Gather counts for every layout element. Fails with `MissingData`
    /// when a circuit has no entry in `dataset`.
    pub fn new(
        kind: ObjectiveKind,
        model: &Model,
        layout: &'a EvalLayout,
        dataset: &DataSet,
        clip: &ObjectiveConfig,
    ) -> Result<Self> {
        let n = layout.num_elements();
        let mut counts = Array1::zeros(n);
        let mut totals = Array1::zeros(n);
        for (ci, circuit) in layout.circuits().iter().enumerate() {
            let total = dataset
                .total_count(circuit)
                .ok_or_else(|| ValidationError::MissingData {
                    circuit: circuit.to_string(),
                })?;
            for e in layout.element_range(ci) {
                counts[e] = dataset.count(circuit, &layout.elements()[e].outcome);
                totals[e] = total;
            }
        }
        Ok(Self {
            kind,
            model: model.clone(),
            layout,
            counts,
            totals,
            clip: clip.clone(),
            param_block_size: None,
        })
    }

    /// Parameters per Jacobian block.
    pub fn with_param_block_size(mut self, block_size: Option<usize>) -> Self {
        self.param_block_size = block_size;
        self
    }

    /// Same data and layout under another objective.
    pub fn with_kind(&self, kind: ObjectiveKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Multiply the counts of circuit `i` by `scales[i]` (robust scaling).
    pub fn with_count_scaling(&self, scales: &[f64]) -> Result<Self> {
        let num_circuits = self.layout.circuits().len();
        if scales.len() != num_circuits {
            return Err(Error::dimension("count scale factors", num_circuits, scales.len()));
        }
        let mut out = self.clone();
        for (ci, &scale) in scales.iter().enumerate() {
            for e in self.layout.element_range(ci) {
                out.counts[e] *= scale;
                out.totals[e] *= scale;
            }
        }
        Ok(out)
    }

    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    pub fn layout(&self) -> &EvalLayout {
        self.layout
    }

    /// Model with parameter vector `v` loaded.
    pub fn model_at(&self, v: &Array1<f64>) -> Result<Model> {
        let mut model = self.model.clone();
        model.from_vector(&v.to_vec())?;
        Ok(model)
    }

    /// Elements with a nonzero observed count.
    pub fn num_data(&self) -> usize {
        self.counts.iter().filter(|&&n| n > 0.0).count()
    }

    /// Predicted probabilities, clipped to the configured interval.
    pub fn probabilities(&self, v: &Array1<f64>) -> Result<Array1<f64>> {
        let model = self.model_at(v)?;
        let [lo, hi] = self.clip.prob_clip_interval;
        Ok(bulk_probabilities(&model, self.layout)?.mapv(|p| p.clamp(lo, hi)))
    }

    /// Per-element contributions.
    pub fn terms(&self, v: &Array1<f64>) -> Result<Array1<f64>> {
        let probs = self.probabilities(v)?;
        Ok(Array1::from_iter(
            (0..probs.len()).map(|e| self.element(e, probs[e]).0),
        ))
    }

    /// Signed square roots of [`Objective::terms`].
    pub fn residuals(&self, v: &Array1<f64>) -> Result<Array1<f64>> {
        let probs = self.probabilities(v)?;
        Ok(Array1::from_iter(
            (0..probs.len()).map(|e| self.element(e, probs[e]).1),
        ))
    }

    pub fn value(&self, v: &Array1<f64>) -> Result<f64> {
        Ok(self.terms(v)?.sum())
    }

    /// Derivative of the residuals (elements × parameters).
    pub fn jacobian(&self, v: &Array1<f64>) -> Result<Array2<f64>> {
        let model = self.model_at(v)?;
        let (probs, mut jac) = bulk_jacobian(&model, self.layout, self.param_block_size)?;
        let [lo, hi] = self.clip.prob_clip_interval;
        for (e, mut row) in jac.rows_mut().into_iter().enumerate() {
            let p = probs[e];
            let scale = if p < lo || p > hi {
                0.0
            } else {
                self.element(e, p).2
            };
            row *= scale;
        }
        Ok(jac)
    }

    /// Sum of terms per circuit.
    pub fn circuit_contributions(&self, v: &Array1<f64>) -> Result<Vec<f64>> {
        let terms = self.terms(v)?;
        Ok((0..self.layout.circuits().len())
            .map(|ci| self.layout.element_range(ci).map(|e| terms[e]).sum())
            .collect())
    }

    /// (term, residual, d residual / d p) for element `e` at probability `p`.
    fn element(&self, e: usize, p: f64) -> (f64, f64, f64) {
        let total = self.totals[e];
        if total <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let f = self.counts[e] / total;
        match self.kind {
            ObjectiveKind::ChiSquared => chi2_element(total, f, p, self.clip.min_prob_clip_for_weighting),
            ObjectiveKind::LogLikelihood => {
                logl_element(total, f, p, self.clip.min_prob_clip, self.clip.radius)
            }
        }
    }
}

impl LeastSquaresProblem for Objective<'_> {
    fn num_params(&self) -> usize {
        self.model.num_params()
    }

    fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        Objective::residuals(self, x)
    }

    fn jacobian(&self, x: &Array1<f64>) -> Result<Array2<f64>> {
        Objective::jacobian(self, x)
    }
}

fn chi2_element(total: f64, f: f64, p: f64, min_p: f64) -> (f64, f64, f64) {
    let n_sqrt = total.sqrt();
    if p > min_p {
        let r = n_sqrt * (p - f) / p.sqrt();
        let dr = n_sqrt * (p + f) / (2.0 * p.powf(1.5));
        (r * r, r, dr)
    } else {
        let r = n_sqrt * (p - f) / min_p.sqrt();
        (r * r, r, n_sqrt / min_p.sqrt())
    }
}

/// Poisson-picture log-likelihood term 2N[f ln(f/p) − (f − p)] with its
/// quadratic continuations below `min_p` (f > 0) and `radius` (f = 0).
fn logl_element(total: f64, f: f64, p: f64, min_p: f64, radius: f64) -> (f64, f64, f64) {
    let (term, dterm) = if f <= 0.0 {
        if p >= radius {
            (2.0 * total * p, 2.0 * total)
        } else {
            (
                total * (p * p + radius * radius) / radius,
                2.0 * total * p / radius,
            )
        }
    } else if p >= min_p {
        (
            2.0 * total * (f * (f / p).ln() - (f - p)),
            2.0 * total * (1.0 - f / p),
        )
    } else {
        let t0 = 2.0 * total * (f * (f / min_p).ln() - (f - min_p));
        let t1 = 2.0 * total * (1.0 - f / min_p);
        let t2 = 2.0 * total * f / (min_p * min_p);
        let dp = p - min_p;
        let t = t0 + t1 * dp + 0.5 * t2 * dp * dp;
        if t <= 0.0 {
            (0.0, 0.0)
        } else {
            (t, t1 + t2 * dp)
        }
    };

    let term = term.max(0.0);
    let r = (p - f).signum() * term.sqrt();
    let dr = if r.abs() > 1e-12 {
        dterm / (2.0 * r)
    } else if term > 0.0 || f > 0.0 {
        // r ≈ √(N/f)·(p − f) near the minimum
        (total / f.max(min_p)).sqrt()
    } else {
        0.0
    };
    (term, r, dr)
}

/// Upper-tail probability of a chi-squared statistic with `dof` degrees of
/// freedom; `None` when `dof` is not positive.
pub fn p_value(value: f64, dof: f64) -> Option<f64> {
    if !(dof > 0.0) || !value.is_finite() {
        return None;
    }
    ChiSquared::new(dof).ok().map(|d| d.sf(value.max(0.0)))
}

/// Standard deviations of `value` above its chi-squared expectation.
pub fn n_sigma(value: f64, dof: f64) -> Option<f64> {
    if dof > 0.0 {
        Some((value - dof) / (2.0 * dof).sqrt())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::dataset::{generate_data, Sampling};
    use crate::forward::LayoutOptions;
    use crate::stdmodels;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn setup() -> (Model, Vec<Circuit>, DataSet) {
        let target = stdmodels::std1q_xyi().unwrap();
        let noisy = target.depolarize(0.05, 0.01).unwrap();
        let circuits = vec![
            Circuit::empty(),
            Circuit::new(["Gx"]),
            Circuit::new(["Gy", "Gx"]),
            Circuit::new(["Gx", "Gx", "Gy"]),
        ];
        let data = generate_data(&noisy, &circuits, 1000, Sampling::Multinomial { seed: 5 }).unwrap();
        (target, circuits, data)
    }

    // =========================================================================
    // Element functions
    // =========================================================================

    #[test]
    fn test_chi2_element_matches_formula() {
        let (t, r, _) = chi2_element(100.0, 0.3, 0.4, 1e-4);
        assert_relative_eq!(t, 100.0 * 0.01 / 0.4, epsilon = 1e-12);
        assert!(r > 0.0);
    }

    #[test]
    fn test_logl_element_zero_at_match() {
        let (t, r, dr) = logl_element(100.0, 0.3, 0.3, 1e-4, 1e-4);
        assert_abs_diff_eq!(t, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r, 0.0, epsilon = 1e-6);
        assert_relative_eq!(dr, (100.0_f64 / 0.3).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_logl_element_is_finite_for_bad_probabilities() {
        for p in [-0.5, -1e-9, 0.0, 1e-12, 0.5, 1.5] {
            for f in [0.0, 0.2, 1.0] {
                let (t, r, dr) = logl_element(50.0, f, p, 1e-4, 1e-4);
                assert!(t.is_finite() && r.is_finite() && dr.is_finite());
                assert!(t >= 0.0);
            }
        }
    }

    #[test]
    fn test_logl_residual_derivative() {
        let h = 1e-7;
        for (f, p) in [(0.3, 0.25), (0.0, 0.2), (0.0, 5e-5), (0.4, 5e-5), (0.6, 0.7)] {
            let (_, _, dr) = logl_element(100.0, f, p, 1e-4, 1e-4);
            let (_, plus, _) = logl_element(100.0, f, p + h, 1e-4, 1e-4);
            let (_, minus, _) = logl_element(100.0, f, p - h, 1e-4, 1e-4);
            assert_relative_eq!(dr, (plus - minus) / (2.0 * h), max_relative = 1e-4);
        }
    }

    #[test]
    fn test_chi2_residual_derivative() {
        let h = 1e-7;
        for (f, p) in [(0.3, 0.25), (0.0, 0.2), (0.9, 0.7)] {
            let (_, _, dr) = chi2_element(100.0, f, p, 1e-4);
            let (_, plus, _) = chi2_element(100.0, f, p + h, 1e-4);
            let (_, minus, _) = chi2_element(100.0, f, p - h, 1e-4);
            assert_relative_eq!(dr, (plus - minus) / (2.0 * h), max_relative = 1e-4);
        }
    }

    // =========================================================================
    // Objective over a dataset
    // =========================================================================

    #[test]
    fn test_zero_count_circuit_contributes_exactly_zero() {
        let model = stdmodels::std1q_xyi().unwrap();
        let circuits = vec![Circuit::new(["Gx"]), Circuit::new(["Gy"])];
        let mut builder = DataSet::builder();
        builder
            .add_counts(circuits[0].clone(), [("0", 400.0), ("1", 600.0)])
            .unwrap();
        builder
            .add_counts(circuits[1].clone(), [("0", 0.0), ("1", 0.0)])
            .unwrap();
        let data = builder.build();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let v = model.to_vector();
        for kind in [ObjectiveKind::ChiSquared, ObjectiveKind::LogLikelihood] {
            let obj = Objective::new(kind, &model, &layout, &data, &ObjectiveConfig::default()).unwrap();
            let contributions = obj.circuit_contributions(&v).unwrap();
            assert_eq!(contributions[1], 0.0);
            assert!(contributions[0] > 0.0);
            let jac = obj.jacobian(&v).unwrap();
            for e in layout.element_range(1) {
                assert!(jac.row(e).iter().all(|&x| x == 0.0));
            }
        }
    }

    #[test]
    fn test_missing_circuit_is_reported() {
        let model = stdmodels::std1q_xyi().unwrap();
        let circuits = vec![Circuit::new(["Gx"])];
        let data = DataSet::builder().build();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let err = Objective::new(
            ObjectiveKind::ChiSquared,
            &model,
            &layout,
            &data,
            &ObjectiveConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::MissingData { .. })));
    }

    #[test]
    fn test_value_is_sum_of_squared_residuals() {
        let (model, circuits, data) = setup();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let v = model.to_vector();
        for kind in [ObjectiveKind::ChiSquared, ObjectiveKind::LogLikelihood] {
            let obj = Objective::new(kind, &model, &layout, &data, &ObjectiveConfig::default()).unwrap();
            let r = obj.residuals(&v).unwrap();
            assert_relative_eq!(obj.value(&v).unwrap(), r.dot(&r), max_relative = 1e-12);
        }
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let (model, circuits, data) = setup();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let v = model.depolarize(0.02, 0.0).unwrap().to_vector();
        for kind in [ObjectiveKind::ChiSquared, ObjectiveKind::LogLikelihood] {
            let obj = Objective::new(kind, &model, &layout, &data, &ObjectiveConfig::default()).unwrap();
            let jac = obj.jacobian(&v).unwrap();
            let h = 1e-6;
            for k in [0, 4, 10, 30, 42] {
                let mut vp = v.clone();
                let mut vm = v.clone();
                vp[k] += h;
                vm[k] -= h;
                let rp = obj.residuals(&vp).unwrap();
                let rm = obj.residuals(&vm).unwrap();
                for e in 0..rp.len() {
                    assert_abs_diff_eq!(jac[[e, k]], (rp[e] - rm[e]) / (2.0 * h), epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_count_scaling_scales_contributions() {
        let (model, circuits, data) = setup();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let v = model.to_vector();
        let obj = Objective::new(
            ObjectiveKind::LogLikelihood,
            &model,
            &layout,
            &data,
            &ObjectiveConfig::default(),
        )
        .unwrap();
        let scaled = obj.with_count_scaling(&[1.0, 0.5, 1.0, 0.0]).unwrap();
        let a = obj.circuit_contributions(&v).unwrap();
        let b = scaled.circuit_contributions(&v).unwrap();
        assert_relative_eq!(b[1], 0.5 * a[1], max_relative = 1e-12);
        assert_eq!(b[3], 0.0);
        assert!(obj.with_count_scaling(&[1.0]).is_err());
    }

    #[test]
    fn test_num_data_counts_nonzero_elements() {
        let model = stdmodels::std1q_xyi().unwrap();
        let circuits = vec![Circuit::empty()];
        let mut builder = DataSet::builder();
        builder
            .add_counts(Circuit::empty(), [("0", 100.0), ("1", 0.0)])
            .unwrap();
        let data = builder.build();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let obj = Objective::new(
            ObjectiveKind::ChiSquared,
            &model,
            &layout,
            &data,
            &ObjectiveConfig::default(),
        )
        .unwrap();
        assert_eq!(obj.num_data(), 1);
    }

    #[test]
    fn test_p_value() {
        assert_relative_eq!(p_value(0.0, 3.0).unwrap(), 1.0, epsilon = 1e-12);
        assert!(p_value(100.0, 3.0).unwrap() < 1e-10);
        assert!(p_value(1.0, 0.0).is_none());
        assert_relative_eq!(n_sigma(14.0, 8.0).unwrap(), 1.5, epsilon = 1e-12);
    }
}
