// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Gauge optimization: pick the gauge-equivalent representative of a fitted
//! model closest to a target model.
//!
//! The gauge element S(θ) ranges over the fitted model's gauge group. The
//! objective is a weighted sum of squared per-gate and per-SPAM distances
//! plus optional CP, TP and SPAM-validity penalties, minimized with the same
//! Levenberg-Marquardt solver used for fitting (finite-difference Jacobian).

use ndarray::{Array1, Array2};
use tracing::{info, warn};

use crate::config::{GateMetric, GaugeOptConfig, OptimizerConfig, SpamMetric};
use crate::error::{Error, OptimizationFailure, Result};
use crate::linalg::hermitian_eigenvalues;
use crate::model::Model;
use crate::optimize::{
    finite_difference_jacobian, LeastSquaresProblem, LevenbergMarquardt, OptimizerState,
};

const FD_STEP: f64 = 1e-7;

/// Result of [`gauge_optimize`].
#[derive(Debug, Clone)]
pub struct GaugeOptResult {
    /// The input model transformed by the optimal gauge element.
    pub model: Model,
    pub gauge_matrix: Array2<f64>,
    /// Objective at the identity gauge.
    pub initial_value: f64,
    pub final_value: f64,
    pub iterations: usize,
    /// `Stalled` keeps the best gauge found; `Running` means the solver
    /// failed outright and the identity gauge was kept.
    pub state: OptimizerState,
}

struct GaugeProblem<'a> {
    model: &'a Model,
    target: &'a Model,
    config: &'a GaugeOptConfig,
}

impl GaugeProblem<'_> {
    fn transformed(&self, theta: &Array1<f64>) -> Result<(Model, Array2<f64>)> {
        let group = self.model.gauge_group();
        let element = group
            .element(&theta.to_vec(), self.model.basis())
            .map_err(as_rejection)?;
        let model = self.model.transform(&element).map_err(as_rejection)?;
        Ok((model, element.matrix().clone()))
    }

    fn model_residuals(&self, candidate: &Model) -> Result<Array1<f64>> {
        let cfg = self.config;
        let basis = candidate.basis();
        let mut out: Vec<f64> = Vec::new();

        for (label, op) in candidate.all_operations() {
            let target = self
                .target
                .resolve_operation(&label)
                .ok_or_else(|| Error::UnknownLabel(label.clone()))?;
            let w = cfg.weight(&label, true).sqrt();
            let (g, t) = (op.matrix(), target.matrix());
            match cfg.gates_metric {
                GateMetric::Frobenius => out.extend((g - t).iter().map(|x| w * x)),
                GateMetric::Fidelity => {
                    out.push(w * candidate.entanglement_infidelity_between(g, t)?.sqrt());
                }
                GateMetric::TraceDist => {
                    out.push(w * candidate.jtrace_distance_between(g, t)?);
                }
            }

            if cfg.cp_penalty > 0.0 {
                let negative: f64 = hermitian_eigenvalues(&basis.choi_matrix(g))?
                    .iter()
                    .filter(|&&e| e < 0.0)
                    .map(|e| -e)
                    .sum();
                out.push((cfg.cp_penalty * negative).sqrt());
            }
            if cfg.tp_penalty > 0.0 {
                let tp = cfg.tp_penalty.sqrt();
                out.extend(g.row(0).iter().enumerate().map(|(j, &x)| {
                    tp * (x - if j == 0 { 1.0 } else { 0.0 })
                }));
            }
        }

        for (label, prep) in candidate.preparations() {
            let target = self
                .target
                .preparation(label)
                .ok_or_else(|| Error::UnknownLabel(label.to_string()))?;
            let w = cfg.weight(label, false).sqrt();
            spam_distance(cfg.spam_metric, prep.vector(), target.vector(), w, &mut out);

            if cfg.tp_penalty > 0.0 {
                let expected = 1.0 / (candidate.hilbert_dim() as f64).sqrt();
                out.push(cfg.tp_penalty.sqrt() * (prep.vector()[0] - expected));
            }
            if cfg.spam_penalty > 0.0 {
                let negative: f64 = hermitian_eigenvalues(&basis.devectorize(prep.vector()))?
                    .iter()
                    .filter(|&&e| e < 0.0)
                    .map(|e| -e)
                    .sum();
                out.push((cfg.spam_penalty * negative).sqrt());
            }
        }

        for (label, povm) in candidate.povms() {
            let target = self
                .target
                .povm(label)
                .ok_or_else(|| Error::UnknownLabel(label.to_string()))?;
            if target.len() != povm.len() {
                return Err(Error::dimension(
                    format!("effects of POVM {}", label),
                    povm.len(),
                    target.len(),
                ));
            }
            let w = cfg.weight(label, false).sqrt();
            for k in 0..povm.len() {
                spam_distance(cfg.spam_metric, povm.effect(k), target.effect(k), w, &mut out);
                if cfg.spam_penalty > 0.0 {
                    let outside: f64 = hermitian_eigenvalues(&basis.devectorize(povm.effect(k)))?
                        .iter()
                        .map(|&e| (-e).max(0.0) + (e - 1.0).max(0.0))
                        .sum();
                    out.push((cfg.spam_penalty * outside).sqrt());
                }
            }
        }

        Ok(Array1::from(out))
    }
}

impl LeastSquaresProblem for GaugeProblem<'_> {
    fn num_params(&self) -> usize {
        self.model.gauge_group().num_params(self.model.dim())
    }

    fn residuals(&self, theta: &Array1<f64>) -> Result<Array1<f64>> {
        let (candidate, _) = self.transformed(theta)?;
        self.model_residuals(&candidate)
    }

    fn jacobian(&self, theta: &Array1<f64>) -> Result<Array2<f64>> {
        finite_difference_jacobian(|t| self.residuals(t), theta, FD_STEP)
    }
}

fn spam_distance(metric: SpamMetric, a: &Array1<f64>, b: &Array1<f64>, w: f64, out: &mut Vec<f64>) {
    match metric {
        SpamMetric::Frobenius => out.extend((a - b).iter().map(|x| w * x)),
    }
}

/// Singular or out-of-group trial elements are rejected steps, not fatal errors.
fn as_rejection(e: Error) -> Error {
    match e {
        Error::GaugeCompatibility(msg) => OptimizationFailure::InvalidCost(msg).into(),
        other => other,
    }
}

/// Gauge-transform `model` to best match `target`. `model` is never
/// modified; a new model is returned even when no progress is made.
pub fn gauge_optimize(
    model: &Model,
    target: &Model,
    config: &GaugeOptConfig,
) -> Result<GaugeOptResult> {
    if model.dim() != target.dim() {
        return Err(Error::dimension("target model superoperator", model.dim(), target.dim()));
    }
    let problem = GaugeProblem {
        model,
        target,
        config,
    };
    let theta0 = Array1::zeros(problem.num_params());
    let residuals0 = problem.residuals(&theta0)?;
    let initial_value = residuals0.dot(&residuals0);

    let solver = LevenbergMarquardt::new(OptimizerConfig {
        max_iterations: config.max_iterations,
        ftol: config.tol,
        ..OptimizerConfig::default()
    });

    let (theta, final_value, iterations, state) = match solver.minimize(&problem, &theta0) {
        Ok(r) => (r.x, r.cost, r.iterations, r.state),
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "gauge optimization stopped early; keeping the identity gauge");
            (theta0, initial_value, 0, OptimizerState::Running)
        }
        Err(e) => return Err(e),
    };

    let (optimized, gauge_matrix) = problem.transformed(&theta)?;
    info!(
        initial_value,
        final_value,
        iterations,
        group = ?model.gauge_group(),
        "gauge optimization finished"
    );
    Ok(GaugeOptResult {
        model: optimized,
        gauge_matrix,
        initial_value,
        final_value,
        iterations,
        state,
    })
}
