// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Iterative long-sequence GST driver.
//!
//! Each iteration fits the current model to a (growing) circuit list under
//! the chi-squared objective, starting from the previous iteration's
//! estimate. The final iteration is then re-fit under the Poisson
//! log-likelihood objective with a fresh optimizer. An optional robust pass
//! down-weights circuits whose log-likelihood contribution is implausibly
//! large and keeps the result only if the fit to the remaining circuits
//! improves.
//!
//! A failing iteration is retried once with relaxed probability clipping;
//! if that also fails the run stops and [`Results`] holds every completed
//! iteration, flagged as incomplete.

use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::Array1;
use serde::Serialize;
use tracing::{info, warn};

use crate::circuit::Circuit;
use crate::config::{Config, GaugeOptConfig, ObjectiveConfig, RobustConfig};
use crate::dataset::DataSet;
use crate::error::{Error, Result, ValidationError};
use crate::forward::{EvalLayout, LayoutOptions};
use crate::gaugeopt::{gauge_optimize, GaugeOptResult};
use crate::model::Model;
use crate::objective::{n_sigma, p_value, Objective, ObjectiveKind};
use crate::optimize::{LevenbergMarquardt, LmResult, OptimizerState};
use crate::validation::{validate_circuit_lists, validate_model};

/// Goodness-of-fit statistics of one fitted iteration.
#[derive(Debug, Clone, Serialize)]
pub struct FitStatistics {
    /// Objective the estimate was fitted under.
    pub objective: ObjectiveKind,
    /// Value of that objective at the estimate.
    pub value: f64,
    pub chi2: f64,
    /// 2·(log L_max − log L).
    pub two_delta_logl: f64,
    /// (circuit, outcome) elements with a nonzero count.
    pub num_data: usize,
    pub num_params: usize,
    /// `num_data − num_params`, the chi-squared expectation of `value`.
    pub dof: f64,
    pub p_value: Option<f64>,
    pub n_sigma: Option<f64>,
}

/// One completed iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub index: usize,
    pub num_circuits: usize,
    pub model: Model,
    pub statistics: FitStatistics,
    pub optimizer_iterations: usize,
    pub state: OptimizerState,
    /// The fit only succeeded with relaxed probability clipping.
    pub relaxed_clipping: bool,
}

/// Whether every iteration completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Incomplete {
        failed_iteration: usize,
        reason: String,
    },
}

/// Outcome of the robust data-scaling pass.
#[derive(Debug, Clone)]
pub struct RobustReport {
    pub threshold_sigma: f64,
    pub flagged: Vec<Circuit>,
    /// 2ΔlogL over unflagged circuits before and after re-fitting.
    pub logl_before: f64,
    pub logl_after: Option<f64>,
    /// Re-fitted model, present only when it improved the fit.
    pub model: Option<Model>,
}

impl RobustReport {
    pub fn accepted(&self) -> bool {
        self.model.is_some()
    }
}

/// Everything produced by [`IterativeGst::run`].
#[derive(Debug, Clone)]
pub struct Results {
    pub iterations: Vec<IterationResult>,
    pub status: RunStatus,
    pub robust: Option<RobustReport>,
    pub warnings: Vec<String>,
    gauge_optimized: BTreeMap<String, GaugeOptResult>,
}

impl Results {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// Per-iteration estimates in order.
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.iterations.iter().map(|it| &it.model)
    }

    /// Robust estimate if accepted, otherwise the last completed iteration.
    pub fn final_model(&self) -> Option<&Model> {
        self.robust
            .as_ref()
            .and_then(|r| r.model.as_ref())
            .or_else(|| self.iterations.last().map(|it| &it.model))
    }

    /// Gauge-optimize the final model towards `target` and store the result
    /// under `label`. The fitted models are left untouched.
    pub fn add_gauge_optimized(
        &mut self,
        label: &str,
        target: &Model,
        config: &GaugeOptConfig,
    ) -> Result<&GaugeOptResult> {
        let model = self.final_model().ok_or_else(|| ValidationError::Field {
            field: "results".into(),
            message: "no completed iteration to gauge-optimize".into(),
        })?;
        let result = gauge_optimize(model, target, config)?;
        self.gauge_optimized.insert(label.to_string(), result);
        Ok(&self.gauge_optimized[label])
    }

    pub fn gauge_optimized(&self, label: &str) -> Option<&GaugeOptResult> {
        self.gauge_optimized.get(label)
    }

    /// Serializable digest of the run.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            status: self.status.clone(),
            iterations: self
                .iterations
                .iter()
                .map(|it| IterationSummary {
                    index: it.index,
                    num_circuits: it.num_circuits,
                    statistics: it.statistics.clone(),
                    optimizer_iterations: it.optimizer_iterations,
                    state: it.state,
                    relaxed_clipping: it.relaxed_clipping,
                })
                .collect(),
            robust: self.robust.as_ref().map(|r| RobustSummary {
                threshold_sigma: r.threshold_sigma,
                flagged: r.flagged.iter().map(ToString::to_string).collect(),
                accepted: r.accepted(),
                logl_before: r.logl_before,
                logl_after: r.logl_after,
            }),
            gauge_optimized: self
                .gauge_optimized
                .iter()
                .map(|(label, g)| {
                    (
                        label.clone(),
                        GaugeSummary {
                            initial_value: g.initial_value,
                            final_value: g.final_value,
                            iterations: g.iterations,
                        },
                    )
                })
                .collect(),
            warnings: self.warnings.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub status: RunStatus,
    pub iterations: Vec<IterationSummary>,
    pub robust: Option<RobustSummary>,
    pub gauge_optimized: BTreeMap<String, GaugeSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    pub index: usize,
    pub num_circuits: usize,
    pub statistics: FitStatistics,
    pub optimizer_iterations: usize,
    pub state: OptimizerState,
    pub relaxed_clipping: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RobustSummary {
    pub threshold_sigma: f64,
    pub flagged: Vec<String>,
    pub accepted: bool,
    pub logl_before: f64,
    pub logl_after: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GaugeSummary {
    pub initial_value: f64,
    pub final_value: f64,
    pub iterations: usize,
}

/// A single optimizer run.
struct Fit {
    lm: LmResult,
    relaxed: bool,
    /// Set when the log-likelihood stage failed and the chi² fit was kept.
    logl_failure: Option<String>,
}

impl Fit {
    fn new(lm: LmResult, relaxed: bool) -> Self {
        Self {
            lm,
            relaxed,
            logl_failure: None,
        }
    }
}

/// Iterative MLGST driver.
#[derive(Debug, Clone)]
pub struct IterativeGst {
    config: Config,
}

impl IterativeGst {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fit `initial_model` to `dataset` over the nested circuit `lists`.
    ///
    /// Returns `Err` only for input errors (dimension, gauge, validation);
    /// optimizer failures and budget overruns end the run early with an
    /// incomplete [`Results`].
    pub fn run(&self, dataset: &DataSet, initial_model: &Model, lists: &[Vec<Circuit>]) -> Result<Results> {
        let limits = &self.config.limits;
        validate_model(initial_model, limits)?;
        validate_circuit_lists(dataset, lists, limits)?;

        let driver = &self.config.driver;
        let started = Instant::now();
        let mut model = initial_model.clone();
        let mut results = Results {
            iterations: Vec::with_capacity(lists.len()),
            status: RunStatus::Complete,
            robust: None,
            warnings: Vec::new(),
            gauge_optimized: BTreeMap::new(),
        };

        info!(
            num_iterations = lists.len(),
            num_params = model.num_params(),
            "starting iterative GST"
        );

        for (index, circuits) in lists.iter().enumerate() {
            if let Some(limit) = driver.time_limit_sec {
                let elapsed = started.elapsed().as_secs_f64();
                if index > 0 && elapsed > limit {
                    let reason = format!("time limit of {:.1}s exceeded after {:.1}s", limit, elapsed);
                    stop(&mut results, index, reason);
                    break;
                }
            }

            let options = LayoutOptions {
                num_chunks: driver.num_chunks,
                max_cache_size: driver.max_cache_size,
            };
            let layout = match EvalLayout::new(&model, circuits, &options) {
                Ok(layout) => layout,
                Err(e @ Error::UnsupportedLength { .. }) => {
                    stop(&mut results, index, e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(limit) = driver.memory_limit_bytes {
                let block = driver.param_block_size.unwrap_or(model.num_params());
                let estimate = layout.estimate_memory_bytes(model.dim(), model.num_params(), block);
                if estimate > limit {
                    let reason = format!(
                        "estimated memory {} bytes exceeds limit of {} bytes",
                        estimate, limit
                    );
                    stop(&mut results, index, reason);
                    break;
                }
            }

            let is_final = index + 1 == lists.len();
            match self.fit_iteration(&model, &layout, dataset, is_final) {
                Ok((kind, fit)) => {
                    let statistics = self.statistics(&model, &layout, dataset, &fit.lm.x, kind)?;
                    model.from_vector(&fit.lm.x.to_vec())?;
                    info!(
                        iteration = index,
                        num_circuits = circuits.len(),
                        objective = ?kind,
                        value = statistics.value,
                        p_value = ?statistics.p_value,
                        optimizer_iterations = fit.lm.iterations,
                        "iteration complete"
                    );
                    if fit.lm.state == OptimizerState::MaxIterationsReached {
                        results.warnings.push(format!(
                            "iteration {} stopped at the optimizer iteration cap",
                            index
                        ));
                    }
                    if let OptimizerState::Stalled(reason) = fit.lm.state {
                        results.warnings.push(format!(
                            "iteration {} stopped early, optimizer stalled ({:?})",
                            index, reason
                        ));
                    }
                    if let Some(reason) = &fit.logl_failure {
                        results.warnings.push(format!(
                            "iteration {}: log-likelihood fit failed ({}); chi-squared estimate kept",
                            index, reason
                        ));
                    }
                    results.iterations.push(IterationResult {
                        index,
                        num_circuits: circuits.len(),
                        model: model.clone(),
                        statistics,
                        optimizer_iterations: fit.lm.iterations,
                        state: fit.lm.state,
                        relaxed_clipping: fit.relaxed,
                    });
                }
                Err(e) if e.is_retryable() => {
                    stop(&mut results, index, e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let robust_input = match (&driver.robust, lists.last()) {
            (Some(robust), Some(circuits)) if results.is_complete() => Some((robust, circuits)),
            _ => None,
        };
        if let Some((robust, circuits)) = robust_input {
            let options = LayoutOptions {
                num_chunks: driver.num_chunks,
                max_cache_size: driver.max_cache_size,
            };
            let layout = EvalLayout::new(&model, circuits, &options)?;
            let report = self.robust_pass(&model, &layout, dataset, robust)?;
            if !report.flagged.is_empty() && !report.accepted() {
                let message = format!(
                    "robust data scaling flagged {} circuits but did not improve the fit; discarded",
                    report.flagged.len()
                );
                warn!(flagged = report.flagged.len(), "{}", message);
                results.warnings.push(message);
            }
            results.robust = Some(report);
        }

        info!(
            complete = results.is_complete(),
            iterations = results.iterations.len(),
            elapsed_sec = started.elapsed().as_secs_f64(),
            "iterative GST finished"
        );
        Ok(results)
    }

    fn objective<'a>(
        &self,
        kind: ObjectiveKind,
        model: &Model,
        layout: &'a EvalLayout,
        dataset: &DataSet,
        clip: &ObjectiveConfig,
    ) -> Result<Objective<'a>> {
        Ok(Objective::new(kind, model, layout, dataset, clip)?
            .with_param_block_size(self.config.driver.param_block_size))
    }

    /// Minimize `objective` from `x0`, retrying once with relaxed clipping.
    fn fit(
        &self,
        kind: ObjectiveKind,
        model: &Model,
        layout: &EvalLayout,
        dataset: &DataSet,
        x0: &Array1<f64>,
    ) -> Result<Fit> {
        let solver = LevenbergMarquardt::new(self.config.optimizer.clone());
        let clip = &self.config.objective;
        let objective = self.objective(kind, model, layout, dataset, clip)?;
        match solver.minimize(&objective, x0).and_then(require_progress) {
            Ok(lm) => Ok(Fit::new(lm, false)),
            Err(e) if e.is_retryable() => {
                warn!(objective = ?kind, error = %e, "retrying with relaxed probability clipping");
                let relaxed = self.objective(kind, model, layout, dataset, &clip.relaxed())?;
                let lm = require_progress(solver.minimize(&relaxed, x0)?)?;
                Ok(Fit::new(lm, true))
            }
            Err(e) => Err(e),
        }
    }

    fn fit_iteration(
        &self,
        model: &Model,
        layout: &EvalLayout,
        dataset: &DataSet,
        is_final: bool,
    ) -> Result<(ObjectiveKind, Fit)> {
        let x0 = model.to_vector();
        let chi2 = self.fit(ObjectiveKind::ChiSquared, model, layout, dataset, &x0)?;
        if !(is_final && self.config.driver.use_logl_final) {
            return Ok((ObjectiveKind::ChiSquared, chi2));
        }

        info!(chi2 = chi2.lm.cost, "switching to log-likelihood objective");
        let logl = self.fit(ObjectiveKind::LogLikelihood, model, layout, dataset, &chi2.lm.x);
        prefer_logl(chi2, logl)
    }

    fn statistics(
        &self,
        model: &Model,
        layout: &EvalLayout,
        dataset: &DataSet,
        x: &Array1<f64>,
        kind: ObjectiveKind,
    ) -> Result<FitStatistics> {
        let clip = &self.config.objective;
        let chi2_objective = Objective::new(ObjectiveKind::ChiSquared, model, layout, dataset, clip)?;
        let logl_objective = chi2_objective.with_kind(ObjectiveKind::LogLikelihood);
        let chi2 = chi2_objective.value(x)?;
        let two_delta_logl = logl_objective.value(x)?;
        let num_data = chi2_objective.num_data();
        let num_params = model.num_params();
        let dof = num_data as f64 - num_params as f64;
        let value = match kind {
            ObjectiveKind::ChiSquared => chi2,
            ObjectiveKind::LogLikelihood => two_delta_logl,
        };
        Ok(FitStatistics {
            objective: kind,
            value,
            chi2,
            two_delta_logl,
            num_data,
            num_params,
            dof,
            p_value: p_value(value, dof),
            n_sigma: n_sigma(value, dof),
        })
    }

    /// Flag circuits whose log-likelihood contribution exceeds its
    /// chi-squared expectation by more than `threshold_sigma`, shrink their
    /// counts to sit at the threshold and re-fit once.
    fn robust_pass(
        &self,
        model: &Model,
        layout: &EvalLayout,
        dataset: &DataSet,
        robust: &RobustConfig,
    ) -> Result<RobustReport> {
        let x = model.to_vector();
        let objective = self.objective(
            ObjectiveKind::LogLikelihood,
            model,
            layout,
            dataset,
            &self.config.objective,
        )?;
        let contributions = objective.circuit_contributions(&x)?;

        let mut scales = vec![1.0; contributions.len()];
        let mut flagged = Vec::new();
        for (ci, &c) in contributions.iter().enumerate() {
            let k = layout.element_range(ci).len().saturating_sub(1).max(1) as f64;
            let z = (c - k) / (2.0 * k).sqrt();
            if z > robust.threshold_sigma {
                let allowed = k + robust.threshold_sigma * (2.0 * k).sqrt();
                scales[ci] = allowed / c;
                flagged.push(ci);
            }
        }

        let unflagged_logl = |values: &[f64]| -> f64 {
            values
                .iter()
                .enumerate()
                .filter(|(ci, _)| !flagged.contains(ci))
                .map(|(_, v)| v)
                .sum()
        };
        let logl_before = unflagged_logl(&contributions);
        let flagged_circuits: Vec<Circuit> =
            flagged.iter().map(|&ci| layout.circuits()[ci].clone()).collect();

        let mut report = RobustReport {
            threshold_sigma: robust.threshold_sigma,
            flagged: flagged_circuits,
            logl_before,
            logl_after: None,
            model: None,
        };
        if flagged.is_empty() {
            info!("robust data scaling found no outlying circuits");
            return Ok(report);
        }

        info!(flagged = flagged.len(), "re-fitting with robust data scaling");
        let scaled = objective.with_count_scaling(&scales)?;
        let solver = LevenbergMarquardt::new(self.config.optimizer.clone());
        let refit = match solver.minimize(&scaled, &x) {
            Ok(r) => r,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "robust re-fit failed");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let logl_after = unflagged_logl(&objective.circuit_contributions(&refit.x)?);
        report.logl_after = Some(logl_after);
        if logl_after < logl_before {
            report.model = Some(objective.model_at(&refit.x)?);
            info!(logl_before, logl_after, "robust data scaling accepted");
        }
        Ok(report)
    }
}

/// A stalled fit that never left its starting point is a failure; one that
/// made progress keeps its best iterate.
fn require_progress(lm: LmResult) -> Result<LmResult> {
    match lm.stall_failure() {
        Some(failure) if !lm.improved() => Err(failure.into()),
        _ => Ok(lm),
    }
}

/// Final-iteration outcome: the log-likelihood fit when it succeeded, the
/// chi² fit when it failed with a retryable error.
fn prefer_logl(chi2: Fit, logl: Result<Fit>) -> Result<(ObjectiveKind, Fit)> {
    match logl {
        Ok(logl) => {
            let relaxed = chi2.relaxed || logl.relaxed;
            Ok((ObjectiveKind::LogLikelihood, Fit::new(logl.lm, relaxed)))
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "log-likelihood fit failed; keeping the chi-squared estimate");
            Ok((
                ObjectiveKind::ChiSquared,
                Fit {
                    logl_failure: Some(e.to_string()),
                    ..chi2
                },
            ))
        }
        Err(e) => Err(e),
    }
}

fn stop(results: &mut Results, index: usize, reason: String) {
    warn!(iteration = index, reason = %reason, "stopping run early");
    results.status = RunStatus::Incomplete {
        failed_iteration: index,
        reason,
    };
}
