// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration management for GST runs.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (later sources override earlier ones):
//!
//! 1. Built-in defaults
//! 2. gst.yaml file
//! 3. Environment variables (QUBITOS_GST_*)
//! 4. CLI arguments

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Levenberg-Marquardt settings
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Objective function clipping
    #[serde(default)]
    pub objective: ObjectiveConfig,

    /// Iterative driver settings
    #[serde(default)]
    pub driver: DriverConfig,

    /// Gauge optimization settings
    #[serde(default)]
    pub gauge_opt: GaugeOptConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Resource limits
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = config_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                config = serde_yaml::from_str(&content)?;
            }
        } else {
            for path in &["gst.yaml", "gst.yml"] {
                let path = Path::new(path);
                if path.exists() {
                    let content = std::fs::read_to_string(path)?;
                    config = serde_yaml::from_str(&content)?;
                    break;
                }
            }
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("QUBITOS_GST_MAX_ITERATIONS") {
            if let Ok(n) = val.parse() {
                self.optimizer.max_iterations = n;
            }
        }
        if let Ok(val) = env::var("QUBITOS_GST_FTOL") {
            if let Ok(x) = val.parse() {
                self.optimizer.ftol = x;
            }
        }
        if let Ok(val) = env::var("QUBITOS_GST_USE_LOGL_FINAL") {
            self.driver.use_logl_final = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("QUBITOS_GST_ROBUST_THRESHOLD") {
            if let Ok(threshold_sigma) = val.parse() {
                self.driver.robust = Some(RobustConfig { threshold_sigma });
            }
        }
        if let Ok(val) = env::var("QUBITOS_GST_TIME_LIMIT_SEC") {
            if let Ok(t) = val.parse() {
                self.driver.time_limit_sec = Some(t);
            }
        }
        if let Ok(val) = env::var("QUBITOS_GST_NUM_CHUNKS") {
            if let Ok(n) = val.parse() {
                self.driver.num_chunks = n;
            }
        }
        if let Ok(val) = env::var("QUBITOS_GST_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("QUBITOS_GST_LOG_FORMAT") {
            self.logging.format = val;
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.objective.validate()?;
        self.gauge_opt.validate()?;

        if self.driver.num_chunks == 0 {
            return Err(Error::Config("driver.num_chunks must be at least 1".into()));
        }
        if self.driver.param_block_size == Some(0) {
            return Err(Error::Config("driver.param_block_size cannot be 0".into()));
        }
        if let Some(robust) = &self.driver.robust {
            if !(robust.threshold_sigma > 0.0) {
                return Err(Error::Config(
                    "driver.robust.threshold_sigma must be positive".into(),
                ));
            }
        }
        if self.limits.max_hilbert_dim == 0 || self.limits.max_circuits == 0 {
            return Err(Error::Config("resource limits must be positive".into()));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(Error::Config(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }
}

/// Levenberg-Marquardt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Iteration cap
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Relative cost decrease below which the fit has converged
    #[serde(default = "default_ftol")]
    pub ftol: f64,

    /// Relative step size below which the fit has converged
    #[serde(default = "default_xtol")]
    pub xtol: f64,

    /// Gradient infinity-norm below which the fit has converged
    #[serde(default = "default_gtol")]
    pub gtol: f64,

    /// Initial damping relative to the largest diagonal of JᵀJ
    #[serde(default = "default_damping_scale")]
    pub initial_damping_scale: f64,

    /// Consecutive rejected steps before giving up
    #[serde(default = "default_max_rejections")]
    pub max_rejections: usize,

    /// Damping above which the fit is considered divergent
    #[serde(default = "default_max_damping")]
    pub max_damping: f64,

    /// Treat hitting the iteration cap as an optimization failure
    #[serde(default)]
    pub max_iterations_is_failure: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            ftol: default_ftol(),
            xtol: default_xtol(),
            gtol: default_gtol(),
            initial_damping_scale: default_damping_scale(),
            max_rejections: default_max_rejections(),
            max_damping: default_max_damping(),
            max_iterations_is_failure: false,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("optimizer.max_iterations cannot be 0".into()));
        }
        for (name, value) in [
            ("ftol", self.ftol),
            ("xtol", self.xtol),
            ("gtol", self.gtol),
        ] {
            if !(value >= 0.0) {
                return Err(Error::Config(format!(
                    "optimizer.{} must be non-negative",
                    name
                )));
            }
        }
        if !(self.initial_damping_scale > 0.0) || !(self.max_damping > 0.0) {
            return Err(Error::Config("optimizer damping must be positive".into()));
        }
        Ok(())
    }
}

fn default_max_iterations() -> usize {
    100
}

fn default_ftol() -> f64 {
    1e-6
}

fn default_xtol() -> f64 {
    1e-8
}

fn default_gtol() -> f64 {
    1e-6
}

fn default_damping_scale() -> f64 {
    1e-3
}

fn default_max_rejections() -> usize {
    20
}

fn default_max_damping() -> f64 {
    1e12
}

/// Probability clipping used by the objective functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    /// Floor on p in the chi-squared weighting 1/p
    #[serde(default = "default_prob_floor")]
    pub min_prob_clip_for_weighting: f64,

    /// Below this p the log-likelihood is extended quadratically
    #[serde(default = "default_prob_floor")]
    pub min_prob_clip: f64,

    /// Below this p a zero-frequency term becomes a parabola
    #[serde(default = "default_prob_floor")]
    pub radius: f64,

    /// Predicted probabilities are clipped into this interval
    #[serde(default = "default_prob_clip_interval")]
    pub prob_clip_interval: [f64; 2],

    /// Factor applied to the clipping floors on a retry
    #[serde(default = "default_relaxed_clip_factor")]
    pub relaxed_clip_factor: f64,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            min_prob_clip_for_weighting: default_prob_floor(),
            min_prob_clip: default_prob_floor(),
            radius: default_prob_floor(),
            prob_clip_interval: default_prob_clip_interval(),
            relaxed_clip_factor: default_relaxed_clip_factor(),
        }
    }
}

impl ObjectiveConfig {
    /// Copy with every floor multiplied by `relaxed_clip_factor`.
    pub fn relaxed(&self) -> Self {
        let k = self.relaxed_clip_factor;
        Self {
            min_prob_clip_for_weighting: self.min_prob_clip_for_weighting * k,
            min_prob_clip: self.min_prob_clip * k,
            radius: self.radius * k,
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_prob_clip_for_weighting", self.min_prob_clip_for_weighting),
            ("min_prob_clip", self.min_prob_clip),
            ("radius", self.radius),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::Config(format!(
                    "objective.{} must lie in (0, 1), got {}",
                    name, value
                )));
            }
        }
        let [lo, hi] = self.prob_clip_interval;
        if !(lo < hi) {
            return Err(Error::Config(
                "objective.prob_clip_interval must be increasing".into(),
            ));
        }
        if !(self.relaxed_clip_factor >= 1.0) {
            return Err(Error::Config(
                "objective.relaxed_clip_factor must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_prob_floor() -> f64 {
    1e-4
}

fn default_prob_clip_interval() -> [f64; 2] {
    [-1e6, 1e6]
}

fn default_relaxed_clip_factor() -> f64 {
    100.0
}

/// Iterative driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Re-fit the last iteration under the log-likelihood objective
    #[serde(default = "default_true")]
    pub use_logl_final: bool,

    /// Robust data scaling after the final fit
    #[serde(default)]
    pub robust: Option<RobustConfig>,

    /// Wall-clock budget checked between iterations
    #[serde(default)]
    pub time_limit_sec: Option<f64>,

    /// Memory budget for evaluation caches and Jacobians
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,

    /// Cap on simultaneously cached products per tree chunk
    #[serde(default)]
    pub max_cache_size: Option<usize>,

    /// Number of evaluation-tree chunks
    #[serde(default = "default_num_chunks")]
    pub num_chunks: usize,

    /// Parameters per Jacobian block (all at once when unset)
    #[serde(default)]
    pub param_block_size: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            use_logl_final: true,
            robust: None,
            time_limit_sec: None,
            memory_limit_bytes: None,
            max_cache_size: None,
            num_chunks: default_num_chunks(),
            param_block_size: None,
        }
    }
}

/// Outlier detection for robust data scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobustConfig {
    /// Per-circuit z-score above which counts are down-weighted
    #[serde(default = "default_threshold_sigma")]
    pub threshold_sigma: f64,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            threshold_sigma: default_threshold_sigma(),
        }
    }
}

fn default_threshold_sigma() -> f64 {
    3.0
}

fn default_num_chunks() -> usize {
    crate::forward::DEFAULT_NUM_CHUNKS
}

fn default_true() -> bool {
    true
}

/// Distance metric between a fitted and a target gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMetric {
    Frobenius,
    Fidelity,
    TraceDist,
}

/// Distance metric between SPAM vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpamMetric {
    Frobenius,
}

/// Gauge optimization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeOptConfig {
    /// Weight of every gate and instrument member
    #[serde(default = "default_weight")]
    pub gates_weight: f64,

    /// Weight of every preparation and effect
    #[serde(default = "default_weight")]
    pub spam_weight: f64,

    /// Per-label overrides (gate, prep or POVM label)
    #[serde(default)]
    pub item_weights: BTreeMap<String, f64>,

    #[serde(default = "default_gates_metric")]
    pub gates_metric: GateMetric,

    #[serde(default = "default_spam_metric")]
    pub spam_metric: SpamMetric,

    /// Weight of negative Choi eigenvalues
    #[serde(default)]
    pub cp_penalty: f64,

    /// Weight of trace-preservation violations
    #[serde(default)]
    pub tp_penalty: f64,

    /// Weight of SPAM eigenvalues outside the physical range
    #[serde(default)]
    pub spam_penalty: f64,

    #[serde(default = "default_gauge_max_iterations")]
    pub max_iterations: usize,

    /// Relative objective tolerance
    #[serde(default = "default_ftol")]
    pub tol: f64,
}

impl Default for GaugeOptConfig {
    fn default() -> Self {
        Self {
            gates_weight: default_weight(),
            spam_weight: default_weight(),
            item_weights: BTreeMap::new(),
            gates_metric: default_gates_metric(),
            spam_metric: default_spam_metric(),
            cp_penalty: 0.0,
            tp_penalty: 0.0,
            spam_penalty: 0.0,
            max_iterations: default_gauge_max_iterations(),
            tol: default_ftol(),
        }
    }
}

impl GaugeOptConfig {
    /// Weight of the item with `label`, falling back to its category weight.
    pub fn weight(&self, label: &str, is_gate: bool) -> f64 {
        self.item_weights.get(label).copied().unwrap_or(if is_gate {
            self.gates_weight
        } else {
            self.spam_weight
        })
    }

    fn validate(&self) -> Result<()> {
        let weights = [self.gates_weight, self.spam_weight]
            .into_iter()
            .chain(self.item_weights.values().copied());
        for w in weights.chain([self.cp_penalty, self.tp_penalty, self.spam_penalty]) {
            if !(w >= 0.0) || !w.is_finite() {
                return Err(Error::Config(
                    "gauge_opt weights and penalties must be finite and non-negative".into(),
                ));
            }
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("gauge_opt.max_iterations cannot be 0".into()));
        }
        Ok(())
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_gates_metric() -> GateMetric {
    GateMetric::Frobenius
}

fn default_spam_metric() -> SpamMetric {
    SpamMetric::Frobenius
}

fn default_gauge_max_iterations() -> usize {
    200
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum Hilbert space dimension
    #[serde(default = "default_max_hilbert_dim")]
    pub max_hilbert_dim: usize,

    /// Maximum circuits per iteration list
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,

    /// Maximum labels per circuit
    #[serde(default = "default_max_circuit_depth")]
    pub max_circuit_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_hilbert_dim: default_max_hilbert_dim(),
            max_circuits: default_max_circuits(),
            max_circuit_depth: default_max_circuit_depth(),
        }
    }
}

fn default_max_hilbert_dim() -> usize {
    4
}

fn default_max_circuits() -> usize {
    100_000
}

fn default_max_circuit_depth() -> usize {
    10_000
}
