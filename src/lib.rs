// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! QubitOS Gate Set Tomography (GST)
//!
//! This crate estimates a self-consistent gate-set model (state
//! preparations, gates, measurements) from outcome counts of long gate
//! sequences, using iterative long-sequence GST.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Iterative driver               │
//! │   (chi2 fits, final logL, robust pass)   │
//! ├──────────────────┬──────────────────────┤
//! │   Objectives     │  Levenberg-Marquardt │
//! │  (chi2, logL)    │      solver          │
//! ├──────────────────┴──────────────────────┤
//! │     Evaluation trees (rayon chunks)      │
//! ├────────────────┬────────────────────────┤
//! │  Model         │   Gauge optimization   │
//! │ (policies)     │                        │
//! └────────────────┴────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`model`]: Parameterized gate sets and gauge groups
//! - [`forward`]: Evaluation trees, bulk probabilities and Jacobians
//! - [`objective`]: Chi-squared and log-likelihood objectives
//! - [`optimize`]: Levenberg-Marquardt solver
//! - [`driver`]: Iterative long-sequence GST
//! - [`gaugeopt`]: Gauge optimization
//! - [`config`]: Configuration management
//! - [`validation`]: Input validation utilities
//! - [`error`]: Error types

pub mod basis;
pub mod circuit;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod forward;
pub mod gaugeopt;
pub mod linalg;
pub mod model;
pub mod objective;
pub mod optimize;
pub mod stdmodels;
pub mod validation;

pub use config::Config;
pub use driver::{IterativeGst, Results};
pub use error::{Error, Result};

#[cfg(test)]
pub mod test_utils;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
