// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Input validation for GST runs.

use crate::circuit::Circuit;
use crate::config::ResourceLimits;
use crate::dataset::DataSet;
use crate::error::{Result, ValidationError};
use crate::model::Model;

/// Validate the counts recorded for one circuit.
pub fn validate_counts(circuit: &Circuit, counts: impl Iterator<Item = f64>) -> Result<()> {
    for (i, n) in counts.enumerate() {
        if !n.is_finite() {
            return Err(ValidationError::Field {
                field: "counts".into(),
                message: format!("non-finite count {} at outcome {} of circuit {}", n, i, circuit),
            }
            .into());
        }
        if n < 0.0 {
            return Err(ValidationError::Field {
                field: "counts".into(),
                message: format!("negative count {} at outcome {} of circuit {}", n, i, circuit),
            }
            .into());
        }
    }
    Ok(())
}

/// Validate the per-iteration circuit lists against the data and limits.
pub fn validate_circuit_lists(
    dataset: &DataSet,
    lists: &[Vec<Circuit>],
    limits: &ResourceLimits,
) -> Result<()> {
    if lists.is_empty() {
        return Err(ValidationError::Field {
            field: "circuit_lists".into(),
            message: "at least one iteration is required".into(),
        }
        .into());
    }

    for (i, list) in lists.iter().enumerate() {
        if list.is_empty() {
            return Err(ValidationError::Field {
                field: "circuit_lists".into(),
                message: format!("list {} is empty", i),
            }
            .into());
        }

        if list.len() > limits.max_circuits {
            return Err(ValidationError::ResourceLimit {
                resource: "circuits".into(),
                limit: limits.max_circuits as u64,
                requested: list.len() as u64,
            }
            .into());
        }

        for circuit in list {
            if circuit.len() > limits.max_circuit_depth {
                return Err(ValidationError::ResourceLimit {
                    resource: "circuit_depth".into(),
                    limit: limits.max_circuit_depth as u64,
                    requested: circuit.len() as u64,
                }
                .into());
            }
            if !dataset.contains(circuit) {
                return Err(ValidationError::MissingData {
                    circuit: circuit.to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}

/// Validate a model before fitting.
pub fn validate_model(model: &Model, limits: &ResourceLimits) -> Result<()> {
    if model.hilbert_dim() > limits.max_hilbert_dim {
        return Err(ValidationError::ResourceLimit {
            resource: "hilbert_dim".into(),
            limit: limits.max_hilbert_dim as u64,
            requested: model.hilbert_dim() as u64,
        }
        .into());
    }

    if let Some(i) = model.to_vector().iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::Field {
            field: "model".into(),
            message: format!("parameter {} is not finite", i),
        }
        .into());
    }

    // Static components carry no parameters
    for (label, op) in model.all_operations() {
        if op.matrix().iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::Field {
                field: "model".into(),
                message: format!("operation {} contains a non-finite entry", label),
            }
            .into());
        }
    }
    for (label, prep) in model.preparations() {
        if prep.vector().iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::Field {
                field: "model".into(),
                message: format!("preparation {} contains a non-finite entry", label),
            }
            .into());
        }
    }

    Ok(())
}
