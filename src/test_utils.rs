// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared test utilities for GST tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::basis::Basis;
use crate::model::{GaugeElement, GaugeGroup, Model};

/// Assert two models agree element-wise within `tol`.
pub fn assert_models_close(actual: &Model, expected: &Model, tol: f64) {
    let a = actual.to_vector();
    let e = expected.to_vector();
    assert_eq!(a.len(), e.len(), "parameter counts differ");
    for (i, (x, y)) in a.iter().zip(e.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol,
            "parameter {} differs: {} vs {} (tol {})",
            i,
            x,
            y,
            tol
        );
    }
    for (label, op) in actual.all_operations() {
        let other = expected
            .resolve_operation(&label)
            .unwrap_or_else(|| panic!("operation {} missing from expected model", label));
        let diff = (op.matrix() - other.matrix()).mapv(f64::abs);
        assert!(
            diff.iter().all(|&d| d <= tol),
            "operation {} differs by up to {}",
            label,
            diff.iter().cloned().fold(0.0, f64::max)
        );
    }
}

/// Random single-qubit TP gauge element near the identity.
pub fn random_tp_gauge(seed: u64, scale: f64) -> GaugeElement {
    let basis = Basis::pauli_product(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let theta: Vec<f64> = (0..GaugeGroup::Tp.num_params(basis.dim()))
        .map(|_| rng.gen_range(-scale..=scale))
        .collect();
    GaugeGroup::Tp
        .element(&theta, &basis)
        .expect("small TP perturbation of the identity is invertible")
}
