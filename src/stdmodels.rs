// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Standard single-qubit target model {Gi, Gx(π/2), Gy(π/2)} with its
//! fiducials and germs.

use std::f64::consts::FRAC_PI_2;

use ndarray::Array2;
use num_complex::Complex64;

use crate::circuit::Circuit;
use crate::error::Result;
use crate::model::{Model, Parameterization};

/// Gate labels of the standard model.
pub const GATE_LABELS: [&str; 3] = ["Gi", "Gx", "Gy"];

/// Default preparation label.
pub const PREP_LABEL: &str = "rho0";

/// Default POVM label.
pub const POVM_LABEL: &str = "Mdefault";

/// TP-parameterized target model.
pub fn std1q_xyi() -> Result<Model> {
    std1q_xyi_with(Parameterization::Tp)
}

/// Target model with every component under `policy`.
pub fn std1q_xyi_with(policy: Parameterization) -> Result<Model> {
    let mut model = Model::new(1);
    let basis = model.basis().clone();

    let zero = projector(0);
    let one = projector(1);
    model.add_preparation(PREP_LABEL, basis.vectorize(&zero), policy)?;
    model.add_povm(
        POVM_LABEL,
        vec![
            ("0".to_string(), basis.vectorize(&zero)),
            ("1".to_string(), basis.vectorize(&one)),
        ],
        policy,
    )?;
    model.add_operation("Gi", Array2::eye(basis.dim()), policy)?;
    model.add_operation("Gx", basis.rotation_superop(&[FRAC_PI_2, 0.0, 0.0]), policy)?;
    model.add_operation("Gy", basis.rotation_superop(&[0.0, FRAC_PI_2, 0.0]), policy)?;
    model.set_gauge_group(policy.default_gauge_group());
    Ok(model)
}

/// Standard model plus a Z-basis measurement instrument `Iz` with members
/// `0` and `1`.
pub fn std1q_xyi_with_instrument() -> Result<Model> {
    let mut model = std1q_xyi()?;
    let basis = model.basis().clone();
    let members = (0..2)
        .map(|k| {
            let p = projector(k);
            let superop = basis.superop_from_map(|rho| p.dot(rho).dot(&p));
            (k.to_string(), superop)
        })
        .collect();
    model.add_instrument("Iz", members, Parameterization::Tp)?;
    Ok(model)
}

/// Preparation and measurement fiducials.
pub fn fiducials() -> Vec<Circuit> {
    vec![
        Circuit::empty(),
        Circuit::new(["Gx"]),
        Circuit::new(["Gy"]),
        Circuit::new(["Gx", "Gx"]),
        Circuit::new(["Gx", "Gx", "Gx"]),
        Circuit::new(["Gy", "Gy", "Gy"]),
    ]
}

/// Germs amplifying every gate-set parameter.
pub fn germs() -> Vec<Circuit> {
    [
        "Gi",
        "Gx",
        "Gy",
        "Gx Gy",
        "Gx Gy Gi",
        "Gx Gi Gy",
        "Gx Gi Gi",
        "Gy Gi Gi",
        "Gx Gx Gi Gy",
        "Gx Gy Gy Gi",
        "Gx Gx Gy Gx Gy Gy",
    ]
    .iter()
    .map(|g| Circuit::new(g.split_whitespace()))
    .collect()
}

fn projector(k: usize) -> Array2<Complex64> {
    let mut p = Array2::zeros((2, 2));
    p[[k, k]] = Complex64::new(1.0, 0.0);
    p
}
