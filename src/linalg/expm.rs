// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Real matrix exponential via scaling-and-squaring with Padé(13) approximation.
//!
//! Implements the algorithm from:
//!   Higham (2005), "The Scaling and Squaring Method for the Matrix
//!   Exponential Revisited", SIAM J. Matrix Anal. Appl. 26(4), 1179.
//!
//! Superoperators in the Pauli-product basis are real, so everything here
//! works on `f64`. The Fréchet derivative is obtained from the block
//! identity exp([[A, E], [0, A]]) = [[exp(A), L(A, E)], [0, exp(A)]]
//! (Mathias 1996).

use ndarray::{s, Array2};

use super::solve;

/// Compute the matrix exponential exp(A) using scaling-and-squaring
/// with Padé(13) approximation.
///
/// # Panics
/// Panics if `a` is not square.
pub fn matrix_exp(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    assert_eq!(n, a.ncols(), "matrix_exp requires a square matrix");

    if n == 0 {
        return Array2::zeros((0, 0));
    }
    if n == 1 {
        let mut result = Array2::zeros((1, 1));
        result[[0, 0]] = a[[0, 0]].exp();
        return result;
    }

    // theta_13 = 5.37 (Higham Table 10.2)
    let norm = matrix_1_norm(a);
    let theta_13: f64 = 5.37;
    let s = if norm > theta_13 {
        (norm / theta_13).log2().ceil() as u32
    } else {
        0
    };

    let a_scaled = a * (1.0 / (1u64 << s) as f64);
    let result = pade13(&a_scaled);
    square_repeatedly(result, s)
}

/// Exponential and Fréchet derivative of exp at `a` in direction `e`.
///
/// Returns `(exp(A), L(A, E))` where `L(A, E) = d/dt exp(A + tE) |_{t=0}`.
pub fn matrix_exp_frechet(a: &Array2<f64>, e: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
    let n = a.nrows();
    assert_eq!(e.dim(), a.dim(), "direction must match matrix shape");

    let mut block = Array2::zeros((2 * n, 2 * n));
    block.slice_mut(s![..n, ..n]).assign(a);
    block.slice_mut(s![..n, n..]).assign(e);
    block.slice_mut(s![n.., n..]).assign(a);

    let exp_block = matrix_exp(&block);
    (
        exp_block.slice(s![..n, ..n]).to_owned(),
        exp_block.slice(s![..n, n..]).to_owned(),
    )
}

/// Padé(13,13) approximation coefficients.
/// From Higham (2005), equation (10.33).
const PADE_COEFFS: [f64; 14] = [
    1.0,
    0.5,
    0.12,
    1.833_333_333_333_333_4e-2,
    1.992_753_623_188_405_8e-3,
    1.630_434_782_608_696e-4,
    1.035_196_687_401_6e-5,
    5.175_983_437_008_01e-7,
    2.043_151_356_652_5e-8,
    6.306_022_705_717_593e-10,
    1.483_770_048_404_14e-11,
    2.529_153_491_597_966e-13,
    2.810_170_546_219_962_4e-15,
    1.544_049_750_670_309e-17,
];

/// Compute Padé(13,13) approximation of exp(A).
fn pade13(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let eye = Array2::<f64>::eye(n);

    let a2 = a.dot(a);
    let a4 = a2.dot(&a2);
    let a6 = a2.dot(&a4);

    // U = A * [A6 (b13 A6 + b11 A4 + b9 A2) + b7 A6 + b5 A4 + b3 A2 + b1 I]
    let w1 = &a6 * PADE_COEFFS[13] + &a4 * PADE_COEFFS[11] + &a2 * PADE_COEFFS[9];
    let w2 = w1.dot(&a6)
        + &a6 * PADE_COEFFS[7]
        + &a4 * PADE_COEFFS[5]
        + &a2 * PADE_COEFFS[3]
        + &eye * PADE_COEFFS[1];
    let u = a.dot(&w2);

    // V = A6 (b12 A6 + b10 A4 + b8 A2) + b6 A6 + b4 A4 + b2 A2 + b0 I
    let v1 = &a6 * PADE_COEFFS[12] + &a4 * PADE_COEFFS[10] + &a2 * PADE_COEFFS[8];
    let v = v1.dot(&a6)
        + &a6 * PADE_COEFFS[6]
        + &a4 * PADE_COEFFS[4]
        + &a2 * PADE_COEFFS[2]
        + &eye * PADE_COEFFS[0];

    // exp(A) ≈ (V - U)^{-1} (V + U)
    let numerator = &v + &u;
    let denominator = &v - &u;
    solve(&denominator, &numerator).unwrap_or_else(|_| taylor(a))
}

/// Truncated Taylor series, used only if the Padé denominator is singular.
fn taylor(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let mut term = Array2::<f64>::eye(n);
    let mut sum = term.clone();
    for k in 1..30 {
        term = term.dot(a) / k as f64;
        sum += &term;
    }
    sum
}

/// Square a matrix s times: M^(2^s)
fn square_repeatedly(mut m: Array2<f64>, s: u32) -> Array2<f64> {
    for _ in 0..s {
        m = m.dot(&m);
    }
    m
}

/// 1-norm of a matrix: max column sum of absolute values.
fn matrix_1_norm(a: &Array2<f64>) -> f64 {
    a.columns()
        .into_iter()
        .map(|col| col.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}
