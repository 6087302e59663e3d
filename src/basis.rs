// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Normalized Pauli-product basis for vectorized density matrices.
//!
//! Density matrices ρ (d × d) are represented by the real vector
//! r_k = Tr(B_k ρ) where B_k = P_k / √d runs over tensor products of
//! {I, X, Y, Z}. Superoperators become real d² × d² matrices
//! M_ab = Tr(B_a Φ(B_b)). The Lindblad generators used by the CPTP
//! parameterization are built here as well:
//!
//!   L(ρ) = -i[H, ρ] + Σ_ij C_ij (B_i ρ B_j − ½{B_j B_i, ρ})
//!
//! Ref: Breuer & Petruccione, "The Theory of Open Quantum Systems" (2002), Ch. 3.

use std::sync::OnceLock;

use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::linalg::{kron, matrix_exp};

const PAULI_LABELS: [&str; 4] = ["I", "X", "Y", "Z"];

/// Normalized Pauli-product basis for `num_qubits` qubits.
#[derive(Debug)]
pub struct Basis {
    num_qubits: usize,
    hilbert_dim: usize,
    labels: Vec<String>,
    elements: Vec<Array2<Complex64>>,
    generators: OnceLock<LindbladGenerators>,
}

impl Basis {
    /// Build the basis {P_k / √d} over all Pauli products.
    pub fn pauli_product(num_qubits: usize) -> Self {
        let single = single_qubit_paulis();
        let mut labels = vec![String::new()];
        let mut elements = vec![Array2::from_elem((1, 1), Complex64::new(1.0, 0.0))];
        for _ in 0..num_qubits {
            let mut next_labels = Vec::with_capacity(labels.len() * 4);
            let mut next_elements = Vec::with_capacity(elements.len() * 4);
            for (label, element) in labels.iter().zip(&elements) {
                for (k, pauli) in single.iter().enumerate() {
                    next_labels.push(format!("{}{}", label, PAULI_LABELS[k]));
                    next_elements.push(kron(element, pauli));
                }
            }
            labels = next_labels;
            elements = next_elements;
        }

        let hilbert_dim = 1usize << num_qubits;
        let norm = Complex64::new(1.0 / (hilbert_dim as f64).sqrt(), 0.0);
        let elements = elements.into_iter().map(|e| e * norm).collect();

        Self {
            num_qubits,
            hilbert_dim,
            labels,
            elements,
            generators: OnceLock::new(),
        }
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    /// Hilbert-space dimension d.
    pub fn hilbert_dim(&self) -> usize {
        self.hilbert_dim
    }

    /// Superoperator dimension d².
    pub fn dim(&self) -> usize {
        self.elements.len()
    }

    /// Pauli-product labels ("I", "X", …, or "IX", "ZZ", … for two qubits).
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Normalized basis element B_k.
    pub fn element(&self, k: usize) -> &Array2<Complex64> {
        &self.elements[k]
    }

    /// r_k = Re Tr(B_k ρ).
    pub fn vectorize(&self, rho: &Array2<Complex64>) -> Array1<f64> {
        Array1::from_iter(self.elements.iter().map(|b| trace_product(b, rho).re))
    }

    /// ρ = Σ_k r_k B_k.
    pub fn devectorize(&self, v: &Array1<f64>) -> Array2<Complex64> {
        let d = self.hilbert_dim;
        let mut rho = Array2::zeros((d, d));
        for (b, &coeff) in self.elements.iter().zip(v.iter()) {
            if coeff != 0.0 {
                rho.scaled_add(Complex64::new(coeff, 0.0), b);
            }
        }
        rho
    }

    /// Vectorized identity operator [√d, 0, …, 0].
    pub fn identity_vector(&self) -> Array1<f64> {
        self.vectorize(&Array2::eye(self.hilbert_dim))
    }

    /// Real superoperator of a Hermiticity-preserving linear map.
    pub fn superop_from_map<F>(&self, map: F) -> Array2<f64>
    where
        F: Fn(&Array2<Complex64>) -> Array2<Complex64>,
    {
        self.complex_superop_from_map(map).mapv(|z| z.re)
    }

    /// Complex superoperator M_ab = Tr(B_a Φ(B_b)) of an arbitrary linear map.
    pub fn complex_superop_from_map<F>(&self, map: F) -> Array2<Complex64>
    where
        F: Fn(&Array2<Complex64>) -> Array2<Complex64>,
    {
        let n = self.dim();
        let mut m = Array2::zeros((n, n));
        for b in 0..n {
            let image = map(&self.elements[b]);
            for a in 0..n {
                m[[a, b]] = trace_product(&self.elements[a], &image);
            }
        }
        m
    }

    /// Superoperator of ρ ↦ U ρ U†.
    pub fn unitary_superop(&self, u: &Array2<Complex64>) -> Array2<f64> {
        let u_dag = u.t().mapv(|z| z.conj());
        self.superop_from_map(|b| u.dot(b).dot(&u_dag))
    }

    /// Choi matrix J = (1/d) Σ_ab M_ab B_a ⊗ conj(B_b), trace-one for TP maps.
    pub fn choi_matrix(&self, m: &Array2<f64>) -> Array2<Complex64> {
        let d = self.hilbert_dim;
        let n = self.dim();
        let mut choi = Array2::<Complex64>::zeros((d * d, d * d));
        let conj: Vec<Array2<Complex64>> =
            self.elements.iter().map(|b| b.mapv(|z| z.conj())).collect();
        for a in 0..n {
            for b in 0..n {
                let coeff = m[[a, b]];
                if coeff == 0.0 {
                    continue;
                }
                choi.scaled_add(
                    Complex64::new(coeff / d as f64, 0.0),
                    &kron(&self.elements[a], &conj[b]),
                );
            }
        }
        choi
    }

    /// Generator of ρ ↦ -i[B_k, ρ] (real in this basis).
    pub fn hamiltonian_generator(&self, k: usize) -> Array2<f64> {
        let bk = &self.elements[k];
        let minus_i = Complex64::new(0.0, -1.0);
        self.superop_from_map(|rho| (bk.dot(rho) - rho.dot(bk)) * minus_i)
    }

    /// Superoperator of the rotation exp(-i·½ Σ_k θ_k P_k), k over non-identity
    /// Pauli products (unnormalized, so a single-qubit angle θ is a rotation by θ).
    pub fn rotation_superop(&self, angles: &[f64]) -> Array2<f64> {
        let n = self.dim();
        let sqrt_d = (self.hilbert_dim as f64).sqrt();
        let mut generator = Array2::<f64>::zeros((n, n));
        for (k, &theta) in angles.iter().enumerate() {
            if theta != 0.0 {
                generator.scaled_add(0.5 * theta * sqrt_d, &self.hamiltonian_generator(k + 1));
            }
        }
        matrix_exp(&generator)
    }

    /// Precomputed Lindblad generators, built on first use.
    pub fn lindblad_generators(&self) -> &LindbladGenerators {
        self.generators.get_or_init(|| LindbladGenerators::new(self))
    }
}

/// Hamiltonian and dissipative Lindblad generators over the non-identity
/// basis elements.
#[derive(Debug)]
pub struct LindbladGenerators {
    hamiltonian: Vec<Array2<f64>>,
    other: Vec<Vec<Array2<Complex64>>>,
}

impl LindbladGenerators {
    fn new(basis: &Basis) -> Self {
        let n = basis.dim();
        let hamiltonian = (1..n).map(|k| basis.hamiltonian_generator(k)).collect();

        let half = Complex64::new(0.5, 0.0);
        let mut other = Vec::with_capacity(n - 1);
        for i in 1..n {
            let mut row = Vec::with_capacity(n - 1);
            for j in 1..n {
                let bi = basis.element(i);
                let bj = basis.element(j);
                let bj_bi = bj.dot(bi);
                row.push(basis.complex_superop_from_map(|rho| {
                    bi.dot(rho).dot(bj) - (bj_bi.dot(rho) + rho.dot(&bj_bi)) * half
                }));
            }
            other.push(row);
        }
        Self { hamiltonian, other }
    }

    /// Number of non-identity basis elements (d² − 1).
    pub fn size(&self) -> usize {
        self.hamiltonian.len()
    }

    /// Generator of -i[B_{k+1}, ·].
    pub fn hamiltonian(&self, k: usize) -> &Array2<f64> {
        &self.hamiltonian[k]
    }

    /// Σ_k h_k · H_k.
    pub fn hamiltonian_sum(&self, h: &Array1<f64>) -> Array2<f64> {
        let n = self.hamiltonian.first().map(|m| m.nrows()).unwrap_or(0);
        let mut out = Array2::zeros((n, n));
        for (gen, &coeff) in self.hamiltonian.iter().zip(h.iter()) {
            if coeff != 0.0 {
                out.scaled_add(coeff, gen);
            }
        }
        out
    }

    /// Re Σ_ij C_ij O_ij; real whenever C is Hermitian.
    pub fn dissipator_sum(&self, c: &Array2<Complex64>) -> Array2<f64> {
        let n = self.hamiltonian.first().map(|m| m.nrows()).unwrap_or(0);
        let mut out = Array2::<Complex64>::zeros((n, n));
        for (i, row) in self.other.iter().enumerate() {
            for (j, gen) in row.iter().enumerate() {
                let cij = c[[i, j]];
                if cij != Complex64::new(0.0, 0.0) {
                    out.scaled_add(cij, gen);
                }
            }
        }
        out.mapv(|z| z.re)
    }
}

fn single_qubit_paulis() -> [Array2<Complex64>; 4] {
    let o = Complex64::new(0.0, 0.0);
    let l = Complex64::new(1.0, 0.0);
    let i = Complex64::new(0.0, 1.0);
    [
        ndarray::array![[l, o], [o, l]],
        ndarray::array![[o, l], [l, o]],
        ndarray::array![[o, -i], [i, o]],
        ndarray::array![[l, o], [o, -l]],
    ]
}

/// Tr(A·B) without forming the product.
fn trace_product(a: &Array2<Complex64>, b: &Array2<Complex64>) -> Complex64 {
    let n = a.nrows();
    let mut tr = Complex64::new(0.0, 0.0);
    for i in 0..n {
        for k in 0..n {
            tr += a[[i, k]] * b[[k, i]];
        }
    }
    tr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::hermitian_eigenvalues;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

    #[test]
    fn test_single_qubit_basis_is_orthonormal() {
        let basis = Basis::pauli_product(1);
        assert_eq!(basis.dim(), 4);
        assert_eq!(basis.labels(), &["I", "X", "Y", "Z"]);
        for a in 0..4 {
            for b in 0..4 {
                let tr = trace_product(basis.element(a), basis.element(b));
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(tr.re, expected, epsilon = 1e-14);
                assert_abs_diff_eq!(tr.im, 0.0, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_two_qubit_labels() {
        let basis = Basis::pauli_product(2);
        assert_eq!(basis.dim(), 16);
        assert_eq!(basis.labels()[0], "II");
        assert_eq!(basis.labels()[15], "ZZ");
    }

    #[test]
    fn test_ground_state_vector() {
        let basis = Basis::pauli_product(1);
        let mut rho = Array2::zeros((2, 2));
        rho[[0, 0]] = Complex64::new(1.0, 0.0);
        let v = basis.vectorize(&rho);
        assert_abs_diff_eq!(v[0], FRAC_1_SQRT_2, epsilon = 1e-14);
        assert_abs_diff_eq!(v[1], 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(v[3], FRAC_1_SQRT_2, epsilon = 1e-14);

        let back = basis.devectorize(&v);
        assert_abs_diff_eq!(back[[0, 0]].re, 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(back[[1, 1]].re, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_x_rotation_matches_standard_gate() {
        let basis = Basis::pauli_product(1);
        let gx = basis.rotation_superop(&[FRAC_PI_2, 0.0, 0.0]);
        let expected = ndarray::array![
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, -1.0],
            [0.0, 0.0, 1.0, 0.0]
        ];
        for ((i, j), v) in gx.indexed_iter() {
            assert_abs_diff_eq!(*v, expected[[i, j]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_unitary_superop_agrees_with_rotation() {
        let basis = Basis::pauli_product(1);
        let c = (FRAC_PI_2 / 2.0).cos();
        let s = (FRAC_PI_2 / 2.0).sin();
        let u = ndarray::array![
            [Complex64::new(c, 0.0), Complex64::new(-s, 0.0)],
            [Complex64::new(s, 0.0), Complex64::new(c, 0.0)]
        ];
        let from_u = basis.unitary_superop(&u);
        let from_rot = basis.rotation_superop(&[0.0, FRAC_PI_2, 0.0]);
        for ((i, j), v) in from_u.indexed_iter() {
            assert_abs_diff_eq!(*v, from_rot[[i, j]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_choi_of_identity_is_rank_one() {
        let basis = Basis::pauli_product(1);
        let choi = basis.choi_matrix(&Array2::eye(4));
        let eigs = hermitian_eigenvalues(&choi).unwrap();
        assert_abs_diff_eq!(eigs[3], 1.0, epsilon = 1e-12);
        for e in &eigs[..3] {
            assert_abs_diff_eq!(*e, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_dissipator_is_trace_preserving() {
        let basis = Basis::pauli_product(1);
        let gens = basis.lindblad_generators();
        assert_eq!(gens.size(), 3);
        let mut c = Array2::<Complex64>::zeros((3, 3));
        c[[0, 0]] = Complex64::new(0.2, 0.0);
        c[[1, 2]] = Complex64::new(0.05, 0.1);
        c[[2, 1]] = Complex64::new(0.05, -0.1);
        let l = gens.dissipator_sum(&c);
        for j in 0..4 {
            assert_abs_diff_eq!(l[[0, j]], 0.0, epsilon = 1e-14);
        }
    }
}
