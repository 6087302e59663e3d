// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Parameterized gate-set model.
//!
//! A [`Model`] holds state preparations, POVMs, gates and (optionally)
//! instruments in separate ordered maps, each entry carrying its own
//! parameterization policy. The full parameter vector is laid out as
//! preparations, then POVMs, then gates, then instrument members, each
//! category in label order.
//!
//! # Example
//!
//! ```
//! use qubit_os_gst::stdmodels;
//!
//! let target = stdmodels::std1q_xyi().unwrap();
//! let noisy = target.depolarize(0.1, 0.0).unwrap();
//! let v = noisy.to_vector();
//! assert_eq!(v.len(), noisy.num_params());
//! ```

mod gauge;
mod operation;
mod spam;

pub use gauge::{GaugeElement, GaugeGroup};
pub use operation::{LindbladOperation, Operation, Parameterization};
pub use spam::{CptpState, Povm, SpamVector};

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::basis::Basis;
use crate::circuit::{Circuit, Outcome};
use crate::error::{Error, Result, ValidationError};
use crate::forward;
use crate::linalg::{hermitian_eigenvalues, hermitian_eigh};

/// Choi eigenvalues below this are treated as zero.
const CHOI_EIGEN_TOL: f64 = 1e-12;

/// Separator between an instrument label and a member label in operation
/// keys (`"Iz:0"`).
pub const INSTRUMENT_SEPARATOR: char = ':';

/// A set of operations indexed by classical outcome whose sum is a
/// trace-preserving map.
#[derive(Debug, Clone)]
pub struct Instrument {
    members: Vec<(String, Operation)>,
}

impl Instrument {
    pub fn members(&self) -> impl Iterator<Item = (&str, &Operation)> {
        self.members.iter().map(|(l, op)| (l.as_str(), op))
    }

    pub fn member(&self, label: &str) -> Option<&Operation> {
        self.members.iter().find(|(l, _)| l == label).map(|(_, op)| op)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn num_params(&self) -> usize {
        self.members.iter().map(|(_, op)| op.num_params()).sum()
    }

    /// Σ of member superoperators (trace preserving for a valid instrument).
    pub fn sum_matrix(&self) -> Option<Array2<f64>> {
        let mut iter = self.members.iter();
        let first = iter.next()?.1.matrix().clone();
        Some(iter.fold(first, |acc, (_, op)| acc + op.matrix()))
    }
}

/// Parameter ranges of every component in the model's parameter vector.
#[derive(Debug, Clone, Default)]
pub struct ParamLayout {
    pub preparations: HashMap<String, Range<usize>>,
    pub povms: HashMap<String, Range<usize>>,
    /// Gates and instrument members (keyed `"inst:member"`).
    pub operations: HashMap<String, Range<usize>>,
    pub total: usize,
}

/// A gate set under a fixed basis.
#[derive(Debug, Clone)]
pub struct Model {
    basis: Arc<Basis>,
    preparations: BTreeMap<String, SpamVector>,
    povms: BTreeMap<String, Povm>,
    operations: BTreeMap<String, Operation>,
    instruments: BTreeMap<String, Instrument>,
    gauge_group: GaugeGroup,
}

impl Model {
    /// Empty model on `num_qubits` qubits with the full gauge group.
    pub fn new(num_qubits: usize) -> Self {
        Self::with_basis(Arc::new(Basis::pauli_product(num_qubits)))
    }

    pub fn with_basis(basis: Arc<Basis>) -> Self {
        Self {
            basis,
            preparations: BTreeMap::new(),
            povms: BTreeMap::new(),
            operations: BTreeMap::new(),
            instruments: BTreeMap::new(),
            gauge_group: GaugeGroup::Full,
        }
    }

    pub fn basis(&self) -> &Arc<Basis> {
        &self.basis
    }

    /// Superoperator dimension d².
    pub fn dim(&self) -> usize {
        self.basis.dim()
    }

    pub fn hilbert_dim(&self) -> usize {
        self.basis.hilbert_dim()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    fn check_label_free(&self, label: &str) -> Result<()> {
        if label.is_empty() || label.contains(INSTRUMENT_SEPARATOR) {
            return Err(ValidationError::Field {
                field: "label".into(),
                message: format!(
                    "'{}' must be non-empty and must not contain '{}'",
                    label, INSTRUMENT_SEPARATOR
                ),
            }
            .into());
        }
        if self.preparations.contains_key(label)
            || self.povms.contains_key(label)
            || self.operations.contains_key(label)
            || self.instruments.contains_key(label)
        {
            return Err(ValidationError::Field {
                field: "label".into(),
                message: format!("'{}' is already defined", label),
            }
            .into());
        }
        Ok(())
    }

    pub fn add_preparation(
        &mut self,
        label: &str,
        vector: Array1<f64>,
        policy: Parameterization,
    ) -> Result<()> {
        self.check_label_free(label)?;
        let prep = SpamVector::new(vector, policy, &self.basis)?;
        self.preparations.insert(label.to_string(), prep);
        Ok(())
    }

    pub fn add_povm(
        &mut self,
        label: &str,
        effects: Vec<(String, Array1<f64>)>,
        policy: Parameterization,
    ) -> Result<()> {
        self.check_label_free(label)?;
        let povm = Povm::new(effects, policy, &self.basis)?;
        self.povms.insert(label.to_string(), povm);
        Ok(())
    }

    pub fn add_operation(
        &mut self,
        label: &str,
        matrix: Array2<f64>,
        policy: Parameterization,
    ) -> Result<()> {
        self.check_label_free(label)?;
        let op = Operation::new(matrix, policy, &self.basis)?;
        self.operations.insert(label.to_string(), op);
        Ok(())
    }

    /// Members are fully parameterized unless `policy` is static.
    pub fn add_instrument(
        &mut self,
        label: &str,
        members: Vec<(String, Array2<f64>)>,
        policy: Parameterization,
    ) -> Result<()> {
        self.check_label_free(label)?;
        if members.is_empty() {
            return Err(Error::dimension("instrument members", 1, 0));
        }
        let member_policy = instrument_member_policy(policy);
        let members = members
            .into_iter()
            .map(|(l, m)| Ok((l, Operation::new(m, member_policy, &self.basis)?)))
            .collect::<Result<Vec<_>>>()?;
        self.instruments
            .insert(label.to_string(), Instrument { members });
        Ok(())
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn preparations(&self) -> impl Iterator<Item = (&str, &SpamVector)> {
        self.preparations.iter().map(|(l, p)| (l.as_str(), p))
    }

    pub fn povms(&self) -> impl Iterator<Item = (&str, &Povm)> {
        self.povms.iter().map(|(l, p)| (l.as_str(), p))
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, &Operation)> {
        self.operations.iter().map(|(l, op)| (l.as_str(), op))
    }

    pub fn instruments(&self) -> impl Iterator<Item = (&str, &Instrument)> {
        self.instruments.iter().map(|(l, i)| (l.as_str(), i))
    }

    pub fn preparation(&self, label: &str) -> Option<&SpamVector> {
        self.preparations.get(label)
    }

    pub fn povm(&self, label: &str) -> Option<&Povm> {
        self.povms.get(label)
    }

    pub fn operation(&self, label: &str) -> Option<&Operation> {
        self.operations.get(label)
    }

    pub fn instrument(&self, label: &str) -> Option<&Instrument> {
        self.instruments.get(label)
    }

    /// Gate or instrument member by operation key (`"Gx"` or `"Iz:0"`).
    pub fn resolve_operation(&self, key: &str) -> Option<&Operation> {
        if let Some(op) = self.operations.get(key) {
            return Some(op);
        }
        let (inst, member) = key.split_once(INSTRUMENT_SEPARATOR)?;
        self.instruments.get(inst)?.member(member)
    }

    /// Every gate and instrument member, keyed as in [`Model::resolve_operation`].
    pub fn all_operations(&self) -> Vec<(String, &Operation)> {
        let mut out: Vec<(String, &Operation)> =
            self.operations.iter().map(|(l, op)| (l.clone(), op)).collect();
        for (inst, instrument) in &self.instruments {
            for (member, op) in instrument.members() {
                out.push((instrument_key(inst, member), op));
            }
        }
        out
    }

    pub fn gauge_group(&self) -> GaugeGroup {
        self.gauge_group
    }

    pub fn set_gauge_group(&mut self, group: GaugeGroup) {
        self.gauge_group = group;
    }

    /// Switch every component to `policy` (best-effort projection) and adopt
    /// the policy's default gauge group.
    pub fn set_all_parameterizations(&mut self, policy: Parameterization) -> Result<()> {
        for prep in self.preparations.values_mut() {
            *prep = SpamVector::new(prep.vector().clone(), policy, &self.basis)?;
        }
        for povm in self.povms.values_mut() {
            *povm = povm.with_policy(policy, &self.basis)?;
        }
        for op in self.operations.values_mut() {
            *op = op.with_policy(policy, &self.basis)?;
        }
        let member_policy = instrument_member_policy(policy);
        for instrument in self.instruments.values_mut() {
            for (_, op) in instrument.members.iter_mut() {
                *op = op.with_policy(member_policy, &self.basis)?;
            }
        }
        self.gauge_group = policy.default_gauge_group();
        Ok(())
    }

    // =========================================================================
    // Parameter vector
    // =========================================================================

    pub fn num_params(&self) -> usize {
        self.preparations.values().map(SpamVector::num_params).sum::<usize>()
            + self.povms.values().map(Povm::num_params).sum::<usize>()
            + self.operations.values().map(Operation::num_params).sum::<usize>()
            + self.instruments.values().map(Instrument::num_params).sum::<usize>()
    }

    pub fn param_layout(&self) -> ParamLayout {
        let mut layout = ParamLayout::default();
        let mut offset = 0;
        for (label, prep) in &self.preparations {
            let n = prep.num_params();
            layout.preparations.insert(label.clone(), offset..offset + n);
            offset += n;
        }
        for (label, povm) in &self.povms {
            let n = povm.num_params();
            layout.povms.insert(label.clone(), offset..offset + n);
            offset += n;
        }
        for (label, op) in &self.operations {
            let n = op.num_params();
            layout.operations.insert(label.clone(), offset..offset + n);
            offset += n;
        }
        for (inst, instrument) in &self.instruments {
            for (member, op) in instrument.members() {
                let n = op.num_params();
                layout
                    .operations
                    .insert(instrument_key(inst, member), offset..offset + n);
                offset += n;
            }
        }
        layout.total = offset;
        layout
    }

    pub fn to_vector(&self) -> Array1<f64> {
        let mut v = Vec::with_capacity(self.num_params());
        for prep in self.preparations.values() {
            v.extend(prep.to_vector());
        }
        for povm in self.povms.values() {
            v.extend(povm.to_vector());
        }
        for op in self.operations.values() {
            v.extend(op.to_vector());
        }
        for instrument in self.instruments.values() {
            for (_, op) in &instrument.members {
                v.extend(op.to_vector());
            }
        }
        Array1::from(v)
    }

    /// Load a full parameter vector. Fails with `Dimension` on a length
    /// mismatch, leaving the model untouched.
    pub fn from_vector(&mut self, v: &[f64]) -> Result<()> {
        let expected = self.num_params();
        if v.len() != expected {
            return Err(Error::dimension("model parameter vector", expected, v.len()));
        }
        let mut rest = v;
        let mut next = |n: usize| {
            let current = rest;
            let (head, tail) = current.split_at(n);
            rest = tail;
            head
        };
        for prep in self.preparations.values_mut() {
            prep.from_vector(next(prep.num_params()))?;
        }
        for povm in self.povms.values_mut() {
            povm.from_vector(next(povm.num_params()))?;
        }
        for op in self.operations.values_mut() {
            op.from_vector(next(op.num_params()))?;
        }
        for instrument in self.instruments.values_mut() {
            for (_, op) in instrument.members.iter_mut() {
                op.from_vector(next(op.num_params()))?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Gauge transforms and perturbations
    // =========================================================================

    /// G → S G S⁻¹, ρ → S ρ, E → S⁻ᵀ E. `S` must belong to the model's
    /// gauge group, and to the TP group if any component is TP-constrained.
    pub fn transform(&self, element: &GaugeElement) -> Result<Model> {
        let s = element.matrix();
        if s.nrows() != self.dim() {
            return Err(Error::dimension("gauge matrix", self.dim(), s.nrows()));
        }
        self.gauge_group.check_membership(s)?;
        if self.has_trace_constraints() {
            GaugeGroup::Tp.check_membership(s)?;
        }
        let s_inv = element.inverse();
        let s_inv_t = s_inv.t();

        let mut out = self.clone();
        for prep in out.preparations.values_mut() {
            let v = s.dot(prep.vector());
            prep.set_vector(v)?;
        }
        for povm in out.povms.values_mut() {
            let effects = (0..povm.len()).map(|k| s_inv_t.dot(povm.effect(k))).collect();
            povm.set_effects(effects)?;
        }
        for op in out.operations.values_mut() {
            let m = s.dot(op.matrix()).dot(s_inv);
            op.set_matrix(m)?;
        }
        for instrument in out.instruments.values_mut() {
            for (_, op) in instrument.members.iter_mut() {
                let m = s.dot(op.matrix()).dot(s_inv);
                op.set_matrix(m)?;
            }
        }
        Ok(out)
    }

    /// Convenience wrapper around [`Model::transform`] for a raw matrix.
    pub fn transform_matrix(&self, s: Array2<f64>) -> Result<Model> {
        self.transform(&GaugeElement::new(s)?)
    }

    fn has_trace_constraints(&self) -> bool {
        let constrained = |p: Parameterization| {
            matches!(p, Parameterization::Tp | Parameterization::Cptp)
        };
        self.preparations.values().any(|p| constrained(p.policy()))
            || self.povms.values().any(|p| constrained(p.policy()))
            || self.operations.values().any(|op| constrained(op.policy()))
    }

    /// Copy with every gate followed by a uniform depolarizing channel of
    /// strength `gate_noise`, and every preparation's Bloch part shrunk by
    /// `1 − spam_noise`.
    pub fn depolarize(&self, gate_noise: f64, spam_noise: f64) -> Result<Model> {
        let dim = self.dim();
        let mut d = Array2::<f64>::eye(dim);
        for k in 1..dim {
            d[[k, k]] = 1.0 - gate_noise;
        }
        let mut out = self.clone();
        for op in out.operations.values_mut() {
            let m = d.dot(op.matrix());
            op.set_matrix(m)?;
        }
        if spam_noise != 0.0 {
            for prep in out.preparations.values_mut() {
                let mut v = prep.vector().clone();
                v.iter_mut().skip(1).for_each(|x| *x *= 1.0 - spam_noise);
                prep.set_vector(v)?;
            }
        }
        Ok(out)
    }

    /// Copy with every gate followed by the rotation exp(-i·½ Σ θ_k P_k).
    pub fn rotate(&self, angles: &[f64]) -> Result<Model> {
        let expected = self.dim() - 1;
        if angles.len() != expected {
            return Err(Error::dimension("rotation angles", expected, angles.len()));
        }
        let r = self.basis.rotation_superop(angles);
        let mut out = self.clone();
        for op in out.operations.values_mut() {
            let m = r.dot(op.matrix());
            op.set_matrix(m)?;
        }
        Ok(out)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Outcome probabilities of one circuit.
    pub fn probabilities(&self, circuit: &Circuit) -> Result<BTreeMap<Outcome, f64>> {
        forward::probabilities(self, circuit)
    }

    /// Weighted RMS element difference over gates and SPAM vectors.
    pub fn frobenius_distance(&self, other: &Model, gate_weight: f64, spam_weight: f64) -> Result<f64> {
        let mut total = 0.0;
        let mut count = 0.0;
        for (label, op) in self.all_operations() {
            let theirs = other
                .resolve_operation(&label)
                .ok_or_else(|| Error::UnknownLabel(label.clone()))?;
            total += gate_weight * (op.matrix() - theirs.matrix()).mapv(|x| x * x).sum();
            count += gate_weight * op.matrix().len() as f64;
        }
        for (label, prep) in &self.preparations {
            let theirs = other
                .preparation(label)
                .ok_or_else(|| Error::UnknownLabel(label.clone()))?;
            total += spam_weight * (prep.vector() - theirs.vector()).mapv(|x| x * x).sum();
            count += spam_weight * prep.vector().len() as f64;
        }
        for (label, povm) in &self.povms {
            let theirs = other
                .povm(label)
                .ok_or_else(|| Error::UnknownLabel(label.clone()))?;
            if theirs.len() != povm.len() {
                return Err(Error::dimension(
                    format!("effects of POVM {}", label),
                    povm.len(),
                    theirs.len(),
                ));
            }
            for k in 0..povm.len() {
                total += spam_weight * (povm.effect(k) - theirs.effect(k)).mapv(|x| x * x).sum();
                count += spam_weight * povm.effect(k).len() as f64;
            }
        }
        if count <= 0.0 {
            return Ok(0.0);
        }
        Ok((total / count).sqrt())
    }

    /// Largest Jamiolkowski trace distance between corresponding gates.
    pub fn jtrace_distance(&self, other: &Model) -> Result<f64> {
        let mut worst: f64 = 0.0;
        for (label, op) in self.all_operations() {
            let theirs = other
                .resolve_operation(&label)
                .ok_or_else(|| Error::UnknownLabel(label.clone()))?;
            worst = worst.max(self.jtrace_distance_between(op.matrix(), theirs.matrix())?);
        }
        Ok(worst)
    }

    /// ½ Σ |eig(J(a) − J(b))|.
    pub fn jtrace_distance_between(&self, a: &Array2<f64>, b: &Array2<f64>) -> Result<f64> {
        let diff = self.basis.choi_matrix(&(a - b));
        Ok(0.5 * hermitian_eigenvalues(&diff)?.iter().map(|e| e.abs()).sum::<f64>())
    }

    /// 1 − F(J(a), J(b)), F the Uhlmann fidelity of the two Choi states.
    ///
    /// Reduces to 1 − Tr(aᵀb)/d² when `b` is unitary.
    pub fn entanglement_infidelity_between(&self, a: &Array2<f64>, b: &Array2<f64>) -> Result<f64> {
        // round-off eigenvalues of rank-deficient Choi states would add O(1e-8) under sqrt
        let root = |l: f64| if l > CHOI_EIGEN_TOL { l.sqrt() } else { 0.0 };
        let ja = self.basis.choi_matrix(a);
        let sqrt_jb = hermitian_eigh(&self.basis.choi_matrix(b))?.map(root);
        let inner = sqrt_jb.dot(&ja).dot(&sqrt_jb);
        let root_fidelity: f64 = hermitian_eigenvalues(&inner)?.into_iter().map(root).sum();
        Ok((1.0 - root_fidelity * root_fidelity).max(0.0))
    }

    /// Number of real matrix/vector elements (gates, preparations, effects).
    pub fn num_elements(&self) -> usize {
        let dim = self.dim();
        self.all_operations().len() * dim * dim
            + self.preparations.len() * dim
            + self.povms.values().map(|p| p.len() * dim).sum::<usize>()
    }

    /// Parameters minus the gauge directions that act non-trivially.
    pub fn num_nongauge_params(&self) -> usize {
        let gauge = self.gauge_group.num_effective_params(self.dim());
        self.num_params().saturating_sub(gauge)
    }
}

fn instrument_member_policy(policy: Parameterization) -> Parameterization {
    match policy {
        Parameterization::Static => Parameterization::Static,
        _ => Parameterization::Full,
    }
}

/// Operation key of an instrument member.
pub fn instrument_key(instrument: &str, member: &str) -> String {
    format!("{}{}{}", instrument, INSTRUMENT_SEPARATOR, member)
}
