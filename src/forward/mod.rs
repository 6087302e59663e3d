// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Forward simulation: outcome probabilities of many circuits and their
//! analytic derivatives with respect to every model parameter.
//!
//! Circuits are resolved against a model into *expanded circuits* (one per
//! instrument branch) and *elements* (one per (expanded circuit, effect)
//! pair). Expanded circuits are split into contiguous chunks, each with
//! its own [`EvalTree`]; chunks and parameter blocks are evaluated in
//! parallel with rayon and reassembled in index order, so results do not
//! depend on how the work was split.
//!
//! Partial products are stored as a mantissa matrix plus a natural-log
//! scale. Leaves are normalized to Frobenius norm at most one and products
//! are renormalized whenever their entries leave [1e-100, 1e100], so long
//! sequences neither underflow nor overflow.

mod evaltree;

pub use evaltree::{split_ranges, EvalNode, EvalTree};

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use ndarray::{s, Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::circuit::{Circuit, Outcome};
use crate::error::{Error, Result};
use crate::linalg::frobenius_norm;
use crate::model::{instrument_key, Model};

const RESCALE_BELOW: f64 = 1e-100;
const RESCALE_ABOVE: f64 = 1e100;

/// Default chunk count. Fixed so that cache limits and chunk boundaries
/// do not depend on the size of the thread pool.
pub const DEFAULT_NUM_CHUNKS: usize = 4;

/// Parameter step for differencing the Jacobian in [`bulk_hessian`].
pub const HESSIAN_STEP: f64 = 1e-5;

/// How circuits are grouped for evaluation.
#[derive(Debug, Clone)]
pub struct LayoutOptions {
    /// Number of independently evaluated tree chunks.
    pub num_chunks: usize,
    /// Upper bound on simultaneously cached products per chunk.
    pub max_cache_size: Option<usize>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            num_chunks: DEFAULT_NUM_CHUNKS,
            max_cache_size: None,
        }
    }
}

/// One (circuit, outcome) probability slot.
#[derive(Debug, Clone)]
pub struct Element {
    /// Index of the circuit in the layout's circuit list.
    pub circuit: usize,
    pub outcome: Outcome,
    expanded: usize,
    effect: usize,
}

/// A circuit with its preparation and POVM resolved and instruments
/// expanded into one branch.
#[derive(Debug, Clone)]
struct ExpandedCircuit {
    prep: String,
    povm: String,
    ops: Vec<String>,
    first_element: usize,
}

#[derive(Debug, Clone)]
struct Chunk {
    expanded: Range<usize>,
    elements: Range<usize>,
    tree: EvalTree,
}

/// Evaluation plan for a fixed circuit list.
#[derive(Debug, Clone)]
pub struct EvalLayout {
    circuits: Vec<Circuit>,
    expanded: Vec<ExpandedCircuit>,
    elements: Vec<Element>,
    circuit_elements: Vec<Range<usize>>,
    chunks: Vec<Chunk>,
}

impl EvalLayout {
    /// Resolve `circuits` against `model` and build the chunked trees.
    pub fn new(model: &Model, circuits: &[Circuit], options: &LayoutOptions) -> Result<Self> {
        let mut expanded = Vec::new();
        let mut elements = Vec::new();
        let mut circuit_elements = Vec::with_capacity(circuits.len());

        for (ci, circuit) in circuits.iter().enumerate() {
            let start = elements.len();
            for branch in resolve(model, circuit)? {
                let povm = model
                    .povm(&branch.povm)
                    .ok_or_else(|| Error::UnknownLabel(branch.povm.clone()))?;
                let first_element = elements.len();
                for (k, label) in povm.labels().iter().enumerate() {
                    let mut parts = branch.outcome_prefix.clone();
                    parts.push(label.clone());
                    elements.push(Element {
                        circuit: ci,
                        outcome: Outcome::new(parts),
                        expanded: expanded.len(),
                        effect: k,
                    });
                }
                expanded.push(ExpandedCircuit {
                    prep: branch.prep,
                    povm: branch.povm,
                    ops: branch.ops,
                    first_element,
                });
            }
            circuit_elements.push(start..elements.len());
        }

        let mut chunks = Vec::new();
        for range in split_ranges(expanded.len(), options.num_chunks) {
            let sequences: Vec<Vec<String>> =
                expanded[range.clone()].iter().map(|e| e.ops.clone()).collect();
            let tree = EvalTree::build(&sequences, options.max_cache_size)?;
            let first = expanded
                .get(range.start)
                .map(|e| e.first_element)
                .unwrap_or(elements.len());
            let last = expanded
                .get(range.end)
                .map(|e| e.first_element)
                .unwrap_or(elements.len());
            chunks.push(Chunk {
                expanded: range,
                elements: first..last,
                tree,
            });
        }

        debug!(
            num_circuits = circuits.len(),
            num_elements = elements.len(),
            num_chunks = chunks.len(),
            "built evaluation layout"
        );
        Ok(Self {
            circuits: circuits.to_vec(),
            expanded,
            elements,
            circuit_elements,
            chunks,
        })
    }

    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// Element indices belonging to circuit `index`.
    pub fn element_range(&self, index: usize) -> Range<usize> {
        self.circuit_elements[index].clone()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Sum over chunks of the peak number of cached products.
    pub fn cache_size(&self) -> usize {
        self.chunks.iter().map(|c| c.tree.peak_cache_size()).sum()
    }

    /// Rough memory needed to evaluate the Jacobian with `block_size`
    /// parameters per block (bytes).
    pub fn estimate_memory_bytes(&self, dim: usize, num_params: usize, block_size: usize) -> u64 {
        let per_product = (dim * dim * (1 + block_size.min(num_params))) as u64;
        let cache = self.cache_size() as u64 * per_product;
        let jacobian = (self.elements.len() * (1 + num_params)) as u64;
        (cache + jacobian) * std::mem::size_of::<f64>() as u64
    }
}

/// One instrument branch of a resolved circuit.
struct Branch {
    prep: String,
    povm: String,
    ops: Vec<String>,
    outcome_prefix: Vec<String>,
}

fn resolve(model: &Model, circuit: &Circuit) -> Result<Vec<Branch>> {
    let labels = circuit.labels();

    let (prep, rest) = match labels.first() {
        Some(l) if model.preparation(l).is_some() => (l.clone(), &labels[1..]),
        _ => (default_label(model.preparations().map(|(l, _)| l), "preparation", circuit)?, labels),
    };
    let (povm, body) = match rest.last() {
        Some(l) if model.povm(l).is_some() => (l.clone(), &rest[..rest.len() - 1]),
        _ => (default_label(model.povms().map(|(l, _)| l), "POVM", circuit)?, rest),
    };

    let mut branches = vec![(Vec::<String>::new(), Vec::<String>::new())];
    for label in body {
        if model.operation(label).is_some() {
            for (ops, _) in branches.iter_mut() {
                ops.push(label.clone());
            }
        } else if let Some(instrument) = model.instrument(label) {
            let mut next = Vec::with_capacity(branches.len() * instrument.len());
            for (ops, prefix) in &branches {
                for (member, _) in instrument.members() {
                    let mut ops = ops.clone();
                    ops.push(instrument_key(label, member));
                    let mut prefix = prefix.clone();
                    prefix.push(member.to_string());
                    next.push((ops, prefix));
                }
            }
            branches = next;
        } else {
            return Err(Error::UnknownLabel(format!("{} (in circuit {})", label, circuit)));
        }
    }

    Ok(branches
        .into_iter()
        .map(|(ops, outcome_prefix)| Branch {
            prep: prep.clone(),
            povm: povm.clone(),
            ops,
            outcome_prefix,
        })
        .collect())
}

fn default_label<'a>(
    mut labels: impl Iterator<Item = &'a str>,
    kind: &str,
    circuit: &Circuit,
) -> Result<String> {
    match (labels.next(), labels.next()) {
        (Some(only), None) => Ok(only.to_string()),
        _ => Err(Error::UnknownLabel(format!(
            "circuit {} names no {} and the model has no unique default",
            circuit, kind
        ))),
    }
}

// =============================================================================
// Scaled products
// =============================================================================

/// Leaf operation normalized to Frobenius norm ≤ 1.
struct Leaf {
    product: Array2<f64>,
    log_scale: f64,
    deriv: Option<Array3<f64>>,
    params: Range<usize>,
}

#[derive(Clone)]
struct NodeValue {
    product: Array2<f64>,
    log_scale: f64,
    /// Derivative over the current parameter block; `None` when identically zero.
    deriv: Option<Array3<f64>>,
}

fn leaf_table(model: &Model, layout: &EvalLayout, with_deriv: bool) -> Result<HashMap<String, Leaf>> {
    let param_layout = model.param_layout();
    let mut table = HashMap::new();
    for chunk in &layout.chunks {
        for node in chunk.tree.nodes() {
            let EvalNode::Leaf(key) = node else { continue };
            if table.contains_key(key) {
                continue;
            }
            let op = model
                .resolve_operation(key)
                .ok_or_else(|| Error::UnknownLabel(key.clone()))?;
            let scale = frobenius_norm(op.matrix()).max(1.0);
            let deriv = if with_deriv && op.num_params() > 0 {
                Some(op.deriv() / scale)
            } else {
                None
            };
            table.insert(
                key.clone(),
                Leaf {
                    product: op.matrix() / scale,
                    log_scale: scale.ln(),
                    deriv,
                    params: param_layout.operations.get(key).cloned().unwrap_or(0..0),
                },
            );
        }
    }
    Ok(table)
}

fn intersect(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    a.start.max(b.start)..a.end.min(b.end).max(a.start.max(b.start))
}

fn leaf_value(leaf: &Leaf, block: Option<&Range<usize>>, dim: usize) -> NodeValue {
    let deriv = match (block, &leaf.deriv) {
        (Some(block), Some(d)) => {
            let overlap = intersect(&leaf.params, block);
            if overlap.is_empty() {
                None
            } else {
                let mut out = Array3::zeros((block.len(), dim, dim));
                out.slice_mut(s![overlap.start - block.start..overlap.end - block.start, .., ..])
                    .assign(&d.slice(s![
                        overlap.start - leaf.params.start..overlap.end - leaf.params.start,
                        ..,
                        ..
                    ]));
                Some(out)
            }
        }
        _ => None,
    };
    NodeValue {
        product: leaf.product.clone(),
        log_scale: leaf.log_scale,
        deriv,
    }
}

fn multiply(prefix: &NodeValue, suffix: &NodeValue) -> NodeValue {
    let mut product = suffix.product.dot(&prefix.product);
    let mut log_scale = prefix.log_scale + suffix.log_scale;

    let mut deriv = match (&suffix.deriv, &prefix.deriv) {
        (None, None) => None,
        (ds, dp) => {
            let nb = ds.as_ref().or(dp.as_ref()).map_or(0, |d| d.len_of(Axis(0)));
            let dim = product.nrows();
            let mut out = Array3::zeros((nb, dim, dim));
            for k in 0..nb {
                let mut slot = out.index_axis_mut(Axis(0), k);
                if let Some(ds) = ds {
                    slot += &ds.index_axis(Axis(0), k).dot(&prefix.product);
                }
                if let Some(dp) = dp {
                    slot += &suffix.product.dot(&dp.index_axis(Axis(0), k));
                }
            }
            Some(out)
        }
    };

    let max = product.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    if max > 0.0 && !(RESCALE_BELOW..=RESCALE_ABOVE).contains(&max) {
        let norm = frobenius_norm(&product);
        product /= norm;
        if let Some(d) = deriv.as_mut() {
            *d /= norm;
        }
        log_scale += norm.ln();
    }

    NodeValue {
        product,
        log_scale,
        deriv,
    }
}

/// x·e^s without overflowing intermediate factors.
fn unscale(x: f64, log_scale: f64) -> f64 {
    if x == 0.0 || log_scale == 0.0 {
        x * log_scale.exp()
    } else {
        x.signum() * (x.abs().ln() + log_scale).exp()
    }
}

/// Evaluate every node of `tree`, returning the finals in order.
fn eval_tree(
    tree: &EvalTree,
    leaves: &HashMap<String, Leaf>,
    block: Option<&Range<usize>>,
    dim: usize,
) -> Result<Vec<NodeValue>> {
    let nodes = tree.nodes();
    let mut values: Vec<Option<NodeValue>> = vec![None; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let value = match node {
            EvalNode::Identity => NodeValue {
                product: Array2::eye(dim),
                log_scale: 0.0,
                deriv: None,
            },
            EvalNode::Leaf(key) => {
                let leaf = leaves
                    .get(key)
                    .ok_or_else(|| Error::UnknownLabel(key.clone()))?;
                leaf_value(leaf, block, dim)
            }
            EvalNode::Product { prefix, suffix } => {
                let (Some(p), Some(s)) = (values[*prefix].as_ref(), values[*suffix].as_ref())
                else {
                    return Err(Error::UnknownLabel(format!(
                        "evaluation node {} used after release",
                        i
                    )));
                };
                let value = multiply(p, s);
                for child in [*prefix, *suffix] {
                    if tree.releasable(child, i) {
                        values[child] = None;
                    }
                }
                value
            }
        };
        values[i] = Some(value);
    }

    tree.finals()
        .iter()
        .map(|&f| {
            values[f]
                .clone()
                .ok_or_else(|| Error::UnknownLabel(format!("evaluation node {} missing", f)))
        })
        .collect()
}

// =============================================================================
// Bulk evaluation
// =============================================================================

struct ChunkResult {
    probs: Array1<f64>,
    jacobian: Option<Array2<f64>>,
}

fn eval_chunk(
    model: &Model,
    layout: &EvalLayout,
    chunk: &Chunk,
    leaves: &HashMap<String, Leaf>,
    block: Option<&Range<usize>>,
) -> Result<ChunkResult> {
    let dim = model.dim();
    let finals = eval_tree(&chunk.tree, leaves, block, dim)?;
    let param_layout = model.param_layout();
    let n_elements = chunk.elements.len();
    let mut probs = Array1::zeros(n_elements);
    let mut jacobian = block.map(|b| Array2::zeros((n_elements, b.len())));

    for (value, x) in finals.iter().zip(chunk.expanded.clone()) {
        let expanded = &layout.expanded[x];
        let prep = model
            .preparation(&expanded.prep)
            .ok_or_else(|| Error::UnknownLabel(expanded.prep.clone()))?;
        let povm = model
            .povm(&expanded.povm)
            .ok_or_else(|| Error::UnknownLabel(expanded.povm.clone()))?;
        let rho = prep.vector();
        let evolved = value.product.dot(rho);

        for k in 0..povm.len() {
            let row = expanded.first_element + k - chunk.elements.start;
            let effect = povm.effect(k);
            probs[row] = unscale(effect.dot(&evolved), value.log_scale);

            let (Some(block), Some(jac)) = (block, jacobian.as_mut()) else {
                continue;
            };

            if let Some(d) = &value.deriv {
                for p in 0..block.len() {
                    let dv = d.index_axis(Axis(0), p).dot(rho);
                    jac[[row, p]] += unscale(effect.dot(&dv), value.log_scale);
                }
            }

            if let Some(range) = param_layout.preparations.get(&expanded.prep) {
                let overlap = intersect(range, block);
                if !overlap.is_empty() {
                    let drho = prep.deriv();
                    for p in overlap {
                        let dv = value.product.dot(&drho.row(p - range.start));
                        jac[[row, p - block.start]] += unscale(effect.dot(&dv), value.log_scale);
                    }
                }
            }

            if let Some(range) = param_layout.povms.get(&expanded.povm) {
                let overlap = intersect(range, block);
                if !overlap.is_empty() {
                    let de = povm.effect_deriv(k);
                    for p in overlap {
                        let v = de.row(p - range.start).dot(&evolved);
                        jac[[row, p - block.start]] += unscale(v, value.log_scale);
                    }
                }
            }
        }
    }

    Ok(ChunkResult { probs, jacobian })
}

/// Probability of every layout element under `model`.
pub fn bulk_probabilities(model: &Model, layout: &EvalLayout) -> Result<Array1<f64>> {
    let leaves = leaf_table(model, layout, false)?;
    let results = layout
        .chunks
        .par_iter()
        .map(|chunk| eval_chunk(model, layout, chunk, &leaves, None))
        .collect::<Result<Vec<_>>>()?;

    let mut probs = Array1::zeros(layout.num_elements());
    for (chunk, result) in layout.chunks.iter().zip(results) {
        probs
            .slice_mut(s![chunk.elements.clone()])
            .assign(&result.probs);
    }
    Ok(probs)
}

/// Probabilities and their Jacobian (elements × parameters).
///
/// Parameters are processed in blocks of `block_size` (all at once when
/// `None`); (chunk, block) pairs run in parallel.
pub fn bulk_jacobian(
    model: &Model,
    layout: &EvalLayout,
    block_size: Option<usize>,
) -> Result<(Array1<f64>, Array2<f64>)> {
    let num_params = model.num_params();
    let leaves = leaf_table(model, layout, true)?;
    let block_size = block_size.unwrap_or(num_params).max(1);
    let blocks: Vec<Range<usize>> = if num_params == 0 {
        vec![0..0]
    } else {
        (0..num_params)
            .step_by(block_size)
            .map(|start| start..(start + block_size).min(num_params))
            .collect()
    };

    let work: Vec<(usize, usize)> = (0..layout.chunks.len())
        .flat_map(|c| (0..blocks.len()).map(move |b| (c, b)))
        .collect();
    let results = work
        .par_iter()
        .map(|&(c, b)| eval_chunk(model, layout, &layout.chunks[c], &leaves, Some(&blocks[b])))
        .collect::<Result<Vec<_>>>()?;

    let mut probs = Array1::zeros(layout.num_elements());
    let mut jacobian = Array2::zeros((layout.num_elements(), num_params));
    for (&(c, b), result) in work.iter().zip(results) {
        let chunk = &layout.chunks[c];
        if b == 0 {
            probs
                .slice_mut(s![chunk.elements.clone()])
                .assign(&result.probs);
        }
        if let Some(jac) = result.jacobian {
            let block = &blocks[b];
            jacobian
                .slice_mut(s![chunk.elements.clone(), block.clone()])
                .assign(&jac);
        }
    }
    Ok((probs, jacobian))
}

/// Probabilities, Jacobian and Hessian (elements × parameters × parameters).
///
/// The Hessian is a central difference of the analytic Jacobian with step
/// [`HESSIAN_STEP`], symmetrized over the two parameter axes.
pub fn bulk_hessian(
    model: &Model,
    layout: &EvalLayout,
    block_size: Option<usize>,
) -> Result<(Array1<f64>, Array2<f64>, Array3<f64>)> {
    let (probs, jacobian) = bulk_jacobian(model, layout, block_size)?;
    let v = model.to_vector();
    let num_params = v.len();
    let mut hessian = Array3::zeros((layout.num_elements(), num_params, num_params));

    for k in 0..num_params {
        let mut shifted = [model.clone(), model.clone()];
        for (copy, sign) in shifted.iter_mut().zip([1.0, -1.0]) {
            let mut x = v.clone();
            x[k] += sign * HESSIAN_STEP;
            copy.from_vector(&x.to_vec())?;
        }
        let (_, plus) = bulk_jacobian(&shifted[0], layout, block_size)?;
        let (_, minus) = bulk_jacobian(&shifted[1], layout, block_size)?;
        hessian
            .slice_mut(s![.., .., k])
            .assign(&((plus - minus) / (2.0 * HESSIAN_STEP)));
    }

    for e in 0..layout.num_elements() {
        let mut h = hessian.index_axis_mut(Axis(0), e);
        let sym = (&h + &h.t()) / 2.0;
        h.assign(&sym);
    }
    debug!(num_params, num_elements = layout.num_elements(), "computed probability Hessian");
    Ok((probs, jacobian, hessian))
}

/// Outcome probabilities of a single circuit.
pub fn probabilities(model: &Model, circuit: &Circuit) -> Result<BTreeMap<Outcome, f64>> {
    let options = LayoutOptions {
        num_chunks: 1,
        max_cache_size: None,
    };
    let layout = EvalLayout::new(model, std::slice::from_ref(circuit), &options)?;
    let probs = bulk_probabilities(model, &layout)?;
    Ok(layout
        .elements()
        .iter()
        .zip(probs.iter())
        .map(|(e, p)| (e.outcome.clone(), *p))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameterization;
    use crate::stdmodels;
    use approx::assert_abs_diff_eq;

    fn c(labels: &[&str]) -> Circuit {
        Circuit::from(labels)
    }

    fn sample_circuits() -> Vec<Circuit> {
        vec![
            Circuit::empty(),
            c(&["Gx"]),
            c(&["Gx", "Gy"]),
            c(&["Gx", "Gy", "Gx", "Gy"]),
            c(&["Gy", "Gy", "Gi", "Gx"]),
            c(&["Gx", "Gy", "Gx", "Gy", "Gy"]),
        ]
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let model = stdmodels::std1q_xyi().unwrap().depolarize(0.07, 0.03).unwrap();
        let layout = EvalLayout::new(&model, &sample_circuits(), &LayoutOptions::default()).unwrap();
        let probs = bulk_probabilities(&model, &layout).unwrap();
        for ci in 0..layout.circuits().len() {
            let total: f64 = probs.slice(s![layout.element_range(ci)]).sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_chunking_does_not_change_results() {
        let model = stdmodels::std1q_xyi().unwrap().depolarize(0.05, 0.0).unwrap();
        let circuits = sample_circuits();
        let one = LayoutOptions {
            num_chunks: 1,
            max_cache_size: None,
        };
        let many = LayoutOptions {
            num_chunks: 4,
            max_cache_size: None,
        };
        let l1 = EvalLayout::new(&model, &circuits, &one).unwrap();
        let l4 = EvalLayout::new(&model, &circuits, &many).unwrap();
        let (p1, j1) = bulk_jacobian(&model, &l1, None).unwrap();
        let (p4, j4) = bulk_jacobian(&model, &l4, Some(5)).unwrap();
        for (a, b) in p1.iter().zip(p4.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-14);
        }
        for (a, b) in j1.iter().zip(j4.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-14);
        }
    }

    fn check_jacobian_against_finite_differences(model: Model) {
        let circuits = sample_circuits();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let (_, jac) = bulk_jacobian(&model, &layout, None).unwrap();
        let v = model.to_vector();
        let h = 1e-6;
        for k in 0..v.len() {
            let mut plus = model.clone();
            let mut minus = model.clone();
            let mut vp = v.clone();
            let mut vm = v.clone();
            vp[k] += h;
            vm[k] -= h;
            plus.from_vector(vp.as_slice().unwrap()).unwrap();
            minus.from_vector(vm.as_slice().unwrap()).unwrap();
            let pp = bulk_probabilities(&plus, &layout).unwrap();
            let pm = bulk_probabilities(&minus, &layout).unwrap();
            for e in 0..layout.num_elements() {
                let fd = (pp[e] - pm[e]) / (2.0 * h);
                assert_abs_diff_eq!(jac[[e, k]], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_tp_jacobian_matches_finite_differences() {
        let model = stdmodels::std1q_xyi().unwrap().depolarize(0.05, 0.02).unwrap();
        check_jacobian_against_finite_differences(model);
    }

    #[test]
    fn test_cptp_jacobian_matches_finite_differences() {
        let mut model = stdmodels::std1q_xyi().unwrap().depolarize(0.05, 0.02).unwrap();
        model.set_all_parameterizations(Parameterization::Cptp).unwrap();
        check_jacobian_against_finite_differences(model);
    }

    #[test]
    fn test_hessian_matches_second_differences() {
        let model = stdmodels::std1q_xyi().unwrap().depolarize(0.05, 0.02).unwrap();
        let circuits = sample_circuits();
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let (probs, jac, hess) = bulk_hessian(&model, &layout, Some(6)).unwrap();
        let (p0, j0) = bulk_jacobian(&model, &layout, None).unwrap();
        assert_eq!(hess.dim(), (layout.num_elements(), jac.ncols(), jac.ncols()));
        for (a, b) in probs.iter().zip(p0.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-14);
        }
        for (a, b) in jac.iter().zip(j0.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-14);
        }

        let v = model.to_vector();
        let n = v.len();
        let h = 1e-4;
        let eval = |shifts: &[(usize, f64)]| {
            let mut copy = model.clone();
            let mut x = v.clone();
            for &(k, d) in shifts {
                x[k] += d;
            }
            copy.from_vector(x.as_slice().unwrap()).unwrap();
            bulk_probabilities(&copy, &layout).unwrap()
        };
        for (i, j) in [(0, 0), (1, 3), (4, n - 1), (n / 2, n / 3)] {
            let pp = eval(&[(i, h), (j, h)]);
            let pm = eval(&[(i, h), (j, -h)]);
            let mp = eval(&[(i, -h), (j, h)]);
            let mm = eval(&[(i, -h), (j, -h)]);
            for e in 0..layout.num_elements() {
                let fd = (pp[e] - pm[e] - mp[e] + mm[e]) / (4.0 * h * h);
                assert_abs_diff_eq!(hess[[e, i, j]], fd, epsilon = 1e-5);
                assert_abs_diff_eq!(hess[[e, i, j]], hess[[e, j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_long_sequences_are_rescaled() {
        let model = stdmodels::std1q_xyi().unwrap().depolarize(0.01, 0.0).unwrap();
        let long = c(&["Gx"; 4000]);
        let p = model.probabilities(&long).unwrap();
        let total: f64 = p.values().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-8);
        // fully depolarized after thousands of noisy gates
        assert_abs_diff_eq!(p[&Outcome::from("0")], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_unknown_label() {
        let model = stdmodels::std1q_xyi().unwrap();
        let err = model.probabilities(&c(&["Gz"])).unwrap_err();
        assert!(matches!(err, Error::UnknownLabel(_)));
    }

    #[test]
    fn test_explicit_prep_and_povm_labels() {
        let model = stdmodels::std1q_xyi().unwrap();
        let explicit = model
            .probabilities(&c(&["rho0", "Gx", "Mdefault"]))
            .unwrap();
        let implicit = model.probabilities(&c(&["Gx"])).unwrap();
        assert_eq!(explicit.len(), 2);
        for (o, p) in &implicit {
            assert_abs_diff_eq!(*p, explicit[o], epsilon = 1e-14);
        }
    }

    #[test]
    fn test_instrument_expands_outcomes() {
        let model = stdmodels::std1q_xyi_with_instrument().unwrap();
        let p = model.probabilities(&c(&["Gx", "Iz", "Gx"])).unwrap();
        assert_eq!(p.len(), 4);
        let total: f64 = p.values().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p[&Outcome::new(["0", "0"])], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(p[&Outcome::new(["1", "1"])], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_instrument_jacobian_matches_finite_differences() {
        let model = stdmodels::std1q_xyi_with_instrument()
            .unwrap()
            .depolarize(0.02, 0.0)
            .unwrap();
        let circuits = vec![c(&["Gx", "Iz", "Gy"])];
        let layout = EvalLayout::new(&model, &circuits, &LayoutOptions::default()).unwrap();
        let (_, jac) = bulk_jacobian(&model, &layout, Some(7)).unwrap();
        let v = model.to_vector();
        let h = 1e-6;
        let inst_start = model.param_layout().operations["Iz:0"].start;
        for k in [0, 5, inst_start, inst_start + 17, v.len() - 1] {
            let mut plus = model.clone();
            let mut vp = v.clone();
            vp[k] += h;
            plus.from_vector(vp.as_slice().unwrap()).unwrap();
            let p0 = bulk_probabilities(&model, &layout).unwrap();
            let p1 = bulk_probabilities(&plus, &layout).unwrap();
            for e in 0..layout.num_elements() {
                assert_abs_diff_eq!(jac[[e, k]], (p1[e] - p0[e]) / h, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_default_layout_ignores_thread_count() {
        let model = stdmodels::std1q_xyi().unwrap();
        let build = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| {
                    let options = LayoutOptions {
                        max_cache_size: Some(3),
                        ..LayoutOptions::default()
                    };
                    EvalLayout::new(&model, &sample_circuits(), &options)
                        .map(|layout| (layout.num_chunks(), layout.cache_size()))
                        .map_err(|e| e.to_string())
                })
        };
        assert_eq!(LayoutOptions::default().num_chunks, DEFAULT_NUM_CHUNKS);
        assert_eq!(build(1), build(8));
    }

    #[test]
    fn test_cache_limit_reports_unsupported_length() {
        let model = stdmodels::std1q_xyi().unwrap();
        let options = LayoutOptions {
            num_chunks: 1,
            max_cache_size: Some(2),
        };
        let err = EvalLayout::new(&model, &sample_circuits(), &options).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLength { .. }));
    }
}
