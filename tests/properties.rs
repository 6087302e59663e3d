// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Invariants of models, forward simulation, objectives and the driver.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use qubit_os_gst::circuit::{make_lsgst_lists, Circuit};
use qubit_os_gst::config::{Config, ObjectiveConfig};
use qubit_os_gst::dataset::{generate_data, DataSet, Sampling};
use qubit_os_gst::forward::{EvalLayout, LayoutOptions};
use qubit_os_gst::linalg::hermitian_eigenvalues;
use qubit_os_gst::model::{GaugeGroup, Model, Operation, Parameterization};
use qubit_os_gst::objective::{Objective, ObjectiveKind};
use qubit_os_gst::optimize::LevenbergMarquardt;
use qubit_os_gst::{stdmodels, IterativeGst};

fn random_circuits(seed: u64, count: usize, max_len: usize) -> Vec<Circuit> {
    let labels = ["Gi", "Gx", "Gy"];
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(0..=max_len);
            Circuit::new((0..len).map(|_| labels[rng.gen_range(0..labels.len())]))
        })
        .collect()
}

fn noisy(policy: Parameterization) -> Model {
    let mut model = stdmodels::std1q_xyi()
        .unwrap()
        .depolarize(0.08, 0.02)
        .unwrap()
        .rotate(&[0.01, -0.02, 0.015])
        .unwrap();
    model.set_all_parameterizations(policy).unwrap();
    model
}

fn chi2(model: &Model, circuits: &[Circuit], data: &DataSet) -> f64 {
    let layout = EvalLayout::new(model, circuits, &LayoutOptions::default()).unwrap();
    Objective::new(
        ObjectiveKind::ChiSquared,
        model,
        &layout,
        data,
        &ObjectiveConfig::default(),
    )
    .unwrap()
    .value(&model.to_vector())
    .unwrap()
}

// ============================================================================
// Model invariants
// ============================================================================

#[test]
fn test_vector_round_trip_for_every_policy() {
    for policy in [
        Parameterization::Static,
        Parameterization::Full,
        Parameterization::Tp,
        Parameterization::Cptp,
    ] {
        let model = noisy(policy);
        let mut copy = model.clone();
        copy.from_vector(&model.to_vector().to_vec()).unwrap();
        for (label, op) in model.operations() {
            let other = copy.operation(label).unwrap();
            for (a, b) in op.matrix().iter().zip(other.matrix().iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-10);
            }
        }
    }
}

fn assert_cptp(model: &Model, m: &Array2<f64>) {
    let min = hermitian_eigenvalues(&model.basis().choi_matrix(m)).unwrap()[0];
    assert!(min >= -1e-10, "min Choi eigenvalue {}", min);
    assert_abs_diff_eq!(m[[0, 0]], 1.0, epsilon = 1e-10);
    for x in m.row(0).iter().skip(1) {
        assert_abs_diff_eq!(*x, 0.0, epsilon = 1e-10);
    }
}

#[test]
fn test_cptp_operations_stay_cptp_for_random_parameters() {
    let mut model = noisy(Parameterization::Cptp);
    let x0 = model.to_vector();
    let mut rng = StdRng::seed_from_u64(41);
    for scale in [0.01, 0.1, 1.0] {
        for _ in 0..20 {
            let x: Vec<f64> = x0.iter().map(|v| v + scale * rng.gen_range(-1.0..1.0)).collect();
            model.from_vector(&x).unwrap();
            for (_, op) in model.operations() {
                assert_cptp(&model, op.matrix());
            }
        }
    }
}

#[test]
fn test_cptp_policy_projects_non_cp_start() {
    let model = stdmodels::std1q_xyi().unwrap();
    let amplifying = Array2::from_diag(&array![1.0, 1.2, 1.2, 1.2]);
    let mut op = Operation::new(amplifying, Parameterization::Cptp, model.basis()).unwrap();
    assert_cptp(&model, op.matrix());

    let mut rng = StdRng::seed_from_u64(43);
    for _ in 0..30 {
        let v: Vec<f64> = (0..op.num_params()).map(|_| rng.gen_range(-0.5..0.5)).collect();
        op.from_vector(&v).unwrap();
        assert_cptp(&model, op.matrix());
    }
}

#[test]
fn test_probabilities_sum_to_one() {
    let models = [
        noisy(Parameterization::Full),
        noisy(Parameterization::Cptp),
        stdmodels::std1q_xyi_with_instrument().unwrap(),
    ];
    let mut circuits = random_circuits(5, 40, 30);
    circuits.push(Circuit::new(["Gx", "Iz", "Gy"]));
    for model in &models {
        for circuit in &circuits {
            if circuit.labels().iter().any(|l| model.instrument(l).is_none() && model.operation(l).is_none()) {
                continue;
            }
            let total: f64 = model.probabilities(circuit).unwrap().values().sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-8);
        }
    }
}

#[test]
fn test_gauge_transform_preserves_probabilities() {
    let model = noisy(Parameterization::Tp);
    let mut rng = StdRng::seed_from_u64(17);
    let theta: Vec<f64> = (0..GaugeGroup::Tp.num_params(model.dim()))
        .map(|_| rng.gen_range(-0.1..0.1))
        .collect();
    let gauge = GaugeGroup::Tp.element(&theta, model.basis()).unwrap();
    let transformed = model.transform(&gauge).unwrap();

    for circuit in random_circuits(23, 30, 20) {
        let before = model.probabilities(&circuit).unwrap();
        let after = transformed.probabilities(&circuit).unwrap();
        for (outcome, p) in &before {
            assert_abs_diff_eq!(*p, after[outcome], epsilon = 1e-8);
        }
    }
}

// ============================================================================
// Objective and optimizer invariants
// ============================================================================

#[test]
fn test_optimizer_never_increases_objective() {
    let target = stdmodels::std1q_xyi().unwrap();
    let truth = noisy(Parameterization::Tp);
    let fids = stdmodels::fiducials();
    let circuits = make_lsgst_lists(&fids, &fids, &stdmodels::germs(), &[1, 2]).pop().unwrap();
    let data = generate_data(&truth, &circuits, 500, Sampling::Multinomial { seed: 8 }).unwrap();
    let layout = EvalLayout::new(&target, &circuits, &LayoutOptions::default()).unwrap();
    let solver = LevenbergMarquardt::new(Config::default().optimizer);

    for kind in [ObjectiveKind::ChiSquared, ObjectiveKind::LogLikelihood] {
        let objective =
            Objective::new(kind, &target, &layout, &data, &ObjectiveConfig::default()).unwrap();
        let x0 = target.to_vector();
        let result = solver.minimize(&objective, &x0).unwrap();
        assert!(objective.value(&result.x).unwrap() <= objective.value(&x0).unwrap());
    }
}

#[test]
fn test_reported_dof_counts_nonzero_outcomes() {
    let target = stdmodels::std1q_xyi().unwrap();
    let truth = noisy(Parameterization::Tp);
    let fids = stdmodels::fiducials();
    let lists = make_lsgst_lists(&fids[..4], &fids[..4], &stdmodels::germs(), &[1, 2]);
    let data = generate_data(&truth, lists.last().unwrap(), 100, Sampling::Multinomial { seed: 3 }).unwrap();

    let results = IterativeGst::new(Config::default()).run(&data, &target, &lists).unwrap();
    for (it, circuits) in results.iterations.iter().zip(&lists) {
        let nonzero = circuits
            .iter()
            .flat_map(|c| data.get_counts(c).unwrap().values())
            .filter(|&&n| n > 0.0)
            .count();
        assert_eq!(it.statistics.num_data, nonzero);
        assert_eq!(it.statistics.dof, nonzero as f64 - target.num_params() as f64);
    }
}

#[test]
fn test_later_iterations_keep_earlier_fit_quality() {
    let target = stdmodels::std1q_xyi().unwrap();
    let truth = target.depolarize(0.05, 0.0).unwrap();
    let fids = stdmodels::fiducials();
    let lists = make_lsgst_lists(&fids, &fids, &stdmodels::germs(), &[1, 2, 4]);
    let data = generate_data(&truth, lists.last().unwrap(), 1000, Sampling::Expected).unwrap();

    let mut config = Config::default();
    config.driver.use_logl_final = false;
    let results = IterativeGst::new(config).run(&data, &target, &lists).unwrap();
    for i in 1..results.iterations.len() {
        let previous = &results.iterations[i - 1].model;
        let current = &results.iterations[i].model;
        let before = chi2(previous, &lists[i - 1], &data);
        let after = chi2(current, &lists[i - 1], &data);
        assert!(after <= before + 1e-2, "iteration {}: {} -> {}", i, before, after);
    }
}
