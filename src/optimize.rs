// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Levenberg-Marquardt least-squares solver.
//!
//! Minimizes ‖r(x)‖² for a [`LeastSquaresProblem`]. Each iteration solves
//! the damped normal equations (JᵀJ + μI)·δ = −Jᵀr by Cholesky and accepts
//! the step only when the actual cost decrease is positive relative to
//! the decrease predicted by the linear model. Damping follows Nielsen's
//! update: shrink by max(1/3, 1 − (2ρ − 1)³) on acceptance, grow
//! geometrically on rejection. When no acceptable step can be found the
//! solver stops with [`OptimizerState::Stalled`] and returns the last
//! accepted iterate.
//!
//! Ref: Madsen, Nielsen & Tingleff (2004), "Methods for Non-Linear Least
//! Squares Problems", §3.2.

use ndarray::{Array1, Array2};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::OptimizerConfig;
use crate::error::{Error, OptimizationFailure, Result};
use crate::linalg::cholesky_solve;

/// Residual vector and Jacobian of a least-squares problem.
pub trait LeastSquaresProblem {
    fn num_params(&self) -> usize;

    fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>>;

    /// ∂r_i/∂x_j, shape (residuals × parameters).
    fn jacobian(&self, x: &Array1<f64>) -> Result<Array2<f64>>;
}

/// Which convergence criterion stopped the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    RelativeFunctionChange,
    StepSize,
    Gradient,
    ZeroResidual,
}

/// Why the solver gave up looking for a descent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallReason {
    /// Damping grew past `max_damping`.
    Damping,
    /// More than `max_rejections` consecutive trial steps were rejected.
    Rejections,
    /// The damped normal equations stayed singular.
    SingularSystem { attempts: usize },
}

/// Solver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerState {
    Running,
    Converged(Termination),
    MaxIterationsReached,
    Stalled(StallReason),
}

impl OptimizerState {
    pub fn is_converged(&self) -> bool {
        matches!(self, OptimizerState::Converged(_))
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, OptimizerState::Stalled(_))
    }
}

/// Outcome of [`LevenbergMarquardt::minimize`].
#[derive(Debug, Clone)]
pub struct LmResult {
    pub x: Array1<f64>,
    /// ‖r(x)‖² at the returned point.
    pub cost: f64,
    pub initial_cost: f64,
    pub iterations: usize,
    pub state: OptimizerState,
    pub final_damping: f64,
}

impl LmResult {
    /// Whether at least one step was accepted.
    pub fn improved(&self) -> bool {
        self.cost < self.initial_cost
    }

    /// The failure a stalled run corresponds to, `None` otherwise.
    pub fn stall_failure(&self) -> Option<OptimizationFailure> {
        match self.state {
            OptimizerState::Stalled(StallReason::SingularSystem { attempts }) => {
                Some(OptimizationFailure::SingularSystem { attempts })
            }
            OptimizerState::Stalled(_) => Some(OptimizationFailure::Divergence {
                damping: self.final_damping,
            }),
            _ => None,
        }
    }
}

/// Trust-region Levenberg-Marquardt solver.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    config: OptimizerConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize from `x0`. The returned cost never exceeds the cost at `x0`.
    ///
    /// Errors are reserved for problems that cannot be evaluated at all; a
    /// run that stops making progress returns its best point with
    /// [`OptimizerState::Stalled`].
    pub fn minimize<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        x0: &Array1<f64>,
    ) -> Result<LmResult> {
        let n = problem.num_params();
        if x0.len() != n {
            return Err(Error::dimension("initial parameter vector", n, x0.len()));
        }
        let cfg = &self.config;

        let mut x = x0.clone();
        let mut r = problem.residuals(&x)?;
        let mut cost = r.dot(&r);
        if !cost.is_finite() {
            return Err(OptimizationFailure::InvalidCost(format!(
                "initial cost is {}",
                cost
            ))
            .into());
        }
        let initial_cost = cost;

        let mut result = LmResult {
            x: x.clone(),
            cost,
            initial_cost,
            iterations: 0,
            state: OptimizerState::Running,
            final_damping: 0.0,
        };
        if cost == 0.0 {
            result.state = OptimizerState::Converged(Termination::ZeroResidual);
            return Ok(result);
        }
        if n == 0 {
            result.state = OptimizerState::Converged(Termination::Gradient);
            return Ok(result);
        }

        let mut jac = problem.jacobian(&x)?;
        let mut mu: Option<f64> = None;
        let mut nu = 2.0;
        let mut iterations = 0;

        let state = 'outer: loop {
            if iterations >= cfg.max_iterations {
                break OptimizerState::MaxIterationsReached;
            }
            iterations += 1;

            let jtj = jac.t().dot(&jac);
            let g = jac.t().dot(&r);
            let g_norm = g.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if g_norm <= cfg.gtol {
                break OptimizerState::Converged(Termination::Gradient);
            }

            let damping = mu.get_or_insert_with(|| {
                let max_diag = jtj.diag().iter().fold(0.0_f64, |m, v| m.max(*v));
                cfg.initial_damping_scale * max_diag.max(f64::MIN_POSITIVE)
            });

            let mut rejections = 0;
            let mut singular = 0;
            loop {
                if *damping > cfg.max_damping {
                    break 'outer OptimizerState::Stalled(StallReason::Damping);
                }

                let mut a = jtj.clone();
                for k in 0..n {
                    a[[k, k]] += *damping;
                }
                let Some(dx) = cholesky_solve(&a, &(-&g))? else {
                    singular += 1;
                    if singular > cfg.max_rejections {
                        break 'outer OptimizerState::Stalled(StallReason::SingularSystem {
                            attempts: singular,
                        });
                    }
                    *damping *= nu;
                    nu *= 2.0;
                    continue;
                };

                let x_norm = x.dot(&x).sqrt();
                if dx.dot(&dx).sqrt() <= cfg.xtol * (x_norm + cfg.xtol) {
                    break 'outer OptimizerState::Converged(Termination::StepSize);
                }

                let x_new = &x + &dx;
                let trial = match problem.residuals(&x_new) {
                    Ok(r_new) => {
                        let new_cost = r_new.dot(&r_new);
                        new_cost.is_finite().then_some((r_new, new_cost))
                    }
                    Err(e @ (Error::Dimension { .. }
                    | Error::UnknownLabel(_)
                    | Error::Validation(_)
                    | Error::GaugeCompatibility(_))) => return Err(e),
                    Err(e) => {
                        debug!(error = %e, "trial point could not be evaluated");
                        None
                    }
                };

                let predicted = -(2.0 * g.dot(&dx) + dx.dot(&jtj.dot(&dx)));
                if let Some((r_new, new_cost)) = trial {
                    let rho = (cost - new_cost) / predicted;
                    if predicted > 0.0 && new_cost < cost {
                        let relative = (cost - new_cost) / cost;
                        x = x_new;
                        r = r_new;
                        cost = new_cost;
                        *damping *= (1.0 - (2.0 * rho - 1.0).powi(3)).max(1.0 / 3.0);
                        nu = 2.0;
                        debug!(iteration = iterations, cost, damping = *damping, "accepted step");

                        if cost == 0.0 {
                            break 'outer OptimizerState::Converged(Termination::ZeroResidual);
                        }
                        if relative <= cfg.ftol {
                            break 'outer OptimizerState::Converged(
                                Termination::RelativeFunctionChange,
                            );
                        }
                        jac = problem.jacobian(&x)?;
                        break;
                    }
                }

                rejections += 1;
                if rejections > cfg.max_rejections {
                    break 'outer OptimizerState::Stalled(StallReason::Rejections);
                }
                *damping *= nu;
                nu *= 2.0;
            }
        };

        if state.is_stalled() {
            warn!(iterations, cost, initial_cost, state = ?state, "optimizer stalled");
        } else {
            debug!(iterations, cost, initial_cost, state = ?state, "optimizer finished");
        }
        if state == OptimizerState::MaxIterationsReached && cfg.max_iterations_is_failure {
            return Err(OptimizationFailure::IterationCap { iterations }.into());
        }

        Ok(LmResult {
            x,
            cost,
            initial_cost,
            iterations,
            state,
            final_damping: mu.unwrap_or(0.0),
        })
    }
}

/// Central-difference Jacobian of `f` at `x`.
pub fn finite_difference_jacobian<F>(f: F, x: &Array1<f64>, step: f64) -> Result<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> Result<Array1<f64>>,
{
    let n = x.len();
    let mut columns = Vec::with_capacity(n);
    for k in 0..n {
        let h = step * x[k].abs().max(1.0);
        let mut plus = x.clone();
        let mut minus = x.clone();
        plus[k] += h;
        minus[k] -= h;
        columns.push((f(&plus)? - f(&minus)?) / (2.0 * h));
    }
    let m = match columns.first() {
        Some(c) => c.len(),
        None => f(x)?.len(),
    };
    let mut jac = Array2::zeros((m, n));
    for (k, column) in columns.into_iter().enumerate() {
        if column.len() != m {
            return Err(Error::dimension("residual vector", m, column.len()));
        }
        jac.column_mut(k).assign(&column);
    }
    Ok(jac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::cell::Cell;

    struct Rosenbrock;

    impl LeastSquaresProblem for Rosenbrock {
        fn num_params(&self) -> usize {
            2
        }

        fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
            Ok(array![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]])
        }

        fn jacobian(&self, x: &Array1<f64>) -> Result<Array2<f64>> {
            Ok(array![[-20.0 * x[0], 10.0], [-1.0, 0.0]])
        }
    }

    /// Linear fit y = a·t + b where parameter 2 has no effect at all.
    struct DeadParameter;

    impl LeastSquaresProblem for DeadParameter {
        fn num_params(&self) -> usize {
            3
        }

        fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
            let data = [(0.0, 1.1), (1.0, 2.9), (2.0, 5.1), (3.0, 6.9)];
            Ok(data.iter().map(|(t, y)| x[0] * t + x[1] - y).collect())
        }

        fn jacobian(&self, _x: &Array1<f64>) -> Result<Array2<f64>> {
            let mut j = Array2::zeros((4, 3));
            for (i, t) in [0.0, 1.0, 2.0, 3.0].iter().enumerate() {
                j[[i, 0]] = *t;
                j[[i, 1]] = 1.0;
            }
            Ok(j)
        }
    }

    #[test]
    fn test_rosenbrock_converges() {
        let lm = LevenbergMarquardt::new(OptimizerConfig {
            max_iterations: 500,
            ftol: 1e-14,
            ..OptimizerConfig::default()
        });
        let result = lm.minimize(&Rosenbrock, &array![-1.2, 1.0]).unwrap();
        assert!(result.state.is_converged());
        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.x[1], 1.0, epsilon = 1e-4);
        assert!(result.cost <= result.initial_cost);
    }

    #[test]
    fn test_dead_parameter_does_not_break_the_fit() {
        let lm = LevenbergMarquardt::new(OptimizerConfig::default());
        let x0 = array![0.0, 0.0, 0.7];
        let result = lm.minimize(&DeadParameter, &x0).unwrap();
        assert!(result.state.is_converged());
        // least-squares line through the data: slope 1.96, intercept 1.06
        assert_abs_diff_eq!(result.x[0], 1.96, epsilon = 1e-3);
        assert_abs_diff_eq!(result.x[1], 1.06, epsilon = 1e-3);
        assert_abs_diff_eq!(result.x[2], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_residual_at_start() {
        let lm = LevenbergMarquardt::new(OptimizerConfig::default());
        let result = lm.minimize(&Rosenbrock, &array![1.0, 1.0]).unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.state, OptimizerState::Converged(Termination::ZeroResidual));
    }

    #[test]
    fn test_iteration_cap() {
        let config = OptimizerConfig {
            max_iterations: 2,
            ftol: 0.0,
            xtol: 0.0,
            gtol: 0.0,
            ..OptimizerConfig::default()
        };
        let result = LevenbergMarquardt::new(config.clone())
            .minimize(&Rosenbrock, &array![-1.2, 1.0])
            .unwrap();
        assert_eq!(result.state, OptimizerState::MaxIterationsReached);
        assert!(result.cost <= result.initial_cost);

        let strict = OptimizerConfig {
            max_iterations_is_failure: true,
            ..config
        };
        let err = LevenbergMarquardt::new(strict)
            .minimize(&Rosenbrock, &array![-1.2, 1.0])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Optimization(OptimizationFailure::IterationCap { iterations: 2 })
        ));
    }

    #[test]
    fn test_wrong_initial_length() {
        let lm = LevenbergMarquardt::new(OptimizerConfig::default());
        let err = lm.minimize(&Rosenbrock, &array![1.0]).unwrap_err();
        assert!(matches!(err, Error::Dimension { expected: 2, actual: 1, .. }));
    }

    /// Residuals blow up everywhere except the starting point.
    struct Cliff {
        calls: Cell<usize>,
    }

    impl LeastSquaresProblem for Cliff {
        fn num_params(&self) -> usize {
            1
        }

        fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
            self.calls.set(self.calls.get() + 1);
            if x[0] == 0.0 {
                Ok(array![1.0])
            } else {
                Ok(array![f64::NAN])
            }
        }

        fn jacobian(&self, _x: &Array1<f64>) -> Result<Array2<f64>> {
            Ok(array![[1.0]])
        }
    }

    #[test]
    fn test_unusable_trial_points_stall_at_start() {
        let problem = Cliff {
            calls: Cell::new(0),
        };
        let lm = LevenbergMarquardt::new(OptimizerConfig {
            max_rejections: 5,
            ..OptimizerConfig::default()
        });
        let result = lm.minimize(&problem, &array![0.0]).unwrap();
        assert_eq!(result.state, OptimizerState::Stalled(StallReason::Rejections));
        assert_eq!(result.x, array![0.0]);
        assert!(!result.improved());
        assert!(matches!(
            result.stall_failure(),
            Some(OptimizationFailure::Divergence { .. })
        ));
        assert!(problem.calls.get() <= 8);
    }

    /// r = 2 − x, but only the first `budget` residual evaluations succeed.
    struct Fuse {
        calls: Cell<usize>,
        budget: usize,
    }

    impl LeastSquaresProblem for Fuse {
        fn num_params(&self) -> usize {
            1
        }

        fn residuals(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() <= self.budget {
                Ok(array![2.0 - x[0]])
            } else {
                Ok(array![f64::NAN])
            }
        }

        fn jacobian(&self, _x: &Array1<f64>) -> Result<Array2<f64>> {
            Ok(array![[-1.0]])
        }
    }

    #[test]
    fn test_stall_returns_last_accepted_iterate() {
        let problem = Fuse {
            calls: Cell::new(0),
            budget: 2,
        };
        let lm = LevenbergMarquardt::new(OptimizerConfig {
            max_rejections: 3,
            ..OptimizerConfig::default()
        });
        let result = lm.minimize(&problem, &array![0.0]).unwrap();
        assert_eq!(result.state, OptimizerState::Stalled(StallReason::Rejections));
        assert!(result.improved());
        assert_abs_diff_eq!(result.x[0], 2.0, epsilon = 1e-2);
        assert_abs_diff_eq!(result.cost, (2.0 - result.x[0]).powi(2), epsilon = 1e-15);
        assert!(result.final_damping > 0.0);
    }

    #[test]
    fn test_damping_ceiling_stalls_instead_of_failing() {
        let problem = Cliff {
            calls: Cell::new(0),
        };
        let lm = LevenbergMarquardt::new(OptimizerConfig {
            max_damping: 1.0,
            max_rejections: 100,
            ..OptimizerConfig::default()
        });
        let result = lm.minimize(&problem, &array![0.0]).unwrap();
        assert_eq!(result.state, OptimizerState::Stalled(StallReason::Damping));
        assert_eq!(result.cost, result.initial_cost);
    }

    #[test]
    fn test_finite_difference_jacobian() {
        let x = array![0.3, -0.7];
        let fd = finite_difference_jacobian(|x| Rosenbrock.residuals(x), &x, 1e-6).unwrap();
        let exact = Rosenbrock.jacobian(&x).unwrap();
        for (a, b) in fd.iter().zip(exact.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}
