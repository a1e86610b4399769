//! Unconstrained quasi-Newton minimization.
//!
//! The refinery drives its residual through the [`Minimizer`] trait so an
//! alternative solver can be swapped in; [`BfgsLineSearch`] is the built-in
//! implementation used by default.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Termination {
    /// Stop when the infinity norm of the gradient falls below this.
    pub gradient_tolerance: f64,
    /// Stop when successive objective values differ by less than this.
    pub objective_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for Termination {
    fn default() -> Self {
        Self {
            gradient_tolerance: 1.0e-6,
            objective_tolerance: 1.0e-10,
            max_iterations: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Converged,
    IterationLimit,
    LineSearchFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    pub x: Vec<f64>,
    pub f: f64,
    pub reason: TerminationReason,
    pub iterations: usize,
}

/// Objective callback: value and gradient at a point.
pub type Objective<'a> = &'a mut dyn FnMut(&[f64]) -> (f64, Vec<f64>);

pub trait Minimizer {
    fn minimize(&self, x0: &[f64], objective: Objective<'_>) -> MinimizeOutcome;
}

/// BFGS with Armijo backtracking. The inverse Hessian approximation is kept
/// as a dense row-major matrix; problem sizes here are a handful of
/// parameters, so no factorization machinery is warranted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BfgsLineSearch {
    pub termination: Termination,
    /// Sufficient-decrease constant for the Armijo condition.
    pub armijo_c1: f64,
    /// Step shrink factor per backtracking round.
    pub backtrack_factor: f64,
    pub max_backtracks: usize,
}

impl Default for BfgsLineSearch {
    fn default() -> Self {
        Self {
            termination: Termination::default(),
            armijo_c1: 1.0e-4,
            backtrack_factor: 0.5,
            max_backtracks: 40,
        }
    }
}

impl BfgsLineSearch {
    pub fn with_termination(termination: Termination) -> Self {
        Self {
            termination,
            ..Self::default()
        }
    }
}

impl Minimizer for BfgsLineSearch {
    fn minimize(&self, x0: &[f64], objective: Objective<'_>) -> MinimizeOutcome {
        let n = x0.len();
        let mut x = x0.to_vec();
        let (mut f, mut gradient) = objective(&x);
        let mut inverse_hessian = identity(n);

        if infinity_norm(&gradient) <= self.termination.gradient_tolerance {
            return MinimizeOutcome {
                x,
                f,
                reason: TerminationReason::Converged,
                iterations: 0,
            };
        }

        for iteration in 1..=self.termination.max_iterations {
            // direction = -H * g
            let mut direction = vec![0.0; n];
            for row in 0..n {
                let mut sum = 0.0;
                for col in 0..n {
                    sum += inverse_hessian[row * n + col] * gradient[col];
                }
                direction[row] = -sum;
            }

            let mut slope = 0.0;
            for (d, g) in direction.iter().zip(&gradient) {
                slope += d * g;
            }
            if slope >= 0.0 {
                // not a descent direction, reset curvature information
                inverse_hessian = identity(n);
                for (d, g) in direction.iter_mut().zip(&gradient) {
                    *d = -g;
                }
                slope = -gradient.iter().map(|g| g * g).sum::<f64>();
            }

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..self.max_backtracks {
                let trial: Vec<f64> = x
                    .iter()
                    .zip(&direction)
                    .map(|(xi, di)| xi + step * di)
                    .collect();
                let (f_trial, g_trial) = objective(&trial);
                if f_trial.is_finite() && f_trial <= f + self.armijo_c1 * step * slope {
                    accepted = Some((trial, f_trial, g_trial));
                    break;
                }
                step *= self.backtrack_factor;
            }

            let Some((x_next, f_next, gradient_next)) = accepted else {
                return MinimizeOutcome {
                    x,
                    f,
                    reason: TerminationReason::LineSearchFailure,
                    iterations: iteration,
                };
            };

            let s: Vec<f64> = x_next.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = gradient_next
                .iter()
                .zip(&gradient)
                .map(|(a, b)| a - b)
                .collect();
            let sy: f64 = s.iter().zip(&y).map(|(a, b)| a * b).sum();
            if sy > 1.0e-12 {
                bfgs_update(&mut inverse_hessian, &s, &y, sy, n);
            }

            let f_delta = (f - f_next).abs();
            x = x_next;
            f = f_next;
            gradient = gradient_next;

            if infinity_norm(&gradient) <= self.termination.gradient_tolerance
                || f_delta <= self.termination.objective_tolerance
            {
                return MinimizeOutcome {
                    x,
                    f,
                    reason: TerminationReason::Converged,
                    iterations: iteration,
                };
            }
        }

        MinimizeOutcome {
            x,
            f,
            reason: TerminationReason::IterationLimit,
            iterations: self.termination.max_iterations,
        }
    }
}

fn identity(n: usize) -> Vec<f64> {
    let mut matrix = vec![0.0; n * n];
    for diagonal in 0..n {
        matrix[diagonal * n + diagonal] = 1.0;
    }
    matrix
}

fn infinity_norm(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, value| acc.max(value.abs()))
}

/// Sherman-Morrison form of the BFGS inverse update:
/// `H <- (I - rho s y^T) H (I - rho y s^T) + rho s s^T`.
fn bfgs_update(h: &mut [f64], s: &[f64], y: &[f64], sy: f64, n: usize) {
    let rho = 1.0 / sy;
    // hy = H y
    let mut hy = vec![0.0; n];
    for row in 0..n {
        let mut sum = 0.0;
        for col in 0..n {
            sum += h[row * n + col] * y[col];
        }
        hy[row] = sum;
    }
    let yhy: f64 = y.iter().zip(&hy).map(|(a, b)| a * b).sum();
    for row in 0..n {
        for col in 0..n {
            let term1 = hy[row] * s[col] + s[row] * hy[col];
            let term2 = (1.0 + rho * yhy) * s[row] * s[col];
            h[row * n + col] += rho * (term2 - term1);
        }
    }
}
