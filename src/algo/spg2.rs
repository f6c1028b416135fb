//! Nonmonotone spectral projected gradient method.
//!
//! Minimizes the growth objective over the constraint ball by the SPG2
//! variant of \[Birgin2000\]: a projected gradient direction scaled by the
//! Barzilai-Borwein spectral step, combined with the nonmonotone line
//! search of Grippo, Lampariello and Lucidi. The nonmonotone acceptance
//! rule compares each trial against the worst of the last few accepted
//! objectives instead of the current one, which lets the iterates escape
//! the narrow curved valleys typical for perturbation growth landscapes.
//!
//! Every iteration costs one gradient estimate plus one objective
//! evaluation per line search trial, each of which launches the external
//! solver. The method state is a plain value that converts to and from the
//! checkpoint schema, so a run can be resumed after a crash at the last
//! accepted iteration.
//!
//! \[Birgin2000\] Birgin, E. G., Martinez, J. M., & Raydan, M. (2000).
//! Nonmonotone Spectral Projected Gradient Methods on Convex Sets. SIAM
//! Journal on Optimization, 10(4), 1196-1211.
//! <https://doi.org/10.1137/S1052623497330963>

use getset::{CopyGetters, Setters};
use log::{debug, info, warn};
use nalgebra::DVector;
use thiserror::Error;

use crate::checkpoint::MethodRecord;
use crate::comm::{CommError, Communicator};
use crate::core::{objective, Ball, Process, ProcessError};
use crate::gradient::{GradientError, GradientEstimator};

/// Length of the objective window of the nonmonotone line search.
pub const HISTORY: usize = 10;

// A halving cascade that falls this low means the direction yields no
// decrease at any representable scale; the search gives up and accepts the
// last trial.
const ALPHA_FLOOR: f64 = 1e-20;

/// Error while iterating the method.
#[derive(Debug, Error)]
pub enum Spg2Error {
    /// An objective evaluation failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The gradient estimate failed.
    #[error(transparent)]
    Gradient(#[from] GradientError),
    /// A collective operation failed.
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Why the method stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stationarity measure fell below the tolerance.
    Converged,
    /// The iteration budget was exhausted before convergence.
    IterBudgetExceeded,
    /// The objective evaluation budget was exhausted before convergence.
    EvalBudgetExceeded,
    /// The method stopped without a classifiable cause.
    UnknownStop,
}

/// Whether the method can still make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spg2Status {
    /// An iteration was accepted; the method can continue.
    Running,
    /// The method stopped for the given reason.
    Stopped(StopReason),
}

/// Options of the SPG2 method.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct Spg2Options {
    /// Stationarity tolerance. Default: `1e-8`.
    eps: f64,
    /// Sufficient decrease coefficient of the line search. Default: `1e-4`.
    gamma: f64,
    /// Maximum number of accepted iterations. Default: `300`.
    max_iters: usize,
    /// Maximum number of objective evaluations. Default: `100_000`.
    max_fn_evals: usize,
    /// Lower clamp of the spectral step. Default: `1e-100`.
    step_min: f64,
    /// Upper clamp of the spectral step. Default: `1e100`.
    step_max: f64,
}

impl Default for Spg2Options {
    fn default() -> Self {
        Self {
            eps: 1e-8,
            gamma: 1e-4,
            max_iters: 300,
            max_fn_evals: 100_000,
            step_min: 1e-100,
            step_max: 1e100,
        }
    }
}

/// Plain state of the method between iterations.
///
/// Holds no process, communicator or estimator handle; those are passed
/// into every operation, so the state converts cleanly to and from the
/// checkpoint schema.
#[derive(Debug, Clone)]
pub struct Spg2State {
    /// Number of accepted iterations.
    pub iteration: usize,
    /// Number of objective evaluations.
    pub fn_evals: usize,
    /// Number of gradient estimates.
    pub grad_evals: usize,
    /// Current candidate perturbation.
    pub u: DVector<f64>,
    /// Gradient at the current candidate.
    pub g: DVector<f64>,
    /// Best perturbation found so far.
    pub best_u: DVector<f64>,
    /// Objective value of the best perturbation.
    pub best_j: f64,
    /// Recent accepted objectives; unfilled slots hold negative infinity
    /// so they never win the nonmonotone maximum.
    pub recent: [f64; HISTORY],
    /// Spectral step length.
    pub lambda: f64,
    /// Stationarity measure at the current candidate.
    pub cgnorm: f64,
    /// Objective value at the current candidate.
    pub j: f64,
    /// Whether the initial objective and gradient have been evaluated.
    pub initialized: bool,
}

impl Spg2State {
    fn fresh(u: DVector<f64>) -> Self {
        let n = u.len();

        Self {
            iteration: 0,
            fn_evals: 0,
            grad_evals: 0,
            g: DVector::zeros(n),
            best_u: u.clone_owned(),
            u,
            best_j: f64::INFINITY,
            recent: [f64::NEG_INFINITY; HISTORY],
            lambda: 1.0,
            cgnorm: f64::INFINITY,
            j: f64::INFINITY,
            initialized: false,
        }
    }

    /// Converts the state into the checkpoint schema.
    pub fn record(&self) -> MethodRecord {
        MethodRecord {
            iteration: self.iteration,
            fn_evals: self.fn_evals,
            grad_evals: self.grad_evals,
            perturbation: self.u.as_slice().to_vec(),
            gradient: self.g.as_slice().to_vec(),
            best_perturbation: self.best_u.as_slice().to_vec(),
            best_objective: self.best_j,
            recent_objectives: self
                .recent
                .iter()
                .map(|&j| j.is_finite().then_some(j))
                .collect(),
            step_length: self.lambda,
            stationarity_norm: self.cgnorm,
            objective: self.j,
            initialized: self.initialized,
        }
    }

    /// Reconstructs the state from the checkpoint schema.
    pub fn from_record(record: &MethodRecord) -> Self {
        let mut recent = [f64::NEG_INFINITY; HISTORY];
        for (slot, value) in recent.iter_mut().zip(&record.recent_objectives) {
            if let Some(value) = value {
                *slot = *value;
            }
        }

        Self {
            iteration: record.iteration,
            fn_evals: record.fn_evals,
            grad_evals: record.grad_evals,
            u: DVector::from_vec(record.perturbation.clone()),
            g: DVector::from_vec(record.gradient.clone()),
            best_u: DVector::from_vec(record.best_perturbation.clone()),
            best_j: record.best_objective,
            recent,
            lambda: record.step_length,
            cgnorm: record.stationarity_norm,
            j: record.objective,
            initialized: record.initialized,
        }
    }
}

/// The SPG2 method over the constraint ball.
#[derive(Debug)]
pub struct Spg2 {
    ball: Ball,
    options: Spg2Options,
    state: Spg2State,
}

impl Spg2 {
    /// Initializes the method with default options, starting from `u0`
    /// (projected onto the ball if outside).
    pub fn new(ball: Ball, u0: DVector<f64>) -> Self {
        Self::with_options(ball, u0, Spg2Options::default())
    }

    /// Initializes the method with given options.
    pub fn with_options(ball: Ball, mut u0: DVector<f64>, options: Spg2Options) -> Self {
        ball.project(&mut u0);

        Self {
            ball,
            options,
            state: Spg2State::fresh(u0),
        }
    }

    /// Reconstructs the method from a checkpointed state.
    pub fn resume(ball: Ball, record: &MethodRecord, options: Spg2Options) -> Self {
        Self {
            ball,
            options,
            state: Spg2State::from_record(record),
        }
    }

    /// Gets the state of the method.
    pub fn state(&self) -> &Spg2State {
        &self.state
    }

    /// Gets the options of the method.
    pub fn options(&self) -> &Spg2Options {
        &self.options
    }

    /// Converts the current state into the checkpoint schema.
    pub fn record(&self) -> MethodRecord {
        self.state.record()
    }

    /// Classifies a stopped state, or `None` while the method can still
    /// make progress. Checked before each iteration, never inside one.
    pub fn halted(&self) -> Option<StopReason> {
        let state = &self.state;

        if state.initialized && state.cgnorm <= self.options.eps {
            Some(StopReason::Converged)
        } else if state.iteration >= self.options.max_iters {
            Some(StopReason::IterBudgetExceeded)
        } else if state.fn_evals >= self.options.max_fn_evals {
            Some(StopReason::EvalBudgetExceeded)
        } else {
            None
        }
    }

    /// The reason the method stopped, with a fallback for a state that
    /// does not match any stopping criterion.
    pub fn stop_reason(&self) -> StopReason {
        self.halted().unwrap_or(StopReason::UnknownStop)
    }

    /// Evaluates the initial objective and gradient. Called once before
    /// the first iteration; [`Spg2::next`] calls it lazily if needed.
    ///
    /// This is a collective operation over the worker group.
    pub fn init<P, C>(
        &mut self,
        process: &P,
        comm: &C,
        estimator: &GradientEstimator,
    ) -> Result<(), Spg2Error>
    where
        P: Process,
        C: Communicator,
    {
        match self.init_inner(process, comm, estimator) {
            Ok(()) => Ok(()),
            Err(error) => {
                comm.abort();
                Err(error)
            }
        }
    }

    fn init_inner<P, C>(
        &mut self,
        process: &P,
        comm: &C,
        estimator: &GradientEstimator,
    ) -> Result<(), Spg2Error>
    where
        P: Process,
        C: Communicator,
    {
        let state = &mut self.state;

        state.j = collective_objective(process, comm, &state.u, estimator.horizon())?;
        state.fn_evals += 1;

        state.g = estimator.estimate(process, comm, &state.u, state.iteration)?;
        state.grad_evals += 1;

        state.cgnorm = stationarity(&self.ball, &state.u, &state.g);
        state.lambda = if state.cgnorm > 0.0 {
            (1.0 / state.cgnorm).clamp(self.options.step_min, self.options.step_max)
        } else {
            1.0
        };

        state.recent[0] = state.j;
        state.best_u = state.u.clone_owned();
        state.best_j = state.j;
        state.initialized = true;

        info!(
            "initialized: J = {:e}, stationarity = {:e}, step = {:e}",
            state.j, state.cgnorm, state.lambda
        );
        Ok(())
    }

    /// Performs one iteration: a projected spectral step, the nonmonotone
    /// line search and the Barzilai-Borwein step update.
    ///
    /// This is a collective operation over the worker group; on error the
    /// group is aborted before returning.
    pub fn next<P, C>(
        &mut self,
        process: &P,
        comm: &C,
        estimator: &GradientEstimator,
    ) -> Result<Spg2Status, Spg2Error>
    where
        P: Process,
        C: Communicator,
    {
        if !self.state.initialized {
            self.init(process, comm, estimator)?;
        }

        if let Some(reason) = self.halted() {
            return Ok(Spg2Status::Stopped(reason));
        }

        match self.iterate(process, comm, estimator) {
            Ok(()) => Ok(Spg2Status::Running),
            Err(error) => {
                comm.abort();
                Err(error)
            }
        }
    }

    fn iterate<P, C>(
        &mut self,
        process: &P,
        comm: &C,
        estimator: &GradientEstimator,
    ) -> Result<(), Spg2Error>
    where
        P: Process,
        C: Communicator,
    {
        let options = &self.options;
        let state = &mut self.state;
        let t = estimator.horizon();

        // Projected spectral direction.
        let d = self.ball.projection(&(&state.u - state.lambda * &state.g)) - &state.u;
        let gtd = state.g.dot(&d);
        let fmax = state
            .recent
            .iter()
            .fold(f64::NEG_INFINITY, |max, &j| max.max(j));

        let mut evals = 0;
        let (alpha, j_new) = armijo_search(
            |alpha| {
                evals += 1;
                let trial = &state.u + alpha * &d;
                collective_objective(process, comm, &trial, t)
            },
            state.j,
            fmax,
            gtd,
            options.gamma,
        )?;
        state.fn_evals += evals;

        let u_new = &state.u + alpha * &d;
        let s = alpha * &d;

        let g_new = estimator.estimate(process, comm, &u_new, state.iteration + 1)?;
        state.grad_evals += 1;

        // Barzilai-Borwein spectral step for the next iteration.
        let y = &g_new - &state.g;
        let sts = s.dot(&s);
        let sty = s.dot(&y);
        state.lambda = if sty <= 0.0 {
            options.step_max
        } else {
            (sts / sty).clamp(options.step_min, options.step_max)
        };

        state.u = u_new;
        state.g = g_new;
        state.j = j_new;
        state.iteration += 1;
        state.recent[state.iteration % HISTORY] = state.j;
        state.cgnorm = stationarity(&self.ball, &state.u, &state.g);

        if state.j < state.best_j {
            state.best_j = state.j;
            state.best_u = state.u.clone_owned();
        }

        debug!(
            "iteration {}: J = {:e}, stationarity = {:e}, step = {:e}, line search evals = {evals}",
            state.iteration, state.j, state.cgnorm, state.lambda
        );
        Ok(())
    }
}

/// Stationarity measure: the largest component of the projected gradient
/// residual `P(u - g) - u`. Zero exactly at a constrained stationary point.
fn stationarity(ball: &Ball, u: &DVector<f64>, g: &DVector<f64>) -> f64 {
    (ball.projection(&(u - g)) - u).amax()
}

/// Evaluates the objective as a collective: the leader evolves the process
/// and every worker receives the value, so all ranks branch on identical
/// numbers.
fn collective_objective<P, C>(
    process: &P,
    comm: &C,
    u: &DVector<f64>,
    t: f64,
) -> Result<f64, Spg2Error>
where
    P: Process,
    C: Communicator,
{
    let mut j = 0.0;
    if comm.is_leader() {
        j = objective(process, u, t)?;
    }
    comm.broadcast_scalar(0, &mut j)?;

    Ok(j)
}

/// Nonmonotone line search: evaluates `eval(alpha)` starting from a full
/// step and backtracks until the trial satisfies the sufficient decrease
/// condition against the recent maximum `fmax`.
///
/// Returns the accepted step and its objective value. If the step falls
/// below the representable floor without acceptance, the last trial is
/// accepted with a warning.
fn armijo_search<F, E>(mut eval: F, j0: f64, fmax: f64, gtd: f64, gamma: f64) -> Result<(f64, f64), E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let mut alpha = 1.0;
    let mut j_new = eval(alpha)?;

    while j_new > fmax + gamma * alpha * gtd {
        if alpha < ALPHA_FLOOR {
            warn!("line search found no acceptable step, keeping alpha = {alpha:e}");
            break;
        }

        alpha = backtrack(alpha, gtd, j0, j_new);
        j_new = eval(alpha)?;
    }

    Ok((alpha, j_new))
}

/// One backtracking update: plain halving for small steps, otherwise
/// quadratic interpolation through `(0, j0)`, `(alpha, j_new)` with slope
/// `gtd` at zero, safeguarded to `[0.1 alpha, 0.9 alpha]`.
fn backtrack(alpha: f64, gtd: f64, j0: f64, j_new: f64) -> f64 {
    if alpha <= 0.1 {
        return alpha / 2.0;
    }

    let atemp = -gtd * alpha * alpha / (2.0 * (j_new - j0 - alpha * gtd));

    if atemp.is_finite() && atemp >= 0.1 * alpha && atemp <= 0.9 * alpha {
        atemp
    } else {
        alpha / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::comm::SingleProcess;
    use crate::testing::LinearGrowth;

    #[test]
    fn backtrack_halves_small_steps() {
        assert_abs_diff_eq!(backtrack(0.1, -1.0, 0.0, 1.0), 0.05);
        assert_abs_diff_eq!(backtrack(0.01, -1.0, 0.0, 1.0), 0.005);
    }

    #[test]
    fn backtrack_interpolates_inside_the_safeguard() {
        // Interpolant minimum at alpha = 1/3 lies within [0.1, 0.9].
        let next = backtrack(1.0, -2.0, 0.0, 1.0);
        assert_abs_diff_eq!(next, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn backtrack_falls_back_to_halving_outside_the_safeguard() {
        // A huge trial value pushes the interpolant far below 0.1 alpha.
        let next = backtrack(1.0, -2.0, 0.0, 1000.0);
        assert_abs_diff_eq!(next, 0.5);
    }

    #[test]
    fn line_search_satisfies_sufficient_decrease() {
        let mut rng = StdRng::seed_from_u64(11);
        let gamma = 1e-4;

        for _ in 0..50 {
            // f(x) = (x - m)^2 from x = 0 along the steepest descent
            // direction d = 2m.
            let m: f64 = rng.gen_range(0.5..2.0);
            let d = 2.0 * m;
            let j0 = m * m;
            let gtd = -2.0 * m * d;

            let f = |alpha: f64| -> Result<f64, Infallible> {
                let x = alpha * d;
                Ok((x - m) * (x - m))
            };

            let (alpha, j_new) = armijo_search(f, j0, j0, gtd, gamma).unwrap();
            assert!(alpha > 0.0 && alpha <= 1.0);
            assert!(j_new <= j0 + gamma * alpha * gtd);
        }
    }

    #[test]
    fn line_search_terminates_on_ascent_directions() {
        // The decrease condition is unsatisfiable for an increasing
        // objective with positive slope; the search must still terminate.
        let f = |alpha: f64| -> Result<f64, Infallible> { Ok(1.0 + alpha) };

        let (alpha, j_new) = armijo_search(f, 1.0, 1.0, 1.0, 1e-4).unwrap();
        assert!(alpha.is_finite() && alpha > 0.0);
        assert!(j_new.is_finite());
    }

    #[test]
    fn converges_on_a_quadratic_growth_landscape() {
        // J(u) = -||u - b||^2 over the unit ball with b = (-1, -1) is
        // minimized at (1, 1), the boundary point opposite to b.
        let ball = Ball::new(2, 1.0);
        let process = LinearGrowth::new(dvector![-1.0, -1.0]);
        let estimator = GradientEstimator::new(1.0);

        let mut options = Spg2Options::default();
        options.set_eps(1e-4);

        let mut spg2 = Spg2::with_options(ball, DVector::zeros(2), options);

        let status = loop {
            match spg2.next(&process, &SingleProcess, &estimator).unwrap() {
                Spg2Status::Running => continue,
                status => break status,
            }
        };

        assert_eq!(status, Spg2Status::Stopped(StopReason::Converged));

        let state = spg2.state();
        assert_abs_diff_eq!(state.best_u[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(state.best_u[1], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(state.best_j, -8.0, epsilon = 1e-2);
        assert!(state.fn_evals >= 2);
        assert!(state.grad_evals >= 2);
    }

    #[test]
    fn exhausted_iteration_budget_stops_the_method() {
        let ball = Ball::new(2, 1.0);
        let process = LinearGrowth::new(dvector![-1.0, -1.0]);
        let estimator = GradientEstimator::new(1.0);

        let mut options = Spg2Options::default();
        options.set_max_iters(0);

        let mut spg2 = Spg2::with_options(ball, DVector::zeros(2), options);
        let status = spg2.next(&process, &SingleProcess, &estimator).unwrap();

        assert_eq!(status, Spg2Status::Stopped(StopReason::IterBudgetExceeded));
    }

    #[test]
    fn exhausted_evaluation_budget_stops_the_method() {
        let ball = Ball::new(2, 1.0);
        let process = LinearGrowth::new(dvector![-1.0, -1.0]);
        let estimator = GradientEstimator::new(1.0);

        // The initial objective evaluation alone spends the whole budget.
        let mut options = Spg2Options::default();
        options.set_max_fn_evals(1);

        let mut spg2 = Spg2::with_options(ball, DVector::zeros(2), options);
        let status = spg2.next(&process, &SingleProcess, &estimator).unwrap();

        assert_eq!(status, Spg2Status::Stopped(StopReason::EvalBudgetExceeded));
        assert_eq!(spg2.state().fn_evals, 1);
    }

    #[test]
    fn state_survives_the_checkpoint_round_trip() {
        let ball = Ball::new(2, 1.0);
        let process = LinearGrowth::new(dvector![2.0, 1.0]);
        let estimator = GradientEstimator::new(1.0);

        let mut spg2 = Spg2::new(ball.clone(), dvector![0.1, -0.1]);
        spg2.init(&process, &SingleProcess, &estimator).unwrap();
        spg2.next(&process, &SingleProcess, &estimator).unwrap();

        let record = spg2.record();
        let resumed = Spg2::resume(ball, &record, Spg2Options::default());

        assert_eq!(resumed.state().iteration, spg2.state().iteration);
        assert_eq!(resumed.state().u, spg2.state().u);
        assert_eq!(resumed.state().g, spg2.state().g);
        assert_eq!(resumed.state().lambda, spg2.state().lambda);
        assert_eq!(resumed.record(), record);
    }
}
