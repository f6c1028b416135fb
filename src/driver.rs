//! High-level driver of a CNOP computation.
//!
//! The driver wires the pieces together for the common case: it builds the
//! constraint ball from the process dimension, picks or samples the initial
//! perturbation, restores the latest checkpoint if one exists, and iterates
//! the optimizer until it stops, checkpointing every accepted iteration.
//!
//! ```rust
//! use cnop::nalgebra::{dvector, DVector};
//! use cnop::{CnopDriver, Process, ProcessError, SingleProcess, StopReason};
//!
//! struct Mock {
//!     basic: DVector<f64>,
//! }
//!
//! impl Process for Mock {
//!     fn dim(&self) -> usize {
//!         self.basic.len()
//!     }
//!
//!     fn proceed(
//!         &self,
//!         _t: f64,
//!         perturbation: Option<&DVector<f64>>,
//!         _fork: Option<usize>,
//!     ) -> Result<DVector<f64>, ProcessError> {
//!         Ok(match perturbation {
//!             Some(u) => u.clone(),
//!             None => self.basic.clone(),
//!         })
//!     }
//! }
//!
//! # fn main() -> Result<(), cnop::CnopError> {
//! let process = Mock {
//!     basic: dvector![-1.0, -1.0],
//! };
//!
//! let driver = CnopDriver::builder(1.0)
//!     .with_radius(1.0)
//!     .with_initial(DVector::zeros(2))
//!     .with_eps(1e-4)
//!     .build();
//!
//! let report = driver.run(&process, &SingleProcess)?;
//!
//! assert_eq!(report.stop, StopReason::Converged);
//! assert!((report.best_perturbation[0] - 1.0).abs() < 1e-3);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};
use nalgebra::DVector;
use thiserror::Error;

use crate::algo::{Spg2, Spg2Error, Spg2Options, Spg2Status, StopReason};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, SCHEMA_VERSION};
use crate::comm::{CommError, Communicator};
use crate::core::{Ball, Process, DEFAULT_RADIUS};
use crate::gradient::{GradientEstimator, DEFAULT_BARRIER_TIMEOUT, DEFAULT_EPSILON};

/// Error of a driver run.
#[derive(Debug, Error)]
pub enum CnopError {
    /// The optimizer failed.
    #[error(transparent)]
    Spg2(#[from] Spg2Error),
    /// A checkpoint could not be saved or loaded.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// A collective operation failed.
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Outcome of a completed driver run.
#[derive(Debug, Clone)]
pub struct CnopReport {
    /// Best perturbation found.
    pub best_perturbation: DVector<f64>,
    /// Growth objective of the best perturbation.
    pub best_objective: f64,
    /// Why the optimizer stopped.
    pub stop: StopReason,
    /// Number of accepted iterations.
    pub iterations: usize,
    /// Number of objective evaluations.
    pub fn_evals: usize,
    /// Number of gradient estimates.
    pub grad_evals: usize,
}

/// Builder for [`CnopDriver`].
#[derive(Debug, Clone)]
pub struct CnopBuilder {
    horizon: f64,
    radius: f64,
    options: Spg2Options,
    grad_epsilon: f64,
    barrier_timeout: Duration,
    records: Option<PathBuf>,
    checkpoints: Option<PathBuf>,
    initial: Option<DVector<f64>>,
}

impl CnopBuilder {
    fn new(horizon: f64) -> Self {
        Self {
            horizon,
            radius: DEFAULT_RADIUS,
            options: Spg2Options::default(),
            grad_epsilon: DEFAULT_EPSILON,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            records: None,
            checkpoints: None,
            initial: None,
        }
    }

    /// Sets the constraint radius (default: [`DEFAULT_RADIUS`]).
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    /// Sets the optimizer options.
    pub fn with_options(mut self, options: Spg2Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the stationarity tolerance of the optimizer.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.options.set_eps(eps);
        self
    }

    /// Sets the iteration budget of the optimizer.
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.options.set_max_iters(max_iters);
        self
    }

    /// Sets the finite-difference step of the gradient estimator (default:
    /// [`DEFAULT_EPSILON`]).
    pub fn with_grad_epsilon(mut self, epsilon: f64) -> Self {
        self.grad_epsilon = epsilon;
        self
    }

    /// Sets the timeout of the barrier closing each gradient estimate
    /// (default: [`DEFAULT_BARRIER_TIMEOUT`]).
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Sets the directory for per-component gradient restart records.
    /// Without it, an interrupted gradient estimate restarts from scratch.
    pub fn with_records(mut self, dir: impl Into<PathBuf>) -> Self {
        self.records = Some(dir.into());
        self
    }

    /// Sets the directory for per-iteration checkpoints. Without it, the
    /// run cannot be resumed after a crash.
    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoints = Some(dir.into());
        self
    }

    /// Sets the initial perturbation (projected onto the ball if outside).
    /// Without it, the leader samples a random point on the constraint
    /// sphere and broadcasts it.
    pub fn with_initial(mut self, initial: DVector<f64>) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Builds the driver.
    pub fn build(self) -> CnopDriver {
        CnopDriver { config: self }
    }
}

/// Driver running the whole CNOP computation over a worker group.
#[derive(Debug)]
pub struct CnopDriver {
    config: CnopBuilder,
}

impl CnopDriver {
    /// Starts building a driver for the given target time.
    pub fn builder(horizon: f64) -> CnopBuilder {
        CnopBuilder::new(horizon)
    }

    /// Runs the computation to completion.
    ///
    /// This is a collective operation: every worker of the group calls it
    /// with an equivalent process, and every worker receives the report.
    /// If a checkpoint directory is configured and holds a record, the run
    /// resumes from the latest checkpoint instead of starting fresh.
    pub fn run<P, C>(&self, process: &P, comm: &C) -> Result<CnopReport, CnopError>
    where
        P: Process,
        C: Communicator,
    {
        let config = &self.config;

        let ball = Ball::new(process.dim(), config.radius);

        let mut estimator = GradientEstimator::new(config.horizon);
        estimator.set_epsilon(config.grad_epsilon);
        estimator.set_barrier_timeout(config.barrier_timeout);
        estimator.set_records(config.records.clone());

        let store = config.checkpoints.clone().map(CheckpointStore::new);

        // The checkpoint directory lives on the shared filesystem, so every
        // worker reads the same latest record.
        let latest = match &store {
            Some(store) => store.load_latest()?,
            None => None,
        };

        let mut spg2 = match latest {
            Some(checkpoint) => {
                info!("resuming from checkpoint of iteration {}", checkpoint.iteration);
                process.restore(&checkpoint.process);
                Spg2::resume(ball, &checkpoint.method, config.options.clone())
            }
            None => {
                let u0 = self.initial_perturbation(&ball, comm)?;
                let mut spg2 = Spg2::with_options(ball, u0, config.options.clone());

                spg2.init(process, comm, &estimator)?;
                self.save(&store, &spg2, process, comm)?;
                spg2
            }
        };

        let stop = loop {
            match spg2.next(process, comm, &estimator)? {
                Spg2Status::Running => self.save(&store, &spg2, process, comm)?,
                Spg2Status::Stopped(reason) => break reason,
            }
        };

        let state = spg2.state();
        info!(
            "stopped after {} iterations ({:?}): J = {:e}",
            state.iteration, stop, state.best_j
        );

        Ok(CnopReport {
            best_perturbation: state.best_u.clone_owned(),
            best_objective: state.best_j,
            stop,
            iterations: state.iteration,
            fn_evals: state.fn_evals,
            grad_evals: state.grad_evals,
        })
    }

    /// Picks the initial perturbation: the configured one, or a random
    /// point on the constraint sphere sampled by the leader and broadcast
    /// so that all workers start identically.
    fn initial_perturbation<C: Communicator>(
        &self,
        ball: &Ball,
        comm: &C,
    ) -> Result<DVector<f64>, CnopError> {
        if let Some(initial) = &self.config.initial {
            return Ok(initial.clone_owned());
        }

        let mut u0 = DVector::zeros(ball.dim());
        if comm.is_leader() {
            u0 = ball.sample(&mut rand::thread_rng());
        }
        comm.broadcast(0, &mut u0)?;

        Ok(u0)
    }

    /// Saves the checkpoint of the current iteration; the leader writes,
    /// the other workers only pass the barrier inside the next collective.
    fn save<P, C>(
        &self,
        store: &Option<CheckpointStore>,
        spg2: &Spg2,
        process: &P,
        comm: &C,
    ) -> Result<(), CnopError>
    where
        P: Process,
        C: Communicator,
    {
        let Some(store) = store else {
            return Ok(());
        };
        if !comm.is_leader() {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            schema: SCHEMA_VERSION,
            iteration: spg2.state().iteration,
            method: spg2.record(),
            process: process.snapshot(),
        };

        match store.save(&checkpoint) {
            Ok(path) => {
                info!("saved checkpoint {path:?}");
                Ok(())
            }
            Err(error) => {
                // Losing one checkpoint degrades restartability, not the
                // running computation.
                warn!("failed to save checkpoint: {error}");
                Ok(())
            }
        }
    }
}
