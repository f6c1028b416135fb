//! Mock processes for tests and benchmarks.
//!
//! A real [`Process`] launches an external solver; these mocks answer
//! instantly with closed-form observables so that the optimizer, the
//! gradient estimator and the restart machinery can be exercised without a
//! solver installation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::DVector;

use crate::core::{Process, ProcessError};

/// Process whose observable is the initial state itself.
///
/// Unperturbed evolutions return the stored basic state; a perturbed
/// evolution returns the perturbation as the full initial state. The growth
/// objective then reduces to `J(u) = -||u - basic||^2`, with the analytic
/// gradient `-2 (u - basic)`.
#[derive(Debug, Clone)]
pub struct LinearGrowth {
    basic: DVector<f64>,
}

impl LinearGrowth {
    /// Creates the process with the given basic state.
    pub fn new(basic: DVector<f64>) -> Self {
        Self { basic }
    }
}

impl Process for LinearGrowth {
    fn dim(&self) -> usize {
        self.basic.len()
    }

    fn proceed(
        &self,
        _t: f64,
        perturbation: Option<&DVector<f64>>,
        _fork: Option<usize>,
    ) -> Result<DVector<f64>, ProcessError> {
        Ok(match perturbation {
            Some(u) => u.clone_owned(),
            None => self.basic.clone_owned(),
        })
    }

    fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([(
            "basic".to_owned(),
            serde_json::json!(self.basic.as_slice()),
        )])
    }
}

/// Wrapper counting the evaluations of an inner process.
#[derive(Debug)]
pub struct CountingProcess<P> {
    inner: P,
    evals: AtomicUsize,
    forked_evals: AtomicUsize,
}

impl<P> CountingProcess<P> {
    /// Wraps the process with zeroed counters.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            evals: AtomicUsize::new(0),
            forked_evals: AtomicUsize::new(0),
        }
    }

    /// Total number of evaluations.
    pub fn evals(&self) -> usize {
        self.evals.load(Ordering::Relaxed)
    }

    /// Number of evaluations requested with a fork identifier.
    pub fn forked_evals(&self) -> usize {
        self.forked_evals.load(Ordering::Relaxed)
    }
}

impl<P: Process> Process for CountingProcess<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn proceed(
        &self,
        t: f64,
        perturbation: Option<&DVector<f64>>,
        fork: Option<usize>,
    ) -> Result<DVector<f64>, ProcessError> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        if fork.is_some() {
            self.forked_evals.fetch_add(1, Ordering::Relaxed);
        }

        self.inner.proceed(t, perturbation, fork)
    }

    fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.inner.snapshot()
    }

    fn restore(&self, snapshot: &BTreeMap<String, serde_json::Value>) {
        self.inner.restore(snapshot);
    }
}

/// Wrapper that fails every forked evaluation past a limit, simulating a
/// solver crash in the middle of a gradient estimate.
#[derive(Debug)]
pub struct FailingProcess<P> {
    inner: P,
    limit: usize,
    forked_evals: AtomicUsize,
}

impl<P> FailingProcess<P> {
    /// Wraps the process; the first `limit` forked evaluations succeed,
    /// every later one fails.
    pub fn new(inner: P, limit: usize) -> Self {
        Self {
            inner,
            limit,
            forked_evals: AtomicUsize::new(0),
        }
    }
}

impl<P: Process> Process for FailingProcess<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn proceed(
        &self,
        t: f64,
        perturbation: Option<&DVector<f64>>,
        fork: Option<usize>,
    ) -> Result<DVector<f64>, ProcessError> {
        if fork.is_some() && self.forked_evals.fetch_add(1, Ordering::Relaxed) >= self.limit {
            return Err(ProcessError::Custom("injected evaluation failure".into()));
        }

        self.inner.proceed(t, perturbation, fork)
    }
}
