use std::collections::BTreeMap;

use nalgebra::DVector;
use thiserror::Error;

use crate::job::JobError;

/// Error encountered while evaluating a [`Process`].
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failure of the external job backing the evaluation.
    #[error(transparent)]
    Job(#[from] JobError),
    /// The observable has a different length than expected.
    #[error("observable has length {actual}, expected {expected}")]
    ShapeMismatch {
        /// Expected length of the observable.
        expected: usize,
        /// Actual length of the observable.
        actual: usize,
    },
    /// An invalid value (NaN, positive or negative infinity) occurred in the
    /// observable or the objective.
    #[error("invalid value encountered in the observable")]
    InvalidValue,
    /// A custom error specific to the process.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

/// The black-box dynamical system.
///
/// A process evolves the system to a target time, optionally with an initial
/// perturbation injected, and returns the resulting observable. Evaluations
/// are expensive -- typically one launch of an external solver per call -- so
/// the interface is deliberately narrow.
///
/// ## Contract
///
/// * `proceed(t, None, _)` must be referentially consistent: repeated calls
///   with the same `t` may be served from a cache (see
///   [`BasicStateCache`](crate::job::BasicStateCache)) and every caller must
///   observe the same observable.
/// * The `fork` identifier, when given, requests an isolated execution
///   context so that the evaluation can run concurrently with others (see
///   [`ForkContext`](crate::job::ForkContext)).
///
/// ## Implementing a process
///
/// ```rust
/// use cnop::nalgebra::DVector;
/// use cnop::{Process, ProcessError};
///
/// /// Observable is the perturbed state itself.
/// struct Identity {
///     basic: DVector<f64>,
/// }
///
/// impl Process for Identity {
///     fn dim(&self) -> usize {
///         self.basic.len()
///     }
///
///     fn proceed(
///         &self,
///         _t: f64,
///         perturbation: Option<&DVector<f64>>,
///         _fork: Option<usize>,
///     ) -> Result<DVector<f64>, ProcessError> {
///         Ok(match perturbation {
///             Some(u) => u.clone(),
///             None => self.basic.clone(),
///         })
///     }
/// }
/// ```
pub trait Process {
    /// Number of perturbable components of the initial state.
    fn dim(&self) -> usize;

    /// Evolves the system to time `t`, optionally injecting `perturbation`
    /// into the initial state, and returns the observable.
    fn proceed(
        &self,
        t: f64,
        perturbation: Option<&DVector<f64>>,
        fork: Option<usize>,
    ) -> Result<DVector<f64>, ProcessError>;

    /// Minimal durable state of the process needed to resume after a
    /// restart, as a flat name-to-value mapping. Absent values are encoded
    /// as explicit `null`, never omitted.
    ///
    /// The default implementation has no durable state.
    fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }

    /// Restores the durable state captured by [`Process::snapshot`].
    ///
    /// Resources that are not representable as plain values (open file
    /// handles, communicators, callables) are never part of a snapshot;
    /// re-supplying them after a restart is the caller's responsibility.
    fn restore(&self, _snapshot: &BTreeMap<String, serde_json::Value>) {}
}

/// Computes the growth objective from a perturbed and an unperturbed
/// observable: the negated squared difference `-||ut_pert - ut||^2`.
///
/// Lower is better; the perturbation maximizing growth minimizes this value.
pub fn growth_objective(ut_pert: &DVector<f64>, ut: &DVector<f64>) -> Result<f64, ProcessError> {
    if ut_pert.len() != ut.len() {
        return Err(ProcessError::ShapeMismatch {
            expected: ut.len(),
            actual: ut_pert.len(),
        });
    }

    let j = -(ut_pert - ut).norm_squared();

    if !j.is_finite() {
        return Err(ProcessError::InvalidValue);
    }

    Ok(j)
}

/// Evaluates the growth objective of `u_pert` at horizon `t` by evolving
/// both the unperturbed and the perturbed trajectory through the process.
///
/// The unperturbed trajectory is requested through the regular interface, so
/// a caching process serves it without relaunching.
pub fn objective<P: Process>(process: &P, u_pert: &DVector<f64>, t: f64) -> Result<f64, ProcessError> {
    let ut = process.proceed(t, None, None)?;
    let ut_pert = process.proceed(t, Some(u_pert), None)?;
    growth_objective(&ut_pert, &ut)
}
