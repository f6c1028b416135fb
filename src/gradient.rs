//! Distributed finite-difference gradient estimation.
//!
//! The gradient of the growth objective is estimated by forward finite
//! differences, one objective evaluation per perturbable component. The
//! evaluations are independent, so they are partitioned contiguously over
//! the worker group and each worker runs its share in an isolated fork of
//! the process (fork identifier = component index).
//!
//! A full estimate costs `n + 1` solver launches and may run for hours, so
//! each completed component is persisted as a small JSON record. After a
//! crash, the next estimate for the same iteration recovers the completed
//! components from those records and recomputes only the missing ones. The
//! records are deleted once the full gradient has been assembled.
//!
//! On any evaluation error the failing worker aborts the communication
//! group before returning, so its partners fail fast with
//! [`CommError::Aborted`] instead of deadlocking in the final barrier.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use getset::{CopyGetters, Getters, Setters};
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::{write_atomic, SCHEMA_VERSION};
use crate::comm::{CommError, Communicator};
use crate::core::{growth_objective, Process, ProcessError};

/// Default finite-difference step.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Default timeout for the barrier closing an estimate.
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(600);

/// Error of a gradient estimate.
#[derive(Debug, Error)]
pub enum GradientError {
    /// An objective evaluation failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// A collective operation failed.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// A partial record could not be written or the record directory could
    /// not be accessed.
    #[error("failed to access gradient record {path:?}")]
    Record {
        /// The record path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Contiguous share of `0..n` owned by the given rank.
///
/// The shares are near-equal (sizes differ by at most one), contiguous, and
/// together cover `0..n` exactly once.
pub fn partition(n: usize, rank: usize, size: usize) -> Range<usize> {
    debug_assert!(rank < size);

    let base = n / size;
    let extra = n % size;

    let start = rank * base + rank.min(extra);
    let len = base + usize::from(rank < extra);

    start..start + len
}

/// Durable record of one completed gradient component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    /// Schema version of this record.
    pub schema: u32,
    /// Optimizer iteration the estimate belongs to.
    pub iteration: usize,
    /// Component index.
    pub index: usize,
    /// Finite-difference gradient component.
    pub value: f64,
}

/// Finite-difference gradient estimator over a worker group.
#[derive(Debug, Clone, CopyGetters, Getters, Setters)]
pub struct GradientEstimator {
    /// Finite-difference step. Default: [`DEFAULT_EPSILON`].
    #[getset(get_copy = "pub", set = "pub")]
    epsilon: f64,
    /// Target time of the evolution.
    #[getset(get_copy = "pub", set = "pub")]
    horizon: f64,
    /// Directory for per-component restart records. `None` disables
    /// persistence (every estimate starts from scratch). Default: `None`.
    #[getset(get = "pub", set = "pub")]
    records: Option<PathBuf>,
    /// Timeout for the barrier closing an estimate. Expiry is fatal.
    /// Default: [`DEFAULT_BARRIER_TIMEOUT`].
    #[getset(get_copy = "pub", set = "pub")]
    barrier_timeout: Duration,
}

impl GradientEstimator {
    /// Initializes the estimator for the given target time with default
    /// options.
    pub fn new(horizon: f64) -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            horizon,
            records: None,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
        }
    }

    /// Estimates the gradient of the growth objective at `u`.
    ///
    /// This is a collective operation: every worker of the group must call
    /// it with the same `u` and `iteration`, and every worker receives the
    /// full gradient. On error the group is aborted before returning.
    pub fn estimate<P, C>(
        &self,
        process: &P,
        comm: &C,
        u: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>, GradientError>
    where
        P: Process,
        C: Communicator,
    {
        match self.run(process, comm, u, iteration) {
            Ok(gradient) => Ok(gradient),
            Err(error) => {
                comm.abort();
                Err(error)
            }
        }
    }

    fn run<P, C>(
        &self,
        process: &P,
        comm: &C,
        u: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>, GradientError>
    where
        P: Process,
        C: Communicator,
    {
        let n = u.len();

        // The leader evaluates the shared baseline exactly once; every
        // other worker receives it, so all ranks work with identical values.
        let mut ut = DVector::zeros(0);
        let mut j0 = 0.0;

        if comm.is_leader() {
            ut = process.proceed(self.horizon, None, None)?;
            let ut_pert = process.proceed(self.horizon, Some(u), None)?;
            j0 = growth_objective(&ut_pert, &ut)?;
            debug!("gradient baseline at iteration {iteration}: J = {j0:e}");
        }

        comm.broadcast(0, &mut ut)?;
        comm.broadcast_scalar(0, &mut j0)?;

        // Components recovered from a previous, interrupted estimate.
        // Non-recovered slots hold NaN. Only the leader reads the records;
        // the recovered values reach every worker through the broadcast.
        let mut recovered = DVector::zeros(0);
        if comm.is_leader() {
            recovered = self.load_recovered(iteration, n)?;

            let count = recovered.iter().filter(|g| g.is_finite()).count();
            if count > 0 {
                info!("recovered {count} of {n} gradient components for iteration {iteration}");
            }
        }
        comm.broadcast(0, &mut recovered)?;

        let mut contribution = DVector::zeros(n);
        let share = partition(n, comm.rank(), comm.size());
        debug!(
            "rank {} estimates components {share:?} of {n}",
            comm.rank()
        );

        for index in share {
            if recovered[index].is_finite() {
                continue;
            }

            let mut u_step = u.clone_owned();
            u_step[index] += self.epsilon;

            let ut_step = process.proceed(self.horizon, Some(&u_step), Some(index))?;
            let j_step = growth_objective(&ut_step, &ut)?;
            let value = (j_step - j0) / self.epsilon;

            self.write_record(iteration, index, value)?;
            contribution[index] = value;
        }

        // Recovered components enter the sum exactly once, through the
        // leader's contribution.
        if comm.is_leader() {
            for (index, &value) in recovered.iter().enumerate() {
                if value.is_finite() {
                    contribution[index] = value;
                }
            }
        }

        comm.barrier(self.barrier_timeout)?;
        let gradient = comm.reduce_sum(&contribution)?;

        if comm.is_leader() {
            self.clear_records(iteration);
        }

        Ok(gradient)
    }

    fn record_path(&self, dir: &Path, iteration: usize, index: usize) -> PathBuf {
        dir.join(format!("partial_{iteration:06}_{index:06}.json"))
    }

    /// Persists one completed component, atomically, so that a crash cannot
    /// leave a half-written record behind.
    fn write_record(&self, iteration: usize, index: usize, value: f64) -> Result<(), GradientError> {
        let Some(dir) = &self.records else {
            return Ok(());
        };

        let path = self.record_path(dir, iteration, index);
        let record = PartialRecord {
            schema: SCHEMA_VERSION,
            iteration,
            index,
            value,
        };

        fs::create_dir_all(dir).map_err(|source| GradientError::Record {
            path: dir.clone(),
            source,
        })?;

        // Serializing a plain record of numbers cannot fail.
        let bytes = serde_json::to_vec(&record).expect("record serialization failed");
        write_atomic(&path, &bytes).map_err(|source| GradientError::Record { path, source })
    }

    /// Loads the valid records of the given iteration into a NaN-filled
    /// vector. Corrupt or incompatible records are skipped with a warning
    /// and their components recomputed.
    fn load_recovered(&self, iteration: usize, n: usize) -> Result<DVector<f64>, GradientError> {
        let mut recovered = DVector::from_element(n, f64::NAN);

        let Some(dir) = &self.records else {
            return Ok(recovered);
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(recovered),
            Err(source) => {
                return Err(GradientError::Record {
                    path: dir.clone(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| GradientError::Record {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();

            let Some((record_iteration, index)) = parse_record_name(&path) else {
                continue;
            };
            if record_iteration != iteration || index >= n {
                continue;
            }

            let record = fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PartialRecord>(&bytes).ok());

            match record {
                Some(record) if record.schema == SCHEMA_VERSION && record.value.is_finite() => {
                    recovered[index] = record.value;
                }
                _ => warn!("skipping unreadable gradient record {path:?}"),
            }
        }

        Ok(recovered)
    }

    /// Deletes the records of a completed estimate. Failures are logged,
    /// not propagated; a leftover record is recomputed harmlessly later.
    fn clear_records(&self, iteration: usize) {
        let Some(dir) = &self.records else {
            return;
        };

        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();

            if matches!(parse_record_name(&path), Some((it, _)) if it == iteration) {
                if let Err(error) = fs::remove_file(&path) {
                    warn!("failed to remove gradient record {path:?}: {error}");
                }
            }
        }
    }
}

/// Extracts iteration and index from a `partial_<iteration>_<index>.json`
/// name.
fn parse_record_name(path: &Path) -> Option<(usize, usize)> {
    let name = path.file_name()?.to_str()?;
    let numbers = name.strip_prefix("partial_")?.strip_suffix(".json")?;
    let (iteration, index) = numbers.split_once('_')?;

    Some((iteration.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env;
    use std::thread;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    use crate::comm::{SingleProcess, ThreadGroup};
    use crate::testing::{CountingProcess, FailingProcess, LinearGrowth};

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("cnop-gradient-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn partition_covers_the_range_with_near_equal_shares() {
        for n in [0, 1, 7, 10, 64] {
            for size in [1, 2, 3, 5] {
                let shares: Vec<_> = (0..size).map(|rank| partition(n, rank, size)).collect();

                // Contiguous cover of 0..n.
                assert_eq!(shares[0].start, 0);
                assert_eq!(shares[size - 1].end, n);
                for pair in shares.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }

                // Near-equal sizes.
                let lens: Vec<_> = shares.iter().map(|share| share.len()).collect();
                let min = lens.iter().min().unwrap();
                let max = lens.iter().max().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn estimate_matches_analytic_gradient() {
        // J(u) = -||u - b||^2, so grad J = -2 (u - b).
        let basic = dvector![1.0, -2.0, 0.5, 3.0];
        let process = LinearGrowth::new(basic.clone());
        let estimator = GradientEstimator::new(1.0);

        let u = dvector![0.2, -0.1, 0.4, -0.3];
        let gradient = estimator.estimate(&process, &SingleProcess, &u, 0).unwrap();

        let analytic = -2.0 * (&u - &basic);
        for i in 0..u.len() {
            assert_abs_diff_eq!(gradient[i], analytic[i], epsilon = 1e-4);
        }
    }

    #[test]
    fn interrupted_estimate_resumes_from_records() {
        let dir = scratch("resume");
        let basic = DVector::from_element(8, 1.0);
        let u = DVector::zeros(8);

        let mut estimator = GradientEstimator::new(1.0);
        estimator.set_records(Some(dir.clone()));

        // The first attempt dies after three forked evaluations.
        let failing = FailingProcess::new(LinearGrowth::new(basic.clone()), 3);
        let error = estimator.estimate(&failing, &SingleProcess, &u, 5).unwrap_err();
        assert!(matches!(error, GradientError::Process(_)));

        // The completed components left their records behind.
        let left = fs::read_dir(&dir).unwrap().count();
        assert_eq!(left, 3);

        // The second attempt recovers them and recomputes only the rest.
        let counting = CountingProcess::new(LinearGrowth::new(basic.clone()));
        let gradient = estimator.estimate(&counting, &SingleProcess, &u, 5).unwrap();
        assert_eq!(counting.forked_evals(), 8 - 3);

        let analytic = -2.0 * (&u - &basic);
        for i in 0..u.len() {
            assert_abs_diff_eq!(gradient[i], analytic[i], epsilon = 1e-4);
        }

        // Success clears the records of the iteration.
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn records_of_other_iterations_are_ignored() {
        let dir = scratch("other-iteration");
        let basic = dvector![2.0, -1.0];
        let u = dvector![0.1, 0.1];

        let mut estimator = GradientEstimator::new(1.0);
        estimator.set_records(Some(dir.clone()));

        // A poisoned leftover from a different iteration.
        fs::create_dir_all(&dir).unwrap();
        let stale = PartialRecord {
            schema: SCHEMA_VERSION,
            iteration: 3,
            index: 0,
            value: 1e6,
        };
        fs::write(
            dir.join("partial_000003_000000.json"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let process = LinearGrowth::new(basic.clone());
        let gradient = estimator.estimate(&process, &SingleProcess, &u, 4).unwrap();

        let analytic = -2.0 * (&u - &basic);
        assert_abs_diff_eq!(gradient[0], analytic[0], epsilon = 1e-4);

        // The stale record survives untouched for its own iteration.
        assert!(dir.join("partial_000003_000000.json").exists());
    }

    #[test]
    fn worker_group_agrees_with_serial_estimate() {
        let basic = dvector![1.0, -1.0, 2.0, 0.0, -2.0, 0.5];
        let u = dvector![0.1, 0.2, -0.1, 0.3, 0.0, -0.2];

        let estimator = GradientEstimator::new(1.0);
        let serial = estimator
            .estimate(&LinearGrowth::new(basic.clone()), &SingleProcess, &u, 0)
            .unwrap();

        let group = ThreadGroup::connect(2, Duration::from_secs(5));
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                let estimator = estimator.clone();
                let process = LinearGrowth::new(basic.clone());
                let u = u.clone_owned();
                thread::spawn(move || estimator.estimate(&process, &comm, &u, 0).unwrap())
            })
            .collect();

        for handle in handles {
            let gradient = handle.join().unwrap();
            assert_eq!(gradient, serial);
        }
    }
}
