//! Collective communication context for SPMD execution.
//!
//! The optimizer and the gradient estimator are executed cooperatively by a
//! fixed-size group of workers with stable ranks `0..W`. Rank 0 is the
//! leader: it evaluates shared quantities (the unperturbed trajectory, the
//! objective baseline) exactly once and broadcasts them, so that every rank
//! bases its control flow on identical values instead of inferring them
//! independently.
//!
//! State structures never embed a communicator; the [`Communicator`] context
//! is passed explicitly into every operation that needs a collective. Two
//! implementations are provided: [`SingleProcess`] for serial runs and
//! [`ThreadGroup`] for an in-process worker group on threads.
//!
//! Every blocking wait is timeout-bounded. Expiry and participant failure
//! both poison the group, so no worker is left deadlocked waiting on a
//! partner that aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nalgebra::DVector;
use thiserror::Error;

/// Error of a collective operation.
#[derive(Debug, Error)]
pub enum CommError {
    /// A barrier did not complete within its timeout.
    #[error("barrier timed out after {timeout:?} ({arrived} of {expected} workers arrived)")]
    BarrierTimeout {
        /// The timeout that expired.
        timeout: Duration,
        /// Number of workers that arrived before expiry.
        arrived: usize,
        /// Size of the group.
        expected: usize,
    },
    /// A broadcast or reduction did not complete within the group's
    /// collective timeout.
    #[error("collective operation timed out after {0:?}")]
    Timeout(Duration),
    /// Another participant aborted the group.
    #[error("communication group was aborted by another worker")]
    Aborted,
    /// The requested root rank does not exist in the group.
    #[error("rank {root} is not a valid root for a group of size {size}")]
    InvalidRoot {
        /// The requested root rank.
        root: usize,
        /// Size of the group.
        size: usize,
    },
    /// A reduction contribution has a different length than the round's.
    /// Summing mismatched vectors would silently degrade the result, so the
    /// collective fails instead.
    #[error("reduction contribution has length {actual}, expected {expected}")]
    ShapeMismatch {
        /// Length fixed by the round's first contribution.
        expected: usize,
        /// Length of the offending contribution.
        actual: usize,
    },
}

/// Collective communication context of one worker in an SPMD group.
pub trait Communicator {
    /// Stable rank of this worker in `0..size`.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Whether this worker is the designated leader (rank 0).
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Broadcasts the vector from `root` to all workers. On return, every
    /// worker holds the root's data (receivers are resized as needed).
    fn broadcast(&self, root: usize, data: &mut DVector<f64>) -> Result<(), CommError>;

    /// Broadcasts a scalar from `root` to all workers.
    fn broadcast_scalar(&self, root: usize, value: &mut f64) -> Result<(), CommError> {
        let mut data = DVector::from_element(1, *value);
        self.broadcast(root, &mut data)?;
        *value = data[0];
        Ok(())
    }

    /// Sums the contributions of all workers element-wise. Every worker
    /// receives the full sum.
    fn reduce_sum(&self, contribution: &DVector<f64>) -> Result<DVector<f64>, CommError>;

    /// Waits until every worker in the group arrives, or fails after the
    /// timeout. Expiry is fatal for the surrounding computation.
    fn barrier(&self, timeout: Duration) -> Result<(), CommError>;

    /// Aborts the group, releasing workers blocked in a collective with
    /// [`CommError::Aborted`]. Called by a worker that encountered an
    /// unrecoverable error so that its partners terminate together with it.
    fn abort(&self);
}

/// Trivial communicator for a group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&self, root: usize, _data: &mut DVector<f64>) -> Result<(), CommError> {
        if root != 0 {
            return Err(CommError::InvalidRoot { root, size: 1 });
        }
        Ok(())
    }

    fn reduce_sum(&self, contribution: &DVector<f64>) -> Result<DVector<f64>, CommError> {
        Ok(contribution.clone_owned())
    }

    fn barrier(&self, _timeout: Duration) -> Result<(), CommError> {
        Ok(())
    }

    fn abort(&self) {}
}

#[derive(Debug, Default)]
struct GroupState {
    aborted: bool,
    // Barrier rendezvous, generation counted.
    barrier_epoch: u64,
    barrier_arrived: usize,
    // Broadcast slot. `bcast_seq` counts published broadcasts; each handle
    // tracks how many it has consumed.
    bcast_seq: u64,
    bcast_slot: Option<Vec<f64>>,
    bcast_remaining: usize,
    // Reduction round. Contributions accumulate into `red_partial`; the
    // completed sum moves to `red_result` and `red_seq` advances.
    red_seq: u64,
    red_partial: Option<Vec<f64>>,
    red_count: usize,
    red_result: Option<Vec<f64>>,
    red_remaining: usize,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    timeout: Duration,
    state: Mutex<GroupState>,
    cond: Condvar,
}

/// Shared-memory communicator for an SPMD group running on threads.
///
/// [`ThreadGroup::connect`] creates one handle per rank; each handle is
/// moved into its worker thread. Collectives rendezvous through a condition
/// variable with a bounded wait given by the group's collective timeout
/// (the barrier takes its own timeout per call).
#[derive(Debug)]
pub struct ThreadGroup {
    shared: Arc<Shared>,
    rank: usize,
    bcast_consumed: AtomicU64,
    red_consumed: AtomicU64,
}

impl ThreadGroup {
    /// Creates a connected group of given size, returning one handle per
    /// rank in rank order. `timeout` bounds every broadcast and reduction.
    pub fn connect(size: usize, timeout: Duration) -> Vec<ThreadGroup> {
        assert!(size > 0, "empty group");

        let shared = Arc::new(Shared {
            size,
            timeout,
            state: Mutex::new(GroupState::default()),
            cond: Condvar::new(),
        });

        (0..size)
            .map(|rank| ThreadGroup {
                shared: Arc::clone(&shared),
                rank,
                bcast_consumed: AtomicU64::new(0),
                red_consumed: AtomicU64::new(0),
            })
            .collect()
    }

    /// Waits on the group condition until `ready` holds, the deadline
    /// passes, or the group is aborted.
    fn wait_until<'a, F>(
        &self,
        mut guard: MutexGuard<'a, GroupState>,
        deadline: Instant,
        mut ready: F,
    ) -> Result<MutexGuard<'a, GroupState>, (MutexGuard<'a, GroupState>, bool)>
    where
        F: FnMut(&GroupState) -> bool,
    {
        loop {
            if guard.aborted {
                return Err((guard, false));
            }
            if ready(&guard) {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err((guard, true));
            }

            let (next, _) = self
                .shared
                .cond
                .wait_timeout(guard, deadline - now)
                .expect("communication group lock poisoned");
            guard = next;
        }
    }

    /// Poisons the group under the given guard and wakes everyone.
    fn poison(&self, guard: &mut MutexGuard<'_, GroupState>) {
        guard.aborted = true;
        self.shared.cond.notify_all();
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn broadcast(&self, root: usize, data: &mut DVector<f64>) -> Result<(), CommError> {
        let size = self.shared.size;
        if root >= size {
            return Err(CommError::InvalidRoot { root, size });
        }

        let timeout = self.shared.timeout;
        let deadline = Instant::now() + timeout;
        let seq = self.bcast_consumed.load(Ordering::Relaxed);

        let guard = self.shared.state.lock().expect("lock poisoned");

        if self.rank == root {
            // Wait for the previous broadcast to be fully consumed, then
            // publish.
            let mut guard = match self.wait_until(guard, deadline, |st| {
                st.bcast_seq == seq && st.bcast_slot.is_none()
            }) {
                Ok(guard) => guard,
                Err((mut guard, timed_out)) => {
                    self.poison(&mut guard);
                    return Err(if timed_out {
                        CommError::Timeout(timeout)
                    } else {
                        CommError::Aborted
                    });
                }
            };

            guard.bcast_slot = Some(data.as_slice().to_vec());
            guard.bcast_seq = seq + 1;
            guard.bcast_remaining = size - 1;
            if guard.bcast_remaining == 0 {
                guard.bcast_slot = None;
            }
            self.shared.cond.notify_all();
        } else {
            // Wait for the root to publish the broadcast we expect.
            let mut guard = match self.wait_until(guard, deadline, |st| st.bcast_seq > seq) {
                Ok(guard) => guard,
                Err((mut guard, timed_out)) => {
                    self.poison(&mut guard);
                    return Err(if timed_out {
                        CommError::Timeout(timeout)
                    } else {
                        CommError::Aborted
                    });
                }
            };

            let payload = guard
                .bcast_slot
                .as_ref()
                .expect("broadcast slot must be populated")
                .clone();
            *data = DVector::from_vec(payload);

            guard.bcast_remaining -= 1;
            if guard.bcast_remaining == 0 {
                guard.bcast_slot = None;
                self.shared.cond.notify_all();
            }
        }

        self.bcast_consumed.store(seq + 1, Ordering::Relaxed);
        Ok(())
    }

    fn reduce_sum(&self, contribution: &DVector<f64>) -> Result<DVector<f64>, CommError> {
        let size = self.shared.size;
        let timeout = self.shared.timeout;
        let deadline = Instant::now() + timeout;
        let seq = self.red_consumed.load(Ordering::Relaxed);

        let guard = self.shared.state.lock().expect("lock poisoned");

        // Deposit the contribution for the round we are about to consume.
        let mut guard = match self.wait_until(guard, deadline, |st| st.red_seq == seq) {
            Ok(guard) => guard,
            Err((mut guard, timed_out)) => {
                self.poison(&mut guard);
                return Err(if timed_out {
                    CommError::Timeout(timeout)
                } else {
                    CommError::Aborted
                });
            }
        };

        // The first deposit fixes the round's shape; a mismatched later
        // contribution fails the whole collective.
        match guard.red_partial.as_mut() {
            Some(partial) => {
                if partial.len() != contribution.len() {
                    let expected = partial.len();
                    self.poison(&mut guard);
                    return Err(CommError::ShapeMismatch {
                        expected,
                        actual: contribution.len(),
                    });
                }

                for (acc, x) in partial.iter_mut().zip(contribution.iter()) {
                    *acc += x;
                }
            }
            None => guard.red_partial = Some(contribution.as_slice().to_vec()),
        }
        guard.red_count += 1;

        if guard.red_count == size {
            guard.red_result = guard.red_partial.take();
            guard.red_count = 0;
            guard.red_seq = seq + 1;
            guard.red_remaining = size;
            self.shared.cond.notify_all();
        }

        // Collect the completed sum.
        let mut guard = match self.wait_until(guard, deadline, |st| st.red_seq > seq) {
            Ok(guard) => guard,
            Err((mut guard, timed_out)) => {
                self.poison(&mut guard);
                return Err(if timed_out {
                    CommError::Timeout(timeout)
                } else {
                    CommError::Aborted
                });
            }
        };

        let sum = guard
            .red_result
            .as_ref()
            .expect("reduction result must be populated")
            .clone();

        guard.red_remaining -= 1;
        if guard.red_remaining == 0 {
            guard.red_result = None;
            self.shared.cond.notify_all();
        }

        self.red_consumed.store(seq + 1, Ordering::Relaxed);
        Ok(DVector::from_vec(sum))
    }

    fn barrier(&self, timeout: Duration) -> Result<(), CommError> {
        let size = self.shared.size;
        let deadline = Instant::now() + timeout;

        let mut guard = self.shared.state.lock().expect("lock poisoned");
        if guard.aborted {
            return Err(CommError::Aborted);
        }

        let epoch = guard.barrier_epoch;
        guard.barrier_arrived += 1;

        if guard.barrier_arrived == size {
            guard.barrier_arrived = 0;
            guard.barrier_epoch = epoch + 1;
            self.shared.cond.notify_all();
            return Ok(());
        }

        match self.wait_until(guard, deadline, |st| st.barrier_epoch > epoch) {
            Ok(_) => Ok(()),
            Err((mut guard, timed_out)) => {
                let arrived = guard.barrier_arrived;
                self.poison(&mut guard);
                if timed_out {
                    Err(CommError::BarrierTimeout {
                        timeout,
                        arrived,
                        expected: size,
                    })
                } else {
                    Err(CommError::Aborted)
                }
            }
        }
    }

    fn abort(&self) {
        let mut guard = self.shared.state.lock().expect("lock poisoned");
        self.poison(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use nalgebra::dvector;

    #[test]
    fn single_process_collectives_are_trivial() {
        let comm = SingleProcess;

        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(comm.is_leader());

        let mut value = 3.5;
        comm.broadcast_scalar(0, &mut value).unwrap();
        assert_eq!(value, 3.5);

        let sum = comm.reduce_sum(&dvector![1.0, 2.0]).unwrap();
        assert_eq!(sum, dvector![1.0, 2.0]);

        comm.barrier(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn single_process_rejects_nonzero_root() {
        let comm = SingleProcess;
        let mut data = dvector![1.0];

        let error = comm.broadcast(1, &mut data).unwrap_err();
        assert!(matches!(error, CommError::InvalidRoot { root: 1, size: 1 }));
    }

    #[test]
    fn thread_group_broadcast_and_reduce() {
        let group = ThreadGroup::connect(3, Duration::from_secs(5));

        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    // Broadcast from the leader.
                    let mut data = if comm.is_leader() {
                        dvector![1.0, 2.0, 3.0]
                    } else {
                        DVector::zeros(0)
                    };
                    comm.broadcast(0, &mut data).unwrap();
                    assert_eq!(data, dvector![1.0, 2.0, 3.0]);

                    // Each worker contributes its rank.
                    let contribution = DVector::from_element(2, comm.rank() as f64);
                    let sum = comm.reduce_sum(&contribution).unwrap();
                    assert_eq!(sum, dvector![3.0, 3.0]);

                    comm.barrier(Duration::from_secs(5)).unwrap();
                    sum[0]
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3.0);
        }
    }

    #[test]
    fn consecutive_broadcasts_stay_ordered() {
        let group = ThreadGroup::connect(2, Duration::from_secs(5));

        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    for round in 0..10 {
                        let mut value = if comm.is_leader() { round as f64 } else { -1.0 };
                        comm.broadcast_scalar(0, &mut value).unwrap();
                        assert_eq!(value, round as f64);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn barrier_timeout_is_fatal_for_the_group() {
        let mut group = ThreadGroup::connect(2, Duration::from_secs(5));
        let straggler = group.pop().unwrap();
        let arriving = group.pop().unwrap();

        // Only one worker arrives; the barrier must expire rather than hang.
        let error = arriving.barrier(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            error,
            CommError::BarrierTimeout {
                arrived: 1,
                expected: 2,
                ..
            }
        ));

        // The group is poisoned for the straggler as well.
        let error = straggler.barrier(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(error, CommError::Aborted));
    }

    #[test]
    fn mismatched_reduction_shapes_fail_the_collective() {
        let group = ThreadGroup::connect(2, Duration::from_secs(5));

        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    // Ranks disagree on the contribution length.
                    let contribution = DVector::from_element(3 - comm.rank(), 1.0);
                    comm.reduce_sum(&contribution).unwrap_err()
                })
            })
            .collect();

        // No rank receives a degraded sum: the second depositor reports the
        // mismatch and the group is poisoned for the other.
        let errors: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(errors
            .iter()
            .any(|error| matches!(error, CommError::ShapeMismatch { .. })));
        for error in &errors {
            assert!(matches!(
                error,
                CommError::ShapeMismatch { .. } | CommError::Aborted
            ));
        }
    }

    #[test]
    fn abort_releases_blocked_workers() {
        let mut group = ThreadGroup::connect(2, Duration::from_secs(5));
        let failed = group.pop().unwrap();
        let waiting = group.pop().unwrap();

        let waiter = thread::spawn(move || waiting.barrier(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        failed.abort();

        let result = waiter.join().unwrap();
        assert!(matches!(result.unwrap_err(), CommError::Aborted));
    }
}
