#![warn(missing_docs)]

//! # CNOP
//!
//! A distributed driver for computing conditional nonlinear optimal
//! perturbations (CNOP) of expensive black-box simulations.
//!
//! A CNOP is the initial perturbation, bounded in magnitude, whose
//! nonlinear evolution departs the most from the unperturbed trajectory at
//! a given target time. It is the standard tool for studying predictability
//! and the fastest-growing disturbances of geophysical flows. This library
//! computes CNOPs for simulations it can only observe from the outside:
//! the model is an external executable launched per evaluation, and one
//! evaluation may run for hours.
//!
//! ## Problem
//!
//! Given the evolution `M_t` of a dynamical system and a target time `t`,
//! find the perturbation of the initial state that solves
//!
//! ```text
//! min J(u) = -||M_t(u0 + u) - M_t(u0)||^2
//!
//! subject to ||u|| <= delta
//! ```
//!
//! where the norm of the constraint is the root-mean-square norm and
//! `delta` is the physically admissible perturbation magnitude. The
//! minimization is carried out by the nonmonotone spectral projected
//! gradient method ([`algo::spg2`]) with a distributed finite-difference
//! gradient ([`gradient`]): the `n` independent objective evaluations of
//! one gradient estimate are partitioned over a group of workers
//! ([`comm`]), each running its share in an isolated fork of the
//! simulation ([`job`]).
//!
//! Runs of this size fail; the library treats that as ordinary. Every
//! accepted iteration is checkpointed ([`checkpoint`]), every completed
//! gradient component is persisted, and a restarted run resumes from the
//! latest durable state instead of repeating weeks of computation.
//!
//! ## Usage
//!
//! The simulation is any type that implements the [`Process`] trait, and
//! [`CnopDriver`] runs the whole computation:
//!
//! ```rust
//! use cnop::nalgebra::{dvector, DVector};
//! use cnop::{CnopDriver, Process, ProcessError, SingleProcess};
//!
//! // A mock whose observable is the perturbed initial state itself.
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
//! let report = CnopDriver::builder(1.0)
//!     .with_radius(1.0)
//!     .with_initial(DVector::zeros(2))
//!     .with_eps(1e-4)
//!     .build()
//!     .run(&process, &SingleProcess)?;
//!
//! println!(
//!     "optimal perturbation {} with growth {:e}",
//!     report.best_perturbation, -report.best_objective
//! );
//! # Ok(())
//! # }
//! ```
//!
//! A production process wraps an external solver: it rewrites the solver's
//! parameter file, launches the executable and polls its output files, all
//! through the building blocks in [`job`]. Workers running on threads
//! coordinate through [`ThreadGroup`]; serial runs use [`SingleProcess`].
//!
//! ## Roadmap
//!
//! Ideas for the future include adjoint-based gradients for models that
//! provide them and an MPI-backed communicator for multi-node groups.
//!
//! ## License
//!
//! Licensed under MIT.

pub mod algo;
pub mod checkpoint;
pub mod comm;
mod core;
pub mod driver;
pub mod gradient;
pub mod job;

#[cfg(feature = "testing")]
pub mod testing;
#[cfg(not(feature = "testing"))]
pub(crate) mod testing;

pub use crate::core::*;

pub use crate::algo::{Spg2, Spg2Options, StopReason};
pub use crate::comm::{Communicator, SingleProcess, ThreadGroup};
pub use crate::driver::{CnopBuilder, CnopDriver, CnopError, CnopReport};

pub use nalgebra;
