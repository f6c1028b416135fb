//! Core abstractions and types.
//!
//! *Users* are mainly interested in implementing the [`Process`] trait for
//! their external solver and choosing the constraint [`Ball`]. The objective
//! helpers ([`objective`] and [`growth_objective`]) define how a pair of
//! observables is turned into the scalar that the optimizer minimizes.

mod ball;
mod process;

pub use ball::*;
pub use process::*;
