//! The optimization algorithms.

pub mod spg2;

pub use spg2::{Spg2, Spg2Error, Spg2Options, Spg2State, Spg2Status, StopReason};
