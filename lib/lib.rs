#![allow(clippy::too_many_arguments)]

//! Provides solvers for the time evolution of finite-dimensional quantum
//! systems under three equation families:
//! - the Schrödinger equation, via [`sesolve`]
//! - the Lindblad master equation, via [`mesolve`]
//! - the diffusive stochastic master equation describing continuous
//!   measurement, via [`smesolve`]
//!
//! Generators are described by lazy, possibly batched, time-dependent
//! operators ([`operator::TimeOperator`]) built from constant matrices,
//! arbitrary functions of time, piecewise-constant pulses, or continuous
//! modulations of fixed matrices, and composed through a small algebra (sum,
//! scale, adjoint).
//!
//! Provides implementations for the following numerical routines:
//! - Exact propagators (cached matrix exponentials, Padé(13, 13))
//! - Forward Euler
//! - Backward Euler
//! - Adaptive Dormand-Prince 5(4) with dense output
//! - First-order Rouchon (positivity and trace preserving)
//!
//! with an optional adjoint sweep producing the gradient of final expectation
//! values with respect to the initial state.
//!
//! See [`docs`] for theoretical background.

pub mod config;
pub mod error;
pub mod operator;
pub mod batch;
pub mod equation;
pub mod integrate;
pub mod stochastic;
pub mod result;
pub mod solve;
pub mod utils;

pub mod docs;

pub use config::{ Batching, Gradient, Method, Options, Precision, SolverConfig };
pub use error::SolveError;
pub use operator::{ OperatorInput, TimeOperator };
pub use result::Evolution;
pub use solve::{ mesolve, sesolve, smesolve, Measurement };

pub(crate) const DEF_RTOL: f64 = 1e-6;
pub(crate) const DEF_ATOL: f64 = 1e-8;
pub(crate) const DEF_MAX_STEPS: usize = 100_000;
pub(crate) const DEF_SAFETY: f64 = 0.9;
pub(crate) const DEF_MIN_FACTOR: f64 = 0.2;
pub(crate) const DEF_MAX_FACTOR: f64 = 5.0;
pub(crate) const DEF_MIN_STEP: f64 = 1e-12;

/// Batched matrices, indexed as `(batch, row, column)`.
pub type Matrices = ndarray::Array3<num_complex::Complex64>;
