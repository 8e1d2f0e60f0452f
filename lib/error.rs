//! Collection of all error types.
//!
//! All errors derive [`thiserror::Error`], making them composable when allowed
//! and compatible with application code using [`anyhow`][anyhow].
//!
//! Errors fall into three groups:
//! - [`OperatorError`]: raised while building or composing a
//!   [`TimeOperator`][crate::operator::TimeOperator].
//! - [`ValidationError`]: raised while checking solver inputs, before any
//!   stepping takes place.
//! - [`NumericalError`]: raised while stepping; these abort the run and no
//!   partial result is returned.
//!
//! [anyhow]: https://crates.io/crates/anyhow

use ndarray_linalg::error::LinalgError;
use thiserror::Error;
use crate::config::Precision;

/// Returned when building or composing time-dependent operators.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Returned when two operators with incompatible shapes are combined.
    #[error(
        "cannot combine `{lhs}` with shape {lhs_shape:?} and `{rhs}` with \
        shape {rhs_shape:?}"
    )]
    ShapeMismatch {
        lhs: String,
        lhs_shape: Vec<usize>,
        rhs: String,
        rhs_shape: Vec<usize>,
    },

    /// Returned when two operators declaring different precisions are
    /// combined.
    #[error(
        "cannot combine `{lhs}` with precision {lhs_precision:?} and `{rhs}` \
        with precision {rhs_precision:?}"
    )]
    PrecisionMismatch {
        lhs: String,
        lhs_precision: Precision,
        rhs: String,
        rhs_precision: Precision,
    },

    /// Returned when a matrix argument is not of shape `(..., n, n)`.
    #[error("`{0}` must have shape (..., n, n); got {1:?}")]
    NotSquare(String, Vec<usize>),

    /// Returned when a factory function evaluated at `t = 0` does not produce
    /// an array of the expected shape.
    #[error("`{name}` must return an array of shape {expected}; got {got:?} at t = 0")]
    BadFactory {
        name: String,
        expected: String,
        got: Vec<usize>,
    },

    /// Returned when a breakpoint sequence is empty, unsorted, or non-finite.
    #[error("breakpoints of `{0}` must be finite, strictly increasing, and at least 2 long")]
    BadBreakpoints(String),

    /// Returned when piecewise-constant values do not match the breakpoints.
    #[error("`{name}` has {breakpoints} breakpoints but {values} interval values")]
    ValuesLength {
        name: String,
        breakpoints: usize,
        values: usize,
    },

    /// Returned when a reshape would change the number of batch elements.
    #[error("cannot reshape `{name}` with batch shape {from:?} to {to:?}")]
    BadReshape {
        name: String,
        from: Vec<usize>,
        to: Vec<usize>,
    },
}

/// Returned when solver inputs fail eager checks.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Returned when a method is not available for an equation family.
    #[error("method {method} is not supported by {family} (supported methods: {supported})")]
    UnsupportedMethod {
        family: &'static str,
        method: &'static str,
        supported: String,
    },

    /// Returned when a gradient algorithm is not available for a method.
    #[error("gradient {gradient} is not supported by method {method} in {family} (supported gradients: {supported})")]
    UnsupportedGradient {
        family: &'static str,
        method: &'static str,
        gradient: &'static str,
        supported: String,
    },

    /// Returned when batch sizes disagree under zip batching.
    #[error("expected all batch dimensions to be the same, but got {0}")]
    BatchMismatch(String),

    /// Returned when an argument has the wrong shape.
    #[error("`{name}` must have shape {expected}; got {got:?}")]
    Shape {
        name: String,
        expected: String,
        got: Vec<usize>,
    },

    /// Returned when a time array is empty, unsorted, negative, or
    /// non-finite.
    #[error("`{0}` must be a non-empty, finite, non-negative, and strictly increasing sequence")]
    BadTimes(&'static str),

    /// Returned when measurement boundaries extend past the last save time.
    #[error("`tmeas` must end no later than the last save time {tsave}; got {tmeas}")]
    MeasurementRange { tmeas: f64, tsave: f64 },

    /// Returned when a measurement efficiency lies outside `[0, 1]`.
    #[error("`etas` must contain values between 0 and 1; got {0}")]
    BadEfficiency(f64),

    /// Returned when the number of efficiencies does not match the number of
    /// jump operators.
    #[error("`etas` must have the same length as `jump_ops` ({jump_ops}); got {etas}")]
    EfficiencyCount { jump_ops: usize, etas: usize },

    /// Returned when all measurement efficiencies are zero.
    #[error("`etas` must contain at least one non-zero value, otherwise consider using `mesolve`")]
    NoMonitoredChannel,

    /// Returned when an equation requiring jump operators gets none.
    #[error("`jump_ops` must be a non-empty list, otherwise consider using {0}")]
    NoJumpOps(&'static str),

    /// Returned when a jump operator is time-dependent.
    #[error("`{0}` is time-dependent; time-dependent jump operators are not yet supported")]
    TimeDependentJumpOp(String),

    /// Returned when the propagator method is used with a time-dependent
    /// generator.
    #[error("method Propagator requires a time-independent generator; `{0}` depends on time")]
    TimeDependentGenerator(String),

    /// Returned when a step size, tolerance, or similar parameter is not
    /// strictly positive.
    #[error("`{0}` must be greater than 0; got {1}")]
    NonPositive(&'static str, f64),

    /// Returned when zero stochastic trajectories are requested.
    #[error("`ntrajs` must be greater than 0")]
    NoTrajectories,

    /// Returned when the adjoint gradient is requested without observables.
    #[error("the adjoint gradient requires at least one operator in `exp_ops`")]
    NoObservables,

    /// Returned when an operator declares a precision different from the
    /// solver configuration.
    #[error("`{name}` has precision {got:?}, but the solver is configured for {expected:?}")]
    Precision {
        name: String,
        expected: Precision,
        got: Precision,
    },

    /// [`OperatorError`]
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),
}

impl ValidationError {
    pub(crate) fn check_positive(name: &'static str, x: f64)
        -> Result<(), Self>
    {
        (x > 0.0 && x.is_finite()).then_some(()).ok_or(Self::NonPositive(name, x))
    }

    pub(crate) fn check_times(name: &'static str, t: &[f64], allow_empty: bool)
        -> Result<(), Self>
    {
        if t.is_empty() {
            return allow_empty.then_some(()).ok_or(Self::BadTimes(name));
        }
        let ok
            = t.iter().all(|tk| tk.is_finite())
            && t[0] >= 0.0
            && t.iter().zip(t.iter().skip(1)).all(|(tk, tkp1)| tkp1 > tk);
        ok.then_some(()).ok_or(Self::BadTimes(name))
    }

    pub(crate) fn check_efficiency(eta: f64) -> Result<(), Self> {
        (0.0..=1.0).contains(&eta).then_some(()).ok_or(Self::BadEfficiency(eta))
    }
}

/// Returned while stepping.
#[derive(Debug, Error)]
pub enum NumericalError {
    /// Returned when the state contains `NaN` or infinite entries.
    #[error("state became non-finite after t = {0}")]
    NonFinite(f64),

    /// Returned when the adaptive step size falls below its floor.
    #[error("step size {dt:e} fell below the minimum at t = {t}; the problem may be stiff or unstable")]
    StepUnderflow { t: f64, dt: f64 },

    /// Returned when the adaptive integrator exceeds its step budget.
    #[error("maximum number of steps ({max}) reached at t = {t}")]
    MaxSteps { t: f64, max: usize },

    /// [`LinalgError`].
    #[error("linalg error: {0}")]
    Linalg(#[from] LinalgError),
}

/// Umbrella error returned from the solver entry points.
#[derive(Debug, Error)]
pub enum SolveError {
    /// [`ValidationError`]
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// [`OperatorError`]
    #[error("construction error: {0}")]
    Operator(#[from] OperatorError),

    /// [`NumericalError`]
    #[error("numerical error: {0}")]
    Numerical(#[from] NumericalError),
}

impl From<LinalgError> for SolveError {
    fn from(err: LinalgError) -> Self { Self::Numerical(err.into()) }
}

