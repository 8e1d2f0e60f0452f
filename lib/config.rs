//! Solver configuration: shared options, integration methods, and gradient
//! algorithms, merged into a single [`SolverConfig`] that is validated once
//! per solve call.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::error::ValidationError;

/// Numeric precision of operators and states.
///
/// All arithmetic is carried out with [`C64`]; in single precision the state
/// is rounded to the nearest representable `Complex<f32>` after every step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    pub(crate) fn round_inplace<D>(self, a: &mut nd::Array<C64, D>)
    where D: nd::Dimension
    {
        if self == Self::Single {
            a.mapv_inplace(|z| {
                C64::new(z.re as f32 as f64, z.im as f32 as f64)
            });
        }
    }
}

/// Policy used to reconcile the batch sizes of independent inputs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Batching {
    /// Every combination of batch elements is solved (outer product).
    #[default]
    Cartesian,
    /// Batch elements are paired up; sizes must agree or be 1.
    Zip,
}

/// Options shared by all solvers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Store the state at every save time (`true`) or only the final state
    /// (`false`). Expectation values are always stored at every save time.
    pub save_states: bool,
    /// Report progress at `info` level instead of `debug`.
    pub verbose: bool,
    /// Numeric precision.
    pub precision: Precision,
    /// Batching policy.
    pub batching: Batching,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            save_states: true,
            verbose: true,
            precision: Precision::Double,
            batching: Batching::Cartesian,
        }
    }
}

/// Integration method.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Method {
    /// Explicitly compute the propagator exponential between save times.
    /// Requires a time-independent generator.
    Propagator,
    /// Fixed step forward Euler; intended for testing.
    Euler {
        /// Step size.
        dt: f64,
    },
    /// Fixed step backward (implicit) Euler.
    BackwardEuler {
        /// Step size.
        dt: f64,
    },
    /// Adaptive Dormand-Prince 5(4).
    Dopri5 {
        /// Relative tolerance (default: `1e-6`).
        rtol: Option<f64>,
        /// Absolute tolerance (default: `1e-8`).
        atol: Option<f64>,
        /// Maximum number of step attempts (default: `100_000`).
        max_steps: Option<usize>,
        /// Safety factor applied to the optimal step size (default: `0.9`).
        safety_factor: Option<f64>,
        /// Minimum step shrink factor (default: `0.2`).
        min_factor: Option<f64>,
        /// Maximum step growth factor (default: `5.0`).
        max_factor: Option<f64>,
        /// Maximum step size (default: unbounded).
        max_step: Option<f64>,
        /// Step size floor below which integration fails (default: `1e-12`).
        min_step: Option<f64>,
        /// Initial step size (default: chosen automatically).
        h0: Option<f64>,
    },
    /// Fixed step, first-order Rouchon scheme; preserves positivity and
    /// trace of the density matrix.
    Rouchon1 {
        /// Step size.
        dt: f64,
    },
}

impl Default for Method {
    fn default() -> Self { Self::dopri5() }
}

impl Method {
    /// `Dopri5` with all parameters set to their defaults.
    pub fn dopri5() -> Self {
        Self::Dopri5 {
            rtol: None,
            atol: None,
            max_steps: None,
            safety_factor: None,
            min_factor: None,
            max_factor: None,
            max_step: None,
            min_step: None,
            h0: None,
        }
    }

    /// `Dopri5` with default parameters except for the tolerances.
    pub fn dopri5_tol(rtol: f64, atol: f64) -> Self {
        match Self::dopri5() {
            Self::Dopri5 {
                max_steps,
                safety_factor,
                min_factor,
                max_factor,
                max_step,
                min_step,
                h0,
                ..
            } => Self::Dopri5 {
                rtol: Some(rtol),
                atol: Some(atol),
                max_steps,
                safety_factor,
                min_factor,
                max_factor,
                max_step,
                min_step,
                h0,
            },
            other => other,
        }
    }

    /// Return `true` if `self` is `Propagator`.
    pub fn is_propagator(&self) -> bool { matches!(self, Self::Propagator) }

    /// Return `true` if `self` is `Rouchon1`.
    pub fn is_rouchon1(&self) -> bool { matches!(self, Self::Rouchon1 { .. }) }

    /// Name of the method, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Propagator => "Propagator",
            Self::Euler { .. } => "Euler",
            Self::BackwardEuler { .. } => "BackwardEuler",
            Self::Dopri5 { .. } => "Dopri5",
            Self::Rouchon1 { .. } => "Rouchon1",
        }
    }

    /// Fixed step size, if any.
    pub fn fixed_dt(&self) -> Option<f64> {
        match self {
            Self::Euler { dt }
            | Self::BackwardEuler { dt }
            | Self::Rouchon1 { dt } => Some(*dt),
            _ => None,
        }
    }

    fn check_params(&self) -> Result<(), ValidationError> {
        if let Some(dt) = self.fixed_dt() {
            ValidationError::check_positive("dt", dt)?;
        }
        if let Self::Dopri5 {
            rtol,
            atol,
            safety_factor,
            min_factor,
            max_factor,
            max_step,
            min_step,
            h0,
            ..
        } = self {
            let named = [
                ("rtol", rtol),
                ("atol", atol),
                ("safety_factor", safety_factor),
                ("min_factor", min_factor),
                ("max_factor", max_factor),
                ("max_step", max_step),
                ("min_step", min_step),
                ("h0", h0),
            ];
            for (name, val) in named.into_iter() {
                if let Some(x) = val {
                    ValidationError::check_positive(name, *x)?;
                }
            }
        }
        Ok(())
    }
}

/// Gradient algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Gradient {
    /// Integrate the Heisenberg-picture adjoint equation backward in time
    /// after the forward pass, producing the gradient of every final
    /// expectation value with respect to the initial state.
    ///
    /// Only the initial state is differentiated: gradients with respect to
    /// parameters of the Hamiltonian or jump operators are not computed. The
    /// backward sweep needs no states from the forward pass, since the
    /// adjoint equation is linear and independent of the state.
    Adjoint,
}

impl Gradient {
    /// Name of the gradient algorithm, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adjoint => "Adjoint",
        }
    }
}

/// Equation family solved by an entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    /// Schrödinger equation (`sesolve`).
    Unitary,
    /// Lindblad master equation (`mesolve`).
    Lindblad,
    /// Diffusive stochastic master equation (`smesolve`).
    Stochastic,
}

impl Family {
    /// Name of the family, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unitary => "sesolve",
            Self::Lindblad => "mesolve",
            Self::Stochastic => "smesolve",
        }
    }

    fn supported_methods(&self) -> &'static [&'static str] {
        match self {
            Self::Unitary
                => &["Propagator", "Euler", "BackwardEuler", "Dopri5"],
            Self::Lindblad
                => &["Propagator", "Euler", "BackwardEuler", "Dopri5", "Rouchon1"],
            Self::Stochastic => &["Euler", "Rouchon1"],
        }
    }

    fn supported_gradients(&self, method: &Method) -> &'static [&'static str] {
        match (self, method) {
            (Self::Stochastic, _) => &[],
            (_, Method::Euler { .. })
            | (_, Method::BackwardEuler { .. })
            | (_, Method::Dopri5 { .. }) => &["Adjoint"],
            _ => &[],
        }
    }
}

fn join_names(names: &[&str]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Complete configuration for a single solve call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverConfig {
    /// Integration method.
    pub method: Method,
    /// Gradient algorithm, if any.
    pub gradient: Option<Gradient>,
    /// Shared options.
    pub options: Options,
}

impl SolverConfig {
    /// Merge a method, gradient, and options.
    pub fn new(method: Method, gradient: Option<Gradient>, options: Options)
        -> Self
    {
        Self { method, gradient, options }
    }

    /// Check that the method and gradient are available for `family` and
    /// that all method parameters are valid.
    pub fn validate(&self, family: Family) -> Result<(), ValidationError> {
        let supported = family.supported_methods();
        if !supported.contains(&self.method.name()) {
            return Err(ValidationError::UnsupportedMethod {
                family: family.name(),
                method: self.method.name(),
                supported: join_names(supported),
            });
        }
        if let Some(gradient) = self.gradient {
            let supported = family.supported_gradients(&self.method);
            if !supported.contains(&gradient.name()) {
                return Err(ValidationError::UnsupportedGradient {
                    family: family.name(),
                    method: self.method.name(),
                    gradient: gradient.name(),
                    supported: join_names(supported),
                });
            }
        }
        self.method.check_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stochastic_rejects_dopri5() {
        let config = SolverConfig::new(Method::dopri5(), None, Options::default());
        let err = config.validate(Family::Stochastic).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Dopri5"));
        assert!(msg.contains("Euler, Rouchon1"));
    }

    #[test]
    fn unitary_rejects_rouchon() {
        let config = SolverConfig::new(
            Method::Rouchon1 { dt: 1e-3 }, None, Options::default());
        assert!(matches!(
            config.validate(Family::Unitary),
            Err(ValidationError::UnsupportedMethod { .. }),
        ));
        assert!(config.validate(Family::Lindblad).is_ok());
    }

    #[test]
    fn propagator_has_no_adjoint() {
        let config = SolverConfig::new(
            Method::Propagator, Some(Gradient::Adjoint), Options::default());
        let err = config.validate(Family::Unitary).unwrap_err();
        assert!(err.to_string().contains("supported gradients: none"));
    }

    #[test]
    fn bad_parameters() {
        let config = SolverConfig::new(
            Method::Euler { dt: 0.0 }, None, Options::default());
        assert!(matches!(
            config.validate(Family::Lindblad),
            Err(ValidationError::NonPositive("dt", _)),
        ));
        let config = SolverConfig::new(
            Method::dopri5_tol(-1.0, 1e-8), None, Options::default());
        assert!(matches!(
            config.validate(Family::Unitary),
            Err(ValidationError::NonPositive("rtol", _)),
        ));
    }

    #[test]
    fn single_precision_rounding() {
        let mut a = nd::array![C64::new(0.1, 1.0 / 3.0)];
        Precision::Double.round_inplace(&mut a);
        assert_eq!(a[0], C64::new(0.1, 1.0 / 3.0));
        Precision::Single.round_inplace(&mut a);
        assert_eq!(a[0].re, 0.1_f32 as f64);
        assert_ne!(a[0].re, 0.1);
    }
}
