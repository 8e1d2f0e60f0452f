//! Solver entry points.
//!
//! Each entry point validates all of its inputs eagerly, reconciles their
//! batch shapes into a [`BatchLayout`], runs the configured integrator, and
//! assembles an [`Evolution`]. Validation errors never reach the integrators,
//! and numerical errors abort the solve without a partial result.
//!
//! Initial states are arrays of shape `(..., n, 1)` (kets) or `(..., n, n)`
//! (density matrices), where the leading axes form the state's batch shape.
//! [`mesolve`] and [`smesolve`] convert kets to density matrices.

use std::time::SystemTime;
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    Matrices,
    batch::{ BatchArg, BatchLayout, BatchSpec },
    config::{ Family, Gradient, Options, SolverConfig },
    equation::{ EquationKind, MasterEquation },
    error::{ SolveError, ValidationError },
    integrate::{ integrate, SolveStats },
    operator::TimeOperator,
    result::{ Evolution, Recorder },
    stochastic::integrate_sme,
    utils::todm,
};

pub type SolveResult<T> = Result<T, SolveError>;

/// Measurement settings for [`smesolve`].
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    /// Efficiency of every jump operator, in `[0, 1]`.
    pub etas: Vec<f64>,
    /// Boundaries of the measurement intervals (default: the save times).
    pub tmeas: Option<Vec<f64>>,
    /// Number of trajectories.
    pub ntrajs: usize,
    /// Seed for the Wiener increments (default: system entropy).
    pub seed: Option<u64>,
}

impl Measurement {
    /// A single trajectory with the given efficiencies.
    pub fn new(etas: &[f64]) -> Self {
        Self { etas: etas.to_vec(), tmeas: None, ntrajs: 1, seed: None }
    }

    pub fn with_tmeas(mut self, tmeas: &[f64]) -> Self {
        self.tmeas = Some(tmeas.to_vec());
        self
    }

    pub fn with_ntrajs(mut self, ntrajs: usize) -> Self {
        self.ntrajs = ntrajs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

fn check_operator(op: &TimeOperator, n: usize, options: &Options)
    -> Result<(), ValidationError>
{
    if op.n() != n {
        return Err(ValidationError::Shape {
            name: op.name().to_string(),
            expected: format!("(..., {n}, {n})"),
            got: op.shape(),
        });
    }
    (op.precision() == options.precision).then_some(())
        .ok_or_else(|| ValidationError::Precision {
            name: op.name().to_string(),
            expected: options.precision,
            got: op.precision(),
        })
}

fn check_exp_ops(exp_ops: &[nd::Array2<C64>], n: usize)
    -> Result<(), ValidationError>
{
    for e in exp_ops.iter() {
        if e.dim() != (n, n) {
            return Err(ValidationError::Shape {
                name: "exp_ops".to_string(),
                expected: format!("({n}, {n})"),
                got: e.shape().to_vec(),
            });
        }
    }
    Ok(())
}

// evaluate all jump operators, broadcast to their common batch shape
fn jump_matrices(ops: &[TimeOperator], n: usize, options: &Options)
    -> Result<(Vec<usize>, Vec<Matrices>), ValidationError>
{
    let mut batch: Vec<usize> = Vec::new();
    for op in ops.iter() {
        op.is_constant().then_some(())
            .ok_or_else(|| ValidationError::TimeDependentJumpOp(op.name().to_string()))?;
        check_operator(op, n, options)?;
        if op.batch_size() == 1 { continue; }
        if batch.iter().product::<usize>() == 1 {
            batch = op.batch_shape().to_vec();
        } else if batch != op.batch_shape() {
            return Err(ValidationError::Shape {
                name: op.name().to_string(),
                expected: format!("batch shape {:?} or a single element", batch),
                got: op.batch_shape().to_vec(),
            });
        }
    }
    let bl: usize = batch.iter().product();
    let mats: Vec<Matrices>
        = ops.iter()
        .map(|op| {
            let a = op.evaluate(0.0);
            if a.shape()[0] == bl {
                (*a).clone()
            } else {
                a.select(nd::Axis(0), &vec![0; bl])
            }
        })
        .collect();
    Ok((batch, mats))
}

// split `(..., n, m)` into its batch shape and a flat `(b, n, m)` array
fn flatten_state(name: &str, y: &nd::ArrayViewD<C64>, n: usize, allow_dm: bool)
    -> Result<(Vec<usize>, Matrices), ValidationError>
{
    let shape = y.shape();
    let ndim = shape.len();
    let ok
        = ndim >= 2
        && shape[ndim - 2] == n
        && (shape[ndim - 1] == 1 || (allow_dm && shape[ndim - 1] == n));
    if !ok {
        let expected
            = if allow_dm {
                format!("(..., {n}, 1) or (..., {n}, {n})")
            } else {
                format!("(..., {n}, 1)")
            };
        return Err(ValidationError::Shape {
            name: name.to_string(),
            expected,
            got: shape.to_vec(),
        });
    }
    let batch = shape[..ndim - 2].to_vec();
    let b: usize = batch.iter().product();
    let m = shape[ndim - 1];
    let flat = nd::Array3::from_shape_fn((b, n, m), |(c, i, j)| {
        let mut idx = vec![0; ndim];
        let mut rem = c;
        for (k, size) in batch.iter().enumerate().rev() {
            idx[k] = rem % size;
            rem /= size;
        }
        idx[ndim - 2] = i;
        idx[ndim - 1] = j;
        y[idx.as_slice()]
    });
    Ok((batch, flat))
}

fn log_start(family: Family, config: &SolverConfig, layout: &BatchLayout) {
    let level
        = if config.options.verbose { log::Level::Info } else { log::Level::Debug };
    log::log!(
        level,
        "{}: {} over {} batch element(s) (batch shape {:?})",
        family.name(),
        config.method.name(),
        layout.len(),
        layout.out_shape(),
    );
}

/// Solve the Schrödinger equation `d|ψ⟩/dt = -i H |ψ⟩`.
///
/// `psi0` has shape `(..., n, 1)`. Expectation values of every element of
/// `exp_ops` are recorded at every save time.
pub fn sesolve<S, D>(
    h: &TimeOperator,
    psi0: &nd::ArrayBase<S, D>,
    tsave: &[f64],
    exp_ops: &[nd::Array2<C64>],
    config: &SolverConfig,
) -> SolveResult<Evolution>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    solve_deterministic(
        Family::Unitary, h, &[], "psi0", psi0.view().into_dyn(), tsave, exp_ops, config)
}

/// Solve the Lindblad master equation
/// ```text
/// dρ/dt = -i [H, ρ] + Σ_k (L_k ρ L_k† - ½ {L_k† L_k, ρ})
/// ```
///
/// Jump operators must be time-independent and have batch shapes that are
/// equal or hold a single element.
pub fn mesolve<S, D>(
    h: &TimeOperator,
    jump_ops: &[TimeOperator],
    rho0: &nd::ArrayBase<S, D>,
    tsave: &[f64],
    exp_ops: &[nd::Array2<C64>],
    config: &SolverConfig,
) -> SolveResult<Evolution>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    solve_deterministic(
        Family::Lindblad, h, jump_ops, "rho0", rho0.view().into_dyn(), tsave, exp_ops,
        config,
    )
}

fn solve_deterministic(
    family: Family,
    h: &TimeOperator,
    jump_ops: &[TimeOperator],
    y0_name: &str,
    y0: nd::ArrayViewD<C64>,
    tsave: &[f64],
    exp_ops: &[nd::Array2<C64>],
    config: &SolverConfig,
) -> SolveResult<Evolution>
{
    let start_time = SystemTime::now();
    config.validate(family)?;
    ValidationError::check_times("tsave", tsave, false)?;
    let n = h.n();
    check_operator(h, n, &config.options)?;
    let lindblad = family == Family::Lindblad;
    if lindblad && jump_ops.is_empty() {
        return Err(ValidationError::NoJumpOps("sesolve").into());
    }
    if config.method.is_propagator() && !h.is_constant() {
        return Err(ValidationError::TimeDependentGenerator(h.name().to_string()).into());
    }
    if config.gradient.is_some() && exp_ops.is_empty() {
        return Err(ValidationError::NoObservables.into());
    }
    let (l_batch, jumps) = jump_matrices(jump_ops, n, &config.options)?;
    check_exp_ops(exp_ops, n)?;
    let (y_batch, mut y_flat) = flatten_state(y0_name, &y0, n, lindblad)?;
    if lindblad { y_flat = todm(y_flat); }

    let layout = BatchLayout::new(&BatchSpec {
        h: BatchArg::new(h.name(), h.batch_shape()),
        l: lindblad.then(|| BatchArg::new("jump_ops", &l_batch)),
        y: BatchArg::new(y0_name, &y_batch),
        ntrajs: None,
        policy: config.options.batching,
    })?;
    log_start(family, config, &layout);
    let kind = if lindblad { EquationKind::Lindblad } else { EquationKind::Schrodinger };
    let eq = MasterEquation::new(kind, h.clone(), jumps.clone(), &layout);
    let y0 = layout.gather(&y_flat);
    let (nbatch, _, m) = y0.dim();

    let mut recorder = Recorder::new(
        config.options.save_states, exp_ops, nbatch, tsave.len(), n, m);
    let mut stats = SolveStats::default();
    integrate(
        &eq, &config.method, y0, tsave, &config.options, &mut stats,
        &mut |k, _, y| recorder.record(k, y),
    )?;
    stats.nfev = eq.nfev();
    let res = Evolution::assemble(recorder, &layout, tsave, *config, stats, start_time);

    match config.gradient {
        Some(Gradient::Adjoint) => {
            let t_final = tsave[tsave.len() - 1];
            let grads = adjoint_gradients(
                h, jumps, &layout, exp_ops, t_final, config, &mut stats)?;
            Ok(res.with_gradients(&layout, grads, stats))
        },
        None => Ok(res),
    }
}

// integrate the Heisenberg equation from every observable at `t_final` back
// to `t = 0`
fn adjoint_gradients(
    h: &TimeOperator,
    jumps: Vec<Matrices>,
    layout: &BatchLayout,
    exp_ops: &[nd::Array2<C64>],
    t_final: f64,
    config: &SolverConfig,
    stats: &mut SolveStats,
) -> SolveResult<nd::Array4<C64>>
{
    let eq = MasterEquation::new(EquationKind::Heisenberg { t_final }, h.clone(), jumps, layout);
    let n = h.n();
    let nbatch = layout.len();
    let opts = Options { verbose: false, ..config.options };
    let mut grads: nd::Array4<C64> = nd::Array4::zeros((nbatch, exp_ops.len(), n, n));
    for (k, e) in exp_ops.iter().enumerate() {
        let x0: Matrices = nd::Array3::from_shape_fn((nbatch, n, n), |(_, i, j)| e[[i, j]]);
        let x = integrate(
            &eq, &config.method, x0, &[t_final], &opts, stats, &mut |_, _, _| { })?;
        grads.slice_mut(nd::s![.., k, .., ..]).assign(&x);
    }
    stats.nfev += eq.nfev();
    log::debug!("adjoint sweep done for {} observable(s)", exp_ops.len());
    Ok(grads)
}

/// Solve the diffusive stochastic master equation for the jump operators
/// `jump_ops`, of which those with non-zero efficiency are continuously
/// measured.
///
/// The state is integrated from `t = 0` to the last save time. The returned
/// measurement record holds, for every trajectory and monitored channel, the
/// measured signal averaged over every interval of `measurement.tmeas`.
pub fn smesolve<S, D>(
    h: &TimeOperator,
    jump_ops: &[TimeOperator],
    rho0: &nd::ArrayBase<S, D>,
    tsave: &[f64],
    exp_ops: &[nd::Array2<C64>],
    measurement: &Measurement,
    config: &SolverConfig,
) -> SolveResult<Evolution>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    let start_time = SystemTime::now();
    config.validate(Family::Stochastic)?;
    ValidationError::check_times("tsave", tsave, false)?;
    let tmeas: Vec<f64>
        = measurement.tmeas.clone().unwrap_or_else(|| tsave.to_vec());
    ValidationError::check_times("tmeas", &tmeas, true)?;
    if let (Some(&tm), Some(&ts)) = (tmeas.last(), tsave.last()) {
        if tm > ts {
            return Err(ValidationError::MeasurementRange { tmeas: tm, tsave: ts }.into());
        }
    }
    if jump_ops.is_empty() {
        return Err(ValidationError::NoJumpOps("sesolve").into());
    }
    let etas = &measurement.etas;
    if etas.len() != jump_ops.len() {
        return Err(ValidationError::EfficiencyCount {
            jump_ops: jump_ops.len(),
            etas: etas.len(),
        }.into());
    }
    for eta in etas.iter() {
        ValidationError::check_efficiency(*eta)?;
    }
    if etas.iter().all(|eta| *eta == 0.0) {
        return Err(ValidationError::NoMonitoredChannel.into());
    }
    if measurement.ntrajs == 0 {
        return Err(ValidationError::NoTrajectories.into());
    }
    let n = h.n();
    check_operator(h, n, &config.options)?;
    let (l_batch, jumps) = jump_matrices(jump_ops, n, &config.options)?;
    check_exp_ops(exp_ops, n)?;
    let rho0 = rho0.view().into_dyn();
    let (y_batch, y_flat) = flatten_state("rho0", &rho0, n, true)?;
    let y_flat = todm(y_flat);

    let layout = BatchLayout::new(&BatchSpec {
        h: BatchArg::new(h.name(), h.batch_shape()),
        l: Some(BatchArg::new("jump_ops", &l_batch)),
        y: BatchArg::new("rho0", &y_batch),
        ntrajs: Some(measurement.ntrajs),
        policy: config.options.batching,
    })?;
    log_start(Family::Stochastic, config, &layout);
    let eq = MasterEquation::new(EquationKind::Lindblad, h.clone(), jumps, &layout);
    let y0 = layout.gather(&y_flat);
    let nbatch = y0.shape()[0];

    let mut recorder = Recorder::new(
        config.options.save_states, exp_ops, nbatch, tsave.len(), n, n);
    let mut stats = SolveStats::default();
    let (_, record) = integrate_sme(
        &eq,
        &config.method,
        etas,
        y0,
        tsave,
        &tmeas,
        measurement.seed,
        &config.options,
        &mut stats,
        &mut |k, _, y| recorder.record(k, y),
    )?;
    stats.nfev = eq.nfev();
    Ok(
        Evolution::assemble(recorder, &layout, tsave, *config, stats, start_time)
            .with_measurements(&layout, &tmeas, record)
    )
}
