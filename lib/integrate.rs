//! Time-stepping schemes for the deterministic equations.
//!
//! All schemes advance a batch of states `(b, n, m)` from `t = 0` through an
//! increasing sequence of save times, handing the state at each save time to
//! a caller-supplied sink. Fixed-step schemes move on the grid `k·dt` and only
//! shorten a step to land exactly on a save time; the adaptive scheme steps
//! freely and produces states at save times from its continuous extension.
//!
//! Any non-finite state aborts integration with
//! [`NumericalError::NonFinite`], reporting the last time at which the state
//! was valid.

use std::{ collections::HashMap, rc::Rc };
use ndarray as nd;
use ndarray_linalg::{ FactorizeInto, LUFactorized, Solve };
use num_complex::Complex64 as C64;
use crate::{
    Matrices,
    config::{ Method, Options, Precision },
    equation::{ EquationKind, MasterEquation },
    error::NumericalError,
    operator::OperatorId,
    utils::{ all_finite, dagger, expm, eye, trace },
    DEF_ATOL,
    DEF_MAX_FACTOR,
    DEF_MAX_STEPS,
    DEF_MIN_FACTOR,
    DEF_MIN_STEP,
    DEF_RTOL,
    DEF_SAFETY,
};

pub type IntResult<T> = Result<T, NumericalError>;

/// Counters collected while stepping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SolveStats {
    /// Accepted steps (or propagator applications).
    pub accepted: usize,
    /// Rejected adaptive steps.
    pub rejected: usize,
    /// Right-hand side evaluations.
    pub nfev: usize,
    /// Propagators (matrix exponentials) computed.
    pub nprop: usize,
}

/// Sink receiving the index of a save time, the save time, and the state.
pub type SaveFn<'a> = dyn FnMut(usize, f64, &Matrices) + 'a;

// fixed steps shorter than this fraction of `dt` are skipped
const FIXED_STEP_TOL: f64 = 1e-9;

pub(crate) fn log_progress(verbose: bool, k: usize, nsave: usize, t: f64) {
    let level = if verbose { log::Level::Info } else { log::Level::Debug };
    log::log!(level, "reached save time {}/{} (t = {})", k + 1, nsave, t);
}

// check a freshly computed state and apply precision rounding
fn finish_step(mut y: Matrices, t_last: f64, precision: Precision)
    -> IntResult<Matrices>
{
    all_finite(&y).then_some(()).ok_or(NumericalError::NonFinite(t_last))?;
    precision.round_inplace(&mut y);
    Ok(y)
}

// perform `y + h Σ_i c_i k_i` succinctly
fn lincomb(y: &Matrices, h: f64, terms: &[(f64, &Matrices)]) -> Matrices {
    let mut out = y.clone();
    for (c, k) in terms.iter() {
        if *c != 0.0 { out.scaled_add(C64::from(h * c), *k); }
    }
    out
}

// apply per-slot generator-sized matrices to every canonical element
fn apply_each(eq: &MasterEquation, ops: &Matrices, y: &Matrices) -> Matrices {
    let mut out: Matrices = nd::Array3::zeros(y.raw_dim());
    let iter = out.outer_iter_mut().zip(y.outer_iter()).enumerate();
    for (c, (mut outc, yc)) in iter {
        outc.assign(&eq.apply(&ops.index_axis(nd::Axis(0), eq.slot(c)), &yc));
    }
    out
}

/// Integrate `eq` from `t = 0` with `method`, calling `save` at every element
/// of `tsave` and returning the final state.
pub fn integrate(
    eq: &MasterEquation,
    method: &Method,
    y0: Matrices,
    tsave: &[f64],
    opts: &Options,
    stats: &mut SolveStats,
    save: &mut SaveFn,
) -> IntResult<Matrices>
{
    match *method {
        Method::Propagator => propagate(eq, y0, tsave, opts, stats, save),
        Method::Euler { dt } => {
            run_fixed(dt, y0, tsave, opts, stats, save, |t, h, y| {
                Ok(euler_step(eq, t, h, y))
            })
        },
        Method::BackwardEuler { dt } => {
            let mut cache = None;
            run_fixed(dt, y0, tsave, opts, stats, save, |t, h, y| {
                backward_euler_step(eq, &mut cache, t, h, y)
            })
        },
        Method::Dopri5 { .. } => {
            Dopri5::new(method).run(eq, y0, tsave, opts, stats, save)
        },
        Method::Rouchon1 { dt } => {
            run_fixed(dt, y0, tsave, opts, stats, save, |t, h, y| {
                Ok(rouchon1_step(eq, t, h, y, None))
            })
        },
    }
}

/// Drive a fixed-step scheme over the grid `k·dt`, landing exactly on every
/// save time.
///
/// `step` receives the current time, the step size, and the current state,
/// and returns the next state.
pub fn run_fixed<F>(
    dt: f64,
    y0: Matrices,
    tsave: &[f64],
    opts: &Options,
    stats: &mut SolveStats,
    save: &mut SaveFn,
    mut step: F,
) -> IntResult<Matrices>
where F: FnMut(f64, f64, &Matrices) -> IntResult<Matrices>
{
    let tol = FIXED_STEP_TOL * dt;
    let mut t: f64 = 0.0;
    let mut k: u64 = 0;
    let mut at_grid = true;
    let mut y = y0;
    for (isave, &ts) in tsave.iter().enumerate() {
        while ts - t > tol {
            let grid = (k + 1) as f64 * dt;
            let (t_next, on_grid)
                = if grid < ts - tol {
                    (grid, true)
                } else {
                    (ts, (grid - ts).abs() <= tol)
                };
            // full grid steps use `dt` exactly so step-size keyed caches hit
            let h = if at_grid && on_grid { dt } else { t_next - t };
            y = finish_step(step(t, h, &y)?, t, opts.precision)?;
            stats.accepted += 1;
            if on_grid { k += 1; }
            at_grid = on_grid;
            t = t_next;
        }
        save(isave, ts, &y);
        log_progress(opts.verbose, isave, tsave.len(), ts);
    }
    Ok(y)
}

/// Forward Euler: `y + dt f(t, y)`.
pub fn euler_step(eq: &MasterEquation, t: f64, dt: f64, y: &Matrices)
    -> Matrices
{
    let k = eq.rhs(t, y);
    lincomb(y, dt, &[(1.0, &k)])
}

// LU factors of (I - dt S(t + dt)), keyed by the identity of S and the bits of dt
type LuCache = Option<(Rc<Matrices>, u64, Vec<LUFactorized<nd::OwnedRepr<C64>>>)>;

/// Backward Euler: solves `(I - dt G(t + dt)) y' = y`.
fn backward_euler_step(
    eq: &MasterEquation,
    cache: &mut LuCache,
    t: f64,
    dt: f64,
    y: &Matrices,
) -> IntResult<Matrices>
{
    let s = eq.superop(t + dt);
    let lus = match cache {
        Some((sk, dtk, lus)) if Rc::ptr_eq(sk, &s) && *dtk == dt.to_bits() => lus,
        _ => {
            let d = s.shape()[1];
            let lus: Vec<LUFactorized<nd::OwnedRepr<C64>>>
                = s.outer_iter()
                .map(|sg| (eye(d) - &sg.mapv(|z| z * dt)).factorize_into())
                .collect::<Result<_, _>>()?;
            log::debug!("factorized backward Euler system for dt = {dt}");
            &mut cache.insert((s, dt.to_bits(), lus)).2
        },
    };
    let n = eq.n();
    let mut out: Matrices = nd::Array3::zeros(y.raw_dim());
    let iter = out.outer_iter_mut().zip(y.outer_iter()).enumerate();
    for (c, (mut outc, yc)) in iter {
        let lu = &lus[eq.slot(c)];
        match eq.kind() {
            EquationKind::Schrodinger => {
                for (mut outk, yk) in outc.columns_mut().into_iter().zip(yc.columns()) {
                    outk.assign(&lu.solve(&yk)?);
                }
            },
            _ => {
                let v: nd::Array1<C64> = yc.iter().copied().collect();
                let w = lu.solve(&v)?;
                outc.assign(&nd::Array2::from_shape_fn((n, n), |(i, j)| w[i * n + j]));
            },
        }
    }
    Ok(out)
}

// exp(S Δt) for every slot
fn expm_batch(s: &Matrices, delta: f64) -> IntResult<Matrices> {
    let mut out: Matrices = nd::Array3::zeros(s.raw_dim());
    for (mut outg, sg) in out.outer_iter_mut().zip(s.outer_iter()) {
        outg.assign(&expm(&sg.mapv(|z| z * delta))?);
    }
    Ok(out)
}

/// Exact propagation between consecutive save times for a time-independent
/// generator.
///
/// Propagators are cached by generator ID and the exact bits of the time
/// interval, so equally spaced save times cost a single exponential.
fn propagate(
    eq: &MasterEquation,
    y0: Matrices,
    tsave: &[f64],
    opts: &Options,
    stats: &mut SolveStats,
    save: &mut SaveFn,
) -> IntResult<Matrices>
{
    let mut cache: HashMap<(OperatorId, u64), Rc<Matrices>> = HashMap::new();
    let mut t: f64 = 0.0;
    let mut y = y0;
    for (isave, &ts) in tsave.iter().enumerate() {
        let delta = ts - t;
        if delta > 0.0 {
            let key = (eq.h_id(), delta.to_bits());
            let prop = match cache.get(&key) {
                Some(prop) => Rc::clone(prop),
                None => {
                    let prop = Rc::new(expm_batch(&eq.superop(t), delta)?);
                    stats.nprop += 1;
                    log::debug!("computed propagator for Δt = {delta}");
                    cache.insert(key, Rc::clone(&prop));
                    prop
                },
            };
            y = finish_step(apply_each(eq, &prop, &y), t, opts.precision)?;
            stats.accepted += 1;
            t = ts;
        }
        save(isave, ts, &y);
        log_progress(opts.verbose, isave, tsave.len(), ts);
    }
    Ok(y)
}

/// First-order Rouchon map.
///
/// With `meas = Some((etas, dy))`, where `dy` has shape `(b, nL)` and holds the
/// measured increments of every channel, this is the stochastic map
/// ```text
/// M  = I + Hnh dt + Σ_k √η_k dY_k L_k
/// ρ' = M ρ M† + Σ_k (1 - η_k) L_k ρ L_k† dt
/// ```
/// followed by trace normalization. With `meas = None` all efficiencies are
/// zero and the map is deterministic.
pub fn rouchon1_step(
    eq: &MasterEquation,
    t: f64,
    dt: f64,
    rho: &Matrices,
    meas: Option<(&[f64], &nd::Array2<f64>)>,
) -> Matrices
{
    let hnh = eq.hnh(t);
    let id = eye(eq.n());
    let mut out: Matrices = nd::Array3::zeros(rho.raw_dim());
    let iter = out.outer_iter_mut().zip(rho.outer_iter()).enumerate();
    for (c, (mut outc, rhoc)) in iter {
        let il = eq.l_slot(c);
        let mut m = &id + &hnh.index_axis(nd::Axis(0), eq.slot(c)).mapv(|z| z * dt);
        if let Some((etas, dy)) = meas {
            for (k, l) in eq.jump_ops().iter().enumerate() {
                let coef = etas[k].sqrt() * dy[[c, k]];
                if coef != 0.0 {
                    m.scaled_add(C64::from(coef), &l.index_axis(nd::Axis(0), il));
                }
            }
        }
        let mut next = m.dot(&rhoc).dot(&dagger(&m));
        let jumps = eq.jump_ops().iter().zip(eq.jump_ops_dag()).enumerate();
        for (k, (l, ldag)) in jumps {
            let eta = meas.map(|(etas, _)| etas[k]).unwrap_or(0.0);
            let w = (1.0 - eta) * dt;
            if w != 0.0 {
                let l = l.index_axis(nd::Axis(0), il);
                let ldag = ldag.index_axis(nd::Axis(0), il);
                next.scaled_add(C64::from(w), &l.dot(&rhoc).dot(&ldag));
            }
        }
        let tr = trace(&next);
        next.mapv_inplace(|z| z / tr);
        outc.assign(&next);
    }
    out
}

// Dormand-Prince 5(4) tableau
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// difference between the fifth- and fourth-order solutions
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

// continuous extension: b_i(θ) = Σ_j P[i][j] θ^(j + 1)
const DENSE: [[f64; 4]; 7] = [
    [
        1.0,
        -8048581381.0 / 2820520608.0,
        8663915743.0 / 2820520608.0,
        -12715105075.0 / 11282082432.0,
    ],
    [0.0, 0.0, 0.0, 0.0],
    [
        0.0,
        131558114200.0 / 32700410799.0,
        -68118460800.0 / 10900136933.0,
        87487479700.0 / 32700410799.0,
    ],
    [
        0.0,
        -1754552775.0 / 470086768.0,
        14199869525.0 / 1410260304.0,
        -10690763975.0 / 1880347072.0,
    ],
    [
        0.0,
        127303824393.0 / 49829197408.0,
        -318862633887.0 / 49829197408.0,
        701980252875.0 / 199316789632.0,
    ],
    [
        0.0,
        -282668133.0 / 205662961.0,
        2019193451.0 / 616988883.0,
        -1453857185.0 / 822651844.0,
    ],
    [
        0.0,
        40617522.0 / 29380423.0,
        -110615467.0 / 29380423.0,
        69997945.0 / 29380423.0,
    ],
];

// exponent of the step-size controller, 1 / (order + 1) for the embedded
// fourth-order solution
const CONTROL_EXP: f64 = 1.0 / 5.0;

/// Adaptive Dormand-Prince 5(4) integrator with fully resolved parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dopri5 {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    pub max_step: f64,
    pub min_step: f64,
    pub h0: Option<f64>,
}

impl Default for Dopri5 {
    fn default() -> Self {
        Self {
            rtol: DEF_RTOL,
            atol: DEF_ATOL,
            max_steps: DEF_MAX_STEPS,
            safety: DEF_SAFETY,
            min_factor: DEF_MIN_FACTOR,
            max_factor: DEF_MAX_FACTOR,
            max_step: f64::INFINITY,
            min_step: DEF_MIN_STEP,
            h0: None,
        }
    }
}

impl Dopri5 {
    /// Resolve the parameters of a [`Method::Dopri5`], filling in defaults.
    /// Other methods give all defaults.
    pub fn new(method: &Method) -> Self {
        let def = Self::default();
        match *method {
            Method::Dopri5 {
                rtol,
                atol,
                max_steps,
                safety_factor,
                min_factor,
                max_factor,
                max_step,
                min_step,
                h0,
            } => Self {
                rtol: rtol.unwrap_or(def.rtol),
                atol: atol.unwrap_or(def.atol),
                max_steps: max_steps.unwrap_or(def.max_steps),
                safety: safety_factor.unwrap_or(def.safety),
                min_factor: min_factor.unwrap_or(def.min_factor),
                max_factor: max_factor.unwrap_or(def.max_factor),
                max_step: max_step.unwrap_or(def.max_step),
                min_step: min_step.unwrap_or(def.min_step),
                h0,
            },
            _ => def,
        }
    }

    // max over batch elements of the RMS of the scaled error
    fn error_norm(&self, err: &Matrices, y_old: &Matrices, y_new: &Matrices) -> f64 {
        let iter = err.outer_iter().zip(y_old.outer_iter()).zip(y_new.outer_iter());
        let mut worst: f64 = 0.0;
        for ((errc, oldc), newc) in iter {
            let sum: f64
                = errc.iter().zip(oldc.iter()).zip(newc.iter())
                .map(|((e, a), b)| {
                    let sc = self.atol + self.rtol * a.norm().max(b.norm());
                    (e.norm() / sc).powi(2)
                })
                .sum();
            let rms = (sum / errc.len() as f64).sqrt();
            if rms.is_nan() || rms > worst { worst = rms; }
        }
        worst
    }

    // Hairer-Wanner starting step
    fn initial_step(&self, eq: &MasterEquation, t0: f64, y0: &Matrices, f0: &Matrices)
        -> f64
    {
        let scale = y0.mapv(|z| self.atol + self.rtol * z.norm());
        let rms = |a: &Matrices| -> f64 {
            let sum: f64
                = a.iter().zip(scale.iter())
                .map(|(ak, sk)| (ak.norm() / sk).powi(2))
                .sum();
            (sum / a.len() as f64).sqrt()
        };
        let d0 = rms(y0);
        let d1 = rms(f0);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
        let y1 = lincomb(y0, h0, &[(1.0, f0)]);
        let f1 = eq.rhs(t0 + h0, &y1);
        let d2 = rms(&(&f1 - f0)) / h0;
        let h1
            = if d1.max(d2) <= 1e-15 {
                (1e-3 * h0).max(1e-6)
            } else {
                (0.01 / d1.max(d2)).powf(CONTROL_EXP)
            };
        (100.0 * h0).min(h1).min(self.max_step)
    }

    fn dense(y: &Matrices, h: f64, theta: f64, ks: [&Matrices; 7]) -> Matrices {
        let terms: Vec<(f64, &Matrices)>
            = DENSE.iter().zip(ks)
            .map(|(row, k)| {
                let b: f64
                    = row.iter().enumerate()
                    .map(|(j, p)| p * theta.powi(j as i32 + 1))
                    .sum();
                (b, k)
            })
            .collect();
        lincomb(y, h, &terms)
    }

    /// Integrate `eq` from `t = 0`, calling `save` at every element of
    /// `tsave`.
    pub fn run(
        &self,
        eq: &MasterEquation,
        y0: Matrices,
        tsave: &[f64],
        opts: &Options,
        stats: &mut SolveStats,
        save: &mut SaveFn,
    ) -> IntResult<Matrices>
    {
        let nsave = tsave.len();
        let mut t: f64 = 0.0;
        let mut y = y0;
        let mut isave: usize = 0;
        while isave < nsave && tsave[isave] <= t {
            save(isave, tsave[isave], &y);
            log_progress(opts.verbose, isave, nsave, tsave[isave]);
            isave += 1;
        }
        let Some(&t_end) = tsave.last() else { return Ok(y); };
        if isave == nsave { return Ok(y); }

        let mut k1 = eq.rhs(t, &y);
        let mut h
            = self.h0
            .unwrap_or_else(|| self.initial_step(eq, t, &y, &k1))
            .min(self.max_step);
        let mut attempts: usize = 0;
        while isave < nsave {
            if h < self.min_step {
                return Err(NumericalError::StepUnderflow { t, dt: h });
            }
            attempts += 1;
            if attempts > self.max_steps {
                return Err(NumericalError::MaxSteps { t, max: self.max_steps });
            }
            let last = h >= t_end - t;
            let h_step = if last { t_end - t } else { h };
            let t_new = if last { t_end } else { t + h_step };

            let k2 = eq.rhs(t + C2 * h_step, &lincomb(&y, h_step, &[(A21, &k1)]));
            let k3 = eq.rhs(
                t + C3 * h_step,
                &lincomb(&y, h_step, &[(A31, &k1), (A32, &k2)]),
            );
            let k4 = eq.rhs(
                t + C4 * h_step,
                &lincomb(&y, h_step, &[(A41, &k1), (A42, &k2), (A43, &k3)]),
            );
            let k5 = eq.rhs(
                t + C5 * h_step,
                &lincomb(&y, h_step, &[(A51, &k1), (A52, &k2), (A53, &k3), (A54, &k4)]),
            );
            let k6 = eq.rhs(
                t_new,
                &lincomb(
                    &y,
                    h_step,
                    &[(A61, &k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)],
                ),
            );
            let y_new = lincomb(
                &y,
                h_step,
                &[(B1, &k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)],
            );
            let k7 = eq.rhs(t_new, &y_new);
            let zero: Matrices = nd::Array3::zeros(y.raw_dim());
            let err_est = lincomb(
                &zero,
                h_step,
                &[(E1, &k1), (E3, &k3), (E4, &k4), (E5, &k5), (E6, &k6), (E7, &k7)],
            );
            let err = self.error_norm(&err_est, &y, &y_new);
            if !err.is_finite() {
                return Err(NumericalError::NonFinite(t));
            }

            if err <= 1.0 {
                stats.accepted += 1;
                let y_new = finish_step(y_new, t, opts.precision)?;
                while isave < nsave && tsave[isave] <= t_new {
                    let ts = tsave[isave];
                    if ts == t_new {
                        save(isave, ts, &y_new);
                    } else {
                        let theta = (ts - t) / h_step;
                        let ks = [&k1, &k2, &k3, &k4, &k5, &k6, &k7];
                        let ys = finish_step(
                            Self::dense(&y, h_step, theta, ks), t, opts.precision)?;
                        save(isave, ts, &ys);
                    }
                    log_progress(opts.verbose, isave, nsave, ts);
                    isave += 1;
                }
                let factor
                    = if err == 0.0 {
                        self.max_factor
                    } else {
                        (self.safety * err.powf(-CONTROL_EXP))
                            .clamp(self.min_factor, self.max_factor)
                    };
                h = (h_step * factor).min(self.max_step);
                t = t_new;
                y = y_new;
                k1 = k7;
            } else {
                stats.rejected += 1;
                log::trace!("rejected step of size {h_step:e} at t = {t} (error {err:.3e})");
                let factor
                    = (self.safety * err.powf(-CONTROL_EXP))
                    .clamp(self.min_factor, 1.0);
                h = h_step * factor;
            }
        }
        Ok(y)
    }
}
