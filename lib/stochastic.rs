//! Diffusive stochastic master equation under continuous measurement.
//!
//! For jump operators `L_k` measured with efficiencies `η_k`, the conditional
//! state obeys
//! ```text
//! dρ = L(ρ) dt + Σ_k √η_k (L_k ρ + ρ L_k† - tr((L_k + L_k†) ρ) ρ) dW_k
//! ```
//! with `L` the Lindblad generator and `dW_k` independent Wiener increments.
//! The measured signal of channel `k` over a step is
//! ```text
//! dY_k = √η_k tr((L_k + L_k†) ρ) dt + dW_k
//! ```
//! evaluated with the state at the start of the step. Only channels with
//! `η_k > 0` are sampled and recorded.

use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::{ Rng, SeedableRng };
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use crate::{
    Matrices,
    config::{ Method, Options },
    equation::MasterEquation,
    integrate::{ rouchon1_step, run_fixed, IntResult, SaveFn, SolveStats },
    utils::trace,
};

/// Samples Wiener increments for the monitored channels of every canonical
/// batch element.
///
/// Increments are drawn in batch-major, channel-minor order, so a fixed seed
/// fixes every increment of a run.
pub struct WienerSampler {
    rng: ChaCha8Rng,
    nbatch: usize,
    nchannels: usize,
    monitored: Vec<usize>,
}

impl WienerSampler {
    /// Create a new sampler over `nbatch` elements and `etas.len()` channels,
    /// seeded from `seed` or from system entropy.
    pub fn new(seed: Option<u64>, nbatch: usize, etas: &[f64]) -> Self {
        let rng
            = match seed {
                Some(s) => ChaCha8Rng::seed_from_u64(s),
                None => ChaCha8Rng::from_entropy(),
            };
        let monitored: Vec<usize>
            = etas.iter().enumerate()
            .filter_map(|(k, eta)| (*eta > 0.0).then_some(k))
            .collect();
        Self { rng, nbatch, nchannels: etas.len(), monitored }
    }

    /// Indices of the channels with non-zero efficiency.
    pub fn monitored(&self) -> &[usize] { &self.monitored }

    /// Draw one step's increments, shaped `(nbatch, nchannels)`, with variance
    /// `dt`. Unmonitored channels are zero.
    pub fn sample(&mut self, dt: f64) -> nd::Array2<f64> {
        let sqrt_dt = dt.sqrt();
        let mut dw: nd::Array2<f64> = nd::Array2::zeros((self.nbatch, self.nchannels));
        for mut row in dw.outer_iter_mut() {
            for &k in self.monitored.iter() {
                let x: f64 = self.rng.sample(StandardNormal);
                row[k] = sqrt_dt * x;
            }
        }
        dw
    }
}

/// Time-averages a measured signal over consecutive measurement intervals.
///
/// Intervals are `[tmeas[j], tmeas[j + 1])`. A step is assumed to contribute
/// uniformly over its duration, so one straddling a boundary is split between
/// the two intervals in proportion to its overlap with each. Contributions
/// outside `[tmeas[0], tmeas[last]]` are discarded.
#[derive(Clone, Debug)]
pub struct MeasurementAccumulator {
    tmeas: Vec<f64>,
    monitored: Vec<usize>,
    acc: nd::Array2<f64>,
    record: nd::Array3<f64>,
    current: usize,
}

impl MeasurementAccumulator {
    pub fn new(tmeas: &[f64], monitored: &[usize], nbatch: usize) -> Self {
        let nint = tmeas.len().saturating_sub(1);
        Self {
            tmeas: tmeas.to_vec(),
            monitored: monitored.to_vec(),
            acc: nd::Array2::zeros((nbatch, monitored.len())),
            record: nd::Array3::zeros((nbatch, monitored.len(), nint)),
            current: 0,
        }
    }

    fn nint(&self) -> usize { self.tmeas.len().saturating_sub(1) }

    /// Add the increments `dy` (shaped `(nbatch, nchannels)`, all channels) of
    /// a step from `t0` to `t1`.
    pub fn accumulate(&mut self, t0: f64, t1: f64, dy: &nd::Array2<f64>) {
        let len = t1 - t0;
        if len <= 0.0 { return; }
        while self.current < self.nint() {
            let (lo, hi) = (self.tmeas[self.current], self.tmeas[self.current + 1]);
            if lo >= t1 { break; }
            let overlap = t1.min(hi) - t0.max(lo);
            if overlap > 0.0 {
                let w = overlap / len;
                for (j, &k) in self.monitored.iter().enumerate() {
                    self.acc.column_mut(j).scaled_add(w, &dy.column(k));
                }
            }
            if t1 < hi { break; }
            let mut col = self.record.index_axis_mut(nd::Axis(2), self.current);
            col.assign(&(&self.acc / (hi - lo)));
            self.acc.fill(0.0);
            self.current += 1;
        }
    }

    /// Number of completed intervals.
    pub fn completed(&self) -> usize { self.current }

    /// Return the record, shaped `(nbatch, nmonitored, len(tmeas) - 1)`.
    pub fn finish(self) -> nd::Array3<f64> { self.record }
}

/// Measured increments `dY` for every canonical element and channel, shaped
/// `(nbatch, nchannels)`. Unmonitored channels are zero.
pub fn measured(
    eq: &MasterEquation,
    etas: &[f64],
    rho: &Matrices,
    dw: &nd::Array2<f64>,
    dt: f64,
) -> nd::Array2<f64>
{
    let mut dy = dw.clone();
    for (c, rhoc) in rho.outer_iter().enumerate() {
        let il = eq.l_slot(c);
        for (k, l) in eq.jump_ops().iter().enumerate() {
            if etas[k] == 0.0 { continue; }
            // tr((L + L†) ρ) = 2 Re tr(L ρ) for Hermitian ρ
            let l_exp = 2.0 * trace(&l.index_axis(nd::Axis(0), il).dot(&rhoc)).re;
            dy[[c, k]] += etas[k].sqrt() * l_exp * dt;
        }
    }
    dy
}

/// Euler-Maruyama step of the stochastic master equation.
pub fn sme_euler_step(
    eq: &MasterEquation,
    etas: &[f64],
    t: f64,
    dt: f64,
    rho: &Matrices,
    dw: &nd::Array2<f64>,
) -> Matrices
{
    let mut next = rho + &(eq.rhs(t, rho) * C64::from(dt));
    let iter = next.outer_iter_mut().zip(rho.outer_iter()).enumerate();
    for (c, (mut nextc, rhoc)) in iter {
        let il = eq.l_slot(c);
        let jumps = eq.jump_ops().iter().zip(eq.jump_ops_dag()).enumerate();
        for (k, (l, ldag)) in jumps {
            if etas[k] == 0.0 { continue; }
            let l = l.index_axis(nd::Axis(0), il);
            let ldag = ldag.index_axis(nd::Axis(0), il);
            let lrho = l.dot(&rhoc);
            let l_exp = 2.0 * trace(&lrho).re;
            let mut innov = &lrho + &rhoc.dot(&ldag);
            innov.scaled_add(C64::from(-l_exp), &rhoc);
            nextc.scaled_add(C64::from(etas[k].sqrt() * dw[[c, k]]), &innov);
        }
    }
    next
}

/// Integrate the stochastic master equation from `t = 0` with a fixed-step
/// `method` (`Euler` or `Rouchon1`), returning the final state and the
/// measurement record shaped `(nbatch, nmonitored, len(tmeas) - 1)`.
pub fn integrate_sme(
    eq: &MasterEquation,
    method: &Method,
    etas: &[f64],
    rho0: Matrices,
    tsave: &[f64],
    tmeas: &[f64],
    seed: Option<u64>,
    opts: &Options,
    stats: &mut SolveStats,
    save: &mut SaveFn,
) -> IntResult<(Matrices, nd::Array3<f64>)>
{
    let nbatch = rho0.shape()[0];
    let mut sampler = WienerSampler::new(seed, nbatch, etas);
    let mut accumulator = MeasurementAccumulator::new(tmeas, sampler.monitored(), nbatch);
    let rouchon = method.is_rouchon1();
    let dt = method.fixed_dt().unwrap_or_default();
    let rho = run_fixed(dt, rho0, tsave, opts, stats, save, |t, h, rho| {
        let dw = sampler.sample(h);
        let dy = measured(eq, etas, rho, &dw, h);
        accumulator.accumulate(t, t + h, &dy);
        if rouchon {
            Ok(rouchon1_step(eq, t, h, rho, Some((etas, &dy))))
        } else {
            Ok(sme_euler_step(eq, etas, t, h, rho, &dw))
        }
    })?;
    log::debug!(
        "completed {}/{} measurement intervals",
        accumulator.completed(), tmeas.len().saturating_sub(1),
    );
    Ok((rho, accumulator.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{ One, Zero };
    use crate::{
        batch::{ BatchArg, BatchLayout, BatchSpec },
        config::Batching,
        equation::EquationKind,
        operator::TimeOperator,
    };

    #[test]
    fn seeded_sampler_is_reproducible() {
        let etas = [1.0, 0.0, 0.5];
        let mut a = WienerSampler::new(Some(7), 4, &etas);
        let mut b = WienerSampler::new(Some(7), 4, &etas);
        for _ in 0..10 {
            let (da, db) = (a.sample(0.01), b.sample(0.01));
            assert_eq!(da, db);
            assert!(da.column(1).iter().all(|x| *x == 0.0));
        }
        let mut c = WienerSampler::new(Some(8), 4, &etas);
        assert_ne!(a.sample(0.01), c.sample(0.01));
        assert_eq!(a.monitored(), &[0, 2]);
    }

    #[test]
    fn sampler_variance() {
        let mut s = WienerSampler::new(Some(1), 1, &[1.0]);
        let nsamples = 20_000;
        let dt = 0.04;
        let var: f64
            = (0..nsamples)
            .map(|_| s.sample(dt)[[0, 0]].powi(2))
            .sum::<f64>() / nsamples as f64;
        assert!((var - dt).abs() < 0.05 * dt);
    }

    #[test]
    fn straddling_step_is_apportioned() {
        let mut acc = MeasurementAccumulator::new(&[0.0, 1.0, 2.0], &[0], 1);
        let dy = nd::array![[1.0]];
        acc.accumulate(0.0, 0.75, &dy);
        acc.accumulate(0.75, 1.25, &dy);
        assert_eq!(acc.completed(), 1);
        acc.accumulate(1.25, 2.0, &dy);
        let record = acc.finish();
        assert_eq!(record.shape(), &[1, 1, 2]);
        assert!((record[[0, 0, 0]] - 1.5).abs() < 1e-12);
        assert!((record[[0, 0, 1]] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn contributions_outside_boundaries_are_dropped() {
        let mut acc = MeasurementAccumulator::new(&[1.0, 2.0], &[1], 1);
        let dy = nd::array![[5.0, 2.0]];
        acc.accumulate(0.0, 1.0, &dy);
        acc.accumulate(1.0, 2.0, &dy);
        acc.accumulate(2.0, 3.0, &dy);
        let record = acc.finish();
        assert_eq!(record.shape(), &[1, 1, 1]);
        assert!((record[[0, 0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn empty_boundaries() {
        let mut acc = MeasurementAccumulator::new(&[], &[0], 3);
        acc.accumulate(0.0, 1.0, &nd::Array2::ones((3, 1)));
        assert_eq!(acc.finish().shape(), &[3, 1, 0]);
    }

    #[test]
    fn sme_euler_keeps_trace() {
        let sm: nd::Array2<C64>
            = nd::array![[C64::zero(), C64::one()], [C64::zero(), C64::zero()]];
        let h = TimeOperator::constant("H", &nd::Array2::<C64>::zeros((2, 2))).unwrap();
        let layout = BatchLayout::new(&BatchSpec {
            h: BatchArg::new("H", &[]),
            l: Some(BatchArg::new("jump_ops", &[])),
            y: BatchArg::new("rho0", &[]),
            ntrajs: Some(2),
            policy: Batching::Cartesian,
        }).unwrap();
        let eq = MasterEquation::new(
            EquationKind::Lindblad, h, vec![sm.insert_axis(nd::Axis(0))], &layout);
        let rho: Matrices = nd::array![
            [C64::from(0.5), C64::from(0.5)],
            [C64::from(0.5), C64::from(0.5)],
        ]
        .broadcast((2, 2, 2)).unwrap().to_owned();
        let dw = nd::array![[0.1], [-0.2]];
        let next = sme_euler_step(&eq, &[1.0], 0.0, 0.01, &rho, &dw);
        for nextc in next.outer_iter() {
            assert!((trace(&nextc) - C64::one()).norm() < 1e-12);
        }
        assert!((&next.index_axis(nd::Axis(0), 0) - &next.index_axis(nd::Axis(0), 1))
            .iter().any(|d| d.norm() > 1e-6));
    }
}
