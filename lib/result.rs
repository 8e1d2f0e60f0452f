//! Immutable solve results.

use std::time::{ Duration, SystemTime };
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    Matrices,
    batch::BatchLayout,
    config::SolverConfig,
    integrate::SolveStats,
    utils::expect,
};

/// Collects states and expectation values over the canonical batch while
/// stepping.
pub(crate) struct Recorder<'a> {
    save_states: bool,
    exp_ops: &'a [nd::Array2<C64>],
    states: nd::Array4<C64>,
    expects: nd::Array3<C64>,
}

impl<'a> Recorder<'a> {
    /// `nsave` save times for `nbatch` states of shape `(n, m)`.
    pub(crate) fn new(
        save_states: bool,
        exp_ops: &'a [nd::Array2<C64>],
        nbatch: usize,
        nsave: usize,
        n: usize,
        m: usize,
    ) -> Self
    {
        let nstates = if save_states { nsave } else { 1 };
        Self {
            save_states,
            exp_ops,
            states: nd::Array4::zeros((nbatch, nstates, n, m)),
            expects: nd::Array3::zeros((nbatch, exp_ops.len(), nsave)),
        }
    }

    /// Record the state at save index `k`.
    pub(crate) fn record(&mut self, k: usize, y: &Matrices) {
        let slot = if self.save_states { k } else { 0 };
        self.states.index_axis_mut(nd::Axis(1), slot).assign(y);
        for (c, yc) in y.outer_iter().enumerate() {
            for (j, e) in self.exp_ops.iter().enumerate() {
                self.expects[[c, j, k]] = expect(e, &yc);
            }
        }
    }
}

/// Output of a solve call.
///
/// All arrays carry the caller-facing batch shape `(batch...)` as leading
/// axes, where axes of arguments that were not batched are omitted.
#[derive(Clone, Debug)]
pub struct Evolution {
    tsave: Vec<f64>,
    tmeas: Option<Vec<f64>>,
    states: nd::ArrayD<C64>,
    expects: Option<nd::ArrayD<C64>>,
    measurements: Option<nd::ArrayD<f64>>,
    gradients: Option<nd::ArrayD<C64>>,
    config: SolverConfig,
    stats: SolveStats,
    start_time: SystemTime,
    end_time: SystemTime,
}

impl Evolution {
    /// Freeze the contents of a recorder, restoring the caller's batch shape.
    pub(crate) fn assemble(
        recorder: Recorder,
        layout: &BatchLayout,
        tsave: &[f64],
        config: SolverConfig,
        stats: SolveStats,
        start_time: SystemTime,
    ) -> Self
    {
        let expects
            = (!recorder.exp_ops.is_empty())
            .then(|| layout.restore(recorder.expects.into_dyn()));
        Self {
            tsave: tsave.to_vec(),
            tmeas: None,
            states: layout.restore(recorder.states.into_dyn()),
            expects,
            measurements: None,
            gradients: None,
            config,
            stats,
            start_time,
            end_time: SystemTime::now(),
        }
    }

    /// Attach a measurement record `(b, nLm, nint)` taken at boundaries
    /// `tmeas`.
    pub(crate) fn with_measurements(
        mut self,
        layout: &BatchLayout,
        tmeas: &[f64],
        record: nd::Array3<f64>,
    ) -> Self
    {
        self.tmeas = Some(tmeas.to_vec());
        self.measurements = Some(layout.restore(record.into_dyn()));
        self
    }

    /// Attach adjoint gradients `(b, nE, n, n)`.
    pub(crate) fn with_gradients(
        mut self,
        layout: &BatchLayout,
        gradients: nd::Array4<C64>,
        stats: SolveStats,
    ) -> Self
    {
        self.gradients = Some(layout.restore(gradients.into_dyn()));
        self.stats = stats;
        self.end_time = SystemTime::now();
        self
    }

    /// Save times.
    pub fn tsave(&self) -> &[f64] { &self.tsave }

    /// Measurement interval boundaries, for stochastic solves.
    pub fn tmeas(&self) -> Option<&[f64]> { self.tmeas.as_deref() }

    /// Saved states, shaped `(batch..., nsave, n, m)`, with `m = 1` for kets
    /// and `nsave = 1` if only the final state was kept.
    pub fn states(&self) -> &nd::ArrayD<C64> { &self.states }

    /// Final state, shaped `(batch..., n, m)`.
    pub fn final_state(&self) -> nd::ArrayD<C64> {
        let ax = nd::Axis(self.states.ndim() - 3);
        let last = self.states.len_of(ax) - 1;
        self.states.index_axis(ax, last).to_owned()
    }

    /// Expectation values, shaped `(batch..., nE, nsave)`, if any
    /// observables were given.
    pub fn expects(&self) -> Option<&nd::ArrayD<C64>> { self.expects.as_ref() }

    /// Time-averaged measurement record, shaped
    /// `(batch..., ntrajs, nLm, len(tmeas) - 1)`, for stochastic solves.
    pub fn measurements(&self) -> Option<&nd::ArrayD<f64>> {
        self.measurements.as_ref()
    }

    /// Adjoint gradients of the final expectation values with respect to the
    /// initial state, shaped `(batch..., nE, n, n)`.
    ///
    /// Entry `k` is the operator `X_k` for which `tr(X_k ρ0)` (or
    /// `⟨ψ0|X_k|ψ0⟩`) equals the expectation value of the `k`-th observable
    /// at the last save time.
    pub fn gradients(&self) -> Option<&nd::ArrayD<C64>> { self.gradients.as_ref() }

    /// Configuration the solve ran with.
    pub fn config(&self) -> &SolverConfig { &self.config }

    /// Step and function evaluation counts.
    pub fn stats(&self) -> SolveStats { self.stats }

    pub fn start_time(&self) -> SystemTime { self.start_time }

    pub fn end_time(&self) -> SystemTime { self.end_time }

    /// Wall-clock duration of the solve.
    pub fn total_time(&self) -> Duration {
        self.end_time.duration_since(self.start_time).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{ One, Zero };
    use crate::{
        batch::{ BatchArg, BatchSpec },
        config::{ Batching, Method, Options },
    };

    fn layout(by: &[usize]) -> BatchLayout {
        BatchLayout::new(&BatchSpec {
            h: BatchArg::new("H", &[]),
            l: None,
            y: BatchArg::new("psi0", by),
            ntrajs: None,
            policy: Batching::Cartesian,
        }).unwrap()
    }

    fn kets() -> Matrices {
        nd::array![
            [[C64::one()], [C64::zero()]],
            [[C64::zero()], [C64::one()]],
        ]
    }

    fn config() -> SolverConfig {
        SolverConfig::new(Method::Propagator, None, Options::default())
    }

    #[test]
    fn records_every_save() {
        let sz = nd::array![[C64::one(), C64::zero()], [C64::zero(), -C64::one()]];
        let exp_ops = [sz];
        let mut recorder = Recorder::new(true, &exp_ops, 2, 3, 2, 1);
        for k in 0..3 { recorder.record(k, &kets()); }
        let res = Evolution::assemble(
            recorder, &layout(&[2]), &[0.0, 1.0, 2.0], config(),
            SolveStats::default(), SystemTime::now(),
        );
        assert_eq!(res.states().shape(), &[2, 3, 2, 1]);
        let expects = res.expects().unwrap();
        assert_eq!(expects.shape(), &[2, 1, 3]);
        assert_eq!(expects[[0, 0, 2]], C64::one());
        assert_eq!(expects[[1, 0, 1]], -C64::one());
        assert_eq!(res.final_state().shape(), &[2, 2, 1]);
        assert!(res.measurements().is_none());
    }

    #[test]
    fn final_state_only() {
        let single: Matrices = kets().slice(nd::s![..1, .., ..]).to_owned();
        let mut recorder = Recorder::new(false, &[], 1, 4, 2, 1);
        for k in 0..4 { recorder.record(k, &single); }
        let res = Evolution::assemble(
            recorder, &layout(&[]), &[0.0, 1.0, 2.0, 3.0], config(),
            SolveStats::default(), SystemTime::now(),
        );
        assert_eq!(res.states().shape(), &[1, 2, 1]);
        assert!(res.expects().is_none());
        assert_eq!(res.tsave().len(), 4);
    }
}
