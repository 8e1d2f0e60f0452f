use ndarray as nd;
use num_complex::Complex64 as C64;
use qevolve::{
    error::ValidationError,
    smesolve,
    Measurement,
    Method,
    Options,
    SolveError,
    SolverConfig,
    TimeOperator,
};

fn sm() -> nd::Array2<C64> {
    nd::array![[C64::from(0.0), C64::from(1.0)], [C64::from(0.0), C64::from(0.0)]]
}

fn sz() -> nd::Array2<C64> {
    nd::array![[C64::from(1.0), C64::from(0.0)], [C64::from(0.0), C64::from(-1.0)]]
}

fn excited() -> nd::Array2<C64> {
    nd::array![[C64::from(0.0), C64::from(0.0)], [C64::from(0.0), C64::from(1.0)]]
}

fn plus() -> nd::Array2<C64> {
    nd::array![[C64::from(0.5), C64::from(0.5)], [C64::from(0.5), C64::from(0.5)]]
}

fn config(method: Method) -> SolverConfig {
    SolverConfig::new(method, None, Options { verbose: false, ..Options::default() })
}

fn zero_h() -> TimeOperator {
    TimeOperator::constant("H", &nd::Array2::<C64>::zeros((2, 2))).unwrap()
}

fn decay() -> TimeOperator {
    TimeOperator::constant("L", &(sm() * C64::from(0.7))).unwrap()
}

fn dephasing() -> TimeOperator {
    TimeOperator::constant("L_z", &(sz() * C64::from(0.4))).unwrap()
}

#[test]
fn rouchon_preserves_trace() {
    let tsave: Vec<f64> = (0..=20).map(|k| 0.25 * k as f64).collect();
    let meas = Measurement::new(&[1.0]).with_ntrajs(3).with_seed(3);
    let res = smesolve(
        &zero_h(), &[decay()], &plus(), &tsave, &[], &meas,
        &config(Method::Rouchon1 { dt: 0.01 }),
    ).unwrap();
    let states = res.states();
    assert_eq!(states.shape(), &[3, 21, 2, 2]);
    for traj in states.outer_iter() {
        for rho in traj.outer_iter() {
            let tr = rho[[0, 0]] + rho[[1, 1]];
            assert!((tr - C64::from(1.0)).norm() < 1e-10);
            assert!(rho[[0, 0]].re > -1e-12 && rho[[1, 1]].re > -1e-12);
        }
    }
}

#[test]
fn seeded_runs_are_identical() {
    let tsave = [0.0, 0.5, 1.0, 1.5];
    let run = |seed: u64, method: Method| {
        let meas = Measurement::new(&[1.0, 0.5]).with_ntrajs(2).with_seed(seed);
        smesolve(
            &zero_h(), &[decay(), dephasing()], &plus(), &tsave, &[sz()], &meas,
            &config(method),
        ).unwrap()
    };
    for method in [Method::Euler { dt: 1e-3 }, Method::Rouchon1 { dt: 1e-3 }] {
        let a = run(42, method);
        let b = run(42, method);
        assert_eq!(a.states(), b.states());
        assert_eq!(a.expects(), b.expects());
        assert_eq!(a.measurements(), b.measurements());
        let c = run(43, method);
        assert_ne!(a.measurements(), c.measurements());
    }
}

#[test]
fn unseeded_runs_differ() {
    let meas = Measurement::new(&[1.0]);
    let run = || {
        smesolve(
            &zero_h(), &[decay()], &plus(), &[0.0, 1.0], &[], &meas,
            &config(Method::Euler { dt: 1e-2 }),
        ).unwrap()
    };
    assert_ne!(run().measurements(), run().measurements());
}

#[test]
fn record_shape_omits_unmonitored_channels() {
    let tsave = [0.0, 1.0, 2.0];
    let tmeas = [0.0, 0.4, 0.8, 1.2, 1.6, 2.0];
    let meas = Measurement::new(&[0.0, 0.8])
        .with_tmeas(&tmeas)
        .with_ntrajs(5)
        .with_seed(1);
    let res = smesolve(
        &zero_h(), &[decay(), dephasing()], &excited(), &tsave, &[sz()], &meas,
        &config(Method::Rouchon1 { dt: 1e-2 }),
    ).unwrap();
    let record = res.measurements().unwrap();
    assert_eq!(record.shape(), &[5, 1, tmeas.len() - 1]);
    assert_eq!(res.tmeas().unwrap(), &tmeas);
    assert_eq!(res.expects().unwrap().shape(), &[5, 1, 3]);
    assert!(record.iter().all(|x| x.is_finite()));
}

#[test]
fn record_defaults_to_save_times() {
    let tsave = [0.0, 0.5, 1.0, 1.5];
    let meas = Measurement::new(&[1.0]).with_seed(5);
    let res = smesolve(
        &zero_h(), &[decay()], &excited(), &tsave, &[], &meas,
        &config(Method::Euler { dt: 1e-3 }),
    ).unwrap();
    assert_eq!(res.measurements().unwrap().shape(), &[1, 1, 3]);

    let meas = meas.with_tmeas(&[]);
    let res = smesolve(
        &zero_h(), &[decay()], &excited(), &tsave, &[], &meas,
        &config(Method::Euler { dt: 1e-3 }),
    ).unwrap();
    assert_eq!(res.measurements().unwrap().shape(), &[1, 1, 0]);
}

#[test]
fn measured_signal_tracks_expectation() {
    // strong dephasing measurement of σz on |0⟩: dY = 2√η κ dt + dW with κ = 0.4
    let tmeas = [0.0, 20.0];
    let meas = Measurement::new(&[1.0])
        .with_tmeas(&tmeas)
        .with_ntrajs(4)
        .with_seed(11);
    let ground = nd::array![[C64::from(1.0)], [C64::from(0.0)]];
    let res = smesolve(
        &zero_h(), &[dephasing()], &ground, &[20.0], &[], &meas,
        &config(Method::Rouchon1 { dt: 1e-2 }),
    ).unwrap();
    let record = res.measurements().unwrap();
    // time average has standard deviation 1/√20 ≈ 0.22 around 0.8
    let mean: f64 = record.iter().sum::<f64>() / record.len() as f64;
    assert!((mean - 0.8).abs() < 0.5);
}

#[test]
fn stochastic_validation() {
    let tsave = [0.0, 1.0];
    let rouchon = config(Method::Rouchon1 { dt: 1e-2 });
    let solve = |jump_ops: &[TimeOperator], meas: &Measurement, config: &SolverConfig| {
        smesolve(&zero_h(), jump_ops, &plus(), &tsave, &[], meas, config).unwrap_err()
    };

    let err = solve(&[decay()], &Measurement::new(&[1.0]), &config(Method::dopri5()));
    assert!(err.to_string().contains("supported methods: Euler, Rouchon1"));

    let err = solve(&[], &Measurement::new(&[]), &rouchon);
    assert!(matches!(err, SolveError::Validation(ValidationError::NoJumpOps(_))));

    let err = solve(&[decay()], &Measurement::new(&[1.5]), &rouchon);
    assert!(matches!(err, SolveError::Validation(ValidationError::BadEfficiency(_))));

    let err = solve(&[decay()], &Measurement::new(&[1.0, 1.0]), &rouchon);
    assert!(matches!(
        err,
        SolveError::Validation(ValidationError::EfficiencyCount { jump_ops: 1, etas: 2 }),
    ));

    let err = solve(&[decay(), dephasing()], &Measurement::new(&[0.0, 0.0]), &rouchon);
    assert!(matches!(err, SolveError::Validation(ValidationError::NoMonitoredChannel)));

    let err = solve(&[decay()], &Measurement::new(&[1.0]).with_ntrajs(0), &rouchon);
    assert!(matches!(err, SolveError::Validation(ValidationError::NoTrajectories)));

    let err = solve(&[decay()], &Measurement::new(&[1.0]).with_tmeas(&[0.0, 2.0]), &rouchon);
    assert!(matches!(err, SolveError::Validation(ValidationError::MeasurementRange { .. })));
}
