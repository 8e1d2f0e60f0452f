use ndarray as nd;
use num_complex::Complex64 as C64;
use qevolve::{
    error::{ NumericalError, ValidationError },
    mesolve,
    sesolve,
    Batching,
    Gradient,
    Method,
    OperatorInput,
    Options,
    SolveError,
    SolverConfig,
    TimeOperator,
};

fn sx() -> nd::Array2<C64> {
    nd::array![[C64::from(0.0), C64::from(1.0)], [C64::from(1.0), C64::from(0.0)]]
}

fn sz() -> nd::Array2<C64> {
    nd::array![[C64::from(1.0), C64::from(0.0)], [C64::from(0.0), C64::from(-1.0)]]
}

fn sm() -> nd::Array2<C64> {
    nd::array![[C64::from(0.0), C64::from(1.0)], [C64::from(0.0), C64::from(0.0)]]
}

fn proj1() -> nd::Array2<C64> {
    nd::array![[C64::from(0.0), C64::from(0.0)], [C64::from(0.0), C64::from(1.0)]]
}

fn ket0() -> nd::Array2<C64> { nd::array![[C64::from(1.0)], [C64::from(0.0)]] }

fn quiet() -> Options { Options { verbose: false, ..Options::default() } }

fn config(method: Method) -> SolverConfig { SolverConfig::new(method, None, quiet()) }

fn max_diff(a: &nd::ArrayD<C64>, b: &nd::ArrayD<C64>) -> f64 {
    assert_eq!(a.shape(), b.shape());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
}

// Rabi Hamiltonians for a batch of drive strengths
fn rabi_batch(omegas: &[f64]) -> TimeOperator {
    let h: nd::Array3<C64> = nd::Array3::from_shape_fn((omegas.len(), 2, 2), |(k, i, j)| {
        sx()[[i, j]] * C64::from(omegas[k] / 2.0)
    });
    TimeOperator::constant("H", &h).unwrap()
}

// a batch of three initial kets
fn kets() -> nd::Array3<C64> {
    let s = std::f64::consts::FRAC_1_SQRT_2;
    nd::array![
        [[C64::from(1.0)], [C64::from(0.0)]],
        [[C64::from(0.0)], [C64::from(1.0)]],
        [[C64::from(s)], [C64::new(0.0, s)]],
    ]
}

#[test]
fn propagator_matches_dopri5_cartesian() {
    let h = rabi_batch(&[1.0, 2.5]);
    let tsave = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
    let exact = sesolve(&h, &kets(), &tsave, &[sz()], &config(Method::Propagator))
        .unwrap();
    let adaptive
        = sesolve(&h, &kets(), &tsave, &[sz()], &config(Method::dopri5_tol(1e-8, 1e-10)))
        .unwrap();
    assert_eq!(exact.states().shape(), &[2, 3, 6, 2, 1]);
    assert_eq!(exact.expects().unwrap().shape(), &[2, 3, 1, 6]);
    assert!(max_diff(exact.states(), adaptive.states()) < 1e-6);
    assert!(adaptive.stats().nfev > 0);
    assert_eq!(exact.stats().accepted, 5);
    // uniform save grid: one exponential reused for every interval
    assert_eq!(exact.stats().nprop, 1);

    let uneven = sesolve(&h, &kets(), &[0.5, 1.0, 1.25], &[], &config(Method::Propagator))
        .unwrap();
    assert_eq!(uneven.stats().accepted, 3);
    assert_eq!(uneven.stats().nprop, 2);
}

#[test]
fn lindblad_schemes_agree() {
    let h = TimeOperator::constant("H", &(sx() * C64::from(0.8))).unwrap();
    let l = TimeOperator::constant("L", &(sm() * C64::from(0.6))).unwrap();
    let tsave = [0.3, 1.0, 2.0];
    let exact = mesolve(&h, &[l.clone()], &ket0(), &tsave, &[proj1()], &config(Method::Propagator))
        .unwrap();
    for (method, tol) in [
        (Method::dopri5(), 1e-5),
        (Method::BackwardEuler { dt: 1e-3 }, 5e-3),
        (Method::Euler { dt: 1e-3 }, 5e-3),
        (Method::Rouchon1 { dt: 1e-3 }, 5e-3),
    ] {
        let approx = mesolve(&h, &[l.clone()], &ket0(), &tsave, &[proj1()], &config(method))
            .unwrap();
        assert!(
            max_diff(exact.states(), approx.states()) < tol,
            "{} deviates from the propagator", method.name(),
        );
    }
}

#[test]
fn zip_batching() {
    let h = rabi_batch(&[1.0, 2.0, 3.0]);
    let opts = Options { batching: Batching::Zip, ..quiet() };
    let res = sesolve(&h, &kets(), &[0.0, 1.0], &[], &SolverConfig::new(Method::Propagator, None, opts))
        .unwrap();
    assert_eq!(res.states().shape(), &[3, 2, 2, 1]);
    assert!(res.expects().is_none());

    let h = rabi_batch(&[1.0, 2.0]);
    let err = sesolve(&h, &kets(), &[0.0, 1.0], &[], &SolverConfig::new(Method::Propagator, None, opts))
        .unwrap_err();
    match err {
        SolveError::Validation(ValidationError::BatchMismatch(msg)) => {
            assert!(msg.contains("batch size 2") && msg.contains("batch size 3"));
        },
        other => panic!("expected a batch mismatch, got {:?}", other),
    }
}

#[test]
fn unbatched_call_is_unbatched() {
    let h = TimeOperator::constant("H", &sx()).unwrap();
    let l = TimeOperator::constant("L", &sm()).unwrap();
    let res = mesolve(&h, &[l], &ket0(), &[0.0, 0.5, 1.0], &[proj1(), sz()], &config(Method::dopri5()))
        .unwrap();
    assert_eq!(res.states().shape(), &[3, 2, 2]);
    assert_eq!(res.expects().unwrap().shape(), &[2, 3]);
    assert_eq!(res.final_state().shape(), &[2, 2]);
}

#[test]
fn final_state_only() {
    let h = TimeOperator::constant("H", &sx()).unwrap();
    let opts = Options { save_states: false, ..quiet() };
    let config = SolverConfig::new(Method::Propagator, None, opts);
    let res = sesolve(&h, &ket0(), &[0.0, 1.0, 2.0], &[sz()], &config).unwrap();
    assert_eq!(res.states().shape(), &[1, 2, 1]);
    assert_eq!(res.expects().unwrap().shape(), &[1, 3]);
    let expected = (2.0_f64 * 2.0).cos();
    assert!((res.expects().unwrap()[[0, 2]].re - expected).abs() < 1e-10);
}

#[test]
fn pwc_pulse_rotates_then_stops() {
    let omega = 3.0;
    let h = TimeOperator::new(
        "H",
        OperatorInput::pwc(&[0.0, 1.0], &nd::array![C64::from(omega / 2.0)], &sx()),
    ).unwrap();
    let tsave = [0.25, 0.5, 1.0, 1.5, 2.0];
    let res = sesolve(&h, &ket0(), &tsave, &[proj1()], &config(Method::dopri5_tol(1e-8, 1e-10)))
        .unwrap();
    let p1 = res.expects().unwrap();
    for (k, t) in tsave.iter().enumerate() {
        let expected = (omega * t.min(1.0) / 2.0).sin().powi(2);
        assert!((p1[[0, k]].re - expected).abs() < 1e-5);
    }
}

#[test]
fn adjoint_gradient_predicts_final_expectation() {
    let h = TimeOperator::new(
        "H",
        OperatorInput::modulated(|t: f64| C64::from(t.cos()), &sx()),
    ).unwrap()
        .add_matrix(&(sz() * C64::from(0.3)))
        .unwrap();
    let tsave = [0.5, 1.0, 2.0];
    let config = SolverConfig::new(
        Method::dopri5_tol(1e-10, 1e-12), Some(Gradient::Adjoint), quiet());
    let psi0 = kets();
    let res = sesolve(&h, &psi0, &tsave, &[sz(), proj1()], &config).unwrap();
    let grads = res.gradients().unwrap();
    assert_eq!(grads.shape(), &[3, 2, 2, 2]);
    let expects = res.expects().unwrap();
    for b in 0..3 {
        let psi = psi0.index_axis(nd::Axis(0), b);
        for k in 0..2 {
            let x: nd::ArrayView2<C64> = grads.slice(nd::s![b, k, .., ..]);
            let xpsi = x.dot(&psi);
            let predicted: C64
                = psi.iter().zip(xpsi.iter())
                .fold(C64::from(0.0), |acc, (p, xp)| acc + p.conj() * xp);
            assert!((predicted - expects[[b, k, 2]]).norm() < 1e-7);
        }
    }
}

#[test]
fn explosive_problem_underflows() {
    // dψ/dt = 2 ψ / (1/2 - t) blows up at t = 1/2
    let h = TimeOperator::new(
        "H",
        OperatorInput::callable(|t| {
            (nd::Array2::<C64>::eye(2) * C64::new(0.0, 2.0 / (0.5 - t))).into_dyn()
        }),
    ).unwrap();
    let method = match Method::dopri5() {
        Method::Dopri5 { rtol, atol, max_steps, safety_factor, min_factor, max_factor, max_step, h0, .. }
            => Method::Dopri5 {
                rtol, atol, max_steps, safety_factor, min_factor, max_factor, max_step, h0,
                min_step: Some(1e-8),
            },
        other => other,
    };
    let err = sesolve(&h, &ket0(), &[1.0], &[], &config(method)).unwrap_err();
    match err {
        SolveError::Numerical(NumericalError::StepUnderflow { t, dt }) => {
            assert!(t < 0.5 && t > 0.49);
            assert!(dt < 1e-8);
        },
        other => panic!("expected step underflow, got {:?}", other),
    }
}

#[test]
fn eager_validation() {
    let h = TimeOperator::constant("H", &sx()).unwrap();
    let l = TimeOperator::constant("L", &sm()).unwrap();

    let err = sesolve(&h, &ket0(), &[1.0, 0.5], &[], &config(Method::dopri5())).unwrap_err();
    assert!(matches!(err, SolveError::Validation(ValidationError::BadTimes("tsave"))));

    let err = sesolve(&h, &ket0(), &[1.0], &[], &config(Method::Rouchon1 { dt: 0.1 }))
        .unwrap_err();
    assert!(err.to_string().contains("Propagator, Euler, BackwardEuler, Dopri5"));

    let with_grad = SolverConfig::new(Method::dopri5(), Some(Gradient::Adjoint), quiet());
    let err = sesolve(&h, &ket0(), &[1.0], &[], &with_grad).unwrap_err();
    assert!(matches!(err, SolveError::Validation(ValidationError::NoObservables)));

    let rho0 = nd::Array2::<C64>::eye(2) * C64::from(0.5);
    let err = sesolve(&h, &rho0, &[1.0], &[], &config(Method::dopri5())).unwrap_err();
    assert!(matches!(err, SolveError::Validation(ValidationError::Shape { .. })));

    let td = TimeOperator::new(
        "L(t)", OperatorInput::modulated(|t: f64| C64::from(t), &sm())).unwrap();
    let err = mesolve(&h, &[l, td], &rho0, &[1.0], &[], &config(Method::dopri5())).unwrap_err();
    assert!(err.to_string().contains("`L(t)` is time-dependent"));
}
