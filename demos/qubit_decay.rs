use std::f64::consts::PI;
use ndarray as nd;
use num_complex::Complex64 as C64;
use qevolve::{
    mesolve,
    smesolve,
    Measurement,
    Method,
    OperatorInput,
    Options,
    SolverConfig,
    TimeOperator,
};

// driven, decaying qubit: compare the exact propagator with adaptive stepping,
// then follow a continuously monitored trajectory

fn main() {
    const RABI_FREQ: f64 = 2.0 * PI; // drive strength
    const GAMMA: f64 = 0.5; // decay rate

    let sx: nd::Array2<C64> = nd::array![
        [C64::from(0.0), C64::from(1.0)],
        [C64::from(1.0), C64::from(0.0)],
    ];
    let sm: nd::Array2<C64> = nd::array![
        [C64::from(0.0), C64::from(1.0)],
        [C64::from(0.0), C64::from(0.0)],
    ];
    let proj_e: nd::Array2<C64> = nd::array![
        [C64::from(0.0), C64::from(0.0)],
        [C64::from(0.0), C64::from(1.0)],
    ];
    let ground: nd::Array2<C64> = nd::array![[C64::from(1.0)], [C64::from(0.0)]];

    let h = TimeOperator::constant("H", &(&sx * C64::from(RABI_FREQ / 2.0))).unwrap();
    let l = TimeOperator::constant("L", &(&sm * C64::from(GAMMA.sqrt()))).unwrap();
    let tsave: Vec<f64> = nd::Array1::linspace(0.0, 4.0, 41).to_vec();
    let exp_ops = [proj_e.clone()];
    let opts = Options { verbose: false, ..Options::default() };

    // closed-form propagation vs. Dopri5
    let exact = mesolve(
        &h, &[l.clone()], &ground, &tsave, &exp_ops,
        &SolverConfig::new(Method::Propagator, None, opts),
    ).unwrap();
    let adaptive = mesolve(
        &h, &[l.clone()], &ground, &tsave, &exp_ops,
        &SolverConfig::new(Method::dopri5_tol(1e-8, 1e-10), None, opts),
    ).unwrap();
    let pe_exact = exact.expects().unwrap();
    let pe_adaptive = adaptive.expects().unwrap();
    let max_dev: f64
        = pe_exact.iter().zip(pe_adaptive.iter())
        .map(|(a, b)| (a - b).norm())
        .fold(0.0, f64::max);
    println!("max deviation propagator/dopri5: {:.3e}", max_dev);
    println!("dopri5 stats: {:?}", adaptive.stats());

    // switch the drive off halfway through with a piecewise-constant envelope
    let pulse = TimeOperator::new(
        "H_pulse",
        OperatorInput::pwc(
            &[0.0, 2.0],
            &nd::array![C64::from(RABI_FREQ / 2.0)],
            &sx,
        ),
    ).unwrap();
    let pulsed = mesolve(
        &pulse, &[l.clone()], &ground, &tsave, &exp_ops,
        &SolverConfig::new(Method::dopri5(), None, opts),
    ).unwrap();
    println!(
        "excited population at t = 4 (pulsed): {:.4}",
        pulsed.expects().unwrap()[[0, tsave.len() - 1]].re,
    );

    // monitored trajectories of the same system
    let tmeas: Vec<f64> = nd::Array1::linspace(0.0, 4.0, 9).to_vec();
    let measurement = Measurement::new(&[1.0])
        .with_tmeas(&tmeas)
        .with_ntrajs(4)
        .with_seed(10546);
    let monitored = smesolve(
        &h, &[l], &ground, &tsave, &exp_ops, &measurement,
        &SolverConfig::new(Method::Rouchon1 { dt: 1e-3 }, None, opts),
    ).unwrap();
    let record = monitored.measurements().unwrap();
    println!("measurement record shape: {:?}", record.shape());
    for (k, traj) in record.outer_iter().enumerate() {
        let signal: Vec<String>
            = traj.iter().map(|x| format!("{:+.2}", x)).collect();
        println!("trajectory {}: [{}]", k, signal.join(", "));
    }
}
