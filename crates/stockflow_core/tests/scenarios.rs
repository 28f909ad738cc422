use float_cmp::approx_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;
use stockflow_core::{
    AssetClass, ErrorLocation, GodleyTable, Model, OperationType, SimError, Simulation,
    SolverSettings, VariableType,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn euler(n_steps: usize, step_max: f64) -> SolverSettings {
    SolverSettings {
        order: 1,
        n_steps,
        step_max,
        ..Default::default()
    }
}

fn value(sim: &Simulation, value_id: &str) -> f64 {
    sim.value(value_id)
        .and_then(|v| v.first().copied())
        .unwrap_or_else(|| panic!("no value for {value_id}"))
}

#[test]
fn euler_integrates_a_constant_flow_exactly() {
    init_tracing();
    let mut model = Model::new();
    let r = model.add_variable("r", VariableType::Parameter, "0.5");
    let s = model.add_integral("S", "0");
    model.connect(r, s, 1);

    let (n, h) = (8, 0.25);
    let mut sim = Simulation::new(model, euler(n, h));
    sim.reset().expect("reset");
    sim.step().expect("step");
    assert!(approx_eq!(f64, value(&sim, ":S"), n as f64 * h * 0.5, ulps = 4));
    assert!(approx_eq!(f64, sim.t(), n as f64 * h, ulps = 4));
}

#[test]
fn shared_interest_flow_conserves_money() {
    init_tracing();
    let mut model = Model::new();
    model.add_variable("interest", VariableType::Parameter, "3");
    let table = GodleyTable::new(vec![
        vec!["".into(), "Cash".into(), "Loan".into()],
        vec!["initial conditions".into(), "100".into(), "100".into()],
        vec!["".into(), "interest".into(), "-interest".into()],
    ])
    .with_asset_classes(vec![
        AssetClass::NoAssetClass,
        AssetClass::Asset,
        AssetClass::Liability,
    ]);
    model.add_godley(table);

    let mut sim = Simulation::new(model, euler(1, 0.1));
    sim.reset().expect("reset");
    let (cash, loan) = (value(&sim, ":Cash"), value(&sim, ":Loan"));
    assert_eq!((cash, loan), (100.0, 100.0));
    sim.step().expect("step");
    let d_cash = value(&sim, ":Cash") - cash;
    let d_loan = value(&sim, ":Loan") - loan;
    assert!(approx_eq!(f64, d_cash, 0.3, epsilon = 1e-12));
    assert!(approx_eq!(f64, d_cash, -d_loan, epsilon = 1e-12));
}

#[test]
fn invalid_log_aborts_the_step_and_keeps_stocks() {
    init_tracing();
    let mut model = Model::new();
    let one = model.add_variable("one", VariableType::Parameter, "1");
    let s = model.add_integral("s", "2");
    model.connect(one, s, 1);
    let x = model.add_variable("x", VariableType::Constant, "-1");
    let ln = model.add_operation(OperationType::Ln);
    let y = model.add_variable("y", VariableType::Flow, "");
    model.connect(x, ln, 1);
    model.connect(ln, y, 1);

    let reported = Rc::new(RefCell::new(Vec::new()));
    let sink = reported.clone();
    let mut sim = Simulation::new(model, SolverSettings::default());
    sim.set_error_reporter(Box::new(move |loc| sink.borrow_mut().push(loc)));
    sim.reset().expect("reset");
    let before = sim.stock_vars().to_vec();

    let err = sim.step().expect_err("ln(-1)");
    assert!(matches!(err, SimError::Numeric { .. }));
    assert!(err.to_string().contains("ln"), "{err}");
    assert_eq!(err.item(), Some(ln));
    assert_eq!(sim.stock_vars(), before.as_slice());
    assert_eq!(sim.t(), 0.0);
    assert_eq!(reported.borrow().as_slice(), &[ErrorLocation::Item(ln)]);
}

#[test]
fn switch_selects_case_by_floor_of_control() {
    let mut model = Model::new();
    let control = model.add_variable("c", VariableType::Parameter, "1.5");
    let cases: Vec<_> = [10.0, 20.0, 30.0]
        .iter()
        .enumerate()
        .map(|(i, v)| model.add_variable(&format!("case{i}"), VariableType::Parameter, &v.to_string()))
        .collect();
    let sw = model.add_switch(3);
    model.connect(control, sw, 1);
    for (i, &case) in cases.iter().enumerate() {
        model.connect(case, sw, i + 2);
    }
    let out = model.add_variable("out", VariableType::Flow, "");
    model.connect(sw, out, 1);

    let mut sim = Simulation::new(model, euler(1, 0.01));
    sim.step().expect("step");
    assert_eq!(value(&sim, ":out"), 20.0);
}

#[test]
fn multiplying_by_a_literal_zero_skips_the_product() {
    let mut model = Model::new();
    let zero = model.add_variable("z", VariableType::Constant, "0");
    let p = model.add_variable("p", VariableType::Parameter, "7");
    let mul = model.add_operation(OperationType::Multiply);
    let out = model.add_variable("out", VariableType::Flow, "");
    model.connect(zero, mul, 1);
    model.connect(p, mul, 2);
    model.connect(mul, out, 1);

    let mut sim = Simulation::new(model, euler(1, 0.01));
    sim.step().expect("step");
    assert_eq!(value(&sim, ":out"), 0.0);
    let program = sim.compiled().expect("compiled").program();
    assert!(program.iter().all(|op| op.op != OperationType::Multiply));
}

#[test]
fn cyclic_network_is_rejected_before_evaluation() {
    let mut model = Model::new();
    let a = model.add_variable("a", VariableType::Flow, "");
    let sin = model.add_operation(OperationType::Sin);
    model.connect(a, sin, 1);
    model.connect(sin, a, 1);

    let mut sim = Simulation::new(model, SolverSettings::default());
    let err = sim.reset().expect_err("cycle");
    assert!(matches!(err, SimError::Structural { .. }));
    assert!(sim.compiled().is_none());
}

#[test]
fn integral_feedback_is_not_a_cycle() {
    // ds/dt = -s, integrated with RKF45
    let mut model = Model::new();
    let s = model.add_integral("s", "1");
    let minus = model.add_operation(OperationType::Subtract);
    model.connect(s, minus, 2);
    model.connect(minus, s, 1);

    let settings = SolverSettings {
        n_steps: 100,
        step_max: 0.01,
        eps_abs: 1e-10,
        eps_rel: 1e-10,
        ..Default::default()
    };
    let mut sim = Simulation::new(model, settings);
    sim.step().expect("step");
    let t = sim.t();
    assert!(t > 0.0);
    assert!(approx_eq!(f64, value(&sim, ":s"), (-t).exp(), epsilon = 1e-7));
}

/// `ds/dt = -k s` with a stiff `k`, solved by each implicit method.
fn stiff_decay(order: usize) -> Simulation {
    let mut model = Model::new();
    let k = model.add_variable("k", VariableType::Parameter, "50");
    let s = model.add_integral("s", "1");
    let mul = model.add_operation(OperationType::Multiply);
    let minus = model.add_operation(OperationType::Subtract);
    model.connect(k, mul, 1);
    model.connect(s, mul, 2);
    model.connect(mul, minus, 2);
    model.connect(minus, s, 1);
    let settings = SolverSettings {
        order,
        implicit: true,
        n_steps: 20,
        step_max: 0.05,
        eps_abs: 1e-6,
        eps_rel: 1e-6,
        ..Default::default()
    };
    Simulation::new(model, settings)
}

#[test]
fn implicit_solvers_follow_exponential_decay() {
    init_tracing();
    for order in [1, 2, 4] {
        let mut sim = stiff_decay(order);
        sim.step().expect("step");
        let t = sim.t();
        let s = value(&sim, ":s");
        assert!(t > 0.0);
        assert!(
            (s - (-50.0 * t).exp()).abs() < 1e-4,
            "order {order}: s({t}) = {s}"
        );
    }
}

/// Builds `f(s)` for a stock `s` with `ds/dt = r`, and `df` wired to the
/// symbolic derivative of `f`.
fn differentiated(op: OperationType, s0: f64, r: f64) -> Model {
    let mut model = Model::new();
    let rate = model.add_variable("r", VariableType::Parameter, &r.to_string());
    let s = model.add_integral("s", &s0.to_string());
    model.connect(rate, s, 1);
    let f = model.add_operation(op);
    model.connect(s, f, 1);
    let d = model.add_operation(OperationType::Differentiate);
    model.connect(f, d, 1);
    let df = model.add_variable("df", VariableType::Flow, "");
    model.connect(d, df, 1);
    model
}

#[test]
fn symbolic_derivatives_match_central_differences() {
    let functions: [(OperationType, fn(f64) -> f64); 7] = [
        (OperationType::Sin, f64::sin),
        (OperationType::Cos, f64::cos),
        (OperationType::Exp, f64::exp),
        (OperationType::Ln, f64::ln),
        (OperationType::Sqrt, f64::sqrt),
        (OperationType::Tanh, f64::tanh),
        (OperationType::Atan, f64::atan),
    ];
    let mut rng = StdRng::seed_from_u64(17);
    for (op, f) in functions {
        for _ in 0..5 {
            let s0: f64 = rng.random_range(0.5..2.0);
            let r: f64 = rng.random_range(-1.0..1.0);
            let mut sim = Simulation::new(differentiated(op, s0, r), euler(1, 1e-3));
            sim.step().expect("step");
            let s = value(&sim, ":s");
            let h = 1e-5;
            let expected = (f(s + h) - f(s - h)) / (2.0 * h) * r;
            let actual = value(&sim, ":df");
            assert!(
                approx_eq!(f64, actual, expected, epsilon = 1e-6),
                "{op} at {s}: {actual} vs {expected}"
            );
        }
    }
}

/// Like [`differentiated`], for a binary operation whose second port is
/// wired to a parameter `p`.
fn differentiated_binary(op: OperationType, s0: f64, r: f64, p: f64) -> Model {
    let mut model = Model::new();
    let rate = model.add_variable("r", VariableType::Parameter, &r.to_string());
    let s = model.add_integral("s", &s0.to_string());
    model.connect(rate, s, 1);
    let param = model.add_variable("p", VariableType::Parameter, &p.to_string());
    let f = model.add_operation(op);
    model.connect(s, f, 1);
    model.connect(param, f, 2);
    let d = model.add_operation(OperationType::Differentiate);
    model.connect(f, d, 1);
    let df = model.add_variable("df", VariableType::Flow, "");
    model.connect(d, df, 1);
    model
}

#[test]
fn power_rule_matches_analytic_derivative() {
    let mut rng = StdRng::seed_from_u64(23);
    for _ in 0..5 {
        let s0: f64 = rng.random_range(0.5..2.0);
        let r: f64 = rng.random_range(-1.0..1.0);
        let y: f64 = rng.random_range(-2.0..3.0);
        let model = differentiated_binary(OperationType::Pow, s0, r, y);
        let mut sim = Simulation::new(model, euler(1, 1e-3));
        sim.step().expect("step");
        let s = value(&sim, ":s");
        let expected = y * s.powf(y - 1.0) * r;
        let actual = value(&sim, ":df");
        assert!(
            approx_eq!(f64, actual, expected, epsilon = 1e-9),
            "d(s^{y}) at {s}: {actual} vs {expected}"
        );
    }
}

#[test]
fn min_and_max_follow_the_selected_argument() {
    // s stays near 1 and the threshold p sits either side of it
    let cases = [
        (OperationType::Min, 1.5, 0.7),
        (OperationType::Min, 0.5, 0.0),
        (OperationType::Max, 1.5, 0.0),
        (OperationType::Max, 0.5, 0.7),
    ];
    for (op, p, expected) in cases {
        let mut sim = Simulation::new(differentiated_binary(op, 1.0, 0.7, p), euler(1, 1e-3));
        sim.step().expect("step");
        let actual = value(&sim, ":df");
        assert!(
            approx_eq!(f64, actual, expected, epsilon = 1e-12),
            "{op} with p = {p}: {actual}"
        );
    }
}

#[test]
fn jacobian_matches_the_linear_system() {
    // ds/dt = k s
    let mut model = Model::new();
    let k = model.add_variable("k", VariableType::Parameter, "-2");
    let s = model.add_integral("s", "1");
    let mul = model.add_operation(OperationType::Multiply);
    model.connect(k, mul, 1);
    model.connect(s, mul, 2);
    model.connect(mul, s, 1);

    let mut sim = Simulation::new(model, SolverSettings::default());
    let jac = sim.jacobian().expect("jacobian");
    assert_eq!(jac.shape(), (1, 1));
    assert!(approx_eq!(f64, jac[(0, 0)], -2.0, ulps = 2));
}

#[test]
fn model_round_trips_through_json() {
    let mut model = Model::new();
    let r = model.add_variable("r", VariableType::Parameter, "1");
    let s = model.add_integral("s", "0");
    model.connect(r, s, 1);
    let json = serde_json::to_string(&model).expect("serialize");
    let decoded: Model = serde_json::from_str(&json).expect("deserialize");

    let mut sim = Simulation::new(decoded, euler(10, 0.1));
    sim.step().expect("step");
    assert!(approx_eq!(f64, value(&sim, ":s"), 1.0, epsilon = 1e-12));
}
