use crate::equations::SystemOfEquations;
use crate::error::{ErrorLocation, Result, SimError};
use crate::eval_op::{EvalProgram, Integral};
use crate::godley::{EvalGodley, GodleySettings};
use crate::model::Model;
use crate::solvers::{AdaptiveDriver, StepControl, Stepper};
use crate::traits::{DynamicalSystem, Steppable};
use crate::value::{ValueStore, VariableValues};
use anyhow::bail;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info, warn};

/// Integrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub step_min: f64,
    pub step_max: f64,
    /// Steps taken per call to [`Simulation::step`].
    pub n_steps: usize,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// 1, 2 or 4.
    pub order: usize,
    pub implicit: bool,
    pub t0: f64,
    /// Integrate backwards in time.
    pub reverse: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            step_min: 0.0,
            step_max: 0.01,
            n_steps: 1,
            eps_abs: 1e-3,
            eps_rel: 1e-2,
            order: 4,
            implicit: false,
            t0: 0.0,
            reverse: false,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.order, 1 | 2 | 4) {
            bail!("order {} solver not supported", self.order);
        }
        if !(self.step_max > 0.0) {
            bail!("step_max must be positive.");
        }
        if self.step_min < 0.0 || self.step_min > self.step_max {
            bail!("step_min must lie between zero and step_max.");
        }
        if self.eps_abs < 0.0 || self.eps_rel < 0.0 {
            bail!("tolerances must not be negative.");
        }
        Ok(())
    }

    fn step_control(&self) -> StepControl {
        StepControl {
            step_min: self.step_min,
            step_max: self.step_max,
            eps_abs: self.eps_abs,
            eps_rel: self.eps_rel,
        }
    }
}

/// A compiled model viewed as the ODE system `d(stocks)/dt`.
pub struct CompiledModel {
    program: EvalProgram,
    integrals: Vec<Integral>,
    godley: EvalGodley,
    /// Flow vector after reset. Parameters keep their values from here.
    flow_init: Vec<f64>,
    dimension: usize,
    reverse: bool,
}

impl CompiledModel {
    pub fn program(&self) -> &EvalProgram {
        &self.program
    }

    pub fn integrals(&self) -> &[Integral] {
        &self.integrals
    }

    fn time(&self, t: f64) -> f64 {
        if self.reverse {
            -t
        } else {
            t
        }
    }

    fn direction(&self) -> f64 {
        if self.reverse {
            -1.0
        } else {
            1.0
        }
    }

    /// Evaluates every flow from the stock vector `sv` into `fv`.
    pub fn eval_flows(&self, t: f64, sv: &[f64], fv: &mut [f64]) -> Result<()> {
        self.program.eval(fv, sv, self.time(t))
    }

    /// Writes stock derivatives given the flow (or flow derivative) vector
    /// and the matching stock vector.
    fn integrate_into(&self, out: &mut [f64], fv: &[f64], sv: &[f64]) {
        out.fill(0.0);
        self.godley.eval(out, fv);
        // integrals override anything the ledger wrote
        for integral in &self.integrals {
            let source = if integral.input.flow { fv } else { sv };
            for i in 0..integral.stock.width {
                let offset = if integral.input.width == 1 { 0 } else { i };
                if let (Some(d), Some(v)) = (
                    out.get_mut(integral.stock.idx + i),
                    source.get(integral.input.idx + offset),
                ) {
                    *d = *v;
                }
            }
        }
        let direction = self.direction();
        if direction < 0.0 {
            out.iter_mut().for_each(|d| *d *= direction);
        }
    }
}

impl DynamicalSystem for CompiledModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()> {
        let mut fv = self.flow_init.clone();
        self.eval_flows(t, x, &mut fv)?;
        self.integrate_into(out, &fv, x);
        Ok(())
    }

    fn jacobian(&self, t: f64, x: &[f64], jac: &mut DMatrix<f64>) -> Result<()> {
        let mut fv = self.flow_init.clone();
        self.eval_flows(t, x, &mut fv)?;

        let n = self.dimension;
        let mut ds = vec![0.0; n];
        let mut df = vec![0.0; fv.len()];
        let mut d = vec![0.0; n];
        for j in 0..n {
            ds.fill(0.0);
            ds[j] = 1.0;
            df.fill(0.0);
            self.program.deriv(&mut df, &ds, x, &fv)?;
            self.integrate_into(&mut d, &df, &ds);
            for i in 0..n {
                jac[(i, j)] = d[i];
            }
        }
        Ok(())
    }
}

enum Integrator {
    /// Explicit Euler, `n_steps` steps of `step_max`.
    Fixed(Stepper),
    Adaptive(AdaptiveDriver<Stepper>),
}

fn build_integrator(settings: &SolverSettings, dimension: usize) -> Result<Integrator> {
    let stepper = Stepper::new(settings.order, settings.implicit, dimension)?;
    Ok(if stepper.is_explicit_euler() {
        Integrator::Fixed(stepper)
    } else {
        Integrator::Adaptive(AdaptiveDriver::new(
            stepper,
            settings.step_control(),
            dimension,
        ))
    })
}

/// Owns a model, its compiled equations and the simulated state.
pub struct Simulation {
    model: Model,
    settings: SolverSettings,
    godley: GodleySettings,
    store: ValueStore,
    values: VariableValues,
    compiled: Option<CompiledModel>,
    integrator: Option<Integrator>,
    t: f64,
    log_sink: Option<Box<dyn Write>>,
    error_reporter: Option<Box<dyn FnMut(ErrorLocation)>>,
}

impl Simulation {
    pub fn new(model: Model, settings: SolverSettings) -> Self {
        let t = settings.t0;
        Self {
            model,
            settings,
            godley: GodleySettings::default(),
            store: ValueStore::default(),
            values: VariableValues::default(),
            compiled: None,
            integrator: None,
            t,
            log_sink: None,
            error_reporter: None,
        }
    }

    pub fn with_godley_settings(mut self, godley: GodleySettings) -> Self {
        self.godley = godley;
        self.compiled = None;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable access to the model. The next step recompiles.
    pub fn model_mut(&mut self) -> &mut Model {
        self.compiled = None;
        &mut self.model
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Replaces the solver settings. A compiled simulation keeps its time
    /// and stocks and continues with a fresh integrator; `t0` applies from
    /// the next reset.
    pub fn set_settings(&mut self, settings: SolverSettings) -> Result<()> {
        settings
            .validate()
            .map_err(|e| SimError::numeric(format!("invalid solver settings: {e}")))?;
        if let Some(compiled) = self.compiled.as_mut() {
            self.integrator = Some(build_integrator(&settings, compiled.dimension)?);
            compiled.reverse = settings.reverse;
            debug!(t = self.t, order = settings.order, "solver settings replaced");
        }
        self.settings = settings;
        Ok(())
    }

    /// Replaces the accounting settings. A compiled simulation is rebuilt
    /// around the current time and stock values.
    pub fn set_godley_settings(&mut self, godley: GodleySettings) -> Result<()> {
        let previous = std::mem::replace(&mut self.godley, godley);
        if self.compiled.is_none() {
            return Ok(());
        }
        let stocks: Vec<(String, Vec<f64>)> = self
            .values
            .iter()
            .filter_map(|v| {
                let slot = v.slot().filter(|slot| !slot.flow)?;
                Some((v.value_id.clone(), self.store.read(&slot).to_vec()))
            })
            .collect();
        let t = self.t;
        if let Err(err) = self.compile() {
            self.godley = previous;
            return Err(self.report(err));
        }
        for (value_id, data) in &stocks {
            let slot = self.values.get(value_id).and_then(|v| v.slot());
            if let Some(slot) = slot.filter(|slot| !slot.flow && slot.width == data.len()) {
                self.store.write(&slot, data);
            }
        }
        self.t = t;
        if let Some(compiled) = self.compiled.as_ref() {
            let tp = if self.settings.reverse { -t } else { t };
            let mut flows = self.store.flow_vars.clone();
            compiled.eval_flows(tp, &self.store.stock_vars, &mut flows)?;
            self.store.flow_vars = flows;
        }
        Ok(())
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn Write>) {
        self.log_sink = Some(sink);
    }

    pub fn set_error_reporter(&mut self, reporter: Box<dyn FnMut(ErrorLocation)>) {
        self.error_reporter = Some(reporter);
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn stock_vars(&self) -> &[f64] {
        &self.store.stock_vars
    }

    pub fn flow_vars(&self) -> &[f64] {
        &self.store.flow_vars
    }

    pub fn values(&self) -> &VariableValues {
        &self.values
    }

    pub fn compiled(&self) -> Option<&CompiledModel> {
        self.compiled.as_ref()
    }

    /// Current value of a variable, by value id.
    pub fn value(&self, value_id: &str) -> Option<&[f64]> {
        let slot = self.values.get(value_id)?.slot()?;
        Some(self.store.read(&slot))
    }

    /// Forwards an error's item to the reporter. Items inside a group are
    /// reported by canvas position.
    fn report(&mut self, err: SimError) -> SimError {
        if let (Some(id), Some(reporter)) = (err.item(), self.error_reporter.as_mut()) {
            let location = match self.model.item(id) {
                Some(item) if item.scope.is_some() => ErrorLocation::Point {
                    x: item.x,
                    y: item.y,
                },
                _ => ErrorLocation::Item(id),
            };
            reporter(location);
        }
        err
    }

    fn system(&self) -> Result<SystemOfEquations<'_>> {
        let values = VariableValues::from_model(&self.model)?;
        SystemOfEquations::new(&self.model, values, self.godley)
    }

    /// Recompiles the model, restores initial values and rewinds time.
    pub fn reset(&mut self) -> Result<()> {
        self.compiled = None;
        self.integrator = None;
        match self.compile() {
            Ok(()) => {
                self.write_log_header();
                Ok(())
            }
            Err(err) => Err(self.report(err)),
        }
    }

    fn compile(&mut self) -> Result<()> {
        self.settings
            .validate()
            .map_err(|e| SimError::numeric(format!("invalid solver settings: {e}")))?;

        let mut store = ValueStore::default();
        let mut system = self.system()?;
        let (program, integrals) = system.populate_eval_ops(&mut store)?;
        let values = system.into_values();
        values.reset(&mut store)?;
        let godley = EvalGodley::initialise(&self.model, &values, &store, &self.godley)?;

        let dimension = store.stock_vars.len();
        let integrator = build_integrator(&self.settings, dimension)?;

        info!(
            instructions = program.len(),
            stocks = dimension,
            flows = store.flow_vars.len(),
            godley = godley.len(),
            "model compiled"
        );
        self.compiled = Some(CompiledModel {
            program,
            integrals,
            godley,
            flow_init: store.flow_vars.clone(),
            dimension,
            reverse: self.settings.reverse,
        });
        self.integrator = Some(integrator);
        self.values = values;
        self.store = store;
        self.t = self.settings.t0;
        Ok(())
    }

    /// Advances the simulation by `n_steps` steps. On failure the stocks
    /// and time keep their values from before the call.
    pub fn step(&mut self) -> Result<()> {
        if self.settings.n_steps == 0 {
            return Ok(());
        }
        if self.compiled.is_none() {
            self.reset()?;
        }
        match self.advance() {
            Ok(()) => {
                self.write_log_line();
                Ok(())
            }
            Err(err) => Err(self.report(err)),
        }
    }

    fn advance(&mut self) -> Result<()> {
        let (Some(compiled), Some(integrator)) = (self.compiled.as_ref(), self.integrator.as_mut())
        else {
            return Err(SimError::structural("model not compiled"));
        };
        let settings = &self.settings;
        let mut stocks = self.store.stock_vars.clone();
        let mut tp = if settings.reverse { -self.t } else { self.t };

        match integrator {
            Integrator::Fixed(stepper) => {
                let h = settings.step_max;
                let mut next = vec![0.0; stocks.len()];
                let mut err = vec![0.0; stocks.len()];
                for _ in 0..settings.n_steps {
                    stepper.try_step(compiled, tp, &stocks, h, &mut next, &mut err)?;
                    std::mem::swap(&mut stocks, &mut next);
                    tp += h;
                }
            }
            Integrator::Adaptive(driver) => {
                for _ in 0..settings.n_steps {
                    driver.step(compiled, &mut tp, &mut stocks)?;
                }
            }
        }

        let mut flows = self.store.flow_vars.clone();
        compiled.eval_flows(tp, &stocks, &mut flows)?;
        self.store.stock_vars = stocks;
        self.store.flow_vars = flows;
        self.t = if settings.reverse { -tp } else { tp };
        debug!(t = self.t, "step complete");
        Ok(())
    }

    /// Jacobian of the stock derivatives at the current state.
    pub fn jacobian(&mut self) -> Result<DMatrix<f64>> {
        if self.compiled.is_none() {
            self.reset()?;
        }
        let Some(compiled) = self.compiled.as_ref() else {
            return Err(SimError::structural("model not compiled"));
        };
        let n = compiled.dimension();
        let mut jac = DMatrix::zeros(n, n);
        let tp = if self.settings.reverse { -self.t } else { self.t };
        let result = compiled.jacobian(tp, &self.store.stock_vars, &mut jac);
        match result {
            Ok(()) => Ok(jac),
            Err(err) => Err(self.report(err)),
        }
    }

    pub fn matlab(&self) -> Result<String> {
        self.system()?.matlab()
    }

    pub fn latex(&self) -> Result<String> {
        self.system()?.latex()
    }

    /// Named variables with storage, in value id order.
    fn logged_values(&self) -> Vec<(String, Vec<f64>)> {
        self.values
            .iter()
            .filter_map(|v| {
                let slot = v.slot()?;
                Some((v.name.clone(), self.store.read(&slot).to_vec()))
            })
            .collect()
    }

    fn write_log_header(&mut self) {
        if self.log_sink.is_none() {
            return;
        }
        let mut line = String::from("time");
        for (name, data) in self.logged_values() {
            if data.len() == 1 {
                line.push(' ');
                line.push_str(&name);
            } else {
                for i in 0..data.len() {
                    line.push_str(&format!(" {name}[{i}]"));
                }
            }
        }
        self.write_log(&line);
    }

    fn write_log_line(&mut self) {
        if self.log_sink.is_none() {
            return;
        }
        let mut line = self.t.to_string();
        for (_, data) in self.logged_values() {
            for x in data {
                line.push(' ');
                line.push_str(&x.to_string());
            }
        }
        self.write_log(&line);
    }

    fn write_log(&mut self, line: &str) {
        if let Some(sink) = self.log_sink.as_mut() {
            if let Err(e) = writeln!(sink, "{line}") {
                warn!(error = %e, "failed to write simulation log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use crate::value::VariableType;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn assert_err_contains<T>(result: anyhow::Result<T>, needle: &str) {
        match result {
            Ok(_) => panic!("expected error containing '{needle}'"),
            Err(err) => assert!(
                err.to_string().contains(needle),
                "error '{err}' does not contain '{needle}'"
            ),
        }
    }

    /// A stock `s` integrating a parameter `rate`.
    fn constant_growth(rate: &str) -> Model {
        let mut model = Model::new();
        let r = model.add_variable("rate", VariableType::Parameter, rate);
        let s = model.add_integral("s", "0");
        model.connect(r, s, 1);
        model
    }

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn settings_validation() {
        assert!(SolverSettings::default().validate().is_ok());
        let bad_order = SolverSettings {
            order: 3,
            ..Default::default()
        };
        assert_err_contains(bad_order.validate(), "order 3");
        let bad_step = SolverSettings {
            step_max: 0.0,
            ..Default::default()
        };
        assert_err_contains(bad_step.validate(), "step_max");
        let inverted = SolverSettings {
            step_min: 1.0,
            step_max: 0.5,
            ..Default::default()
        };
        assert_err_contains(inverted.validate(), "step_min");
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SolverSettings =
            serde_json::from_str(r#"{"order": 2, "implicit": true}"#).expect("json");
        assert_eq!(settings.order, 2);
        assert!(settings.implicit);
        assert_eq!(settings.step_max, 0.01);
    }

    #[test]
    fn zero_steps_do_nothing() {
        let settings = SolverSettings {
            n_steps: 0,
            ..Default::default()
        };
        let mut sim = Simulation::new(constant_growth("1"), settings);
        sim.step().expect("step");
        assert!(sim.compiled().is_none());
        assert_eq!(sim.t(), 0.0);
    }

    #[test]
    fn adaptive_step_integrates_linear_growth() {
        let mut sim = Simulation::new(constant_growth("2"), SolverSettings::default());
        sim.reset().expect("reset");
        sim.step().expect("step");
        let s = sim.value(":s").expect("s")[0];
        assert!((s - 2.0 * sim.t()).abs() < 1e-12);
        assert!(sim.t() > 0.0 && sim.t() <= 0.01 + 1e-15);
    }

    #[test]
    fn reverse_time_runs_backwards() {
        let settings = SolverSettings {
            order: 1,
            reverse: true,
            n_steps: 4,
            ..Default::default()
        };
        let mut sim = Simulation::new(constant_growth("1"), settings);
        sim.step().expect("step");
        assert!((sim.t() + 0.04).abs() < 1e-12);
        assert!((sim.value(":s").expect("s")[0] + 0.04).abs() < 1e-12);
    }

    #[test]
    fn jacobian_of_exponential_growth() {
        let mut model = Model::new();
        let k = model.add_variable("k", VariableType::Parameter, "0.5");
        let mul = model.add_operation(OperationType::Multiply);
        let s = model.add_integral("s", "1");
        model.connect(k, mul, 1);
        model.connect(s, mul, 2);
        model.connect(mul, s, 1);
        let mut sim = Simulation::new(model, SolverSettings::default());
        let jac = sim.jacobian().expect("jacobian");
        assert_eq!(jac.nrows(), 1);
        assert!((jac[(0, 0)] - 0.5).abs() < 1e-12);
    }

    fn euler_steps(n_steps: usize, step_max: f64) -> SolverSettings {
        SolverSettings {
            order: 1,
            n_steps,
            step_max,
            ..Default::default()
        }
    }

    #[test]
    fn changing_step_size_continues_from_current_state() {
        let mut sim = Simulation::new(constant_growth("1"), euler_steps(10, 0.1));
        sim.step().expect("step");
        assert!((sim.t() - 1.0).abs() < 1e-12);

        sim.set_settings(euler_steps(10, 0.01)).expect("settings");
        sim.step().expect("step");
        assert!((sim.t() - 1.1).abs() < 1e-12);
        assert!((sim.value(":s").expect("s")[0] - 1.1).abs() < 1e-12);

        let adaptive = SolverSettings {
            n_steps: 3,
            ..Default::default()
        };
        sim.set_settings(adaptive).expect("settings");
        sim.step().expect("step");
        assert!(sim.t() > 1.1);
        assert!((sim.value(":s").expect("s")[0] - sim.t()).abs() < 1e-12);
    }

    #[test]
    fn invalid_settings_leave_the_simulation_untouched() {
        let mut sim = Simulation::new(constant_growth("1"), euler_steps(2, 0.5));
        sim.step().expect("step");
        let bad = SolverSettings {
            order: 3,
            ..Default::default()
        };
        let err = sim.set_settings(bad).expect_err("order 3");
        assert!(err.to_string().contains("order 3"), "{err}");
        assert_eq!(sim.settings().order, 1);
        sim.step().expect("step");
        assert!((sim.t() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn godley_settings_change_keeps_time_and_stocks() {
        let mut sim = Simulation::new(constant_growth("2"), euler_steps(5, 0.1));
        sim.step().expect("step");
        sim.set_godley_settings(GodleySettings {
            compatibility: true,
            double_entry_compliant: true,
        })
        .expect("godley settings");
        assert!((sim.t() - 0.5).abs() < 1e-12);
        assert!((sim.value(":s").expect("s")[0] - 1.0).abs() < 1e-12);
        sim.step().expect("step");
        assert!((sim.value(":s").expect("s")[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn compile_errors_reach_the_reporter() {
        let mut model = Model::new();
        let a = model.add_variable("a", VariableType::Flow, "");
        let b = model.add_variable("b", VariableType::Flow, "");
        let add = model.add_operation(OperationType::Add);
        model.connect(a, add, 1);
        model.connect(add, b, 1);
        model.connect(b, a, 1);
        let reported = Rc::new(RefCell::new(Vec::new()));
        let sink = reported.clone();
        let mut sim = Simulation::new(model, SolverSettings::default());
        sim.set_error_reporter(Box::new(move |loc| sink.borrow_mut().push(loc)));
        let err = sim.reset().expect_err("cycle");
        assert!(matches!(err, SimError::Structural { .. }));
        if let Some(item) = err.item() {
            assert_eq!(reported.borrow().as_slice(), &[ErrorLocation::Item(item)]);
        }
    }

    #[test]
    fn scoped_items_are_reported_by_position() {
        let mut model = Model::new();
        let x = model.add_variable("x", VariableType::Parameter, "-1");
        let ln = model.add_operation(OperationType::Ln);
        let y = model.add_variable("y", VariableType::Flow, "");
        model.connect(x, ln, 1);
        model.connect(ln, y, 1);
        model.set_scope(ln, "group");
        model.set_position(ln, 3.0, 4.0);
        let reported = Rc::new(RefCell::new(Vec::new()));
        let sink = reported.clone();
        let mut sim = Simulation::new(model, SolverSettings::default());
        sim.set_error_reporter(Box::new(move |loc| sink.borrow_mut().push(loc)));
        let err = sim.step().expect_err("ln(-1)");
        assert_eq!(err.item(), Some(ln));
        assert_eq!(
            reported.borrow().as_slice(),
            &[ErrorLocation::Point { x: 3.0, y: 4.0 }]
        );
    }

    #[test]
    fn log_sink_receives_header_and_rows() {
        let sink = SharedSink::default();
        let settings = SolverSettings {
            order: 1,
            ..Default::default()
        };
        let mut sim = Simulation::new(constant_growth("1"), settings);
        sim.set_log_sink(Box::new(sink.clone()));
        sim.reset().expect("reset");
        sim.step().expect("step");
        let text = String::from_utf8(sink.0.borrow().clone()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time rate s");
        assert_eq!(lines[1], "0.01 1 0.01");
    }

    #[test]
    fn exports_use_the_owned_model() {
        let sim = Simulation::new(constant_growth("1"), SolverSettings::default());
        assert!(sim.matlab().expect("matlab").contains("f(1)=rate;"));
        assert!(sim.latex().expect("latex").contains("\\frac{ d s}{dt} &=&\\mathrm{rate}\\\\"));
    }
}
