//! A simulation handle for JavaScript hosts.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use stockflow_core::{GodleySettings, Model, Simulation, SolverSettings};
use wasm_bindgen::prelude::*;

fn to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

fn decode_settings(settings_val: JsValue) -> Result<SolverSettings> {
    let settings: SolverSettings = if settings_val.is_undefined() || settings_val.is_null() {
        SolverSettings::default()
    } else {
        from_value(settings_val)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("Invalid solver settings")?
    };
    settings.validate()?;
    Ok(settings)
}

#[derive(Serialize)]
struct VariableInfo {
    value_id: String,
    name: String,
    kind: &'static str,
}

#[wasm_bindgen]
pub struct WasmSimulation {
    simulation: Simulation,
}

#[wasm_bindgen]
impl WasmSimulation {
    /// `model_val` is a serialized `Model`; `settings_val` an optional
    /// `SolverSettings` object.
    #[wasm_bindgen(constructor)]
    pub fn new(model_val: JsValue, settings_val: JsValue) -> Result<WasmSimulation, JsValue> {
        console_error_panic_hook::set_once();

        let model: Model = from_value(model_val)
            .map_err(|e| JsValue::from_str(&format!("Invalid model: {}", e)))?;
        let settings = decode_settings(settings_val).map_err(to_js)?;
        Ok(WasmSimulation {
            simulation: Simulation::new(model, settings),
        })
    }

    pub fn set_godley_settings(
        &mut self,
        compatibility: bool,
        double_entry_compliant: bool,
    ) -> Result<(), JsValue> {
        self.simulation
            .set_godley_settings(GodleySettings {
                compatibility,
                double_entry_compliant,
            })
            .context("Failed to apply accounting settings")
            .map_err(to_js)
    }

    /// Takes effect immediately; time and stocks carry over.
    pub fn set_settings(&mut self, settings_val: JsValue) -> Result<(), JsValue> {
        let settings = decode_settings(settings_val).map_err(to_js)?;
        self.simulation
            .set_settings(settings)
            .context("Failed to apply solver settings")
            .map_err(to_js)
    }

    pub fn reset(&mut self) -> Result<(), JsValue> {
        self.simulation
            .reset()
            .context("Failed to compile model")
            .map_err(to_js)
    }

    pub fn step(&mut self) -> Result<(), JsValue> {
        self.simulation
            .step()
            .with_context(|| format!("Simulation failed at t = {}", self.simulation.t()))
            .map_err(to_js)
    }

    pub fn t(&self) -> f64 {
        self.simulation.t()
    }

    pub fn stock_vars(&self) -> Vec<f64> {
        self.simulation.stock_vars().to_vec()
    }

    pub fn flow_vars(&self) -> Vec<f64> {
        self.simulation.flow_vars().to_vec()
    }

    /// Current value of a variable by value id, e.g. `":x"`.
    pub fn value(&self, value_id: &str) -> Result<Vec<f64>, JsValue> {
        self.simulation
            .value(value_id)
            .map(<[f64]>::to_vec)
            .ok_or_else(|| JsValue::from_str(&format!("Unknown variable: {}", value_id)))
    }

    /// Every variable with storage, in value id order.
    pub fn variables(&self) -> Result<JsValue, JsValue> {
        let variables: Vec<VariableInfo> = self
            .simulation
            .values()
            .iter()
            .filter(|v| v.slot().is_some())
            .map(|v| VariableInfo {
                value_id: v.value_id.clone(),
                name: v.name.clone(),
                kind: v.kind.name(),
            })
            .collect();
        to_value(&variables).map_err(|e| JsValue::from_str(&format!("Failed to serialize: {}", e)))
    }

    /// Row-major Jacobian of the stock derivatives.
    pub fn jacobian(&mut self) -> Result<Vec<f64>, JsValue> {
        let jac = self
            .simulation
            .jacobian()
            .context("Failed to compute Jacobian")
            .map_err(to_js)?;
        let n = jac.nrows();
        let mut out = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                out[i * n + j] = jac[(i, j)];
            }
        }
        Ok(out)
    }

    pub fn matlab(&self) -> Result<String, JsValue> {
        self.simulation.matlab().context("Failed to export").map_err(to_js)
    }

    pub fn latex(&self) -> Result<String, JsValue> {
        self.simulation.latex().context("Failed to export").map_err(to_js)
    }
}

#[cfg(test)]
mod tests {
    use super::WasmSimulation;
    use serde_wasm_bindgen::to_value;
    use stockflow_core::{Model, SolverSettings, VariableType};
    use wasm_bindgen::JsValue;
    use wasm_bindgen_test::wasm_bindgen_test;

    fn growth_model() -> JsValue {
        let mut model = Model::new();
        let r = model.add_variable("r", VariableType::Parameter, "2");
        let s = model.add_integral("s", "1");
        model.connect(r, s, 1);
        to_value(&model).expect("model")
    }

    #[wasm_bindgen_test]
    fn steps_a_serialized_model() {
        let settings = SolverSettings {
            order: 1,
            n_steps: 5,
            step_max: 0.1,
            ..Default::default()
        };
        let mut sim =
            WasmSimulation::new(growth_model(), to_value(&settings).expect("settings")).expect("new");
        sim.reset().expect("reset");
        sim.step().expect("step");
        let s = sim.value(":s").expect("s");
        assert!((s[0] - 2.0).abs() < 1e-12);
        assert!((sim.t() - 0.5).abs() < 1e-12);
    }

    #[wasm_bindgen_test]
    fn rejects_unsupported_order() {
        let settings = SolverSettings {
            order: 3,
            ..Default::default()
        };
        let result = WasmSimulation::new(growth_model(), to_value(&settings).expect("settings"));
        let message = result.err().and_then(|err| err.as_string()).unwrap_or_default();
        assert!(message.contains("order 3"));
    }

    #[wasm_bindgen_test]
    fn new_settings_continue_the_run() {
        let settings = |step_max| SolverSettings {
            order: 1,
            n_steps: 10,
            step_max,
            ..Default::default()
        };
        let mut sim =
            WasmSimulation::new(growth_model(), to_value(&settings(0.1)).expect("settings"))
                .expect("new");
        sim.step().expect("step");
        sim.set_settings(to_value(&settings(0.01)).expect("settings"))
            .expect("set_settings");
        sim.step().expect("step");
        assert!((sim.t() - 1.1).abs() < 1e-12);
        sim.set_godley_settings(true, false).expect("godley");
        assert!((sim.t() - 1.1).abs() < 1e-12);
        assert!((sim.value(":s").expect("s")[0] - 3.2).abs() < 1e-12);
    }

    #[wasm_bindgen_test]
    fn jacobian_is_row_major() {
        let mut sim = WasmSimulation::new(growth_model(), JsValue::UNDEFINED).expect("new");
        assert_eq!(sim.jacobian().expect("jacobian"), vec![0.0]);
    }
}
