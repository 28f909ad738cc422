use crate::error::{Result, SimError};
use crate::traits::{DynamicalSystem, Steppable};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Forward Euler. Reports no error estimate, so it is only driven with a
/// fixed step.
pub struct ExplicitEuler {
    k: Vec<f64>,
}

impl ExplicitEuler {
    pub fn new(dim: usize) -> Self {
        Self { k: vec![0.0; dim] }
    }
}

impl Steppable for ExplicitEuler {
    fn order(&self) -> usize {
        1
    }

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()> {
        system.apply(t, state, &mut self.k)?;
        for i in 0..state.len() {
            out[i] = state[i] + dt * self.k[i];
            err[i] = 0.0;
        }
        Ok(())
    }
}

/// Heun's method with an embedded Euler step for the error estimate.
pub struct Rk2 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk2 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rk2 {
    fn order(&self) -> usize {
        2
    }

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()> {
        // k1 = f(t, y)
        system.apply(t, state, &mut self.k1)?;

        // k2 = f(t + dt, y + dt*k1)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i];
        }
        system.apply(t + dt, &self.tmp, &mut self.k2)?;

        for i in 0..state.len() {
            out[i] = state[i] + 0.5 * dt * (self.k1[i] + self.k2[i]);
            err[i] = 0.5 * dt * (self.k2[i] - self.k1[i]);
        }
        Ok(())
    }
}

/// Runge-Kutta-Fehlberg 4(5). Propagates the fifth order solution.
pub struct Rkf45 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rkf45 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rkf45 {
    fn order(&self) -> usize {
        4
    }

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()> {
        let (c2, c3, c4, c5, c6) = (0.25, 3.0 / 8.0, 12.0 / 13.0, 1.0, 0.5);

        let a21 = 0.25;
        let (a31, a32) = (3.0 / 32.0, 9.0 / 32.0);
        let (a41, a42, a43) = (1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0);
        let (a51, a52, a53, a54) = (439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0);
        let (a61, a62, a63, a64, a65) = (
            -8.0 / 27.0,
            2.0,
            -3544.0 / 2565.0,
            1859.0 / 4104.0,
            -11.0 / 40.0,
        );

        // fifth order weights
        let (b1, b3, b4, b5, b6) = (
            16.0 / 135.0,
            6656.0 / 12825.0,
            28561.0 / 56430.0,
            -9.0 / 50.0,
            2.0 / 55.0,
        );
        // fifth minus fourth order weights
        let (e1, e3, e4, e5, e6) = (
            1.0 / 360.0,
            -128.0 / 4275.0,
            -2197.0 / 75240.0,
            1.0 / 50.0,
            2.0 / 55.0,
        );

        // k1
        system.apply(t, state, &mut self.k1)?;

        // k2
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * a21 * self.k1[i];
        }
        system.apply(t + c2 * dt, &self.tmp, &mut self.k2)?;

        // k3
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a31 * self.k1[i] + a32 * self.k2[i]);
        }
        system.apply(t + c3 * dt, &self.tmp, &mut self.k3)?;

        // k4
        for i in 0..state.len() {
            self.tmp[i] =
                state[i] + dt * (a41 * self.k1[i] + a42 * self.k2[i] + a43 * self.k3[i]);
        }
        system.apply(t + c4 * dt, &self.tmp, &mut self.k4)?;

        // k5
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a51 * self.k1[i] + a52 * self.k2[i] + a53 * self.k3[i] + a54 * self.k4[i]);
        }
        system.apply(t + c5 * dt, &self.tmp, &mut self.k5)?;

        // k6
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a61 * self.k1[i]
                    + a62 * self.k2[i]
                    + a63 * self.k3[i]
                    + a64 * self.k4[i]
                    + a65 * self.k5[i]);
        }
        system.apply(t + c6 * dt, &self.tmp, &mut self.k6)?;

        for i in 0..state.len() {
            out[i] = state[i]
                + dt * (b1 * self.k1[i]
                    + b3 * self.k3[i]
                    + b4 * self.k4[i]
                    + b5 * self.k5[i]
                    + b6 * self.k6[i]);
            err[i] = dt
                * (e1 * self.k1[i]
                    + e3 * self.k3[i]
                    + e4 * self.k4[i]
                    + e5 * self.k5[i]
                    + e6 * self.k6[i]);
        }
        Ok(())
    }
}

/// Butcher tableau of an implicit Runge-Kutta method.
#[derive(Debug, Clone, PartialEq)]
pub struct Tableau {
    pub a: DMatrix<f64>,
    pub b: Vec<f64>,
    pub c: Vec<f64>,
    pub order: usize,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.b.len()
    }

    /// Backward Euler.
    pub fn implicit_euler() -> Self {
        Self {
            a: DMatrix::from_element(1, 1, 1.0),
            b: vec![1.0],
            c: vec![1.0],
            order: 1,
        }
    }

    pub fn implicit_midpoint() -> Self {
        Self {
            a: DMatrix::from_element(1, 1, 0.5),
            b: vec![1.0],
            c: vec![0.5],
            order: 2,
        }
    }

    /// Two stage Gauss-Legendre.
    pub fn gauss4() -> Self {
        let s = 3f64.sqrt() / 6.0;
        Self {
            a: DMatrix::from_row_slice(2, 2, &[0.25, 0.25 - s, 0.25 + s, 0.25]),
            b: vec![0.5, 0.5],
            c: vec![0.5 - s, 0.5 + s],
            order: 4,
        }
    }
}

const NEWTON_MAX_ITER: usize = 20;
const NEWTON_TOL: f64 = 1e-12;

/// Implicit Runge-Kutta stepper. Stage equations are solved by simplified
/// Newton iteration with the Jacobian frozen at the start of the step, and
/// the error is estimated by step doubling.
pub struct ImplicitRk {
    tableau: Tableau,
    jac: DMatrix<f64>,
    stages: Vec<f64>,
    f: Vec<f64>,
    tmp: Vec<f64>,
    full: Vec<f64>,
    mid: Vec<f64>,
}

impl ImplicitRk {
    pub fn new(dim: usize, tableau: Tableau) -> Self {
        let s = tableau.stages();
        Self {
            tableau,
            jac: DMatrix::zeros(dim, dim),
            stages: vec![0.0; s * dim],
            f: vec![0.0; dim],
            tmp: vec![0.0; dim],
            full: vec![0.0; dim],
            mid: vec![0.0; dim],
        }
    }

    pub fn implicit_euler(dim: usize) -> Self {
        Self::new(dim, Tableau::implicit_euler())
    }

    pub fn implicit_midpoint(dim: usize) -> Self {
        Self::new(dim, Tableau::implicit_midpoint())
    }

    pub fn gauss4(dim: usize) -> Self {
        Self::new(dim, Tableau::gauss4())
    }

    /// Stage value `y + dt * sum_j a_ij K_j` into `tmp`.
    fn stage_state(&mut self, stage: usize, y: &[f64], dt: f64) {
        let n = y.len();
        for r in 0..n {
            let mut acc = 0.0;
            for j in 0..self.tableau.stages() {
                acc += self.tableau.a[(stage, j)] * self.stages[j * n + r];
            }
            self.tmp[r] = y[r] + dt * acc;
        }
    }

    /// One implicit step of size dt from y, result in out.
    fn solve(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        dt: f64,
        out: &mut [f64],
    ) -> Result<()> {
        let n = y.len();
        let s = self.tableau.stages();

        // I - dt (A ⊗ J)
        let mut newton = DMatrix::<f64>::identity(s * n, s * n);
        for i in 0..s {
            for j in 0..s {
                let a = dt * self.tableau.a[(i, j)];
                for r in 0..n {
                    for c in 0..n {
                        newton[(i * n + r, j * n + c)] -= a * self.jac[(r, c)];
                    }
                }
            }
        }
        let lu = newton.lu();

        // explicit predictor: every stage starts at f(t, y)
        system.apply(t, y, &mut self.f)?;
        for i in 0..s {
            self.stages[i * n..(i + 1) * n].copy_from_slice(&self.f);
        }

        let mut residual = DVector::<f64>::zeros(s * n);
        let mut converged = false;
        for _ in 0..NEWTON_MAX_ITER {
            for i in 0..s {
                self.stage_state(i, y, dt);
                system.apply(t + self.tableau.c[i] * dt, &self.tmp, &mut self.f)?;
                for r in 0..n {
                    residual[i * n + r] = self.f[r] - self.stages[i * n + r];
                }
            }
            let delta = lu.solve(&residual).ok_or_else(|| {
                SimError::numeric("singular Newton matrix in implicit solver")
            })?;
            let mut size: f64 = 0.0;
            let mut scale: f64 = 1.0;
            for (k, d) in delta.iter().enumerate() {
                self.stages[k] += d;
                size = size.max(d.abs());
                scale = scale.max(self.stages[k].abs());
            }
            if !size.is_finite() {
                return Err(SimError::numeric("implicit solver diverged"));
            }
            if size <= NEWTON_TOL * scale {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(SimError::numeric("implicit solver failed to converge"));
        }

        for r in 0..n {
            let mut acc = 0.0;
            for i in 0..s {
                acc += self.tableau.b[i] * self.stages[i * n + r];
            }
            out[r] = y[r] + dt * acc;
        }
        Ok(())
    }
}

impl Steppable for ImplicitRk {
    fn order(&self) -> usize {
        self.tableau.order
    }

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()> {
        system.jacobian(t, state, &mut self.jac)?;

        let mut full = std::mem::take(&mut self.full);
        let mut mid = std::mem::take(&mut self.mid);
        let result = self
            .solve(system, t, state, dt, &mut full)
            .and_then(|_| self.solve(system, t, state, 0.5 * dt, &mut mid))
            .and_then(|_| self.solve(system, t + 0.5 * dt, &mid, 0.5 * dt, out));
        if result.is_ok() {
            let scale = f64::powi(2.0, self.tableau.order as i32) - 1.0;
            for i in 0..state.len() {
                err[i] = (out[i] - full[i]) / scale;
            }
        }
        self.full = full;
        self.mid = mid;
        result
    }
}

/// The stepper selected by a solver order and the implicit flag.
pub enum Stepper {
    Euler(ExplicitEuler),
    Rk2(Rk2),
    Rkf45(Rkf45),
    Implicit(ImplicitRk),
}

impl Stepper {
    pub fn new(order: usize, implicit: bool, dim: usize) -> Result<Self> {
        Ok(match (order, implicit) {
            (1, false) => Stepper::Euler(ExplicitEuler::new(dim)),
            (1, true) => Stepper::Implicit(ImplicitRk::implicit_euler(dim)),
            (2, false) => Stepper::Rk2(Rk2::new(dim)),
            (2, true) => Stepper::Implicit(ImplicitRk::implicit_midpoint(dim)),
            (4, false) => Stepper::Rkf45(Rkf45::new(dim)),
            (4, true) => Stepper::Implicit(ImplicitRk::gauss4(dim)),
            (order, _) => {
                return Err(SimError::numeric(format!(
                    "order {order} solver not supported"
                )))
            }
        })
    }

    pub fn is_explicit_euler(&self) -> bool {
        matches!(self, Stepper::Euler(_))
    }
}

impl Steppable for Stepper {
    fn order(&self) -> usize {
        match self {
            Stepper::Euler(s) => s.order(),
            Stepper::Rk2(s) => s.order(),
            Stepper::Rkf45(s) => s.order(),
            Stepper::Implicit(s) => s.order(),
        }
    }

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()> {
        match self {
            Stepper::Euler(s) => s.try_step(system, t, state, dt, out, err),
            Stepper::Rk2(s) => s.try_step(system, t, state, dt, out, err),
            Stepper::Rkf45(s) => s.try_step(system, t, state, dt, out, err),
            Stepper::Implicit(s) => s.try_step(system, t, state, dt, out, err),
        }
    }
}

/// Step size bounds and tolerances for [`AdaptiveDriver`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepControl {
    pub step_min: f64,
    pub step_max: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
}

/// Takes accepted steps with an error-controlled step size. The step size
/// carries over between calls.
pub struct AdaptiveDriver<S: Steppable> {
    stepper: S,
    control: StepControl,
    h: f64,
    out: Vec<f64>,
    err: Vec<f64>,
}

impl<S: Steppable> AdaptiveDriver<S> {
    pub fn new(stepper: S, control: StepControl, dim: usize) -> Self {
        Self {
            stepper,
            control,
            h: control.step_max,
            out: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    pub fn step_size(&self) -> f64 {
        self.h
    }

    pub fn stepper(&self) -> &S {
        &self.stepper
    }

    /// Worst ratio of error to tolerance over all components.
    fn error_ratio(&self, state: &[f64]) -> f64 {
        let c = &self.control;
        let mut ratio: f64 = 0.0;
        for i in 0..state.len() {
            let scale = state[i].abs().max(self.out[i].abs());
            let tol = c.eps_abs + c.eps_rel * scale;
            let r = if tol > 0.0 {
                self.err[i].abs() / tol
            } else if self.err[i] == 0.0 {
                0.0
            } else {
                f64::INFINITY
            };
            ratio = ratio.max(r);
        }
        ratio
    }

    /// Advances `(t, state)` by one accepted step. On failure both are left
    /// untouched.
    pub fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64]) -> Result<()> {
        let c = self.control;
        let exponent = 1.0 / (self.stepper.order() as f64 + 1.0);
        let mut h = self.h.clamp(c.step_min, c.step_max);
        loop {
            self.stepper
                .try_step(system, *t, state, h, &mut self.out, &mut self.err)?;
            if self.out.iter().any(|x| !x.is_finite()) {
                return Err(SimError::numeric("invalid arithmetic operation detected"));
            }
            // a NaN would slip through the max in error_ratio
            if self.err.iter().any(|e| !e.is_finite()) {
                return Err(SimError::numeric(format!(
                    "non-finite error estimate at t = {} with step size {h}",
                    *t
                )));
            }

            let ratio = self.error_ratio(state);
            if ratio <= 1.0 {
                state.copy_from_slice(&self.out);
                *t += h;
                let grow = if ratio == 0.0 {
                    5.0
                } else {
                    (0.9 * ratio.powf(-exponent)).clamp(0.2, 5.0)
                };
                self.h = (h * grow).clamp(c.step_min, c.step_max);
                debug!(t = *t, h, next = self.h, ratio, "step accepted");
                return Ok(());
            }

            if h <= c.step_min || h <= f64::EPSILON * t.abs().max(1.0) {
                return Err(SimError::numeric(format!(
                    "step size {h} below minimum with error ratio {ratio}"
                )));
            }
            let shrink = (0.9 * ratio.powf(-exponent)).clamp(0.2, 1.0);
            let next = (h * shrink).max(c.step_min);
            if next == c.step_min {
                warn!(t = *t, h = next, "step size forced down to minimum");
            } else {
                debug!(t = *t, h, next, ratio, "step rejected");
            }
            h = next;
        }
    }
}
