use crate::error::Result;
use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the expression VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A system of first-order ODEs `dx/dt = f(t, x)` over the stock vector.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt into
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()>;

    /// Writes `∂f_i/∂x_j` into `jac` (dimension × dimension).
    fn jacobian(&self, t: f64, x: &[f64], jac: &mut DMatrix<f64>) -> Result<()>;
}

/// A trait for steppers that attempt a single step and report an error
/// estimate for adaptive step-size control.
pub trait Steppable {
    /// Order of the method used to propagate the solution.
    fn order(&self) -> usize;

    /// Attempts one step of size dt from `(t, state)`.
    /// out: proposed state at t + dt
    /// err: local error estimate for each component
    fn try_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        err: &mut [f64],
    ) -> Result<()>;
}
