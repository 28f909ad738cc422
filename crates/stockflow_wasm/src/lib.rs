//! WebAssembly bridge exposing `stockflow_core` simulations to a JavaScript host.

pub mod simulation;

pub use simulation::WasmSimulation;
