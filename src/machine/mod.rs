//! Machine Module
//!
//! Drives continuations through their suspension points.
//!
//! # Components
//!
//! - [`driver`]: [`Machine`], the advance loop and the step [`Context`]
//! - [`typed`]: machines carrying a typed input and result

pub mod driver;
pub mod typed;

pub use driver::{Context, Continuation, Machine, MachineState, StepResult, Steps};
pub use typed::{InputMachine, ResultSlot, TypedMachine};
