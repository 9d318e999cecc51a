//! AsyncMachine - Asynchronous Coordination Engine
//!
//! Drives a continuation, a sequence of steps written as one linear piece of
//! logic, across asynchronous operations. Each step issues operations and
//! yields a barrier; the machine suspends without blocking a thread and
//! resumes on whichever thread satisfies the barrier's quorum, or when its
//! timeout elapses. Operations that lose the race are cancelled and their
//! results finalized exactly once.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`barrier`]: Completion barriers and per-operation handles
//! - [`machine`]: The driver, step context and typed variants
//! - [`error`]: Error types shared by all components
//! - [`monitoring`]: Suspension timeline for diagnostics
//! - [`scenario`]: YAML-defined simulated workloads used by the CLI
//!
//! # Example
//!
//! ```rust
//! use std::thread;
//! use std::time::Duration;
//! use asyncmachine::{Context, Machine, StepResult};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let machine = Machine::named("replicas");
//!     let mut issued = false;
//!
//!     machine.run(move |cx: &Context| -> StepResult {
//!         if let Some(barrier) = cx.resumed_barrier() {
//!             for handle in barrier.operations() {
//!                 if handle.is_completed() {
//!                     handle.end(|_| ())?;
//!                 } else {
//!                     handle.cancel(|_| ());
//!                 }
//!             }
//!         }
//!         if issued {
//!             return Ok(None);
//!         }
//!         issued = true;
//!
//!         // Resume once two of three replicas answer, or after 100 ms.
//!         let barrier = cx.barrier(3, 2, Some(Duration::from_millis(100)))?;
//!         for replica in ["a", "b", "c"] {
//!             let completion = barrier.handle_for(replica)?.completion();
//!             thread::spawn(move || completion.complete(replica));
//!         }
//!         Ok(Some(barrier))
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod error;
pub mod machine;
pub mod monitoring;
pub mod scenario;

mod sync;

// Re-export commonly used types
pub use barrier::{Barrier, Completion, OperationHandle, OperationKey, Payload, ResumeCause};
pub use error::{MachineError, StepError};
pub use machine::{
    Context, Continuation, InputMachine, Machine, MachineState, ResultSlot, StepResult, Steps,
    TypedMachine,
};
pub use scenario::{load_scenario, run_scenario};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "AsyncMachine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "AsyncMachine");
    }

    #[test]
    fn test_module_exports_machine() {
        let machine = Machine::named("exported");
        assert_eq!(machine.name(), "exported");
        assert_eq!(machine.state(), MachineState::NotStarted);
    }

    #[test]
    fn test_module_exports_barrier() {
        assert!(Barrier::single().is_single());
        assert_eq!(OperationKey::from(3usize).as_str(), "3");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
