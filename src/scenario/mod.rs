//! Scenario Module
//!
//! Simulated workloads for exercising machines from YAML definitions.
//!
//! # Components
//!
//! - [`model`]: [`Scenario`], [`Round`] and [`SimulatedOperation`]
//! - [`parser`]: YAML loading and saving
//! - [`validator`]: structural checks run before a scenario starts
//! - [`runner`]: runs a scenario on a [`Machine`](crate::Machine) and reports
//!   what resumed each round

use std::io;

use thiserror::Error;

pub mod model;
pub mod parser;
pub mod runner;
pub mod validator;

pub use model::{Round, Scenario, SimulatedOperation};
pub use parser::{load_scenario, parse_scenario, save_scenario};
pub use runner::{run_scenario, RoundReport, ScenarioReport};
pub use validator::{validate_scenario, ValidationError};

/// Errors from loading, validating or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write scenario file '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse scenario YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid scenario:\n{0}")]
    Invalid(String),

    /// Raised by a round marked `fail: true`.
    #[error("round '{round}' failed")]
    RoundFailed { round: String },
}
