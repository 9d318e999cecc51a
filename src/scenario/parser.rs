//! Scenario Parser
//!
//! Loads scenario definitions from YAML files and validates them.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Scenario;
use super::validator::validate_scenario;
use super::ScenarioError;

/// Parses and validates a scenario from YAML text.
pub fn parse_scenario(yaml: &str) -> Result<Scenario, ScenarioError> {
    let scenario: Scenario = serde_yaml::from_str(yaml)?;
    debug!(
        "Parsed scenario '{}' ({} rounds)",
        scenario.name,
        scenario.rounds.len()
    );

    validate_scenario(&scenario)?;
    Ok(scenario)
}

/// Loads a scenario from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use asyncmachine::scenario::{load_scenario, run_scenario};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let scenario = load_scenario("scenario.yaml")?;
///     let report = run_scenario(&scenario)?;
///     println!("{} operations finalized", report.finalized);
///     Ok(())
/// }
/// ```
pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario, ScenarioError> {
    let path = path.as_ref();
    info!("Loading scenario from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| ScenarioError::Read {
        path: path.display().to_string(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_scenario(&yaml)
}

/// Writes a scenario back to a YAML file.
pub fn save_scenario(scenario: &Scenario, path: impl AsRef<Path>) -> Result<(), ScenarioError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(scenario)?;
    fs::write(path, yaml).map_err(|source| ScenarioError::Write {
        path: path.display().to_string(),
        source,
    })?;

    info!("Scenario saved to: {}", path.display());
    Ok(())
}
