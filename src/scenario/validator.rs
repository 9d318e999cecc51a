//! Scenario Validation
//!
//! Checks a scenario before it is run:
//! - At least one round
//! - Every round issues at least one operation
//! - Operation ids are unique within a round
//! - The quorum lies within `1..=operations`

use std::collections::HashSet;
use std::fmt;

use log::{debug, info, warn};

use super::model::{Round, Scenario};
use super::ScenarioError;

/// A single problem found in a scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyScenario,
    EmptyRoundName(usize),
    EmptyRound(String),
    EmptyOperationId(String),
    DuplicateOperationId { round: String, id: String },
    InvalidQuorum { round: String, quorum: usize, operations: usize },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyScenario => write!(f, "Scenario has no rounds"),
            Self::EmptyRoundName(index) => write!(f, "Round #{} has no name", index + 1),
            Self::EmptyRound(round) => write!(f, "Round '{}' issues no operations", round),
            Self::EmptyOperationId(round) => {
                write!(f, "Round '{}' has an operation with an empty id", round)
            }
            Self::DuplicateOperationId { round, id } => {
                write!(f, "Round '{}' issues operation '{}' more than once", round, id)
            }
            Self::InvalidQuorum {
                round,
                quorum,
                operations,
            } => write!(
                f,
                "Round '{}': quorum {} is outside 1..={}",
                round, quorum, operations
            ),
        }
    }
}

fn validate_round(index: usize, round: &Round) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if round.name.trim().is_empty() {
        errors.push(ValidationError::EmptyRoundName(index));
        return errors;
    }

    if round.operations.is_empty() {
        errors.push(ValidationError::EmptyRound(round.name.clone()));
        return errors;
    }

    let mut seen = HashSet::new();
    for operation in &round.operations {
        if operation.id.trim().is_empty() {
            errors.push(ValidationError::EmptyOperationId(round.name.clone()));
        } else if !seen.insert(operation.id.as_str()) {
            errors.push(ValidationError::DuplicateOperationId {
                round: round.name.clone(),
                id: operation.id.clone(),
            });
        }
    }

    let quorum = round.effective_quorum();
    if quorum == 0 || quorum > round.operations.len() {
        errors.push(ValidationError::InvalidQuorum {
            round: round.name.clone(),
            quorum,
            operations: round.operations.len(),
        });
    }

    if round.timeout_ms == Some(0) {
        warn!(
            "Round '{}': timeout of 0 ms resumes as soon as the round suspends",
            round.name
        );
    }
    if round.is_single() {
        debug!("Round '{}' uses the single-operation path", round.name);
    }

    errors
}

/// Validates the whole scenario, reporting every problem at once.
pub fn validate_scenario(scenario: &Scenario) -> Result<(), ScenarioError> {
    info!(
        "Validating scenario '{}' with {} rounds",
        scenario.name,
        scenario.rounds.len()
    );

    if scenario.rounds.is_empty() {
        return Err(ScenarioError::Invalid(ValidationError::EmptyScenario.to_string()));
    }

    let errors: Vec<ValidationError> = scenario
        .rounds
        .iter()
        .enumerate()
        .flat_map(|(index, round)| validate_round(index, round))
        .collect();

    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(ScenarioError::Invalid(messages.join("\n")));
    }

    info!(
        "Scenario validated: {} rounds, {} operations",
        scenario.rounds.len(),
        scenario.operation_count()
    );
    Ok(())
}
