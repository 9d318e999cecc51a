//! Scenario Data Model
//!
//! A scenario drives one machine through a sequence of rounds. Each round
//! issues simulated operations that complete after a delay and suspends on a
//! barrier with the round's quorum and timeout.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: replicated-write
//! rounds:
//!   - name: write
//!     quorum: 3
//!     timeout_ms: 200
//!     operations:
//!       - id: replica-a
//!         delay_ms: 10
//!       - id: replica-b
//!         delay_ms: 25
//!       - id: replica-c
//!         delay_ms: 0
//!       - id: replica-d
//!         delay_ms: 500
//!
//!   - name: commit
//!     operations:
//!       - id: coordinator
//!         delay_ms: 5
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One simulated asynchronous call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SimulatedOperation {
    /// Key of the operation within its round
    pub id: String,

    /// Milliseconds until the operation completes; 0 completes inline
    #[serde(default)]
    pub delay_ms: u64,
}

impl SimulatedOperation {
    pub fn new(id: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            id: id.into().trim().to_string(),
            delay_ms,
        }
    }

    /// True if the operation completes on the issuing thread.
    pub fn is_inline(&self) -> bool {
        self.delay_ms == 0
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// One suspension point of a scenario.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Round {
    pub name: String,

    /// Completions required to resume; defaults to every operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,

    /// Barrier timeout; absent means wait for the quorum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Makes the step issuing this round fail instead
    #[serde(default)]
    pub fail: bool,

    #[serde(default)]
    pub operations: Vec<SimulatedOperation>,
}

impl Round {
    /// Creates an empty round.
    ///
    /// # Example
    ///
    /// ```
    /// use asyncmachine::scenario::Round;
    ///
    /// let round = Round::new("write")
    ///     .with_operation("a", 10)
    ///     .with_operation("b", 20)
    ///     .with_quorum(1)
    ///     .with_timeout_ms(100);
    /// assert_eq!(round.effective_quorum(), 1);
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            quorum: None,
            timeout_ms: None,
            fail: false,
            operations: Vec::new(),
        }
    }

    pub fn with_operation(mut self, id: impl Into<String>, delay_ms: u64) -> Self {
        self.operations.push(SimulatedOperation::new(id, delay_ms));
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Marks the round as failing.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Quorum after applying the all-operations default.
    pub fn effective_quorum(&self) -> usize {
        self.quorum.unwrap_or(self.operations.len())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// True if the round runs through the single-operation path.
    pub fn is_single(&self) -> bool {
        self.operations.len() == 1 && self.timeout_ms.is_none()
    }
}

fn default_name() -> String {
    "scenario".to_string()
}

/// A named sequence of rounds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Scenario {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub rounds: Vec<Round>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rounds: Vec::new(),
        }
    }

    pub fn with_round(mut self, round: Round) -> Self {
        self.rounds.push(round);
        self
    }

    /// Total number of operations issued across all rounds.
    pub fn operation_count(&self) -> usize {
        self.rounds.iter().map(|round| round.operations.len()).sum()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new(default_name())
    }
}
