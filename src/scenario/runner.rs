//! Scenario Runner
//!
//! Runs a scenario as a single machine. Each round is one step: it issues the
//! round's simulated operations, each completing on its own thread after its
//! delay (or inline when the delay is zero), and yields a barrier. The next
//! step settles the round: completed handles are ended, pending ones are
//! cancelled, and every result is finalized exactly once, even when it
//! arrives after the scenario finished.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::barrier::{Barrier, Completion, Payload, ResumeCause};
use crate::machine::{Context, Machine, StepResult};
use crate::sync::lock;

use super::model::{Round, Scenario, SimulatedOperation};
use super::validator::validate_scenario;
use super::ScenarioError;

/// Outcome of one round.
#[derive(Serialize, Debug, Clone)]
pub struct RoundReport {
    pub name: String,
    /// Machine step that issued the round
    pub step: usize,
    /// What resumed the machine: quorum, timeout or single
    pub resumed_by: String,
    /// Operations that completed before resumption
    pub completed: Vec<String>,
    /// Operations cancelled because they were still pending
    pub cancelled: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_ms: Option<u128>,
}

/// Outcome of a whole scenario run.
#[derive(Serialize, Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rounds: Vec<RoundReport>,
    /// Operations issued across all rounds
    pub issued: usize,
    /// Operations whose result was finalized
    pub finalized: usize,
    pub completed_synchronously: bool,
    /// ASCII chart of the machine's suspensions
    #[serde(skip)]
    pub chart: String,
}

impl ScenarioReport {
    /// Issued operations whose result was never finalized.
    pub fn leaked(&self) -> usize {
        self.issued.saturating_sub(self.finalized)
    }
}

/// Bookkeeping shared between the continuation and operation threads.
#[derive(Default)]
struct Tally {
    issued: AtomicUsize,
    finalized: AtomicUsize,
    rounds: Mutex<Vec<RoundReport>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Tally {
    fn dispatch(&self, operation: &SimulatedOperation, completion: Completion) -> io::Result<()> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let id = operation.id.clone();

        if operation.is_inline() {
            trace!("operation '{}' completing inline", id);
            completion.complete(id);
            return Ok(());
        }

        let delay = operation.delay();
        let worker = thread::Builder::new()
            .name(format!("op-{}", id))
            .spawn(move || {
                thread::sleep(delay);
                completion.complete(id);
            })?;
        lock(&self.workers).push(worker);
        Ok(())
    }

    fn finalize(&self, payload: Payload) {
        if let Ok(id) = payload.downcast::<String>() {
            trace!("operation '{}' finalized", id);
        }
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }

    /// Ends or cancels every operation of the round the machine resumed from.
    fn settle(self: &Arc<Self>, round: &Round, cx: &Context) {
        let (resumed_by, handles) = if let Some(barrier) = cx.resumed_barrier() {
            (cause_label(barrier.resumed_by()), barrier.operations())
        } else if let Some(operation) = cx.resumed_operation() {
            (cause_label(Some(ResumeCause::SingleOperation)), vec![operation.clone()])
        } else {
            return;
        };

        let mut completed = Vec::new();
        let mut cancelled = Vec::new();
        for handle in handles {
            let id = match round.operations.first() {
                Some(operation) if handle.is_single() => operation.id.clone(),
                _ => handle.key().to_string(),
            };
            if handle.is_completed() {
                match handle.end(|payload| self.finalize(payload)) {
                    Ok(()) => completed.push(id),
                    Err(e) => warn!("Round '{}': {}", round.name, e),
                }
            } else {
                let tally = Arc::clone(self);
                handle.cancel(move |payload| tally.finalize(payload));
                cancelled.push(id);
            }
        }

        info!(
            "Round '{}' resumed by {}: {} completed, {} cancelled",
            round.name,
            resumed_by,
            completed.len(),
            cancelled.len()
        );
        lock(&self.rounds).push(RoundReport {
            name: round.name.clone(),
            step: cx.step().saturating_sub(1),
            resumed_by,
            completed,
            cancelled,
            suspended_ms: None,
        });
    }
}

fn cause_label(cause: Option<ResumeCause>) -> String {
    match cause {
        Some(ResumeCause::Quorum) => "quorum",
        Some(ResumeCause::Timeout) => "timeout",
        Some(ResumeCause::PassThrough) => "pass-through",
        Some(ResumeCause::SingleOperation) => "single",
        None => "unknown",
    }
    .to_string()
}

/// One step per round, plus a final step that settles the last round.
fn rounds_continuation(
    rounds: Vec<Round>,
    tally: Arc<Tally>,
) -> impl FnMut(&Context) -> StepResult + Send + 'static {
    let mut next: usize = 0;

    move |cx: &Context| -> StepResult {
        if let Some(previous) = next.checked_sub(1).and_then(|i| rounds.get(i)) {
            tally.settle(previous, cx);
        }

        let Some(round) = rounds.get(next) else {
            return Ok(None);
        };
        next += 1;

        if round.fail {
            return Err(Box::new(ScenarioError::RoundFailed {
                round: round.name.clone(),
            }));
        }

        debug!(
            "Round '{}': issuing {} operations (quorum {}, timeout {:?})",
            round.name,
            round.operations.len(),
            round.effective_quorum(),
            round.timeout()
        );

        if round.is_single() {
            let handle = cx.single_operation()?;
            tally.dispatch(&round.operations[0], handle.completion())?;
            return Ok(Some(Barrier::single()));
        }

        let barrier = cx.barrier(
            round.operations.len(),
            round.effective_quorum(),
            round.timeout(),
        )?;
        for operation in &round.operations {
            let handle = barrier.handle_for(operation.id.as_str())?;
            tally.dispatch(operation, handle.completion())?;
        }
        Ok(Some(barrier))
    }
}

/// Runs a scenario to completion and reports what happened.
///
/// Fails only if the scenario is invalid; a failing round is reported through
/// [`ScenarioReport::succeeded`] and [`ScenarioReport::error`].
pub fn run_scenario(scenario: &Scenario) -> Result<ScenarioReport, ScenarioError> {
    validate_scenario(scenario)?;

    let tally = Arc::new(Tally::default());
    let machine = Machine::named(scenario.name.clone());
    machine.set_fault_hook(|err| warn!("Scenario aborted: {}", err));

    info!("Running scenario '{}'", scenario.name);
    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = machine.run(rounds_continuation(scenario.rounds.clone(), Arc::clone(&tally)));
    let duration = clock.elapsed();

    // Late operations still hold results that must be finalized.
    let workers = std::mem::take(&mut *lock(&tally.workers));
    for worker in workers {
        if worker.join().is_err() {
            warn!("An operation thread panicked");
        }
    }

    let timeline = machine.timeline();
    let suspensions = timeline.suspensions();
    let mut rounds = std::mem::take(&mut *lock(&tally.rounds));
    for round in &mut rounds {
        round.suspended_ms = suspensions.get(&round.step).map(|d| d.as_millis());
    }

    let error = outcome.err().map(|err| match err.step_error() {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    });

    let report = ScenarioReport {
        scenario: scenario.name.clone(),
        started_at,
        duration_ms: duration.as_millis(),
        succeeded: error.is_none(),
        error,
        rounds,
        issued: tally.issued.load(Ordering::SeqCst),
        finalized: tally.finalized.load(Ordering::SeqCst),
        completed_synchronously: machine.completed_synchronously(),
        chart: timeline.chart(),
    };

    info!(
        "Scenario '{}' finished in {:.2?}: {} of {} operations finalized",
        report.scenario, duration, report.finalized, report.issued
    );
    Ok(report)
}
