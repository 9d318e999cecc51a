//! Typed Machines
//!
//! Wrappers that carry a strongly typed input into a continuation and a
//! strongly typed result back out of it. Lifecycle and concurrency are those
//! of the wrapped [`Machine`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::MachineError;
use crate::sync::lock;

use super::driver::{Continuation, Machine, MachineState};

enum Slot<O> {
    Empty,
    Set(O),
    Taken,
}

/// Write end of a typed machine's result, handed to its continuation.
pub struct ResultSlot<O> {
    slot: Arc<Mutex<Slot<O>>>,
}

impl<O> ResultSlot<O> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Empty)),
        }
    }

    /// Stores the result, replacing any earlier value.
    pub fn set(&self, value: O) {
        *lock(&self.slot) = Slot::Set(value);
    }

    /// True if a result is stored and not yet taken.
    pub fn is_set(&self) -> bool {
        matches!(*lock(&self.slot), Slot::Set(_))
    }

    fn clear(&self) {
        *lock(&self.slot) = Slot::Empty;
    }

    fn take(&self) -> Result<O, MachineError> {
        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Set(value) => Ok(value),
            Slot::Empty => {
                *slot = Slot::Empty;
                Err(MachineError::MissingResult)
            }
            Slot::Taken => Err(MachineError::ResultTaken),
        }
    }
}

impl<O> Clone for ResultSlot<O> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<O> fmt::Debug for ResultSlot<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSlot").field("set", &self.is_set()).finish()
    }
}

/// A machine with a typed input and a typed result.
///
/// The continuation is built from the shared input and the result slot:
///
/// ```rust
/// use asyncmachine::{Context, StepResult, TypedMachine};
///
/// let machine = TypedMachine::<Vec<u32>, u32>::new(vec![1, 2, 3]);
/// let total = machine
///     .run(|input, result| {
///         move |_: &Context| -> StepResult {
///             result.set(input.iter().sum());
///             Ok(None)
///         }
///     })
///     .unwrap();
/// assert_eq!(total, 6);
/// ```
pub struct TypedMachine<I, O> {
    machine: Machine,
    input: Arc<I>,
    result: ResultSlot<O>,
}

impl<I, O> TypedMachine<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Creates a machine holding `input`.
    pub fn new(input: I) -> Self {
        Self::with_machine(Machine::new(), input)
    }

    /// Creates a named machine holding `input`.
    pub fn named(name: impl Into<String>, input: I) -> Self {
        Self::with_machine(Machine::named(name), input)
    }

    fn with_machine(machine: Machine, input: I) -> Self {
        Self {
            machine,
            input: Arc::new(input),
            result: ResultSlot::new(),
        }
    }

    /// Creates a machine and starts it with a completion callback.
    pub fn launch<B, C, F>(input: I, build: B, on_complete: F) -> Result<Self, MachineError>
    where
        B: FnOnce(Arc<I>, ResultSlot<O>) -> C,
        C: Continuation + 'static,
        F: FnOnce(&Machine) + Send + 'static,
    {
        let typed = Self::new(input);
        let continuation = build(Arc::clone(&typed.input), typed.result.clone());
        typed.machine.start_with_callback(continuation, on_complete)?;
        Ok(typed)
    }

    /// The input shared with the continuation.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The underlying machine.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Current lifecycle state of the underlying machine.
    pub fn state(&self) -> MachineState {
        self.machine.state()
    }

    /// Builds the continuation from the input and result slot, then starts it.
    ///
    /// The previous run's result is discarded only once the start is
    /// accepted; a rejected start leaves the running machine's slot intact.
    pub fn start<B, C>(&self, build: B) -> Result<(), MachineError>
    where
        B: FnOnce(Arc<I>, ResultSlot<O>) -> C,
        C: Continuation + 'static,
    {
        let continuation = build(Arc::clone(&self.input), self.result.clone());
        self.machine.start_prepared(continuation, || self.result.clear())
    }

    /// Starts the machine and blocks for its result.
    pub fn run<B, C>(&self, build: B) -> Result<O, MachineError>
    where
        B: FnOnce(Arc<I>, ResultSlot<O>) -> C,
        C: Continuation + 'static,
    {
        self.start(build)?;
        self.wait()
    }

    /// Blocks until completion and takes the result.
    ///
    /// A step failure takes precedence over the result. The result can be
    /// taken once per run; later calls return [`MachineError::ResultTaken`].
    pub fn wait(&self) -> Result<O, MachineError> {
        self.machine.wait()?;
        self.result.take()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<O, MachineError>> {
        self.machine
            .wait_timeout(timeout)
            .map(|outcome| outcome.and_then(|()| self.result.take()))
    }

    /// Takes the result without blocking.
    pub fn try_result(&self) -> Result<O, MachineError> {
        self.machine.try_result()?;
        self.result.take()
    }
}

impl<I, O> fmt::Debug for TypedMachine<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMachine")
            .field("machine", &self.machine)
            .field("result", &self.result)
            .finish()
    }
}

/// A machine with a typed input and no result.
pub struct InputMachine<I> {
    machine: Machine,
    input: Arc<I>,
}

impl<I> InputMachine<I>
where
    I: Send + Sync + 'static,
{
    /// Creates a machine holding `input`.
    pub fn new(input: I) -> Self {
        Self::named("machine", input)
    }

    /// Creates a named machine holding `input`.
    pub fn named(name: impl Into<String>, input: I) -> Self {
        Self {
            machine: Machine::named(name),
            input: Arc::new(input),
        }
    }

    /// Creates a machine and starts it with a completion callback.
    pub fn launch<B, C, F>(input: I, build: B, on_complete: F) -> Result<Self, MachineError>
    where
        B: FnOnce(Arc<I>) -> C,
        C: Continuation + 'static,
        F: FnOnce(&Machine) + Send + 'static,
    {
        let typed = Self::new(input);
        let continuation = build(Arc::clone(&typed.input));
        typed.machine.start_with_callback(continuation, on_complete)?;
        Ok(typed)
    }

    /// The input shared with the continuation.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The underlying machine.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Builds the continuation from the input, then starts it.
    pub fn start<B, C>(&self, build: B) -> Result<(), MachineError>
    where
        B: FnOnce(Arc<I>) -> C,
        C: Continuation + 'static,
    {
        self.machine.start(build(Arc::clone(&self.input)))
    }

    /// Starts the machine and blocks until it completes.
    pub fn run<B, C>(&self, build: B) -> Result<(), MachineError>
    where
        B: FnOnce(Arc<I>) -> C,
        C: Continuation + 'static,
    {
        self.start(build)?;
        self.wait()
    }

    /// Blocks until the machine completes.
    pub fn wait(&self) -> Result<(), MachineError> {
        self.machine.wait()
    }
}

impl<I> fmt::Debug for InputMachine<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputMachine")
            .field("machine", &self.machine)
            .finish()
    }
}
