//! Machine Driver
//!
//! Runs a continuation, a lazily produced sequence of steps each of which may
//! issue asynchronous operations and yield a [`Barrier`]. The machine suspends
//! after every yielded barrier and pulls the next step once that barrier
//! resumes it, on whichever thread delivered the resuming completion.
//!
//! # Advance loop
//!
//! Only one thread advances a machine at a time. The `ADVANCING` bit of the
//! machine's flags acts as the driver-wide lock; the thread that sets it runs
//! the loop. A resume that arrives while the bit is held, including a
//! completion fired synchronously from inside the step that issued it, only
//! sets `NOTIFIED` and returns. Before releasing `ADVANCING` the loop checks
//! for `NOTIFIED` and pulls again instead. Chains of synchronously completing
//! operations therefore iterate rather than recurse, and completion threads
//! never block on the machine.
//!
//! # Faults
//!
//! An error returned by a step, a panic inside a step, or a usage error while
//! suspending terminates the machine. The failure is stored once, the fault
//! hook runs, and every call to [`Machine::wait`] replays it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

use log::{debug, error, info, trace, warn};

use crate::barrier::operation::{OperationState, Owner};
use crate::barrier::timer::Timer;
use crate::barrier::{Barrier, OperationHandle, ResumeCause};
use crate::error::{MachineError, StepError};
use crate::monitoring::{EventType, MachineTimeline};
use crate::sync::lock;

const ADVANCING: u8 = 0b01;
const NOTIFIED: u8 = 0b10;

/// Outcome of one continuation step: the barrier to suspend on, or `None`
/// once the continuation is exhausted.
pub type StepResult = Result<Option<Barrier>, StepError>;

type FaultHook = Arc<dyn Fn(&MachineError) + Send + Sync>;
type CompletionCallback = Box<dyn FnOnce(&Machine) + Send>;
type StepFn = Box<dyn FnOnce(&Context) -> StepResult + Send>;

/// A resumable sequence of asynchronous steps.
///
/// Each call to `step` runs the code between two suspension points. Closures
/// `FnMut(&Context) -> StepResult` implement this trait, which makes an
/// explicit state machine (a closure over a state enum) the usual way to write
/// a continuation. [`Steps`] covers the straight-line case.
pub trait Continuation: Send {
    /// Runs the next step.
    fn step(&mut self, cx: &Context) -> StepResult;
}

impl<F> Continuation for F
where
    F: FnMut(&Context) -> StepResult + Send,
{
    fn step(&mut self, cx: &Context) -> StepResult {
        self(cx)
    }
}

/// A continuation built from a queue of one-shot closures.
///
/// Each pull runs closures in order until one yields a barrier. A closure
/// returning `Ok(None)` falls through to the next one without suspending.
#[derive(Default)]
pub struct Steps {
    queue: VecDeque<StepFn>,
}

impl Steps {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnOnce(&Context) -> StepResult + Send + 'static,
    {
        self.queue.push_back(Box::new(step));
        self
    }

    /// Number of closures not yet run.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True once every closure has run.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Continuation for Steps {
    fn step(&mut self, cx: &Context) -> StepResult {
        while let Some(next) = self.queue.pop_front() {
            if let Some(barrier) = next(cx)? {
                return Ok(Some(barrier));
            }
        }
        Ok(None)
    }
}

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// `start` has not been called
    NotStarted,
    /// Steps are running or the machine is suspended
    Running,
    /// The continuation finished or faulted
    Completed,
}

enum Target {
    Machine(Weak<Shared>),
    #[cfg(test)]
    Counter(Arc<AtomicUsize>),
}

/// Wakes the machine that owns a suspension point.
///
/// Carries the epoch of the step that created it; resumes from any other
/// epoch are stale and ignored.
#[derive(Clone)]
pub(crate) struct Resumer {
    target: Arc<Target>,
    epoch: u64,
    step: usize,
}

impl Resumer {
    fn new(machine: Weak<Shared>, epoch: u64, step: usize) -> Self {
        Self {
            target: Arc::new(Target::Machine(machine)),
            epoch,
            step,
        }
    }

    /// A resumer that only counts how often it fires.
    #[cfg(test)]
    pub(crate) fn counting() -> (Self, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let resumer = Self {
            target: Arc::new(Target::Counter(Arc::clone(&count))),
            epoch: 0,
            step: 0,
        };
        (resumer, count)
    }

    fn targets(&self, shared: &Arc<Shared>) -> bool {
        match &*self.target {
            Target::Machine(machine) => std::ptr::eq(machine.as_ptr(), Arc::as_ptr(shared)),
            #[cfg(test)]
            Target::Counter(_) => false,
        }
    }

    /// Pins the machine until the returned anchor is dropped.
    pub(crate) fn anchor(&self) -> Option<Anchor> {
        match &*self.target {
            Target::Machine(machine) => {
                machine.upgrade().map(|machine| Anchor { _machine: machine })
            }
            #[cfg(test)]
            Target::Counter(_) => None,
        }
    }

    pub(crate) fn resume(&self, cause: ResumeCause) {
        let machine = match &*self.target {
            Target::Machine(machine) => machine,
            #[cfg(test)]
            Target::Counter(count) => {
                count.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let Some(shared) = machine.upgrade() else {
            trace!("resume for step {} arrived after its machine was dropped", self.step);
            return;
        };
        if shared.epoch.load(Ordering::Acquire) != self.epoch {
            debug!(
                "machine '{}' ignoring stale resume from step {}",
                shared.name, self.step
            );
            return;
        }

        debug!("machine '{}' step {} resumed by {:?}", shared.name, self.step, cause);
        let event = match cause {
            ResumeCause::Timeout => EventType::TimedOut,
            _ => EventType::Resumed,
        };
        shared.record(self.step, event);
        shared.kick(false);
    }
}

/// Strong reference held by whatever can still resume a suspended machine: an
/// unfired [`Completion`](crate::barrier::Completion) or an armed timeout.
///
/// Barriers themselves only hold a weak reference, so a machine never keeps
/// itself alive; a launched machine whose handles were all dropped lives
/// exactly as long as something can resume it.
pub(crate) struct Anchor {
    _machine: Arc<Shared>,
}

/// What the machine is currently suspended on.
enum Suspension {
    /// Nothing; the next step may be pulled.
    Ready,
    Barrier(Barrier),
    Single(OperationHandle),
}

impl Suspension {
    fn is_ready(&self) -> bool {
        match self {
            Self::Ready => true,
            Self::Barrier(barrier) => barrier.is_resumed(),
            Self::Single(operation) => operation.is_completed(),
        }
    }
}

/// State touched only by the advancing thread or while starting.
struct Core {
    continuation: Option<Box<dyn Continuation>>,
    step: usize,
    suspension: Suspension,
    timer: Option<Timer>,
    fault_hook: Option<FaultHook>,
    on_complete: Option<CompletionCallback>,
}

/// State observed by waiters.
struct Lifecycle {
    state: MachineState,
    outcome: Option<Result<(), MachineError>>,
    completed_synchronously: bool,
    unsettled: usize,
}

struct Shared {
    name: String,
    flags: AtomicU8,
    epoch: AtomicU64,
    core: Mutex<Core>,
    lifecycle: Mutex<Lifecycle>,
    done: Condvar,
    timeline: Mutex<MachineTimeline>,
}

impl Shared {
    fn record(&self, step: usize, event_type: EventType) {
        lock(&self.timeline).add_event(step, event_type);
    }

    /// Becomes the advancing thread, or hands the wake-up to the one that is.
    fn kick(self: &Arc<Self>, from_start: bool) {
        let previous = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                if flags & ADVANCING != 0 {
                    Some(flags | NOTIFIED)
                } else {
                    Some(flags | ADVANCING)
                }
            })
            .unwrap_or_else(|flags| flags);

        if previous & ADVANCING != 0 {
            trace!("machine '{}' woken while advancing; deferring to the running loop", self.name);
            return;
        }
        self.run(from_start);
    }

    fn run(self: &Arc<Self>, from_start: bool) {
        loop {
            self.flags.fetch_and(!NOTIFIED, Ordering::AcqRel);
            if self.advance(from_start) {
                continue;
            }
            if self
                .flags
                .compare_exchange(ADVANCING, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            trace!("machine '{}' resumed synchronously; advancing again", self.name);
        }
    }

    /// Pulls at most one step. Returns true if the loop should pull again
    /// immediately.
    fn advance(self: &Arc<Self>, from_start: bool) -> bool {
        let (mut continuation, cx) = {
            let mut core = lock(&self.core);
            if !core.suspension.is_ready() {
                trace!("machine '{}' woken before its suspension resolved", self.name);
                return false;
            }
            let Some(continuation) = core.continuation.take() else {
                return false;
            };

            core.step += 1;
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let resumed_from = std::mem::replace(&mut core.suspension, Suspension::Ready);
            let resumer = Resumer::new(Arc::downgrade(self), epoch, core.step);
            (continuation, Context::new(core.step, resumer, resumed_from))
        };

        let step = cx.step();
        trace!("machine '{}' running step {}", self.name, step);
        let pulled = panic::catch_unwind(AssertUnwindSafe(|| continuation.step(&cx)));
        let single = cx.take_single();

        let (outcome, yielded) = match pulled {
            Ok(Ok(Some(barrier))) => {
                lock(&self.core).continuation = Some(continuation);
                match self.suspend(step, barrier.clone(), single.clone()) {
                    Ok(again) => return again,
                    Err(err) => (Err(err), Some(barrier)),
                }
            }
            Ok(Ok(None)) => {
                drop(continuation);
                (Ok(()), None)
            }
            Ok(Err(source)) => {
                drop(continuation);
                let err = MachineError::Faulted {
                    step,
                    source: Arc::from(source),
                };
                (Err(err), None)
            }
            Err(payload) => {
                drop(continuation);
                let err = MachineError::Panicked {
                    step,
                    message: panic_message(payload.as_ref()),
                };
                (Err(err), None)
            }
        };

        let unsettled = cx.unsettled(yielded, single);
        self.finish(step, outcome, from_start, unsettled);
        false
    }

    /// Installs the yielded barrier as the current suspension.
    fn suspend(
        self: &Arc<Self>,
        step: usize,
        barrier: Barrier,
        single: Option<OperationHandle>,
    ) -> Result<bool, MachineError> {
        let stale_timer = lock(&self.core).timer.take();
        drop(stale_timer);

        if barrier.is_single() {
            let operation = single.ok_or(MachineError::NoSingleOperation { step })?;
            lock(&self.core).suspension = Suspension::Single(operation);
            self.record(step, EventType::Suspended);
            debug!("machine '{}' step {} suspended on a single operation", self.name, step);
            return Ok(false);
        }

        if single.is_some() {
            warn!(
                "machine '{}' step {} issued a single operation but yielded a keyed barrier",
                self.name, step
            );
        }

        let Some(resumer) = barrier.resumer().filter(|resumer| resumer.targets(self)) else {
            return Err(MachineError::ForeignBarrier { step });
        };
        if !barrier.mark_yielded() {
            return Err(MachineError::BarrierExhausted);
        }
        if resumer.epoch != self.epoch.load(Ordering::Acquire) {
            return Err(MachineError::ForeignBarrier { step });
        }

        if barrier.total() == 0 {
            barrier.pass_through();
            lock(&self.core).suspension = Suspension::Barrier(barrier);
            trace!("machine '{}' step {} yielded an empty barrier", self.name, step);
            return Ok(true);
        }

        let timer = match barrier.timeout() {
            Some(timeout) if !barrier.is_resumed() => {
                let target = barrier.clone();
                let anchor = resumer.anchor();
                let timer = Timer::schedule(barrier.created() + timeout, move || {
                    target.on_timeout();
                    drop(anchor);
                })
                .map_err(|e| MachineError::TimerUnavailable(e.to_string()))?;
                trace!("armed timeout with {:?} remaining", timer.remaining());
                Some(timer)
            }
            _ => None,
        };

        debug!(
            "machine '{}' step {} suspended on {} operations (quorum {}, timeout {:?})",
            self.name,
            step,
            barrier.total(),
            barrier.quorum(),
            barrier.timeout()
        );
        {
            let mut core = lock(&self.core);
            core.suspension = Suspension::Barrier(barrier);
            core.timer = timer;
        }
        self.record(step, EventType::Suspended);
        Ok(false)
    }

    /// Moves the machine to `Completed` and releases waiters.
    ///
    /// `unsettled` holds the operations the run leaves neither cancelled nor
    /// ended; their results can no longer be finalized by the continuation.
    fn finish(
        self: &Arc<Self>,
        step: usize,
        outcome: Result<(), MachineError>,
        from_start: bool,
        unsettled: Vec<OperationHandle>,
    ) {
        let (continuation, timer, suspension, fault_hook, on_complete) = {
            let mut core = lock(&self.core);
            (
                core.continuation.take(),
                core.timer.take(),
                std::mem::replace(&mut core.suspension, Suspension::Ready),
                core.fault_hook.clone(),
                core.on_complete.take(),
            )
        };
        drop(timer);
        drop(continuation);

        if !unsettled.is_empty() {
            let keys: Vec<String> = unsettled.iter().map(|op| op.key().to_string()).collect();
            warn!(
                "machine '{}' finished with {} operations neither cancelled nor ended: {}",
                self.name,
                unsettled.len(),
                keys.join(", ")
            );
        }

        match &outcome {
            Ok(()) => {
                info!(
                    "machine '{}' completed after {} suspensions",
                    self.name,
                    step.saturating_sub(1)
                );
                self.record(step, EventType::Completed);
            }
            Err(err) => {
                error!("machine '{}' faulted: {}", self.name, err);
                self.record(step, EventType::Faulted);
                if let Some(hook) = fault_hook {
                    hook(err);
                }
            }
        }
        drop(suspension);

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.state = MachineState::Completed;
            lifecycle.outcome = Some(outcome);
            lifecycle.completed_synchronously = from_start;
            lifecycle.unsettled = unsettled.len();
        }
        self.done.notify_all();

        if let Some(callback) = on_complete {
            callback(&Machine {
                shared: Arc::clone(self),
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// What a step can see and create while it runs.
pub struct Context {
    step: usize,
    resumer: Resumer,
    resumed_from: Suspension,
    single: RefCell<Option<OperationHandle>>,
    issued: RefCell<Vec<Barrier>>,
}

impl Context {
    fn new(step: usize, resumer: Resumer, resumed_from: Suspension) -> Self {
        Self {
            step,
            resumer,
            resumed_from,
            single: RefCell::new(None),
            issued: RefCell::new(Vec::new()),
        }
    }

    /// One-based number of the step being run.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Creates a barrier for this step.
    ///
    /// `timeout` is measured from now; `None` waits until the quorum is met.
    pub fn barrier(
        &self,
        total: usize,
        quorum: usize,
        timeout: Option<Duration>,
    ) -> Result<Barrier, MachineError> {
        let barrier = Barrier::new(total, quorum, timeout, self.resumer.clone())?;
        self.issued.borrow_mut().push(barrier.clone());
        Ok(barrier)
    }

    /// Creates a barrier that waits for every operation.
    pub fn all(&self, total: usize, timeout: Option<Duration>) -> Result<Barrier, MachineError> {
        self.barrier(total, total, timeout)
    }

    /// Creates a barrier that resumes on the first completion.
    pub fn any(&self, total: usize, timeout: Option<Duration>) -> Result<Barrier, MachineError> {
        self.barrier(total, 1, timeout)
    }

    /// Issues this step's only operation; yield [`Barrier::single`] afterwards.
    pub fn single_operation(&self) -> Result<OperationHandle, MachineError> {
        let mut slot = self.single.borrow_mut();
        if slot.is_some() {
            return Err(MachineError::SingleOperationIssued { step: self.step });
        }

        let state = Arc::new(OperationState::new("single".into()));
        let handle = OperationHandle::new(state, Owner::Machine(self.resumer.clone()));
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The barrier that resumed the machine before this step.
    pub fn resumed_barrier(&self) -> Option<&Barrier> {
        match &self.resumed_from {
            Suspension::Barrier(barrier) => Some(barrier),
            _ => None,
        }
    }

    /// The single operation that resumed the machine before this step.
    pub fn resumed_operation(&self) -> Option<&OperationHandle> {
        match &self.resumed_from {
            Suspension::Single(operation) => Some(operation),
            _ => None,
        }
    }

    fn take_single(&self) -> Option<OperationHandle> {
        self.single.borrow_mut().take()
    }

    /// Operations this step could still have cancelled or ended, but did not.
    fn unsettled(
        &self,
        yielded: Option<Barrier>,
        single: Option<OperationHandle>,
    ) -> Vec<OperationHandle> {
        let mut barriers: Vec<Barrier> = Vec::new();
        let resumed = self.resumed_barrier().cloned();
        let issued = self.issued.borrow().clone();
        for barrier in resumed.into_iter().chain(issued).chain(yielded) {
            if !barrier.is_single() && !barriers.iter().any(|seen| seen.same_as(&barrier)) {
                barriers.push(barrier);
            }
        }

        let mut operations: Vec<OperationHandle> =
            barriers.iter().flat_map(Barrier::operations).collect();
        operations.extend(self.resumed_operation().cloned());
        operations.extend(single);
        operations.retain(|operation| !operation.is_claimed());
        operations
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("step", &self.step)
            .field("resumed_barrier", &self.resumed_barrier())
            .field("resumed_operation", &self.resumed_operation())
            .finish()
    }
}

/// Drives a [`Continuation`] to completion.
///
/// `Machine` is a cheap handle; clones observe and control the same machine.
///
/// # Example
///
/// ```rust
/// use std::thread;
/// use std::time::Duration;
/// use asyncmachine::{Context, Machine, StepResult};
///
/// let machine = Machine::named("fan-out");
/// let mut issued = false;
/// let result = machine.run(move |cx: &Context| -> StepResult {
///     if issued {
///         let barrier = cx.resumed_barrier().expect("resumed from a barrier");
///         for handle in barrier.operations() {
///             if handle.is_completed() {
///                 handle.end(|_| ())?;
///             } else {
///                 handle.cancel(|_| ());
///             }
///         }
///         return Ok(None);
///     }
///     issued = true;
///
///     let barrier = cx.barrier(3, 2, Some(Duration::from_secs(1)))?;
///     for i in 0..3usize {
///         let completion = barrier.handle_for(i)?.completion();
///         thread::spawn(move || completion.complete(i));
///     }
///     Ok(Some(barrier))
/// });
/// assert!(result.is_ok());
/// ```
#[derive(Clone)]
pub struct Machine {
    shared: Arc<Shared>,
}

impl Machine {
    /// Creates a machine with the default name.
    pub fn new() -> Self {
        Self::named("machine")
    }

    /// Creates a machine whose name appears in log output.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                flags: AtomicU8::new(0),
                epoch: AtomicU64::new(0),
                core: Mutex::new(Core {
                    continuation: None,
                    step: 0,
                    suspension: Suspension::Ready,
                    timer: None,
                    fault_hook: None,
                    on_complete: None,
                }),
                lifecycle: Mutex::new(Lifecycle {
                    state: MachineState::NotStarted,
                    outcome: None,
                    completed_synchronously: false,
                    unsettled: 0,
                }),
                done: Condvar::new(),
                timeline: Mutex::new(MachineTimeline::new()),
            }),
        }
    }

    /// Name used in log output.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Sets a hook run synchronously when the machine faults, before waiters
    /// are released.
    pub fn set_fault_hook<F>(&self, hook: F)
    where
        F: Fn(&MachineError) + Send + Sync + 'static,
    {
        lock(&self.shared.core).fault_hook = Some(Arc::new(hook));
    }

    /// Limits how many timeline events the machine retains.
    ///
    /// The timeline keeps the most recent
    /// [`DEFAULT_CAPACITY`](crate::monitoring::timeline::DEFAULT_CAPACITY)
    /// events by default; 0 turns recording off.
    pub fn set_timeline_capacity(&self, capacity: usize) {
        lock(&self.shared.timeline).set_capacity(capacity);
    }

    /// Starts (or restarts) the machine with a new continuation.
    ///
    /// Steps run on the calling thread until the first real suspension.
    /// Fails with [`MachineError::AlreadyRunning`] unless the machine is
    /// new or completed.
    pub fn start<C>(&self, continuation: C) -> Result<(), MachineError>
    where
        C: Continuation + 'static,
    {
        self.begin(Box::new(continuation), None, || ())
    }

    /// Starts the machine and runs `on_complete` once it completes.
    ///
    /// The callback runs on the thread that finishes the machine; any state it
    /// needs is captured by the closure.
    pub fn start_with_callback<C, F>(&self, continuation: C, on_complete: F) -> Result<(), MachineError>
    where
        C: Continuation + 'static,
        F: FnOnce(&Machine) + Send + 'static,
    {
        self.begin(Box::new(continuation), Some(Box::new(on_complete)), || ())
    }

    /// Like [`start`](Self::start), running `prepare` once the start has been
    /// accepted and before the first step.
    pub(crate) fn start_prepared<C>(
        &self,
        continuation: C,
        prepare: impl FnOnce(),
    ) -> Result<(), MachineError>
    where
        C: Continuation + 'static,
    {
        self.begin(Box::new(continuation), None, prepare)
    }

    /// Creates and starts a machine, returning its handle.
    ///
    /// The handle may be dropped: pending completions and armed timeouts keep
    /// the machine alive, and `on_complete` alone observes the outcome.
    pub fn launch<C, F>(continuation: C, on_complete: F) -> Result<Machine, MachineError>
    where
        C: Continuation + 'static,
        F: FnOnce(&Machine) + Send + 'static,
    {
        let machine = Machine::new();
        machine.start_with_callback(continuation, on_complete)?;
        Ok(machine)
    }

    /// Starts the machine and blocks until it completes.
    pub fn run<C>(&self, continuation: C) -> Result<(), MachineError>
    where
        C: Continuation + 'static,
    {
        self.start(continuation)?;
        self.wait()
    }

    fn begin(
        &self,
        continuation: Box<dyn Continuation>,
        on_complete: Option<CompletionCallback>,
        prepare: impl FnOnce(),
    ) -> Result<(), MachineError> {
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if lifecycle.state == MachineState::Running {
                error!("machine '{}' started while already running", self.shared.name);
                return Err(MachineError::AlreadyRunning);
            }
            lifecycle.state = MachineState::Running;
            lifecycle.outcome = None;
            lifecycle.completed_synchronously = false;
            lifecycle.unsettled = 0;
        }
        prepare();

        let stale_timer = {
            let mut core = lock(&self.shared.core);
            core.continuation = Some(continuation);
            core.step = 0;
            core.suspension = Suspension::Ready;
            core.on_complete = on_complete;
            core.timer.take()
        };
        drop(stale_timer);
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);

        {
            let mut timeline = lock(&self.shared.timeline);
            timeline.reset();
            timeline.add_event(0, EventType::Started);
        }
        info!("machine '{}' started", self.shared.name);

        self.shared.kick(true);
        Ok(())
    }

    /// Blocks until the machine completes, then returns its outcome.
    ///
    /// A step failure is returned as the same [`MachineError`] to every
    /// caller. Must not be called from inside one of the machine's own steps.
    pub fn wait(&self) -> Result<(), MachineError> {
        let lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state == MachineState::NotStarted {
            return Err(MachineError::NotStarted);
        }

        let lifecycle = self
            .shared
            .done
            .wait_while(lifecycle, |l| l.state != MachineState::Completed)
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.outcome.clone().unwrap_or(Ok(()))
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `None` if the machine is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), MachineError>> {
        let lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state == MachineState::NotStarted {
            return Some(Err(MachineError::NotStarted));
        }

        let (lifecycle, _) = self
            .shared
            .done
            .wait_timeout_while(lifecycle, timeout, |l| l.state != MachineState::Completed)
            .unwrap_or_else(PoisonError::into_inner);
        if lifecycle.state != MachineState::Completed {
            return None;
        }
        Some(lifecycle.outcome.clone().unwrap_or(Ok(())))
    }

    /// Returns the outcome without blocking.
    ///
    /// Fails with [`MachineError::NotCompleted`] while the machine runs.
    pub fn try_result(&self) -> Result<(), MachineError> {
        let lifecycle = lock(&self.shared.lifecycle);
        match lifecycle.state {
            MachineState::NotStarted => Err(MachineError::NotStarted),
            MachineState::Running => Err(MachineError::NotCompleted),
            MachineState::Completed => lifecycle.outcome.clone().unwrap_or(Ok(())),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MachineState {
        lock(&self.shared.lifecycle).state
    }

    /// True once the continuation finished or faulted.
    pub fn is_completed(&self) -> bool {
        self.state() == MachineState::Completed
    }

    /// True if the last run completed inside its `start` call.
    pub fn completed_synchronously(&self) -> bool {
        let lifecycle = lock(&self.shared.lifecycle);
        lifecycle.state == MachineState::Completed && lifecycle.completed_synchronously
    }

    /// Operations the last run left neither cancelled nor ended.
    ///
    /// Counted when the machine completes, from the barrier or single
    /// operation the final step resumed from and anything that step issued.
    /// Always 0 while the machine runs.
    pub fn unsettled_operations(&self) -> usize {
        let lifecycle = lock(&self.shared.lifecycle);
        match lifecycle.state {
            MachineState::Completed => lifecycle.unsettled,
            _ => 0,
        }
    }

    /// Snapshot of the current run's timeline.
    pub fn timeline(&self) -> MachineTimeline {
        lock(&self.shared.timeline).clone()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{Completion, Payload};
    use crate::monitoring::timeline::DEFAULT_CAPACITY;
    use std::sync::mpsc::{channel, Sender};
    use std::thread;
    use std::time::Instant;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    #[error("replica {0} rejected the write")]
    struct Rejected(usize);

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl FnOnce(Payload) + Send + 'static {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Small deterministic generator for shuffled schedules.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    /// One barrier of `total` operations whose completions are sent to the test.
    fn fan_out(
        total: usize,
        quorum: usize,
        timeout: Option<Duration>,
        completions: Sender<Vec<Completion>>,
        flags: Sender<Vec<bool>>,
        finalized: Arc<AtomicUsize>,
    ) -> impl Continuation {
        let mut issued = false;
        move |cx: &Context| -> StepResult {
            if !issued {
                issued = true;
                let barrier = cx.barrier(total, quorum, timeout)?;
                let mut pending = Vec::new();
                for key in 1..=total {
                    pending.push(barrier.handle_for(key)?.completion());
                }
                completions.send(pending)?;
                return Ok(Some(barrier));
            }

            let barrier = cx.resumed_barrier().ok_or("missing barrier")?;
            let handles = barrier.operations();
            flags.send(handles.iter().map(|h| h.is_completed()).collect())?;
            for handle in handles {
                if handle.is_completed() {
                    handle.end(counting(&finalized))?;
                } else {
                    handle.cancel(counting(&finalized));
                }
            }
            Ok(None)
        }
    }

    #[test]
    fn test_empty_continuation_completes_synchronously() {
        let machine = Machine::new();
        machine.start(|_: &Context| -> StepResult { Ok(None) }).unwrap();

        assert!(machine.is_completed());
        assert!(machine.completed_synchronously());
        assert!(machine.try_result().is_ok());
        assert!(machine.wait().is_ok());
        assert_eq!(machine.timeline().count(EventType::Completed), 1);
    }

    #[test]
    fn test_wait_before_start_is_usage_error() {
        let machine = Machine::named("idle");
        assert_eq!(machine.state(), MachineState::NotStarted);
        assert!(matches!(machine.wait(), Err(MachineError::NotStarted)));
        assert!(matches!(machine.try_result(), Err(MachineError::NotStarted)));
    }

    #[test]
    fn test_empty_barrier_passes_through() {
        let machine = Machine::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&steps);

        machine
            .start(move |cx: &Context| -> StepResult {
                seen.fetch_add(1, Ordering::SeqCst);
                if cx.step() < 4 {
                    Ok(Some(cx.barrier(0, 0, Some(Duration::from_millis(1)))?))
                } else {
                    Ok(None)
                }
            })
            .unwrap();

        assert!(machine.completed_synchronously());
        assert_eq!(steps.load(Ordering::SeqCst), 4);
        assert_eq!(machine.timeline().count(EventType::Suspended), 0);
    }

    #[test]
    fn test_synchronous_single_operations_do_not_recurse() {
        const STEPS: usize = 50_000;
        let machine = Machine::named("sync-chain");
        let total = Arc::new(AtomicUsize::new(0));
        let sum = Arc::clone(&total);

        machine
            .start(move |cx: &Context| -> StepResult {
                if let Some(previous) = cx.resumed_operation() {
                    let value = previous.end_as::<usize>()?.ok_or("wrong payload type")?;
                    sum.fetch_add(value, Ordering::SeqCst);
                }
                if cx.step() > STEPS {
                    return Ok(None);
                }
                let operation = cx.single_operation()?;
                operation.completion().complete(cx.step());
                Ok(Some(Barrier::single()))
            })
            .unwrap();

        assert!(machine.completed_synchronously());
        assert!(machine.wait().is_ok());
        assert_eq!(total.load(Ordering::SeqCst), STEPS * (STEPS + 1) / 2);

        let timeline = machine.timeline();
        assert_eq!(timeline.events().len(), DEFAULT_CAPACITY);
        assert_eq!(timeline.dropped(), 2 * STEPS + 2 - DEFAULT_CAPACITY);
        assert_eq!(timeline.count(EventType::Completed), 1);
    }

    #[test]
    fn test_timeline_recording_can_be_disabled() {
        let machine = Machine::new();
        machine.set_timeline_capacity(0);
        let result = machine.run(|cx: &Context| -> StepResult {
            if cx.step() > 3 {
                return Ok(None);
            }
            Ok(Some(cx.barrier(0, 0, None)?))
        });

        assert!(result.is_ok());
        assert!(machine.timeline().events().is_empty());
        assert_eq!(machine.timeline().capacity(), 0);
    }

    #[test]
    fn test_single_operation_completed_on_another_thread() {
        let machine = Machine::new();
        let result = machine.run(move |cx: &Context| -> StepResult {
            if let Some(previous) = cx.resumed_operation() {
                assert!(previous.is_single());
                let text = previous.end_as::<String>()?.ok_or("wrong payload type")?;
                return if text == "pong" { Ok(None) } else { Err("bad reply".into()) };
            }
            let completion = cx.single_operation()?.completion();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                completion.complete(String::from("pong"));
            });
            Ok(Some(Barrier::single()))
        });

        assert!(result.is_ok());
        assert!(!machine.completed_synchronously());
    }

    #[test]
    fn test_quorum_three_of_five_resumes_after_fifth_callback() {
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, flags_rx) = channel();
        let finalized = counter();

        let machine = Machine::named("quorum");
        machine
            .start(fan_out(5, 3, None, completions_tx, flags_tx, Arc::clone(&finalized)))
            .unwrap();

        let mut completions: Vec<Option<Completion>> =
            completions_rx.recv().unwrap().into_iter().map(Some).collect();

        for index in [1, 3] {
            completions[index].take().unwrap().complete(index);
        }
        assert!(machine.wait_timeout(Duration::from_millis(50)).is_none());
        assert!(flags_rx.try_recv().is_err());

        completions[4].take().unwrap().complete(4usize);
        assert!(machine.wait().is_ok());
        assert_eq!(flags_rx.recv().unwrap(), vec![false, true, false, true, true]);
        assert_eq!(finalized.load(Ordering::SeqCst), 3);

        completions[0].take().unwrap().complete(0usize);
        completions[2].take().unwrap().complete(2usize);
        assert_eq!(finalized.load(Ordering::SeqCst), 5);

        let timeline = machine.timeline();
        assert_eq!(timeline.count(EventType::Resumed), 1);
        assert_eq!(timeline.count(EventType::TimedOut), 0);
    }

    #[test]
    fn test_timeout_with_one_straggler() {
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, flags_rx) = channel();
        let finalized = counter();

        let machine = Machine::named("timeout");
        machine
            .start(fan_out(
                5,
                5,
                Some(Duration::from_millis(50)),
                completions_tx,
                flags_tx,
                Arc::clone(&finalized),
            ))
            .unwrap();

        let mut completions = completions_rx.recv().unwrap();
        let straggler = completions.pop().unwrap();
        for (index, completion) in completions.into_iter().enumerate() {
            completion.complete(index);
        }

        assert!(machine.wait().is_ok());
        assert_eq!(flags_rx.recv().unwrap(), vec![true, true, true, true, false]);
        assert_eq!(finalized.load(Ordering::SeqCst), 4);

        thread::sleep(Duration::from_millis(1));
        straggler.complete(4usize);
        assert_eq!(finalized.load(Ordering::SeqCst), 5);

        let timeline = machine.timeline();
        assert_eq!(timeline.count(EventType::TimedOut), 1);
        assert_eq!(timeline.count(EventType::Resumed), 0);
    }

    #[test]
    fn test_nothing_completes_before_timeout() {
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, flags_rx) = channel();
        let finalized = counter();

        let machine = Machine::new();
        let started = Instant::now();
        machine
            .start(fan_out(
                3,
                1,
                Some(Duration::from_millis(20)),
                completions_tx,
                flags_tx,
                Arc::clone(&finalized),
            ))
            .unwrap();
        let completions = completions_rx.recv().unwrap();

        assert!(machine.wait().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(flags_rx.recv().unwrap(), vec![false, false, false]);

        for completion in completions {
            completion.complete(());
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_step_error_is_replayed_and_stops_the_machine() {
        let later_steps = counter();
        let seen = Arc::clone(&later_steps);
        let machine = Machine::named("failing");

        let result = machine.run(move |cx: &Context| -> StepResult {
            match cx.step() {
                1 | 2 => Ok(Some(cx.barrier(0, 0, None)?)),
                3 => Err(Box::new(Rejected(7))),
                _ => {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }
        });

        let err = result.unwrap_err();
        assert_eq!(err.failed_step(), Some(3));
        assert_eq!(err.step_error().unwrap().downcast_ref::<Rejected>(), Some(&Rejected(7)));
        assert_eq!(later_steps.load(Ordering::SeqCst), 0);

        let replay = machine.wait().unwrap_err();
        assert_eq!(replay.step_error().unwrap().to_string(), "replica 7 rejected the write");
        assert_eq!(machine.timeline().count(EventType::Faulted), 1);
    }

    #[test]
    fn test_panicking_step_is_captured() {
        let machine = Machine::new();
        let result = machine.run(|cx: &Context| -> StepResult {
            if cx.step() == 1 {
                panic!("step exploded");
            }
            Ok(None)
        });

        match result {
            Err(MachineError::Panicked { step, message }) => {
                assert_eq!(step, 1);
                assert_eq!(message, "step exploded");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_fault_hook_runs_once_before_waiters() {
        let machine = Machine::new();
        let hooked = counter();
        let hook_count = Arc::clone(&hooked);
        machine.set_fault_hook(move |err| {
            assert_eq!(err.failed_step(), Some(1));
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        let result = machine.run(|_: &Context| -> StepResult { Err("boom".into()) });
        assert!(result.is_err());
        assert_eq!(hooked.load(Ordering::SeqCst), 1);

        let _ = machine.wait();
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_while_running_is_rejected_and_restart_after_completion() {
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, _flags_rx) = channel();
        let machine = Machine::new();
        machine
            .start(fan_out(1, 1, None, completions_tx, flags_tx, counter()))
            .unwrap();

        assert!(matches!(
            machine.start(|_: &Context| -> StepResult { Ok(None) }),
            Err(MachineError::AlreadyRunning)
        ));
        assert!(matches!(machine.try_result(), Err(MachineError::NotCompleted)));

        for completion in completions_rx.recv().unwrap() {
            completion.complete(());
        }
        assert!(machine.wait().is_ok());

        machine
            .start(|_: &Context| -> StepResult { Err("second run".into()) })
            .unwrap();
        assert_eq!(machine.wait().unwrap_err().failed_step(), Some(1));
    }

    #[test]
    fn test_launch_invokes_callback_on_completion() {
        let (done_tx, done_rx) = channel();
        let machine = Machine::launch(
            |cx: &Context| -> StepResult {
                if cx.step() == 1 {
                    let completion = cx.single_operation()?.completion();
                    thread::spawn(move || completion.complete(()));
                    return Ok(Some(Barrier::single()));
                }
                cx.resumed_operation().ok_or("no operation")?.end(|_| ())?;
                Ok(None)
            },
            move |machine: &Machine| {
                done_tx.send(machine.try_result().is_ok()).unwrap();
            },
        )
        .unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(machine.is_completed());
    }

    #[test]
    fn test_launched_machine_finishes_after_handle_is_dropped() {
        let (completion_tx, completion_rx) = channel();
        let (done_tx, done_rx) = channel();
        let finalized = counter();
        let sink = Arc::clone(&finalized);

        let machine = Machine::launch(
            move |cx: &Context| -> StepResult {
                if let Some(previous) = cx.resumed_operation() {
                    previous.end(counting(&sink))?;
                    return Ok(None);
                }
                completion_tx.send(cx.single_operation()?.completion())?;
                Ok(Some(Barrier::single()))
            },
            move |machine: &Machine| {
                done_tx.send(machine.try_result().is_ok()).unwrap();
            },
        )
        .unwrap();

        let completion = completion_rx.recv().unwrap();
        assert!(!machine.is_completed());
        drop(machine);

        thread::spawn(move || completion.complete(7u32)).join().unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launched_machine_times_out_after_handle_is_dropped() {
        let (done_tx, done_rx) = channel();
        let machine = Machine::launch(
            |cx: &Context| -> StepResult {
                if let Some(barrier) = cx.resumed_barrier() {
                    barrier.cancel_pending(|_| |_: Payload| ());
                    return Ok(None);
                }
                let barrier = cx.barrier(1, 1, Some(Duration::from_millis(20)))?;
                drop(barrier.handle_for("never")?.completion());
                Ok(Some(barrier))
            },
            move |machine: &Machine| {
                let resumed_by_timeout = machine.timeline().count(EventType::TimedOut) == 1;
                done_tx.send(resumed_by_timeout).unwrap();
            },
        )
        .unwrap();

        drop(machine);
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
    }

    #[test]
    fn test_fault_reports_operations_left_uncancelled() {
        let (straggler_tx, straggler_rx) = channel();
        let machine = Machine::named("abandoning");

        let result = machine.run(move |cx: &Context| -> StepResult {
            if let Some(barrier) = cx.resumed_barrier() {
                assert_eq!(barrier.resumed_by(), Some(ResumeCause::Timeout));
                barrier.handle_for("fast")?.end(|_| ())?;
                return Err("gave up after the timeout".into());
            }
            let barrier = cx.barrier(2, 2, Some(Duration::from_millis(20)))?;
            barrier.handle_for("fast")?.completion().complete(1u8);
            straggler_tx.send(barrier.handle_for("slow")?.completion())?;
            Ok(Some(barrier))
        });

        assert_eq!(result.unwrap_err().failed_step(), Some(2));
        assert_eq!(machine.unsettled_operations(), 1);
        drop(straggler_rx);
    }

    #[test]
    fn test_settled_run_reports_no_unsettled_operations() {
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, _flags_rx) = channel();
        let machine = Machine::new();
        machine
            .start(fan_out(3, 1, None, completions_tx, flags_tx, counter()))
            .unwrap();
        assert_eq!(machine.unsettled_operations(), 0);

        let mut completions = completions_rx.recv().unwrap();
        completions.remove(0).complete(());
        assert!(machine.wait().is_ok());
        assert_eq!(machine.unsettled_operations(), 0);
    }

    #[test]
    fn test_wait_from_another_thread() {
        let machine = Machine::new();
        let (completions_tx, completions_rx) = channel();
        let (flags_tx, _flags_rx) = channel();
        machine
            .start(fan_out(2, 2, None, completions_tx, flags_tx, counter()))
            .unwrap();

        let observer = {
            let machine = machine.clone();
            thread::spawn(move || machine.wait())
        };
        for completion in completions_rx.recv().unwrap() {
            thread::spawn(move || completion.complete(()));
        }
        assert!(observer.join().unwrap().is_ok());
    }

    #[test]
    fn test_yielding_a_barrier_twice_faults() {
        let machine = Machine::new();
        let mut kept: Option<Barrier> = None;
        let result = machine.run(move |cx: &Context| -> StepResult {
            if let Some(barrier) = kept.clone() {
                return Ok(Some(barrier));
            }
            let barrier = cx.barrier(1, 1, None)?;
            barrier.handle_for("only")?.completion().complete(());
            kept = Some(barrier.clone());
            Ok(Some(barrier))
        });

        assert!(matches!(result, Err(MachineError::BarrierExhausted)));
        assert_eq!(machine.unsettled_operations(), 1);
    }

    #[test]
    fn test_yielding_a_barrier_from_an_earlier_step_faults() {
        let machine = Machine::new();
        let mut stashed: Option<Barrier> = None;
        let result = machine.run(move |cx: &Context| -> StepResult {
            if let Some(barrier) = stashed.take() {
                return Ok(Some(barrier));
            }
            stashed = Some(cx.barrier(1, 1, None)?);
            Ok(Some(cx.barrier(0, 0, None)?))
        });

        assert!(matches!(result, Err(MachineError::ForeignBarrier { step: 2 })));
    }

    #[test]
    fn test_yielding_another_machines_barrier_faults() {
        let (barrier_tx, barrier_rx) = channel();
        let donor = Machine::new();
        donor
            .start(move |cx: &Context| -> StepResult {
                barrier_tx.send(cx.barrier(1, 1, None)?)?;
                Ok(None)
            })
            .unwrap();
        let borrowed = barrier_rx.recv().unwrap();

        let machine = Machine::new();
        let result = machine.run(move |_: &Context| -> StepResult { Ok(Some(borrowed.clone())) });
        assert!(matches!(result, Err(MachineError::ForeignBarrier { step: 1 })));
    }

    #[test]
    fn test_single_barrier_without_operation_faults() {
        let machine = Machine::new();
        let result = machine.run(|_: &Context| -> StepResult { Ok(Some(Barrier::single())) });
        assert!(matches!(result, Err(MachineError::NoSingleOperation { step: 1 })));
    }

    #[test]
    fn test_second_single_operation_in_one_step_rejected() {
        let machine = Machine::new();
        let result = machine.run(|cx: &Context| -> StepResult {
            let first = cx.single_operation()?;
            let second = cx.single_operation();
            assert!(matches!(second, Err(MachineError::SingleOperationIssued { step: 1 })));
            first.completion().complete(());
            first.end(|_| ())?;
            Ok(None)
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_steps_builder_runs_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

        let steps = Steps::new()
            .then(move |cx: &Context| -> StepResult {
                a.lock().unwrap().push("issue");
                let barrier = cx.all(2, None)?;
                for key in ["left", "right"] {
                    let completion = barrier.handle_for(key)?.completion();
                    thread::spawn(move || completion.complete(key));
                }
                Ok(Some(barrier))
            })
            .then(move |cx: &Context| -> StepResult {
                let barrier = cx.resumed_barrier().ok_or("no barrier")?;
                for handle in barrier.operations() {
                    handle.end(|_| ())?;
                }
                b.lock().unwrap().push("collect");
                Ok(None)
            })
            .then(move |_: &Context| -> StepResult {
                c.lock().unwrap().push("report");
                Ok(None)
            });
        assert_eq!(steps.len(), 3);

        assert!(Machine::new().run(steps).is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["issue", "collect", "report"]);
    }

    #[test]
    fn test_randomized_rounds_finalize_every_operation_once() {
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

        for trial in 0..25 {
            let rounds = 1 + rng.below(3) as usize;
            let plan: Vec<(usize, usize, Vec<u64>)> = (0..rounds)
                .map(|_| {
                    let total = 1 + rng.below(6) as usize;
                    let quorum = 1 + rng.below(total as u64) as usize;
                    let delays = (0..total).map(|_| rng.below(12)).collect();
                    (total, quorum, delays)
                })
                .collect();
            let issued: usize = plan.iter().map(|(total, _, _)| total).sum();

            let finalized = counter();
            let sink = Arc::clone(&finalized);
            let mut round = 0;
            let mut stragglers = Vec::new();
            let machine = Machine::named(format!("trial-{}", trial));

            let rounds_plan = plan.clone();
            let (joins_tx, joins_rx) = channel();
            machine
                .start(move |cx: &Context| -> StepResult {
                    if let Some(barrier) = cx.resumed_barrier() {
                        for handle in barrier.operations() {
                            if handle.is_completed() {
                                handle.end(counting(&sink))?;
                            } else {
                                handle.cancel(counting(&sink));
                            }
                        }
                    }
                    let Some((total, quorum, delays)) = rounds_plan.get(round) else {
                        return Ok(None);
                    };
                    round += 1;

                    let barrier = cx.barrier(*total, *quorum, Some(Duration::from_millis(5)))?;
                    for (key, delay) in delays.iter().enumerate() {
                        let completion = barrier.handle_for(key)?.completion();
                        if *delay == 0 {
                            completion.complete(key);
                        } else {
                            let delay = Duration::from_millis(*delay);
                            stragglers.push(thread::spawn(move || {
                                thread::sleep(delay);
                                completion.complete(key);
                            }));
                        }
                    }
                    joins_tx.send(std::mem::take(&mut stragglers))?;
                    Ok(Some(barrier))
                })
                .unwrap();

            assert!(machine.wait().is_ok(), "trial {}", trial);
            for batch in joins_rx.try_iter() {
                for join in batch {
                    join.join().unwrap();
                }
            }

            assert_eq!(finalized.load(Ordering::SeqCst), issued, "trial {}", trial);
            let timeline = machine.timeline();
            assert_eq!(
                timeline.count(EventType::Resumed) + timeline.count(EventType::TimedOut),
                rounds,
                "trial {}",
                trial
            );
        }
    }
}
