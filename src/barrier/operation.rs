//! Operation Handles
//!
//! One handle per outstanding asynchronous call. The handle records whether
//! the call finished before its barrier resumed the machine, holds the result
//! delivered by the external primitive, and guarantees that the call's
//! finalizer runs exactly once.
//!
//! # Finalization handshake
//!
//! A finalizer needs two things: the result (delivered by the completion
//! callback) and the finalizer itself (supplied by the continuation through
//! [`OperationHandle::cancel`] or [`OperationHandle::end`]). Each side stores
//! its half and then sets its bit in a shared atomic with a compare-and-swap.
//! Whichever side observes the other bit already set runs the finalizer, so it
//! runs exactly once no matter which side arrives last or on which thread.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::completion::{BarrierShared, ResumeCause};
use crate::error::MachineError;
use crate::machine::driver::{Anchor, Resumer};
use crate::sync::lock;

/// Opaque result delivered by an asynchronous primitive.
pub type Payload = Box<dyn Any + Send>;

/// Cleanup routine releasing an outstanding call, run with its result.
pub type Finalizer = Box<dyn FnOnce(Payload) + Send>;

const RESULT_ARRIVED: u8 = 0b001;
const FINALIZER_SUPPLIED: u8 = 0b010;
const FINALIZED: u8 = 0b100;

/// Caller-chosen key identifying an operation within a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey(String);

impl OperationKey {
    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for OperationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&String> for OperationKey {
    fn from(key: &String) -> Self {
        Self(key.clone())
    }
}

impl From<usize> for OperationKey {
    fn from(key: usize) -> Self {
        Self(key.to_string())
    }
}

/// Shared per-operation state.
pub(crate) struct OperationState {
    key: OperationKey,
    /// True only if the result arrived before the owner resumed the machine.
    completed: AtomicBool,
    /// Guards the completion callback (at most once per real operation).
    fired: AtomicBool,
    /// Guards the continuation side (`cancel` or `end`).
    claimed: AtomicBool,
    arrivals: AtomicU8,
    result: Mutex<Option<Payload>>,
    finalizer: Mutex<Option<Finalizer>>,
}

impl OperationState {
    pub(crate) fn new(key: OperationKey) -> Self {
        Self {
            key,
            completed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            arrivals: AtomicU8::new(0),
            result: Mutex::new(None),
            finalizer: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> &OperationKey {
        &self.key
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    fn has_arrived(&self) -> bool {
        self.arrivals.load(Ordering::Acquire) & RESULT_ARRIVED != 0
    }

    fn is_finalized(&self) -> bool {
        self.arrivals.load(Ordering::Acquire) & FINALIZED != 0
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Stores the result and finalizes if the continuation already cancelled.
    fn arrive(&self, payload: Payload) {
        *lock(&self.result) = Some(payload);
        if self.register(RESULT_ARRIVED, FINALIZER_SUPPLIED) {
            debug!("operation '{}' completed after cancellation; finalizing", self.key);
            self.finalize();
        }
    }

    /// Stores the finalizer. Returns false if the continuation side already claimed it.
    fn supply_finalizer(&self, finalizer: Finalizer) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.finalizer) = Some(finalizer);
        if self.register(FINALIZER_SUPPLIED, RESULT_ARRIVED) {
            self.finalize();
        }
        true
    }

    /// Sets `bit` and returns true if `other` was already set.
    fn register(&self, bit: u8, other: u8) -> bool {
        let previous = self
            .arrivals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| Some(state | bit))
            .unwrap_or_else(|state| state);
        previous & other != 0
    }

    fn finalize(&self) {
        let finalizer = lock(&self.finalizer).take();
        let payload = lock(&self.result).take();
        self.arrivals.fetch_or(FINALIZED, Ordering::AcqRel);

        match (finalizer, payload) {
            (Some(finalizer), Some(payload)) => finalizer(payload),
            _ => warn!("operation '{}' finalized without both halves present", self.key),
        }
    }

    /// Runs `f` with the result of an operation that completed in time.
    fn end_with<T>(&self, f: impl FnOnce(Payload) -> T) -> Result<T, MachineError> {
        if !self.is_completed() {
            return Err(MachineError::OperationPending {
                key: self.key.clone(),
            });
        }
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(MachineError::AlreadyFinalized {
                key: self.key.clone(),
            });
        }

        self.arrivals
            .fetch_or(FINALIZER_SUPPLIED | FINALIZED, Ordering::AcqRel);
        let payload = lock(&self.result)
            .take()
            .ok_or_else(|| MachineError::AlreadyFinalized {
                key: self.key.clone(),
            })?;
        Ok(f(payload))
    }
}

impl Drop for OperationState {
    fn drop(&mut self) {
        let state = *self.arrivals.get_mut();
        if state & RESULT_ARRIVED != 0 && state & FINALIZED == 0 {
            warn!(
                "operation '{}' was dropped without being finalized; its result leaked",
                self.key
            );
        }
    }
}

/// Who is told when an operation completes.
#[derive(Clone)]
pub(crate) enum Owner {
    Barrier(Arc<BarrierShared>),
    Machine(Resumer),
}

/// Handle to one outstanding asynchronous call.
///
/// Obtained from [`Barrier::handle_for`](super::Barrier::handle_for) or, on the
/// single-operation path, from
/// [`Context::single_operation`](crate::machine::Context::single_operation).
#[derive(Clone)]
pub struct OperationHandle {
    op: Arc<OperationState>,
    owner: Owner,
}

impl OperationHandle {
    pub(crate) fn new(op: Arc<OperationState>, owner: Owner) -> Self {
        Self { op, owner }
    }

    /// Returns the operation's key.
    pub fn key(&self) -> &OperationKey {
        self.op.key()
    }

    /// True if the operation finished before its barrier resumed the machine.
    pub fn is_completed(&self) -> bool {
        self.op.is_completed()
    }

    /// True once the completion callback has delivered a result.
    pub fn has_arrived(&self) -> bool {
        self.op.has_arrived()
    }

    /// True once the operation's finalizer has run.
    pub fn is_finalized(&self) -> bool {
        self.op.is_finalized()
    }

    /// True once the continuation has cancelled or ended the operation.
    pub fn is_claimed(&self) -> bool {
        self.op.is_claimed()
    }

    /// True for the operation issued on the single-operation path.
    pub fn is_single(&self) -> bool {
        matches!(self.owner, Owner::Machine(_))
    }

    /// Returns the callback to hand to the asynchronous primitive.
    ///
    /// Until it fires or is dropped, the callback keeps the owning machine
    /// alive, so a launched machine still runs to completion after its last
    /// [`Machine`](crate::Machine) handle is gone.
    pub fn completion(&self) -> Completion {
        let anchor = match &self.owner {
            Owner::Barrier(barrier) => barrier.anchor(),
            Owner::Machine(resumer) => resumer.anchor(),
        };
        Completion {
            op: Arc::clone(&self.op),
            owner: self.owner.clone(),
            _anchor: anchor,
        }
    }

    /// Supplies the finalizer for an operation that did not complete in time.
    ///
    /// The finalizer runs now if the late result has already arrived, or on the
    /// completion thread when it does. Every handle left with
    /// `is_completed() == false` after resumption must be cancelled, otherwise
    /// the outstanding call is leaked. Returns false (and drops `finalizer`) if
    /// the handle was already cancelled or ended.
    pub fn cancel<F>(&self, finalizer: F) -> bool
    where
        F: FnOnce(Payload) + Send + 'static,
    {
        let accepted = self.op.supply_finalizer(Box::new(finalizer));
        if !accepted {
            debug!("operation '{}' already finalized; ignoring cancel", self.key());
        }
        accepted
    }

    /// Finalizes an operation that completed in time, returning `f`'s output.
    pub fn end<T, F>(&self, f: F) -> Result<T, MachineError>
    where
        F: FnOnce(Payload) -> T,
    {
        self.op.end_with(f)
    }

    /// Like [`end`](Self::end), downcasting the result to `T`.
    ///
    /// Returns `Ok(None)` if the payload has a different type; the payload is
    /// still consumed.
    pub fn end_as<T: Any>(&self) -> Result<Option<T>, MachineError> {
        self.end(|payload| payload.downcast::<T>().ok().map(|value| *value))
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("key", self.key())
            .field("completed", &self.is_completed())
            .field("arrived", &self.has_arrived())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Completion callback for one operation.
///
/// Consuming `complete` makes each `Completion` fire at most once. If several
/// completions exist for the same handle, only the first to fire is honoured.
pub struct Completion {
    op: Arc<OperationState>,
    owner: Owner,
    _anchor: Option<Anchor>,
}

impl Completion {
    /// Delivers the operation's result.
    pub fn complete<T: Any + Send>(self, value: T) {
        self.complete_boxed(Box::new(value));
    }

    /// Delivers an already boxed result.
    pub fn complete_boxed(self, payload: Payload) {
        if self.op.fired.swap(true, Ordering::AcqRel) {
            warn!(
                "operation '{}' completed more than once; ignoring",
                self.op.key()
            );
            return;
        }

        self.op.arrive(payload);

        match &self.owner {
            Owner::Barrier(barrier) => {
                if !barrier.on_operation_completed(&self.op) {
                    debug!("operation '{}' completed after its barrier resumed", self.op.key());
                }
            }
            Owner::Machine(resumer) => {
                self.op.mark_completed();
                resumer.resume(ResumeCause::SingleOperation);
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("key", self.op.key()).finish()
    }
}
