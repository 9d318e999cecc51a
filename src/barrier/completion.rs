//! Completion Barriers
//!
//! A barrier is the join point of one suspension: it covers `total`
//! operations, resumes its machine once `quorum` of them have completed or
//! once its timeout elapses, and does so exactly once.
//!
//! The `resumed` flag only ever flips false→true through a compare-and-swap.
//! Completion callbacks and the timeout both take the barrier lock before
//! attempting it, so an operation can never be marked completed after the
//! continuation has been told it was not. The machine is notified after the
//! lock is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use once_cell::sync::Lazy;

use super::operation::{OperationHandle, OperationKey, OperationState, Owner, Payload};
use crate::error::MachineError;
use crate::machine::driver::{Anchor, Resumer};
use crate::sync::lock;

/// Why a barrier resumed its machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCause {
    /// The quorum of operations completed.
    Quorum,
    /// The timeout elapsed first.
    Timeout,
    /// The barrier covered no operations and never suspended.
    PassThrough,
    /// The single operation of a fast-path step completed.
    SingleOperation,
}

impl ResumeCause {
    fn encode(self) -> u8 {
        match self {
            Self::Quorum => 1,
            Self::Timeout => 2,
            Self::PassThrough => 3,
            Self::SingleOperation => 4,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Quorum),
            2 => Some(Self::Timeout),
            3 => Some(Self::PassThrough),
            4 => Some(Self::SingleOperation),
            _ => None,
        }
    }
}

/// Process-wide sentinel yielded by steps that issue exactly one operation.
static SINGLE_OPERATION: Lazy<Barrier> = Lazy::new(|| Barrier {
    shared: Arc::new(BarrierShared::new(1, 1, None, None)),
});

pub(crate) struct BarrierShared {
    total: usize,
    quorum: usize,
    timeout: Option<Duration>,
    created: Instant,
    resumer: Option<Resumer>,
    resumed: AtomicBool,
    cause: AtomicU8,
    completed_count: AtomicUsize,
    yielded: AtomicBool,
    operations: Mutex<Vec<Arc<OperationState>>>,
}

impl BarrierShared {
    fn new(total: usize, quorum: usize, timeout: Option<Duration>, resumer: Option<Resumer>) -> Self {
        Self {
            total,
            quorum,
            timeout,
            created: Instant::now(),
            resumer,
            resumed: AtomicBool::new(false),
            cause: AtomicU8::new(0),
            completed_count: AtomicUsize::new(0),
            yielded: AtomicBool::new(false),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Flips `resumed` false→true. Only one caller ever sees `true`.
    fn try_resume(&self, cause: ResumeCause) -> bool {
        let won = self
            .resumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.cause.store(cause.encode(), Ordering::Release);
        }
        won
    }

    pub(crate) fn anchor(&self) -> Option<Anchor> {
        self.resumer.as_ref().and_then(Resumer::anchor)
    }

    fn notify(&self, cause: ResumeCause) {
        if let Some(resumer) = &self.resumer {
            resumer.resume(cause);
        }
    }

    /// Records a completion. Returns false if the barrier had already resumed.
    pub(crate) fn on_operation_completed(&self, op: &OperationState) -> bool {
        let fire = {
            let _operations = lock(&self.operations);
            if self.resumed.load(Ordering::Acquire) {
                return false;
            }
            op.mark_completed();
            let count = self.completed_count.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(
                "operation '{}' completed ({}/{} toward quorum)",
                op.key(),
                count,
                self.quorum
            );
            count >= self.quorum && self.try_resume(ResumeCause::Quorum)
        };

        if fire {
            self.notify(ResumeCause::Quorum);
        }
        true
    }

    /// Resumes the machine if nothing else has yet.
    pub(crate) fn on_timeout(&self) {
        let fired = {
            let operations = lock(&self.operations);
            if !self.try_resume(ResumeCause::Timeout) {
                return;
            }
            let pending = operations.iter().filter(|op| !op.is_completed()).count();
            debug!(
                "barrier timed out after {:?} with {} of {} operations pending",
                self.created.elapsed(),
                pending + self.total.saturating_sub(operations.len()),
                self.total
            );
            true
        };

        if fired {
            self.notify(ResumeCause::Timeout);
        }
    }
}

/// Join point for one suspension of a machine.
///
/// Created through [`Context::barrier`](crate::machine::Context::barrier) and
/// yielded from the step that issued its operations.
#[derive(Clone)]
pub struct Barrier {
    shared: Arc<BarrierShared>,
}

impl Barrier {
    pub(crate) fn new(
        total: usize,
        quorum: usize,
        timeout: Option<Duration>,
        resumer: Resumer,
    ) -> Result<Self, MachineError> {
        let quorum = if total == 0 { 0 } else { quorum };
        if total > 0 && (quorum == 0 || quorum > total) {
            return Err(MachineError::InvalidQuorum { quorum, total });
        }

        Ok(Self {
            shared: Arc::new(BarrierShared::new(total, quorum, timeout, Some(resumer))),
        })
    }

    /// Returns the shared single-operation sentinel.
    pub fn single() -> Barrier {
        SINGLE_OPERATION.clone()
    }

    /// True if this is the single-operation sentinel.
    pub fn is_single(&self) -> bool {
        Arc::ptr_eq(&self.shared, &SINGLE_OPERATION.shared)
    }

    /// Number of operations the barrier covers.
    pub fn total(&self) -> usize {
        self.shared.total
    }

    /// Number of completions required before the machine resumes.
    pub fn quorum(&self) -> usize {
        self.shared.quorum
    }

    /// Timeout measured from barrier creation; `None` waits indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.timeout
    }

    /// Number of operations that completed before resumption.
    pub fn completed_count(&self) -> usize {
        self.shared.completed_count.load(Ordering::Acquire)
    }

    /// True once the barrier has resumed its machine.
    pub fn is_resumed(&self) -> bool {
        self.shared.resumed.load(Ordering::Acquire)
    }

    /// Returns why the barrier resumed, if it has.
    pub fn resumed_by(&self) -> Option<ResumeCause> {
        ResumeCause::decode(self.shared.cause.load(Ordering::Acquire))
    }

    /// Returns the handle for `key`, creating it on first use.
    pub fn handle_for(&self, key: impl Into<OperationKey>) -> Result<OperationHandle, MachineError> {
        if self.is_single() {
            return Err(MachineError::SingleOperationBarrier);
        }

        let key = key.into();
        let mut operations = lock(&self.shared.operations);

        if let Some(op) = operations.iter().find(|op| *op.key() == key) {
            return Ok(self.wrap(Arc::clone(op)));
        }
        if self.is_resumed() {
            return Err(MachineError::BarrierExhausted);
        }
        if operations.len() >= self.shared.total {
            return Err(MachineError::TooManyOperations {
                key,
                total: self.shared.total,
            });
        }

        let op = Arc::new(OperationState::new(key));
        operations.push(Arc::clone(&op));
        Ok(self.wrap(op))
    }

    /// Looks up an existing handle without creating one.
    pub fn operation(&self, key: impl Into<OperationKey>) -> Option<OperationHandle> {
        let key = key.into();
        lock(&self.shared.operations)
            .iter()
            .find(|op| *op.key() == key)
            .map(|op| self.wrap(Arc::clone(op)))
    }

    /// Returns every issued handle in issue order.
    pub fn operations(&self) -> Vec<OperationHandle> {
        lock(&self.shared.operations)
            .iter()
            .map(|op| self.wrap(Arc::clone(op)))
            .collect()
    }

    /// Returns the handles that did not complete before resumption.
    pub fn pending(&self) -> Vec<OperationHandle> {
        self.operations()
            .into_iter()
            .filter(|handle| !handle.is_completed())
            .collect()
    }

    /// Cancels every pending handle with a finalizer built per key.
    ///
    /// Returns the number of handles that accepted a finalizer.
    pub fn cancel_pending<F, G>(&self, mut make_finalizer: F) -> usize
    where
        F: FnMut(&OperationKey) -> G,
        G: FnOnce(Payload) + Send + 'static,
    {
        self.pending()
            .into_iter()
            .filter(|handle| handle.cancel(make_finalizer(handle.key())))
            .count()
    }

    fn wrap(&self, op: Arc<OperationState>) -> OperationHandle {
        OperationHandle::new(op, Owner::Barrier(Arc::clone(&self.shared)))
    }

    pub(crate) fn resumer(&self) -> Option<&Resumer> {
        self.shared.resumer.as_ref()
    }

    /// True if both values refer to the same barrier.
    pub(crate) fn same_as(&self, other: &Barrier) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn created(&self) -> Instant {
        self.shared.created
    }

    /// Marks the barrier as yielded. Returns false if it was yielded before.
    pub(crate) fn mark_yielded(&self) -> bool {
        !self.shared.yielded.swap(true, Ordering::AcqRel)
    }

    /// Resumes an empty barrier without suspending.
    pub(crate) fn pass_through(&self) -> bool {
        self.shared.try_resume(ResumeCause::PassThrough)
    }

    pub(crate) fn on_timeout(&self) {
        self.shared.on_timeout();
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            return f.write_str("Barrier::Single");
        }
        f.debug_struct("Barrier")
            .field("total", &self.total())
            .field("quorum", &self.quorum())
            .field("timeout", &self.timeout())
            .field("completed", &self.completed_count())
            .field("resumed_by", &self.resumed_by())
            .finish()
    }
}
