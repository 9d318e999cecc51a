//! Completion Barrier Module
//!
//! Join primitives for one suspension point of a machine.
//!
//! # Components
//!
//! - [`completion`]: [`Barrier`], quorum/timeout bookkeeping and the
//!   single-operation sentinel
//! - [`operation`]: [`OperationHandle`] and its exactly-once finalizer
//! - `timer`: one-shot timeout timer used by the driver

pub mod completion;
pub mod operation;
pub(crate) mod timer;

pub use completion::{Barrier, ResumeCause};
pub use operation::{Completion, Finalizer, OperationHandle, OperationKey, Payload};
