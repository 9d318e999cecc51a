//! Monitoring Module
//!
//! Observability for running machines.
//!
//! # Components
//!
//! - [`MachineTimeline`]: start, suspension, resumption and completion events

pub mod timeline;

pub use timeline::{EventType, MachineTimeline, TimelineEvent};
