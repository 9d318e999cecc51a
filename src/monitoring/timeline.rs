//! Machine Timeline
//!
//! Tracks when a machine starts, suspends on each step's barrier, resumes,
//! and finishes, for diagnostics and suspension-time reports.
//!
//! The timeline is a ring buffer: once it holds `capacity` events the oldest
//! are discarded, so a long-running machine keeps only its recent history.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The machine was started
    Started,
    /// A step yielded a barrier and the machine suspended
    Suspended,
    /// The barrier resumed the machine (quorum or single operation)
    Resumed,
    /// The barrier resumed the machine because its timeout elapsed
    TimedOut,
    /// The continuation was exhausted
    Completed,
    /// A step failed or panicked
    Faulted,
}

/// A single event in the machine timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Step the event belongs to (0 before the first step)
    pub step: usize,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Events kept by a timeline unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Records the lifecycle of one machine.
#[derive(Debug, Clone)]
pub struct MachineTimeline {
    events: VecDeque<TimelineEvent>,
    capacity: usize,
    dropped: usize,
    start_time: Instant,
}

impl MachineTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a timeline keeping at most `capacity` events; 0 records nothing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            dropped: 0,
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step: usize, event_type: EventType) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(TimelineEvent {
            step,
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Changes the capacity, discarding the oldest events if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        while self.events.len() > capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.capacity = capacity;
    }

    /// Maximum number of events kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events discarded to stay within capacity.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Discards recorded events and restarts the clock.
    pub fn reset(&mut self) {
        self.events.clear();
        self.dropped = 0;
        self.start_time = Instant::now();
    }

    /// Returns the retained events, oldest first.
    pub fn events(&self) -> &VecDeque<TimelineEvent> {
        &self.events
    }

    /// Number of events of the given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns how long the machine stayed suspended on each step.
    pub fn suspensions(&self) -> BTreeMap<usize, Duration> {
        let mut suspended_at: BTreeMap<usize, Instant> = BTreeMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Suspended => {
                    suspended_at.insert(event.step, event.timestamp);
                }
                EventType::Resumed | EventType::TimedOut => {
                    if let Some(start) = suspended_at.remove(&event.step) {
                        durations.insert(event.step, event.timestamp.saturating_duration_since(start));
                    }
                }
                _ => {}
            }
        }

        durations
    }

    /// Generates an ASCII chart of suspension intervals.
    ///
    /// Steps resumed by a timeout are drawn with `~`, others with `#`.
    pub fn chart(&self) -> String {
        let mut output = String::from("\nSuspension Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        let scale = 50.0 / total_time as f64;
        let mut intervals: BTreeMap<usize, (u128, u128, bool)> = BTreeMap::new();

        for event in &self.events {
            let at = event
                .timestamp
                .saturating_duration_since(self.start_time)
                .as_millis();
            match event.event_type {
                EventType::Suspended => {
                    intervals.insert(event.step, (at, at, false));
                }
                EventType::Resumed | EventType::TimedOut => {
                    if let Some(interval) = intervals.get_mut(&event.step) {
                        interval.1 = at;
                        interval.2 = event.event_type == EventType::TimedOut;
                    }
                }
                _ => {}
            }
        }

        for (step, (start, end, timed_out)) in intervals {
            if end < start {
                continue;
            }
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            let fill = if timed_out { "~" } else { "#" };

            output.push_str(&format!(
                "step {:<6} |{}{}| ({} ms)\n",
                step,
                " ".repeat(start_pos),
                fill.repeat(width),
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for MachineTimeline {
    fn default() -> Self {
        Self::new()
    }
}
