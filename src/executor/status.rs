//! Per-executor observability: routine states and live queue depths.
//!
//! Each executor owns one [`StatusTracker`]. Worker routines update their
//! own state slot; everything else is read-only and lock-free, so probes
//! are safe to call from monitoring tasks at any rate.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a single worker routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineState {
    /// Spawned but not yet polling for work
    Initializing,
    /// In the main pull-process-push loop
    Running,
    /// Exited normally (input queue closed and drained)
    Finished,
    /// Exited with a non-cancellation error
    Errored,
    /// Exited because its cancellation token fired
    Cancelled,
}

impl RoutineState {
    fn as_u8(self) -> u8 {
        match self {
            RoutineState::Initializing => 0,
            RoutineState::Running => 1,
            RoutineState::Finished => 2,
            RoutineState::Errored => 3,
            RoutineState::Cancelled => 4,
        }
    }

    fn from_u8(raw: u8) -> RoutineState {
        match raw {
            0 => RoutineState::Initializing,
            1 => RoutineState::Running,
            2 => RoutineState::Finished,
            3 => RoutineState::Errored,
            _ => RoutineState::Cancelled,
        }
    }

    /// Whether the routine has exited.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoutineState::Finished | RoutineState::Errored | RoutineState::Cancelled
        )
    }
}

type DepthProbe = Box<dyn Fn() -> usize + Send + Sync>;

/// Read-only view of one executor's routines and queues.
pub struct StatusTracker {
    executor_name: Arc<str>,
    running: AtomicUsize,
    states: Vec<AtomicU8>,
    input_depth: Option<DepthProbe>,
    output_depth: Option<DepthProbe>,
}

impl StatusTracker {
    pub(crate) fn new(
        executor_name: Arc<str>,
        concurrency: usize,
        input_depth: Option<DepthProbe>,
        output_depth: Option<DepthProbe>,
    ) -> Self {
        let states = (0..concurrency)
            .map(|_| AtomicU8::new(RoutineState::Initializing.as_u8()))
            .collect();
        Self {
            executor_name,
            running: AtomicUsize::new(concurrency),
            states,
            input_depth,
            output_depth,
        }
    }

    /// Name of the executor this tracker belongs to.
    pub fn executor_name(&self) -> &str {
        &self.executor_name
    }

    /// Number of routines that have not yet exited.
    pub fn routines_running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// State of a single routine, or `None` for an out-of-range index.
    pub fn routine_state(&self, routine_index: usize) -> Option<RoutineState> {
        self.states
            .get(routine_index)
            .map(|s| RoutineState::from_u8(s.load(Ordering::Acquire)))
    }

    /// States of all routines, indexed by routine.
    pub fn routine_states(&self) -> Vec<RoutineState> {
        self.states
            .iter()
            .map(|s| RoutineState::from_u8(s.load(Ordering::Acquire)))
            .collect()
    }

    /// Current number of values waiting in the input queue. Zero for
    /// executors without an input queue.
    pub fn input_queue_depth(&self) -> usize {
        self.input_depth.as_ref().map(|probe| probe()).unwrap_or(0)
    }

    /// Current number of values waiting in the output queue, or `None` if
    /// this executor has no output queue.
    pub fn output_queue_depth(&self) -> Option<usize> {
        self.output_depth.as_ref().map(|probe| probe())
    }

    /// Point-in-time snapshot of this tracker, suitable for serialization.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            executor_name: self.executor_name.to_string(),
            routines_running: self.routines_running(),
            routine_states: self.routine_states(),
            input_queue_depth: self.input_queue_depth(),
            output_queue_depth: self.output_queue_depth(),
        }
    }

    /// Each routine writes only its own slot; there is no cross-routine
    /// write contention here.
    pub(crate) fn set_state(&self, routine_index: usize, state: RoutineState) {
        if let Some(slot) = self.states.get(routine_index) {
            slot.store(state.as_u8(), Ordering::Release);
        }
    }

    /// Decrements the running count and returns how many routines remain.
    pub(crate) fn routine_exited(&self) -> usize {
        self.running.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("executor_name", &self.executor_name)
            .field("routines_running", &self.routines_running())
            .field("routine_states", &self.routine_states())
            .finish()
    }
}

/// Serializable snapshot of a [`StatusTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Executor name
    pub executor_name: String,
    /// Routines that have not yet exited
    pub routines_running: usize,
    /// Per-routine states, indexed by routine
    pub routine_states: Vec<RoutineState>,
    /// Values currently waiting in the input queue
    pub input_queue_depth: usize,
    /// Values currently waiting in the output queue, if there is one
    pub output_queue_depth: Option<usize>,
}

/// The status trackers of every executor in a chain, in chaining order.
///
/// Each executor carries its own copy of the list, extended by one entry,
/// so appending downstream never mutates what upstream stages observe.
pub struct ChainTrackers {
    ordered: Vec<Arc<StatusTracker>>,
    by_name: HashMap<String, Arc<StatusTracker>>,
}

impl ChainTrackers {
    pub(crate) fn single(tracker: Arc<StatusTracker>) -> Arc<Self> {
        let mut by_name = HashMap::new();
        by_name.insert(tracker.executor_name().to_string(), tracker.clone());
        Arc::new(Self {
            ordered: vec![tracker],
            by_name,
        })
    }

    /// Builds a new list containing this chain's trackers plus `tracker`.
    /// Fails if the name is already taken by an upstream executor.
    pub(crate) fn extended(&self, tracker: Arc<StatusTracker>) -> Result<Arc<Self>> {
        let name = tracker.executor_name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::Config(format!(
                "executor name '{name}' is already used by another executor in this chain"
            )));
        }
        let mut ordered = Vec::with_capacity(self.ordered.len() + 1);
        ordered.extend(self.ordered.iter().cloned());
        ordered.push(tracker.clone());
        let mut by_name = self.by_name.clone();
        by_name.insert(name, tracker);
        Ok(Arc::new(Self { ordered, by_name }))
    }

    /// Trackers in chaining order, upstream first.
    pub fn ordered(&self) -> &[Arc<StatusTracker>] {
        &self.ordered
    }

    /// Looks up a tracker by executor name.
    pub fn get(&self, executor_name: &str) -> Option<&Arc<StatusTracker>> {
        self.by_name.get(executor_name)
    }

    /// Snapshots of every tracker in the chain, in chaining order.
    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.ordered.iter().map(|t| t.snapshot()).collect()
    }
}

impl fmt::Debug for ChainTrackers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ordered.iter().map(|t| t.executor_name()))
            .finish()
    }
}
