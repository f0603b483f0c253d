//! Per-invocation metadata handed to processing functions and callbacks.

use std::fmt;
use std::sync::Arc;

use crate::executor::status::{ChainTrackers, StatusTracker};

/// Context passed to every invocation of a processing function.
///
/// All fields are cheap to clone; the trackers are shared references into
/// the live executor chain, so a processing function can inspect queue
/// depths and routine states of any stage while it runs.
#[derive(Clone)]
pub struct RoutineMetadata {
    /// Name of the executor running this routine
    pub executor_name: Arc<str>,
    /// Index of this routine within the executor, in `[0, concurrency)`
    pub routine_index: usize,
    /// Executor-wide index of this input pull attempt. Assigned by atomic
    /// fetch-and-add, so it totally orders pull attempts across routines
    /// but says nothing about processing order.
    pub input_index: u64,
    /// How many inputs this particular routine has pulled before this one
    pub routine_input_index: u64,
    /// Status tracker of the executor running this routine
    pub tracker: Arc<StatusTracker>,
    /// Status trackers of every executor in the chain
    pub chain: Arc<ChainTrackers>,
}

impl fmt::Debug for RoutineMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineMetadata")
            .field("executor_name", &self.executor_name)
            .field("routine_index", &self.routine_index)
            .field("input_index", &self.input_index)
            .field("routine_input_index", &self.routine_input_index)
            .finish()
    }
}
