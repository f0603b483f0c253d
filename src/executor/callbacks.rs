//! Callback surface for executor observability.
//!
//! Callbacks are plain synchronous functions. Routine-level callbacks fire
//! on the worker that triggered them and may fire concurrently across
//! workers; executor-level callbacks fire exactly once, on the last worker
//! to exit. Returning `Err` from a routine-level callback aborts that
//! routine with the returned error; returning `Err` from an executor-level
//! callback replaces the error the executor surfaces from `wait()`.
//! Returning `Ok(())` always preserves the original outcome.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::metadata::RoutineMetadata;

/// Callback signature shared by all hooks.
pub type Hook<E> = Arc<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Fired when a routine has waited longer than the configured interval for
/// an input to arrive. The wait then restarts; each routine keeps its own
/// timer.
#[derive(Debug, Clone)]
pub struct EmptyInputEvent {
    /// Metadata of the waiting routine
    pub metadata: RoutineMetadata,
    /// How long the routine has been without an input
    pub idle_for: Duration,
}

/// Fired when a routine has been blocked longer than the configured
/// interval trying to push an output into a full queue.
#[derive(Debug, Clone)]
pub struct FullOutputEvent {
    /// Metadata of the blocked routine
    pub metadata: RoutineMetadata,
    /// Label of the output the routine is trying to push
    pub output_index: u64,
    /// How long the send has been blocked so far
    pub blocked_for: Duration,
}

/// Fired when a routine is about to exit because its processing function
/// failed.
#[derive(Debug, Clone)]
pub struct RoutineErrorEvent {
    /// Metadata of the failing routine
    pub metadata: RoutineMetadata,
    /// The processing error
    pub error: Error,
}

/// Fired when a routine is about to exit normally, after its input queue
/// closed and drained.
#[derive(Debug, Clone)]
pub struct RoutineSuccessEvent {
    /// Metadata of the exiting routine
    pub metadata: RoutineMetadata,
}

/// Fired when a routine is about to exit because its cancellation token
/// fired.
#[derive(Debug, Clone)]
pub struct RoutineCancelledEvent {
    /// Metadata of the cancelled routine
    pub metadata: RoutineMetadata,
    /// The cancellation error the routine will exit with
    pub error: Error,
}

/// Fired once when all routines have exited and at least one failed.
#[derive(Debug, Clone)]
pub struct ExecutorErrorEvent {
    /// Name of the executor
    pub executor_name: Arc<str>,
    /// The error the executor will surface
    pub error: Error,
}

/// Fired once when all routines have exited without error and every
/// upstream stage also completed cleanly.
#[derive(Debug, Clone)]
pub struct ExecutorSuccessEvent {
    /// Name of the executor
    pub executor_name: Arc<str>,
}

/// Fired once when the executor terminated due to cancellation, or
/// completed its own work only to see an upstream stage fail.
#[derive(Debug, Clone)]
pub struct ExecutorCancelledEvent {
    /// Name of the executor
    pub executor_name: Arc<str>,
    /// The adopted error, when the cancellation traces back to one
    pub error: Option<Error>,
}

/// The optional callbacks configured on one executor.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub on_empty_input: Option<Hook<EmptyInputEvent>>,
    pub on_full_output: Option<Hook<FullOutputEvent>>,
    pub on_routine_error: Option<Hook<RoutineErrorEvent>>,
    pub on_routine_success: Option<Hook<RoutineSuccessEvent>>,
    pub on_routine_cancelled: Option<Hook<RoutineCancelledEvent>>,
    pub on_executor_error: Option<Hook<ExecutorErrorEvent>>,
    pub on_executor_success: Option<Hook<ExecutorSuccessEvent>>,
    pub on_executor_cancelled: Option<Hook<ExecutorCancelledEvent>>,
}
