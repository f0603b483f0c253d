//! Exit protocol: aggregating worker terminations into one executor
//! outcome.
//!
//! Every worker reports its terminal error here. The first error wins the
//! exit-error slot and tears down the upstream chain; only the last worker
//! out performs the aggregate work (upstream wait, executor-level
//! callbacks, output-queue close, passthrough cancellation). Downstream
//! consumers therefore never observe shutdown before this executor's
//! cleanup has fully completed.

use std::sync::{Arc, Mutex, OnceLock};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::executor::callbacks::{
    ExecutorCancelledEvent, ExecutorErrorEvent, ExecutorSuccessEvent, Hooks,
};
use crate::executor::status::{RoutineState, StatusTracker};

/// Waits on the upstream executor and yields its exit error, if any.
pub(crate) type UpstreamWait =
    Arc<dyn Fn() -> BoxFuture<'static, Option<Error>> + Send + Sync>;

/// One link in the chain of cancel operations walking back through all
/// upstream stages. Each executor owns one link holding its own internal
/// token; cancelling walks to the top so that no ancestor keeps producing
/// work that would die here anyway.
pub(crate) struct CancelChain {
    token: CancellationToken,
    parent: Option<Arc<CancelChain>>,
}

impl CancelChain {
    pub(crate) fn new(
        token: CancellationToken,
        parent: Option<Arc<CancelChain>>,
    ) -> Arc<Self> {
        Arc::new(Self { token, parent })
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
        let mut next = self.parent.as_deref();
        while let Some(link) = next {
            link.token.cancel();
            next = link.parent.as_deref();
        }
    }
}

/// One-shot completion slot: the coordinator stores the final error once,
/// and any number of handle clones can await it.
pub(crate) struct Completion {
    done: CancellationToken,
    result: OnceLock<Option<Error>>,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: CancellationToken::new(),
            result: OnceLock::new(),
        })
    }

    fn finish(&self, error: Option<Error>) {
        let _ = self.result.set(error);
        self.done.cancel();
    }

    pub(crate) async fn wait(&self) -> Option<Error> {
        self.done.cancelled().await;
        self.result.get().cloned().flatten()
    }
}

pub(crate) struct ExitCoordinator {
    pub(crate) executor_name: Arc<str>,
    pub(crate) tracker: Arc<StatusTracker>,
    pub(crate) hooks: Hooks,
    pub(crate) cancel_chain: Arc<CancelChain>,
    pub(crate) passthrough: CancellationToken,
    pub(crate) errored: CancellationToken,
    pub(crate) completion: Arc<Completion>,
    pub(crate) upstream_wait: Option<UpstreamWait>,
    /// Closes the output queue. Present only when this executor created
    /// the queue; borrowed queues are never closed here.
    pub(crate) close_output: Option<Box<dyn Fn() + Send + Sync>>,
    pub(crate) first_error: Mutex<Option<Error>>,
}

impl ExitCoordinator {
    /// Called by every worker as it exits, with its terminal error if any.
    /// All workers but the last return quickly; the last one runs the
    /// aggregate disposition and publishes the executor's final outcome.
    pub(crate) async fn routine_exited(&self, routine_index: usize, error: Option<Error>) {
        match &error {
            Some(err) => {
                {
                    let mut slot = self
                        .first_error
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if slot.is_none() {
                        *slot = Some(err.clone());
                    }
                }
                let state = if err.is_cancellation() {
                    RoutineState::Cancelled
                } else {
                    RoutineState::Errored
                };
                self.tracker.set_state(routine_index, state);
                // One failing routine dooms this executor and everything
                // upstream of it; the ancestors' results would die here
                // anyway.
                self.cancel_chain.cancel();
            }
            None => {
                self.tracker.set_state(routine_index, RoutineState::Finished);
            }
        }

        if self.tracker.routine_exited() != 0 {
            return;
        }

        let exit_error = self
            .first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let final_error = self.dispose(exit_error).await;

        if let Some(close) = &self.close_output {
            close();
            tracing::debug!("executor {} closed its output queue", self.executor_name);
        }

        if let Some(err) = &final_error {
            self.passthrough.cancel();
            // The errored signal distinguishes real failures from external
            // cancellation and clean completion.
            if !err.is_cancellation() {
                self.errored.cancel();
            }
        }
        self.completion.finish(final_error);
    }

    /// The aggregate disposition, run by the last worker out.
    async fn dispose(&self, exit_error: Option<Error>) -> Option<Error> {
        match exit_error {
            None => {
                // This executor finished cleanly, but upstream stages close
                // their queues even when they fail, so check them before
                // declaring success.
                let upstream_error = match &self.upstream_wait {
                    Some(wait) => wait().await,
                    None => None,
                };
                match upstream_error {
                    None => {
                        tracing::debug!(
                            "executor {} finished successfully",
                            self.executor_name
                        );
                        match &self.hooks.on_executor_success {
                            Some(hook) => hook(&ExecutorSuccessEvent {
                                executor_name: self.executor_name.clone(),
                            })
                            .err(),
                            None => None,
                        }
                    }
                    Some(err) => {
                        tracing::warn!(
                            "executor {} finished, but an upstream executor failed: {}",
                            self.executor_name,
                            err
                        );
                        self.fire_cancelled(Some(err))
                    }
                }
            }
            Some(err) if err.is_cancellation() => {
                // Adopt the upstream outcome when there is one; an external
                // cancellation has no better error to report than our own.
                let mut surfaced = Some(err);
                if let Some(wait) = &self.upstream_wait {
                    if let Some(upstream_err) = wait().await {
                        surfaced = Some(upstream_err);
                    }
                }
                tracing::warn!("executor {} cancelled", self.executor_name);
                self.fire_cancelled(surfaced)
            }
            Some(err) => {
                // A local failure outranks whatever upstream reports, but
                // upstream must still be fully torn down before callbacks
                // and queue closure run.
                if let Some(wait) = &self.upstream_wait {
                    let _ = wait().await;
                }
                tracing::warn!("executor {} failed: {}", self.executor_name, err);
                match &self.hooks.on_executor_error {
                    Some(hook) => {
                        let event = ExecutorErrorEvent {
                            executor_name: self.executor_name.clone(),
                            error: err.clone(),
                        };
                        match hook(&event) {
                            Ok(()) => Some(err),
                            Err(replacement) => Some(replacement),
                        }
                    }
                    None => Some(err),
                }
            }
        }
    }

    fn fire_cancelled(&self, surfaced: Option<Error>) -> Option<Error> {
        match &self.hooks.on_executor_cancelled {
            Some(hook) => {
                let event = ExecutorCancelledEvent {
                    executor_name: self.executor_name.clone(),
                    error: surfaced.clone(),
                };
                match hook(&event) {
                    Ok(()) => surfaced,
                    Err(replacement) => Some(replacement),
                }
            }
            None => surfaced,
        }
    }
}
