//! The per-worker pull-process-push loop.
//!
//! Every executor runs `concurrency` copies of this loop. Each iteration
//! claims an executor-wide input index, acquires an input (unless the
//! variant has none), invokes the processing function, and pushes the
//! result through the output adapter. Exits funnel into the executor's
//! exit coordinator.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::executor::callbacks::{
    EmptyInputEvent, FullOutputEvent, Hooks, RoutineCancelledEvent, RoutineErrorEvent,
    RoutineSuccessEvent,
};
use crate::executor::lifecycle::ExitCoordinator;
use crate::executor::metadata::RoutineMetadata;
use crate::executor::output::OutputAdapter;
use crate::executor::status::{ChainTrackers, RoutineState, StatusTracker};

pub(crate) type MapFn<I, O> = Arc<
    dyn Fn(CancellationToken, I, RoutineMetadata) -> BoxFuture<'static, Result<O>>
        + Send
        + Sync,
>;
pub(crate) type SinkFn<I> = Arc<
    dyn Fn(CancellationToken, I, RoutineMetadata) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;
pub(crate) type SourceFn<O> =
    Arc<dyn Fn(CancellationToken, RoutineMetadata) -> BoxFuture<'static, Result<O>> + Send + Sync>;
pub(crate) type DriveFn =
    Arc<dyn Fn(CancellationToken, RoutineMetadata) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub(crate) type SuppressFn<O> = Arc<dyn Fn(&O) -> bool + Send + Sync>;

/// The four processing-function shapes, selected at construction. A closed
/// set: the worker loop dispatches on it exhaustively, and each shape's
/// queue requirements are validated before any routine starts.
pub(crate) enum Processor<I, O> {
    /// Consumes inputs, produces outputs
    Map(MapFn<I, O>),
    /// Consumes inputs, produces nothing
    Sink(SinkFn<I>),
    /// Produces outputs with no input queue
    Source(SourceFn<O>),
    /// Neither consumes nor produces; runs until error or cancellation
    Drive(DriveFn),
}

impl<I, O> Clone for Processor<I, O> {
    fn clone(&self) -> Self {
        match self {
            Processor::Map(f) => Processor::Map(f.clone()),
            Processor::Sink(f) => Processor::Sink(f.clone()),
            Processor::Source(f) => Processor::Source(f.clone()),
            Processor::Drive(f) => Processor::Drive(f.clone()),
        }
    }
}

/// State shared by all routines of one executor.
pub(crate) struct RoutineSettings<I, O, Item> {
    pub(crate) executor_name: Arc<str>,
    pub(crate) processor: Processor<I, O>,
    pub(crate) input: Option<async_channel::Receiver<I>>,
    pub(crate) output: Option<async_channel::Sender<Item>>,
    pub(crate) internal: CancellationToken,
    pub(crate) hooks: Hooks,
    pub(crate) suppress: Option<SuppressFn<O>>,
    pub(crate) input_counter: AtomicU64,
    pub(crate) output_counter: AtomicU64,
    pub(crate) empty_input_interval: Duration,
    pub(crate) full_output_interval: Duration,
    pub(crate) tracker: Arc<StatusTracker>,
    pub(crate) chain: Arc<ChainTrackers>,
    pub(crate) exit: Arc<ExitCoordinator>,
}

/// Entry point for one spawned routine: runs the loop, then reports the
/// terminal outcome to the exit coordinator.
pub(crate) async fn run_routine<I, O, A>(
    settings: Arc<RoutineSettings<I, O, A::Item>>,
    routine_index: usize,
    mut adapter: A,
) where
    I: Send + 'static,
    O: Send + 'static,
    A: OutputAdapter<O>,
{
    settings
        .tracker
        .set_state(routine_index, RoutineState::Running);
    tracing::debug!(
        "routine {} of executor {} started",
        routine_index,
        settings.executor_name
    );

    let mut worker = Worker {
        settings: settings.clone(),
        routine_index,
        routine_inputs: 0,
        last_input: Instant::now(),
        last_output_index: 0,
    };
    let result = worker.run(&mut adapter).await;
    match &result {
        Ok(()) => tracing::debug!(
            "routine {} of executor {} finished",
            routine_index,
            settings.executor_name
        ),
        Err(err) => tracing::debug!(
            "routine {} of executor {} exited: {}",
            routine_index,
            settings.executor_name,
            err
        ),
    }
    settings
        .exit
        .routine_exited(routine_index, result.err())
        .await;
}

enum Acquired<I> {
    Value(I),
    /// Input queue closed with nothing left in it
    Drained,
    Cancelled,
}

struct Worker<I, O, Item> {
    settings: Arc<RoutineSettings<I, O, Item>>,
    routine_index: usize,
    routine_inputs: u64,
    last_input: Instant,
    last_output_index: u64,
}

impl<I, O, Item> Worker<I, O, Item>
where
    I: Send + 'static,
    O: Send + 'static,
    Item: Send + 'static,
{
    async fn run<A>(&mut self, adapter: &mut A) -> Result<()>
    where
        A: OutputAdapter<O, Item = Item>,
    {
        let processor = self.settings.processor.clone();
        loop {
            let input_index = self.settings.input_counter.fetch_add(1, Ordering::Relaxed);
            let meta = self.metadata(input_index);

            match &processor {
                Processor::Map(process) => {
                    let input = match self.acquire_input(adapter, &meta).await? {
                        Acquired::Value(input) => input,
                        Acquired::Drained => return self.drain_exit(adapter, meta).await,
                        Acquired::Cancelled => return Err(self.cancel_exit(meta)),
                    };
                    self.routine_inputs += 1;
                    self.last_input = Instant::now();
                    let future = process(self.settings.internal.clone(), input, meta.clone());
                    let output = self.invoke(adapter, future, &meta).await?;
                    self.emit(adapter, output, &meta).await?;
                }
                Processor::Sink(process) => {
                    let input = match self.acquire_input(adapter, &meta).await? {
                        Acquired::Value(input) => input,
                        Acquired::Drained => return self.drain_exit(adapter, meta).await,
                        Acquired::Cancelled => return Err(self.cancel_exit(meta)),
                    };
                    self.routine_inputs += 1;
                    self.last_input = Instant::now();
                    let future = process(self.settings.internal.clone(), input, meta.clone());
                    self.invoke(adapter, future, &meta).await?;
                }
                Processor::Source(produce) => {
                    if self.settings.internal.is_cancelled() {
                        return Err(self.cancel_exit(meta));
                    }
                    let future = produce(self.settings.internal.clone(), meta.clone());
                    let output = self.invoke(adapter, future, &meta).await?;
                    self.emit(adapter, output, &meta).await?;
                }
                Processor::Drive(run) => {
                    if self.settings.internal.is_cancelled() {
                        return Err(self.cancel_exit(meta));
                    }
                    let future = run(self.settings.internal.clone(), meta.clone());
                    self.invoke(adapter, future, &meta).await?;
                }
            }
        }
    }

    fn metadata(&self, input_index: u64) -> RoutineMetadata {
        RoutineMetadata {
            executor_name: self.settings.executor_name.clone(),
            routine_index: self.routine_index,
            input_index,
            routine_input_index: self.routine_inputs,
            tracker: self.settings.tracker.clone(),
            chain: self.settings.chain.clone(),
        }
    }

    /// Waits for one input. While waiting, fires the empty-input callback
    /// on its interval and flushes an aged-out partial batch if the
    /// adapter has one pending.
    async fn acquire_input<A>(
        &self,
        adapter: &mut A,
        meta: &RoutineMetadata,
    ) -> Result<Acquired<I>>
    where
        A: OutputAdapter<O, Item = Item>,
    {
        let Some(input) = self.settings.input.as_ref() else {
            return Ok(Acquired::Drained);
        };
        let idle_enabled = self.settings.hooks.on_empty_input.is_some();

        let recv = input.recv();
        tokio::pin!(recv);
        let idle_timer = tokio::time::sleep(self.settings.empty_input_interval);
        tokio::pin!(idle_timer);

        loop {
            let flush_at = adapter.deadline();
            tokio::select! {
                biased;
                _ = self.settings.internal.cancelled() => {
                    // Once the queue is both closed and empty this is a
                    // normal drain, not a cancellation. A still-visible
                    // input is left in the queue rather than consumed and
                    // dropped.
                    return Ok(if input.is_closed() && input.is_empty() {
                        Acquired::Drained
                    } else {
                        Acquired::Cancelled
                    });
                }
                received = &mut recv => {
                    return Ok(match received {
                        Ok(value) => Acquired::Value(value),
                        Err(_) => Acquired::Drained,
                    });
                }
                () = &mut idle_timer, if idle_enabled => {
                    if let Some(hook) = &self.settings.hooks.on_empty_input {
                        hook(&EmptyInputEvent {
                            metadata: meta.clone(),
                            idle_for: self.last_input.elapsed(),
                        })?;
                    }
                    idle_timer
                        .as_mut()
                        .reset(Instant::now() + self.settings.empty_input_interval);
                }
                () = deadline_sleep(flush_at), if flush_at.is_some() => {
                    if let Some(pending) = adapter.take_pending() {
                        self.send_output(pending, self.last_output_index, meta).await?;
                    }
                }
            }
        }
    }

    /// Drives the processing future to completion, converting panics to
    /// errors and applying the routine-error callback. An aged-out partial
    /// batch is flushed even while the future is still pending.
    async fn invoke<A, T>(
        &self,
        adapter: &mut A,
        future: BoxFuture<'static, Result<T>>,
        meta: &RoutineMetadata,
    ) -> Result<T>
    where
        A: OutputAdapter<O, Item = Item>,
    {
        let mut future = future;
        let outcome = loop {
            let flush_at = adapter.deadline();
            tokio::select! {
                biased;
                outcome = std::panic::AssertUnwindSafe(&mut future).catch_unwind() => {
                    break outcome;
                }
                () = deadline_sleep(flush_at), if flush_at.is_some() => {
                    if let Some(pending) = adapter.take_pending() {
                        self.send_output(pending, self.last_output_index, meta).await?;
                    }
                }
            }
        };

        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(payload) => Error::Panic(panic_message(payload.as_ref())),
        };

        // A cancellation observed here outranks the processing error; the
        // routine exits through the cancellation path.
        if self.settings.internal.is_cancelled() {
            return Err(self.cancel_exit(meta.clone()));
        }

        tracing::warn!(
            "routine {} of executor {} processing error on input {}: {}",
            self.routine_index,
            self.settings.executor_name,
            meta.input_index,
            error
        );
        if let Some(hook) = &self.settings.hooks.on_routine_error {
            let event = RoutineErrorEvent {
                metadata: meta.clone(),
                error: error.clone(),
            };
            if let Err(replacement) = hook(&event) {
                return Err(replacement);
            }
        }
        Err(error)
    }

    /// Labels the output, applies suppression, and pushes through the
    /// adapter. Suppressed outputs still consume a label.
    async fn emit<A>(&mut self, adapter: &mut A, value: O, meta: &RoutineMetadata) -> Result<()>
    where
        A: OutputAdapter<O, Item = Item>,
    {
        let output_index = self.settings.output_counter.fetch_add(1, Ordering::Relaxed);
        self.last_output_index = output_index;
        if let Some(suppress) = &self.settings.suppress {
            if suppress(&value) {
                tracing::trace!(
                    "executor {} suppressed output {}",
                    self.settings.executor_name,
                    output_index
                );
                return Ok(());
            }
        }
        if let Some(item) = adapter.push(value) {
            self.send_output(item, output_index, meta).await?;
        }
        Ok(())
    }

    /// Sends one item into the output queue, firing the full-output
    /// callback on its interval while blocked. Cancellation aborts the
    /// send.
    async fn send_output(
        &self,
        item: Item,
        output_index: u64,
        meta: &RoutineMetadata,
    ) -> Result<()> {
        let Some(output) = self.settings.output.as_ref() else {
            return Ok(());
        };
        let full_enabled = self.settings.hooks.on_full_output.is_some();
        let blocked_since = Instant::now();

        let send = output.send(item);
        tokio::pin!(send);
        let full_timer = tokio::time::sleep(self.settings.full_output_interval);
        tokio::pin!(full_timer);

        loop {
            tokio::select! {
                biased;
                _ = self.settings.internal.cancelled() => {
                    return Err(self.cancel_exit(meta.clone()));
                }
                sent = &mut send => {
                    return sent.map_err(|_| Error::OutputClosed);
                }
                () = &mut full_timer, if full_enabled => {
                    if let Some(hook) = &self.settings.hooks.on_full_output {
                        hook(&FullOutputEvent {
                            metadata: meta.clone(),
                            output_index,
                            blocked_for: blocked_since.elapsed(),
                        })?;
                    }
                    full_timer
                        .as_mut()
                        .reset(Instant::now() + self.settings.full_output_interval);
                }
            }
        }
    }

    /// Normal exit: the input queue closed and drained. Any partial batch
    /// goes out before the success callback runs.
    async fn drain_exit<A>(&mut self, adapter: &mut A, meta: RoutineMetadata) -> Result<()>
    where
        A: OutputAdapter<O, Item = Item>,
    {
        if let Some(pending) = adapter.take_pending() {
            self.send_output(pending, self.last_output_index, &meta)
                .await?;
        }
        if let Some(hook) = &self.settings.hooks.on_routine_success {
            hook(&RoutineSuccessEvent { metadata: meta })?;
        }
        Ok(())
    }

    /// Cancellation exit. The callback may replace the cancellation error;
    /// returning `Ok` keeps it.
    fn cancel_exit(&self, meta: RoutineMetadata) -> Error {
        let error = Error::Cancelled;
        if let Some(hook) = &self.settings.hooks.on_routine_cancelled {
            let event = RoutineCancelledEvent {
                metadata: meta,
                error: error.clone(),
            };
            if let Err(replacement) = hook(&event) {
                return replacement;
            }
        }
        error
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_stringified() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_message(boxed.as_ref()), "kaput");
        let boxed: Box<dyn Any + Send> = Box::new(17_u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
