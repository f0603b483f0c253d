//! Executor construction, chain wiring, and the terminal handle.
//!
//! An executor is one pipeline stage: a pool of identical worker routines
//! pulling from an input queue, running a user-supplied processing
//! function, and pushing into an output queue. Executors chain so that one
//! stage's output queue becomes the next stage's input queue, with
//! coordinated cancellation and cleanup across the chain.
//!
//! Construction is eager: each shape method validates the configuration,
//! spawns the worker routines, and returns an [`ExecutorHandle`]. The four
//! processing-function shapes form a closed set selected by the terminal
//! builder method; there is no runtime type inspection.

pub mod callbacks;
mod lifecycle;
pub mod metadata;
mod output;
mod routine;
pub mod status;

use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use self::callbacks::{
    EmptyInputEvent, ExecutorCancelledEvent, ExecutorErrorEvent, ExecutorSuccessEvent,
    FullOutputEvent, Hooks, RoutineCancelledEvent, RoutineErrorEvent, RoutineSuccessEvent,
};
use self::lifecycle::{CancelChain, Completion, ExitCoordinator, UpstreamWait};
use self::metadata::RoutineMetadata;
use self::output::{BatchOutput, DirectOutput, OutputAdapter};
use self::routine::{
    run_routine, DriveFn, MapFn, Processor, RoutineSettings, SinkFn, SourceFn, SuppressFn,
};
use self::status::{ChainTrackers, StatusTracker};

/// How long a routine waits for an input before firing the empty-input
/// callback, when no interval is configured.
pub const DEFAULT_EMPTY_INPUT_INTERVAL: Duration = Duration::from_secs(1);

/// How long a routine stays blocked on a full output queue before firing
/// the full-output callback, when no interval is configured.
pub const DEFAULT_FULL_OUTPUT_INTERVAL: Duration = Duration::from_secs(1);

/// Where an executor's outputs go.
///
/// An internal queue is created by the executor (capacity
/// `output_queue_size`, default `2 × concurrency`) and closed by it once
/// all routines have exited. An external queue is borrowed: the executor
/// produces into it but will never close it.
pub struct OutputQueue<T> {
    kind: OutputQueueKind<T>,
}

enum OutputQueueKind<T> {
    Internal,
    External {
        sender: async_channel::Sender<T>,
        receiver: async_channel::Receiver<T>,
    },
}

impl<T> OutputQueue<T> {
    /// A queue created and owned by the executor.
    pub fn internal() -> Self {
        Self {
            kind: OutputQueueKind::Internal,
        }
    }

    /// A caller-owned queue. Both halves are required so the executor can
    /// produce into it and probe its depth; it is never closed by the
    /// executor.
    pub fn external(sender: async_channel::Sender<T>, receiver: async_channel::Receiver<T>) -> Self {
        Self {
            kind: OutputQueueKind::External { sender, receiver },
        }
    }
}

impl<T> Default for OutputQueue<T> {
    fn default() -> Self {
        Self::internal()
    }
}

struct StoredSuppress {
    type_id: TypeId,
    type_name: &'static str,
    predicate: Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>,
}

/// Configures one executor, then starts it through a shape method.
///
/// Scalar options and callbacks accumulate on the builder; the terminal
/// method picks the processing-function shape, validates the combination,
/// spawns `concurrency` worker routines on the current Tokio runtime, and
/// returns a handle. All shape methods must therefore be called from
/// within a runtime.
///
/// # Example
///
/// ```ignore
/// let handle = ExecutorBuilder::new("square")
///     .concurrency(4)
///     .map(&token, input_rx, OutputQueue::internal(), |_token, n: u64, _meta| async move {
///         Ok(n * n)
///     })?;
/// ```
pub struct ExecutorBuilder {
    name: String,
    concurrency: usize,
    output_queue_size: Option<usize>,
    empty_input_interval: Duration,
    full_output_interval: Duration,
    process_upstream_outputs_after_upstream_error: bool,
    batch_size: Option<usize>,
    batch_max_age: Option<Duration>,
    suppress: Option<StoredSuppress>,
    hooks: Hooks,
}

impl ExecutorBuilder {
    /// Starts a builder for an executor with the given name. The name must
    /// be non-empty and unique within its chain; it appears in callbacks,
    /// status trackers, and log output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            output_queue_size: None,
            empty_input_interval: DEFAULT_EMPTY_INPUT_INTERVAL,
            full_output_interval: DEFAULT_FULL_OUTPUT_INTERVAL,
            process_upstream_outputs_after_upstream_error: false,
            batch_size: None,
            batch_max_age: None,
            suppress: None,
            hooks: Hooks::default(),
        }
    }

    /// Number of worker routines to run. Defaults to 1; zero is rejected
    /// at build time.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Capacity of an internally created output queue. Defaults to
    /// `2 × concurrency`. Ignored for external queues.
    pub fn output_queue_size(mut self, capacity: usize) -> Self {
        self.output_queue_size = Some(capacity);
        self
    }

    /// How long a routine waits for an input before firing the
    /// empty-input callback. Each routine keeps its own timer.
    pub fn empty_input_interval(mut self, interval: Duration) -> Self {
        self.empty_input_interval = interval;
        self
    }

    /// How long a routine stays blocked on a full output queue before
    /// firing the full-output callback.
    pub fn full_output_interval(mut self, interval: Duration) -> Self {
        self.full_output_interval = interval;
        self
    }

    /// When chained below another executor, keep draining and processing
    /// whatever remains in the input queue after the upstream stage fails,
    /// instead of stopping as soon as its failure becomes visible. Has no
    /// effect on a top-level executor.
    pub fn process_upstream_outputs_after_upstream_error(mut self, enabled: bool) -> Self {
        self.process_upstream_outputs_after_upstream_error = enabled;
        self
    }

    /// Number of scalars per batch, for the [`batch`](Self::batch) shape.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Longest a partial batch may wait, measured from its first scalar,
    /// before it is emitted anyway. Zero disables the age bound.
    pub fn batch_max_age(mut self, max_age: Duration) -> Self {
        self.batch_max_age = Some(max_age);
        self
    }

    /// Drops outputs matching `predicate` before they reach the output
    /// queue. Suppressed outputs still consume an output label, so gaps in
    /// the labels seen downstream are expected. The predicate's type must
    /// match the processing function's output type, which is checked at
    /// build time.
    pub fn suppress_outputs_if<O, F>(mut self, predicate: F) -> Self
    where
        O: 'static,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.suppress = Some(StoredSuppress {
            type_id: TypeId::of::<O>(),
            type_name: std::any::type_name::<O>(),
            predicate: Arc::new(move |value: &dyn Any| {
                value.downcast_ref::<O>().map(|v| predicate(v)).unwrap_or(false)
            }),
        });
        self
    }

    /// Drops outputs equal to the output type's default value. Shorthand
    /// for [`suppress_outputs_if`](Self::suppress_outputs_if) with an
    /// equality check against `O::default()`.
    pub fn ignore_default_outputs<O>(self) -> Self
    where
        O: Default + PartialEq + 'static,
    {
        self.suppress_outputs_if(|value: &O| *value == O::default())
    }

    /// Called when a routine has waited longer than the empty-input
    /// interval for a value. May fire concurrently across routines.
    pub fn on_empty_input<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EmptyInputEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_empty_input = Some(Arc::new(hook));
        self
    }

    /// Called when a routine has been blocked longer than the full-output
    /// interval pushing into the output queue. Returning `Err` aborts the
    /// routine with that error.
    pub fn on_full_output<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FullOutputEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_full_output = Some(Arc::new(hook));
        self
    }

    /// Called when a routine is about to exit because its processing
    /// function failed. Returning `Err` replaces the routine's error;
    /// returning `Ok` keeps it.
    pub fn on_routine_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RoutineErrorEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_routine_error = Some(Arc::new(hook));
        self
    }

    /// Called when a routine is about to exit normally after the input
    /// queue closed and drained.
    pub fn on_routine_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RoutineSuccessEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_routine_success = Some(Arc::new(hook));
        self
    }

    /// Called when a routine is about to exit due to cancellation.
    /// Returning `Err` replaces the cancellation error.
    pub fn on_routine_cancelled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RoutineCancelledEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_routine_cancelled = Some(Arc::new(hook));
        self
    }

    /// Called once, by the last routine to exit, when the executor
    /// terminated with an error. Returning `Err` replaces the surfaced
    /// error.
    pub fn on_executor_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutorErrorEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_executor_error = Some(Arc::new(hook));
        self
    }

    /// Called once when the executor and all upstream stages completed
    /// cleanly.
    pub fn on_executor_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutorSuccessEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_executor_success = Some(Arc::new(hook));
        self
    }

    /// Called once when the executor terminated due to cancellation or an
    /// upstream failure.
    pub fn on_executor_cancelled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutorCancelledEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_executor_cancelled = Some(Arc::new(hook));
        self
    }

    /// Starts an executor that maps each input to one output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty name, zero concurrency, a
    /// zero-capacity internally created output queue, batch options on a
    /// non-batching shape, or a suppression predicate whose type does not
    /// match `O`.
    pub fn map<I, O, F, Fut>(
        self,
        caller: &CancellationToken,
        input: async_channel::Receiver<I>,
        output: OutputQueue<O>,
        process: F,
    ) -> Result<ExecutorHandle<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.ensure_not_batching("map")?;
        let suppress = self.resolve_suppress::<O>()?;
        let process: MapFn<I, O> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self,
            BuildParts {
                caller: Some(caller.clone()),
                input: Some(input),
                upstream: None,
            },
            Some(output),
            Processor::Map(process),
            DirectOutput,
            suppress,
        )
    }

    /// Starts an executor that consumes inputs without producing outputs.
    /// The returned handle has no output queue.
    pub fn sink<I, F, Fut>(
        self,
        caller: &CancellationToken,
        input: async_channel::Receiver<I>,
        process: F,
    ) -> Result<ExecutorHandle<()>>
    where
        I: Send + 'static,
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ensure_not_batching("sink")?;
        self.ensure_no_suppression("sink")?;
        let process: SinkFn<I> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self,
            BuildParts {
                caller: Some(caller.clone()),
                input: Some(input),
                upstream: None,
            },
            None,
            Processor::<I, ()>::Sink(process),
            DirectOutput,
            None,
        )
    }

    /// Starts an executor that produces outputs with no input queue. The
    /// routines loop on the producer function until it fails or the
    /// executor is cancelled.
    pub fn source<O, F, Fut>(
        self,
        caller: &CancellationToken,
        output: OutputQueue<O>,
        produce: F,
    ) -> Result<ExecutorHandle<O>>
    where
        O: Send + 'static,
        F: Fn(CancellationToken, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.ensure_not_batching("source")?;
        let suppress = self.resolve_suppress::<O>()?;
        let produce: SourceFn<O> = Arc::new(move |token, meta| produce(token, meta).boxed());
        spawn_executor(
            self,
            BuildParts::<()> {
                caller: Some(caller.clone()),
                input: None,
                upstream: None,
            },
            Some(output),
            Processor::Source(produce),
            DirectOutput,
            suppress,
        )
    }

    /// Starts an executor with neither input nor output: the routines loop
    /// on the function until it fails or the executor is cancelled.
    pub fn drive<F, Fut>(
        self,
        caller: &CancellationToken,
        run: F,
    ) -> Result<ExecutorHandle<()>>
    where
        F: Fn(CancellationToken, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ensure_not_batching("drive")?;
        self.ensure_no_suppression("drive")?;
        let run: DriveFn = Arc::new(move |token, meta| run(token, meta).boxed());
        spawn_executor(
            self,
            BuildParts::<()> {
                caller: Some(caller.clone()),
                input: None,
                upstream: None,
            },
            None,
            Processor::<(), ()>::Drive(run),
            DirectOutput,
            None,
        )
    }

    /// Starts a mapping executor whose output queue carries batches. Each
    /// routine buffers its results and emits a `Vec` once
    /// [`batch_size`](Self::batch_size) scalars accumulate or the batch
    /// ages past [`batch_max_age`](Self::batch_max_age). A partial batch
    /// left at clean input drain is emitted before the routine exits; on
    /// error or cancellation it is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `batch_size` was not set (or is zero),
    /// in addition to the errors shared with [`map`](Self::map).
    pub fn batch<I, O, F, Fut>(
        self,
        caller: &CancellationToken,
        input: async_channel::Receiver<I>,
        output: OutputQueue<Vec<O>>,
        process: F,
    ) -> Result<ExecutorHandle<Vec<O>>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let (batch_size, batch_max_age) = self.batch_config()?;
        let suppress = self.resolve_suppress::<O>()?;
        let process: MapFn<I, O> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self,
            BuildParts {
                caller: Some(caller.clone()),
                input: Some(input),
                upstream: None,
            },
            Some(output),
            Processor::Map(process),
            BatchOutput::new(batch_size, batch_max_age),
            suppress,
        )
    }

    fn ensure_not_batching(&self, shape: &str) -> Result<()> {
        if self.batch_size.is_some() || self.batch_max_age.is_some() {
            return Err(Error::Config(format!(
                "batch options are set, but '{}' of executor '{}' is not a batching shape",
                shape, self.name
            )));
        }
        Ok(())
    }

    fn ensure_no_suppression(&self, shape: &str) -> Result<()> {
        if self.suppress.is_some() {
            return Err(Error::Config(format!(
                "a suppression predicate is set, but '{}' of executor '{}' produces no outputs",
                shape, self.name
            )));
        }
        Ok(())
    }

    fn batch_config(&self) -> Result<(usize, Option<Duration>)> {
        match self.batch_size {
            Some(batch_size) if batch_size > 0 => Ok((batch_size, self.batch_max_age)),
            Some(_) => Err(Error::Config(format!(
                "executor '{}' has a zero batch size",
                self.name
            ))),
            None => Err(Error::Config(format!(
                "executor '{}' uses the batch shape but no batch size was set",
                self.name
            ))),
        }
    }

    fn resolve_suppress<O: 'static>(&self) -> Result<Option<SuppressFn<O>>> {
        match &self.suppress {
            None => Ok(None),
            Some(stored) if stored.type_id == TypeId::of::<O>() => {
                let predicate = stored.predicate.clone();
                Ok(Some(Arc::new(move |value: &O| predicate(value))))
            }
            Some(stored) => Err(Error::Config(format!(
                "suppression predicate of executor '{}' expects {} but the processing function outputs {}",
                self.name,
                stored.type_name,
                std::any::type_name::<O>()
            ))),
        }
    }
}

/// A builder stage for an executor chained below an existing one, created
/// by [`ExecutorHandle::then`]. The upstream's output queue becomes the
/// new executor's input queue, and the upstream's post-cleanup
/// cancellation governs it in place of a caller token.
pub struct ChainedBuilder<I> {
    builder: ExecutorBuilder,
    input: async_channel::Receiver<I>,
    upstream: UpstreamParts,
}

impl<I> std::fmt::Debug for ChainedBuilder<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedBuilder")
            .field("name", &self.builder.name)
            .finish()
    }
}

impl<I: Send + 'static> ChainedBuilder<I> {
    /// Chained form of [`ExecutorBuilder::map`].
    pub fn map<O, F, Fut>(self, output: OutputQueue<O>, process: F) -> Result<ExecutorHandle<O>>
    where
        O: Send + 'static,
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.builder.ensure_not_batching("map")?;
        let suppress = self.builder.resolve_suppress::<O>()?;
        let process: MapFn<I, O> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self.builder,
            BuildParts {
                caller: None,
                input: Some(self.input),
                upstream: Some(self.upstream),
            },
            Some(output),
            Processor::Map(process),
            DirectOutput,
            suppress,
        )
    }

    /// Chained form of [`ExecutorBuilder::sink`].
    pub fn sink<F, Fut>(self, process: F) -> Result<ExecutorHandle<()>>
    where
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.builder.ensure_not_batching("sink")?;
        self.builder.ensure_no_suppression("sink")?;
        let process: SinkFn<I> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self.builder,
            BuildParts {
                caller: None,
                input: Some(self.input),
                upstream: Some(self.upstream),
            },
            None,
            Processor::<I, ()>::Sink(process),
            DirectOutput,
            None,
        )
    }

    /// Chained form of [`ExecutorBuilder::batch`].
    pub fn batch<O, F, Fut>(
        self,
        output: OutputQueue<Vec<O>>,
        process: F,
    ) -> Result<ExecutorHandle<Vec<O>>>
    where
        O: Send + 'static,
        F: Fn(CancellationToken, I, RoutineMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let (batch_size, batch_max_age) = self.builder.batch_config()?;
        let suppress = self.builder.resolve_suppress::<O>()?;
        let process: MapFn<I, O> =
            Arc::new(move |token, input, meta| process(token, input, meta).boxed());
        spawn_executor(
            self.builder,
            BuildParts {
                caller: None,
                input: Some(self.input),
                upstream: Some(self.upstream),
            },
            Some(output),
            Processor::Map(process),
            BatchOutput::new(batch_size, batch_max_age),
            suppress,
        )
    }
}

/// Pieces of an upstream handle needed to wire a downstream executor,
/// independent of the upstream's output type.
pub(crate) struct UpstreamParts {
    passthrough: CancellationToken,
    wait: UpstreamWait,
    cancel_chain: Arc<CancelChain>,
    trackers: Arc<ChainTrackers>,
}

struct BuildParts<I> {
    caller: Option<CancellationToken>,
    input: Option<async_channel::Receiver<I>>,
    upstream: Option<UpstreamParts>,
}

/// Handle to a running executor.
///
/// Handles are cheap to clone; every clone observes the same executor.
/// The handle of the last stage of a chain is its terminal handle:
/// [`wait`](Self::wait) on it transitively waits for every stage.
pub struct ExecutorHandle<T> {
    inner: Arc<HandleInner<T>>,
}

struct HandleInner<T> {
    name: Arc<str>,
    output: Option<async_channel::Receiver<T>>,
    passthrough: CancellationToken,
    errored: CancellationToken,
    tracker: Arc<StatusTracker>,
    chain: Arc<ChainTrackers>,
    completion: Arc<Completion>,
    cancel_chain: Arc<CancelChain>,
}

impl<T> Clone for ExecutorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ExecutorHandle<T> {
    /// Name of this executor.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The output queue, or `None` for shapes that produce no outputs.
    /// For an external queue this is the receiver that was supplied at
    /// construction.
    pub fn output(&self) -> Option<&async_channel::Receiver<T>> {
        self.inner.output.as_ref()
    }

    /// Blocks until every routine of this executor has exited and all
    /// cleanup and executor-level callbacks have run, then returns the
    /// executor's final error, if any. Upstream stages are awaited
    /// transitively, so waiting on a chain's terminal handle observes the
    /// whole chain.
    ///
    /// After `wait` returns, the token from
    /// [`cancellation_token`](Self::cancellation_token) is cancelled
    /// unconditionally.
    ///
    /// # Errors
    ///
    /// The first error recorded by any routine of this executor, an error
    /// adopted from an upstream stage, or a replacement supplied by an
    /// executor-level callback.
    pub async fn wait(&self) -> Result<()> {
        let result = self.inner.completion.wait().await;
        self.inner.passthrough.cancel();
        match result {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Token observed by downstream consumers of this executor. It is
    /// cancelled only after all routines have exited and cleanup has
    /// completed (on failure), or once [`wait`](Self::wait) returns, so
    /// consumers never react to a failure before this executor's
    /// callbacks have run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.passthrough.clone()
    }

    /// One-shot signal released only if this executor terminated with a
    /// real error: the returned token is cancelled in that case, and never
    /// on clean completion or plain external cancellation.
    pub fn errored(&self) -> CancellationToken {
        self.inner.errored.clone()
    }

    /// Status tracker of this executor.
    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.inner.tracker
    }

    /// Status trackers of every executor in this chain, in chaining order.
    pub fn trackers(&self) -> &Arc<ChainTrackers> {
        &self.inner.chain
    }
}

impl<T: Send + 'static> ExecutorHandle<T> {
    /// Chains a new executor below this one: the new stage consumes this
    /// executor's output queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if this executor has no output queue.
    pub fn then(&self, builder: ExecutorBuilder) -> Result<ChainedBuilder<T>> {
        let Some(output) = self.inner.output.as_ref() else {
            return Err(Error::Config(format!(
                "executor '{}' has no output queue to chain from",
                self.inner.name
            )));
        };
        Ok(ChainedBuilder {
            builder,
            input: output.clone(),
            upstream: self.upstream_parts(),
        })
    }

    fn upstream_parts(&self) -> UpstreamParts {
        let handle = self.clone();
        UpstreamParts {
            passthrough: self.inner.passthrough.clone(),
            wait: Arc::new(move || {
                let handle = handle.clone();
                async move { handle.wait().await.err() }.boxed()
            }),
            cancel_chain: self.inner.cancel_chain.clone(),
            trackers: self.inner.chain.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ExecutorHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("name", &self.inner.name)
            .field("tracker", &self.inner.tracker)
            .finish()
    }
}

fn spawn_executor<I, O, A>(
    builder: ExecutorBuilder,
    parts: BuildParts<I>,
    output: Option<OutputQueue<A::Item>>,
    processor: Processor<I, O>,
    adapter: A,
    suppress: Option<SuppressFn<O>>,
) -> Result<ExecutorHandle<A::Item>>
where
    I: Send + 'static,
    O: Send + 'static,
    A: OutputAdapter<O>,
{
    if builder.name.is_empty() {
        return Err(Error::Config("executor name must not be empty".to_string()));
    }
    if builder.concurrency == 0 {
        return Err(Error::Config(format!(
            "executor '{}' must run at least one routine",
            builder.name
        )));
    }

    let name: Arc<str> = Arc::from(builder.name.as_str());
    let concurrency = builder.concurrency;

    // The internal token governs whether routines keep running. A chained
    // executor inherits from the upstream passthrough token so that an
    // upstream failure stops it only after the upstream has cleaned up;
    // with process_upstream_outputs_after_upstream_error the inheritance
    // is severed entirely and the stage stops when its input drains.
    let internal = match (&parts.upstream, builder.process_upstream_outputs_after_upstream_error) {
        (Some(_), true) => CancellationToken::new(),
        (Some(upstream), false) => upstream.passthrough.child_token(),
        (None, _) => match &parts.caller {
            Some(caller) => caller.child_token(),
            None => CancellationToken::new(),
        },
    };
    // The passthrough token is what downstream consumers observe. It is
    // cancelled explicitly after cleanup, never implicitly by the caller.
    let passthrough = CancellationToken::new();
    let errored = CancellationToken::new();

    let (output_sender, output_receiver, owns_output) = match output {
        None => (None, None, false),
        Some(queue) => match queue.kind {
            OutputQueueKind::Internal => {
                // The size option only governs a queue this executor
                // creates; it is ignored for external and absent queues.
                if builder.output_queue_size == Some(0) {
                    return Err(Error::Config(format!(
                        "executor '{}' has a zero-capacity output queue",
                        name
                    )));
                }
                let capacity = builder
                    .output_queue_size
                    .unwrap_or(2 * concurrency);
                let (sender, receiver) = async_channel::bounded(capacity);
                (Some(sender), Some(receiver), true)
            }
            OutputQueueKind::External { sender, receiver } => {
                (Some(sender), Some(receiver), false)
            }
        },
    };

    let input_probe = parts.input.clone().map(|queue| {
        Box::new(move || queue.len()) as Box<dyn Fn() -> usize + Send + Sync>
    });
    let output_probe = output_receiver.clone().map(|queue| {
        Box::new(move || queue.len()) as Box<dyn Fn() -> usize + Send + Sync>
    });
    let tracker = Arc::new(StatusTracker::new(
        name.clone(),
        concurrency,
        input_probe,
        output_probe,
    ));

    let chain = match &parts.upstream {
        Some(upstream) => upstream.trackers.extended(tracker.clone())?,
        None => ChainTrackers::single(tracker.clone()),
    };

    let cancel_chain = CancelChain::new(
        internal.clone(),
        parts.upstream.as_ref().map(|up| up.cancel_chain.clone()),
    );

    let close_output: Option<Box<dyn Fn() + Send + Sync>> = if owns_output {
        output_sender.clone().map(|sender| {
            Box::new(move || {
                sender.close();
            }) as Box<dyn Fn() + Send + Sync>
        })
    } else {
        None
    };

    let exit = Arc::new(ExitCoordinator {
        executor_name: name.clone(),
        tracker: tracker.clone(),
        hooks: builder.hooks.clone(),
        cancel_chain: cancel_chain.clone(),
        passthrough: passthrough.clone(),
        errored: errored.clone(),
        completion: Completion::new(),
        upstream_wait: parts.upstream.as_ref().map(|up| up.wait.clone()),
        close_output,
        first_error: Mutex::new(None),
    });

    let settings = Arc::new(RoutineSettings {
        executor_name: name.clone(),
        processor,
        input: parts.input,
        output: output_sender,
        internal,
        hooks: builder.hooks,
        suppress,
        input_counter: AtomicU64::new(0),
        output_counter: AtomicU64::new(0),
        empty_input_interval: builder.empty_input_interval,
        full_output_interval: builder.full_output_interval,
        tracker: tracker.clone(),
        chain: chain.clone(),
        exit: exit.clone(),
    });

    tracing::debug!(
        "executor {} starting {} routine(s)",
        name,
        concurrency
    );
    for routine_index in 0..concurrency {
        let routine_adapter = adapter.fresh();
        tokio::spawn(run_routine(settings.clone(), routine_index, routine_adapter));
    }

    Ok(ExecutorHandle {
        inner: Arc::new(HandleInner {
            name,
            output: output_receiver,
            passthrough,
            errored,
            tracker,
            chain,
            completion: exit.completion.clone(),
            cancel_chain,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue<T>(capacity: usize) -> (async_channel::Sender<T>, async_channel::Receiver<T>) {
        async_channel::bounded(capacity)
    }

    async fn identity_map(
        builder: ExecutorBuilder,
        input: async_channel::Receiver<u32>,
    ) -> Result<ExecutorHandle<u32>> {
        builder.map(
            &CancellationToken::new(),
            input,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move { Ok(value) },
        )
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = identity_map(ExecutorBuilder::new(""), rx).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = identity_map(ExecutorBuilder::new("stage").concurrency(0), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn zero_output_queue_size_is_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = identity_map(ExecutorBuilder::new("stage").output_queue_size(0), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn zero_output_queue_size_is_ignored_for_external_queues() {
        let (tx, rx) = queue::<u32>(1);
        tx.send(7).await.unwrap();
        drop(tx);
        let (out_tx, out_rx) = queue::<u32>(4);
        let handle = ExecutorBuilder::new("stage")
            .output_queue_size(0)
            .map(
                &CancellationToken::new(),
                rx,
                OutputQueue::external(out_tx.clone(), out_rx.clone()),
                |_token, value: u32, _meta| async move { Ok(value) },
            )
            .unwrap();
        handle.wait().await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), 7);
        assert!(
            !out_rx.is_closed(),
            "a borrowed output queue is never closed by the executor"
        );
    }

    #[tokio::test]
    async fn zero_output_queue_size_is_ignored_without_an_output_queue() {
        let (tx, rx) = queue::<u32>(1);
        tx.send(7).await.unwrap();
        drop(tx);
        let handle = ExecutorBuilder::new("stage")
            .output_queue_size(0)
            .sink(
                &CancellationToken::new(),
                rx,
                |_token, _value: u32, _meta| async move { Ok(()) },
            )
            .unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn batch_options_on_map_are_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = identity_map(ExecutorBuilder::new("stage").batch_size(10), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn batch_shape_requires_batch_size() {
        let (_tx, rx) = queue::<u32>(1);
        let err = ExecutorBuilder::new("stage")
            .batch(
                &CancellationToken::new(),
                rx,
                OutputQueue::internal(),
                |_token, value: u32, _meta| async move { Ok(value) },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn suppression_type_mismatch_is_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = identity_map(
            ExecutorBuilder::new("stage").suppress_outputs_if(|value: &String| value.is_empty()),
            rx,
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("String") && message.contains("u32"),
            "error should name both types: {message}"
        );
    }

    #[tokio::test]
    async fn suppression_on_sink_is_rejected() {
        let (_tx, rx) = queue::<u32>(1);
        let err = ExecutorBuilder::new("stage")
            .ignore_default_outputs::<u32>()
            .sink(
                &CancellationToken::new(),
                rx,
                |_token, _value: u32, _meta| async move { Ok(()) },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn chaining_from_a_sink_is_rejected() {
        let (tx, rx) = queue::<u32>(4);
        let sink = ExecutorBuilder::new("sink")
            .sink(
                &CancellationToken::new(),
                rx,
                |_token, _value: u32, _meta| async move { Ok(()) },
            )
            .unwrap();
        let err = sink.then(ExecutorBuilder::new("after")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        drop(tx);
        sink.wait().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_chain_names_are_rejected() {
        let (tx, rx) = queue::<u32>(4);
        let first = identity_map(ExecutorBuilder::new("stage"), rx).await.unwrap();
        let err = first
            .then(ExecutorBuilder::new("stage"))
            .unwrap()
            .sink(|_token, _value: u32, _meta| async move { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        drop(tx);
        first.wait().await.unwrap();
    }
}
