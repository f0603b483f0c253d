//! Output shaping between a processing function's scalar results and the
//! items carried on the output queue.
//!
//! The direct adapter forwards each scalar as-is. The batching adapter
//! buffers scalars per worker and emits a `Vec` when the batch fills or
//! ages out. Buffers are worker-local, so there is no cross-worker
//! contention on the batch state.

use std::time::Duration;

use tokio::time::Instant;

pub(crate) trait OutputAdapter<O>: Send + 'static {
    /// What actually travels on the output queue.
    type Item: Send + 'static;

    /// A fresh adapter with the same configuration and an empty buffer,
    /// for handing to each worker.
    fn fresh(&self) -> Self;

    /// Accepts one scalar; returns an item when one is ready to send.
    fn push(&mut self, value: O) -> Option<Self::Item>;

    /// Takes whatever is buffered, if anything. Called on clean input
    /// drain and when the age deadline fires.
    fn take_pending(&mut self) -> Option<Self::Item>;

    /// When the buffered partial batch must be emitted, if a deadline is
    /// currently armed.
    fn deadline(&self) -> Option<Instant>;
}

/// Forwards every scalar straight to the output queue.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirectOutput;

impl<O: Send + 'static> OutputAdapter<O> for DirectOutput {
    type Item = O;

    fn fresh(&self) -> Self {
        DirectOutput
    }

    fn push(&mut self, value: O) -> Option<O> {
        Some(value)
    }

    fn take_pending(&mut self) -> Option<O> {
        None
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Accumulates scalars into size- and age-bounded batches.
#[derive(Debug)]
pub(crate) struct BatchOutput<O> {
    capacity: usize,
    max_age: Option<Duration>,
    buffer: Vec<O>,
    deadline: Option<Instant>,
}

impl<O> BatchOutput<O> {
    /// `max_age` of zero disables the age bound: a batch then only leaves
    /// the buffer when full (or on clean input drain).
    pub(crate) fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            capacity,
            max_age: max_age.filter(|age| !age.is_zero()),
            buffer: Vec::with_capacity(capacity),
            deadline: None,
        }
    }
}

impl<O: Send + 'static> OutputAdapter<O> for BatchOutput<O> {
    type Item = Vec<O>;

    fn fresh(&self) -> Self {
        BatchOutput::new(self.capacity, self.max_age)
    }

    fn push(&mut self, value: O) -> Option<Vec<O>> {
        if self.buffer.is_empty() {
            // The age clock starts at the batch's first scalar.
            self.deadline = self.max_age.map(|age| Instant::now() + age);
        }
        self.buffer.push(value);
        let aged_out = self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if self.buffer.len() >= self.capacity || aged_out {
            self.take_pending()
        } else {
            None
        }
    }

    fn take_pending(&mut self) -> Option<Vec<O>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.deadline = None;
        Some(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.capacity),
        ))
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
