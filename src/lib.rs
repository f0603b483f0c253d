//! pipeflow - Concurrent pipeline executor
//!
//! This crate provides a reusable primitive for building multi-stage
//! data-processing pipelines. Each stage (an *executor*) runs a
//! user-supplied processing function across a configurable number of
//! worker routines, consuming from a bounded input queue and producing
//! into a bounded output queue. Executors chain so the output of one
//! stage feeds the input of the next, with coordinated lifecycle, failure
//! propagation, and cleanup across the chain.
//!
//! # Architecture
//!
//! ```text
//! caller token
//!      │
//! ┌────▼─────┐   queue   ┌──────────┐   queue   ┌──────────┐
//! │ executor ├──────────►│ executor ├──────────►│ executor ├──► consumer
//! │ (N workers)          │ (N workers)          │ (N workers)
//! └──────────┘           └──────────┘           └──────────┘
//!      ◄──────── upstream-cancel chain ────────┘
//! ```
//!
//! - Data flows forward through the queues.
//! - A failing stage cancels every stage upstream of it (their results
//!   would die at the failure point anyway) and closes its output queue
//!   so downstream stages drain and stop.
//! - Each stage exposes a *passthrough* cancellation token that fires
//!   only after all of its workers have exited and its callbacks have
//!   run, so consumers never tear themselves down while a stage is still
//!   cleaning up.
//!
//! # Example
//!
//! ```no_run
//! use pipeflow::{ExecutorBuilder, OutputQueue};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pipeflow::Result<()> {
//!     let token = CancellationToken::new();
//!     let (tx, rx) = async_channel::bounded(64);
//!
//!     let squares = ExecutorBuilder::new("square")
//!         .concurrency(4)
//!         .map(&token, rx, OutputQueue::internal(), |_token, n: u64, _meta| async move {
//!             Ok(n * n)
//!         })?;
//!     let printer = squares
//!         .then(ExecutorBuilder::new("print"))?
//!         .sink(|_token, n: u64, _meta| async move {
//!             println!("{n}");
//!             Ok(())
//!         })?;
//!
//!     for n in 0..1000 {
//!         tx.send(n).await.expect("input queue closed");
//!     }
//!     drop(tx);
//!
//!     printer.wait().await
//! }
//! ```
//!
//! # Shapes
//!
//! The processing function comes in four shapes, selected by the terminal
//! builder method: [`map`](ExecutorBuilder::map) (input and output),
//! [`sink`](ExecutorBuilder::sink) (input only),
//! [`source`](ExecutorBuilder::source) (output only),
//! [`drive`](ExecutorBuilder::drive) (neither), plus
//! [`batch`](ExecutorBuilder::batch), a mapping stage whose output queue
//! carries size- and age-bounded `Vec` batches.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod executor;

pub use error::{Error, Result};
pub use executor::callbacks;
pub use executor::metadata::RoutineMetadata;
pub use executor::status::{ChainTrackers, RoutineState, StatusSnapshot, StatusTracker};
pub use executor::{
    ChainedBuilder, ExecutorBuilder, ExecutorHandle, OutputQueue,
    DEFAULT_EMPTY_INPUT_INTERVAL, DEFAULT_FULL_OUTPUT_INTERVAL,
};
