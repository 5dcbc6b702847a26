//! Batching, resilient delivery of metric events to line protocol databases.
//!
//! Events flow from producers into a [`Sink`](sink::Sink), which batches them with a
//! [`Scheduler`](scheduler::Scheduler), encodes each batch with a [`LineEncoder`](encoder::LineEncoder), and delivers
//! the payload with a [`Publisher`](publisher::Publisher).
#![deny(warnings)]
#![deny(missing_docs)]

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub mod config;
pub mod encoder;
pub mod error;
pub mod event;
pub mod fault;
pub mod publisher;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod telemetry;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This function is a thin wrapper over [`tokio::spawn`] that attaches the spawned future to the current `tracing`
/// span, so that anything it logs carries the caller's context.
pub fn spawn_traced<F, R>(f: F) -> JoinHandle<R>
where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}
