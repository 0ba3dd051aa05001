//! Task spawning abstraction for single-threaded environments.

use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
///
/// The messaging layer spawns background work (connection actors, deferred
/// client stops) through this trait so that everything stays on the owning
/// shard's thread.
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// The name is used for tracing; the task is detached and runs to
    /// completion unless aborted through the returned handle.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio-based task provider using `spawn_local`.
///
/// Requires a `LocalSet` or local runtime context.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!(task = %task_name, "task started");
            future.await;
            tracing::trace!(task = %task_name, "task finished");
        })
    }
}
