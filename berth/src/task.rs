//! Task spawning abstraction for single-threaded environments.

use async_trait::async_trait;
use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
///
/// Network stacks use this to run their acceptor and reader tasks on the
/// same thread as the poll loop, preserving the single-threaded execution
/// guarantees the driver's shared state relies on.
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;

    /// Yield control to allow other tasks to run.
    async fn yield_now(&self);
}

/// Tokio-based task provider using `spawn_local` for single-threaded
/// execution. Requires a current-thread runtime built with local task
/// support.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

#[async_trait(?Send)]
impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!("Task {} starting", task_name);
            future.await;
            tracing::trace!("Task {} completed", task_name);
        })
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
