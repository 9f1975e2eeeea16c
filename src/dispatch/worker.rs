//! Worker pool that drains the request queue.
//!
//! Each worker pulls one handle at a time and runs the application handler on
//! it. Handler errors and panics are contained to the request: the handle is
//! dropped and its response sink auto-closes the exchange.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::http::request::RequestHandle;
use crate::http::server::ServerRef;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Fixed set of tasks pulling from a server's request queue.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `workers` tasks that run `handler` on every dequeued request.
    ///
    /// Workers exit once the server stops; [`ServerRef::stop`] waits for them.
    pub async fn spawn<F, Fut>(server: &ServerRef, workers: usize, handler: F)
    where
        F: Fn(RequestHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let tasks: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                let server = server.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(run_worker(worker, server, handler))
            })
            .collect();

        tracing::info!(workers, "Dispatch workers started");
        server.attach_workers(tasks).await;
    }
}

async fn run_worker<F, Fut>(worker: usize, server: ServerRef, handler: Arc<F>)
where
    F: Fn(RequestHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    while let Some(request) = server.dequeue().await {
        let request_id = request.id();
        let outcome = AssertUnwindSafe(handler(request)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(worker, request_id = %request_id, error = %e, "Handler failed");
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(worker, request_id = %request_id, panic = %message, "Handler panicked");
            }
        }
    }
    tracing::debug!(worker, "Dispatch worker stopped");
}
