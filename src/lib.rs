//! Demand-driven HTTP/1.1, HTTP/2 and WebSocket streaming core.
//!
//! Connections are served by the engine in [`http::server`]; every parsed
//! request is queued as a [`RequestHandle`] that application workers pull,
//! read on demand and answer through an ordered response sink.
//!
//! ```no_run
//! # async fn run() -> Result<(), sparx::StartError> {
//! let server = sparx::start(sparx::ServerConfig::default(), sparx::echo::echo).await?;
//! tokio::signal::ctrl_c().await.ok();
//! sparx::stop(&server).await;
//! # Ok(())
//! # }
//! ```

// Core subsystems
pub mod config;
pub mod dispatch;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub mod echo;

use std::future::Future;

pub use config::ServerConfig;
pub use dispatch::{HandlerError, WorkerPool};
pub use http::{
    HttpServer, Message, RequestHandle, ServerRef, StartError, StopReport, WebSocketConnection,
};
pub use lifecycle::Shutdown;

/// Start a server and `config.workers` dispatch workers running `handler`.
pub async fn start<F, Fut>(config: ServerConfig, handler: F) -> Result<ServerRef, StartError>
where
    F: Fn(RequestHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let workers = config.workers;
    let server = HttpServer::new(config)?.start().await?;
    WorkerPool::spawn(&server, workers, handler).await;
    Ok(server)
}

/// Stop a server started with [`start`]. Repeated calls return the same report.
pub async fn stop(server: &ServerRef) -> StopReport {
    server.stop().await
}
