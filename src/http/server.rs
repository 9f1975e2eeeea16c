//! HTTP server: accept loop, protocol handling and exchange driving.
//!
//! # Responsibilities
//! - Bind the listener and run the accept loop until stop
//! - Serve HTTP/1.1 and HTTP/2 (prior knowledge) on the same socket
//! - Turn each parsed request head into a [`RequestHandle`] on the request queue
//! - Enforce the request deadline and the keep-alive idle timeout
//!
//! # Timeouts
//! - HTTP/1 request deadline: `request_timeout` from the first byte of the head
//!   to the terminal response. A head still incomplete at the deadline closes
//!   the connection; a parsed head past it is answered 408 without queueing
//! - HTTP/2 request deadline: `request_timeout` from the parsed stream head
//! - Keep-alive: a connection with nothing in flight and no head arriving is
//!   shut down after `keep_alive_timeout`. hyper's own header-read timer also
//!   runs while idle, so it is set to the larger of the two timeouts
//! - Stop gracefully: refuse new work, drain in-flight responses, report
//!
//! # Design Decisions
//! - hyper parses and frames; the engine only hands out heads and streams
//! - Capacity errors become a 503 immediately instead of waiting for a worker
//! - A connection's protocol is fixed by its first exchange

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{validate_config, ServerConfig, ValidationError, WebSocketConfig};
use crate::dispatch::RequestQueue;
use crate::http::request::{BodyStream, BoxError, PendingUpgrade, RequestHandle, RequestHead, RequestId};
use crate::http::response::{status_response, Outcome, ResponseBody, ResponseSink};
use crate::lifecycle::Shutdown;
use crate::net::{Connection, ConnectionTracker, Listener, ListenerError, Protocol, WatchedStream};
use crate::observability::metrics;

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {}", format_validation(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error("{0}")]
    Bind(ListenerError),

    #[error("failed to read local address: {0}")]
    Io(#[from] std::io::Error),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why the engine gave up on an exchange. hyper closes the connection
/// (or resets the HTTP/2 stream) when the service returns it.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange aborted after a response protocol violation")]
    Aborted,
}

/// Outcome of [`ServerRef::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Queued requests that never reached a worker and were answered with 503.
    pub rejected_queued: usize,
    /// Whether every connection closed within the shutdown grace period.
    pub drained: bool,
    /// Workers still running at the deadline and aborted.
    pub aborted_workers: usize,
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: Arc<ServerConfig>,
    websocket: Arc<WebSocketConfig>,
    queue: RequestQueue<RequestHandle>,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    builder: auto::Builder<TokioExecutor>,
}

/// HTTP server for the streaming core.
pub struct HttpServer {
    config: ServerConfig,
}

impl HttpServer {
    /// Create a server after validating the configuration.
    pub fn new(config: ServerConfig) -> Result<Self, StartError> {
        validate_config(&config).map_err(StartError::InvalidConfig)?;
        Ok(Self { config })
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(self) -> Result<ServerRef, StartError> {
        let config = Arc::new(self.config);
        let listener = Listener::bind(&config).await.map_err(StartError::Bind)?;
        let local_addr = listener.local_addr()?;

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(config.request_timeout().max(config.keep_alive_timeout()))
            .max_buf_size(config.limits.max_header_bytes)
            .keep_alive(true);
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_concurrent_streams(config.limits.max_concurrent_streams);

        let shared = Arc::new(Shared {
            websocket: Arc::new(config.websocket.clone()),
            queue: RequestQueue::new(config.max_connections),
            shutdown: Shutdown::new(),
            tracker: ConnectionTracker::new(),
            builder,
            config,
        });

        tracing::info!(
            address = %local_addr,
            max_connections = shared.config.max_connections,
            request_timeout_ms = shared.config.request_timeout_ms,
            keep_alive_timeout_ms = shared.config.keep_alive_timeout_ms,
            "HTTP server started"
        );

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(ServerRef {
            inner: Arc::new(ServerInner {
                shared,
                local_addr,
                accept_task: Mutex::new(Some(accept_task)),
                workers: Mutex::new(Vec::new()),
                stopped: OnceCell::new(),
            }),
        })
    }
}

struct ServerInner {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: OnceCell<StopReport>,
}

/// Handle to a running server. Cheap to clone.
#[derive(Clone)]
pub struct ServerRef {
    inner: Arc<ServerInner>,
}

impl ServerRef {
    /// Wait for the next request. `None` once the server is stopping.
    pub async fn dequeue(&self) -> Option<RequestHandle> {
        self.inner.shared.queue.dequeue().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.shared.config
    }

    /// Requests waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.shared.queue.len()
    }

    /// Requests that may wait at once before new ones get 503.
    pub fn queue_capacity(&self) -> usize {
        self.inner.shared.queue.capacity()
    }

    pub fn active_connections(&self) -> u64 {
        self.inner.shared.tracker.active_count()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.shared.queue.is_closed()
    }

    /// Register worker tasks so `stop` waits for them.
    pub async fn attach_workers(&self, workers: impl IntoIterator<Item = JoinHandle<()>>) {
        self.inner.workers.lock().await.extend(workers);
    }

    /// Stop the server. Safe to call more than once; later calls return the
    /// first report.
    pub async fn stop(&self) -> StopReport {
        self.inner
            .stopped
            .get_or_init(|| self.inner.shutdown())
            .await
            .clone()
    }
}

impl std::fmt::Debug for ServerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRef")
            .field("local_addr", &self.inner.local_addr)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    async fn shutdown(&self) -> StopReport {
        let shared = &self.shared;
        let deadline = tokio::time::Instant::now() + shared.config.shutdown_grace();
        tracing::info!("Stopping HTTP server");

        // Refuse new work first, then answer whatever never reached a worker.
        shared.queue.close();
        let leftovers = shared.queue.drain().await;
        let rejected_queued = leftovers.len();
        for handle in leftovers {
            metrics::record_queue_rejected("closed");
            handle.reject(StatusCode::SERVICE_UNAVAILABLE);
        }

        shared.shutdown.trigger();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop terminated abnormally");
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drained = shared.tracker.wait_for_shutdown(remaining).await;
        if !drained {
            tracing::warn!(
                active_connections = shared.tracker.active_count(),
                "Connections still open after shutdown grace period"
            );
        }

        let mut aborted_workers = 0;
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for mut worker in workers {
            let finished = tokio::time::timeout_at(deadline, &mut worker).await.is_ok();
            if !finished {
                worker.abort();
                aborted_workers += 1;
            }
        }

        let report = StopReport {
            rejected_queued,
            drained,
            aborted_workers,
        };
        tracing::info!(
            rejected_queued = report.rejected_queued,
            drained = report.drained,
            aborted_workers = report.aborted_workers,
            "HTTP server stopped"
        );
        report
    }
}

async fn accept_loop(listener: Listener, shared: Arc<Shared>) {
    let shutdown = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer, permit)) => {
                metrics::record_connection_accepted();
                let connection = Arc::new(Connection::new(
                    peer,
                    permit,
                    shared.tracker.track(),
                    shutdown.child(),
                ));
                tokio::spawn(serve_connection(Arc::clone(&shared), connection, stream));
            }
            Err(ListenerError::AtCapacity(peer)) => {
                metrics::record_connection_rejected("at_capacity");
                tracing::warn!(peer_addr = %peer, "Connection limit reached, closing new connection");
            }
            Err(e) => {
                metrics::record_connection_rejected("accept_error");
                tracing::error!(error = %e, "Accept failed");
                // Usually fd exhaustion; give in-flight connections time to close.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

fn idle_check_period(shortest_timeout: Duration) -> Duration {
    (shortest_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

async fn serve_connection(shared: Arc<Shared>, connection: Arc<Connection>, stream: TcpStream) {
    let service = {
        let shared = Arc::clone(&shared);
        let connection = Arc::clone(&connection);
        service_fn(move |req| handle_exchange(Arc::clone(&shared), Arc::clone(&connection), req))
    };

    let conn = shared
        .builder
        .serve_connection_with_upgrades(
            TokioIo::new(WatchedStream::new(stream, Arc::clone(&connection))),
            service,
        );
    tokio::pin!(conn);

    let signal = connection.signal().clone();
    let keep_alive = shared.config.keep_alive_timeout();
    let request_timeout = shared.config.request_timeout();
    let grace = shared.config.shutdown_grace();
    let mut idle_check = tokio::time::interval(idle_check_period(keep_alive.min(request_timeout)));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        let drain_sleep = tokio::time::sleep_until(
            drain_deadline.unwrap_or_else(|| tokio::time::Instant::now() + grace),
        );
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(
                        connection_id = %connection.id(),
                        peer_addr = %connection.peer_addr(),
                        error = %e,
                        "Connection ended with error"
                    );
                }
                break;
            }
            _ = signal.recv(), if drain_deadline.is_none() => {
                tracing::debug!(connection_id = %connection.id(), "Draining connection for shutdown");
                conn.as_mut().graceful_shutdown();
                drain_deadline = Some(tokio::time::Instant::now() + grace);
            }
            _ = idle_check.tick(), if drain_deadline.is_none() => {
                if connection.head_pending_for().is_some_and(|pending| pending >= request_timeout) {
                    tracing::debug!(connection_id = %connection.id(), "Request head not received in time");
                    metrics::record_timeout("request_head");
                    break;
                }
                if connection.idle_for().is_some_and(|idle| idle >= keep_alive) {
                    tracing::debug!(connection_id = %connection.id(), "Closing idle connection");
                    metrics::record_timeout("keep_alive");
                    conn.as_mut().graceful_shutdown();
                    drain_deadline = Some(tokio::time::Instant::now() + grace);
                }
            }
            _ = drain_sleep, if drain_deadline.is_some() => {
                tracing::warn!(connection_id = %connection.id(), "Connection did not drain in time");
                break;
            }
        }
    }

    // Releases body pulls still waiting on this connection.
    signal.cancel();
    tracing::trace!(
        connection_id = %connection.id(),
        protocol = ?connection.protocol(),
        "Connection task finished"
    );
}

async fn handle_exchange(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ExchangeError> {
    let start = Instant::now();
    let protocol = connection.negotiate(Protocol::from_version(req.version()));
    let ticket = connection.begin_exchange();
    let head_started = connection
        .take_head_start()
        .map(tokio::time::Instant::from_std)
        .unwrap_or_else(tokio::time::Instant::now);
    let deadline = head_started + shared.config.request_timeout();
    let close = protocol == Protocol::Http1;

    if tokio::time::Instant::now() >= deadline {
        metrics::record_timeout("request");
        metrics::record_request(req.method().as_str(), 408, start);
        tracing::warn!(connection_id = %connection.id(), "Request head arrived after the request deadline");
        let response = status_response(StatusCode::REQUEST_TIMEOUT, close);
        return Ok(response.map(|body| body.bind(deadline, ticket)));
    }
    let exchange = connection.signal().child();

    let id = RequestId::new();
    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, body) = req.into_parts();
    let head = RequestHead::from_parts(&parts);
    let method = head.method.clone();

    tracing::debug!(
        request_id = %id,
        connection_id = %connection.id(),
        protocol = %protocol,
        method = %head.method,
        path = %head.path,
        "Request received"
    );

    let (mut response, head_rx) = ResponseSink::channel(id, shared.config.limits.response_buffer_chunks);
    response.set_head_request(method == Method::HEAD);
    let handle = RequestHandle {
        id,
        head,
        body: BodyStream::new(body.map_err(BoxError::from).boxed_unsync(), exchange.clone()),
        response,
        upgrade: Some(PendingUpgrade {
            on_upgrade,
            config: Arc::clone(&shared.websocket),
            shutdown: shared.shutdown.subscribe(),
        }),
        connection: Arc::downgrade(&connection),
    };

    if let Err(err) = shared.queue.enqueue(handle) {
        metrics::record_queue_rejected(err.reason());
        tracing::warn!(request_id = %id, reason = err.reason(), "Request queue rejected request");
        err.into_inner().reject(StatusCode::SERVICE_UNAVAILABLE);
    }

    let outcome = tokio::select! {
        outcome = head_rx => outcome,
        _ = tokio::time::sleep_until(deadline) => {
            exchange.cancel();
            metrics::record_timeout("request");
            metrics::record_request(method.as_str(), 408, start);
            tracing::warn!(request_id = %id, "Request timed out before a response was produced");
            let response = status_response(StatusCode::REQUEST_TIMEOUT, close);
            return Ok(response.map(|body| body.bind(deadline, ticket)));
        }
    };

    match outcome {
        Ok(Outcome::Respond(response)) => {
            metrics::record_request(method.as_str(), response.status().as_u16(), start);
            tracing::debug!(request_id = %id, status = response.status().as_u16(), "Response started");
            Ok(response.map(|body| body.bind(deadline, ticket)))
        }
        Ok(Outcome::Abort) | Err(_) => {
            exchange.cancel();
            tracing::debug!(request_id = %id, "Exchange aborted");
            Err(ExchangeError::Aborted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn invalid_config_is_refused_with_every_error() {
        let config = ServerConfig {
            host: String::new(),
            max_connections: 0,
            request_timeout_ms: 0,
            ..test_config()
        };
        match HttpServer::new(config) {
            Err(StartError::InvalidConfig(errors)) => assert!(errors.len() >= 3),
            other => panic!("expected InvalidConfig, got {:?}", other.err()),
        }
    }

    #[test]
    fn idle_check_period_is_bounded() {
        assert_eq!(idle_check_period(Duration::from_millis(8)), Duration::from_millis(10));
        assert_eq!(idle_check_period(Duration::from_millis(400)), Duration::from_millis(100));
        assert_eq!(idle_check_period(Duration::from_secs(60)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_dequeue() {
        let server = HttpServer::new(test_config()).unwrap().start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.dequeue().await.is_none() })
        };

        let first = server.stop().await;
        let second = server.stop().await;
        assert_eq!(first, second);
        assert!(first.drained);
        assert!(server.is_stopping());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = HttpServer::new(test_config()).unwrap().start().await.unwrap();
        let config = ServerConfig {
            port: first.local_addr().port(),
            ..test_config()
        };
        let second = HttpServer::new(config).unwrap().start().await;
        assert!(matches!(second, Err(StartError::Bind(_))));
        first.stop().await;
    }
}
