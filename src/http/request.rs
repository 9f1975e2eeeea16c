//! Request handles and pull-based body streams.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for log correlation
//! - Expose the parsed request head (method, path, query, version, headers)
//! - Hand out body chunks one at a time, on demand
//! - Bundle head, body and response sink into the handle workers dequeue
//!
//! # Design Decisions
//! - The body is never read ahead: each `next_chunk` polls the transport for
//!   exactly one frame, so a slow handler throttles the socket read
//! - A handle is the sole owner of its body cursor and response sink; moving it
//!   between tasks moves that ownership

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Version};
use thiserror::Error;
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::http::response::{ResponseError, ResponseSink, ResponseState};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionId, Protocol};

/// Boxed error type of request body transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    /// Header pairs, in the order each name first arrived; repeated names are
    /// grouped together with their values in arrival order.
    ///
    /// Names are lowercased by the HTTP parser, not kept as the client sent
    /// them. HTTP/2 requires lowercase names on the wire anyway; for HTTP/1
    /// compare names case-insensitively or use [`header`](Self::header).
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub(crate) fn from_parts(parts: &hyper::http::request::Parts) -> Self {
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            version: parts.version,
            headers,
        }
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in arrival order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Upgrade: websocket` together with a `Connection` header carrying the
    /// `upgrade` token.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header_values("upgrade")
            .any(|v| v.trim().eq_ignore_ascii_case("websocket"));
        let connection = self.header_values("connection").any(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        upgrade && connection
    }
}

/// Errors from pulling request body chunks.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("timed out waiting for the next body chunk")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,

    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("body transport failed: {0}")]
    Transport(#[source] BoxError),
}

impl BodyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BodyError::Timeout)
    }
}

/// Demand-driven reader over a request body.
pub struct BodyStream {
    inner: UnsyncBoxBody<Bytes, BoxError>,
    cancel: ShutdownSignal,
    trailers: Option<HeaderMap>,
    finished: bool,
}

impl BodyStream {
    pub(crate) fn new(inner: UnsyncBoxBody<Bytes, BoxError>, cancel: ShutdownSignal) -> Self {
        Self {
            inner,
            cancel,
            trailers: None,
            finished: false,
        }
    }

    /// Pull the next chunk. `Ok(None)` marks the end of the body and is
    /// returned again on every later call.
    pub async fn next_chunk(&mut self, timeout: Duration) -> Result<Option<Bytes>, BodyError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_triggered() {
            return Err(BodyError::Cancelled);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.recv() => return Err(BodyError::Cancelled),
                frame = tokio::time::timeout_at(deadline, self.inner.frame()) => {
                    frame.map_err(|_| BodyError::Timeout)?
                }
            };
            let frame = match frame {
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(frame) => frame.map_err(BodyError::Transport)?,
            };
            match frame.into_data() {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => return Ok(Some(data)),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.trailers = Some(trailers);
                    }
                }
            }
        }
    }

    /// Read the whole body, failing as soon as it grows past `max_size`.
    ///
    /// `timeout` bounds each chunk pull.
    pub async fn read_body(&mut self, max_size: usize, timeout: Duration) -> Result<Bytes, BodyError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk(timeout).await? {
            if body.len() + chunk.len() > max_size {
                return Err(BodyError::TooLarge { limit: max_size });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Trailers received after the last chunk, if any.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// What the upgrade path needs once a handler asks for a WebSocket.
pub(crate) struct PendingUpgrade {
    pub(crate) on_upgrade: OnUpgrade,
    pub(crate) config: Arc<WebSocketConfig>,
    pub(crate) shutdown: ShutdownSignal,
}

/// One request as seen by a worker: head, body stream and response sink.
///
/// Dropping a handle without finishing its response triggers auto-close.
pub struct RequestHandle {
    pub(crate) id: RequestId,
    pub(crate) head: RequestHead,
    pub(crate) body: BodyStream,
    pub(crate) response: ResponseSink,
    pub(crate) upgrade: Option<PendingUpgrade>,
    pub(crate) connection: Weak<Connection>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn query(&self) -> Option<&str> {
        self.head.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.head.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.head.is_websocket_upgrade()
    }

    /// Protocol of the owning connection, if it is still open.
    pub fn protocol(&self) -> Option<Protocol> {
        self.connection.upgrade().and_then(|conn| conn.protocol())
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.upgrade().map(|conn| conn.id())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.upgrade().map(|conn| conn.peer_addr())
    }

    pub async fn next_chunk(&mut self, timeout: Duration) -> Result<Option<Bytes>, BodyError> {
        self.body.next_chunk(timeout).await
    }

    pub async fn read_body(&mut self, max_size: usize, timeout: Duration) -> Result<Bytes, BodyError> {
        self.body.read_body(max_size, timeout).await
    }

    pub fn response_state(&self) -> ResponseState {
        self.response.state()
    }

    pub fn send_status(&mut self, code: u16) -> Result<(), ResponseError> {
        self.response.send_status(code)
    }

    pub fn send_header(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.response.send_header(name, value)
    }

    pub fn send_trailer(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.response.send_trailer(name, value)
    }

    pub async fn write_chunk(&mut self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.response.write_chunk(chunk).await
    }

    pub async fn finish(&mut self) -> Result<(), ResponseError> {
        self.response.finish().await
    }

    pub async fn send<I, K, V>(
        &mut self,
        status: u16,
        headers: I,
        body: impl Into<Bytes>,
    ) -> Result<(), ResponseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.response.send(status, headers, body).await
    }

    /// Split into independently owned parts.
    ///
    /// The sink keeps the auto-close guarantee; the upgrade capability is lost.
    pub fn into_parts(self) -> (RequestHead, BodyStream, ResponseSink) {
        (self.head, self.body, self.response)
    }

    /// Answer with a bodiless status unless a response already started.
    pub(crate) fn reject(mut self, status: hyper::StatusCode) {
        let close = self.head.version != Version::HTTP_2;
        self.response.respond_now(status, close);
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("method", &self.head.method)
            .field("path", &self.head.path)
            .field("state", &self.response.state())
            .finish_non_exhaustive()
    }
}
