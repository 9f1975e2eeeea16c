//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Record the negotiated protocol (set once per connection)
//! - Count in-flight exchanges and idle time for the keep-alive watchdog
//! - Record when the first byte of an HTTP/1 request head arrives
//! - Coordinate graceful shutdown per-connection

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper::Version;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::lifecycle::ShutdownSignal;
use crate::net::listener::ConnectionPermit;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    pub fn from_version(version: Version) -> Self {
        if version == Version::HTTP_2 {
            Protocol::Http2
        } else {
            Protocol::Http1
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http1 => f.write_str("HTTP/1.1"),
            Protocol::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or the timeout elapses.
    ///
    /// Returns `true` when every connection closed in time.
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Per-socket state owned by the connection engine.
///
/// Request handles only hold a `Weak` reference to it; a WebSocket holds a
/// strong one so the connection slot stays reserved after the upgrade.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    protocol: OnceLock<Protocol>,
    in_flight: AtomicUsize,
    opened: Instant,
    /// Milliseconds since `opened` of the last exchange completion.
    last_activity_ms: AtomicU64,
    /// One plus milliseconds since `opened` of the first byte of a pending
    /// request head; zero when no head is pending.
    head_started_ms: AtomicU64,
    signal: ShutdownSignal,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        permit: ConnectionPermit,
        guard: ConnectionGuard,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            peer,
            protocol: OnceLock::new(),
            in_flight: AtomicUsize::new(0),
            opened: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            head_started_ms: AtomicU64::new(0),
            signal,
            guard,
            _permit: permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Record the protocol seen on this connection.
    ///
    /// The first call wins; the returned value is the protocol in effect.
    pub fn negotiate(&self, observed: Protocol) -> Protocol {
        let established = *self.protocol.get_or_init(|| {
            tracing::debug!(connection_id = %self.id(), protocol = %observed, "Protocol negotiated");
            observed
        });
        if established != observed {
            tracing::warn!(
                connection_id = %self.id(),
                established = %established,
                observed = %observed,
                "Request protocol differs from negotiated protocol"
            );
        }
        established
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol.get().copied()
    }

    /// Signal that fires when the server stops or this connection ends.
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Mark an exchange as in flight until the returned ticket is dropped.
    pub fn begin_exchange(self: &Arc<Self>) -> ExchangeTicket {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ExchangeTicket {
            connection: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// How long the connection has been idle, or `None` while an exchange is
    /// in flight or a request head is arriving.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.in_flight() > 0 || self.head_started_ms.load(Ordering::SeqCst) != 0 {
            return None;
        }
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
        Some(self.opened.elapsed().saturating_sub(last))
    }

    /// Note bytes read off the socket. Between exchanges on HTTP/1 they start
    /// a request head.
    pub fn note_read(&self) {
        if self.in_flight() > 0 || self.protocol() == Some(Protocol::Http2) {
            return;
        }
        let now = self.opened.elapsed().as_millis() as u64 + 1;
        let _ = self
            .head_started_ms
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// How long the pending request head has been arriving.
    pub fn head_pending_for(&self) -> Option<Duration> {
        match self.head_started_ms.load(Ordering::SeqCst) {
            0 => None,
            started => Some(
                self.opened
                    .elapsed()
                    .saturating_sub(Duration::from_millis(started - 1)),
            ),
        }
    }

    /// Claim the arrival time of the head that was just parsed.
    pub fn take_head_start(&self) -> Option<Instant> {
        match self.head_started_ms.swap(0, Ordering::SeqCst) {
            0 => None,
            started => Some(self.opened + Duration::from_millis(started - 1)),
        }
    }

    fn touch(&self) {
        let now = self.opened.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::SeqCst);
    }
}

/// Keeps an exchange counted as in flight; held by the response body.
#[derive(Debug)]
pub struct ExchangeTicket {
    connection: Arc<Connection>,
}

impl Drop for ExchangeTicket {
    fn drop(&mut self) {
        self.connection.touch();
        self.connection.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Socket wrapper that reports reads to its [`Connection`].
///
/// The first read also detects the HTTP/2 preface so that a prior-knowledge
/// connection is never mistaken for a slow HTTP/1 head.
#[derive(Debug)]
pub struct WatchedStream<S> {
    inner: S,
    connection: Arc<Connection>,
    first_read: bool,
}

impl<S> WatchedStream<S> {
    pub fn new(inner: S, connection: Arc<Connection>) -> Self {
        Self {
            inner,
            connection,
            first_read: true,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WatchedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read = &buf.filled()[before..];
        if matches!(polled, Poll::Ready(Ok(()))) && !read.is_empty() {
            if self.first_read {
                self.first_read = false;
                // "PRI" is reserved for the preface; no HTTP/1 method starts with it.
                let len = read.len().min(H2_PREFACE.len());
                if len >= 3 && read[..len] == H2_PREFACE[..len] {
                    self.connection.negotiate(Protocol::Http2);
                }
            }
            self.connection.note_read();
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WatchedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
