//! WebSocket upgrade and frame pump.
//!
//! # Responsibilities
//! - Decide whether a request may be upgraded
//! - Complete the RFC 6455 handshake through the response sink
//! - Turn the upgraded socket into a pull-based frame stream
//! - Drive the close handshake and honour server shutdown
//!
//! # Data Flow
//! ```text
//! RequestHandle ──upgrade()──→ 101 Switching Protocols ──→ WebSocketConnection
//!                                                           recv / send_* / close
//! ```
//!
//! # Design Decisions
//! - Upgrading consumes the handle, so the request and response can no longer be touched
//! - Pings are always answered by the pump; surfacing them is opt-in
//! - The pump keeps the owning connection alive, holding its slot until close

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper::{Method, StatusCode, Version};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig as ProtocolConfig};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use crate::http::request::{RequestHandle, RequestHead, RequestId};
use crate::http::response::{ResponseError, ResponseSink};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::Connection;
use crate::observability::metrics;

const SUPPORTED_VERSION: &str = "13";

/// Why a request could not become a WebSocket.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("request does not ask for a WebSocket upgrade")]
    NotUpgrade,

    #[error("WebSocket upgrade requires GET, got {0}")]
    Method(Method),

    #[error("WebSocket upgrade requires HTTP/1.1, got {0:?}")]
    Version(Version),

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,

    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("connection cannot be upgraded")]
    Unavailable,

    #[error("handshake response failed: {0}")]
    Response(#[from] ResponseError),

    #[error("upgrade failed: {0}")]
    Hyper(#[from] hyper::Error),
}

/// Errors from an upgraded connection.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("WebSocket connection is closed")]
    Closed,

    #[error("WebSocket connection cancelled by server shutdown")]
    Cancelled,

    #[error("WebSocket transport error: {0}")]
    Transport(#[source] tungstenite::Error),
}

impl WebSocketError {
    pub fn is_closed(&self) -> bool {
        matches!(self, WebSocketError::Closed)
    }
}

impl From<tungstenite::Error> for WebSocketError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                WebSocketError::Closed
            }
            other => WebSocketError::Transport(other),
        }
    }
}

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl From<CloseFrame> for CloseReason {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.as_str().to_owned(),
        }
    }
}

/// A complete frame delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketStatus {
    Open,
    Closing,
    Closed,
}

/// Check the upgrade headers and return the client key.
pub fn check_eligibility(head: &RequestHead) -> Result<&str, UpgradeError> {
    if !head.is_websocket_upgrade() {
        return Err(UpgradeError::NotUpgrade);
    }
    if head.method != Method::GET {
        return Err(UpgradeError::Method(head.method.clone()));
    }
    if head.version != Version::HTTP_11 {
        return Err(UpgradeError::Version(head.version));
    }
    let key = head
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(UpgradeError::MissingKey)?;
    match head.header("sec-websocket-version").map(str::trim) {
        Some(SUPPORTED_VERSION) => Ok(key),
        other => Err(UpgradeError::UnsupportedVersion(other.map(str::to_owned))),
    }
}

/// Consume a request and switch its connection to WebSocket framing.
///
/// An ineligible request is answered with `400 Bad Request` before the error
/// is returned.
pub async fn upgrade(handle: RequestHandle) -> Result<WebSocketConnection, UpgradeError> {
    let RequestHandle {
        id,
        head,
        body,
        mut response,
        upgrade,
        connection,
    } = handle;
    drop(body);

    let accept = match check_eligibility(&head) {
        Ok(key) => derive_accept_key(key.as_bytes()),
        Err(err) => {
            tracing::debug!(request_id = %id, error = %err, "Rejecting WebSocket upgrade");
            let version_hint = matches!(err, UpgradeError::UnsupportedVersion(_));
            reject(&mut response, StatusCode::BAD_REQUEST, version_hint).await;
            return Err(err);
        }
    };
    let Some(pending) = upgrade else {
        reject(&mut response, StatusCode::INTERNAL_SERVER_ERROR, false).await;
        return Err(UpgradeError::Unavailable);
    };

    response.send_status(StatusCode::SWITCHING_PROTOCOLS.as_u16())?;
    response.send_header("upgrade", "websocket")?;
    response.send_header("connection", "upgrade")?;
    response.send_header("sec-websocket-accept", &accept)?;
    response.finish().await?;

    let upgraded = pending.on_upgrade.await?;

    let mut protocol = ProtocolConfig::default();
    protocol.max_message_size = Some(pending.config.max_message_bytes);
    protocol.max_frame_size = Some(pending.config.max_message_bytes);
    let stream =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(protocol))
            .await;

    tracing::debug!(request_id = %id, path = %head.path, "WebSocket established");

    Ok(WebSocketConnection {
        stream,
        id,
        path: head.path,
        status: WebSocketStatus::Open,
        last_activity: Instant::now(),
        surface_pings: pending.config.surface_pings,
        close_timeout: pending.config.close_timeout(),
        shutdown: pending.shutdown,
        _connection: connection.upgrade(),
    })
}

async fn reject(response: &mut ResponseSink, status: StatusCode, version_hint: bool) {
    let headers: &[(&str, &str)] = if version_hint {
        &[("sec-websocket-version", SUPPORTED_VERSION)]
    } else {
        &[]
    };
    let _ = response
        .send(status.as_u16(), headers.iter().copied(), Bytes::new())
        .await;
}

impl RequestHandle {
    /// See [`upgrade`].
    pub async fn upgrade(self) -> Result<WebSocketConnection, UpgradeError> {
        upgrade(self).await
    }
}

/// An upgraded, bidirectional frame stream.
pub struct WebSocketConnection {
    stream: WebSocketStream<TokioIo<Upgraded>>,
    id: RequestId,
    path: String,
    status: WebSocketStatus,
    last_activity: Instant,
    surface_pings: bool,
    close_timeout: Duration,
    shutdown: ShutdownSignal,
    _connection: Option<Arc<Connection>>,
}

impl WebSocketConnection {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Path of the request that was upgraded.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> WebSocketStatus {
        self.status
    }

    /// When the last frame was received.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Wait for the next complete frame.
    ///
    /// A close frame from the peer completes the close handshake and is
    /// returned once; every later call fails with [`WebSocketError::Closed`].
    pub async fn recv(&mut self) -> Result<Message, WebSocketError> {
        loop {
            if self.status != WebSocketStatus::Open {
                return Err(WebSocketError::Closed);
            }

            let next = tokio::select! {
                _ = self.shutdown.recv() => {
                    self.close_with(CloseCode::Away, "server shutting down").await;
                    return Err(WebSocketError::Cancelled);
                }
                next = self.stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    self.status = WebSocketStatus::Closed;
                    return Err(err.into());
                }
                None => {
                    self.status = WebSocketStatus::Closed;
                    return Err(WebSocketError::Closed);
                }
            };
            self.last_activity = Instant::now();

            match message {
                WsMessage::Text(text) => {
                    metrics::record_ws_frame("in", "text");
                    return Ok(Message::Text(text.as_str().to_owned()));
                }
                WsMessage::Binary(data) => {
                    metrics::record_ws_frame("in", "binary");
                    return Ok(Message::Binary(data));
                }
                WsMessage::Ping(data) => {
                    metrics::record_ws_frame("in", "ping");
                    // The pong is queued by the protocol layer; flushing sends it.
                    self.stream.flush().await?;
                    if self.surface_pings {
                        return Ok(Message::Ping(data));
                    }
                }
                WsMessage::Pong(data) => {
                    metrics::record_ws_frame("in", "pong");
                    return Ok(Message::Pong(data));
                }
                WsMessage::Close(frame) => {
                    metrics::record_ws_frame("in", "close");
                    // Flush the echoed close frame, then release the socket.
                    let _ = self.stream.flush().await;
                    let _ = self.stream.get_mut().shutdown().await;
                    self.status = WebSocketStatus::Closed;
                    tracing::debug!(request_id = %self.id, "WebSocket closed by peer");
                    return Ok(Message::Close(frame.map(CloseReason::from)));
                }
                WsMessage::Frame(_) => {}
            }
        }
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), WebSocketError> {
        self.send(WsMessage::text(text.into()), "text").await
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send(WsMessage::binary(data.into()), "binary").await
    }

    /// Send a ping; the matching pong is delivered by [`recv`](Self::recv).
    pub async fn send_ping(&mut self, payload: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send(WsMessage::Ping(payload.into()), "ping").await
    }

    /// Start the close handshake, wait briefly for the peer, then tear down the socket.
    pub async fn close(&mut self) -> Result<(), WebSocketError> {
        if self.status != WebSocketStatus::Open {
            return Err(WebSocketError::Closed);
        }
        self.close_with(CloseCode::Normal, "").await;
        Ok(())
    }

    async fn send(&mut self, message: WsMessage, kind: &'static str) -> Result<(), WebSocketError> {
        if self.status != WebSocketStatus::Open {
            return Err(WebSocketError::Closed);
        }
        if let Err(err) = self.stream.send(message).await {
            self.status = WebSocketStatus::Closed;
            return Err(err.into());
        }
        metrics::record_ws_frame("out", kind);
        Ok(())
    }

    async fn close_with(&mut self, code: CloseCode, reason: &str) {
        self.status = WebSocketStatus::Closing;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        if self.stream.close(Some(frame)).await.is_ok() {
            metrics::record_ws_frame("out", "close");
            let stream = &mut self.stream;
            let peer_close = async { while let Some(Ok(_)) = stream.next().await {} };
            if tokio::time::timeout(self.close_timeout, peer_close).await.is_err() {
                tracing::debug!(request_id = %self.id, "Peer did not answer close in time");
            }
        }
        let _ = self.stream.get_mut().shutdown().await;
        self.status = WebSocketStatus::Closed;
        tracing::debug!(request_id = %self.id, code = u16::from(code), "WebSocket closed");
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::tests::test_handle;
    use crate::http::response::Outcome;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_headers(version: &'static str) -> Vec<(&'static str, &'static str)> {
        vec![
            ("host", "localhost"),
            ("upgrade", "websocket"),
            ("connection", "Upgrade"),
            ("sec-websocket-key", KEY),
            ("sec-websocket-version", version),
        ]
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            derive_accept_key(KEY.as_bytes()),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn eligible_request_yields_key() {
        let (handle, _rx) = test_handle(Method::GET, &upgrade_headers("13"), "");
        assert_eq!(check_eligibility(handle.head()).unwrap(), KEY);
    }

    #[test]
    fn ineligible_requests_are_classified() {
        let (handle, _rx) = test_handle(Method::GET, &[("host", "localhost")], "");
        assert!(matches!(
            check_eligibility(handle.head()),
            Err(UpgradeError::NotUpgrade)
        ));

        let (handle, _rx) = test_handle(Method::POST, &upgrade_headers("13"), "");
        assert!(matches!(
            check_eligibility(handle.head()),
            Err(UpgradeError::Method(_))
        ));

        let (handle, _rx) = test_handle(Method::GET, &upgrade_headers("8"), "");
        assert!(matches!(
            check_eligibility(handle.head()),
            Err(UpgradeError::UnsupportedVersion(Some(v))) if v == "8"
        ));

        let headers: Vec<_> = upgrade_headers("13")
            .into_iter()
            .filter(|(name, _)| *name != "sec-websocket-key")
            .collect();
        let (handle, _rx) = test_handle(Method::GET, &headers, "");
        assert!(matches!(
            check_eligibility(handle.head()),
            Err(UpgradeError::MissingKey)
        ));
    }

    #[tokio::test]
    async fn version_mismatch_answers_400_with_supported_version() {
        let (handle, rx) = test_handle(Method::GET, &upgrade_headers("8"), "");
        let err = handle.upgrade().await.unwrap_err();
        assert!(matches!(err, UpgradeError::UnsupportedVersion(_)));

        match rx.await.unwrap() {
            Outcome::Respond(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
                assert_eq!(response.headers()["sec-websocket-version"], "13");
            }
            Outcome::Abort => panic!("unexpected abort"),
        }
    }

    #[tokio::test]
    async fn plain_request_upgrade_is_refused_with_400() {
        let (handle, rx) = test_handle(Method::GET, &[], "");
        assert!(matches!(
            handle.upgrade().await,
            Err(UpgradeError::NotUpgrade)
        ));
        assert!(matches!(
            rx.await,
            Ok(Outcome::Respond(r)) if r.status() == StatusCode::BAD_REQUEST
        ));
    }

    #[test]
    fn closed_transport_errors_map_to_closed() {
        let err: WebSocketError = tungstenite::Error::ConnectionClosed.into();
        assert!(err.is_closed());
        let err: WebSocketError = tungstenite::Error::AlreadyClosed.into();
        assert!(err.is_closed());
    }
}
