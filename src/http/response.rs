//! Response sink: ordered, streaming response construction.
//!
//! # Responsibilities
//! - Enforce `Initial → StatusSent → HeadersSent → BodyStreaming → Finished`
//! - Stream body chunks to the connection through a bounded channel
//! - Auto-close an abandoned exchange: 500 if no byte has left yet, reset otherwise
//!
//! # Design Decisions
//! - The response head is committed on the first `write_chunk` or on `finish`,
//!   so an abandoned response before any body byte still gets a clean 500
//! - A protocol violation poisons the sink and aborts the exchange instead of
//!   sending malformed output
//! - The body channel is bounded; `write_chunk` suspends while it is full
//! - HEAD responses and bodiless statuses (1xx, 204, 304) commit an empty body
//!   and accept chunks as no-ops, since hyper never polls such a body

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;

use crate::http::request::RequestId;
use crate::net::connection::ExchangeTicket;
use crate::observability::metrics;

/// Position of a response in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseState {
    Initial,
    StatusSent,
    HeadersSent,
    BodyStreaming,
    Finished,
}

/// Errors reported by [`ResponseSink`] operations.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("status code {0} is outside 100..=599")]
    InvalidStatus(u16),

    #[error("{operation} is not allowed in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: ResponseState,
    },

    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    #[error("connection closed before the response completed")]
    ConnectionClosed,

    #[error("response was aborted after a protocol violation")]
    Aborted,
}

impl ResponseError {
    /// Whether the error stems from misuse of the sink by the handler.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ResponseError::InvalidStatus(_)
                | ResponseError::OutOfOrder { .. }
                | ResponseError::InvalidHeader { .. }
        )
    }
}

/// What the connection engine receives for an exchange.
#[derive(Debug)]
pub(crate) enum Outcome {
    Respond(Response<ResponseBody>),
    Abort,
}

#[derive(Debug)]
enum BodyMessage {
    Data(Bytes),
    Trailers(HeaderMap),
    End,
}

/// Error yielded by a response body that could not complete.
#[derive(Debug, Error)]
pub enum ResponseBodyError {
    #[error("response abandoned before finish")]
    Abandoned,

    #[error("request timed out while streaming the response")]
    TimedOut,
}

#[derive(Debug)]
enum BodyKind {
    Empty,
    Channel(mpsc::Receiver<BodyMessage>),
}

/// Body handed to hyper. Pulls chunks from the sink's channel.
#[derive(Debug)]
pub struct ResponseBody {
    kind: BodyKind,
    done: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    _ticket: Option<ExchangeTicket>,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            done: false,
            deadline: None,
            _ticket: None,
        }
    }

    fn channel(rx: mpsc::Receiver<BodyMessage>) -> Self {
        Self {
            kind: BodyKind::Channel(rx),
            ..Self::empty()
        }
    }

    /// Attach the exchange deadline and in-flight ticket.
    pub(crate) fn bind(mut self, deadline: tokio::time::Instant, ticket: ExchangeTicket) -> Self {
        if matches!(self.kind, BodyKind::Channel(_)) {
            self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
        }
        self._ticket = Some(ticket);
        self
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = ResponseBodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                metrics::record_timeout("response_body");
                return Poll::Ready(Some(Err(ResponseBodyError::TimedOut)));
            }
        }
        let rx = match &mut this.kind {
            BodyKind::Empty => {
                this.done = true;
                return Poll::Ready(None);
            }
            BodyKind::Channel(rx) => rx,
        };
        match ready!(rx.poll_recv(cx)) {
            Some(BodyMessage::Data(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Some(BodyMessage::Trailers(trailers)) => {
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
            Some(BodyMessage::End) => {
                this.done = true;
                Poll::Ready(None)
            }
            None => {
                this.done = true;
                Poll::Ready(Some(Err(ResponseBodyError::Abandoned)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || matches!(self.kind, BodyKind::Empty)
    }

    fn size_hint(&self) -> SizeHint {
        match self.kind {
            BodyKind::Empty => SizeHint::with_exact(0),
            BodyKind::Channel(_) => SizeHint::default(),
        }
    }
}

/// A head-only response, used by the engine and by auto-close.
pub(crate) fn status_response(status: StatusCode, close: bool) -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = status;
    if close {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Write half of an exchange.
#[derive(Debug)]
pub struct ResponseSink {
    request_id: RequestId,
    state: ResponseState,
    status: StatusCode,
    headers: HeaderMap,
    trailers: HeaderMap,
    head_tx: Option<oneshot::Sender<Outcome>>,
    body_tx: Option<mpsc::Sender<BodyMessage>>,
    buffer_chunks: usize,
    head_request: bool,
    discard_body: bool,
    poisoned: bool,
}

impl ResponseSink {
    /// Create a sink and the receiver the connection engine waits on.
    pub(crate) fn channel(
        request_id: RequestId,
        buffer_chunks: usize,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (head_tx, head_rx) = oneshot::channel();
        let sink = Self {
            request_id,
            state: ResponseState::Initial,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx: None,
            buffer_chunks: buffer_chunks.max(1),
            head_request: false,
            discard_body: false,
            poisoned: false,
        };
        (sink, head_rx)
    }

    /// Mark the exchange as answering a HEAD request.
    pub(crate) fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Whether a protocol violation or lost connection ended this response.
    pub fn is_aborted(&self) -> bool {
        self.poisoned
    }

    /// Set the status code. Valid once, in `Initial`.
    pub fn send_status(&mut self, code: u16) -> Result<(), ResponseError> {
        self.check("send_status", &[ResponseState::Initial])?;
        let status = match StatusCode::from_u16(code) {
            Ok(status) if (100..=599).contains(&code) => status,
            _ => {
                self.poison("invalid status code");
                return Err(ResponseError::InvalidStatus(code));
            }
        };
        self.status = status;
        self.state = ResponseState::StatusSent;
        Ok(())
    }

    /// Append a header. Valid after the status and before any body byte.
    pub fn send_header(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.check(
            "send_header",
            &[ResponseState::StatusSent, ResponseState::HeadersSent],
        )?;
        let (name, value) = self.parse_header(name, value)?;
        self.headers.append(name, value);
        self.state = ResponseState::HeadersSent;
        Ok(())
    }

    /// Buffer a trailer; it is flushed by [`finish`](Self::finish).
    pub fn send_trailer(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.check(
            "send_trailer",
            &[ResponseState::HeadersSent, ResponseState::BodyStreaming],
        )?;
        let (name, value) = self.parse_header(name, value)?;
        self.trailers.append(name, value);
        Ok(())
    }

    /// Stream a body chunk. Suspends while the outbound buffer is full.
    pub async fn write_chunk(&mut self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.check(
            "write_chunk",
            &[ResponseState::HeadersSent, ResponseState::BodyStreaming],
        )?;
        if self.state == ResponseState::HeadersSent {
            self.open_body()?;
        }
        let chunk = chunk.into();
        if chunk.is_empty() || self.discard_body {
            return Ok(());
        }
        self.push(BodyMessage::Data(chunk)).await
    }

    /// Complete the response, flushing buffered trailers.
    pub async fn finish(&mut self) -> Result<(), ResponseError> {
        self.check(
            "finish",
            &[
                ResponseState::StatusSent,
                ResponseState::HeadersSent,
                ResponseState::BodyStreaming,
            ],
        )?;
        if self.state != ResponseState::BodyStreaming {
            if self.trailers.is_empty() {
                self.commit(ResponseBody::empty())?;
                self.state = ResponseState::Finished;
                return Ok(());
            }
            self.open_body()?;
        }
        if self.discard_body {
            self.trailers.clear();
            self.state = ResponseState::Finished;
            return Ok(());
        }
        if !self.trailers.is_empty() {
            let trailers = std::mem::take(&mut self.trailers);
            self.push(BodyMessage::Trailers(trailers)).await?;
        }
        self.push(BodyMessage::End).await?;
        self.body_tx = None;
        self.state = ResponseState::Finished;
        Ok(())
    }

    /// Status, headers, body and finish in one call; stops at the first failure.
    ///
    /// Adds `content-length` when the caller did not and the status permits a body.
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
        self.send_status(status)?;
        let mut has_length = false;
        for (name, value) in headers {
            let name = name.as_ref();
            has_length |= name.eq_ignore_ascii_case("content-length");
            self.send_header(name, value.as_ref())?;
        }
        let body = body.into();
        if !has_length && status_allows_body(self.status) {
            self.send_header("content-length", &body.len().to_string())?;
        }
        if !body.is_empty() {
            self.write_chunk(body).await?;
        }
        self.finish().await
    }

    /// Answer with a bodiless response unless the handler already started one.
    ///
    /// Returns `false` when the sink was no longer in `Initial`.
    pub(crate) fn respond_now(&mut self, status: StatusCode, close: bool) -> bool {
        if self.poisoned || self.state != ResponseState::Initial {
            return false;
        }
        let sent = match self.head_tx.take() {
            Some(tx) => tx.send(Outcome::Respond(status_response(status, close))).is_ok(),
            None => false,
        };
        self.state = ResponseState::Finished;
        sent
    }

    fn check(
        &mut self,
        operation: &'static str,
        allowed: &[ResponseState],
    ) -> Result<(), ResponseError> {
        if self.poisoned {
            return Err(ResponseError::Aborted);
        }
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let err = ResponseError::OutOfOrder {
            operation,
            state: self.state,
        };
        // A finished exchange has nothing left to corrupt.
        if self.state != ResponseState::Finished {
            self.poison(operation);
        }
        Err(err)
    }

    fn parse_header(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<(HeaderName, HeaderValue), ResponseError> {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => Ok((name, value)),
            _ => {
                self.poison("invalid header");
                Err(ResponseError::InvalidHeader {
                    name: name.to_string(),
                })
            }
        }
    }

    fn open_body(&mut self) -> Result<(), ResponseError> {
        if self.head_request || !status_allows_body(self.status) {
            self.commit(ResponseBody::empty())?;
            self.discard_body = true;
        } else {
            let (tx, rx) = mpsc::channel(self.buffer_chunks);
            self.commit(ResponseBody::channel(rx))?;
            self.body_tx = Some(tx);
        }
        self.state = ResponseState::BodyStreaming;
        Ok(())
    }

    fn commit(&mut self, body: ResponseBody) -> Result<(), ResponseError> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);

        let delivered = match self.head_tx.take() {
            Some(tx) => tx.send(Outcome::Respond(response)).is_ok(),
            None => false,
        };
        if delivered {
            Ok(())
        } else {
            self.poisoned = true;
            Err(ResponseError::ConnectionClosed)
        }
    }

    async fn push(&mut self, message: BodyMessage) -> Result<(), ResponseError> {
        let sent = match &self.body_tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            self.poisoned = true;
            self.body_tx = None;
            Err(ResponseError::ConnectionClosed)
        }
    }

    fn poison(&mut self, reason: &'static str) {
        tracing::warn!(
            request_id = %self.request_id,
            state = ?self.state,
            reason,
            "Response protocol violation, aborting exchange"
        );
        self.poisoned = true;
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(Outcome::Abort);
        }
        self.body_tx = None;
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        match self.state {
            ResponseState::Finished => {}
            // The empty head-only body is already complete.
            ResponseState::BodyStreaming if self.discard_body => {}
            ResponseState::Initial | ResponseState::StatusSent | ResponseState::HeadersSent => {
                // A closed receiver means the engine already answered (408, reset).
                if let Some(tx) = self.head_tx.take().filter(|tx| !tx.is_closed()) {
                    tracing::warn!(
                        request_id = %self.request_id,
                        state = ?self.state,
                        "Request handle dropped without finish, sending 500"
                    );
                    metrics::record_auto_close("head");
                    let response = status_response(StatusCode::INTERNAL_SERVER_ERROR, false);
                    let _ = tx.send(Outcome::Respond(response));
                }
            }
            ResponseState::BodyStreaming => {
                tracing::warn!(
                    request_id = %self.request_id,
                    "Request handle dropped mid-body, resetting exchange"
                );
                metrics::record_auto_close("body");
                // Dropping the sender without `End` makes the body fail.
                self.body_tx = None;
            }
        }
    }
}
