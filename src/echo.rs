//! Reference echo handler used by the `sparx` binary and the integration tests.
//!
//! - HTTP: answers 200 and streams the request body back chunk by chunk,
//!   keeping the request's `content-type`
//! - WebSocket: replies `Echo: <text>` to text frames and returns binary
//!   frames unchanged

use std::time::Duration;

use crate::dispatch::HandlerError;
use crate::http::request::RequestHandle;
use crate::http::websocket::{Message, WebSocketError};

/// How long the echo waits for each request body chunk.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn echo(mut request: RequestHandle) -> Result<(), HandlerError> {
    if request.is_websocket_upgrade() {
        return echo_websocket(request).await;
    }

    let request_id = request.id().to_string();
    let content_type = request.header("content-type").map(str::to_owned);

    request.send_status(200)?;
    request.send_header("x-request-id", &request_id)?;
    if let Some(content_type) = content_type {
        request.send_header("content-type", &content_type)?;
    }
    while let Some(chunk) = request.next_chunk(CHUNK_TIMEOUT).await? {
        request.write_chunk(chunk).await?;
    }
    request.finish().await?;
    Ok(())
}

async fn echo_websocket(request: RequestHandle) -> Result<(), HandlerError> {
    let mut ws = request.upgrade().await?;
    loop {
        match ws.recv().await {
            Ok(Message::Text(text)) => ws.send_text(format!("Echo: {text}")).await?,
            Ok(Message::Binary(data)) => ws.send_binary(data).await?,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return Ok(()),
            Err(WebSocketError::Closed) | Err(WebSocketError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
