//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use sparx::{HandlerError, RequestHandle, ServerConfig, ServerRef};

/// Config bound to an ephemeral localhost port with short timeouts.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        workers: 4,
        request_timeout_ms: 5_000,
        keep_alive_timeout_ms: 5_000,
        shutdown_grace_ms: 2_000,
        ..ServerConfig::default()
    }
}

/// Start a server with dispatch workers running `handler`.
pub async fn start_server<F, Fut>(config: ServerConfig, handler: F) -> ServerRef
where
    F: Fn(RequestHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    sparx::start(config, handler).await.unwrap()
}

/// Start a server running the reference echo handler.
pub async fn start_echo_server() -> ServerRef {
    start_server(test_config(), sparx::echo::echo).await
}

pub async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(addr).await.unwrap())
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A response read off a raw HTTP/1.1 socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn invalid(what: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.into())
}

/// Read a status line and header block.
pub async fn read_head<R>(reader: &mut R) -> io::Result<(u16, Vec<(String, String)>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| invalid(format!("bad status line {line:?}")))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| invalid(format!("bad header {trimmed:?}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok((status, headers))
}

/// Read one chunk of a chunked body. `None` after the terminating chunk.
pub async fn read_chunk<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let size = line.trim().split(';').next().unwrap_or_default();
    let size = usize::from_str_radix(size, 16)
        .map_err(|_| invalid(format!("bad chunk size {line:?}")))?;

    if size == 0 {
        // Trailer section ends with an empty line.
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
                return Ok(None);
            }
        }
    }

    let mut chunk = vec![0; size + 2];
    reader.read_exact(&mut chunk).await?;
    chunk.truncate(size);
    Ok(Some(chunk))
}

/// Read a complete response, following content-length or chunked framing.
pub async fn read_response<R>(reader: &mut R) -> io::Result<RawResponse>
where
    R: AsyncBufRead + Unpin,
{
    let (status, headers) = read_head(reader).await?;
    let mut response = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };

    let chunked = response
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if chunked {
        while let Some(chunk) = read_chunk(reader).await? {
            response.body.extend_from_slice(&chunk);
        }
    } else if let Some(length) = response.header("content-length") {
        let length: usize = length.parse().map_err(|_| invalid("bad content-length"))?;
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await?;
        response.body = body;
    } else if !(status < 200 || status == 204 || status == 304) {
        reader.read_to_end(&mut response.body).await?;
    }
    Ok(response)
}

/// Write a raw request and read its response.
pub async fn roundtrip(stream: &mut BufReader<TcpStream>, request: &str) -> RawResponse {
    stream.get_mut().write_all(request.as_bytes()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), read_response(stream))
        .await
        .expect("response timed out")
        .unwrap()
}

/// Read until the peer closes, returning everything received.
pub async fn read_until_closed(stream: &mut BufReader<TcpStream>) -> Vec<u8> {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    // A reset counts as closed.
    if let Err(e) = read {
        assert!(
            matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe),
            "unexpected read error: {e}"
        );
    }
    rest
}

pub fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n")
}

pub fn post(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}
