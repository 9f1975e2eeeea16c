//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper HTTP/1.1 + HTTP/2, deadlines, request queue)
//!     → request.rs (head, pull-based body stream, request ID)
//!     → [worker runs the application handler]
//!     → response.rs (ordered status/headers/body, auto-close)
//!     → websocket.rs (upgrade, frame pump) when the handler asks for it
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use request::{BodyError, BodyStream, RequestHandle, RequestHead, RequestId};
pub use response::{ResponseError, ResponseSink, ResponseState};
pub use server::{HttpServer, ServerRef, StartError, StopReport};
pub use websocket::{Message, UpgradeError, WebSocketConnection, WebSocketError};
