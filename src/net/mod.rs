//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, protocol, idle accounting)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Accepting → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded connection count; excess connections are closed without a response
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionId, ConnectionTracker, Protocol, WatchedStream};
pub use listener::{ConnectionPermit, Listener, ListenerError};
