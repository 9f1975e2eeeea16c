//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (http/server.rs):
//!     Validate config → Bind listener → Spawn accept loop → Spawn workers
//!
//! Stop (shutdown.rs signal):
//!     Close queue → Stop accepting → Cancel body pulls → Drain connections → Ack
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: refuse new work, drain, close
//! - Shutdown has timeout: remaining connections are dropped after the grace period

pub mod shutdown;

pub use shutdown::{Shutdown, ShutdownSignal};
