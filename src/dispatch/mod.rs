//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! connection task → queue.rs (bounded FIFO, 503 when full)
//!     → worker.rs (dequeue, run handler, contain faults)
//!     → handler writes through the response sink
//! ```

pub mod queue;
pub mod worker;

pub use queue::{Entry, QueueError, RequestQueue};
pub use worker::{HandlerError, WorkerPool};
