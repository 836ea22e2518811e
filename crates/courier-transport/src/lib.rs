//! Transport-facing half of courier.
//!
//! [`ConnectionManager`] wraps whatever [`courier_core::transport::Transport`]
//! the orchestrator supplies. Two transports live here as well: a scripted
//! in-memory one for tests and a line-delimited JSON one for local runs.

pub mod connection;
pub mod mock;
pub mod stdio;

pub use connection::ConnectionManager;
pub use mock::{MockSession, MockStream, MockTransport, StreamStep};
pub use stdio::StdioTransport;
