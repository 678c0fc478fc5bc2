//! Browser-side half of Tideline for Rust programs: keeps one websocket to
//! the server, buffers calls while it is down and runs local handlers for
//! signals pushed by the server.

pub mod connection;
pub mod runtime;

pub use connection::{ClientConfig, ClientError, ReconnectPolicy, SignalClient};
pub use runtime::{CallOutcome, CallScope, ClientRuntime, ConnectionState};
