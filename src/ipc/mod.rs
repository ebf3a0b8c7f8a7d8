//! IPC communication between controllers and the agent
//!
//! Local controllers use Unix domain sockets (named pipes on Windows) via
//! the interprocess crate; remote controllers use TCP.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::AgentClient;
pub use transport::Endpoint;
