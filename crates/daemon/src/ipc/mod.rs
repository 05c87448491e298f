//! Single-instance control channel
//!
//! A local socket (a named pipe on Windows) through which later launches
//! enqueue jobs on, query, or stop the resident instance.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ClientError;
pub use protocol::{Request, Response};
pub use server::{Server, ServerError};
