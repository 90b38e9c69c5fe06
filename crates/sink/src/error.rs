//! crates/sink/src/error.rs
//!
//! Startup errors for the sink pipeline.
//!
//! Steady-state failures (a dead connection, a failed write) never surface
//! here — workers contain them, log them and carry on. Only conditions
//! that prevent the pipeline from coming up at all reach the caller.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors that abort sink startup.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Creating or configuring the listening socket failed.
    #[error("failed to create listening socket: {0}")]
    Socket(#[source] io::Error),
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the sink attempted to bind.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// `listen` on the bound socket failed.
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    /// `accept` failed with something other than "no connection yet".
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    /// Pre-allocating the buffer pool failed.
    #[error("failed to pre-allocate buffer {index}: {source}")]
    BufferAlloc {
        /// Index of the buffer within the pool.
        index: usize,
        /// Underlying allocation error.
        #[source]
        source: buffer::BufferError,
    },
    /// Spawning a worker thread failed.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        /// Thread name of the worker.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}
