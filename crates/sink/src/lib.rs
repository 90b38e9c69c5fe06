//! crates/sink/src/lib.rs
//!
//! The data sink: a staged buffer-exchange pipeline that receives opaque
//! byte streams over TCP and persists them to per-buffer output files with
//! minimal CPU cost.
//!
//! A pool of large page-aligned buffers circulates between two stages
//! through a pair of lock-free queues:
//!
//! ```text
//!      clean queue ──┐                   ┌── clean queue
//!                    ▼                   ▲
//!   [acceptor] → [NetRx × connection] → dirty queue → [FileWriter × N]
//! ```
//!
//! [`NetRx`] fills clean buffers from its socket and hands them to the
//! dirty queue; [`FileWriter`] drains the dirty queue to disk (optionally
//! through the zero-copy vmsplice or sendfile paths) and recycles the
//! buffers; [`run`] owns startup, the accept loop and ordered shutdown.

mod config;
mod error;
mod netrx;
mod supervisor;
mod writer;

pub use config::SinkConfig;
pub use error::{SinkError, SinkResult};
pub use netrx::NetRx;
pub use supervisor::{run, run_with};
pub use worker::{WorkerHandle, WorkerState};
pub use writer::{FileWriter, WriteOptions};
