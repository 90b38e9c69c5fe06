//! crates/generator/src/lib.rs
//!
//! Rate-paced traffic generator for the firehose sink.
//!
//! Two workers hang off one bounded frame queue: [`Pump`] allocates a
//! frame per tick and stamps it, [`NetTx`] streams frames to the sink as
//! contiguous bytes with no framing header. Frames that meet a full queue
//! are dropped with a warning rather than disturbing the pace.

use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use buffer::BufferQueue;
use thiserror::Error;
use tracing::{info, warn};

mod config;
mod nettx;
mod pump;

pub use config::GenConfig;
pub use nettx::NetTx;
pub use pump::Pump;

/// Frames buffered between the pump and the sender.
const FRAME_QUEUE_DEPTH: usize = 8;

/// How often the supervisor loop re-checks worker health.
const HEALTH_POLL: Duration = Duration::from_millis(250);

/// Result type for generator operations.
pub type GenResult<T> = Result<T, GenError>;

/// Errors that abort generator startup.
#[derive(Debug, Error)]
pub enum GenError {
    /// Connecting to the sink failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// `host:port` of the sink.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Spawning a worker thread failed.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        /// Thread name of the worker.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Connects to the sink and pumps frames until `shutdown` is set or a
/// worker stops.
pub fn run(config: &GenConfig, shutdown: &Arc<AtomicBool>) -> GenResult<()> {
    let addr = format!("{}:{}", config.sink_host, config.sink_port);
    let stream = TcpStream::connect(&addr).map_err(|source| GenError::Connect {
        addr: addr.clone(),
        source,
    })?;
    info!(%addr, stream = %config.name, "connected to sink");

    force_send_buffer(&stream, config.frame_size * 2);

    let frames = Arc::new(BufferQueue::with_capacity(FRAME_QUEUE_DEPTH));

    let sender = NetTx::new(stream, Arc::clone(&frames))
        .spawn()
        .map_err(|source| GenError::Spawn {
            name: "nettx",
            source,
        })?;
    let pump = Pump::new(
        config.frame_size,
        config.interval(),
        config.name.clone(),
        frames,
    )
    .spawn()
    .map_err(|source| GenError::Spawn {
        name: "pump",
        source,
    })?;

    while !shutdown.load(Ordering::Relaxed) && sender.is_running() && pump.is_running() {
        thread::sleep(HEALTH_POLL);
    }

    if sender.has_failed() {
        warn!("sender stopped with a failure");
    }

    drop(pump);
    drop(sender);
    Ok(())
}

/// Forces the send-buffer depth to hold two frames; needs CAP_NET_ADMIN,
/// so a refusal is only worth a warning.
fn force_send_buffer(stream: &TcpStream, bytes: usize) {
    let depth = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUFFORCE,
            (&raw const depth).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(
            err = %io::Error::last_os_error(),
            "failed to force socket send-buffer depth"
        );
    }
}
