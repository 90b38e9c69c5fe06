//! crates/generator/src/nettx.rs
//!
//! Socket send worker: streams frames to the sink as contiguous bytes.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buffer::BufferQueue;
use tracing::{debug, error, warn};
use worker::{WorkerHandle, WorkerState};

/// How long to wait before re-polling an empty frame queue.
const FRAME_RETRY: Duration = Duration::from_micros(100);

/// Pops frames and `send`s each one whole; the wire carries no framing.
pub struct NetTx {
    stream: TcpStream,
    frames: Arc<BufferQueue>,
}

impl NetTx {
    /// Creates a sender over a connected stream.
    pub fn new(stream: TcpStream, frames: Arc<BufferQueue>) -> Self {
        Self { stream, frames }
    }

    /// Spawns the send loop on its own thread.
    ///
    /// `kill` shuts the socket down through a cloned handle so a blocked
    /// `send` returns and the loop observes the flag.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let unblock = self.stream.try_clone()?;
        let handle = WorkerHandle::spawn("nettx", move |state| self.run(state))?
            .with_unblock(move || {
                let _ = unblock.shutdown(Shutdown::Both);
            });
        Ok(handle)
    }

    fn run(self, state: &WorkerState) {
        while !state.is_killed() {
            let Some(frame) = self.frames.pop() else {
                thread::sleep(FRAME_RETRY);
                continue;
            };

            debug!(
                seqno = frame.meta().seqno(),
                size = frame.len(),
                "sending frame"
            );

            let sent = unsafe {
                libc::send(
                    self.stream.as_raw_fd(),
                    frame.filled().as_ptr().cast::<libc::c_void>(),
                    frame.len(),
                    libc::MSG_NOSIGNAL,
                )
            };

            if state.is_killed() {
                break;
            }
            if sent < 0 {
                error!(err = %io::Error::last_os_error(), "send failed");
                state.fail();
                break;
            }
            if sent as usize != frame.len() {
                // Blocking sockets deliver whole writes; flag it if not.
                warn!(
                    sent,
                    size = frame.len(),
                    "incomplete send"
                );
            }
            // The frame drops here, releasing its mapping.
        }
    }
}
