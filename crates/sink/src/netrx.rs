//! crates/sink/src/netrx.rs
//!
//! Per-connection network receive worker.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buffer::{Buffer, BufferQueue};
use tracing::{debug, error, info, warn};

use worker::{WorkerHandle, WorkerState};

/// How long to wait before re-polling an empty clean queue.
const CLEAN_RETRY: Duration = Duration::from_millis(1);

/// One receive worker per accepted TCP connection.
///
/// The loop takes clean buffers, `recv`s into their tail until they are
/// full (or nearly full and a replacement is immediately available), and
/// hands them to the dirty queue stamped with the stream name and a
/// contiguous per-stream sequence number starting at zero.
///
/// The byte stream carries no framing, so buffers split it at arbitrary
/// points; consumers needing frames must match frame size to buffer
/// capacity or add out-of-band framing.
pub struct NetRx {
    stream: TcpStream,
    stream_name: String,
    clean: Arc<BufferQueue>,
    dirty: Arc<BufferQueue>,
}

impl NetRx {
    /// Creates a receiver for an accepted connection.
    pub fn new(
        stream: TcpStream,
        stream_name: String,
        clean: Arc<BufferQueue>,
        dirty: Arc<BufferQueue>,
    ) -> Self {
        Self {
            stream,
            stream_name,
            clean,
            dirty,
        }
    }

    /// Spawns the receive loop on its own thread.
    ///
    /// `kill` shuts the socket down through a cloned handle so a blocked
    /// `recv` observes EOF and the loop exits through its flush path.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let thread_name = format!("netrx-{}", self.stream_name);
        let unblock = self.stream.try_clone()?;
        let handle = WorkerHandle::spawn(&thread_name, move |state| self.run(state))?
            .with_unblock(move || {
                let _ = unblock.shutdown(Shutdown::Both);
            });
        Ok(handle)
    }

    fn run(self, state: &WorkerState) {
        info!(stream = %self.stream_name, "data stream loop started");

        let mut seqno = 0u64;
        let mut current: Option<Buffer> = None;

        while !state.is_killed() {
            let Some(mut buf) = current.take() else {
                // Wait for a clean buffer to become available.
                if let Some(mut fresh) = self.clean.pop() {
                    self.stamp(&mut fresh, &mut seqno);
                    current = Some(fresh);
                } else {
                    debug!(stream = %self.stream_name, "waiting for a clean buffer");
                    thread::sleep(CLEAN_RETRY);
                }
                continue;
            };

            // Receive into the tail of the buffer.
            let room = buf.room();
            let tail = buf.spare_mut().as_mut_ptr();
            let received = unsafe {
                libc::recv(self.stream.as_raw_fd(), tail.cast::<libc::c_void>(), room, 0)
            };

            if received < 0 {
                let err = io::Error::last_os_error();
                current = Some(buf);
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(stream = %self.stream_name, %err, "recv failed");
                state.fail();
                break;
            }

            if received == 0 {
                info!(stream = %self.stream_name, "peer closed connection");
                current = Some(buf);
                break;
            }

            buf.advance(received as usize);

            if buf.room() == 0 {
                // No more room; send it down the pipeline.
                warn!(stream = %self.stream_name, "buffer filled to capacity, potential stall");
                self.emit(buf);
                continue;
            }

            // Nearly full: swap for a fresh buffer if one is ready, so the
            // stream never stalls on the tail of a mostly-written buffer.
            if buf.room() < buf.capacity() / 8 {
                if let Some(mut fresh) = self.clean.pop() {
                    self.emit(buf);
                    self.stamp(&mut fresh, &mut seqno);
                    current = Some(fresh);
                    continue;
                }
            }

            current = Some(buf);
        }

        // Hand off whatever arrived before the loop ended; an untouched
        // buffer goes back to the free list instead.
        if let Some(buf) = current {
            if buf.is_empty() {
                let _ = self.clean.push(buf);
            } else {
                self.emit(buf);
            }
        }
    }

    fn stamp(&self, buf: &mut Buffer, seqno: &mut u64) {
        buf.meta_mut().stamp(&self.stream_name, *seqno);
        debug!(
            stream = %self.stream_name,
            seqno = *seqno,
            capacity = buf.capacity(),
            "starting new buffer"
        );
        *seqno += 1;
    }

    fn emit(&self, buf: Buffer) {
        let seqno = buf.meta().seqno();
        if let Err(buf) = self.dirty.push(buf) {
            // The dirty queue is sized for the whole pool, so this only
            // fires on a misconfigured pipeline. Recycle rather than leak.
            warn!(stream = %self.stream_name, seqno, "dirty queue full, dropping buffer contents");
            let mut buf = buf;
            buf.clear();
            let _ = self.clean.push(buf);
        }
    }
}
