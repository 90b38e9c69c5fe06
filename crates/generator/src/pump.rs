//! crates/generator/src/pump.rs
//!
//! Rate-paced frame producer.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buffer::{Buffer, BufferOptions, BufferQueue};
use tracing::{info, warn};
use worker::{WorkerHandle, WorkerState};

/// Allocates one frame per tick and pushes it onto the frame queue.
///
/// A frame that cannot be allocated or finds the queue full is dropped
/// with a warning; the pace is never disturbed and the sequence number
/// still advances, so drops are visible as gaps.
pub struct Pump {
    frame_size: usize,
    interval: Duration,
    name: String,
    frames: Arc<BufferQueue>,
}

impl Pump {
    /// Creates a pump emitting `frame_size`-byte frames every `interval`.
    pub fn new(
        frame_size: usize,
        interval: Duration,
        name: String,
        frames: Arc<BufferQueue>,
    ) -> Self {
        Self {
            frame_size,
            interval,
            name,
            frames,
        }
    }

    /// Spawns the pace loop on its own thread.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        WorkerHandle::spawn("pump", move |state| self.run(state))
    }

    fn run(self, state: &WorkerState) {
        info!(
            frame_size = self.frame_size,
            interval_us = self.interval.as_micros() as u64,
            "frame pump started"
        );

        let mut seqno = 0u64;
        while !state.is_killed() {
            thread::sleep(self.interval);

            let mut frame =
                match Buffer::alloc(self.frame_size, BufferOptions::default(), &self.name) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(seqno, %err, "dropping frame: allocation failed");
                        seqno += 1;
                        continue;
                    }
                };
            frame.meta_mut().stamp(&self.name, seqno);
            seqno += 1;

            // The payload stays zeroed; a fresh mapping arrives zero-filled.
            let room = frame.room();
            frame.advance(room);

            if let Err(frame) = self.frames.push(frame) {
                warn!(seqno = frame.meta().seqno(), "dropping frame: queue full");
            }
        }
    }
}
