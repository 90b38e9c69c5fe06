//! crates/sink/src/writer.rs
//!
//! File-write worker: drains the dirty queue to disk and recycles buffers.
//!
//! Each buffer becomes one regular file named `<stream>.<seqno:06>`. Three
//! write paths are selected per buffer, in order of preference:
//!
//! 1. the buffer is memfd-backed → `sendfile` straight from the memfd,
//! 2. the splice option is set → `vmsplice`+`splice` through the mover's
//!    pipe pair,
//! 3. otherwise → a single `writev`, whose short count is an error.
//!
//! With direct I/O the occupied length is padded with zeros up to the next
//! 512-byte boundary before the write and the file is truncated back to
//! the logical length before close, so consumers never see the pad.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buffer::{Buffer, BufferQueue};
use mover::{DataMover, MoverError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use worker::{WorkerHandle, WorkerState};

/// O_DIRECT requires lengths in multiples of the device block size; most
/// devices use 512.
const DIRECT_IO_BLOCK: usize = 512;

/// How long to wait before re-polling an empty dirty queue.
const DIRTY_RETRY: Duration = Duration::from_micros(100);

/// Write-path feature flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Open output files with `O_DIRECT`.
    pub direct_io: bool,
    /// Route non-memfd buffers through the vmsplice+splice path.
    pub splice: bool,
}

/// Errors from writing a single buffer. Contained per-buffer: the writer
/// logs them, removes the output file and keeps consuming.
#[derive(Debug, Error)]
pub(crate) enum WriteError {
    #[error("failed to create {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writev failed: {0}")]
    Write(#[source] io::Error),
    #[error("partial write: {written} of {len} bytes")]
    Short { written: usize, len: usize },
    #[error(transparent)]
    Mover(#[from] MoverError),
}

/// A file-write worker; several run against the same queue pair.
pub struct FileWriter {
    odir: PathBuf,
    dirty: Arc<BufferQueue>,
    clean: Arc<BufferQueue>,
    opts: WriteOptions,
}

impl FileWriter {
    /// Creates a writer emitting into `odir`.
    pub fn new(
        odir: PathBuf,
        dirty: Arc<BufferQueue>,
        clean: Arc<BufferQueue>,
        opts: WriteOptions,
    ) -> Self {
        Self {
            odir,
            dirty,
            clean,
            opts,
        }
    }

    /// Spawns the write loop on its own thread.
    pub fn spawn(self, index: usize) -> io::Result<WorkerHandle> {
        WorkerHandle::spawn(&format!("writer-{index}"), move |state| self.run(state))
    }

    fn run(self, state: &WorkerState) {
        info!(odir = %self.odir.display(), "file writer loop started");

        let mover = match DataMover::new() {
            Ok(mover) => mover,
            Err(err) => {
                error!(%err, "data mover failed to initialize");
                state.fail();
                return;
            }
        };

        while !state.is_killed() {
            let Some(mut buf) = self.dirty.pop() else {
                thread::sleep(DIRTY_RETRY);
                continue;
            };

            debug!(
                stream = buf.meta().name(),
                seqno = buf.meta().seqno(),
                size = buf.len(),
                capacity = buf.capacity(),
                "writing buffer"
            );

            if let Err(err) = self.write_buffer(&mover, &mut buf) {
                error!(
                    stream = buf.meta().name(),
                    seqno = buf.meta().seqno(),
                    %err,
                    "write failed"
                );
            }

            // The buffer is reusable whether or not the write stuck.
            buf.clear();
            if self.clean.push(buf).is_err() {
                warn!("clean queue rejected a recycled buffer");
            }
        }
    }

    /// Writes one buffer to `<odir>/<stream>.<seqno:06>`.
    pub(crate) fn write_buffer(&self, mover: &DataMover, buf: &mut Buffer) -> Result<(), WriteError> {
        let ofile = self
            .odir
            .join(format!("{}.{:06}", buf.meta().name(), buf.meta().seqno()));

        // Pad to the device block size when writing direct; if the tail
        // cannot hold the pad, fall back to regular I/O for this buffer.
        let mut direct = self.opts.direct_io;
        let mut pad = 0usize;
        if direct {
            let tail = buf.len() % DIRECT_IO_BLOCK;
            if tail != 0 {
                pad = DIRECT_IO_BLOCK - tail;
                if pad > buf.room() {
                    warn!(file = %ofile.display(), "no room for direct-io pad, doing regular io");
                    direct = false;
                    pad = 0;
                } else {
                    buf.spare_mut()[..pad].fill(0);
                    buf.advance(pad);
                }
            }
        }
        let logical_len = buf.len() - pad;

        let mut open_opts = OpenOptions::new();
        open_opts.write(true).create(true).truncate(true).mode(0o666);
        if direct {
            open_opts.custom_flags(libc::O_DIRECT);
        }
        let file = open_opts.open(&ofile).map_err(|source| WriteError::Open {
            path: ofile.clone(),
            source,
        })?;

        let result = if let Some(memfd) = buf.memfd() {
            mover
                .write_from_fd(file.as_fd(), memfd, buf.len())
                .map_err(WriteError::from)
        } else if self.opts.splice {
            let mut iov = [IoSlice::new(buf.filled())];
            mover
                .write_vectored(file.as_fd(), &mut iov)
                .map_err(WriteError::from)
        } else {
            writev_once(&file, buf.filled())
        };

        // Sync, then drop the page-cache residency this write created.
        let _ = file.sync_all();
        unsafe {
            libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }

        // Restore the logical file length hidden by the pad.
        if pad > 0 {
            let _ = file.set_len(logical_len as u64);
        }
        drop(file);

        if result.is_err() {
            let _ = fs::remove_file(&ofile);
        }
        result
    }
}

/// One `writev` call; anything short of the full length is an error.
fn writev_once(file: &File, data: &[u8]) -> Result<(), WriteError> {
    let iov = [IoSlice::new(data)];
    let written = unsafe { libc::writev(file.as_raw_fd(), iov.as_ptr().cast::<libc::iovec>(), 1) };
    if written < 0 {
        return Err(WriteError::Write(io::Error::last_os_error()));
    }
    let written = written as usize;
    if written != data.len() {
        return Err(WriteError::Short {
            written,
            len: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use buffer::BufferOptions;
    use proptest::prelude::*;

    use super::*;

    /// True when `dir`'s filesystem accepts `O_DIRECT` opens.
    fn direct_io_supported(dir: &Path) -> bool {
        let probe = dir.join(".direct-io-probe");
        let supported = OpenOptions::new()
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(&probe)
            .is_ok();
        let _ = fs::remove_file(&probe);
        supported
    }

    fn queues(count: usize) -> (Arc<BufferQueue>, Arc<BufferQueue>) {
        (
            Arc::new(BufferQueue::with_capacity(count)),
            Arc::new(BufferQueue::with_capacity(count)),
        )
    }

    fn filled_buffer(opts: BufferOptions, name: &str, seqno: u64, data: &[u8]) -> Buffer {
        let mut b = Buffer::alloc(64 * 1024, opts, name).expect("alloc");
        b.meta_mut().stamp(name, seqno);
        b.spare_mut()[..data.len()].copy_from_slice(data);
        b.advance(data.len());
        b
    }

    fn writer_into(dir: &Path, opts: WriteOptions) -> FileWriter {
        let (dirty, clean) = queues(4);
        FileWriter::new(dir.to_path_buf(), dirty, clean, opts)
    }

    #[test]
    fn plain_write_produces_the_named_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer_into(dir.path(), WriteOptions::default());
        let mover = DataMover::new().expect("mover");

        let data: Vec<u8> = (0..40_000).map(|i| (i % 256) as u8).collect();
        let mut buf = filled_buffer(BufferOptions::default(), "cam0", 3, &data);
        writer.write_buffer(&mover, &mut buf).expect("write");

        let written = fs::read(dir.path().join("cam0.000003")).expect("read back");
        assert_eq!(written, data);
    }

    #[test]
    fn splice_write_produces_identical_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer_into(
            dir.path(),
            WriteOptions {
                splice: true,
                ..WriteOptions::default()
            },
        );
        let mover = DataMover::new().expect("mover");

        let data = vec![0xC3u8; 48 * 1024 + 17];
        let mut buf = filled_buffer(BufferOptions::default(), "spl", 0, &data);
        writer.write_buffer(&mover, &mut buf).expect("write");

        assert_eq!(fs::read(dir.path().join("spl.000000")).expect("read"), data);
    }

    #[test]
    fn memfd_buffers_take_the_sendfile_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer_into(dir.path(), WriteOptions::default());
        let mover = DataMover::new().expect("mover");

        let opts = BufferOptions {
            memfd: true,
            ..BufferOptions::default()
        };
        let data: Vec<u8> = (0..30_000).map(|i| (i % 151) as u8).collect();
        let mut buf = filled_buffer(opts, "mfd", 12, &data);
        assert!(buf.memfd().is_some());
        writer.write_buffer(&mover, &mut buf).expect("write");

        assert_eq!(fs::read(dir.path().join("mfd.000012")).expect("read"), data);
    }

    #[test]
    fn direct_io_pads_then_truncates_to_logical_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        if !direct_io_supported(dir.path()) {
            eprintln!("skipping: filesystem refuses O_DIRECT");
            return;
        }
        let writer = writer_into(
            dir.path(),
            WriteOptions {
                direct_io: true,
                ..WriteOptions::default()
            },
        );
        let mover = DataMover::new().expect("mover");

        // 1000 bytes needs a 24-byte pad to reach the 512 boundary.
        let data = vec![0x7Eu8; 1000];
        let mut buf = filled_buffer(BufferOptions::default(), "dio", 0, &data);
        writer.write_buffer(&mover, &mut buf).expect("write");

        let written = fs::read(dir.path().join("dio.000000")).expect("read");
        assert_eq!(written.len(), 1000);
        assert_eq!(written, data);
    }

    #[test]
    fn failed_open_reports_and_leaves_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        let writer = writer_into(&missing, WriteOptions::default());
        let mover = DataMover::new().expect("mover");

        let mut buf = filled_buffer(BufferOptions::default(), "gone", 0, b"data");
        let err = writer
            .write_buffer(&mover, &mut buf)
            .expect_err("open must fail");
        assert!(matches!(err, WriteError::Open { .. }));
        assert!(!missing.exists());
    }

    #[test]
    fn spawned_writer_drains_the_dirty_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirty = Arc::new(BufferQueue::with_capacity(4));
        let clean = Arc::new(BufferQueue::with_capacity(4));
        let writer = FileWriter::new(
            dir.path().to_path_buf(),
            Arc::clone(&dirty),
            Arc::clone(&clean),
            WriteOptions::default(),
        );
        let handle = writer.spawn(0).expect("spawn");

        dirty
            .push(filled_buffer(BufferOptions::default(), "live", 0, b"abc"))
            .expect("push");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let path = dir.path().join("live.000000");
        while clean.is_empty() {
            assert!(std::time::Instant::now() < deadline, "writer never recycled");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fs::read(&path).expect("read"), b"abc");

        // The recycled buffer is cleared and back on the clean queue.
        let recycled = clean.pop().expect("recycled buffer");
        assert!(recycled.is_empty());
        drop(handle);
    }

    proptest! {
        /// With 512-aligned capacities the pad always fits in the tail, so
        /// the direct-io fallback only exists for odd-sized pools.
        #[test]
        fn pad_always_fits_when_capacity_is_block_aligned(
            blocks in 1usize..64,
            len_offset in 0usize..32_768,
        ) {
            let capacity = blocks * 512;
            let len = len_offset % (capacity + 1);
            let tail = len % 512;
            if tail != 0 {
                let pad = 512 - tail;
                prop_assert!(pad <= capacity - len);
            }
        }
    }
}
