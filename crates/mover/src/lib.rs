//! crates/mover/src/lib.rs
//!
//! The data-mover engine: one kernel pipe pair per writer thread, grown to
//! the system maximum, exposing the two zero-copy write primitives used by
//! the file-write stage.
//!
//! - [`DataMover::write_vectored`] gathers user pages into the pipe with
//!   `vmsplice` and forwards them to the output descriptor with `splice`,
//!   so buffer contents reach the file without a userspace copy.
//! - [`DataMover::write_from_fd`] forwards a RAM-backed file (a `memfd`)
//!   straight to the output descriptor with `sendfile`.
//!
//! `vmsplice` is free to consume only part of the request; the vectored
//! path rewinds its iovec cursor by the exact byte count consumed and keeps
//! going, so callers always get all-or-error semantics.

use std::fs;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;

use thiserror::Error;

/// Kernel default pipe capacity, used when the tunable cannot be read.
pub const DEFAULT_PIPE_SIZE: usize = 64 * 1024;

const PIPE_MAX_SIZE: &str = "/proc/sys/fs/pipe-max-size";

/// Largest pipe buffer an unprivileged process may request.
///
/// Falls back to [`DEFAULT_PIPE_SIZE`] when the proc file is missing or
/// unparsable.
#[must_use]
pub fn max_pipe_size() -> usize {
    fs::read_to_string(PIPE_MAX_SIZE)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_PIPE_SIZE)
}

/// Errors from the data-mover write paths.
#[derive(Debug, Error)]
pub enum MoverError {
    /// Opening the pipe pair failed (fd exhaustion).
    #[error("failed to open pipe pair: {0}")]
    Pipe(#[source] io::Error),
    /// `vmsplice` into the pipe failed.
    #[error("vmsplice into pipe failed: {0}")]
    Vmsplice(#[source] io::Error),
    /// `splice` from the pipe to the output failed.
    #[error("splice to output failed: {0}")]
    Splice(#[source] io::Error),
    /// `splice` reported no progress while bytes remained in the pipe.
    #[error("splice stalled with {remaining} bytes left in the pipe")]
    SpliceStalled {
        /// Bytes still queued in the pipe.
        remaining: usize,
    },
    /// `sendfile` failed.
    #[error("sendfile failed: {0}")]
    Sendfile(#[source] io::Error),
    /// `sendfile` moved fewer bytes than the input holds.
    #[error("short sendfile: moved {moved} of {len} bytes")]
    ShortSendfile {
        /// Bytes actually moved.
        moved: usize,
        /// Bytes requested.
        len: usize,
    },
}

/// A per-writer pipe pair and its zero-copy write primitives.
///
/// Not shared between threads; every writer owns its own instance.
#[derive(Debug)]
pub struct DataMover {
    read_end: OwnedFd,
    write_end: OwnedFd,
    pipe_size: usize,
}

impl DataMover {
    /// Opens the pipe pair and enlarges both ends to [`max_pipe_size`].
    ///
    /// Enlargement is best-effort: a kernel that refuses `F_SETPIPE_SZ`
    /// leaves the default capacity in place and the write paths simply
    /// loop more often.
    pub fn new() -> Result<Self, MoverError> {
        Self::with_pipe_size(max_pipe_size())
    }

    /// Opens the pipe pair with a specific requested capacity.
    ///
    /// Smaller pipes force more vmsplice/splice rounds per buffer; useful
    /// for tuning and for exercising the rewind path.
    pub fn with_pipe_size(pipe_size: usize) -> Result<Self, MoverError> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(MoverError::Pipe(io::Error::last_os_error()));
        }
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        unsafe {
            libc::fcntl(write_end.as_raw_fd(), libc::F_SETPIPE_SZ, pipe_size as libc::c_int);
            libc::fcntl(read_end.as_raw_fd(), libc::F_SETPIPE_SZ, pipe_size as libc::c_int);
        }

        Ok(Self {
            read_end,
            write_end,
            pipe_size,
        })
    }

    /// Pipe capacity requested at construction.
    #[must_use]
    pub fn pipe_size(&self) -> usize {
        self.pipe_size
    }

    /// Writes every byte of `bufs` to `out` through the pipe.
    ///
    /// Each round `vmsplice`s the remaining segments into the pipe, rewinds
    /// the cursor by the bytes actually consumed, and drains exactly that
    /// many bytes into `out`. Terminates when the segments are exhausted.
    pub fn write_vectored(
        &self,
        out: BorrowedFd<'_>,
        mut bufs: &mut [IoSlice<'_>],
    ) -> Result<(), MoverError> {
        loop {
            let remaining: usize = bufs.iter().map(|b| b.len()).sum();
            if remaining == 0 {
                return Ok(());
            }

            let gathered = unsafe {
                libc::vmsplice(
                    self.write_end.as_raw_fd(),
                    bufs.as_ptr().cast::<libc::iovec>(),
                    bufs.len(),
                    0,
                )
            };
            if gathered < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MoverError::Vmsplice(err));
            }

            let gathered = gathered as usize;
            IoSlice::advance_slices(&mut bufs, gathered);
            self.drain_pipe(out, gathered)?;
        }
    }

    /// Forwards `len` bytes of `src` (a memfd sized exactly `len`) to `out`
    /// with a single `sendfile`. A short count is an error.
    pub fn write_from_fd(
        &self,
        out: BorrowedFd<'_>,
        src: BorrowedFd<'_>,
        len: usize,
    ) -> Result<(), MoverError> {
        let mut offset: libc::off_t = 0;
        let moved = unsafe { libc::sendfile(out.as_raw_fd(), src.as_raw_fd(), &mut offset, len) };
        if moved < 0 {
            return Err(MoverError::Sendfile(io::Error::last_os_error()));
        }
        let moved = moved as usize;
        if moved != len {
            return Err(MoverError::ShortSendfile { moved, len });
        }
        Ok(())
    }

    fn drain_pipe(&self, out: BorrowedFd<'_>, mut remaining: usize) -> Result<(), MoverError> {
        while remaining > 0 {
            let moved = unsafe {
                libc::splice(
                    self.read_end.as_raw_fd(),
                    ptr::null_mut(),
                    out.as_raw_fd(),
                    ptr::null_mut(),
                    remaining,
                    libc::SPLICE_F_MOVE,
                )
            };
            if moved < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MoverError::Splice(err));
            }
            if moved == 0 {
                return Err(MoverError::SpliceStalled { remaining });
            }
            remaining -= moved as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn read_back(file: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.read_to_end(&mut out).expect("read");
        out
    }

    #[test]
    fn construction_reports_a_usable_pipe_size() {
        let mover = DataMover::new().expect("mover");
        assert!(mover.pipe_size() > 0);
    }

    #[test]
    fn vectored_write_delivers_a_single_segment() {
        let mover = DataMover::new().expect("mover");
        let mut file = tempfile::tempfile().expect("tempfile");
        let data = pattern(1024 * 1024);

        let mut iov = [IoSlice::new(&data)];
        mover
            .write_vectored(file.as_fd(), &mut iov)
            .expect("write_vectored");

        assert_eq!(read_back(&mut file), data);
    }

    #[test]
    fn vectored_write_preserves_segment_order() {
        let mover = DataMover::new().expect("mover");
        let mut file = tempfile::tempfile().expect("tempfile");

        let a = pattern(300 * 1024);
        let b = vec![0xAAu8; 5];
        let c = pattern(700 * 1024 + 13);
        let empty: &[u8] = &[];

        let mut iov = [
            IoSlice::new(&a),
            IoSlice::new(empty),
            IoSlice::new(&b),
            IoSlice::new(&c),
        ];
        mover
            .write_vectored(file.as_fd(), &mut iov)
            .expect("write_vectored");

        let mut expected = a;
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);
        assert_eq!(read_back(&mut file), expected);
    }

    #[test]
    fn tiny_pipe_still_delivers_every_byte() {
        // A one-page pipe forces many partial vmsplice returns; the rewind
        // loop must still deliver the full payload in order.
        let mover = DataMover::with_pipe_size(4096).expect("mover");
        let mut file = tempfile::tempfile().expect("tempfile");

        let a = pattern(512 * 1024);
        let b = pattern(512 * 1024 + 7);
        let mut iov = [IoSlice::new(&a), IoSlice::new(&b)];
        mover
            .write_vectored(file.as_fd(), &mut iov)
            .expect("write_vectored");

        let mut expected = a;
        expected.extend_from_slice(&b);
        assert_eq!(read_back(&mut file), expected);
    }

    #[test]
    fn vectored_write_of_nothing_is_a_no_op() {
        let mover = DataMover::new().expect("mover");
        let mut file = tempfile::tempfile().expect("tempfile");

        let mut iov: [IoSlice<'_>; 0] = [];
        mover
            .write_vectored(file.as_fd(), &mut iov)
            .expect("empty write");
        assert!(read_back(&mut file).is_empty());
    }

    fn memfd_with(data: &[u8]) -> File {
        let raw = unsafe { libc::memfd_create(c"mover-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(raw >= 0, "memfd_create");
        let mut file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
        file.write_all(data).expect("fill memfd");
        file
    }

    #[test]
    fn fd_write_forwards_the_whole_input() {
        let mover = DataMover::new().expect("mover");
        let data = pattern(2 * 1024 * 1024);
        let src = memfd_with(&data);
        let mut out = tempfile::tempfile().expect("tempfile");

        mover
            .write_from_fd(out.as_fd(), src.as_fd(), data.len())
            .expect("sendfile");
        assert_eq!(read_back(&mut out), data);
    }

    #[test]
    fn fd_write_rejects_short_input() {
        let mover = DataMover::new().expect("mover");
        let data = pattern(4096);
        let src = memfd_with(&data);
        let out = tempfile::tempfile().expect("tempfile");

        let err = mover
            .write_from_fd(out.as_fd(), src.as_fd(), data.len() + 512)
            .expect_err("input is shorter than requested");
        assert!(matches!(err, MoverError::ShortSendfile { moved, len }
            if moved == data.len() && len == data.len() + 512));
    }
}
