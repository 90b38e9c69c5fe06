//! crates/buffer/src/lib.rs
//!
//! Large pre-allocated I/O buffers and the lock-free queues that move them
//! between pipeline stages.
//!
//! A [`Buffer`] owns one contiguous `mmap`'d region plus an out-of-band
//! [`Metadata`] record (stream name and sequence number). Three kernel
//! backings hide behind the same view:
//!
//! - anonymous private memory (the default),
//! - anonymous memory on HugeTLB pages,
//! - a `memfd`, which additionally allows `sendfile`-based output because
//!   the region is the page cache of a RAM-backed file.
//!
//! Buffers are exclusively owned at all times: either a worker holds one or
//! it sits in exactly one [`BufferQueue`]. Nothing here allocates on the
//! hot path; the pool is built once at startup and reused until shutdown.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::slice;

use thiserror::Error;

mod queue;

pub use queue::BufferQueue;

/// Longest stream name stored in buffer metadata, in bytes.
pub const MAX_NAME_LEN: usize = 127;

/// Errors from buffer allocation.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Zero-sized buffers are never valid.
    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,
    /// The memfd name contained an interior NUL byte.
    #[error("invalid memfd name")]
    InvalidName,
    /// `memfd_create` failed.
    #[error("memfd_create failed: {0}")]
    MemfdCreate(#[source] io::Error),
    /// Sizing the memfd with `ftruncate` failed.
    #[error("ftruncate to {len} bytes failed: {source}")]
    Truncate {
        /// Requested file length.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Mapping the region failed.
    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        /// Requested mapping length.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Allocation knobs for [`Buffer::alloc`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferOptions {
    /// Back the region with HugeTLB pages.
    pub huge_pages: bool,
    /// Back the region with a `memfd` so it can feed `sendfile`.
    pub memfd: bool,
}

/// Out-of-band record describing the data currently held by a buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    seqno: u64,
    name: String,
}

impl Metadata {
    /// Stamps the record for a freshly acquired buffer.
    ///
    /// The name is truncated at [`MAX_NAME_LEN`] bytes, backing off to the
    /// previous character boundary if the cut would split a code point.
    pub fn stamp(&mut self, name: &str, seqno: u64) {
        self.name.clear();
        self.name.push_str(truncate_name(name));
        self.seqno = seqno;
    }

    /// Per-stream sequence number assigned when the buffer was filled.
    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Stream name stamped into this record.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Kernel backing of a buffer's mapping.
///
/// The variants share the same `(base, capacity, size, meta)` view; the tag
/// only dictates how the region was created and what must be released.
#[derive(Debug)]
enum Backing {
    /// Plain anonymous private mapping.
    Anonymous,
    /// Anonymous private mapping on HugeTLB pages.
    HugeTlb,
    /// Shared mapping of a RAM-backed file descriptor.
    Memfd(OwnedFd),
}

/// A contiguous `mmap`'d region circulated between pipeline stages.
#[derive(Debug)]
pub struct Buffer {
    base: NonNull<u8>,
    capacity: usize,
    size: usize,
    backing: Backing,
    meta: Box<Metadata>,
}

// The region is exclusively owned and the raw pointer never aliases, so
// moving a Buffer across threads is sound.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocates a buffer of `capacity` bytes.
    ///
    /// With `memfd` set, a `memfd` named `name` is created first (HugeTLB
    /// pages when `huge_pages` is also set), grown to `capacity` and mapped
    /// shared, so bytes written through the mapping are visible to
    /// `sendfile` readers of the descriptor. Otherwise the region is a
    /// private anonymous mapping. Anything acquired before a failure is
    /// released before the error is returned.
    pub fn alloc(capacity: usize, opts: BufferOptions, name: &str) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let (base, backing) = if opts.memfd {
            let cname = CString::new(name).map_err(|_| BufferError::InvalidName)?;
            let mut mfd_flags = libc::MFD_CLOEXEC;
            if opts.huge_pages {
                mfd_flags |= libc::MFD_HUGETLB;
            }
            let raw = unsafe { libc::memfd_create(cname.as_ptr(), mfd_flags) };
            if raw < 0 {
                return Err(BufferError::MemfdCreate(io::Error::last_os_error()));
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            if unsafe { libc::ftruncate(fd.as_raw_fd(), capacity as libc::off_t) } < 0 {
                return Err(BufferError::Truncate {
                    len: capacity,
                    source: io::Error::last_os_error(),
                });
            }

            let base = map_region(capacity, libc::MAP_SHARED, fd.as_raw_fd())?;
            (base, Backing::Memfd(fd))
        } else {
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            let backing = if opts.huge_pages {
                flags |= libc::MAP_HUGETLB;
                Backing::HugeTlb
            } else {
                Backing::Anonymous
            };
            (map_region(capacity, flags, -1)?, backing)
        };

        Ok(Self {
            base,
            capacity,
            size: 0,
            backing,
            meta: Box::new(Metadata::default()),
        })
    }

    /// Total capacity in bytes. Immutable after allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently occupied.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no bytes are occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes still available at the tail.
    #[must_use]
    pub fn room(&self) -> usize {
        self.capacity - self.size
    }

    /// The occupied prefix `[base, base + len)`.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    /// The unoccupied tail `[base + len, base + capacity)`.
    ///
    /// Fresh mappings are zero-filled, so the tail is always initialized.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(self.size), self.room()) }
    }

    /// Marks `n` more bytes as occupied after the caller filled the tail.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`Buffer::room`].
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.room(), "advance({n}) exceeds room {}", self.room());
        self.size += n;
    }

    /// Forgets the contents without releasing the mapping.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// The backing `memfd`, when the buffer was allocated with one.
    #[must_use]
    pub fn memfd(&self) -> Option<BorrowedFd<'_>> {
        match &self.backing {
            Backing::Memfd(fd) => Some(fd.as_fd()),
            Backing::Anonymous | Backing::HugeTlb => None,
        }
    }

    /// Metadata record stamped by the receive stage.
    #[must_use]
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Mutable access to the metadata record.
    pub fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Unmap before the memfd (if any) closes; the fd drops with the
        // backing field after this body returns.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.capacity);
        }
    }
}

fn map_region(len: usize, flags: libc::c_int, fd: libc::c_int) -> Result<NonNull<u8>, BufferError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(BufferError::Map {
            len,
            source: io::Error::last_os_error(),
        });
    }
    NonNull::new(ptr.cast()).ok_or(BufferError::Map {
        len,
        source: io::Error::from_raw_os_error(libc::EINVAL),
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use proptest::prelude::*;

    use super::*;

    const CAP: usize = 64 * 1024;

    fn anon(capacity: usize) -> Buffer {
        Buffer::alloc(capacity, BufferOptions::default(), "test").expect("alloc")
    }

    #[test]
    fn alloc_starts_empty_with_requested_capacity() {
        let b = anon(CAP);
        assert_eq!(b.capacity(), CAP);
        assert_eq!(b.len(), 0);
        assert_eq!(b.room(), CAP);
        assert!(b.is_empty());
        assert!(b.memfd().is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            Buffer::alloc(0, BufferOptions::default(), "test"),
            Err(BufferError::ZeroCapacity)
        ));
    }

    #[test]
    fn advance_and_clear_track_occupancy() {
        let mut b = anon(CAP);
        b.spare_mut()[..3].copy_from_slice(b"abc");
        b.advance(3);
        assert_eq!(b.len(), 3);
        assert_eq!(b.room(), CAP - 3);
        assert_eq!(b.filled(), b"abc");

        b.spare_mut()[..2].copy_from_slice(b"de");
        b.advance(2);
        assert_eq!(b.filled(), b"abcde");

        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.room(), CAP);
        // Capacity never changes.
        assert_eq!(b.capacity(), CAP);
    }

    #[test]
    #[should_panic(expected = "exceeds room")]
    fn advance_past_capacity_panics() {
        let mut b = anon(1024);
        b.advance(1025);
    }

    #[test]
    fn memfd_mapping_is_backed_by_the_descriptor() {
        let opts = BufferOptions {
            memfd: true,
            ..BufferOptions::default()
        };
        let mut b = Buffer::alloc(CAP, opts, "io-buffer-test").expect("memfd alloc");
        let fd = b.memfd().expect("memfd present").try_clone_to_owned().expect("dup");

        // Bytes written through the mapping must be readable from the fd,
        // otherwise the sendfile output path would emit stale zeros.
        let payload = b"through the mapping";
        b.spare_mut()[..payload.len()].copy_from_slice(payload);
        b.advance(payload.len());

        let mut file = File::from(fd);
        let mut back = vec![0u8; payload.len()];
        file.read_exact(&mut back).expect("read memfd");
        assert_eq!(&back, payload);
    }

    #[test]
    fn memfd_name_with_nul_is_rejected() {
        let opts = BufferOptions {
            memfd: true,
            ..BufferOptions::default()
        };
        assert!(matches!(
            Buffer::alloc(CAP, opts, "bad\0name"),
            Err(BufferError::InvalidName)
        ));
    }

    #[test]
    fn metadata_stamp_overwrites_previous_record() {
        let mut b = anon(1024);
        b.meta_mut().stamp("cam0", 0);
        assert_eq!(b.meta().name(), "cam0");
        assert_eq!(b.meta().seqno(), 0);

        b.meta_mut().stamp("cam1", 7);
        assert_eq!(b.meta().name(), "cam1");
        assert_eq!(b.meta().seqno(), 7);
    }

    proptest! {
        #[test]
        fn stamped_names_never_exceed_the_limit(name in ".{0,200}", seqno in any::<u64>()) {
            let mut meta = Metadata::default();
            meta.stamp(&name, seqno);
            prop_assert!(meta.name().len() <= MAX_NAME_LEN);
            prop_assert!(name.starts_with(meta.name()));
            prop_assert_eq!(meta.seqno(), seqno);
        }
    }
}
