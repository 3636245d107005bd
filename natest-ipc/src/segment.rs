// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Named shared-memory segments (§4.C), the mailbox each [`crate::message`]
//! is carried in.
//!
//! Grounded on `datadog-ipc::platform::unix::mem_handle`'s use of
//! `shm_open`/`mmap`/`ftruncate`: a segment is a POSIX shared-memory object,
//! created by one side and opened read-write by the other once its name has
//! travelled over the socket in a packet (§4.B). Inside the segment, data is
//! laid out by a simple bump allocator; callers never free individual
//! allocations, only the whole segment at once.

use crate::error::SegmentError;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Sentinel written into a pointer field to mean "null" (§3: "Invariants").
/// Reserved rather than `0` because `0` is a legitimate offset -- the first
/// byte of the segment is routinely occupied by the payload header itself.
pub const NULL_OFFSET: u32 = u32::MAX;

/// A byte offset from the base of a [`Segment`]. Position-independent: valid
/// in either process once the segment is mapped, unlike a raw pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Offset(pub u32);

impl Offset {
    pub const NULL: Offset = Offset(NULL_OFFSET);

    pub fn is_null(self) -> bool {
        self.0 == NULL_OFFSET
    }
}

static SEGMENT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Builds the next segment name for this process, per §6 "Segment naming":
/// `/natest_{pid}_{socket_fd}_{counter}`.
pub fn next_segment_name(socket_fd: i32) -> String {
    let counter = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/natest_{}_{}_{}", std::process::id(), socket_fd, counter)
}

/// A mapped, named shared-memory region with a bump allocator.
///
/// `owner` is true for the side that created (and therefore may need to
/// unlink) the segment; the receiving side only opens and maps it.
pub struct Segment {
    path: String,
    fd: OwnedFd,
    base: NonNull<u8>,
    size: usize,
    cursor: Cell<usize>,
    owner: bool,
}

// Safety: a `Segment` wraps a POSIX shared-memory mapping and an owned fd.
// Both are only ever accessed from one thread at a time in this crate (the
// token mutex in natest-core serializes child-side use); there is nothing
// thread-unsafe about moving the handle itself between threads.
unsafe impl Send for Segment {}

impl Segment {
    /// Creates a brand-new segment of at least `size` bytes and maps it.
    /// The backing object is rounded up to a whole number of pages: `mmap`
    /// only ever hands back page-aligned mappings, so rounding here means
    /// [`Segment::size`] always reflects the space actually usable rather
    /// than an under-count that would make the last partial page
    /// unreachable through `alloc`.
    pub fn create(path: String, size: usize) -> Result<Segment, SegmentError> {
        let size = round_up_to_page(size);
        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| SegmentError::Create {
            path: path.clone(),
            source,
        })?;
        ftruncate(&fd, size as libc::off_t).map_err(|source| SegmentError::Create {
            path: path.clone(),
            source,
        })?;
        let base = map(&fd, size, &path, true)?;
        log::debug!(target: "natest", "segment {path}: created ({size} bytes)");
        Ok(Segment {
            path,
            fd,
            base,
            size,
            cursor: Cell::new(0),
            owner: true,
        })
    }

    /// Opens a segment created by the other side of the connection, named in
    /// a received `Message` packet.
    pub fn open(path: String, size: usize) -> Result<Segment, SegmentError> {
        let fd =
            shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|source| {
                SegmentError::Open {
                    path: path.clone(),
                    source,
                }
            })?;
        let base = map(&fd, size, &path, false)?;
        Ok(Segment {
            path,
            fd,
            base,
            size,
            cursor: Cell::new(0),
            owner: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Unlinks the backing shared-memory object. Per §3 "a message segment
    /// is unlinked exactly once": callers must ensure this runs on at most
    /// one side of a given message (see `Message::free` in
    /// [`crate::message`]).
    pub fn unlink(&self) -> Result<(), SegmentError> {
        shm_unlink(self.path.as_str()).map_err(|source| SegmentError::Open {
            path: self.path.clone(),
            source,
        })?;
        log::debug!(target: "natest", "segment {}: unlinked", self.path);
        Ok(())
    }

    /// Bump-allocates `len` bytes (8-byte aligned) from the segment and
    /// returns the offset of the first byte. Returns
    /// [`SegmentError::OutOfSpace`] once the segment is exhausted; never
    /// reuses or overlaps a previous allocation (§8 invariant 4).
    pub fn alloc(&self, len: usize) -> Result<Offset, SegmentError> {
        let aligned = (self.cursor.get() + 7) & !7;
        let end = aligned
            .checked_add(len)
            .ok_or(SegmentError::OutOfSpace {
                requested: len,
                available: self.size.saturating_sub(aligned),
            })?;
        if end > self.size {
            return Err(SegmentError::OutOfSpace {
                requested: len,
                available: self.size.saturating_sub(aligned),
            });
        }
        self.cursor.set(end);
        Ok(Offset(aligned as u32))
    }

    fn check_bounds(&self, offset: Offset, len: usize) -> Result<(), SegmentError> {
        let start = offset.0 as usize;
        let end = start
            .checked_add(len)
            .ok_or(SegmentError::OutOfBounds {
                offset: offset.0,
                size: self.size,
            })?;
        if end > self.size {
            return Err(SegmentError::OutOfBounds {
                offset: offset.0,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Writes raw bytes at `offset`. The caller must already have allocated
    /// the range (normally via [`Segment::alloc`]).
    pub fn write_bytes(&self, offset: Offset, bytes: &[u8]) -> Result<(), SegmentError> {
        self.check_bounds(offset, bytes.len())?;
        // Safety: `check_bounds` proved `[offset, offset+len)` lies within
        // the mapped region, and the segment is exclusively owned by one
        // side at a time per message (§5 "Shared resources").
        unsafe {
            let dst = self.base.as_ptr().add(offset.0 as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// Reads `len` raw bytes starting at `offset`.
    pub fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>, SegmentError> {
        self.check_bounds(offset, len)?;
        // Safety: bounds checked above.
        let slice = unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset.0 as usize), len)
        };
        Ok(slice.to_vec())
    }

    /// Allocates space for, and writes, a `Copy` POD value. Both processes
    /// must agree on `T`'s layout, which holds here because parent and
    /// child are always the same compiled binary (§1 scope).
    pub fn alloc_write<T: Copy>(&self, value: T) -> Result<Offset, SegmentError> {
        let offset = self.alloc(std::mem::size_of::<T>())?;
        self.write_at(offset, value)?;
        Ok(offset)
    }

    pub fn write_at<T: Copy>(&self, offset: Offset, value: T) -> Result<(), SegmentError> {
        self.check_bounds(offset, std::mem::size_of::<T>())?;
        // Safety: bounds checked; `T: Copy` rules out drop-glue surprises.
        unsafe {
            let dst = self.base.as_ptr().add(offset.0 as usize) as *mut T;
            std::ptr::write_unaligned(dst, value);
        }
        Ok(())
    }

    pub fn read_at<T: Copy>(&self, offset: Offset) -> Result<T, SegmentError> {
        self.check_bounds(offset, std::mem::size_of::<T>())?;
        // Safety: bounds checked above.
        unsafe {
            let src = self.base.as_ptr().add(offset.0 as usize) as *const T;
            Ok(std::ptr::read_unaligned(src))
        }
    }

    /// Writes `s` plus a trailing NUL and returns the offset of its first
    /// byte -- the "null-string field" case of §4.D's pointer-field walk.
    pub fn alloc_cstr(&self, s: &str) -> Result<Offset, SegmentError> {
        let offset = self.alloc(s.len() + 1)?;
        self.write_bytes(offset, s.as_bytes())?;
        self.write_bytes(Offset(offset.0 + s.len() as u32), &[0u8])?;
        Ok(offset)
    }

    /// Reads a NUL-terminated string starting at `offset`.
    pub fn read_cstr(&self, offset: Offset) -> Result<String, SegmentError> {
        let start = offset.0 as usize;
        if start >= self.size {
            return Err(SegmentError::OutOfBounds {
                offset: offset.0,
                size: self.size,
            });
        }
        // Safety: `start < self.size` checked above; the scan below never
        // reads past `self.size` because it stops at the first NUL or at
        // the end of the mapping, whichever comes first.
        let remaining = unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(start), self.size - start)
        };
        let nul_at = remaining
            .iter()
            .position(|&b| b == 0)
            .ok_or(SegmentError::OutOfBounds {
                offset: offset.0,
                size: self.size,
            })?;
        Ok(String::from_utf8_lossy(&remaining[..nul_at]).into_owned())
    }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

fn map(fd: &OwnedFd, size: usize, path: &str, is_create: bool) -> Result<NonNull<u8>, SegmentError> {
    let len = NonZeroUsize::new(size).ok_or_else(|| SegmentError::OutOfSpace {
        requested: size,
        available: 0,
    })?;
    // Safety: `fd` is a valid, open file descriptor for a shared-memory
    // object at least `size` bytes long (guaranteed by `ftruncate` on
    // create, or by the creator on open).
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    }
    .map_err(|source| {
        if is_create {
            SegmentError::Create {
                path: path.to_string(),
                source,
            }
        } else {
            SegmentError::Map {
                path: path.to_string(),
                source,
            }
        }
    })?;
    NonNull::new(ptr.as_ptr() as *mut u8).ok_or_else(|| SegmentError::Map {
        path: path.to_string(),
        source: nix::Error::EINVAL,
    })
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Safety: `self.base`/`self.size` describe exactly the mapping
        // created in `create`/`open`.
        unsafe {
            let _ = munmap(self.base, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_segment(size: usize) -> Segment {
        let path = format!("/natest_test_{}_{}", std::process::id(), fastrand_like());
        Segment::create(path, size).expect("create segment")
    }

    // Avoids pulling in a dependency just for test-only randomness.
    fn fastrand_like() -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos()
            .wrapping_add(std::process::id())
    }

    #[test]
    fn alloc_returns_disjoint_monotonic_ranges() {
        let seg = temp_segment(256);
        let a = seg.alloc(16).unwrap();
        let b = seg.alloc(16).unwrap();
        assert!(a.0 + 16 <= b.0, "allocations must not overlap");
        seg.unlink().ok();
    }

    #[test]
    fn alloc_fails_once_exhausted_without_corrupting_earlier_allocations() {
        let seg = temp_segment(32);
        let a = seg.alloc(16).unwrap();
        seg.write_bytes(a, &[0xAB; 16]).unwrap();
        let overflow = seg.alloc(seg.size() + 1);
        assert!(overflow.is_err());
        assert_eq!(seg.read_bytes(a, 16).unwrap(), vec![0xAB; 16]);
        seg.unlink().ok();
    }

    #[test]
    fn cstr_round_trips() {
        let seg = temp_segment(256);
        let offset = seg.alloc_cstr("hello world").unwrap();
        assert_eq!(seg.read_cstr(offset).unwrap(), "hello world");
        seg.unlink().ok();
    }

    #[test]
    fn pod_round_trips() {
        #[derive(Clone, Copy, Debug, PartialEq)]
        struct Pair(u32, u32);
        let seg = temp_segment(64);
        let offset = seg.alloc_write(Pair(7, 9)).unwrap();
        assert_eq!(seg.read_at::<Pair>(offset).unwrap(), Pair(7, 9));
        seg.unlink().ok();
    }

    #[test]
    fn out_of_bounds_offset_is_rejected() {
        let seg = temp_segment(16);
        let err = seg.read_bytes(Offset(1000), 4);
        assert!(matches!(err, Err(SegmentError::OutOfBounds { .. })));
        seg.unlink().ok();
    }
}
