//! The per-CPU perf ring.
//!
//! One metadata page followed by a power-of-two data region, shared
//! with the kernel. The kernel is the single producer (publishing
//! `data_head` with release semantics), this crate the single
//! consumer (publishing `data_tail` likewise). The consumer keeps a
//! private shadow tail so several records can be decoded before the
//! kernel learns the space is free.

use std::fs::File;
use std::io;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::ffi::syscall::{mmap_shared, munmap};
use crate::ffi::{Metadata, PAGE_SIZE};

/// Data-region pages per ring. Must be a power of two.
pub(crate) const RING_PAGES: usize = 16;

const HEADER_SIZE: usize = size_of::<crate::ffi::bindings::perf_event_header>();

/// Linearization buffer for records that wrap the data region.
/// 8-byte aligned so decoded fields stay naturally aligned; any
/// record claiming to be larger than this is malformed.
#[repr(align(8))]
pub(crate) struct Scratch([u8; Scratch::SIZE]);

impl Scratch {
    pub(crate) const SIZE: usize = 4096;

    fn new() -> Box<Self> {
        Box::new(Scratch([0; Self::SIZE]))
    }
}

/// Shared-memory mapping of one ring.
struct Arena {
    ptr: NonNull<u8>,
    len: usize,
}

impl Arena {
    fn new(file: &File, len: usize) -> io::Result<Self> {
        let ptr = mmap_shared(file, len)?;
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            panic!("failed to unmap ring: {}", e);
        }
    }
}

/// The reader over one ring's borrowed parts. Separate from the
/// mapping so the protocol can be exercised over plain memory.
pub(crate) struct Rb<'a> {
    data: &'a [u8],
    head: &'a AtomicU64,
    tail: &'a AtomicU64,
    tmp_tail: &'a mut u64,
    scratch: &'a mut Scratch,
}

impl<'a> Rb<'a> {
    pub(crate) fn new(
        data: &'a [u8],
        head: &'a AtomicU64,
        tail: &'a AtomicU64,
        tmp_tail: &'a mut u64,
        scratch: &'a mut Scratch,
    ) -> Self {
        debug_assert!(data.len().is_power_of_two());
        Self {
            data,
            head,
            tail,
            tmp_tail,
            scratch,
        }
    }

    /// Extracts the next record, advancing the shadow tail past it.
    ///
    /// The returned bytes point either into the mapping or into the
    /// scratch buffer and stay valid until the next `read` on this
    /// ring. `Ok(None)` means no complete record is available.
    pub(crate) fn read(&mut self) -> Result<Option<&[u8]>> {
        let size = self.data.len();
        let mask = (size - 1) as u64;

        // About acquire:
        // https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L720
        // https://github.com/torvalds/linux/blob/v6.13/kernel/events/ring_buffer.c#L99
        let head = self.head.load(Ordering::Acquire);
        let tail = *self.tmp_tail;
        let avail = head.wrapping_sub(tail);
        if avail < HEADER_SIZE as u64 {
            return Ok(None);
        }

        // The header may itself straddle the wrap point.
        let off = (tail & mask) as usize;
        let leftcont = size - off;
        let mut header = [0; HEADER_SIZE];
        if leftcont >= HEADER_SIZE {
            header.copy_from_slice(&self.data[off..off + HEADER_SIZE]);
        } else {
            header[..leftcont].copy_from_slice(&self.data[off..]);
            header[leftcont..].copy_from_slice(&self.data[..HEADER_SIZE - leftcont]);
        }
        let record_len = u16::from_ne_bytes([header[6], header[7]]) as usize;

        if avail < record_len as u64 {
            return Ok(None);
        }
        if record_len < HEADER_SIZE {
            return Err(Error::RecordTruncated { size: record_len });
        }
        if record_len > Scratch::SIZE {
            return Err(Error::RecordTooBig { size: record_len });
        }

        *self.tmp_tail = tail + record_len as u64;

        if record_len <= leftcont {
            return Ok(Some(&self.data[off..off + record_len]));
        }

        // Wrapped: linearize the end fragment plus the begin fragment.
        self.scratch.0[..leftcont].copy_from_slice(&self.data[off..]);
        self.scratch.0[leftcont..record_len].copy_from_slice(&self.data[..record_len - leftcont]);
        Ok(Some(&self.scratch.0[..record_len]))
    }

    /// Publishes the shadow tail, telling the kernel the space up to
    /// it is free again.
    pub(crate) fn consume(&mut self) {
        // https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L723
        self.tail.store(*self.tmp_tail, Ordering::Release);
    }
}

/// A mapped ring bound to a perf fd.
pub(crate) struct PerfMmap {
    arena: Arena,
    tmp_tail: u64,
    scratch: Box<Scratch>,
}

impl PerfMmap {
    pub(crate) fn new(file: &File) -> io::Result<Self> {
        let len = (1 + RING_PAGES) * *PAGE_SIZE;
        let arena = Arena::new(file, len)?;
        let tmp_tail = {
            let metadata = unsafe { &*(arena.as_slice().as_ptr() as *const Metadata) };
            metadata.data_tail
        };
        Ok(Self {
            arena,
            tmp_tail,
            scratch: Scratch::new(),
        })
    }

    pub(crate) fn data_size() -> usize {
        RING_PAGES * *PAGE_SIZE
    }

    pub(crate) fn rb(&mut self) -> Rb<'_> {
        let alloc = self.arena.as_slice();
        let metadata = unsafe { &mut *(alloc.as_ptr() as *mut Metadata) };
        // https://github.com/torvalds/linux/blob/v6.13/kernel/events/core.c#L6212
        let data = &alloc[*PAGE_SIZE..];
        let head = unsafe { AtomicU64::from_ptr(&mut metadata.data_head as _) };
        let tail = unsafe { AtomicU64::from_ptr(&mut metadata.data_tail as _) };
        Rb::new(data, head, tail, &mut self.tmp_tail, &mut self.scratch)
    }
}

#[cfg(test)]
mod test;
