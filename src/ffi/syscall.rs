//! Thin wrappers over the raw calls this crate drives, shaped for
//! their single use here rather than for generality.

use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::{null_mut, NonNull};

use libc::epoll_event;

use super::Attr;

// The libc convention: one sentinel return value, errno holds the
// actual failure.
fn check<T: PartialEq + Copy>(ret: T, sentinel: T) -> Result<T> {
    if ret == sentinel {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub fn perf_event_open(attr: &Attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> Result<File> {
    let ret = unsafe { libc::syscall(libc::SYS_perf_event_open, attr, pid, cpu, group_fd, flags) };
    check(ret, -1).map(|fd| unsafe { File::from_raw_fd(fd as _) })
}

pub fn ioctl_arg(file: &File, op: u64, arg: u64) -> Result<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), op as _, arg) };
    check(ret, -1).map(drop)
}

/// Maps `len` bytes of `file` shared and read-write, the only way a
/// perf ring is ever mapped.
pub fn mmap_shared(file: &File, len: usize) -> Result<NonNull<u8>> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    // https://github.com/torvalds/linux/blob/v6.13/kernel/events/core.c#L6582
    let ptr = unsafe {
        libc::mmap(
            null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    let ptr = check(ptr, libc::MAP_FAILED)?;
    NonNull::new(ptr.cast()).ok_or_else(|| Error::other("mmap returned null"))
}

pub unsafe fn munmap(ptr: NonNull<u8>, len: usize) -> Result<()> {
    let ret = libc::munmap(ptr.as_ptr().cast(), len);
    check(ret, -1).map(drop)
}

pub fn epoll_create1(flags: i32) -> Result<File> {
    let ret = unsafe { libc::epoll_create1(flags) };
    check(ret, -1).map(|fd| unsafe { File::from_raw_fd(fd) })
}

/// Registers `file` with `epoll` for read readiness.
pub fn epoll_add(epoll: &File, file: &File) -> Result<()> {
    let mut ev = epoll_event {
        events: libc::EPOLLIN as u32,
        u64: file.as_raw_fd() as u64,
    };
    let ret = unsafe {
        libc::epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            file.as_raw_fd(),
            &mut ev,
        )
    };
    check(ret, -1).map(drop)
}

/// Waits for readiness on anything registered with `epoll`; returns
/// how many descriptors are ready.
pub fn epoll_wait(epoll: &File, events: &mut [epoll_event], timeout: i32) -> Result<usize> {
    let ret = unsafe {
        libc::epoll_wait(
            epoll.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as _,
            timeout,
        )
    };
    check(ret, -1).map(|n| n as usize)
}
