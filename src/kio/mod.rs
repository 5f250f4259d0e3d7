//! The OS side: an io_uring completion ring and the syscalls around it.

pub mod buffer;
pub mod net;
pub mod task;
mod ring;

pub use ring::Ring;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::error::Result;

pub fn close(fd: RawFd) -> Result<()> {
    Errno::result(unsafe { libc::close(fd) })?;
    Ok(())
}

/// An eventfd the ring keeps a read armed on, so other threads can pull the
/// ring leader out of the kernel.
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        // Blocking, so the ring parks the read until somebody writes.
        let fd = Errno::result(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn notify(&self) {
        let one = 1u64.to_ne_bytes();
        let ret = unsafe { libc::write(self.fd(), one.as_ptr() as *const libc::c_void, one.len()) };
        if ret < 0 {
            tracing::warn!(error = %Errno::last(), "failed to ring the notifier");
        }
    }
}
