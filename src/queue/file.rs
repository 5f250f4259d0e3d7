use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;

use super::{Qd, QueueKind, QueueOps};
use crate::error::{Error, Result};
use crate::kio;

/// A file opened through the runtime. Only its lifecycle is managed; pushing
/// and popping data is not implemented for files.
pub struct FileQueue {
    fd: RawFd,
    released: AtomicBool,
}

impl FileQueue {
    pub fn open(path: &Path, flags: OFlag, mode: Mode) -> Result<Self> {
        let fd = fcntl::open(path, flags | OFlag::O_CLOEXEC, mode)?;
        Ok(Self {
            fd,
            released: AtomicBool::new(false),
        })
    }
}

impl QueueOps for FileQueue {
    fn qd(&self) -> Qd {
        Qd(self.fd)
    }

    fn kind(&self) -> QueueKind {
        QueueKind::File
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::NotFound(self.qd()));
        }

        kio::close(self.fd)
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let _ = kio::close(self.fd);
        }
    }
}
