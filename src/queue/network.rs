use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{Qd, QueueKind, QueueOps};
use crate::error::{Error, Result};
use crate::kio::{self, net};

static NEXT_LANE: AtomicU64 = AtomicU64::new(1);

/// A socket whose push/pop/accept/connect run on the ring.
pub struct NetworkQueue {
    fd: RawFd,
    lane: u64,                 // identifies this queue's operations on the ring
    aborted: AtomicBool,       // no new ring operations once set
    released: AtomicBool,      // the descriptor has been closed
}

impl NetworkQueue {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            lane: NEXT_LANE.fetch_add(1, Ordering::Relaxed),
            aborted: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn lane(&self) -> u64 {
        self.lane
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    // Only called with the ring state locked.
    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

impl QueueOps for NetworkQueue {
    fn qd(&self) -> Qd {
        Qd(self.fd)
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Network
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn bind(&self, addr: &SocketAddr) -> Result<()> {
        net::bind(self.fd, addr)
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        net::listen(self.fd, backlog)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        net::local_addr(self.fd)
    }

    fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::NotFound(self.qd()));
        }

        net::shutdown(self.fd);
        kio::close(self.fd)
    }
}

impl Drop for NetworkQueue {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let _ = kio::close(self.fd);
        }
    }
}
