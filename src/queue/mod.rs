use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use enum_dispatch::enum_dispatch;

use crate::error::{Error, Result};

mod file;
mod memory;
mod network;

pub use file::FileQueue;
pub use memory::MemoryQueue;
pub use network::NetworkQueue;

/// Queue descriptor. OS-backed queues reuse their file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Qd(pub i32);

impl fmt::Display for Qd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Network,
    File,
    Memory,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueKind::Network => "network",
            QueueKind::File => "file",
            QueueKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// The synchronous half of the queue contract. Push, pop, accept and connect
/// go through the runtime because they need a token.
#[enum_dispatch]
pub trait QueueOps {
    fn qd(&self) -> Qd;

    fn kind(&self) -> QueueKind;

    /// The OS descriptor backing this queue, if there is one.
    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn bind(&self, _addr: &SocketAddr) -> Result<()> {
        Err(Error::unsupported("bind", self.kind()))
    }

    fn listen(&self, _backlog: i32) -> Result<()> {
        Err(Error::unsupported("listen", self.kind()))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Err(Error::unsupported("local_addr", self.kind()))
    }

    /// Release the underlying resource.
    fn close(&self) -> Result<()>;
}

#[enum_dispatch(QueueOps)]
pub enum Queue {
    Network(NetworkQueue),
    File(FileQueue),
    Memory(MemoryQueue),
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("qd", &self.qd())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_defaults() {
        let queue = Queue::from(MemoryQueue::new(Qd(1 << 30)));
        assert_eq!(queue.kind(), QueueKind::Memory);
        assert_eq!(queue.qd(), Qd(1 << 30));
        assert_eq!(queue.fd(), None);
        assert!(matches!(
            queue.listen(3),
            Err(Error::Unsupported { op: "listen", kind: QueueKind::Memory })
        ));
        assert!(queue.close().is_ok());
    }
}
