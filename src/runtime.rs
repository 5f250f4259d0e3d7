use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::completion::{Opcode, QResult};
use crate::error::{Error, Result};
use crate::kio::{net, Notifier, Ring};
use crate::queue::{FileQueue, MemoryQueue, NetworkQueue, Qd, Queue, QueueKind, QueueOps};
use crate::registry::Registry;
use crate::sga::Sga;
use crate::token::{Completions, QToken};

/// Settings for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    ring_entries: u32,
    recv_buffer_size: usize,
    pooled_buffers: usize,
    memory_qd_base: i32,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            ring_entries: 256,
            recv_buffer_size: 2048,
            pooled_buffers: 64,
            memory_qd_base: 1 << 30,
        }
    }
}

impl RuntimeBuilder {
    /// Submission queue size of the ring.
    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    /// Bytes handed to each network receive.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Released receive buffers kept around for reuse.
    pub fn pooled_buffers(mut self, count: usize) -> Self {
        self.pooled_buffers = count;
        self
    }

    /// First descriptor handed to memory queues. Must stay clear of any OS
    /// descriptor the process could open.
    pub fn memory_qd_base(mut self, base: i32) -> Self {
        self.memory_qd_base = base;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let notifier = Arc::new(Notifier::new()?);
        let registry = Arc::new(Registry::new());

        let ring = Ring::new(
            self.ring_entries,
            self.recv_buffer_size,
            self.pooled_buffers,
            notifier.clone(),
            registry.clone(),
        )?;

        tracing::debug!(config = ?self, "runtime started");

        Ok(Runtime {
            ring,
            completions: Completions::new(Some(notifier)),
            registry,
            next_memory: AtomicI64::new(self.memory_qd_base.into()),
        })
    }
}

/// One asynchronous interface over sockets, files and in-process queues.
///
/// Every push, pop, accept and connect returns a [`QToken`] straight away; the
/// wait family turns tokens into results. Share it between threads with an
/// `Arc`.
pub struct Runtime {
    ring: Ring,
    completions: Completions,
    registry: Arc<Registry>,
    next_memory: AtomicI64, // one past i32::MAX once the space is used up
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn create_network_queue(&self, domain: i32, ty: i32, protocol: i32) -> Result<Qd> {
        let fd = net::socket(domain, ty, protocol)?;
        let qd = Qd(fd);

        // A failed insert drops the queue, which closes the socket.
        self.registry.insert(qd, NetworkQueue::new(fd))?;

        tracing::debug!(%qd, "created network queue");
        Ok(qd)
    }

    pub fn create_file_queue<P: AsRef<Path>>(&self, path: P, flags: OFlag, mode: Mode) -> Result<Qd> {
        let queue = FileQueue::open(path.as_ref(), flags, mode)?;
        let qd = queue.qd();

        self.registry.insert(qd, queue)?;

        tracing::debug!(%qd, path = %path.as_ref().display(), "opened file queue");
        Ok(qd)
    }

    /// Create or truncate a file for writing, like `creat(2)`.
    pub fn create_file<P: AsRef<Path>>(&self, path: P, mode: Mode) -> Result<Qd> {
        let flags = OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC;
        self.create_file_queue(path, flags, mode)
    }

    /// Fails with `Transport(EMFILE)` once every descriptor from the base up to
    /// `i32::MAX` has been handed out.
    pub fn create_memory_queue(&self) -> Result<Qd> {
        let next = self
            .next_memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= i32::MAX as i64).then(|| next + 1)
            })
            .map_err(|_| Error::Transport(libc::EMFILE))?;

        let qd = Qd(next as i32);
        self.registry.insert(qd, MemoryQueue::new(qd))?;

        tracing::debug!(%qd, "created memory queue");
        Ok(qd)
    }

    pub fn bind(&self, qd: Qd, addr: SocketAddr) -> Result<()> {
        self.registry.get(qd)?.bind(&addr)
    }

    pub fn listen(&self, qd: Qd, backlog: i32) -> Result<()> {
        self.registry.get(qd)?.listen(backlog)
    }

    pub fn local_addr(&self, qd: Qd) -> Result<SocketAddr> {
        self.registry.get(qd)?.local_addr()
    }

    pub fn accept(&self, qd: Qd) -> Result<QToken> {
        let queue = self.registry.get(qd)?;
        match &*queue {
            Queue::Network(network) => {
                let token = self.completions.issue(qd, Opcode::Accept, true);
                self.ring.accept(network, token, &self.completions);
                Ok(token)
            }
            other => Err(Error::unsupported("accept", other.kind())),
        }
    }

    pub fn connect(&self, qd: Qd, addr: SocketAddr) -> Result<QToken> {
        let queue = self.registry.get(qd)?;
        match &*queue {
            Queue::Network(network) => {
                let token = self.completions.issue(qd, Opcode::Connect, true);
                self.ring.connect(network, token, &addr, &self.completions);
                Ok(token)
            }
            other => Err(Error::unsupported("connect", other.kind())),
        }
    }

    /// Queue `sga` for sending. The buffer is owned by the runtime until the
    /// token resolves.
    pub fn push(&self, qd: Qd, sga: Sga) -> Result<QToken> {
        let queue = self.registry.get(qd)?;
        match &*queue {
            Queue::Network(network) => {
                let token = self.completions.issue(qd, Opcode::Push, true);
                self.ring.push(network, token, sga, &self.completions);
                Ok(token)
            }
            Queue::Memory(memory) => {
                let token = self.completions.issue(qd, Opcode::Push, false);
                memory.push(&self.completions, token, sga);
                Ok(token)
            }
            Queue::File(_) => Err(Error::unimplemented("push", QueueKind::File)),
        }
    }

    pub fn pop(&self, qd: Qd) -> Result<QToken> {
        let queue = self.registry.get(qd)?;
        match &*queue {
            Queue::Network(network) => {
                let token = self.completions.issue(qd, Opcode::Pop, true);
                self.ring.pop(network, token, &self.completions);
                Ok(token)
            }
            Queue::Memory(memory) => {
                let token = self.completions.issue(qd, Opcode::Pop, false);
                memory.pop(&self.completions, token);
                Ok(token)
            }
            Queue::File(_) => Err(Error::unimplemented("pop", QueueKind::File)),
        }
    }

    /// Close the queue. Every operation still outstanding on it resolves with
    /// `ConnectionAborted`.
    pub fn close(&self, qd: Qd) -> Result<()> {
        let queue = self.registry.remove(qd)?;

        match &*queue {
            Queue::Network(network) => self.ring.abort(network, &self.completions),
            Queue::Memory(memory) => memory.abort(&self.completions),
            Queue::File(_) => {}
        }

        tracing::debug!(%qd, kind = %queue.kind(), open = self.registry.len(), "closed queue");
        queue.close()
    }

    /// Block until the token resolves and consume it.
    pub fn wait(&self, token: QToken) -> Result<QResult> {
        self.completions
            .wait(&self.ring, token, None)?
            .ok_or(Error::InvalidToken(token))
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout` and leaves the
    /// token pending.
    pub fn wait_timeout(&self, token: QToken, timeout: Duration) -> Result<Option<QResult>> {
        self.completions.wait(&self.ring, token, Some(Instant::now() + timeout))
    }

    /// Block until any token resolves; consumes the lowest-indexed ready one.
    pub fn wait_any(&self, tokens: &[QToken]) -> Result<(usize, QResult)> {
        self.completions.wait_any(&self.ring, tokens, None)?.ok_or(Error::NoTokens)
    }

    pub fn wait_any_timeout(&self, tokens: &[QToken], timeout: Duration) -> Result<Option<(usize, QResult)>> {
        self.completions
            .wait_any(&self.ring, tokens, Some(Instant::now() + timeout))
    }

    /// Block until every token resolves. Results come back in token order,
    /// failed operations included.
    pub fn wait_all(&self, tokens: &[QToken]) -> Result<Vec<QResult>> {
        self.completions.wait_all(&self.ring, tokens)
    }

    /// The OS descriptor behind a network or file queue.
    pub fn descriptor_of(&self, qd: Qd) -> Result<RawFd> {
        let queue = self.registry.get(qd)?;
        queue
            .fd()
            .ok_or_else(|| Error::unsupported("descriptor_of", queue.kind()))
    }

    /// Hand a buffer back so future network pops can reuse it.
    pub fn release(&self, sga: Sga) {
        self.ring.release(sga)
    }

    pub fn has_queue(&self, qd: Qd) -> bool {
        self.registry.has(qd)
    }

    /// Tokens issued and not yet consumed by a wait.
    pub fn outstanding(&self) -> usize {
        self.completions.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::QValue;

    #[test]
    fn memory_qds_start_at_base() {
        let runtime = Runtime::builder().memory_qd_base(5_000).build().unwrap();
        assert_eq!(runtime.create_memory_queue().unwrap(), Qd(5_000));
        assert_eq!(runtime.create_memory_queue().unwrap(), Qd(5_001));
    }

    #[test]
    fn shared_between_threads() {
        fn shareable<T: Send + Sync>() {}
        shareable::<Runtime>();
    }

    #[test]
    fn memory_qds_never_wrap() {
        let runtime = Runtime::builder().memory_qd_base(i32::MAX - 1).build().unwrap();
        assert_eq!(runtime.create_memory_queue().unwrap(), Qd(i32::MAX - 1));
        assert_eq!(runtime.create_memory_queue().unwrap(), Qd(i32::MAX));

        for _ in 0..3 {
            assert!(matches!(runtime.create_memory_queue(), Err(Error::Transport(libc::EMFILE))));
        }
    }

    #[test]
    fn unknown_qd() {
        let runtime = Runtime::new().unwrap();
        assert!(matches!(runtime.pop(Qd(77_777)), Err(Error::NotFound(Qd(77_777)))));
        assert!(matches!(runtime.close(Qd(77_777)), Err(Error::NotFound(_))));
        assert!(!runtime.has_queue(Qd(77_777)));
    }

    #[test]
    fn memory_push_is_empty() {
        let runtime = Runtime::new().unwrap();
        let qd = runtime.create_memory_queue().unwrap();

        let push = runtime.push(qd, Sga::from("hi")).unwrap();
        let result = runtime.wait(push).unwrap();
        assert_eq!(result.opcode, Opcode::Push);
        assert!(matches!(result.value, Ok(QValue::Empty)));

        let pop = runtime.pop(qd).unwrap();
        assert_eq!(runtime.wait(pop).unwrap().into_sga().unwrap().to_vec(), b"hi");
        assert_eq!(runtime.outstanding(), 0);
    }

    #[test]
    fn accept_needs_network() {
        let runtime = Runtime::new().unwrap();
        let qd = runtime.create_memory_queue().unwrap();
        assert!(matches!(
            runtime.accept(qd),
            Err(Error::Unsupported { op: "accept", kind: QueueKind::Memory })
        ));
        assert_eq!(runtime.outstanding(), 0);
    }
}
