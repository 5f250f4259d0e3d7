use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::squeue::Entry;
use io_uring::IoUring;

use parking_lot::Mutex;
use slab::Slab;

use super::net::SockAddr;
use super::task::{self, Task, TaskType};
use super::{buffer, Notifier};
use crate::completion::{Opcode, QResult, QValue};
use crate::error::{Error, Result};
use crate::queue::{NetworkQueue, Qd, QueueOps};
use crate::registry::Registry;
use crate::sga::Sga;
use crate::token::{Completions, Drive, QToken};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Read,  // pop and accept
    Write, // push and connect
}

#[derive(Clone, Copy)]
struct Op {
    token: QToken,
    qd: Qd,
    lane: u64,
    side: Side,
}

struct InFlight {
    task: TaskType,
    op: Option<Op>, // None for the ring's own wake, timeout and cancel tasks
    orphaned: bool, // the queue closed while the kernel still owned the task
}

struct Queued {
    token: QToken,
    qd: Qd,
    task: TaskType,
}

/// Per-queue ordering: one read and one write in flight at a time.
#[derive(Default)]
struct Lane {
    reads: VecDeque<Queued>,
    writes: VecDeque<Queued>,
    read_busy: bool,
    write_busy: bool,
    connecting: bool,
}

struct State {
    tasks: Slab<InFlight>,
    backlog: VecDeque<Entry>,
    lanes: HashMap<u64, Lane>,
    buffers: buffer::Pool,
    wake_armed: bool,
}

pub struct Ring {
    uring: IoUring,
    state: Mutex<State>,
    notifier: Arc<Notifier>,
    registry: Arc<Registry>,
}

impl Ring {
    pub fn new(
        entries: u32,
        recv_buffer_size: usize,
        pooled_buffers: usize,
        notifier: Arc<Notifier>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let uring = IoUring::new(entries)?;

        Ok(Self {
            uring,
            state: Mutex::new(State {
                tasks: Slab::with_capacity(entries as _),
                backlog: VecDeque::new(),
                lanes: HashMap::new(),
                buffers: buffer::Pool::new(recv_buffer_size, pooled_buffers),
                wake_armed: false,
            }),
            notifier,
            registry,
        })
    }

    pub fn accept(&self, queue: &NetworkQueue, token: QToken, completions: &Completions) {
        let task = task::Accept { fd: queue.qd().0 }.into();
        self.enqueue(queue, Side::Read, token, task, completions);
    }

    pub fn connect(&self, queue: &NetworkQueue, token: QToken, addr: &SocketAddr, completions: &Completions) {
        let task = task::Connect::new(queue.qd().0, SockAddr::from(addr)).into();
        self.enqueue(queue, Side::Write, token, task, completions);
    }

    pub fn pop(&self, queue: &NetworkQueue, token: QToken, completions: &Completions) {
        let buffer = self.state.lock().buffers.take();
        let task = task::Read { fd: queue.qd().0, buffer }.into();
        self.enqueue(queue, Side::Read, token, task, completions);
    }

    pub fn push(&self, queue: &NetworkQueue, token: QToken, sga: Sga, completions: &Completions) {
        let task = task::Write::new(queue.qd().0, sga).into();
        self.enqueue(queue, Side::Write, token, task, completions);
    }

    /// Hand segments back for future receives.
    pub fn release(&self, sga: Sga) {
        let mut state = self.state.lock();
        for segment in sga.into_segments() {
            state.buffers.give(segment);
        }
    }

    /// Stop all work on the queue. Queued operations are dropped, in-flight
    /// ones are cancelled, and every one of their tokens fails with
    /// `ConnectionAborted`.
    pub fn abort(&self, queue: &NetworkQueue, completions: &Completions) {
        let mut failed = Vec::new();

        {
            let mut state = self.state.lock();
            queue.set_aborted();

            if let Some(lane) = state.lanes.remove(&queue.lane()) {
                for queued in lane.reads.into_iter().chain(lane.writes) {
                    failed.push((queued.token, opcode(&queued.task), queued.qd));
                }
            }

            let mut cancel = Vec::new();
            for (key, flight) in state.tasks.iter_mut() {
                let op = match flight.op {
                    Some(op) if op.lane == queue.lane() && !flight.orphaned => op,
                    _ => continue,
                };

                flight.orphaned = true;
                failed.push((op.token, opcode(&flight.task), op.qd));
                cancel.push(key as u64);
            }

            for key in cancel {
                self.start(&mut state, task::Cancel { key }.into(), None);
            }

            if let Err(err) = self.flush(&mut state) {
                tracing::warn!(%err, "failed to submit cancellations");
            }
        }

        tracing::debug!(qd = %queue.qd(), failed = failed.len(), "aborted network queue");

        // Issue order, so waiters see the oldest failure first.
        failed.sort_by_key(|(token, _, _)| *token);
        for (token, opcode, qd) in failed {
            completions.resolve(token, QResult::aborted(opcode, qd));
        }
    }

    fn enqueue(&self, queue: &NetworkQueue, side: Side, token: QToken, task: TaskType, completions: &Completions) {
        let mut state = self.state.lock();

        if queue.is_aborted() {
            let op = opcode(&task);
            if let TaskType::Read(read) = task {
                state.buffers.give(read.buffer);
            }
            drop(state);

            completions.resolve(token, QResult::aborted(op, queue.qd()));
            return;
        }

        let queued = Queued {
            token,
            qd: queue.qd(),
            task,
        };

        let lane = state.lanes.entry(queue.lane()).or_default();
        match side {
            Side::Read => lane.reads.push_back(queued),
            Side::Write => lane.writes.push_back(queued),
        }

        self.pump(&mut state, queue.lane());

        if let Err(err) = self.flush(&mut state) {
            // The entries stay in the backlog; the next turn retries.
            tracing::warn!(%err, "failed to submit");
        }
    }

    // Start whatever the lane is allowed to run next.
    fn pump(&self, state: &mut State, id: u64) {
        let lane = match state.lanes.get_mut(&id) {
            Some(lane) => lane,
            None => return,
        };

        let mut ready = Vec::with_capacity(2);

        if !lane.write_busy {
            if let Some(queued) = lane.writes.pop_front() {
                lane.write_busy = true;
                if let TaskType::Connect(_) = queued.task {
                    lane.connecting = true;
                }
                ready.push((Side::Write, queued));
            }
        }

        // Nothing to read until the connection exists.
        if !lane.read_busy && !lane.connecting {
            if let Some(queued) = lane.reads.pop_front() {
                lane.read_busy = true;
                ready.push((Side::Read, queued));
            }
        }

        for (side, queued) in ready {
            let op = Op {
                token: queued.token,
                qd: queued.qd,
                lane: id,
                side,
            };
            self.start(state, queued.task, Some(op));
        }
    }

    fn start(&self, state: &mut State, mut task: TaskType, op: Option<Op>) -> usize {
        let slot = state.tasks.vacant_entry();
        let key = slot.key();
        let entry = task.entry().user_data(key as _);

        slot.insert(InFlight {
            task,
            op,
            orphaned: false,
        });

        self.submit(state, entry);
        key
    }

    fn submit(&self, state: &mut State, entry: Entry) {
        if !state.backlog.is_empty() {
            state.backlog.push_back(entry);
            return;
        }

        let mut submissions = unsafe { self.uring.submission_shared() };
        if submissions.is_full() {
            state.backlog.push_back(entry);
            return;
        }

        unsafe {
            if submissions.push(&entry).is_err() {
                state.backlog.push_back(entry);
            }
        }
    }

    // Move the backlog into the submission queue and hand it to the kernel.
    fn flush(&self, state: &mut State) -> Result<()> {
        loop {
            {
                let mut submissions = unsafe { self.uring.submission_shared() };
                while !submissions.is_full() {
                    let entry = match state.backlog.pop_front() {
                        Some(entry) => entry,
                        None => break,
                    };

                    unsafe {
                        if submissions.push(&entry).is_err() {
                            state.backlog.push_front(entry);
                            break;
                        }
                    }
                }
            }

            match self.uring.submit() {
                Ok(_) => {}
                // The completion queue is backed up; the leader drains it.
                Err(err) if is_transient(&err) => return Ok(()),
                Err(err) => return Err(err.into()),
            }

            if state.backlog.is_empty() {
                return Ok(());
            }
        }
    }

    fn complete(&self, state: &mut State, completions: &Completions, key: usize, ret: i32) {
        if !state.tasks.contains(key) {
            tracing::warn!(key, ret, "completion for unknown task");
            return;
        }

        let InFlight { task, op, orphaned } = state.tasks.remove(key);

        let op = match op {
            Some(op) => op,
            None => {
                if let TaskType::Wake(_) = task {
                    state.wake_armed = false;
                }
                return;
            }
        };

        if orphaned {
            // The tokens already failed; only reclaim what the kernel gave back.
            match task {
                TaskType::Read(read) => state.buffers.give(read.buffer),
                TaskType::Accept(_) if ret >= 0 => {
                    let _ = super::close(ret);
                }
                _ => {}
            }
            return;
        }

        let opcode = opcode(&task);
        let value = match task {
            TaskType::Accept(_) => self.accepted(ret),
            TaskType::Connect(_) => {
                if let Some(lane) = state.lanes.get_mut(&op.lane) {
                    lane.connecting = false;
                }
                status(ret).map(|_| QValue::Empty)
            }
            TaskType::Read(mut read) => match status(ret) {
                Ok(0) => {
                    state.buffers.give(read.buffer);
                    Err(Error::ConnectionReset)
                }
                Ok(n) => {
                    read.buffer.truncate(n);
                    Ok(QValue::Sga(Sga::from(read.buffer)))
                }
                Err(err) => {
                    state.buffers.give(read.buffer);
                    Err(err)
                }
            },
            TaskType::Write(mut write) => match status(ret) {
                Ok(n) => {
                    write.offset += n;
                    if write.remaining() == 0 {
                        Ok(QValue::Sga(write.sga))
                    } else if n == 0 {
                        Err(Error::ConnectionReset)
                    } else {
                        // Short send: keep the lane busy and send the rest.
                        self.start(state, write.into(), Some(op));
                        return;
                    }
                }
                Err(err) => Err(err),
            },
            _ => return,
        };

        completions.resolve_quiet(op.token, QResult::new(opcode, op.qd, value));

        if let Some(lane) = state.lanes.get_mut(&op.lane) {
            match op.side {
                Side::Read => lane.read_busy = false,
                Side::Write => lane.write_busy = false,
            }
        }
        self.pump(state, op.lane);
    }

    // Register the new connection before its token becomes visible.
    fn accepted(&self, ret: i32) -> Result<QValue> {
        let fd = status(ret)? as i32;
        let qd = Qd(fd);

        self.registry.insert(qd, NetworkQueue::new(fd))?;
        tracing::debug!(%qd, "accepted connection");

        Ok(QValue::Accept(qd))
    }
}

impl Drive for Ring {
    fn turn(&self, completions: &Completions, deadline: Option<Instant>) -> Result<()> {
        {
            let mut state = self.state.lock();

            if !state.wake_armed {
                state.wake_armed = true;
                self.start(&mut state, task::Wake::new(self.notifier.fd()).into(), None);
            }

            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                self.start(&mut state, task::Timeout::new(left).into(), None);
            }

            self.flush(&mut state)?;
        }

        match self.uring.submit_and_wait(1) {
            Ok(_) => {}
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let mut state = self.state.lock();

        let done: Vec<(u64, i32)> = unsafe { self.uring.completion_shared() }
            .map(|entry| (entry.user_data(), entry.result()))
            .collect();

        for (key, ret) in done {
            self.complete(&mut state, completions, key as usize, ret);
        }

        self.flush(&mut state)
    }
}

impl Drop for Ring {
    // The kernel may still write into buffers owned by in-flight tasks, so
    // cancel everything and wait for the ring to hand them back.
    fn drop(&mut self) {
        let mut state = self.state.lock();

        let keys: Vec<usize> = state.tasks.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.start(&mut state, task::Cancel { key: key as u64 }.into(), None);
        }

        let give_up = Instant::now() + Duration::from_secs(1);
        let mut timer = None;

        while state.tasks.iter().any(|(key, _)| Some(key) != timer) && Instant::now() < give_up {
            if timer.is_none() {
                let tick = task::Timeout::new(Duration::from_millis(10));
                timer = Some(self.start(&mut state, tick.into(), None));
            }

            if self.flush(&mut state).is_err() {
                break;
            }

            match self.uring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) if is_transient(&err) => {}
                Err(_) => break,
            }

            let done: Vec<u64> = unsafe { self.uring.completion_shared() }
                .map(|entry| entry.user_data())
                .collect();

            for key in done {
                let key = key as usize;
                if timer == Some(key) {
                    timer = None;
                }
                if state.tasks.contains(key) {
                    state.tasks.remove(key);
                }
            }
        }

        let leaked = state.tasks.len() - timer.is_some() as usize;
        if leaked > 0 {
            tracing::warn!(tasks = leaked, "leaking buffers still owned by the kernel");
        }
        for flight in state.tasks.drain() {
            std::mem::forget(flight);
        }
    }
}

fn opcode(task: &TaskType) -> Opcode {
    match task {
        TaskType::Accept(_) => Opcode::Accept,
        TaskType::Connect(_) => Opcode::Connect,
        TaskType::Write(_) => Opcode::Push,
        _ => Opcode::Pop,
    }
}

fn status(ret: i32) -> Result<usize> {
    if ret >= 0 {
        Ok(ret as usize)
    } else {
        Err(Error::from_errno(-ret))
    }
}

fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted || err.raw_os_error() == Some(libc::EBUSY)
}
