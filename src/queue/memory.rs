use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{Qd, QueueKind, QueueOps};
use crate::completion::{Opcode, QResult, QValue};
use crate::error::Result;
use crate::sga::Sga;
use crate::token::{Completions, QToken};

#[derive(Default)]
struct State {
    ready: VecDeque<Sga>,       // pushed, not yet popped
    waiting: VecDeque<QToken>,  // pops issued before anything was pushed
    closed: bool,
}

/// An in-process FIFO that speaks the queue/token protocol, used to hand
/// messages between threads.
pub struct MemoryQueue {
    qd: Qd,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(qd: Qd) -> Self {
        Self {
            qd,
            state: Mutex::new(State::default()),
        }
    }

    /// Hand `sga` to the oldest waiting pop, or buffer it. Always completes
    /// immediately.
    pub(crate) fn push(&self, completions: &Completions, token: QToken, sga: Sga) {
        let mut state = self.state.lock();

        if state.closed {
            drop(state);
            completions.resolve(token, QResult::aborted(Opcode::Push, self.qd));
            return;
        }

        match state.waiting.pop_front() {
            Some(pop) => {
                completions.resolve(pop, QResult::new(Opcode::Pop, self.qd, Ok(QValue::Sga(sga))))
            }
            None => state.ready.push_back(sga),
        }

        completions.resolve(token, QResult::new(Opcode::Push, self.qd, Ok(QValue::Empty)));
    }

    pub(crate) fn pop(&self, completions: &Completions, token: QToken) {
        let mut state = self.state.lock();

        if let Some(sga) = state.ready.pop_front() {
            completions.resolve(token, QResult::new(Opcode::Pop, self.qd, Ok(QValue::Sga(sga))));
        } else if state.closed {
            completions.resolve(token, QResult::aborted(Opcode::Pop, self.qd));
        } else {
            state.waiting.push_back(token);
        }
    }

    /// Refuse further work and fail every waiting pop.
    pub(crate) fn abort(&self, completions: &Completions) {
        let mut state = self.state.lock();
        state.closed = true;
        state.ready.clear();

        for token in state.waiting.drain(..) {
            completions.resolve(token, QResult::aborted(Opcode::Pop, self.qd));
        }
    }

    /// Buffers pushed but not popped yet.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueOps for MemoryQueue {
    fn qd(&self) -> Qd {
        self.qd
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Memory
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(completions: &Completions, token: QToken) -> Option<QResult> {
        struct NoRing;
        impl crate::token::Drive for NoRing {
            fn turn(&self, _: &Completions, _: Option<std::time::Instant>) -> Result<()> {
                unreachable!()
            }
        }

        if !completions.is_ready(token) {
            return None;
        }
        completions.wait(&NoRing, token, None).unwrap()
    }

    #[test]
    fn buffered_then_popped() {
        let completions = Completions::new(None);
        let queue = MemoryQueue::new(Qd(1 << 30));

        let push = completions.issue(queue.qd(), Opcode::Push, false);
        queue.push(&completions, push, Sga::from("a"));
        assert_eq!(queue.len(), 1);
        assert!(take(&completions, push).unwrap().is_ok());

        let pop = completions.issue(queue.qd(), Opcode::Pop, false);
        queue.pop(&completions, pop);
        assert!(queue.is_empty());
        assert_eq!(take(&completions, pop).unwrap().into_sga().unwrap().to_vec(), b"a");
    }

    #[test]
    fn waiting_pops_served_in_order() {
        let completions = Completions::new(None);
        let queue = MemoryQueue::new(Qd(1 << 30));

        let first = completions.issue(queue.qd(), Opcode::Pop, false);
        let second = completions.issue(queue.qd(), Opcode::Pop, false);
        queue.pop(&completions, first);
        queue.pop(&completions, second);
        assert!(take(&completions, first).is_none());

        for text in ["one", "two"] {
            let push = completions.issue(queue.qd(), Opcode::Push, false);
            queue.push(&completions, push, Sga::from(text));
        }

        assert_eq!(take(&completions, first).unwrap().into_sga().unwrap().to_vec(), b"one");
        assert_eq!(take(&completions, second).unwrap().into_sga().unwrap().to_vec(), b"two");
        assert!(queue.is_empty());
    }

    #[test]
    fn abort_fails_waiters() {
        let completions = Completions::new(None);
        let queue = MemoryQueue::new(Qd(1 << 30));

        let pop = completions.issue(queue.qd(), Opcode::Pop, false);
        queue.pop(&completions, pop);
        queue.abort(&completions);

        let result = take(&completions, pop).unwrap();
        assert!(matches!(result.value, Err(crate::Error::ConnectionAborted)));

        let push = completions.issue(queue.qd(), Opcode::Push, false);
        queue.push(&completions, push, Sga::from("late"));
        assert!(take(&completions, push).unwrap().error().is_some());
    }
}
