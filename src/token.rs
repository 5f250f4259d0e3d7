//! Tokens and the completion table.
//!
//! Every push, pop, accept and connect issues a [`QToken`] whose slot starts
//! `Pending`. Queues resolve slots to `Ready`; a wait call removes the slot and
//! hands the [`QResult`] to the caller, after which the token is dead.
//!
//! Waiters sleep on a condition variable. When one of the tokens a caller waits
//! on is pending on the ring and no other thread is driving it, the caller
//! becomes the leader and blocks inside the ring instead. Resolutions made
//! outside the ring while a leader is inside it ring the [`Notifier`] so the
//! leader comes back up and notices.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::completion::{Opcode, QResult};
use crate::error::{Error, Result};
use crate::kio::Notifier;
use crate::queue::Qd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QToken(u64);

impl QToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl From<u64> for QToken {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for QToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that can make progress on ring-backed tokens.
pub(crate) trait Drive {
    /// Block until at least one completion arrives or the deadline passes, and
    /// resolve everything that completed.
    fn turn(&self, completions: &Completions, deadline: Option<Instant>) -> Result<()>;
}

enum Slot {
    Pending { qd: Qd, opcode: Opcode, ring: bool },
    Ready(QResult),
}

#[derive(Default)]
struct Table {
    slots: HashMap<QToken, Slot>,
    driving: bool,
}

impl Table {
    fn is_known(&self, token: QToken) -> bool {
        self.slots.contains_key(&token)
    }

    fn is_ready(&self, token: QToken) -> bool {
        matches!(self.slots.get(&token), Some(Slot::Ready(_)))
    }

    fn on_ring(&self, tokens: &[QToken]) -> bool {
        tokens
            .iter()
            .any(|token| matches!(self.slots.get(token), Some(Slot::Pending { ring: true, .. })))
    }

    fn take(&mut self, token: QToken) -> Option<QResult> {
        match self.slots.entry(token) {
            Entry::Occupied(entry) if matches!(entry.get(), Slot::Ready(_)) => match entry.remove() {
                Slot::Ready(result) => Some(result),
                Slot::Pending { .. } => None,
            },
            _ => None,
        }
    }

    fn check_known(&self, tokens: &[QToken]) -> Result<()> {
        match tokens.iter().find(|token| !self.is_known(**token)) {
            Some(token) => Err(Error::InvalidToken(*token)),
            None => Ok(()),
        }
    }
}

pub struct Completions {
    next: AtomicU64,
    table: Mutex<Table>,
    ready: Condvar,
    notifier: Option<Arc<Notifier>>,
}

impl Completions {
    pub(crate) fn new(notifier: Option<Arc<Notifier>>) -> Self {
        Self {
            next: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
            ready: Condvar::new(),
            notifier,
        }
    }

    /// Allocate a token with a pending slot. `ring` marks operations that only
    /// make progress while somebody drives the ring.
    pub(crate) fn issue(&self, qd: Qd, opcode: Opcode, ring: bool) -> QToken {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(id != u64::MAX, "token space exhausted");

        let token = QToken(id);
        self.table
            .lock()
            .slots
            .insert(token, Slot::Pending { qd, opcode, ring });

        tracing::trace!(%token, %qd, %opcode, "issued");
        token
    }

    /// Resolve a token from outside the ring.
    pub(crate) fn resolve(&self, token: QToken, result: QResult) {
        if self.complete(token, result) {
            if let Some(notifier) = &self.notifier {
                notifier.notify();
            }
        }
    }

    /// Resolve a token while driving the ring; the leader is already awake.
    pub(crate) fn resolve_quiet(&self, token: QToken, result: QResult) {
        self.complete(token, result);
    }

    // Returns true if a leader is currently blocked in the ring.
    fn complete(&self, token: QToken, result: QResult) -> bool {
        let mut table = self.table.lock();

        let slot = match table.slots.get_mut(&token) {
            Some(slot) => slot,
            None => {
                tracing::trace!(%token, "dropping completion for consumed token");
                return false;
            }
        };

        match *slot {
            Slot::Pending { qd, opcode, .. } => {
                tracing::trace!(%token, %qd, %opcode, ok = result.is_ok(), "resolved");
            }
            Slot::Ready(_) => {
                // Already resolved by a close.
                tracing::trace!(%token, "dropping late completion");
                return false;
            }
        }
        *slot = Slot::Ready(result);

        let driving = table.driving;
        drop(table);

        self.ready.notify_all();
        driving
    }

    /// Number of issued tokens that have not been consumed yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.table.lock().slots.len()
    }

    #[cfg(test)]
    pub(crate) fn is_ready(&self, token: QToken) -> bool {
        self.table.lock().is_ready(token)
    }

    pub(crate) fn wait<D>(&self, drive: &D, token: QToken, deadline: Option<Instant>) -> Result<Option<QResult>>
    where
        D: Drive + ?Sized,
    {
        self.wait_for(drive, &[token], deadline, |table| {
            if !table.is_known(token) {
                return Err(Error::InvalidToken(token));
            }
            Ok(table.take(token))
        })
    }

    /// Consume the lowest-indexed ready token.
    pub(crate) fn wait_any<D>(
        &self,
        drive: &D,
        tokens: &[QToken],
        deadline: Option<Instant>,
    ) -> Result<Option<(usize, QResult)>>
    where
        D: Drive + ?Sized,
    {
        if tokens.is_empty() {
            return Err(Error::NoTokens);
        }

        self.wait_for(drive, tokens, deadline, |table| {
            table.check_known(tokens)?;

            let index = match tokens.iter().position(|token| table.is_ready(*token)) {
                Some(index) => index,
                None => return Ok(None),
            };

            Ok(table.take(tokens[index]).map(|result| (index, result)))
        })
    }

    /// Consume every token once all of them are ready.
    pub(crate) fn wait_all<D>(&self, drive: &D, tokens: &[QToken]) -> Result<Vec<QResult>>
    where
        D: Drive + ?Sized,
    {
        if tokens.is_empty() {
            return Err(Error::NoTokens);
        }

        let mut seen = HashSet::with_capacity(tokens.len());
        if let Some(token) = tokens.iter().find(|token| !seen.insert(**token)) {
            return Err(Error::InvalidToken(*token));
        }

        let results: Option<Vec<QResult>> = self.wait_for(drive, tokens, None, |table| {
            table.check_known(tokens)?;

            if !tokens.iter().all(|token| table.is_ready(*token)) {
                return Ok(None);
            }

            Ok(Some(tokens.iter().filter_map(|token| table.take(*token)).collect()))
        })?;

        Ok(results.unwrap_or_default())
    }

    fn wait_for<D, T, F>(&self, drive: &D, tokens: &[QToken], deadline: Option<Instant>, mut take: F) -> Result<Option<T>>
    where
        D: Drive + ?Sized,
        F: FnMut(&mut Table) -> Result<Option<T>>,
    {
        let mut table = self.table.lock();

        loop {
            if let Some(out) = take(&mut table)? {
                return Ok(Some(out));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            if !table.driving && table.on_ring(tokens) {
                table.driving = true;
                let turn = MutexGuard::unlocked(&mut table, || drive.turn(self, deadline));
                table.driving = false;

                // Someone else may need to take over the ring.
                self.ready.notify_all();
                turn?;
            } else if let Some(deadline) = deadline {
                self.ready.wait_until(&mut table, deadline);
            } else {
                self.ready.wait(&mut table);
            }
        }
    }
}
