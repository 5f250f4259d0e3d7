use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::queue::{Qd, Queue};

/// Every open queue, by descriptor.
///
/// Lookups hand out shared handles, so a queue removed while another thread is
/// still using it stays alive until that thread lets go.
#[derive(Default)]
pub struct Registry {
    queues: Mutex<HashMap<Qd, Arc<Queue>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, qd: Qd, queue: impl Into<Queue>) -> Result<()> {
        let mut queues = self.queues.lock();
        if queues.contains_key(&qd) {
            return Err(Error::AlreadyRegistered(qd));
        }

        queues.insert(qd, Arc::new(queue.into()));
        Ok(())
    }

    pub fn has(&self, qd: Qd) -> bool {
        self.queues.lock().contains_key(&qd)
    }

    pub fn get(&self, qd: Qd) -> Result<Arc<Queue>> {
        self.queues.lock().get(&qd).cloned().ok_or(Error::NotFound(qd))
    }

    pub fn remove(&self, qd: Qd) -> Result<Arc<Queue>> {
        self.queues.lock().remove(&qd).ok_or(Error::NotFound(qd))
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, QueueKind, QueueOps};

    use std::thread;

    fn memory(qd: i32) -> MemoryQueue {
        MemoryQueue::new(Qd(qd))
    }

    #[test]
    fn insert_get_remove() {
        let registry = Registry::new();
        registry.insert(Qd(10), memory(10)).unwrap();

        assert!(registry.has(Qd(10)));
        assert_eq!(registry.get(Qd(10)).unwrap().kind(), QueueKind::Memory);

        registry.remove(Qd(10)).unwrap();
        assert!(!registry.has(Qd(10)));
        assert!(matches!(registry.get(Qd(10)), Err(Error::NotFound(Qd(10)))));
        assert!(matches!(registry.remove(Qd(10)), Err(Error::NotFound(Qd(10)))));
    }

    #[test]
    fn duplicate_rejected() {
        let registry = Registry::new();
        registry.insert(Qd(1), memory(1)).unwrap();
        assert!(matches!(
            registry.insert(Qd(1), memory(1)),
            Err(Error::AlreadyRegistered(Qd(1)))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn has_tracks_net_effect() {
        let registry = Registry::new();
        let mut live = std::collections::HashSet::new();

        // A fixed pseudo-random walk over a small descriptor space.
        let mut seed = 0x2545_f491_u32;
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            let qd = Qd((seed % 16) as i32);
            if seed & 0x100 == 0 {
                let inserted = registry.insert(qd, memory(qd.0)).is_ok();
                assert_eq!(inserted, live.insert(qd));
            } else {
                let removed = registry.remove(qd).is_ok();
                assert_eq!(removed, live.remove(&qd));
            }

            for n in 0..16 {
                assert_eq!(registry.has(Qd(n)), live.contains(&Qd(n)));
            }
        }
    }

    #[test]
    fn handle_outlives_remove() {
        let registry = Registry::new();
        registry.insert(Qd(3), memory(3)).unwrap();

        let queue = registry.get(Qd(3)).unwrap();
        registry.remove(Qd(3)).unwrap();
        assert_eq!(queue.qd(), Qd(3));
    }

    #[test]
    fn concurrent_insert_remove() {
        let registry = Arc::new(Registry::new());

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let qd = Qd(t * 1_000 + i);
                        registry.insert(qd, memory(qd.0)).unwrap();
                        assert!(registry.has(qd));
                        registry.remove(qd).unwrap();
                        assert!(!registry.has(qd));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
