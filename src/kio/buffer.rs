use std::collections::VecDeque;

use crate::sga::Segment;

/// Receive segments of a single fixed size, recycled after the caller releases
/// them.
pub struct Pool {
    size: usize,
    capacity: usize,
    buffers: VecDeque<Segment>,
}

impl Pool {
    pub fn new(size: usize, capacity: usize) -> Self {
        Self {
            size,
            capacity,
            buffers: VecDeque::with_capacity(capacity),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Keep the segment if it came from this pool and there is room for it.
    pub fn give(&mut self, mut buffer: Segment) {
        if buffer.capacity() != self.size || self.buffers.len() >= self.capacity {
            return;
        }

        buffer.clear();
        self.buffers.push_back(buffer);
    }

    /// A zeroed segment of exactly `size` bytes.
    pub fn take(&mut self) -> Segment {
        // Take from the back because it's more likely to be cached.
        let mut buffer = self
            .buffers
            .pop_back()
            .unwrap_or_else(|| Vec::with_capacity(self.size));
        buffer.resize(self.size, 0);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_own_segments() {
        let mut pool = Pool::new(16, 2);
        let mut buffer = pool.take();
        assert_eq!(buffer.len(), 16);

        buffer.truncate(3);
        pool.give(buffer);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.take().len(), 16);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn rejects_foreign_segments() {
        let mut pool = Pool::new(16, 2);
        pool.give(vec![0; 32]);
        pool.give(b"hello".to_vec());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn bounded() {
        let mut pool = Pool::new(8, 1);
        let a = pool.take();
        let b = pool.take();
        pool.give(a);
        pool.give(b);
        assert_eq!(pool.len(), 1);
    }
}
