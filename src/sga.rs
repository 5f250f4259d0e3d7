//! Scatter-gather buffers.
//!
//! An [`Sga`] is one message: an ordered list of owned segments. Pushing moves
//! it into the runtime and popping moves a filled one back out, so bytes are
//! never copied across the queue boundary. Hand finished buffers to
//! [`Runtime::release`](crate::Runtime::release) so their segments can be
//! reused for future receives.

use std::ops;

pub type Segment = Vec<u8>;

#[must_use = "an Sga owns its segments; push it or release it"]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sga {
    segments: Vec<Segment>,
}

impl Sga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Total number of bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every segment into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }
}

impl ops::Index<usize> for Sga {
    type Output = Segment;

    fn index(&self, index: usize) -> &Self::Output {
        &self.segments[index]
    }
}

impl From<Segment> for Sga {
    fn from(segment: Segment) -> Self {
        Self {
            segments: vec![segment],
        }
    }
}

impl From<&[u8]> for Sga {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl From<&str> for Sga {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl From<Vec<Segment>> for Sga {
    fn from(segments: Vec<Segment>) -> Self {
        Self::from_segments(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_spans_segments() {
        let sga = Sga::from_segments(vec![b"GET ".to_vec(), b"/".to_vec(), Vec::new()]);
        assert_eq!(sga.num_segments(), 3);
        assert_eq!(sga.len(), 5);
        assert_eq!(sga.to_vec(), b"GET /");
        assert_eq!(&sga[1], b"/");
    }

    #[test]
    fn empty() {
        assert!(Sga::new().is_empty());
        assert!(Sga::from_segments(vec![Vec::new()]).is_empty());
        assert!(!Sga::from("x").is_empty());
    }
}
