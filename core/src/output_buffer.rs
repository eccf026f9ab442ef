//! Bounded per-session ring of raw output chunks (spec 3, 4.3): dual caps on chunk count and
//! byte count, both enforced on every append; supplies the replay block on attach.

use std::collections::VecDeque;

use bytes::Bytes;

pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    max_chunks: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self { chunks: VecDeque::new(), bytes: 0, max_chunks, max_bytes }
    }

    /// Push to tail, then drop from the head until both caps hold.
    pub fn append(&mut self, chunk: Bytes) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.max_chunks || self.bytes > self.max_bytes {
            if let Some(dropped) = self.chunks.pop_front() {
                self.bytes -= dropped.len();
            } else {
                break;
            }
        }
    }

    /// The last `min(k, count)` chunks, capped at `max_chunks` regardless of the requested `k`.
    pub fn snapshot(&self, k: usize) -> Vec<Bytes> {
        let k = k.min(self.max_chunks).min(self.chunks.len());
        self.chunks.iter().rev().take(k).rev().cloned().collect()
    }

    pub fn size(&self) -> (usize, usize) {
        (self.chunks.len(), self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_both_chunks_and_bytes() {
        let mut buf = OutputBuffer::new(3, 10);
        for i in 0..5u8 {
            buf.append(Bytes::from(vec![i]));
        }
        let (count, bytes) = buf.size();
        assert_eq!(count, 3);
        assert_eq!(bytes, 3);
    }

    #[test]
    fn byte_cap_evicts_even_under_chunk_cap() {
        let mut buf = OutputBuffer::new(100, 10);
        buf.append(Bytes::from(vec![0u8; 6]));
        buf.append(Bytes::from(vec![1u8; 6]));
        let (count, bytes) = buf.size();
        assert_eq!(count, 1);
        assert_eq!(bytes, 6);
    }

    #[test]
    fn snapshot_returns_newest_k_in_order() {
        let mut buf = OutputBuffer::new(100, 1000);
        for i in 0..5u8 {
            buf.append(Bytes::from(vec![i]));
        }
        let snap = buf.snapshot(2);
        assert_eq!(snap, vec![Bytes::from(vec![3u8]), Bytes::from(vec![4u8])]);
    }

    #[test]
    fn snapshot_caps_at_max_chunks_even_if_k_is_larger() {
        let mut buf = OutputBuffer::new(2, 1000);
        for i in 0..5u8 {
            buf.append(Bytes::from(vec![i]));
        }
        let snap = buf.snapshot(500);
        assert_eq!(snap.len(), 2);
    }

    proptest::proptest! {
        #[test]
        fn invariant_caps_always_hold(sizes in proptest::collection::vec(0usize..20, 0..200)) {
            let mut buf = OutputBuffer::new(5000, 5 * 1024 * 1024);
            for s in sizes {
                buf.append(Bytes::from(vec![0u8; s]));
                let (count, bytes) = buf.size();
                prop_assert!(count <= 5000);
                prop_assert!(bytes <= 5 * 1024 * 1024);
            }
        }
    }
}
