//! Append-only records of the bytes an endpoint sent and received.

use bytes::{Bytes, BytesMut};

/// Ordered sequence of byte chunks, in the order they hit the socket.
///
/// Chunk boundaries are kept for the vantage dumps; verification only ever
/// looks at the concatenation.
#[derive(Debug, Default, Clone)]
pub struct ByteLedger {
    chunks: Vec<Bytes>,
    total: usize,
}

impl ByteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk. Empty chunks are not recorded.
    pub fn append(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total number of bytes across all chunks.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// All chunks joined into one contiguous sequence.
    pub fn concat(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut out = BytesMut::with_capacity(self.total);
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }
}

impl<B: Into<Bytes>> FromIterator<B> for ByteLedger {
    fn from_iter<I: IntoIterator<Item = B>>(iter: I) -> Self {
        let mut ledger = ByteLedger::new();
        for chunk in iter {
            ledger.append(chunk);
        }
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_preserves_call_order() {
        let ledger: ByteLedger = ["hel", "lo", "\n"].into_iter().collect();
        assert_eq!(ledger.chunks().len(), 3);
        assert_eq!(ledger.len(), 6);
        assert_eq!(&ledger.concat()[..], b"hello\n");
    }

    #[test]
    fn empty_chunks_are_not_recorded() {
        let mut ledger = ByteLedger::new();
        ledger.append(Bytes::new());
        ledger.append(&b"x"[..]);
        ledger.append(Vec::<u8>::new());
        assert_eq!(ledger.chunks().len(), 1);
        assert!(!ledger.is_empty());
    }

    #[test]
    fn empty_ledger_concats_to_nothing() {
        let ledger = ByteLedger::new();
        assert!(ledger.is_empty());
        assert!(ledger.concat().is_empty());
    }
}
