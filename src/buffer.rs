//! Growable network buffers with optional backpressure.
//!
//! `NetBuffer` backs both the incoming and outgoing sides of an endpoint.
//! The incoming buffer is created with a cap (`max_net_in_size`); the
//! outgoing buffer is created unbounded, per spec: plaintext sends are
//! bounded by handler behavior, not by the core.

use crate::error::{Error, Result};

/// A growable byte buffer with FIFO semantics: bytes are appended at the
/// back and consumed from the front, and unconsumed bytes are preserved
/// across compaction.
#[derive(Debug)]
pub struct NetBuffer {
    data: Vec<u8>,
    max: Option<usize>,
}

impl NetBuffer {
    /// Unbounded buffer (used for outgoing data).
    pub fn unbounded(initial_capacity: usize) -> Self {
        NetBuffer {
            data: Vec::with_capacity(initial_capacity),
            max: None,
        }
    }

    /// Buffer that refuses to grow past `max` bytes (used for incoming data).
    pub fn bounded(initial_capacity: usize, max: usize) -> Self {
        NetBuffer {
            data: Vec::with_capacity(initial_capacity.min(max)),
            max: Some(max),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends `bytes`, failing with [`Error::EndpointOverflow`] if this
    /// buffer is bounded and would exceed its cap.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(max) = self.max {
            if self.data.len() + bytes.len() > max {
                return Err(Error::overflow(None, max));
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Removes the first `n` bytes, shifting the remainder to the front.
    /// This is the "compact" step performed after a handler consumes a
    /// prefix of the buffer.
    pub fn drain_front(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.data.len() {
            self.data.clear();
        } else {
            self.data.drain(..n);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Takes every byte currently in the buffer, leaving it empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_drain_preserves_order() {
        let mut buf = NetBuffer::unbounded(8);
        buf.append(b"hello").unwrap();
        buf.append(b" world").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");
        buf.drain_front(6);
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn bounded_buffer_overflow_is_rejected() {
        let mut buf = NetBuffer::bounded(4, 8);
        buf.append(b"1234").unwrap();
        buf.append(b"5678").unwrap();
        let err = buf.append(b"9").unwrap_err();
        assert!(matches!(err, Error::EndpointOverflow { limit: 8, .. }));
    }

    #[test]
    fn bounded_buffer_exact_fit_succeeds() {
        let mut buf = NetBuffer::bounded(4, 8);
        buf.append(b"12345678").unwrap();
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn drain_front_beyond_len_clears() {
        let mut buf = NetBuffer::unbounded(4);
        buf.append(b"ab").unwrap();
        buf.drain_front(100);
        assert!(buf.is_empty());
    }
}
