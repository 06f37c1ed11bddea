//! Per-destination accumulation buffer
//!
//! A [`MessageBuffer`] is plain single-threaded data; the communication
//! layer shares one per destination under a mutex, which is the entire
//! concurrency story. Code that has exclusive access (the drain paths, the
//! tests) works on the bare type directly.

/// A bounded byte buffer that refuses appends it cannot hold
pub struct MessageBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl MessageBuffer {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends `bytes` if they fit within the remaining capacity. A `false`
    /// return means these bytes do not fit, not that the buffer is full.
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        if self.data.len() + bytes.len() > self.capacity {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    /// Swaps the accumulated bytes out, leaving an empty buffer of the same
    /// capacity behind.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.capacity))
    }
}
