//! Fixed-capacity byte ring staging data between the producer and host reads.
//!
//! # Invariants
//! - `bytes_available + bytes_free == capacity`
//! - `read_pos < capacity` and `write_pos < capacity`
//! - bytes are read back in the order they were written, across wraparound

/// Circular byte buffer with independent read and write cursors.
#[derive(Debug)]
pub struct CircularBuffer {
    buffer: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    bytes_available: usize,
}

impl CircularBuffer {
    /// Creates an empty buffer.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Circular buffer capacity must be greater than zero");
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            bytes_available: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes written and not yet read.
    pub fn bytes_available(&self) -> usize {
        self.bytes_available
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn bytes_free(&self) -> usize {
        self.capacity() - self.bytes_available
    }

    /// Appends `data`, or returns false without writing anything if it does not fit.
    pub fn write_bytes(&mut self, data: &[u8]) -> bool {
        if data.len() > self.bytes_free() {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let capacity = self.capacity();
        let first = data.len().min(capacity - self.write_pos);
        self.buffer[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buffer[..rest].copy_from_slice(&data[first..]);
        }

        self.write_pos = (self.write_pos + data.len()) % capacity;
        self.bytes_available += data.len();
        true
    }

    /// Copies up to `out.len()` unread bytes into `out` and returns the count.
    ///
    /// Callers check [`bytes_available`](Self::bytes_available) first; a short
    /// buffer yields a short read rather than stale bytes.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.bytes_available);
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.read_pos);
        out[..first].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first]);
        let rest = count - first;
        if rest > 0 {
            out[first..count].copy_from_slice(&self.buffer[..rest]);
        }

        self.read_pos = (self.read_pos + count) % capacity;
        self.bytes_available -= count;
        count
    }

    /// Moves the read cursor by `delta` bytes without copying.
    ///
    /// Positive skips unread data, negative steps back over already-read
    /// bytes. The cursor wraps into `[0, capacity)` and the available count
    /// changes by `-delta`, clamped to `[0, capacity]`.
    pub fn adjust_bytes(&mut self, delta: i64) {
        let capacity = self.capacity() as i64;
        self.read_pos = (self.read_pos as i64 + delta).rem_euclid(capacity) as usize;
        self.bytes_available = (self.bytes_available as i64 - delta).clamp(0, capacity) as usize;
    }

    /// Discards all buffered data.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.bytes_available = 0;
    }
}
