//! Single-chunk relay buffer.
//!
//! Each relay direction owns one of these. At most one read's worth of bytes
//! is in flight at a time: a new read is only issued once the previous chunk
//! has been written out completely, so backpressure from a slow destination
//! stalls the source instead of growing memory.

/// Maximum bytes held per direction.
pub const BUF_SIZE: usize = 65535;

/// One in-flight chunk: `content[start..start + left]` is unsent.
#[derive(Debug)]
pub struct RelayBuffer {
    start: usize,
    left: usize,
    content: Box<[u8; BUF_SIZE]>,
}

impl RelayBuffer {
    pub fn new() -> Self {
        RelayBuffer {
            start: 0,
            left: 0,
            content: Box::new([0u8; BUF_SIZE]),
        }
    }

    /// Whether there are unsent bytes pending.
    pub fn is_empty(&self) -> bool {
        self.left == 0
    }

    /// The unsent remainder of the current chunk.
    pub fn pending(&self) -> &[u8] {
        &self.content[self.start..self.start + self.left]
    }

    /// Storage for the next read. Only valid while the buffer is empty.
    pub fn writable(&mut self) -> &mut [u8] {
        debug_assert!(self.left == 0);
        &mut self.content[..]
    }

    /// Record that a read placed `n` bytes at the front of the buffer.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(n <= BUF_SIZE);
        self.start = 0;
        self.left = n;
    }

    /// Record that `n` bytes of the pending chunk were written out.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.left);
        if n == self.left {
            self.start = 0;
            self.left = 0;
        } else {
            self.start += n;
            self.left -= n;
        }
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}
