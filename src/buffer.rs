//! Growable contiguous octet store used for every per-connection buffer
//! (read, write, handshake). Backed by a plain `Vec<u8>`, but the growth and
//! compaction strategy is spelled out explicitly here rather than left to
//! `Vec`'s own amortized-doubling, because the frame parser depends on being
//! able to reserve ahead without invalidating offsets it is still holding.

/// Buffers grow by doubling, but never by more than this many bytes in a
/// single reallocation, so a single huge message doesn't force an
/// equally huge spare allocation.
const GROWTH_STEP_CAP: usize = 2 * 1024 * 1024;

/// A growable octet store with capacity always `>=` length.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    /// Create a buffer pre-allocated to `init_len` bytes of capacity.
    pub fn with_capacity(init_len: usize) -> Self {
        Self {
            data: Vec::with_capacity(init_len),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Direct read-only view of the whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Ensure at least `additional` bytes of spare capacity exist beyond
    /// the current length, growing by doubling (capped at
    /// [`GROWTH_STEP_CAP`] per step) until it does.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if self.data.capacity() >= needed {
            return;
        }
        let mut new_cap = self.data.capacity().max(1);
        while new_cap < needed {
            let step = new_cap.min(GROWTH_STEP_CAP);
            new_cap += step.max(1);
        }
        self.data.reserve(new_cap - self.data.len());
    }

    /// Append `bytes` to the end of the buffer, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Grow the buffer by `n` uninitialized-to-zero bytes and return the
    /// offset at which they start, for callers (e.g. a raw `read()`) that
    /// want to fill the tail in place.
    pub fn grow_zeroed(&mut self, n: usize) -> usize {
        self.reserve(n);
        let start = self.data.len();
        self.data.resize(start + n, 0);
        start
    }

    pub fn truncate(&mut self, new_len: usize) {
        self.data.truncate(new_len);
    }

    /// Remove the leading `k` bytes, shifting the tail down to offset 0.
    /// Any offset previously computed against the old contents past `k`
    /// must be adjusted by the caller (subtract `k`).
    pub fn slice_off(&mut self, k: usize) {
        if k == 0 {
            return;
        }
        if k >= self.data.len() {
            self.data.clear();
            return;
        }
        self.data.drain(0..k);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_slice_off() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.as_slice(), b"hello world");
        buf.slice_off(6);
        assert_eq!(buf.as_slice(), b"world");
        assert!(buf.capacity() >= buf.len());
    }

    #[test]
    fn slice_off_past_end_clears() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.append(b"abc");
        buf.slice_off(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn reserve_keeps_capacity_invariant() {
        let mut buf = ByteBuffer::with_capacity(0);
        for _ in 0..20 {
            buf.append(&[0u8; 1024]);
            assert!(buf.capacity() >= buf.len());
        }
    }

    #[test]
    fn grow_zeroed_returns_prior_len() {
        let mut buf = ByteBuffer::with_capacity(0);
        buf.append(b"ab");
        let start = buf.grow_zeroed(3);
        assert_eq!(start, 2);
        assert_eq!(buf.len(), 5);
    }
}
