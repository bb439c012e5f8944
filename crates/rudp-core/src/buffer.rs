//! Fixed-max-size byte buffers, pooled to keep the hot path allocation-free.
//!
//! Grounded on `strata-transport`'s slab-based `PacketPool`, but reshaped
//! around a single fixed-capacity `Buffer` type (that pool held
//! variable-size `PacketContext` entries for FEC/priority bookkeeping this
//! transport doesn't need) plus a second bucketed pool for oversize
//! fragment-reassembly allocations.

use std::sync::Mutex;

use tracing::error;

use crate::error::BufferError;

/// A fixed-capacity byte buffer with independent read/write cursors.
///
/// Never both pooled and in-flight at once: `get()` hands out an owned
/// value, and `return_buffer()` consumes it back. The `returned` flag
/// exists purely to catch a bug where the same logical buffer is returned
/// twice (invariant 9) — in safe Rust this normally requires the caller to
/// have cloned a handle, which the API discourages but doesn't forbid.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    size: usize,
    read_pos: usize,
    returned: bool,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity],
            capacity,
            size: 0,
            read_pos: 0,
            returned: false,
        }
    }

    /// Reset cursors and length to a freshly-gotten state, without
    /// reallocating the backing storage.
    fn reset(&mut self) {
        self.size = 0;
        self.read_pos = 0;
        self.returned = false;
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos;
    }

    pub fn is_returned(&self) -> bool {
        self.returned
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.capacity]
    }

    /// Append bytes at the current write cursor (`size`), failing if they
    /// would overrun `capacity`.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if self.returned {
            return Err(BufferError::WriteAfterFreeze);
        }
        let end = self.size + bytes.len();
        if end > self.capacity {
            return Err(BufferError::OutOfBounds { offset: self.size, size: self.capacity });
        }
        self.data[self.size..end].copy_from_slice(bytes);
        self.size = end;
        Ok(())
    }

    /// Write bytes at an explicit offset without moving `size`, used for
    /// fixed header fields written before the payload is appended.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        if self.returned {
            return Err(BufferError::WriteAfterFreeze);
        }
        let end = offset + bytes.len();
        if end > self.capacity {
            return Err(BufferError::OutOfBounds { offset, size: self.capacity });
        }
        self.data[offset..end].copy_from_slice(bytes);
        if end > self.size {
            self.size = end;
        }
        Ok(())
    }

    /// Read `len` bytes starting at the read cursor, advancing it.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        if self.returned {
            return Err(BufferError::UseAfterReturn);
        }
        let end = self.read_pos + len;
        if end > self.size {
            return Err(BufferError::OutOfBounds { offset: self.read_pos, size: self.size });
        }
        let slice = &self.data[self.read_pos..end];
        self.read_pos = end;
        Ok(slice)
    }

    pub fn byte_at(&self, i: usize) -> Result<u8, BufferError> {
        self.data.get(i).copied().ok_or(BufferError::OutOfBounds { offset: i, size: self.size })
    }

    /// Wrap a raw byte array (typically from [`OversizePool`]) as a buffer
    /// with `written` bytes already valid, used for fragment reassembly
    /// where the backing array's capacity legitimately exceeds `max_size`.
    pub fn from_raw(data: Vec<u8>, written: usize) -> Buffer {
        let capacity = data.len();
        Buffer { data, capacity, size: written, read_pos: 0, returned: false }
    }

    /// Reclaim the backing array, e.g. to hand it back to [`OversizePool`].
    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }
}

struct BufferPoolInner {
    max_size: usize,
    eviction_threshold: usize,
    free: Mutex<Vec<Buffer>>,
    allocations: std::sync::atomic::AtomicU64,
}

/// Pool of `Buffer`s at a single fixed `max_size`.
///
/// Thread-safe: the receive thread returns buffers while application and
/// timer threads acquire them, so contention on the free list is expected
/// and kept to short critical sections.
pub struct BufferPool {
    inner: BufferPoolInner,
}

impl BufferPool {
    pub fn new(max_size: usize) -> Self {
        BufferPool {
            inner: BufferPoolInner {
                max_size,
                eviction_threshold: crate::config::POOL_EVICTION_THRESHOLD,
                free: Mutex::new(Vec::new()),
                allocations: std::sync::atomic::AtomicU64::new(0),
            },
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Returns a cleared buffer with cursors at 0, reusing a pooled
    /// allocation when available.
    pub fn get(&self) -> Buffer {
        let mut free = self.inner.free.lock().unwrap();
        if let Some(mut buf) = free.pop() {
            buf.reset();
            buf
        } else {
            drop(free);
            self.inner.allocations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Buffer::new(self.inner.max_size)
        }
    }

    /// Return a buffer to the pool, unless it's already pooled or exceeds
    /// the eviction threshold. A double-return is logged and ignored
    /// rather than corrupting the free list.
    pub fn return_buffer(&self, mut buffer: Buffer) {
        if buffer.returned {
            error!("buffer double-returned to pool, ignoring");
            return;
        }
        if buffer.capacity > self.inner.eviction_threshold {
            return;
        }
        buffer.returned = true;
        self.inner.free.lock().unwrap().push(buffer);
    }

    /// Allocation counter for leak diagnostics; a healthy run plateaus.
    pub fn allocation_count(&self) -> u64 {
        self.inner.allocations.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn pooled_len(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// Bucketed pool of oversize byte arrays for fragment reassembly, indexed
/// by power-of-two multiples of `max_size`. Bucket *i* holds arrays of
/// length `max_size * 2^i`, capped at 8 arrays each.
pub struct OversizePool {
    max_size: usize,
    buckets: Mutex<Vec<Vec<Vec<u8>>>>,
}

const OVERSIZE_BUCKET_CAP: usize = 8;
const OVERSIZE_BUCKET_COUNT: usize = 8; // covers up to max_size * 2^7

impl OversizePool {
    pub fn new(max_size: usize) -> Self {
        OversizePool {
            max_size,
            buckets: Mutex::new((0..OVERSIZE_BUCKET_COUNT).map(|_| Vec::new()).collect()),
        }
    }

    fn bucket_for(&self, len: usize) -> usize {
        let mut bucket = 0;
        let mut cap = self.max_size;
        while cap < len && bucket + 1 < OVERSIZE_BUCKET_COUNT {
            cap *= 2;
            bucket += 1;
        }
        bucket
    }

    /// Get a zeroed array of at least `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let bucket_idx = self.bucket_for(len);
        let bucket_cap = self.max_size * (1usize << bucket_idx);
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(mut arr) = buckets[bucket_idx].pop() {
            arr.iter_mut().for_each(|b| *b = 0);
            arr.resize(bucket_cap.max(len), 0);
            arr
        } else {
            vec![0u8; bucket_cap.max(len)]
        }
    }

    pub fn return_array(&self, arr: Vec<u8>) {
        let bucket_idx = self.bucket_for(arr.len());
        let mut buckets = self.buckets.lock().unwrap();
        if buckets[bucket_idx].len() < OVERSIZE_BUCKET_CAP {
            buckets[bucket_idx].push(arr);
        }
    }

    /// Get a zeroed [`Buffer`] of at least `len` bytes, backed by this pool.
    pub fn get_buffer(&self, len: usize) -> Buffer {
        Buffer::from_raw(self.get(len), 0)
    }

    /// Reclaim a buffer built from [`OversizePool::get_buffer`].
    pub fn return_buffer(&self, buffer: Buffer) {
        self.return_array(buffer.into_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_cleared_buffer() {
        let pool = BufferPool::new(1432);
        let mut buf = pool.get();
        buf.write_bytes(b"hello").unwrap();
        pool.return_buffer(buf);
        let buf2 = pool.get();
        assert_eq!(buf2.size(), 0);
    }

    #[test]
    fn double_return_is_ignored_not_corrupting() {
        let pool = BufferPool::new(1432);
        let buf = pool.get();
        let clone = buf.clone();
        pool.return_buffer(buf);
        pool.return_buffer(clone); // already marked returned
        assert_eq!(pool.pooled_len(), 1);
    }

    #[test]
    fn oversize_buffer_not_pooled() {
        let pool = BufferPool::new(1432);
        let big = Buffer::new(128 * 1024);
        pool.return_buffer(big);
        assert_eq!(pool.pooled_len(), 0);
    }

    #[test]
    fn allocation_counter_plateaus() {
        let pool = BufferPool::new(1432);
        for _ in 0..100 {
            let b = pool.get();
            pool.return_buffer(b);
        }
        assert_eq!(pool.allocation_count(), 1);
    }

    #[test]
    fn write_read_roundtrip_primitive_offsets() {
        let mut buf = Buffer::new(1432);
        buf.write_at(0, &1u32.to_le_bytes()).unwrap();
        buf.write_at(1, &2u32.to_le_bytes()).unwrap();
        assert_eq!(buf.byte_at(0).unwrap(), 1);
    }

    #[test]
    fn oversize_pool_buckets_by_power_of_two() {
        let pool = OversizePool::new(1432);
        let arr = pool.get(3000);
        assert!(arr.len() >= 3000);
        pool.return_array(arr);
    }
}
