//! Pool of device buffer pairs.
//!
//! Every open image works on a pair of equal-sized device buffers whose
//! in/out roles alternate with each dispatch. Pairs are created on first
//! request and reused by every later image of the same key until
//! [`BufferPool::clear`].
//!
//! # Keying
//!
//! [`PoolKeying::BySize`] (default) keys by byte size alone, so two open
//! images of the same size share one pair and overwrite each other's data.
//! [`PoolKeying::ByShape`] adds `(rows, cols)` to the key, which separates
//! images of different shapes; images of identical shape still share.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::ComputeResult;
use crate::device::{ComputeDevice, DeviceBuffer, MemAccess};

/// Pool key policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolKeying {
    /// Key by byte size.
    #[default]
    BySize,
    /// Key by byte size and `(rows, cols)`.
    ByShape,
}

/// Pool lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub bytes: usize,
    pub shape: Option<(u32, u32)>,
}

/// Two equal-sized device buffers.
#[derive(Debug, Clone)]
pub struct BufferPair {
    first: DeviceBuffer,
    second: DeviceBuffer,
}

impl BufferPair {
    /// Buffer initially holding the input.
    #[inline]
    pub fn first(&self) -> &DeviceBuffer {
        &self.first
    }

    /// Buffer initially receiving the output.
    #[inline]
    pub fn second(&self) -> &DeviceBuffer {
        &self.second
    }

    /// Size of each buffer in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.first.size_bytes()
    }

    /// True if both pairs hold the same allocations.
    pub fn ptr_eq(&self, other: &BufferPair) -> bool {
        Arc::ptr_eq(&self.first, &other.first) && Arc::ptr_eq(&self.second, &other.second)
    }
}

/// Buffer pairs keyed by [`PairKey`], with hit/miss statistics.
#[derive(Debug)]
pub struct BufferPool {
    keying: PoolKeying,
    pairs: HashMap<PairKey, BufferPair>,
    hits: u64,
    misses: u64,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new(keying: PoolKeying) -> Self {
        Self {
            keying,
            pairs: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Keying policy.
    pub fn keying(&self) -> PoolKeying {
        self.keying
    }

    /// Key for a request of `bytes`, for an image of `shape` if known.
    pub fn key(&self, bytes: usize, shape: Option<(u32, u32)>) -> PairKey {
        match self.keying {
            PoolKeying::BySize => PairKey { bytes, shape: None },
            PoolKeying::ByShape => PairKey { bytes, shape },
        }
    }

    /// Returns the pair for `key`, allocating it on `device` on first use.
    pub fn acquire(&mut self, key: PairKey, device: &dyn ComputeDevice) -> ComputeResult<BufferPair> {
        if let Some(pair) = self.pairs.get(&key) {
            self.hits += 1;
            trace!(bytes = key.bytes, "Buffer pair reused");
            return Ok(pair.clone());
        }

        let pair = BufferPair {
            first: device.create_buffer(key.bytes, MemAccess::ReadWrite)?,
            second: device.create_buffer(key.bytes, MemAccess::ReadWrite)?,
        };
        self.misses += 1;
        debug!(bytes = key.bytes, shape = ?key.shape, pairs = self.pairs.len() + 1, "Buffer pair allocated");
        self.pairs.insert(key, pair.clone());
        Ok(pair)
    }

    /// Pair for `key`, if allocated.
    pub fn get(&self, key: &PairKey) -> Option<&BufferPair> {
        self.pairs.get(key)
    }

    /// Drops every pair held by the pool.
    ///
    /// Images still open keep their own handles, so their buffers stay alive
    /// until they are closed.
    pub fn clear(&mut self) {
        if !self.pairs.is_empty() {
            debug!(pairs = self.pairs.len(), bytes = self.total_bytes(), "Buffer pool cleared");
        }
        self.pairs.clear();
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True if the pool holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Device memory held by the pool in bytes.
    pub fn total_bytes(&self) -> usize {
        self.pairs.values().map(|p| 2 * p.size_bytes()).sum()
    }

    /// Requests served from the pool.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Requests that allocated a new pair.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolKeying::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostDevice;

    #[test]
    fn test_same_size_shares_pair() {
        let dev = HostDevice::new();
        let mut pool = BufferPool::default();
        let a = pool.acquire(pool.key(400, Some((10, 10))), &dev).unwrap();
        let b = pool.acquire(pool.key(400, Some((5, 20))), &dev).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(pool.len(), 1);
        assert_eq!((pool.hits(), pool.misses()), (1, 1));
        assert_eq!(pool.total_bytes(), 800);
    }

    #[test]
    fn test_by_shape_separates_pairs() {
        let dev = HostDevice::new();
        let mut pool = BufferPool::new(PoolKeying::ByShape);
        let a = pool.acquire(pool.key(400, Some((10, 10))), &dev).unwrap();
        let b = pool.acquire(pool.key(400, Some((5, 20))), &dev).unwrap();
        let c = pool.acquire(pool.key(400, Some((10, 10))), &dev).unwrap();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&c));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_pair_buffers_are_distinct() {
        let dev = HostDevice::new();
        let mut pool = BufferPool::default();
        let pair = pool.acquire(pool.key(64, None), &dev).unwrap();
        assert_ne!(pair.first().id(), pair.second().id());
        assert_eq!(pair.size_bytes(), 64);
    }

    #[test]
    fn test_clear_keeps_outstanding_handles() {
        let dev = HostDevice::new();
        let mut pool = BufferPool::default();
        let key = pool.key(64, None);
        let pair = pool.acquire(key, &dev).unwrap();
        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.get(&key).is_none());
        assert_eq!(pair.size_bytes(), 64);

        let fresh = pool.acquire(key, &dev).unwrap();
        assert!(!fresh.ptr_eq(&pair));
        assert!((pool.hit_ratio() - 0.0).abs() < f64::EPSILON);
    }
}
