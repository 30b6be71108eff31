use core::fmt;

use heapless::Vec;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer capacity of {capacity} bytes exceeded, {dropped} byte(s) dropped")]
pub struct WouldOverflow {
    pub capacity: usize,
    pub dropped: usize,
}

/// Fixed-capacity byte accumulator. Writes past the capacity are dropped and
/// reported, never stored.
#[derive(Clone, Default)]
pub struct BoundedBuffer<const N: usize> {
    bytes: Vec<u8, N>,
}

impl<const N: usize> BoundedBuffer<N> {
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.capacity() - self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.bytes).ok()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn push(&mut self, byte: u8) -> Result<(), WouldOverflow> {
        self.bytes.push(byte).map_err(|_| WouldOverflow {
            capacity: N,
            dropped: 1,
        })
    }

    /// Stores as much of `data` as fits. Bytes already held are never touched.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), WouldOverflow> {
        let stored = data.len().min(self.remaining());
        let overflow = WouldOverflow {
            capacity: N,
            dropped: data.len() - stored,
        };
        self.bytes
            .extend_from_slice(&data[..stored])
            .map_err(|_| overflow)?;

        if overflow.dropped > 0 {
            Err(overflow)
        } else {
            Ok(())
        }
    }
}

impl<const N: usize> fmt::Debug for BoundedBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("capacity", &N)
            .field("data", &String::from_utf8_lossy(&self.bytes))
            .finish()
    }
}
