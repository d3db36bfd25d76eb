//! Reusable byte buffers for frame encoding.
//!
//! Buffers are grouped in power-of-two size classes from
//! [`MIN_CLASS_SIZE`] to [`MAX_CLASS_SIZE`]. Each class keeps at most
//! [`MAX_FREE_PER_CLASS`] idle buffers; anything beyond that, or larger than
//! the largest class, is simply dropped. A pool hit only saves an
//! allocation, so callers never depend on one.

use parking_lot::Mutex;
use std::sync::Arc;

/// Smallest pooled capacity (64 B).
pub const MIN_CLASS_SIZE: usize = 64;

/// Largest pooled capacity (64 KiB).
pub const MAX_CLASS_SIZE: usize = 64 * 1024;

/// Idle buffers kept per size class.
pub const MAX_FREE_PER_CLASS: usize = 64;

const CLASS_COUNT: usize =
    (MAX_CLASS_SIZE.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize + 1;

/// A shared, size-classed free list of `Vec<u8>`.
///
/// Cloning is cheap; clones share the same free lists.
#[derive(Clone)]
pub struct BytePool {
    classes: Option<Arc<Mutex<Vec<Vec<Vec<u8>>>>>>,
}

impl BytePool {
    pub fn new() -> Self {
        Self {
            classes: Some(Arc::new(Mutex::new(vec![Vec::new(); CLASS_COUNT]))),
        }
    }

    /// A pool that never retains anything; every `get` allocates.
    pub fn disabled() -> Self {
        Self { classes: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.classes.is_some()
    }

    /// Returns an empty buffer with capacity for at least `n` bytes.
    pub fn get(&self, n: usize) -> Vec<u8> {
        let Some(classes) = &self.classes else {
            return Vec::with_capacity(n);
        };
        let Some(class) = class_for(n) else {
            return Vec::with_capacity(n);
        };

        if let Some(buf) = classes.lock()[class].pop() {
            return buf;
        }
        Vec::with_capacity(class_size(class))
    }

    /// Returns `buf` to the pool.
    pub fn put(&self, mut buf: Vec<u8>) {
        let Some(classes) = &self.classes else {
            return;
        };
        let cap = buf.capacity();
        if !(MIN_CLASS_SIZE..MAX_CLASS_SIZE * 2).contains(&cap) {
            return;
        }
        // File under the largest class the buffer can fully serve.
        let class = (cap.ilog2() - MIN_CLASS_SIZE.ilog2()) as usize;

        buf.clear();
        let mut classes = classes.lock();
        let free = &mut classes[class];
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.classes
            .as_ref()
            .map(|classes| classes.lock().iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BytePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytePool")
            .field("enabled", &self.is_enabled())
            .field("idle", &self.idle())
            .finish()
    }
}

/// Smallest class whose buffers hold `n` bytes.
fn class_for(n: usize) -> Option<usize> {
    if n > MAX_CLASS_SIZE {
        return None;
    }
    let size = n.max(MIN_CLASS_SIZE).next_power_of_two();
    Some((size.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize)
}

fn class_size(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}
