//! Growable bitmap id allocator.
//!
//! Bit **1** = in use, bit **0** = free. Allocation always hands out the
//! lowest free id; when every id is taken the bitmap grows by its initial
//! size, up to a hard maximum.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone)]
pub struct IdPool {
    words: Vec<u64>,
    /// Ids currently tracked.
    capacity: usize,
    step: usize,
    max: usize,
    used: usize,
    /// Word index below which every id is known to be in use.
    hint: usize,
}

impl IdPool {
    /// A pool of `initial` ids that may grow to `max`.
    pub fn new(initial: usize, max: usize) -> Self {
        let initial = initial.clamp(1, max.max(1));
        Self {
            words: vec![0; initial.div_ceil(64)],
            capacity: initial,
            step: initial,
            max: max.max(initial),
            used: 0,
            hint: 0,
        }
    }

    /// A pool that never grows.
    pub fn fixed(size: usize) -> Self {
        Self::new(size, size)
    }

    /// Reserve the lowest free id.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.used == self.capacity && !self.grow() {
            return None;
        }
        for w in self.hint..self.words.len() {
            let word = self.words[w];
            if word == u64::MAX {
                continue;
            }
            let id = w * 64 + (!word).trailing_zeros() as usize;
            if id >= self.capacity {
                break;
            }
            self.words[w] |= 1 << (id % 64);
            self.used += 1;
            self.hint = w;
            return Some(id);
        }
        None
    }

    /// Reserve a specific id (boot-time fixed ids such as tid 0).
    pub fn claim(&mut self, id: usize) -> bool {
        while id >= self.capacity {
            if !self.grow() {
                return false;
            }
        }
        if self.contains(id) {
            return false;
        }
        self.words[id / 64] |= 1 << (id % 64);
        self.used += 1;
        true
    }

    /// Return `id` to the pool.
    ///
    /// # Panics
    /// If `id` is not allocated: a double free means two owners.
    pub fn free(&mut self, id: usize) {
        assert!(self.contains(id), "id {} freed twice", id);
        self.words[id / 64] &= !(1 << (id % 64));
        self.used -= 1;
        self.hint = self.hint.min(id / 64);
    }

    pub fn contains(&self, id: usize) -> bool {
        id < self.capacity && self.words[id / 64] & (1 << (id % 64)) != 0
    }

    /// Ids currently allocated.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free every id at once.
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.used = 0;
        self.hint = 0;
    }

    fn grow(&mut self) -> bool {
        if self.capacity >= self.max {
            return false;
        }
        self.capacity = (self.capacity + self.step).min(self.max);
        self.words.resize(self.capacity.div_ceil(64), 0);
        klog::trace!("id pool: grown to {} ids", self.capacity);
        true
    }
}
