//! Reference model of a sliced, set-associative LLC.
//!
//! Backs the probe and detector tests with deterministic timings: the
//! cache behaves as Z slices of LRU sets, the slice of a physical address
//! is chosen by an injected oracle, and reads report a hit or memory
//! latency accordingly.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::line::Candidate;
use crate::tester::AccessTimer;

/// Maps a physical address to its hidden slice id.
pub type SliceOracle = Box<dyn Fn(u64) -> usize>;

pub struct SlicedCache {
    line_size: usize,
    sets_per_slice: usize,
    sets: Vec<Vec<LruCache<u64, ()>>>,
    oracle: SliceOracle,
}

impl SlicedCache {
    pub const HIT_LATENCY: usize = 4;
    pub const MISS_LATENCY: usize = 48;

    pub fn new(
        line_size: usize,
        sets_per_slice: usize,
        ways: usize,
        slices: usize,
        oracle: SliceOracle,
    ) -> Self {
        assert!(sets_per_slice.is_power_of_two());
        let sets = (0..slices)
            .map(|_| {
                (0..sets_per_slice)
                    .map(|_| LruCache::new(NonZeroUsize::new(ways).unwrap()))
                    .collect()
            })
            .collect();
        SlicedCache {
            line_size,
            sets_per_slice,
            sets,
            oracle,
        }
    }

    pub fn slice_of(&self, phys: u64) -> usize {
        (self.oracle)(phys)
    }

    fn place(&self, phys: u64) -> (usize, usize, u64) {
        let line = phys / self.line_size as u64;
        let slice = self.slice_of(phys);
        let set = (line as usize) % self.sets_per_slice;
        (slice, set, line)
    }

    pub fn read(&mut self, phys: u64) -> usize {
        let (slice, set, line) = self.place(phys);
        let lru = &mut self.sets[slice][set];
        if lru.get(&line).is_some() {
            Self::HIT_LATENCY
        } else {
            lru.put(line, ());
            Self::MISS_LATENCY
        }
    }

    pub fn flush(&mut self, phys: u64) {
        let (slice, set, line) = self.place(phys);
        self.sets[slice][set].pop(&line);
    }
}

/// Deterministic `AccessTimer` over the reference model.
pub struct ModelTimer {
    pub cache: SlicedCache,
}

impl ModelTimer {
    pub fn new(cache: SlicedCache) -> Self {
        ModelTimer { cache }
    }
}

impl AccessTimer for ModelTimer {
    fn time_hit(&mut self, line: &Candidate) -> u64 {
        self.cache.read(line.phys);
        self.cache.read(line.phys) as u64
    }

    fn time_miss(&mut self, line: &Candidate) -> u64 {
        self.cache.flush(line.phys);
        self.cache.read(line.phys) as u64
    }

    fn time_evictions(&mut self, group: &[Candidate], runs: usize, out: &mut Vec<u64>) {
        for _ in 0..runs {
            for c in group {
                self.cache.flush(c.phys);
            }
            self.cache.read(group[0].phys);
            for c in &group[1..] {
                self.cache.read(c.phys);
            }
            out.push(self.cache.read(group[0].phys) as u64);
        }
    }
}
