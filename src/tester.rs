//! Timed set-membership probe.
//!
//! Decides whether the first element of a candidate group shares a cache
//! set with enough of the remainder to be evicted by them. The timing
//! backend is a trait so the detector logic can be exercised against the
//! sliced-LLC reference model instead of the hardware counters.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::line::Candidate;
use crate::timing::{self, InterruptPause};

pub type CandidateVec = SmallVec<[Candidate; 32]>;

/// Everything the probe needs from the machine.
pub trait AccessTimer {
    /// Latency of re-reading a line that was just read (cache hit).
    fn time_hit(&mut self, line: &Candidate) -> u64;
    /// Latency of reading a line that was just flushed (memory access).
    fn time_miss(&mut self, line: &Candidate) -> u64;
    /// Run the eviction experiment `runs` times, appending one sample per
    /// run to `out`: flush the group, touch the first line, pull the rest
    /// through the cache in order, fence, then time the first line again.
    fn time_evictions(&mut self, group: &[Candidate], runs: usize, out: &mut Vec<u64>);
}

/// Hardware backend over rdtsc/clflush.
pub struct TscTimer {
    sink: u64,
}

impl TscTimer {
    pub fn new() -> Self {
        TscTimer { sink: 0 }
    }
}

impl Default for TscTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessTimer for TscTimer {
    fn time_hit(&mut self, line: &Candidate) -> u64 {
        timing::touch(line.virt, &mut self.sink);
        timing::mfence();
        timing::time_access(line.virt, &mut self.sink)
    }

    fn time_miss(&mut self, line: &Candidate) -> u64 {
        timing::clflush(line.virt);
        timing::mfence();
        timing::time_access(line.virt, &mut self.sink)
    }

    fn time_evictions(&mut self, group: &[Candidate], runs: usize, out: &mut Vec<u64>) {
        let _pause = InterruptPause::new();
        for _ in 0..runs {
            for c in group {
                timing::clflush(c.virt);
            }
            timing::mfence();
            timing::touch(group[0].virt, &mut self.sink);
            timing::mfence();
            for c in &group[1..] {
                timing::touch(c.virt, &mut self.sink);
            }
            timing::mfence();
            out.push(timing::time_access(group[0].virt, &mut self.sink));
        }
    }
}

// Threshold leans toward the hit time so a probe only declares "evicted"
// when strongly convinced: a false positive would misassign a line.
const HIT_WEIGHT: f64 = 0.85;
const MISS_WEIGHT: f64 = 0.15;
const DECIDE_SAME_SET: f64 = 0.75;
const DECIDE_OTHER_SET: f64 = 0.25;
const MAX_BUDGET_FACTOR: usize = 8;

pub struct SetTester {
    max_lines: usize,
    base_runs: usize,
    runs: usize,
    lines: CandidateVec,
    hit_sum: u64,
    hit_count: u64,
    miss_sum: u64,
    miss_count: u64,
    rng: SmallRng,
    samples: Vec<u64>,
}

impl SetTester {
    pub fn new(max_lines: usize, base_runs: usize, seed: u64) -> Self {
        assert!(base_runs > 0);
        SetTester {
            max_lines,
            base_runs,
            runs: base_runs,
            lines: SmallVec::new(),
            hit_sum: 0,
            hit_count: 0,
            miss_sum: 0,
            miss_count: 0,
            rng: SmallRng::seed_from_u64(seed),
            samples: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn load(&mut self, group: &[Candidate]) {
        assert!(group.len() <= self.max_lines, "test group too large");
        self.lines.clear();
        self.lines.extend_from_slice(group);
    }

    pub fn loaded(&self) -> &[Candidate] {
        &self.lines
    }

    /// Widen the sample count to compensate for noise.
    pub fn double_runs(&mut self) {
        self.runs += self.base_runs;
    }

    pub fn restart_runs(&mut self) {
        self.runs = self.base_runs;
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Record one hit-time and one miss-time sample for `line`, updating
    /// the running averages and the derived discrimination threshold.
    pub fn warmup_line(&mut self, timer: &mut dyn AccessTimer, line: &Candidate) {
        let miss = timer.time_miss(line);
        let hit = timer.time_hit(line);
        self.miss_sum += miss;
        self.miss_count += 1;
        self.hit_sum += hit;
        self.hit_count += 1;
    }

    pub fn avg_hit_time(&self) -> f64 {
        self.hit_sum as f64 / self.hit_count.max(1) as f64
    }

    pub fn avg_miss_time(&self) -> f64 {
        self.miss_sum as f64 / self.miss_count.max(1) as f64
    }

    /// Access times above this are taken as LLC evictions.
    pub fn llc_max_access_time(&self) -> f64 {
        HIT_WEIGHT * self.avg_hit_time() + MISS_WEIGHT * self.avg_miss_time()
    }

    /// Does the tail of the loaded group evict its first element?
    ///
    /// Counts samples above the threshold in batches; answers as soon as
    /// the cumulative above-threshold ratio leaves the (0.25, 0.75) band,
    /// growing the sample budget up to a cap otherwise. An indecisive
    /// probe answers "no": a false negative only costs another draw.
    pub fn is_same_set(&mut self, timer: &mut dyn AccessTimer) -> bool {
        if self.lines.len() < 2 {
            return false;
        }
        debug_assert!(self.hit_count > 0, "probe used before warmup");
        let threshold = self.llc_max_access_time();
        // Rotate the batch size to decorrelate from periodic noise.
        let mut batch = self.runs + 2 * self.rng.gen_range(0..3usize);
        let cap = self.runs * MAX_BUDGET_FACTOR;
        let mut above = 0usize;
        let mut total = 0usize;
        loop {
            self.samples.clear();
            timer.time_evictions(&self.lines, batch, &mut self.samples);
            above += self.samples.iter().filter(|&&s| s as f64 > threshold).count();
            total += batch;
            let ratio = above as f64 / total as f64;
            if ratio > DECIDE_SAME_SET {
                return true;
            }
            if ratio < DECIDE_OTHER_SET {
                return false;
            }
            if total >= cap {
                return false;
            }
            batch = total.min(cap - total);
        }
    }

    /// Probe with `extra` appended to the loaded group.
    pub fn is_same_set_with(&mut self, timer: &mut dyn AccessTimer, extra: Candidate) -> bool {
        self.lines.push(extra);
        let verdict = self.is_same_set(timer);
        self.lines.pop();
        verdict
    }

    /// Isolate the essential members of the loaded group.
    ///
    /// Precondition: the loaded group is judged same-set. Candidates are
    /// removed from the tail one at a time; if removal breaks the verdict
    /// the candidate was essential and is swapped into the kept prefix.
    /// Stops once the prefix holds the measured line plus `ways` essential
    /// lines. Returns the prefix, or empty if the group cannot supply it.
    pub fn same_set_group(&mut self, timer: &mut dyn AccessTimer, ways: usize) -> CandidateVec {
        if !self.is_same_set(timer) {
            return SmallVec::new();
        }
        if self.lines.len() == ways + 1 {
            // Exactly one over the eviction threshold: all essential.
            return self.lines.clone();
        }
        let mut kept = 1;
        while kept < ways + 1 {
            if self.lines.len() <= kept {
                return SmallVec::new();
            }
            let candidate = self.lines.pop().unwrap();
            if self.is_same_set(timer) {
                // Still evicts without it.
                continue;
            }
            self.lines.push(candidate);
            let last = self.lines.len() - 1;
            self.lines.swap(kept, last);
            kept += 1;
        }
        self.lines.truncate(kept);
        self.lines.clone()
    }
}
