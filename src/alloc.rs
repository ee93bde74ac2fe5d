//! Owns every cache line, groups them into per-set buckets and drives
//! slice detection until each (slice, set) pair holds its quota.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::detect::{DetectOutcome, SliceDetector};
use crate::error::AllocError;
use crate::geometry::CacheGeometry;
use crate::line::{LineArena, LineHandle, LineTable};
use crate::list::LineList;
use crate::tester::AccessTimer;
use crate::timing;
use crate::touch::{PreparedJob, TouchJob};
use crate::translate::Translator;

/// Bucket growths per set before the allocator suspects noise instead of
/// bad luck, audits every physical address and widens the timing runs.
const MAX_GROW_RETRIES: usize = 10;

/// Consecutive unusable lines (translation failures) tolerated while
/// filling a bucket.
const MAX_LINE_FAILURES: usize = 128;

pub struct LineAllocator {
    geometry: CacheGeometry,
    lines_per_set: usize,
    arena: LineArena,
    buckets: BTreeMap<usize, BTreeSet<LineHandle>>,
    /// False while buckets are keyed by in-slice set, true once keyed by
    /// full (slice, set) index.
    repartitioned: bool,
    last_result_file: Option<PathBuf>,
}

impl LineAllocator {
    pub fn new(
        geometry: CacheGeometry,
        lines_per_set: usize,
        pool_bytes: usize,
        translator: Box<dyn Translator>,
    ) -> Result<Self> {
        let lines_per_set = if lines_per_set == 0 {
            geometry.ways
        } else {
            lines_per_set
        };
        let arena = LineArena::new(
            geometry.line_size,
            geometry.sets_per_slice(),
            pool_bytes,
            translator,
        )?;
        Ok(LineAllocator {
            geometry,
            lines_per_set,
            arena,
            buckets: BTreeMap::new(),
            repartitioned: false,
            last_result_file: None,
        })
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn lines_per_set(&self) -> usize {
        self.lines_per_set
    }

    pub fn sets_per_slice(&self) -> usize {
        self.geometry.sets_per_slice()
    }

    pub fn bucket_len(&self, key: usize) -> usize {
        self.buckets.get(&key).map_or(0, |b| b.len())
    }

    pub fn classified_lines(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    /// Frozen handle table for the touch workers.
    pub fn ring_table(&self) -> LineTable {
        self.arena.table()
    }

    fn bucket_key(&self, h: LineHandle) -> usize {
        self.arena
            .full_set(h)
            .unwrap_or_else(|| self.arena.in_slice_set(h))
    }

    fn put_line(&mut self, h: LineHandle) {
        let key = self.bucket_key(h);
        self.buckets.entry(key).or_default().insert(h);
    }

    fn discard_line(&mut self, h: LineHandle) {
        let in_slice = self.arena.in_slice_set(h);
        if let Some(b) = self.buckets.get_mut(&in_slice) {
            b.remove(&h);
        }
        if let Some(full) = self.arena.full_set(h) {
            if let Some(b) = self.buckets.get_mut(&full) {
                b.remove(&h);
            }
        }
        self.arena.discard(h);
    }

    /// Grow the bucket of `set` until it holds `count` lines. Fresh lines
    /// land in whatever bucket their physical address selects, so many
    /// other buckets fill up along the way.
    pub fn allocate_set(&mut self, set: usize, count: usize) -> Result<(), AllocError> {
        let mut failures = 0;
        while self.bucket_len(set) < count {
            match self.arena.allocate() {
                Ok(h) => {
                    failures = 0;
                    self.put_line(h);
                }
                Err(crate::error::LineError::Translation(e)) => {
                    failures += 1;
                    debug!("unusable line dropped: {}", e);
                    if failures >= MAX_LINE_FAILURES {
                        return Err(crate::error::LineError::Translation(e).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.arena.gc();
        Ok(())
    }

    /// Build eviction sets for every in-slice set.
    ///
    /// Per set the loop grows the bucket while the detector reports
    /// starvation, discards lines whose slice flips, and after enough
    /// futile growths audits all physical addresses and widens the
    /// timing runs. Ends by rebucketing everything under full set keys.
    pub fn allocate_all_sets(
        &mut self,
        detector: &mut SliceDetector,
        timer: &mut dyn AccessTimer,
    ) -> Result<(), AllocError> {
        info!("[allocation] initial seeding");
        self.allocate_set(0, 2 * self.geometry.slices * self.lines_per_set)?;
        info!(
            "[allocation] seeded, pool holds {:.2} GB",
            self.arena.total_allocated() as f64 / (1u64 << 30) as f64
        );

        let sets_per_slice = self.geometry.sets_per_slice();
        for cur_set in 0..sets_per_slice {
            detector.restart_runs();
            let mut more_lines = self.bucket_len(cur_set) < self.lines_per_set;
            let mut grow_retries = 0;
            loop {
                if more_lines {
                    let have = self.bucket_len(cur_set);
                    self.allocate_set(cur_set, have + self.lines_per_set)?;
                    grow_retries += 1;
                    more_lines = false;
                    debug!(
                        "[set {:5}] grown to {} lines ({:.2} GB)",
                        cur_set,
                        self.bucket_len(cur_set),
                        self.arena.total_allocated() as f64 / (1u64 << 30) as f64
                    );
                }
                let bucket = self
                    .buckets
                    .get(&cur_set)
                    .expect("bucket exists after growth");
                match detector.detect_all_slices(&mut self.arena, bucket, timer) {
                    DetectOutcome::Done => break,
                    DetectOutcome::NeedMoreLines => {
                        more_lines = true;
                        if grow_retries >= MAX_GROW_RETRIES {
                            self.audit_physical_addresses(cur_set)?;
                            detector.double_runs();
                            grow_retries = 0;
                        }
                    }
                    DetectOutcome::Reassigned(h) => {
                        warn!(
                            "[set {:5}] slice flipped for line {:#x}, discarding",
                            cur_set,
                            self.arena.phys(h)
                        );
                        self.discard_line(h);
                        detector.double_runs();
                    }
                    DetectOutcome::Undetected(count) => {
                        debug!(
                            "[set {:5}] {} lines undetected, widening runs",
                            cur_set, count
                        );
                        detector.double_runs();
                    }
                }
            }
            if cur_set % 256 == 255 {
                info!("[set {:5}] detected", cur_set);
            }
        }

        self.repartition();
        Ok(())
    }

    /// After the growth budget is spent, make sure the timing trouble is
    /// not a moved page.
    fn audit_physical_addresses(&mut self, set: usize) -> Result<(), AllocError> {
        let handles: Vec<LineHandle> = self
            .buckets
            .get(&set)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();
        let mut moved = false;
        for h in handles {
            if let Err(e) = self.arena.validate_physical(h) {
                error!("[set {:5}] {}", set, e);
                moved = true;
            }
        }
        if moved {
            return Err(AllocError::AddressAudit { set });
        }
        Ok(())
    }

    /// Drop the in-slice bucketing: classified lines move to their full
    /// (slice, set) bucket, unclassified lines go back to the pool.
    pub fn repartition(&mut self) {
        let old = std::mem::take(&mut self.buckets);
        let mut discarded = 0;
        for (_, bucket) in old {
            for h in bucket {
                if self.arena.slice(h).is_some() {
                    let key = self.bucket_key(h);
                    self.buckets.entry(key).or_default().insert(h);
                } else {
                    self.arena.discard(h);
                    discarded += 1;
                }
            }
        }
        self.arena.gc();
        self.repartitioned = true;
        info!(
            "[repartition] {} buckets, {} unclassified lines discarded",
            self.buckets.len(),
            discarded
        );
    }

    fn buckets_for_set(&self, set: usize) -> Vec<usize> {
        if self.repartitioned {
            (0..self.geometry.slices)
                .map(|z| set | z * self.geometry.sets_per_slice())
                .collect()
        } else {
            vec![set]
        }
    }

    /// `count` lines out of one bucket as a circular list.
    fn get_bucket_lines(&mut self, key: usize, count: usize) -> Result<LineList, AllocError> {
        let have = self.bucket_len(key);
        if have < count {
            return Err(AllocError::NotEnoughLines {
                set: key,
                have,
                want: count,
            });
        }
        let handles: Vec<LineHandle> = self.buckets[&key].iter().copied().take(count).collect();
        let mut list = LineList::new();
        for h in handles {
            list.push_back(&mut self.arena, h);
        }
        Ok(list)
    }

    /// One circular list holding `count_per_set` lines of every bucket
    /// covering the in-slice sets `begin..=end`. Validated before return.
    pub fn get_sets(
        &mut self,
        begin: usize,
        end: usize,
        count_per_set: usize,
    ) -> Result<LineList, AllocError> {
        let mut ret = LineList::new();
        for set in begin..=end {
            for key in self.buckets_for_set(set) {
                let sub = self.get_bucket_lines(key, count_per_set)?;
                ret.append(&mut self.arena, sub);
            }
        }
        ret.validate(&mut self.arena)?;
        Ok(ret)
    }

    /// Resolve a job descriptor into ring heads the workers can walk.
    pub fn prepare_job(&mut self, job: &TouchJob) -> Result<PreparedJob, AllocError> {
        let list = self.get_sets(job.begin_set, job.end_set, job.lines_per_set)?;
        info!("[job] {} lines over {} partitions", list.len(), job.partitions);
        let parts = list.partition(&mut self.arena, job.partitions);
        let heads: Vec<LineHandle> = parts.iter().filter_map(|p| p.front()).collect();
        Ok(PreparedJob {
            op: job.op,
            heads,
            table: self.arena.table(),
            disable_interrupts: job.disable_interrupts,
            flush_before: job.flush_before,
            flush_after: job.flush_after,
        })
    }

    /// Persist `full_set;slice;phys` of every classified line, replacing
    /// the previously written file.
    pub fn write(&mut self, dir: &Path) -> Result<PathBuf, AllocError> {
        let path = dir.join(format!("lineallocator-{}.txt", timing::rdtsc()));
        let mut out = File::create(&path)?;
        writeln!(out, "#SET;SLICE;ADDR")?;
        for bucket in self.buckets.values() {
            for &h in bucket {
                let Some(slice) = self.arena.slice(h) else {
                    continue;
                };
                writeln!(
                    out,
                    "{:x};{:x};{:x}",
                    self.arena.full_set(h).unwrap(),
                    slice,
                    self.arena.phys(h)
                )?;
            }
        }
        info!("[save] results written to {}", path.display());
        if let Some(old) = self.last_result_file.take() {
            let _ = fs::remove_file(old);
        }
        self.last_result_file = Some(path.clone());
        Ok(path)
    }

    /// Trim every bucket down to `max` lines, returning the rest to the
    /// pool.
    pub fn clean(&mut self, max: usize) {
        let keys: Vec<usize> = self.buckets.keys().copied().collect();
        for key in keys {
            while self.bucket_len(key) > max {
                let h = *self.buckets[&key].iter().next().unwrap();
                self.discard_line(h);
            }
        }
        self.arena.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::model::{ModelTimer, SlicedCache, SliceOracle};
    use crate::translate::IdentityTranslator;
    use std::cell::Cell;
    use std::collections::HashMap;

    const LINE: usize = 64;
    const SETS_PER_SLICE: usize = 8;
    const AVAIL_WAYS: usize = 2;
    const SLICES: usize = 4;
    const LINES_PER_SET: usize = 3;

    fn mini_geometry() -> CacheGeometry {
        CacheGeometry {
            level: 3,
            line_size: LINE,
            sets: SETS_PER_SLICE * SLICES,
            ways: 4,
            slices: SLICES,
        }
    }

    fn normal_slice(phys: u64) -> usize {
        ((phys / LINE as u64) as usize / SETS_PER_SLICE) % SLICES
    }

    fn model_timer(oracle: SliceOracle) -> ModelTimer {
        ModelTimer::new(SlicedCache::new(
            LINE,
            SETS_PER_SLICE,
            AVAIL_WAYS,
            SLICES,
            oracle,
        ))
    }

    fn allocator() -> LineAllocator {
        LineAllocator::new(
            mini_geometry(),
            LINES_PER_SET,
            4096 * PAGE_SIZE,
            Box::new(IdentityTranslator),
        )
        .unwrap()
    }

    fn detector() -> SliceDetector {
        SliceDetector::new(SLICES, AVAIL_WAYS, LINES_PER_SET, 4, 17)
    }

    /// Detected slice ids are labels in detection order, not the hidden
    /// hash values; the partition must map onto the oracle's one-to-one.
    fn assert_partition_matches_oracle<'a>(
        a: &LineAllocator,
        handles: impl Iterator<Item = &'a LineHandle>,
    ) {
        let mut label_to_truth: HashMap<usize, usize> = HashMap::new();
        for &h in handles {
            let label = a.arena.slice(h).expect("classified");
            let truth = normal_slice(a.arena.phys(h));
            match label_to_truth.insert(label, truth) {
                None => {}
                Some(prev) => assert_eq!(prev, truth, "label {} split across slices", label),
            }
        }
        let mut truths: Vec<usize> = label_to_truth.values().copied().collect();
        truths.sort_unstable();
        truths.dedup();
        assert_eq!(truths.len(), label_to_truth.len(), "labels collide");
    }

    #[test]
    fn allocate_set_reaches_its_target() {
        let mut a = allocator();
        a.allocate_set(3, 8).unwrap();
        assert!(a.bucket_len(3) >= 8);
        // Lines land in many buckets along the way.
        let total: usize = (0..SETS_PER_SLICE).map(|s| a.bucket_len(s)).sum();
        assert!(total > 8);
        for &h in &a.buckets[&3] {
            assert_eq!(a.arena.in_slice_set(h), 3);
        }
    }

    #[test]
    fn full_allocation_classifies_every_bucket() {
        let mut a = allocator();
        let mut d = detector();
        let mut timer = model_timer(Box::new(normal_slice));
        a.allocate_all_sets(&mut d, &mut timer).unwrap();
        assert!(a.repartitioned);
        // Every (slice, set) bucket reached the quota and keys agree with
        // the tags.
        for set in 0..SETS_PER_SLICE * SLICES {
            assert!(
                a.bucket_len(set) >= LINES_PER_SET,
                "bucket {} too small",
                set
            );
            for &h in &a.buckets[&set] {
                assert_eq!(a.arena.full_set(h), Some(set));
                assert_eq!(a.arena.in_slice_set(h), set % SETS_PER_SLICE);
            }
        }
        // Per in-slice set, the detected labels partition the lines the
        // same way the hidden hash does.
        for in_slice in 0..SETS_PER_SLICE {
            let handles: Vec<LineHandle> = (0..SLICES)
                .flat_map(|z| a.buckets[&(in_slice | z * SETS_PER_SLICE)].iter().copied())
                .collect();
            assert_partition_matches_oracle(&a, handles.iter());
        }
    }

    #[test]
    fn get_sets_concatenates_quota_lines_per_bucket() {
        let mut a = allocator();
        let mut d = detector();
        let mut timer = model_timer(Box::new(normal_slice));
        a.allocate_all_sets(&mut d, &mut timer).unwrap();
        let list = a.get_sets(0, 1, 2).unwrap();
        assert_eq!(list.len(), 2 * SLICES * 2);
        let err = a.get_sets(0, 0, 1000).unwrap_err();
        assert!(matches!(err, AllocError::NotEnoughLines { .. }));
    }

    #[test]
    fn undersized_bucket_recovers_by_growing() {
        let mut a = allocator();
        let mut d = detector();
        let mut timer = model_timer(Box::new(normal_slice));
        let starved = d.group_size_for(0) - 1;
        a.allocate_set(5, starved).unwrap();
        let mut growths = 0;
        loop {
            let bucket = a.buckets.get(&5).unwrap();
            match d.detect_all_slices(&mut a.arena, bucket, &mut timer) {
                DetectOutcome::Done => break,
                DetectOutcome::NeedMoreLines => {
                    growths += 1;
                    assert!(growths <= MAX_GROW_RETRIES, "never converged");
                    let have = a.bucket_len(5);
                    a.allocate_set(5, have + LINES_PER_SET).unwrap();
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert!(growths >= 1);
    }

    #[test]
    fn flipping_line_is_discarded_and_the_rest_classified() {
        let mut a = allocator();
        let mut d = detector();
        // Seed first so a victim line exists before detection starts.
        a.allocate_set(0, 2 * SLICES * LINES_PER_SET).unwrap();
        let victim = *a.buckets[&0].iter().next().unwrap();
        let victim_phys = a.arena.phys(victim);
        // Chameleon oracle: the victim reports whatever slice the probe
        // is currently exercising, so it tests positive for one slice,
        // gets tagged, then tests positive again for the next.
        let last_seen = Cell::new(0usize);
        let oracle: SliceOracle = Box::new(move |p| {
            if p == victim_phys {
                last_seen.get()
            } else {
                let s = normal_slice(p);
                last_seen.set(s);
                s
            }
        });
        let mut timer = model_timer(oracle);
        a.allocate_all_sets(&mut d, &mut timer).unwrap();
        assert!(!a.arena.is_live(victim));
        for bucket in a.buckets.values() {
            assert!(!bucket.contains(&victim));
        }
        for in_slice in 0..SETS_PER_SLICE {
            let handles: Vec<LineHandle> = (0..SLICES)
                .flat_map(|z| a.buckets[&(in_slice | z * SETS_PER_SLICE)].iter().copied())
                .collect();
            assert_partition_matches_oracle(&a, handles.iter());
        }
    }

    #[test]
    fn clean_trims_buckets_to_the_cap() {
        let mut a = allocator();
        let mut d = detector();
        let mut timer = model_timer(Box::new(normal_slice));
        a.allocate_all_sets(&mut d, &mut timer).unwrap();
        a.clean(2);
        for set in 0..SETS_PER_SLICE * SLICES {
            assert!(a.bucket_len(set) <= 2);
        }
    }

    #[test]
    fn result_file_lists_classified_lines_and_replaces_itself() {
        let dir = std::env::temp_dir();
        let mut a = allocator();
        let mut d = detector();
        let mut timer = model_timer(Box::new(normal_slice));
        a.allocate_all_sets(&mut d, &mut timer).unwrap();
        let first = a.write(&dir).unwrap();
        let contents = fs::read_to_string(&first).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("#SET;SLICE;ADDR"));
        let body: Vec<&str> = lines.collect();
        assert_eq!(body.len(), a.classified_lines());
        for row in &body {
            let fields: Vec<&str> = row.split(';').collect();
            assert_eq!(fields.len(), 3);
            let set = usize::from_str_radix(fields[0], 16).unwrap();
            let slice = usize::from_str_radix(fields[1], 16).unwrap();
            let phys = u64::from_str_radix(fields[2], 16).unwrap();
            assert!(slice < SLICES);
            assert_eq!(
                set,
                ((phys / LINE as u64) as usize % SETS_PER_SLICE) | slice * SETS_PER_SLICE
            );
        }
        let second = a.write(&dir).unwrap();
        assert!(!first.exists());
        assert!(second.exists());
        let _ = fs::remove_file(second);
    }
}
