//! Touch workers: threads that walk partitioned eviction rings.
//!
//! Each worker owns a (mutex, condvar) pair. The controller hands a
//! prepared job over under the mutex and signals; the worker holds its
//! mutex for the whole execution, so a second dispatch while a job runs
//! fails fast with `Busy`. The pollute loop itself is cancelled
//! cooperatively through a process-wide atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::CommandError;
use crate::line::{LineHandle, LineTable};
use crate::timing::{self, InterruptPause};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TouchOp {
    Touch,
    Flush,
    Stop,
}

/// Operator-facing job descriptor, filled from command tokens.
#[derive(Clone, Debug)]
pub struct TouchJob {
    pub op: TouchOp,
    /// Inclusive range over the in-slice set index.
    pub begin_set: usize,
    pub end_set: usize,
    pub lines_per_set: usize,
    pub partitions: usize,
    /// How many workers to spread the range over.
    pub workers: usize,
    pub disable_interrupts: bool,
    pub flush_before: bool,
    pub flush_after: bool,
}

impl TouchJob {
    pub fn defaults(sets_per_slice: usize) -> Self {
        TouchJob {
            op: TouchOp::Touch,
            begin_set: 0,
            end_set: sets_per_slice - 1,
            lines_per_set: 1,
            partitions: 1,
            workers: 1,
            disable_interrupts: false,
            flush_before: false,
            flush_after: false,
        }
    }
}

/// A resolved job: ring heads per partition plus the table to walk them.
pub struct PreparedJob {
    pub op: TouchOp,
    pub heads: Vec<LineHandle>,
    pub table: LineTable,
    pub disable_interrupts: bool,
    pub flush_before: bool,
    pub flush_after: bool,
}

struct JobSlot {
    job: Mutex<Option<PreparedJob>>,
    cv: Condvar,
}

pub struct TouchWorker {
    slot: Arc<JobSlot>,
    run: Arc<AtomicBool>,
}

impl TouchWorker {
    /// Spawn the worker thread; it parks on its condvar until a job lands.
    pub fn spawn(id: usize, run: Arc<AtomicBool>) -> Self {
        let slot = Arc::new(JobSlot {
            job: Mutex::new(None),
            cv: Condvar::new(),
        });
        let thread_slot = slot.clone();
        let thread_run = run.clone();
        std::thread::Builder::new()
            .name(format!("touch-{}", id))
            .spawn(move || worker_loop(thread_slot, thread_run))
            .expect("failed to spawn touch worker");
        TouchWorker { slot, run }
    }

    /// Hand a job to the worker. `Busy` while one is still executing.
    pub fn send_job(&self, job: PreparedJob) -> Result<(), CommandError> {
        let Ok(mut pending) = self.slot.job.try_lock() else {
            return Err(CommandError::Busy);
        };
        if job.heads.is_empty() {
            warn!("dropping touch job with no partitions");
            return Ok(());
        }
        *pending = Some(job);
        self.slot.cv.notify_one();
        Ok(())
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.slot
            .job
            .try_lock()
            .map(|pending| pending.is_none())
            .unwrap_or(false)
    }

    // The worker holds its mutex for the whole execution, so a failed
    // try_lock means a job is running right now.
    #[cfg(test)]
    pub(crate) fn is_executing(&self) -> bool {
        self.slot.job.try_lock().is_err()
    }
}

fn worker_loop(slot: Arc<JobSlot>, run: Arc<AtomicBool>) {
    let mut pending = slot.job.lock().unwrap();
    loop {
        let Some(job) = pending.take() else {
            pending = slot.cv.wait(pending).unwrap();
            continue;
        };
        // The mutex stays held while the job runs: dispatch during
        // execution must see Busy, not queue behind us.
        let start = Instant::now();
        execute(&job, &run);
        let elapsed = start.elapsed();
        info!(
            "[{}] {:?} job over {} partitions finished after {:.2} min ({:?})",
            std::thread::current().name().unwrap_or("touch"),
            job.op,
            job.heads.len(),
            elapsed.as_secs_f64() / 60.0,
            elapsed
        );
    }
}

fn execute(job: &PreparedJob, run: &AtomicBool) {
    match job.op {
        TouchOp::Flush => flush_partitions(job),
        TouchOp::Touch => {
            if job.flush_before {
                flush_partitions(job);
            }
            pollute(job, run);
            if job.flush_after {
                flush_partitions(job);
            }
        }
        // Stop never reaches a worker; the controller clears the flag.
        TouchOp::Stop => {}
    }
}

/// Walk all rings round-robin until the flag clears: one stride through
/// each ring per outer iteration keeps the fills of the covered sets
/// outstanding and starves LRU across them.
fn pollute(job: &PreparedJob, run: &AtomicBool) {
    run.store(true, Ordering::Release);
    let mut heads = job.heads.clone();
    let pause = if job.disable_interrupts {
        InterruptPause::new()
    } else {
        None
    };
    while run.load(Ordering::Acquire) {
        for head in heads.iter_mut() {
            *head = job.table.next(*head);
        }
    }
    drop(pause);
    timing::mfence();
}

fn flush_partitions(job: &PreparedJob) {
    for &head in &job.heads {
        job.table.flush_ring(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::line::LineArena;
    use crate::list::LineList;
    use crate::translate::IdentityTranslator;
    use std::time::Duration;

    fn test_arena() -> LineArena {
        LineArena::new(64, 8, 64 * PAGE_SIZE, Box::new(IdentityTranslator)).unwrap()
    }

    fn ring_job(arena: &mut LineArena, partitions: usize, lines: usize, op: TouchOp) -> PreparedJob {
        let mut list = LineList::new();
        for _ in 0..lines {
            let h = arena.allocate().unwrap();
            list.push_back(arena, h);
        }
        let parts = list.partition(arena, partitions);
        let heads = parts.iter().filter_map(|p| p.front()).collect();
        PreparedJob {
            op,
            heads,
            table: arena.table(),
            disable_interrupts: false,
            flush_before: false,
            flush_after: false,
        }
    }

    fn wait_idle(worker: &TouchWorker, deadline: Duration) {
        let start = Instant::now();
        while !worker.is_idle() {
            assert!(start.elapsed() < deadline, "worker never went idle");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn touch_job_runs_until_cancelled() {
        let run = Arc::new(AtomicBool::new(false));
        let worker = TouchWorker::spawn(0, run.clone());
        let mut arena = test_arena();
        let job = ring_job(&mut arena, 4, 16, TouchOp::Touch);
        worker.send_job(job).unwrap();
        // Worker flips the flag on when the pollute loop starts.
        let start = Instant::now();
        while !run.load(Ordering::Acquire) {
            assert!(start.elapsed() < Duration::from_secs(5), "job never started");
            std::thread::yield_now();
        }
        // Second dispatch must bounce while the loop runs.
        let other = ring_job(&mut arena, 2, 8, TouchOp::Touch);
        assert!(matches!(worker.send_job(other), Err(CommandError::Busy)));
        std::thread::sleep(Duration::from_millis(50));
        run.store(false, Ordering::Release);
        // One partition stride later the worker is idle again.
        wait_idle(&worker, Duration::from_secs(5));
    }

    #[test]
    fn flush_job_terminates_on_its_own() {
        let run = Arc::new(AtomicBool::new(false));
        let worker = TouchWorker::spawn(1, run.clone());
        let mut arena = test_arena();
        let job = ring_job(&mut arena, 3, 9, TouchOp::Flush);
        worker.send_job(job).unwrap();
        // A flush walks each ring once and goes back to waiting.
        wait_idle(&worker, Duration::from_secs(5));
    }
}
