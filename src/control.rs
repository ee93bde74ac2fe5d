//! Operator command dispatch.
//!
//! One controller thread reads the command queue and turns `touch`
//! messages into jobs for the worker pool. Workers share a single
//! cancellation flag; `stop` clears it and a `Busy` worker forces it
//! clear as well so the pool can be reclaimed.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::alloc::LineAllocator;
use crate::error::CommandError;
use crate::fifo::{CommandQueue, Message};
use crate::touch::{TouchJob, TouchOp, TouchWorker};

pub struct Controller {
    allocator: LineAllocator,
    workers: Vec<TouchWorker>,
    touch_forever: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(allocator: LineAllocator, worker_count: usize) -> Self {
        let touch_forever = Arc::new(AtomicBool::new(false));
        let workers = (0..worker_count.max(1))
            .map(|id| TouchWorker::spawn(id, touch_forever.clone()))
            .collect();
        Controller {
            allocator,
            workers,
            touch_forever,
        }
    }

    /// Message loop; returns cleanly on `quit`, errors only on queue
    /// failure. Command errors are logged and the loop keeps going.
    pub fn run(&mut self, queue: &mut CommandQueue) -> Result<()> {
        loop {
            let mut msg = queue.read_message()?;
            info!("[receive] {}", msg.raw());
            match self.dispatch(&mut msg) {
                Ok(ControlFlow::Break(())) => return Ok(()),
                Ok(ControlFlow::Continue(())) => {}
                Err(CommandError::Busy) => {
                    warn!("[busy] already running a touch job, forcing stop");
                    self.touch_forever.store(false, Ordering::Release);
                }
                Err(e) => warn!("[msg error] {}", e),
            }
        }
    }

    fn dispatch(&mut self, msg: &mut Message) -> Result<ControlFlow<()>, CommandError> {
        let op = msg.pop_string()?;
        match op.as_str() {
            "q" | "quit" => Ok(ControlFlow::Break(())),
            "t" | "touch" => {
                let defaults = TouchJob::defaults(self.allocator.sets_per_slice());
                let job = parse_touch(msg, defaults)?;
                self.dispatch_touch(job)?;
                Ok(ControlFlow::Continue(()))
            }
            _ => Err(CommandError::UnknownOperation(op)),
        }
    }

    fn dispatch_touch(&mut self, job: TouchJob) -> Result<(), CommandError> {
        if job.op == TouchOp::Stop {
            self.touch_forever.store(false, Ordering::Release);
            return Ok(());
        }
        if job.end_set < job.begin_set {
            return Err(CommandError::BadRange {
                begin: job.begin_set,
                end: job.end_set,
            });
        }
        let workers = job.workers.clamp(1, self.workers.len());
        let span = job.end_set - job.begin_set + 1;
        if span % workers != 0 {
            return Err(CommandError::UnevenSplit {
                begin: job.begin_set,
                end: job.end_set,
                workers,
            });
        }
        let chunk = span / workers;
        for (i, worker) in self.workers.iter().take(workers).enumerate() {
            let mut part = job.clone();
            part.partitions = job.partitions.max(1);
            part.begin_set = job.begin_set + i * chunk;
            part.end_set = part.begin_set + chunk - 1;
            let prepared = match self.allocator.prepare_job(&part) {
                Ok(p) => p,
                Err(e) => {
                    warn!("failed to resolve set range for job: {}", e);
                    return Ok(());
                }
            };
            worker.send_job(prepared)?;
        }
        Ok(())
    }
}

/// Fold `touch` subcommands into a job descriptor.
pub fn parse_touch(msg: &mut Message, mut job: TouchJob) -> Result<TouchJob, CommandError> {
    while msg.has_tokens() {
        let sub = msg.pop_string()?;
        match sub.as_str() {
            "begin-set" | "bs" => job.begin_set = msg.pop_number()?,
            "end-set" | "es" => job.end_set = msg.pop_number()?,
            "lines" | "l" => job.lines_per_set = msg.pop_number()?,
            "partitions" | "p" => job.partitions = msg.pop_number()?,
            "multi" | "m" => job.workers = msg.pop_number()?,
            "disable-interrupts" => job.disable_interrupts = true,
            "stop" => job.op = TouchOp::Stop,
            "flush" => job.op = TouchOp::Flush,
            "flush-before" => job.flush_before = true,
            "flush-after" => job.flush_after = true,
            _ => return Err(CommandError::UnknownOperation(format!("touch {}", sub))),
        }
    }
    Ok(job)
}
