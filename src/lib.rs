#[macro_use]
extern crate log;

mod alloc;
mod cli;
mod constants;
mod control;
mod daemon;
mod detect;
mod error;
mod fifo;
mod geometry;
mod line;
mod list;
mod model;
mod pool;
mod tester;
mod timing;
mod touch;
mod translate;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub use crate::alloc::LineAllocator;
pub use crate::cli::Args;
pub use crate::constants::{COMMAND_FIFO, DAEMON_LOG, LLC_SLICES, PAGE_SIZE, POOL_BYTES, RESULT_DIR};
pub use crate::control::{parse_touch, Controller};
pub use crate::daemon::daemonize;
pub use crate::detect::{
    best_group_size, expected_probe_cost, max_tries_for_group, DetectOutcome, SliceDetector,
};
pub use crate::error::{
    AllocError, CommandError, GeometryError, LineError, ListError, PoolError, QueueError,
    SliceReassigned, TranslationError,
};
pub use crate::fifo::{CommandQueue, Message};
pub use crate::geometry::CacheGeometry;
pub use crate::line::{Candidate, LineArena, LineHandle, LineTable};
pub use crate::list::LineList;
pub use crate::model::{ModelTimer, SliceOracle, SlicedCache};
pub use crate::pool::ObjectPool;
pub use crate::tester::{AccessTimer, SetTester, TscTimer};
pub use crate::timing::{rdtsc, InterruptPause};
pub use crate::touch::{TouchJob, TouchOp, TouchWorker};
pub use crate::translate::{IdentityTranslator, Pagemap, Translator};
