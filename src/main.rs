#[macro_use]
extern crate log;

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use cachepress::*;

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    info!(
        "cachepress {} ({})",
        built_info::PKG_VERSION,
        built_info::TARGET
    );

    if args.deamon {
        daemonize(DAEMON_LOG)?;
    }

    let geometry = CacheGeometry::detect_llc()?;
    info!(
        "LLC: {} sets x {} ways x {} B lines over {} slices ({} KB)",
        geometry.sets,
        geometry.ways,
        geometry.line_size,
        geometry.slices,
        geometry.total_size() >> 10
    );

    let translator = Pagemap::open()?;
    let mut allocator = LineAllocator::new(
        geometry,
        args.lines_per_set,
        POOL_BYTES,
        Box::new(translator),
    )?;
    let mut detector = SliceDetector::new(
        geometry.slices,
        args.ways,
        allocator.lines_per_set(),
        64,
        rdtsc(),
    );
    let mut timer = TscTimer::new();

    let start = Instant::now();
    if args.fake {
        allocator.allocate_set(0, allocator.lines_per_set())?;
    } else {
        allocator.allocate_all_sets(&mut detector, &mut timer)?;
    }
    let elapsed = start.elapsed();
    info!(
        "allocation took {:.2} minutes ({}.{:09} s)",
        elapsed.as_secs_f64() / 60.0,
        elapsed.as_secs(),
        elapsed.subsec_nanos()
    );
    allocator.write(Path::new(RESULT_DIR))?;

    if args.benchmark {
        return Ok(());
    }

    let mut queue = CommandQueue::new(COMMAND_FIFO)?;
    let mut controller = Controller::new(allocator, args.workers);
    controller.run(&mut queue)?;
    info!("clean shutdown");
    Ok(())
}
