use clap::Parser;

/// Builds LLC eviction sets from user space and drives controlled cache
/// pollution over them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target lines per (slice, set); 0 means the cache's associativity.
    #[arg(short = 'l', long, default_value_t = 0)]
    pub lines_per_set: usize,

    /// Occupiable ways the detector uses as its eviction threshold.
    #[arg(short, long, default_value_t = 2)]
    pub ways: usize,

    /// Parallel touch workers.
    #[arg(short = 't', long, default_value_t = 1)]
    pub workers: usize,

    /// Detach from the terminal and log to a file.
    #[arg(short = 'd', long = "deamon")]
    pub deamon: bool,

    /// Detailed progress output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Exit right after allocation.
    #[arg(long)]
    pub benchmark: bool,

    /// Allocate only in-slice set 0 and skip detection.
    #[arg(long)]
    pub fake: bool,
}
