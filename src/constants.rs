pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bytes per entry in /proc/self/pagemap.
pub const PAGEMAP_ENTRY_BYTES: u64 = 8;

/// Virtual reservation backing the line pool (16 GiB, MAP_NORESERVE).
pub const POOL_BYTES: usize = 1 << 34;

/// LLC slice count of the deployment part (Xeon E5-2658 v3).
/// TODO: derive from the core count reported by CPUID leaf 0Bh.
pub const LLC_SLICES: usize = 12;

pub const COMMAND_FIFO: &str = "/tmp/cachepress";
pub const DAEMON_LOG: &str = "/tmp/cachepress.log";
pub const RESULT_DIR: &str = "/tmp";

/// One command message is at most this many bytes.
pub const MAX_MESSAGE_BYTES: usize = 1 << 12;
