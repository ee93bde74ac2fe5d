use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("page for virtual address {virt:#x} is not present")]
    NotPresent { virt: usize },
    #[error("pagemap access failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("line pool exhausted after {allocated} bytes")]
    Exhausted { allocated: usize },
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line {virt:#x} is not aligned to the line size")]
    Misaligned { virt: usize },
    #[error("physical address of line {virt:#x} moved: {was:#x} -> {now:#x}")]
    PhysMoved { virt: usize, was: u64, now: u64 },
    #[error("{count} lines left undetected after all slices")]
    Undetected { count: usize },
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A line's slice tag is written exactly once; any second write fails.
#[derive(Debug, Error)]
#[error("slice of line {phys:#x} already set to {was}, refusing {new}")]
pub struct SliceReassigned {
    pub was: usize,
    pub new: usize,
    pub phys: u64,
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error("list of length {len} holds only {unique} unique nodes")]
    Duplicates { len: usize, unique: usize },
    #[error("list claims {expected} nodes but traversal found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Line(#[from] LineError),
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("set {set} holds {have} lines, {want} requested")]
    NotEnoughLines { set: usize, have: usize, want: usize },
    #[error("physical address audit failed for set {set}")]
    AddressAudit { set: usize },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Line(#[from] LineError),
    #[error(transparent)]
    List(#[from] ListError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("message ended while an argument was expected")]
    OutOfTokens,
    #[error("malformed number: {0}")]
    BadNumber(String),
    #[error("worker is busy with a running job")]
    Busy,
    #[error("bad set range {begin}..={end}")]
    BadRange { begin: usize, end: usize },
    #[error("set range {begin}..={end} does not split evenly over {workers} workers")]
    UnevenSplit {
        begin: usize,
        end: usize,
        workers: usize,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot open command fifo: {0}")]
    Open(std::io::Error),
    #[error("fifo read failed: {0}")]
    Read(std::io::Error),
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("cpuid reports no level-{level} unified cache")]
    NoSuchCache { level: u32 },
}
