//! Cache lines and the arena that owns them.
//!
//! Lines are addressed by `LineHandle` (an index into the arena's flat
//! table) instead of raw self-referential pointers. Each line-sized
//! allocation starts with a small in-line record: the handle of the next
//! line in its ring and the line's physical address. Reading the record is
//! what makes a ring walk touch the line's cache line; the nonzero
//! physical address doubles as the liveness marker the pool GC relies on.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::error::{LineError, SliceReassigned};
use crate::pool::ObjectPool;
use crate::timing;
use crate::translate::Translator;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LineHandle(pub(crate) u32);

impl LineHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Ring terminator inside a line record.
const NO_NEXT: u32 = u32::MAX;

// Stored at the start of every line-sized allocation. `next` must stay the
// first field: the pollute loop reads it with a single 32-bit load.
#[repr(C)]
struct LineRecord {
    next: u32,
    _pad: u32,
    phys_addr: u64,
}

/// A line the timing probe can operate on.
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    pub handle: LineHandle,
    pub virt: *const u8,
    pub phys: u64,
}

struct LineMeta {
    virt: NonNull<u8>,
    phys: u64,
    in_slice_set: usize,
    slice: Option<usize>,
    live: bool,
}

static MLOCK_WARNED: AtomicBool = AtomicBool::new(false);

/// Owns every cache line carved from the pool.
pub struct LineArena {
    pool: ObjectPool,
    translator: Box<dyn Translator>,
    line_size: usize,
    sets_per_slice: usize,
    lines: Vec<LineMeta>,
}

impl LineArena {
    pub fn new(
        line_size: usize,
        sets_per_slice: usize,
        pool_bytes: usize,
        translator: Box<dyn Translator>,
    ) -> Result<Self> {
        assert!(
            sets_per_slice.is_power_of_two(),
            "in-slice set count must be a power of two"
        );
        assert!(line_size >= std::mem::size_of::<LineRecord>());
        Ok(LineArena {
            pool: ObjectPool::new(line_size, pool_bytes)?,
            translator,
            line_size,
            sets_per_slice,
            lines: Vec::new(),
        })
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn sets_per_slice(&self) -> usize {
        self.sets_per_slice
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Carve one line from the pool, pin it and translate its address.
    ///
    /// On translation failure the slot is returned to the pool and the
    /// line never becomes visible.
    pub fn allocate(&mut self) -> Result<LineHandle, LineError> {
        let ptr = self.pool.new_object()?;
        let virt = ptr.as_ptr() as usize;
        if virt % self.line_size != 0 {
            self.pool.delete_object(ptr);
            return Err(LineError::Misaligned { virt });
        }
        // mlock both wires the page resident (stable translation) and
        // faults it in so the pagemap entry exists.
        let rc = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, self.line_size) };
        if rc != 0 && !MLOCK_WARNED.swap(true, Ordering::Relaxed) {
            warn!(
                "mlock failed ({}); physical addresses may move under memory pressure",
                std::io::Error::last_os_error()
            );
        }
        unsafe { ptr.as_ptr().write_volatile(0) };
        let phys = match self.translator.physical_addr(virt) {
            Ok(p) => p,
            Err(e) => {
                self.pool.delete_object(ptr);
                return Err(e.into());
            }
        };
        let record = LineRecord {
            next: NO_NEXT,
            _pad: 0,
            phys_addr: phys,
        };
        unsafe { (ptr.as_ptr() as *mut LineRecord).write(record) };
        let in_slice_set = ((phys / self.line_size as u64) % self.sets_per_slice as u64) as usize;
        let handle = LineHandle(self.lines.len() as u32);
        self.lines.push(LineMeta {
            virt: ptr,
            phys,
            in_slice_set,
            slice: None,
            live: true,
        });
        Ok(handle)
    }

    /// Return the line to the pool. The handle stays valid but dead; its
    /// memory is zeroed so the next GC pass can reclaim the page.
    pub fn discard(&mut self, h: LineHandle) {
        let meta = &mut self.lines[h.index()];
        if !meta.live {
            return;
        }
        meta.live = false;
        meta.slice = None;
        let ptr = meta.virt;
        unsafe { libc::munlock(ptr.as_ptr() as *const libc::c_void, self.line_size) };
        self.pool.delete_object(ptr);
    }

    pub fn gc(&mut self) {
        self.pool.gc();
    }

    pub fn total_allocated(&self) -> usize {
        self.pool.total_allocated()
    }

    pub fn set_page_offset(&mut self, offset: Option<usize>) {
        self.pool.set_page_offset(offset);
    }

    pub fn virt(&self, h: LineHandle) -> *const u8 {
        self.lines[h.index()].virt.as_ptr()
    }

    pub fn phys(&self, h: LineHandle) -> u64 {
        self.lines[h.index()].phys
    }

    pub fn is_live(&self, h: LineHandle) -> bool {
        self.lines[h.index()].live
    }

    /// `(phys / L) mod S_per_slice`, fixed at construction.
    pub fn in_slice_set(&self, h: LineHandle) -> usize {
        self.lines[h.index()].in_slice_set
    }

    pub fn slice(&self, h: LineHandle) -> Option<usize> {
        self.lines[h.index()].slice
    }

    /// Full set index once the slice is known.
    pub fn full_set(&self, h: LineHandle) -> Option<usize> {
        let meta = &self.lines[h.index()];
        meta.slice.map(|s| meta.in_slice_set | s * self.sets_per_slice)
    }

    /// Tag the line with its detected slice. Exactly-once: a second call
    /// fails with `SliceReassigned` and leaves the line untouched.
    pub fn set_slice(&mut self, h: LineHandle, slice: usize) -> Result<(), SliceReassigned> {
        let meta = &mut self.lines[h.index()];
        match meta.slice {
            None => {
                meta.slice = Some(slice);
                Ok(())
            }
            Some(was) => Err(SliceReassigned {
                was,
                new: slice,
                phys: meta.phys,
            }),
        }
    }

    /// Forget the slice tag so the line can go through detection again.
    pub fn reset_slice(&mut self, h: LineHandle) {
        self.lines[h.index()].slice = None;
    }

    pub fn candidate(&self, h: LineHandle) -> Candidate {
        let meta = &self.lines[h.index()];
        Candidate {
            handle: h,
            virt: meta.virt.as_ptr(),
            phys: meta.phys,
        }
    }

    /// Compare the stored physical address against a fresh translation.
    pub fn validate_physical(&mut self, h: LineHandle) -> Result<(), LineError> {
        let meta = &self.lines[h.index()];
        let virt = meta.virt.as_ptr() as usize;
        let was = meta.phys;
        let now = self.translator.physical_addr(virt)?;
        if now != was {
            return Err(LineError::PhysMoved { virt, was, now });
        }
        Ok(())
    }

    pub fn flush(&self, h: LineHandle) {
        timing::clflush(self.virt(h));
    }

    pub(crate) fn next_of(&self, h: LineHandle) -> Option<LineHandle> {
        let raw = unsafe { (self.virt(h) as *const u32).read_volatile() };
        if raw == NO_NEXT {
            None
        } else {
            Some(LineHandle(raw))
        }
    }

    pub(crate) fn set_next(&mut self, h: LineHandle, next: Option<LineHandle>) {
        let raw = next.map_or(NO_NEXT, |n| n.0);
        let ptr = self.lines[h.index()].virt.as_ptr() as *mut u32;
        unsafe { ptr.write_volatile(raw) };
    }

    /// Frozen view of the handle table for the touch workers.
    pub fn table(&self) -> LineTable {
        LineTable {
            ptrs: self.lines.iter().map(|m| m.virt.as_ptr() as *const u8).collect(),
        }
    }
}

/// Read-only snapshot of the arena's handle table.
///
/// Safety: the pool's virtual mapping is never torn down while workers
/// hold a snapshot (the allocator outlives every dispatched job), and
/// workers only read the in-line records of lines handed to them.
#[derive(Clone)]
pub struct LineTable {
    ptrs: Arc<[*const u8]>,
}

unsafe impl Send for LineTable {}
unsafe impl Sync for LineTable {}

impl LineTable {
    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn virt(&self, h: LineHandle) -> *const u8 {
        self.ptrs[h.index()]
    }

    /// One pollute stride: load the ring successor out of the line itself.
    #[inline(always)]
    pub fn next(&self, h: LineHandle) -> LineHandle {
        LineHandle(unsafe { (self.ptrs[h.index()] as *const u32).read_volatile() })
    }

    /// Flush every line of the ring starting at `head`.
    pub fn flush_ring(&self, head: LineHandle) {
        let mut cur = head;
        loop {
            timing::clflush(self.virt(cur));
            cur = self.next(cur);
            if cur == head {
                break;
            }
        }
        timing::mfence();
    }
}
