//! Cycle-counter and cache-control primitives.
//!
//! This is the crate's single unsafe boundary around inline assembly and
//! intrinsics; everything above it is safe. All hot-path helpers are
//! `#[inline(always)]` so a timed access compiles to the bare
//! rdtsc / load / mfence / rdtsc sequence.

use std::arch::asm;
use std::arch::x86_64::{_mm_clflush, _mm_mfence};
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};

/// Cycle counter. The two 32-bit halves are combined into one 64-bit value.
#[inline(always)]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Full memory barrier.
#[inline(always)]
pub fn mfence() {
    unsafe { _mm_mfence() }
}

/// Flush the line containing `p` from every cache level.
#[inline(always)]
pub fn clflush(p: *const u8) {
    unsafe { _mm_clflush(p) }
}

/// Read one byte of `p` without letting the compiler elide or reorder it.
#[inline(always)]
pub fn touch(p: *const u8, sink: &mut u64) {
    *sink = sink.wrapping_add(unsafe { std::ptr::read_volatile(p) } as u64);
}

/// Cycles taken to read `*p`: counter read, volatile load, fence, counter read.
#[inline(always)]
pub fn time_access(p: *const u8, sink: &mut u64) -> u64 {
    let start = rdtsc();
    touch(p, sink);
    mfence();
    rdtsc().wrapping_sub(start)
}

// 0 = untried, 1 = granted, -1 = denied
static IOPL_STATE: AtomicI8 = AtomicI8::new(0);
static IOPL_WARNED: AtomicBool = AtomicBool::new(false);

/// Whether this process may execute `cli`/`sti` (I/O privilege level 3).
pub fn interrupts_maskable() -> bool {
    match IOPL_STATE.load(Ordering::Relaxed) {
        1 => true,
        -1 => false,
        _ => {
            let granted = unsafe { libc::iopl(3) } == 0;
            IOPL_STATE.store(if granted { 1 } else { -1 }, Ordering::Relaxed);
            granted
        }
    }
}

/// Interrupts disabled on the calling core for the lifetime of the guard.
///
/// The window must not contain a system call; keep it to the timed batch
/// or the pollute loop itself.
pub struct InterruptPause {
    _priv: (),
}

impl InterruptPause {
    pub fn new() -> Option<Self> {
        if !interrupts_maskable() {
            if !IOPL_WARNED.swap(true, Ordering::Relaxed) {
                warn!("iopl(3) denied; timing runs with interrupts enabled");
            }
            return None;
        }
        unsafe { asm!("cli", options(nomem, nostack)) };
        Some(InterruptPause { _priv: () })
    }
}

impl Drop for InterruptPause {
    fn drop(&mut self) {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdtsc_is_monotonic_enough() {
        let a = rdtsc();
        let b = rdtsc();
        // Counter is per-core and may migrate, but two back-to-back reads
        // on an idle test runner never wrap.
        assert!(b >= a);
    }

    #[test]
    fn timed_access_returns_nonzero() {
        let data = [7u8; 64];
        let mut sink = 0u64;
        let t = time_access(data.as_ptr(), &mut sink);
        assert!(t > 0);
        assert_eq!(sink, 7);
    }

    #[test]
    fn flush_is_idempotent_on_stored_state() {
        let data = [42u8; 64];
        clflush(data.as_ptr());
        clflush(data.as_ptr());
        mfence();
        assert_eq!(data[0], 42);
    }
}
