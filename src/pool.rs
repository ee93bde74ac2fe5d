//! Page-aligned arena carving line-sized objects.
//!
//! Allocation bumps a cursor by one object at a time. Deletion only writes
//! a marker (all-zero object); a trailing scan hands entirely-zero pages
//! back to the kernel while keeping the virtual mapping intact, so handles
//! into the arena never dangle.

use std::ptr::NonNull;

use anyhow::Result;

use crate::constants::PAGE_SIZE;
use crate::error::PoolError;

pub struct ObjectPool {
    base: NonNull<u8>,
    pool_size: usize,
    object_size: usize,
    /// Byte offset of the next object.
    pos: usize,
    /// Page-aligned byte offset; everything below it has been GC-scanned.
    gc_pos: usize,
    /// When set, every allocation must land at this byte offset within its page.
    page_offset: Option<usize>,
    freed_pages: usize,
}

impl ObjectPool {
    pub fn new(object_size: usize, pool_size: usize) -> Result<Self> {
        assert!(
            object_size.is_power_of_two() && object_size <= PAGE_SIZE,
            "object size must be a power of two within a page"
        );
        assert_eq!(pool_size % PAGE_SIZE, 0, "pool size must be page-multiple");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                pool_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        assert_eq!(ptr as usize % PAGE_SIZE, 0, "mmap result not page aligned");
        Ok(ObjectPool {
            base: NonNull::new(ptr as *mut u8).unwrap(),
            pool_size,
            object_size,
            pos: 0,
            gc_pos: 0,
            page_offset: None,
            freed_pages: 0,
        })
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Next line-aligned object.
    ///
    /// With a page-offset pin active, intermediate slots are zero-filled
    /// (deletion markers) and skipped until the pinned offset matches;
    /// the GC later reclaims their pages.
    pub fn new_object(&mut self) -> Result<NonNull<u8>, PoolError> {
        if let Some(want) = self.page_offset {
            while self.pos + self.object_size <= self.pool_size && self.pos % PAGE_SIZE != want {
                unsafe { std::ptr::write_bytes(self.at(self.pos), 0, self.object_size) };
                self.pos += self.object_size;
            }
        }
        if self.pos + self.object_size > self.pool_size {
            return Err(PoolError::Exhausted {
                allocated: self.total_allocated(),
            });
        }
        let ret = self.at(self.pos);
        self.pos += self.object_size;
        Ok(unsafe { NonNull::new_unchecked(ret) })
    }

    /// Deletion marker: zero the object so `gc` can reclaim its page.
    pub fn delete_object(&mut self, p: NonNull<u8>) {
        let addr = p.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        debug_assert!(addr >= base && addr + self.object_size <= base + self.pool_size);
        debug_assert_eq!((addr - base) % self.object_size, 0);
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, self.object_size) };
    }

    /// Scan pages above the last GC position and release the physical
    /// backing of every entirely-zero page. The virtual mapping stays.
    pub fn gc(&mut self) {
        let mut off = self.gc_pos;
        while off < self.pos {
            if self.page_is_zero(off) {
                let rc = unsafe {
                    libc::madvise(self.at(off) as *mut libc::c_void, PAGE_SIZE, libc::MADV_DONTNEED)
                };
                if rc == 0 {
                    self.freed_pages += 1;
                }
            }
            off += PAGE_SIZE;
        }
        self.gc_pos = self.pos & !(PAGE_SIZE - 1);
    }

    fn page_is_zero(&self, page_offset: usize) -> bool {
        let words = unsafe {
            std::slice::from_raw_parts(
                self.at(page_offset) as *const u64,
                PAGE_SIZE / std::mem::size_of::<u64>(),
            )
        };
        words.iter().all(|&w| w == 0)
    }

    /// Pin (or unpin) the in-page byte offset of subsequent allocations.
    pub fn set_page_offset(&mut self, offset: Option<usize>) {
        if let Some(o) = offset {
            assert!(o < PAGE_SIZE, "offset beyond page");
            assert_eq!(o % self.object_size, 0, "offset must be object-aligned");
        }
        self.page_offset = offset;
    }

    /// Bytes currently backed by physical memory, net of GC-freed pages.
    pub fn total_allocated(&self) -> usize {
        self.pos.saturating_sub(self.freed_pages * PAGE_SIZE)
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.pool_size);
        }
    }
}
