//! Stack memory for fibers and for the auxiliary scheduling loops entered
//! during a wait.
//!
//! Regions are allocated once (either up front by the fiber pools or lazily
//! by the per-thread auxiliary cache) and rebound to a fresh coroutine every
//! time their slot is reused. On unix the region is an `mmap` with a
//! `PROT_NONE` guard page at the low end, so running off the end of a fiber
//! stack faults instead of corrupting the neighbouring slot.

use std::io;

use corosensei::stack::{Stack, StackPointer};

/// A single owned stack region.
///
/// The region outlives any coroutine bound to it; the pools guarantee that at
/// most one coroutine uses a region at a time.
pub(crate) struct StackRegion {
    /// Lowest mapped address (the guard page, where one exists).
    base: *mut u8,
    /// Full mapping length, including the guard page.
    total: usize,
    /// First usable byte, above the guard page.
    bottom: usize,
}

// One fiber at a time per region; the free lists enforce exclusivity.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Allocates a region with at least `size` usable bytes, rounded up to
    /// the page size.
    #[cfg(unix)]
    pub(crate) fn new(size: usize) -> io::Result<StackRegion> {
        let page = page_size();
        let usable = round_up(size, page);
        let total = usable + page;

        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            // Guard page below the usable range.
            if libc::mprotect(base, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(base, total);
                return Err(err);
            }
            Ok(StackRegion {
                base: base as *mut u8,
                total,
                bottom: base as usize + page,
            })
        }
    }

    /// Fallback without guard pages: a page-aligned heap allocation.
    #[cfg(not(unix))]
    pub(crate) fn new(size: usize) -> io::Result<StackRegion> {
        use std::alloc::{alloc, Layout};

        let usable = round_up(size, 4096);
        let layout = Layout::from_size_align(usable, 4096)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad stack layout"))?;
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "stack allocation failed"));
        }
        Ok(StackRegion {
            base,
            total: usable,
            bottom: base as usize,
        })
    }

    /// Usable bytes between the guard page and the top.
    pub(crate) fn usable(&self) -> usize {
        self.base as usize + self.total - self.bottom
    }

    /// A `Copy` descriptor of this region suitable for binding a coroutine.
    ///
    /// The caller must keep the region alive (and unshared) for as long as
    /// any coroutine built on the handle can run; the pools and the wait
    /// protocol uphold this.
    pub(crate) fn handle(&self) -> StackHandle {
        let top = self.base as usize + self.total;
        StackHandle {
            top: StackPointer::new(top).expect("stack top is never null"),
            bottom: StackPointer::new(self.bottom).expect("stack bottom is never null"),
        }
    }
}

impl Drop for StackRegion {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        use std::alloc::{dealloc, Layout};
        unsafe {
            dealloc(self.base, Layout::from_size_align_unchecked(self.total, 4096));
        }
    }
}

/// Borrowed view of a [`StackRegion`] implementing the coroutine stack trait.
#[derive(Clone, Copy)]
pub(crate) struct StackHandle {
    top: StackPointer,
    bottom: StackPointer,
}

unsafe impl Stack for StackHandle {
    fn base(&self) -> StackPointer {
        self.top
    }

    fn limit(&self) -> StackPointer {
        self.bottom
    }

    #[cfg(windows)]
    fn teb_fields(&self) -> corosensei::stack::StackTebFields {
        corosensei::stack::StackTebFields {
            StackBase: self.top.get(),
            StackLimit: self.bottom.get(),
            DeallocationStack: self.bottom.get(),
            GuaranteedStackBytes: 0,
        }
    }

    #[cfg(windows)]
    fn update_teb_fields(&mut self, _stack_limit: usize, _guaranteed_stack_bytes: usize) {}
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) / to * to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_rounded() {
        let region = StackRegion::new(1000).unwrap();
        assert!(region.usable() >= 1000);
        assert_eq!(region.usable() % 4096, 0);
    }

    #[test]
    fn handle_spans_usable_range() {
        let region = StackRegion::new(64 * 1024).unwrap();
        let handle = region.handle();
        assert!(handle.base().get() > handle.limit().get());
        assert_eq!(handle.base().get() - handle.limit().get(), region.usable());
        // Page-aligned at both ends, as the context switch requires.
        assert_eq!(handle.base().get() % 4096, 0);
        assert_eq!(handle.limit().get() % 4096, 0);
    }

    #[test]
    fn regions_are_reusable() {
        let region = StackRegion::new(16 * 1024).unwrap();
        let first = region.handle();
        let second = region.handle();
        assert_eq!(first.base().get(), second.base().get());
    }
}
