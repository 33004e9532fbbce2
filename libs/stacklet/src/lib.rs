// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![feature(asm_unwind)]

//! Stack segments ("stacklets") for the weft cactus stack.
//!
//! A stacklet is a `2^lg_size`-byte mapped region **aligned to its own size**
//! with guard pages below and above the usable area. Because of the
//! alignment, the [`StackletHeader`] at the top of the usable area can be
//! recovered from any stack pointer inside the region by masking, which lets
//! a running strand find its worker without touching TLS.
//!
//! The raw switching primitives in [`arch`] are register-snapshot transfers
//! in the style of corosensei: a suspended stacklet is represented by a stack
//! pointer into its own frozen frame, and every transfer goes through one of
//! the four functions exported there. See the `arch` module docs for the
//! contract; all of them are wildly unsafe and are only ever called from the
//! weft scheduler.

pub mod arch;
pub mod pool;
mod utils;

use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::io;

/// A stack pointer value of a prepared or suspended stacklet.
pub type StackPointer = NonZeroUsize;

/// Bytes reserved at the very top of the usable area for the header plus the
/// parent-link slot used by the switch primitives.
pub const HEADER_RESERVE: usize = 128;

/// Smallest supported stacklet size (including guard page overhead).
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Largest supported stacklet size.
pub const MAX_STACK_SIZE: usize = 100 * 1024 * 1024;

static STACK_SIZE: AtomicU32 = AtomicU32::new(0);

/// Fixes the stacklet size for this process. Must be called before the first
/// allocation; later calls are ignored. The size is rounded up to a power of
/// two within `[MIN_STACK_SIZE, MAX_STACK_SIZE]`.
pub fn set_stack_size(size: usize) -> usize {
    let size = size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);
    let mut size = size.next_power_of_two();
    if size > MAX_STACK_SIZE {
        size /= 2;
    }
    let lg = size.trailing_zeros();
    let _ = STACK_SIZE.compare_exchange(0, lg, Ordering::AcqRel, Ordering::Acquire);
    stack_size()
}

/// The process-wide stacklet size. Zero-sized until [`set_stack_size`] ran.
#[inline]
pub fn stack_size() -> usize {
    let lg = STACK_SIZE.load(Ordering::Acquire);
    if lg == 0 { 0 } else { 1 << lg }
}

/// Fiber-local storage at the top of every stacklet.
///
/// The pointers are type-erased here so this crate stays independent of the
/// scheduler's data model; weft stores its worker and current stack frame.
#[repr(C)]
pub struct StackletHeader {
    /// Worker currently executing on this stacklet.
    pub worker: AtomicPtr<()>,
    /// Innermost spawning frame executing on this stacklet.
    pub current_frame: AtomicPtr<()>,
}

static_assertions::const_assert!(size_of::<StackletHeader>() <= HEADER_RESERVE - 16);

/// An owned, mapped stack region. Dropping unmaps it; recycling goes through
/// [`pool`] instead so the mapping survives.
pub struct Stacklet {
    base: NonNull<u8>,
    size: usize,
}

// Safety: a Stacklet is a handle to raw memory; ownership transfer between
// workers is exactly what the scheduler does with it.
unsafe impl Send for Stacklet {}

impl Stacklet {
    /// Maps a new stacklet of the process-wide size.
    ///
    /// # Errors
    ///
    /// Returns the mmap/mprotect error; per the runtime's error taxonomy the
    /// caller treats this as fatal to the faulting operation.
    pub fn new() -> io::Result<Self> {
        let size = stack_size();
        assert!(size != 0, "stacklet size not configured");
        let page = page_size();

        // Over-map so an aligned region plus a high guard page always fits,
        // then trim the slack back off.
        let map_len = 2 * size;
        // Safety: anonymous private mapping with no requested address.
        unsafe {
            let mmap = libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let raw = mmap as usize;
            let base = (raw + size - 1) & !(size - 1);
            // mmap returns page-aligned memory, so the aligned region plus
            // its high guard page always fits in the over-sized mapping.
            debug_assert!(base + size + page <= raw + map_len);

            // Trim the unaligned head and everything past the high guard.
            if base > raw {
                let ret = libc::munmap(raw as *mut _, base - raw);
                debug_assert_eq!(ret, 0);
            }
            let end = base + size + page;
            if end < raw + map_len {
                let ret = libc::munmap(end as *mut _, raw + map_len - end);
                debug_assert_eq!(ret, 0);
            }

            // Everything except the low guard page becomes usable stack; the
            // page above `base + size` stays PROT_NONE as the high guard.
            if libc::mprotect(
                (base + page) as *mut _,
                size - page,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                let ret = libc::munmap(base as *mut _, size + page);
                debug_assert_eq!(ret, 0);
                return Err(err);
            }

            let this = Self {
                base: NonNull::new_unchecked(base as *mut u8),
                size,
            };
            this.header().worker.store(core::ptr::null_mut(), Ordering::Relaxed);
            this.header()
                .current_frame
                .store(core::ptr::null_mut(), Ordering::Relaxed);
            registry::insert(base);
            Ok(this)
        }
    }

    /// Lowest mapped address (start of the low guard page).
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The stack base for the switch primitives: top of the usable area,
    /// below the header reserve.
    #[inline]
    pub fn top(&self) -> StackPointer {
        // Safety: base is non-null and the sum cannot wrap.
        unsafe { StackPointer::new_unchecked(self.base.as_ptr() as usize + self.size - HEADER_RESERVE) }
    }

    /// Address of the parent-link slot the switch primitives maintain.
    #[inline]
    pub fn parent_link(&self) -> *mut StackPointer {
        (self.top().get() - 16) as *mut StackPointer
    }

    #[inline]
    pub fn header(&self) -> &StackletHeader {
        // Safety: the header area is mapped read-write and initialized in new().
        unsafe { &*((self.base.as_ptr() as usize + self.size - HEADER_RESERVE) as *const StackletHeader) }
    }

    /// Reinitializes the header for reuse out of a pool.
    pub fn reset_header(&self) {
        self.header().worker.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.header()
            .current_frame
            .store(core::ptr::null_mut(), Ordering::Relaxed);
    }

    /// Leaks this stacklet into a raw base pointer. Reconstitute with
    /// [`Stacklet::from_raw`].
    pub fn into_raw(self) -> NonNull<u8> {
        let base = self.base;
        core::mem::forget(self);
        base
    }

    /// # Safety
    ///
    /// `base` must come from [`Stacklet::into_raw`] and not have been
    /// reconstituted already.
    pub unsafe fn from_raw(base: NonNull<u8>) -> Self {
        Self { base, size: stack_size() }
    }
}

impl Drop for Stacklet {
    fn drop(&mut self) {
        registry::remove(self.base.as_ptr() as usize);
        // Safety: we own the mapping created in new(); size + guard page.
        unsafe {
            let ret = libc::munmap(self.base.as_ptr().cast(), self.size + page_size());
            debug_assert_eq!(ret, 0);
        }
    }
}

/// Recovers the header of the stacklet containing `sp` by masking.
///
/// # Safety
///
/// `sp` must point into the usable area of a live stacklet. Debug builds
/// validate the derived base against the allocation registry.
#[inline]
pub unsafe fn header_from_sp(sp: usize) -> &'static StackletHeader {
    let size = stack_size();
    let base = sp & !(size - 1);
    debug_assert!(registry::contains(base), "stack pointer {sp:#x} is not on a stacklet");
    // Safety: caller promises sp is on a live stacklet, so the masked base is
    // its allocation and the header is mapped.
    unsafe { &*((base + size - HEADER_RESERVE) as *const StackletHeader) }
}

/// The parent-link slot of the stacklet containing `sp`.
///
/// # Safety
///
/// Same contract as [`header_from_sp`].
#[inline]
pub unsafe fn parent_link_from_sp(sp: usize) -> *mut StackPointer {
    let size = stack_size();
    let base = sp & !(size - 1);
    debug_assert!(registry::contains(base));
    (base + size - HEADER_RESERVE - 16) as *mut StackPointer
}

fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page.is_power_of_two());
    page
}

#[cfg(debug_assertions)]
mod registry {
    use std::collections::HashSet;
    use std::sync::Mutex;

    static LIVE: Mutex<Option<HashSet<usize>>> = Mutex::new(None);

    pub fn insert(base: usize) {
        LIVE.lock().unwrap().get_or_insert_default().insert(base);
    }

    pub fn remove(base: usize) {
        if let Some(set) = LIVE.lock().unwrap().as_mut() {
            set.remove(&base);
        }
    }

    pub fn contains(base: usize) -> bool {
        LIVE.lock()
            .unwrap()
            .as_ref()
            .is_some_and(|set| set.contains(&base))
    }
}

#[cfg(not(debug_assertions))]
mod registry {
    #[inline(always)]
    pub fn insert(_base: usize) {}
    #[inline(always)]
    pub fn remove(_base: usize) {}
    #[inline(always)]
    pub fn contains(_base: usize) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        set_stack_size(1024 * 1024);
    }

    #[test]
    fn alignment_and_guards() {
        init();
        let s = Stacklet::new().unwrap();
        let base = s.base().as_ptr() as usize;
        assert_eq!(base % stack_size(), 0);
        assert!(s.top().get() < base + stack_size());
        assert_eq!(s.top().get() % 16, 0);
    }

    #[test]
    fn header_recovery_from_interior_pointer() {
        init();
        let s = Stacklet::new().unwrap();
        let base = s.base().as_ptr() as usize;
        s.header().worker.store(0xdead_0000 as *mut (), Ordering::Relaxed);
        for off in [page_size(), stack_size() / 2, stack_size() - HEADER_RESERVE - 8] {
            // Safety: offsets are within the usable area of a live stacklet.
            let header = unsafe { header_from_sp(base + off) };
            assert_eq!(header.worker.load(Ordering::Relaxed), 0xdead_0000 as *mut ());
        }
    }

    #[test]
    fn header_reset_on_reuse() {
        init();
        let s = Stacklet::new().unwrap();
        s.header().worker.store(0x1 as *mut (), Ordering::Relaxed);
        s.reset_header();
        assert!(s.header().worker.load(Ordering::Relaxed).is_null());
    }
}
