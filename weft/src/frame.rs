// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawning-function frame descriptors.
//!
//! Every spawning scope owns a [`StackFrame`] on its stacklet. The frame
//! holds the scope's continuation (a five-slot jump buffer), the flag word
//! the sync protocol keys off, and the `call_parent` link that chains frames
//! within one closure. Frames are published to thieves through the THE
//! shadow stack; the owning side writes the jump buffer before the release
//! store of `tail`, which is what makes the plain `ctx` slots safe to read
//! after the Dekker exchange.

use crate::worker::Worker;
use bitflags::bitflags;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

bitflags! {
    /// Frame flag bits. The low-byte layout is ABI: clients and tools
    /// hard-code these values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const STOLEN            = 0x01;
        const DETACHED          = 0x02;
        const EXCEPTION_PENDING = 0x04;
        const UNSYNCHED         = 0x08;
        const EXCEPTING         = 0x10;
        const LAST              = 0x20;
        const THROWING          = 0x40;
        /// ABI version tag carried in the high byte of the flag word.
        const VERSION_MASK      = 0xff00_0000;
    }
}

pub const ABI_VERSION: u32 = 4;
pub const FRAME_VERSION_FLAGS: u32 = ABI_VERSION << 24;

/// Jump buffer slot indices. Slot layout is ABI and matches the classic
/// frame-pointer / program-counter / stack-pointer / MXCSR arrangement.
pub const JMPBUF_FP: usize = 0;
pub const JMPBUF_PC: usize = 1;
pub const JMPBUF_SP: usize = 2;
#[cfg(target_arch = "x86_64")]
pub const JMPBUF_MXCSR: usize = 3;

pub const JMPBUF_SIZE: usize = 5;

#[derive(Debug)]
#[repr(C)]
pub struct Jmpbuf {
    pub slots: [usize; JMPBUF_SIZE],
}

static_assertions::const_assert_eq!(size_of::<Jmpbuf>(), JMPBUF_SIZE * size_of::<usize>());

impl Jmpbuf {
    pub const fn zeroed() -> Self {
        Self { slots: [0; JMPBUF_SIZE] }
    }
}

/// Frame magic: ABI version in the high half, a structural hash of the frame
/// layout in the low half. Verified on entry; a mismatch is a fatal
/// invariant violation.
pub const fn frame_magic() -> u32 {
    let structural = (size_of::<StackFrame>() as u32)
        .wrapping_mul(0x9e37)
        .wrapping_add(align_of::<StackFrame>() as u32)
        .wrapping_add(JMPBUF_SIZE as u32);
    (ABI_VERSION << 16) | (structural & 0xffff)
}

pub const FRAME_MAGIC: u32 = frame_magic();

/// A spawning function's frame. Lives on the fiber stack for the dynamic
/// extent of its function.
#[repr(C)]
pub struct StackFrame {
    flags: AtomicU32,
    pub magic: u32,
    /// Closest enclosing spawning frame, forming a chain that ends at the
    /// first stolen frame.
    pub call_parent: Cell<*mut StackFrame>,
    /// The worker currently owning this frame. Kept current across steals
    /// and provably-good resumes; user code re-reads it after every
    /// potential migration point.
    pub worker: AtomicPtr<Worker>,
    /// The continuation saved before every spawn and nontrivial sync.
    pub ctx: UnsafeCell<Jmpbuf>,
    /// Out-of-band extension state, maintained only while an extension is
    /// registered.
    pub extension: Cell<*mut u8>,
}

// Safety: cross-thread access follows the protocol described in the module
// docs; the non-atomic fields are only touched by the frame's current owner.
unsafe impl Sync for StackFrame {}

impl StackFrame {
    pub fn new() -> Self {
        Self {
            flags: AtomicU32::new(FRAME_VERSION_FLAGS),
            magic: FRAME_MAGIC,
            call_parent: Cell::new(core::ptr::null_mut()),
            worker: AtomicPtr::new(core::ptr::null_mut()),
            ctx: UnsafeCell::new(Jmpbuf::zeroed()),
            extension: Cell::new(core::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_flags(&self, add: FrameFlags) {
        self.flags.fetch_or(add.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self, remove: FrameFlags) {
        self.flags.fetch_and(!remove.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn reset_flags(&self, to: u32) {
        self.flags.store(to, Ordering::Release);
    }

    #[inline]
    pub fn is_stolen(&self) -> bool {
        self.flags().contains(FrameFlags::STOLEN)
    }

    #[inline]
    pub fn is_unsynced(&self) -> bool {
        self.flags().contains(FrameFlags::UNSYNCHED)
    }

    /// Verifies the layout hash stamped into the frame.
    #[inline]
    pub fn check_magic(&self) {
        if self.magic != FRAME_MAGIC {
            crate::alert::die("corrupted frame magic");
        }
    }

    /// # Safety
    ///
    /// Only the frame's current owner, or a thief that won the Dekker
    /// exchange for it, may touch the jump buffer.
    #[inline]
    pub unsafe fn ctx_mut(&self) -> &mut Jmpbuf {
        // Safety: per the function contract.
        unsafe { &mut *self.ctx.get() }
    }

    /// Saved continuation stack pointer.
    #[inline]
    pub fn saved_sp(&self) -> usize {
        // Safety: reading a word the owner published before the frame became
        // visible; see module docs.
        unsafe { (*self.ctx.get()).slots[JMPBUF_SP] }
    }
}

/// Spills the floating-point control state into the jump buffer. On x86_64
/// that is the MXCSR register, stored in slot 3; other architectures
/// preserve their control registers across the switch primitives already.
#[inline]
pub fn save_fp_ctrl_state(frame: &StackFrame) {
    #[cfg(target_arch = "x86_64")]
    // Safety: stmxcsr writes 4 bytes to the pointed-to slot.
    unsafe {
        let slot = &raw mut (*frame.ctx.get()).slots[JMPBUF_MXCSR];
        core::arch::asm!("stmxcsr [{}]", in(reg) slot, options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = frame;
}

/// Restores the floating-point control state saved by
/// [`save_fp_ctrl_state`]; called when a continuation migrates to another
/// worker.
#[inline]
pub fn restore_fp_ctrl_state(frame: &StackFrame) {
    #[cfg(target_arch = "x86_64")]
    // Safety: ldmxcsr reads 4 bytes from the pointed-to slot, which
    // save_fp_ctrl_state filled.
    unsafe {
        let slot = &raw const (*frame.ctx.get()).slots[JMPBUF_MXCSR];
        if (*slot) != 0 {
            core::arch::asm!("ldmxcsr [{}]", in(reg) slot, options(nostack));
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = frame;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bit_layout_is_abi() {
        assert_eq!(FrameFlags::STOLEN.bits(), 0x1);
        assert_eq!(FrameFlags::DETACHED.bits(), 0x2);
        assert_eq!(FrameFlags::EXCEPTION_PENDING.bits(), 0x4);
        assert_eq!(FrameFlags::UNSYNCHED.bits(), 0x8);
        assert_eq!(FrameFlags::EXCEPTING.bits(), 0x10);
        assert_eq!(FrameFlags::LAST.bits(), 0x20);
        assert_eq!(FrameFlags::THROWING.bits(), 0x40);
    }

    #[test]
    fn magic_carries_abi_version() {
        assert_eq!(FRAME_MAGIC >> 16, ABI_VERSION);
        let f = StackFrame::new();
        f.check_magic();
    }

    #[test]
    fn fp_ctrl_state_roundtrip() {
        let f = StackFrame::new();
        save_fp_ctrl_state(&f);
        restore_fp_ctrl_state(&f);
    }
}
