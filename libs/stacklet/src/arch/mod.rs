// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Register-snapshot transfers between stacklets.
//!
//! Two frame shapes exist on a suspended stack:
//!
//! - a *parked* frame, produced by [`switch_suspend`] (or by
//!   [`prepare_stack`] for a stacklet that has not started). It is resumed by
//!   [`switch_resume`], which *calls* through the saved PC at the snapshot's
//!   stack pointer.
//! - a *link* frame, produced implicitly by a pending [`switch_resume`] in
//!   the suspender. It is resumed by *returning* into it: either terminally
//!   via [`switch_retire`] through a link slot, or — keeping the resumer's
//!   own context alive as a fresh link frame — via [`switch_resume_link`].
//!
//! Every entry into a stacklet writes the resumer's link frame into the
//! target's parent-link slot (16 bytes below the stack base), so the code
//! running there can always suspend back out through
//! [`crate::parent_link_from_sp`].
//!
//! The transfer argument is a single machine word; the scheduler encodes
//! message pointers in it. `Option<StackPointer>` in the return position is
//! `None` when the stacklet retired and `Some(sp)` when it parked itself at
//! `sp`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Stacklet, StackPointer, set_stack_size};

    struct Obj {
        n: usize,
    }

    unsafe extern "C-unwind" fn entry(
        arg: usize,
        parent_link: *mut StackPointer,
        obj: *mut Obj,
    ) -> ! {
        // Safety: prepared by the test below.
        unsafe {
            let n = (*obj).n;
            let got = switch_suspend(arg + n, parent_link);
            switch_retire(got * 2, parent_link);
        }
    }

    #[test]
    fn park_resume_retire() {
        set_stack_size(1024 * 1024);
        let stack = Stacklet::new().unwrap();
        // Safety: fresh stacklet, entry observes the transfer contract.
        unsafe {
            let (sp, _obj) = prepare_stack(&stack, entry, Obj { n: 2 });
            let (v, sp) = switch_resume(40, sp, stack.top());
            assert_eq!(v, 42);
            let sp = sp.expect("stacklet parked");
            let (v, sp) = switch_resume(10, sp, stack.top());
            assert_eq!(v, 20);
            assert!(sp.is_none());
        }
    }
}
