// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the portable kernel and the CPU.
//!
//! Two things cannot be written portably: handing the CPU to another task,
//! and masking interrupts. Both are expressed through [`Platform`], which
//! the kernel takes as a type parameter. The `fake` implementation runs the
//! whole kernel on a development host, driven by a per-test script; the
//! `target` implementation defers to the port's context-switch and
//! interrupt primitives, which live outside this repository.

use crate::Kernel;

/// CPU services the kernel requires.
pub trait Platform: Sized {
    /// Parks the calling context and gives the CPU to the system.
    ///
    /// On hardware this saves the current task's context and dispatches the
    /// most important runnable task (or the idle loop); it returns when the
    /// parked task has been made runnable and dispatched again. The kernel
    /// calls this with the current task already threaded onto whatever
    /// lists will wake it.
    fn control_to_system(kernel: &mut Kernel<Self>);

    /// Runs `f` with interrupts masked, restoring the previous mask state
    /// afterwards. Keep the window as small as possible.
    fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        pub mod target;
        pub use target::Port as DefaultPlatform;
    } else {
        pub mod fake;
        pub use fake::Host as DefaultPlatform;
    }
}
