// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware platform, deferring to the port layer.
//!
//! The actual context-switch assembly and interrupt mask twiddling are
//! port-specific and live with the board support, not here. The port
//! provides these two hooks with the obvious contracts.

use super::Platform;
use crate::Kernel;

extern "C" {
    /// Saves the current context, dispatches the most important runnable
    /// task, and returns when the saved context is dispatched again.
    fn kestrel_port_control_to_system();
    /// Masks interrupts, returning the previous mask state.
    fn kestrel_port_mask_interrupts() -> u32;
    /// Restores a mask state returned by `kestrel_port_mask_interrupts`.
    fn kestrel_port_restore_interrupts(state: u32);
}

pub enum Port {}

impl Platform for Port {
    fn control_to_system(_kernel: &mut Kernel<Port>) {
        // Safety: the port guarantees the calling context is resumable; the
        // kernel has already threaded the task onto its wakeup lists.
        unsafe { kestrel_port_control_to_system() }
    }

    fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
        // Safety: mask/restore pair with no early exit between them.
        let state = unsafe { kestrel_port_mask_interrupts() };
        let r = f();
        unsafe { kestrel_port_restore_interrupts(state) };
        r
    }
}
