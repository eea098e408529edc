// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side platform for tests and simulation.
//!
//! There is no real context switch on the host: the test itself *is* the
//! current task. When the kernel parks that task, control lands here, and
//! we play back a script of world actions (tick the clock, ping a
//! condition, resume a waiter) until the parked task is runnable again.
//! This is the same move `lib/multitimer`-style fakes make: the environment
//! becomes data.

use std::cell::RefCell;

use super::Platform;
use crate::{Kernel, TaskState};

type Action = Box<dyn FnOnce(&mut Kernel<Host>)>;

thread_local! {
    static SCRIPT: RefCell<Vec<Action>> = RefCell::new(Vec::new());
}

/// Queues a world action to run the next time the kernel parks the current
/// task. Actions run in the order queued.
pub fn on_park(action: impl FnOnce(&mut Kernel<Host>) + 'static) {
    SCRIPT.with(|s| s.borrow_mut().push(Box::new(action)));
}

/// Drops any unconsumed script actions. Call between tests that share a
/// thread.
pub fn reset() {
    SCRIPT.with(|s| s.borrow_mut().clear());
}

pub enum Host {}

impl Platform for Host {
    fn control_to_system(kernel: &mut Kernel<Host>) {
        let parked = kernel.sched.current();
        loop {
            if kernel.tasks[usize::from(parked.0)].state() == TaskState::Ready
            {
                // The world has made us runnable again; on hardware the
                // dispatcher would switch back to us here.
                kernel.sched.resume_current(&mut kernel.tasks);
                return;
            }
            let next = SCRIPT.with(|s| {
                let mut s = s.borrow_mut();
                if s.is_empty() {
                    None
                } else {
                    Some(s.remove(0))
                }
            });
            match next {
                Some(action) => action(kernel),
                None => panic!(
                    "task {} parked with no script left to wake it",
                    parked.0
                ),
            }
        }
    }

    fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
        // No interrupts on the host.
        f()
    }
}
