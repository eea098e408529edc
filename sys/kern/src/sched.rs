// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority scheduler.
//!
//! Non-preemptive between suspension points: a running task keeps the CPU
//! until it yields, sleeps, suspends, or blocks, and even then only a task
//! with a strictly more important (numerically lower) priority takes over.
//! Equal priority never preempts, so tasks at one priority level take
//! turns only at their own pace.
//!
//! The scheduler lock is recursive. While it is held, yields are deferred
//! and replayed on the final unlock; interrupt-side resumes never switch
//! directly, they just set the pending-yield bit.

use slist::List;

use crate::task::{Task, TaskState};
use crate::{Kernel, TaskIndex};

#[derive(Debug)]
pub struct Scheduler {
    /// Runnable tasks, most important first, FIFO within a priority.
    ready: List,
    current: u16,
    lock_count: u8,
    pending_yield: bool,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            ready: List::new(),
            current: 0,
            lock_count: 0,
            pending_yield: false,
        }
    }

    pub fn current(&self) -> TaskIndex {
        TaskIndex(self.current)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count != 0
    }

    pub(crate) fn set_pending_yield(&mut self) {
        self.pending_yield = true;
    }

    /// Queues `task` by priority, after any runnable peers at the same
    /// level.
    pub(crate) fn enqueue_ready(&mut self, tasks: &mut [Task], task: TaskIndex) {
        self.ready.insert_sorted(tasks, task.0, |at, new| {
            new.priority().is_more_important_than(at.priority())
        });
    }

    pub(crate) fn remove_ready(&mut self, tasks: &mut [Task], task: TaskIndex) {
        self.ready.remove(tasks, task.0);
    }

    /// The most important runnable task, if any.
    pub(crate) fn ready_head(&self) -> Option<u16> {
        self.ready.head()
    }

    /// Takes the current task back off the ready queue after a park that
    /// ended. On hardware the dispatcher has just switched to us; on the
    /// host the fake platform calls this when the parked task becomes
    /// runnable.
    pub(crate) fn resume_current(&mut self, tasks: &mut [Task]) {
        let cur = self.current;
        self.ready.remove(tasks, cur);
        tasks[usize::from(cur)].state = TaskState::Running;
    }
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Enters a non-preemptible section. Recursive.
    pub fn sched_lock(&mut self) {
        self.sched.lock_count += 1;
    }

    /// Leaves a non-preemptible section; on the outermost unlock a
    /// deferred yield is honored.
    pub fn sched_unlock(&mut self) {
        assert!(self.sched.lock_count > 0, "unbalanced scheduler unlock");
        self.sched.lock_count -= 1;
        if self.sched.lock_count == 0 && self.sched.pending_yield {
            self.sched.pending_yield = false;
            self.task_yield();
        }
    }

    /// Cooperative yield point.
    ///
    /// Switches only if a strictly more important task is runnable. Under
    /// the scheduler lock the switch is deferred to the final unlock.
    pub fn task_yield(&mut self) {
        if self.sched.is_locked() {
            self.sched.set_pending_yield();
            return;
        }
        let cur = self.sched.current();
        let more_important = match self.sched.ready_head() {
            Some(h) => self.tasks[usize::from(h)]
                .priority()
                .is_more_important_than(
                    self.tasks[usize::from(cur.0)].priority(),
                ),
            None => false,
        };
        if more_important {
            self.make_ready(cur);
            P::control_to_system(self);
        }
    }
}
