// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sleep list: tasks with wake deadlines, soonest first.

use abi::Tick;
use slist::List;

use crate::task::{Task, TaskState, WakeReason};
use crate::{KernEvent, Kernel, TaskIndex};

#[derive(Debug)]
pub struct SleepList {
    list: List,
}

impl SleepList {
    pub(crate) fn new() -> Self {
        Self { list: List::new() }
    }

    /// Threads `task` in deadline order. Ties resolve FIFO. Returns `true`
    /// when `task` became the new head, meaning the port should reprogram
    /// its timer compare.
    #[must_use]
    pub(crate) fn add(
        &mut self,
        tasks: &mut [Task],
        task: TaskIndex,
        wake: Tick,
    ) -> bool {
        tasks[usize::from(task.0)].wake_tick = wake;
        self.list.insert_sorted(tasks, task.0, |at, new| {
            at.wake_tick.since(new.wake_tick) > 0
        });
        self.list.head() == Some(task.0)
    }

    /// Unthreads a task that was resumed before its deadline.
    pub(crate) fn remove(&mut self, tasks: &mut [Task], task: TaskIndex) {
        self.list.remove(tasks, task.0);
    }

    pub(crate) fn head(&self) -> Option<u16> {
        self.list.head()
    }
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Wakes every task whose deadline has arrived. ISR-safe; called from
    /// [`Kernel::tick`].
    pub(crate) fn sleep_tick(&mut self) {
        loop {
            let due = match self.sleep.head() {
                Some(h) if self.now.reached(self.tasks[usize::from(h)].wake_tick) => h,
                _ => break,
            };
            let popped = self.sleep.list.pop(&mut self.tasks);
            debug_assert_eq!(popped, Some(due));
            let t = &mut self.tasks[usize::from(due)];
            t.wake = Some(WakeReason::SleepResume);
            ringbuf::ring_entry!(self.ring, KernEvent::SleepResume(due));
            self.make_ready(TaskIndex(due));
        }
    }

    /// Parks the current task for `delay` ticks.
    pub fn task_sleep(&mut self, delay: u32) {
        let cur = self.sched.current();
        let wake = self.now.offset(delay);
        {
            let t = &mut self.tasks[usize::from(cur.0)];
            t.state = TaskState::Sleeping;
            t.wake = None;
        }
        let _ = self.sleep.add(&mut self.tasks, cur, wake);
        ringbuf::ring_entry!(self.ring, KernEvent::TaskSleeping(cur.0));
        P::control_to_system(self);
        self.tasks[usize::from(cur.0)].wake = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{self, Host};
    use abi::Priority;

    #[test]
    fn sleep_wakes_at_deadline_not_before() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        fake::on_park(|k| k.tick(Tick(5)));
        fake::on_park(|k| k.tick(Tick(9)));
        fake::on_park(|k| k.tick(Tick(10)));
        k.task_sleep(10);
        // Two early ticks were consumed without waking us; the third did.
        assert_eq!(k.now(), Tick(10));
    }

    #[test]
    fn sleep_list_orders_by_deadline_with_fifo_ties() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        fn noop(_: usize) {}
        let a = k
            .create_task("a", Priority(5), Default::default(), noop, 0)
            .unwrap();
        let b = k
            .create_task("b", Priority(5), Default::default(), noop, 0)
            .unwrap();
        let c = k
            .create_task("c", Priority(5), Default::default(), noop, 0)
            .unwrap();
        assert!(k.sleep.add(&mut k.tasks, a, Tick(20)));
        assert!(k.sleep.add(&mut k.tasks, b, Tick(10)));
        // Same deadline as b: must land after it.
        assert!(!k.sleep.add(&mut k.tasks, c, Tick(10)));
        assert_eq!(k.sleep.head(), Some(b.0));
    }

    #[test]
    fn wrap_safe_deadlines() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        k.tick(Tick(u32::MAX - 2));
        fake::on_park(|k| k.tick(Tick(u32::MAX - 2).offset(8)));
        k.task_sleep(8);
        assert_eq!(k.now().0, 5);
    }
}
