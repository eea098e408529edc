// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks and the task table.

use abi::{Priority, Tick};

use crate::condition::CondIndex;
use crate::{KernEvent, Kernel, MAX_TASKS};

/// Names a slot in the task table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskIndex(pub u16);

/// Task lifecycle states.
///
/// A task is, at any instant, threaded on at most one of: the ready queue
/// (`Ready`), the sleep list (`Sleeping`, or `Suspended` with a timeout),
/// or no list at all (`Running`, `New`, `Terminated`). A `Suspended` task
/// is additionally recorded on the waiter list of every condition it is
/// waiting for, through its suspend records rather than its own link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Created, not yet handed to the scheduler.
    New,
    /// Runnable, queued by priority.
    Ready,
    /// Owns the CPU.
    Running,
    /// Parked on one or more conditions.
    Suspended,
    /// Parked on the sleep list only.
    Sleeping,
    /// Dead; its stack has been handed back.
    Terminated,
}

/// Why a parked task was made runnable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeReason {
    /// The sleep wheel expired its deadline.
    SleepResume,
    /// A resume or ping fired on this condition.
    Condition(CondIndex),
}

/// The stack region a task runs on. The kernel only records it; the owner
/// that created the task gets it back at destruction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackBounds {
    pub base: usize,
    pub size: usize,
}

/// One task table entry.
#[derive(Debug)]
pub struct Task {
    pub(crate) name: &'static str,
    pub(crate) priority: Priority,
    pub(crate) state: TaskState,
    /// Entry point and argument, used by the port when it first builds the
    /// task's context.
    pub(crate) entry: Option<(fn(usize), usize)>,
    pub(crate) stack: StackBounds,
    /// List link: ready queue or sleep list, never both.
    pub(crate) link: Option<u16>,
    /// Wake deadline while on the sleep list.
    pub(crate) wake_tick: Tick,
    /// Bitmask of condition indices this task is parked on.
    pub(crate) waiting_mask: u32,
    /// Set by the waker; consumed by the parked task when it resumes.
    pub(crate) wake: Option<WakeReason>,
}

impl Task {
    pub(crate) fn new(name: &'static str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            state: TaskState::New,
            entry: None,
            stack: StackBounds::default(),
            link: None,
            wake_tick: Tick(0),
            waiting_mask: 0,
            wake: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// True while the task is parked on `cond`.
    pub(crate) fn is_waiting_on(&self, cond: CondIndex) -> bool {
        self.waiting_mask & (1 << cond.0) != 0
    }
}

impl slist::Link for Task {
    fn next(&self) -> Option<u16> {
        self.link
    }
    fn set_next(&mut self, next: Option<u16>) {
        self.link = next;
    }
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Creates a task. It stays `New` (invisible to the scheduler) until
    /// [`Kernel::task_add`].
    pub fn create_task(
        &mut self,
        name: &'static str,
        priority: Priority,
        stack: StackBounds,
        entry: fn(usize),
        arg: usize,
    ) -> Result<TaskIndex, abi::Error> {
        if self.tasks.len() == MAX_TASKS {
            return Err(abi::Error::FsNoResource);
        }
        let mut task = Task::new(name, priority);
        task.entry = Some((entry, arg));
        task.stack = stack;
        let ix = self.tasks.len() as u16;
        self.tasks.push(task).ok().unwrap();
        Ok(TaskIndex(ix))
    }

    /// Hands a `New` task to the scheduler.
    pub fn task_add(&mut self, task: TaskIndex) {
        assert_eq!(self.tasks[usize::from(task.0)].state, TaskState::New);
        self.make_ready(task);
    }

    /// Tears a task down, returning its stack to the owner.
    ///
    /// The victim must not be the current task and must not be parked on
    /// any condition; an owner that needs to kill a waiter resumes its
    /// conditions with an error status first, per the cancellation policy.
    pub fn task_destroy(&mut self, task: TaskIndex) -> StackBounds {
        assert_ne!(task, self.sched.current());
        let t = &self.tasks[usize::from(task.0)];
        assert_eq!(t.waiting_mask, 0, "destroying a parked task");
        match t.state {
            TaskState::Ready => self.sched.remove_ready(&mut self.tasks, task),
            TaskState::Sleeping => self.sleep.remove(&mut self.tasks, task),
            _ => {}
        }
        let t = &mut self.tasks[usize::from(task.0)];
        t.state = TaskState::Terminated;
        core::mem::take(&mut t.stack)
    }

    /// Marks `task` runnable and queues it by priority.
    pub(crate) fn make_ready(&mut self, task: TaskIndex) {
        let t = &mut self.tasks[usize::from(task.0)];
        debug_assert_ne!(t.state, TaskState::Terminated);
        t.state = TaskState::Ready;
        self.sched.enqueue_ready(&mut self.tasks, task);
        ringbuf::ring_entry!(self.ring, KernEvent::TaskReady(task.0));
    }
}
