// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conditions: the one suspension primitive everything else is built on.
//!
//! A condition is a rendezvous point. A task waits on one or more
//! conditions through [`Kernel::suspend_condition`]; a waker calls
//! [`Kernel::resume_condition`] (or sets the ping flag from an interrupt)
//! and the most deserving waiter comes back runnable. Descriptor readiness,
//! semaphores, the network worker's registrations, and plain explicit
//! handshakes are all just conditions with different [`CondKind`]s.
//!
//! The C ancestry of this design expressed per-condition behavior as
//! `lock`/`unlock`/`do_suspend` function pointers with a `void *`; here the
//! finite set of condition kinds is a tagged enum and the kernel evaluates
//! the predicate and lock effects by matching on it. Likewise, the old
//! overloaded `suspend_data` pointer is split into the task's
//! `waiting_mask` and its `wake` reason.
//!
//! # Invariant
//!
//! A condition's waiter list is only walked with the condition locked (for
//! descriptor conditions, that is the descriptor's ownership lock) and the
//! scheduler lock held across task-state updates.

use abi::{Error, KResult, Priority, Tick};
use slist::List;

use crate::task::{TaskState, WakeReason};
use crate::{KernEvent, Kernel, TaskIndex, MAX_WAIT_CONDS};

/// Names a slot in the condition table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct CondIndex(pub u16);

/// What a condition is about, and therefore what its suspend predicate and
/// lock/unlock effects are.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CondKind {
    /// No predicate: wait until pinged or resumed.
    Explicit,
    /// Wait until the descriptor has data to read. Locking this condition
    /// takes the descriptor's ownership lock.
    FdRead(u16),
    /// Wait until the descriptor has room to write. Locking this condition
    /// takes the descriptor's ownership lock.
    FdWrite(u16),
    /// Wait until the descriptor's ownership lock is free.
    FdLock(u16),
    /// Wait until the semaphore has a count to take.
    Semaphore(u16),
}

#[derive(Debug)]
pub struct Condition {
    pub(crate) kind: CondKind,
    /// Broadcast flag, settable from interrupt context. Surfaced (and
    /// cleared) by the next suspend sweep that sees it.
    pub(crate) ping: bool,
    /// Keep the waiter list sorted by suspend priority instead of arrival
    /// order.
    pub(crate) priority_waiters: bool,
    /// Waiting suspend records, threaded through the suspend arena.
    pub(crate) waiters: List,
}

/// One parked wait: links a task to one condition for the duration of a
/// `suspend_condition` call. Records live in a kernel arena; the C version
/// kept them on the waiter's stack, which an arena reproduces without
/// pointer aliasing.
#[derive(Debug, Default)]
pub struct Suspend {
    pub(crate) task: u16,
    pub(crate) param: u32,
    pub(crate) priority: Priority,
    /// Written by the resumer; `None` is success.
    pub(crate) status: Option<Error>,
    pub(crate) may_resume: bool,
    pub(crate) next: Option<u16>,
}

impl slist::Link for Suspend {
    fn next(&self) -> Option<u16> {
        self.next
    }
    fn set_next(&mut self, next: Option<u16>) {
        self.next = next;
    }
}

/// Caller-side description of one wait leg.
#[derive(Copy, Clone, Debug)]
pub struct WaitSpec {
    /// Opaque value the resume matcher compares against.
    pub param: u32,
    /// Arbitration priority when several conditions fire at once.
    pub priority: Priority,
    /// Absolute deadline; `None` waits forever.
    pub deadline: Option<Tick>,
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self {
            param: 0,
            priority: Priority::IDLE,
            deadline: None,
        }
    }
}

/// How a resume picks waiters.
#[derive(Copy, Clone, Debug)]
pub enum ResumeMatch {
    /// Every waiter, in list order.
    All,
    /// Waiters whose suspend `param` equals this value.
    Param(u32),
}

/// Waker-side descriptor for a resume sweep.
#[derive(Copy, Clone, Debug)]
pub struct Resume {
    /// Status surfaced to each woken waiter; `None` is success.
    pub status: Option<Error>,
    pub matcher: ResumeMatch,
}

impl Resume {
    pub const OK: Self = Self {
        status: None,
        matcher: ResumeMatch::All,
    };
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Adds a condition to the table.
    ///
    /// `priority_waiters` selects priority-ordered wakeup (FIFO within a
    /// priority); the default is plain arrival order.
    pub fn create_condition(
        &mut self,
        kind: CondKind,
        priority_waiters: bool,
    ) -> CondIndex {
        let ix = self.conds.len() as u16;
        self.conds
            .push(Condition {
                kind,
                ping: false,
                priority_waiters,
                waiters: List::new(),
            })
            .ok()
            .expect("condition table full");
        CondIndex(ix)
    }

    /// Waits on a single condition. See [`Kernel::suspend_condition`].
    pub fn suspend_on(
        &mut self,
        cond: CondIndex,
        spec: WaitSpec,
    ) -> KResult<()> {
        self.suspend_condition(&[cond], &[spec], false).0
    }

    /// Waits until one of `conds` is satisfied, pinged, resumed, or the
    /// earliest deadline in `specs` passes.
    ///
    /// Returns the status and the index of the condition that ended the
    /// wait (for a timeout, the index whose deadline was earliest). With
    /// `locked` the caller already holds the conditions' locks and gets
    /// them back on return; otherwise this routine takes and releases them
    /// around the wait.
    pub fn suspend_condition(
        &mut self,
        conds: &[CondIndex],
        specs: &[WaitSpec],
        locked: bool,
    ) -> (KResult<()>, usize) {
        let n = conds.len();
        assert!(n >= 1 && n == specs.len() && n <= MAX_WAIT_CONDS);
        let cur = self.sched.current();

        if !locked {
            for &c in conds {
                self.cond_lock(c);
            }
        }

        // Earliest deadline and the leg it belongs to.
        let mut timeout_ix = 0;
        let mut min_deadline: Option<Tick> = None;
        for (i, s) in specs.iter().enumerate() {
            if let Some(d) = s.deadline {
                let earlier = match min_deadline {
                    None => true,
                    Some(m) => m.since(d) > 0,
                };
                if earlier {
                    min_deadline = Some(d);
                    timeout_ix = i;
                }
            }
        }

        let mut status: KResult<()> = Ok(());
        let mut return_ix;

        loop {
            // Sweep for a condition that is already good: pinged, or its
            // predicate reports no need to wait. Among several, the leg
            // with the most important suspend priority wins.
            let mut best: Option<(usize, Priority)> = None;
            for (i, (&c, s)) in conds.iter().zip(specs).enumerate() {
                let fired = self.conds[usize::from(c.0)].ping
                    || !self.should_wait(c, cur);
                if fired
                    && best
                        .map_or(true, |(_, p)| s.priority.is_more_important_than(p))
                {
                    best = Some((i, s.priority));
                }
            }
            if let Some((i, _)) = best {
                return_ix = i;
                break;
            }

            // Nothing is good and the wait budget is already spent.
            if let Some(d) = min_deadline {
                if self.now.reached(d) {
                    status = Err(Error::ConditionTimeout);
                    return_ix = timeout_ix;
                    ringbuf::ring_entry!(
                        self.ring,
                        KernEvent::ConditionTimeout(conds[timeout_ix].0)
                    );
                    break;
                }
            }

            // Park: one suspend record per condition, threaded onto each
            // waiter list, then hand the CPU away.
            let mut records = [None; MAX_WAIT_CONDS];
            let mut mask = 0u32;
            for (i, (&c, s)) in conds.iter().zip(specs).enumerate() {
                let r = self
                    .suspend_free
                    .pop(&mut self.suspends)
                    .expect("suspend arena exhausted");
                let rec = &mut self.suspends[usize::from(r)];
                rec.task = cur.0;
                rec.param = s.param;
                rec.priority = s.priority;
                rec.status = None;
                rec.may_resume = false;
                let cond = &mut self.conds[usize::from(c.0)];
                if cond.priority_waiters {
                    cond.waiters.insert_sorted(
                        &mut self.suspends,
                        r,
                        |at, new| {
                            new.priority.is_more_important_than(at.priority)
                        },
                    );
                } else {
                    cond.waiters.append(&mut self.suspends, r);
                }
                records[i] = Some(r);
                mask |= 1 << c.0;
            }

            self.sched_lock();
            if let Some(d) = min_deadline {
                let _ = self.sleep.add(&mut self.tasks, cur, d);
            }
            // The state words are also read by the ISR resume path.
            let tasks = &mut self.tasks;
            P::with_interrupts_masked(|| {
                let t = &mut tasks[usize::from(cur.0)];
                t.state = TaskState::Suspended;
                t.waiting_mask = mask;
                t.wake = None;
            });
            // Drop the locks so wakers can get in while we are parked.
            self.cond_unlock_all(conds);
            ringbuf::ring_entry!(self.ring, KernEvent::TaskSuspended(cur.0));

            P::control_to_system(self);

            let wake = self.tasks[usize::from(cur.0)].wake.take();
            self.tasks[usize::from(cur.0)].waiting_mask = 0;
            self.sched_unlock();
            self.cond_lock_all(conds);

            match wake {
                Some(WakeReason::SleepResume) => {
                    // Timed out: nobody popped our records, take them all
                    // back ourselves.
                    for (&c, r) in conds.iter().zip(records) {
                        let r = r.unwrap();
                        let removed = self.conds[usize::from(c.0)]
                            .waiters
                            .remove(&mut self.suspends, r);
                        debug_assert!(removed.is_some());
                        self.free_suspend(r);
                    }
                    status = Err(Error::ConditionTimeout);
                    return_ix = timeout_ix;
                    ringbuf::ring_entry!(
                        self.ring,
                        KernEvent::ConditionTimeout(conds[timeout_ix].0)
                    );
                    break;
                }
                Some(WakeReason::Condition(wc)) => {
                    // The waker popped the record on its own condition;
                    // ours remain on every other list.
                    let mut res_ix = 0;
                    let mut res_status = None;
                    for (i, (&c, r)) in conds.iter().zip(records).enumerate()
                    {
                        let r = r.unwrap();
                        if c == wc {
                            res_ix = i;
                            res_status = self.suspends[usize::from(r)].status;
                        } else {
                            self.conds[usize::from(c.0)]
                                .waiters
                                .remove(&mut self.suspends, r);
                        }
                        self.free_suspend(r);
                    }
                    return_ix = res_ix;
                    if let Some(e) = res_status {
                        status = Err(e);
                        break;
                    }
                    if self.conds[usize::from(wc.0)].ping {
                        break;
                    }
                    if !self.should_wait(wc, cur) {
                        break;
                    }
                    // A more important task consumed the condition between
                    // our wakeup and our turn on the CPU. Go around.
                }
                None => panic!("task {} woken without a wake reason", cur.0),
            }
        }

        // A ping is consumed by exactly one observation.
        let rc = conds[return_ix];
        if self.conds[usize::from(rc.0)].ping {
            self.conds[usize::from(rc.0)].ping = false;
        }

        if !locked {
            self.cond_unlock_all(conds);
        }
        (status, return_ix)
    }

    /// Wakes waiters of `cond` per `resume`.
    ///
    /// Every matching waiter is swept: its status is written, and if it is
    /// genuinely parked on this condition it is made runnable. Records
    /// whose task has already moved on (resumed elsewhere, or timed out
    /// but not yet scheduled) are left in place for their owner to
    /// collect.
    pub fn resume_condition(
        &mut self,
        cond: CondIndex,
        resume: Resume,
        locked: bool,
    ) {
        if !locked {
            self.cond_lock(cond);
        }
        self.sched_lock();
        let woke = self.resume_sweep(cond, resume);
        self.sched_unlock();
        if woke {
            self.task_yield();
        }
        if !locked {
            self.cond_unlock(cond);
        }
    }

    /// Interrupt-safe resume: no locks are taken and no context switch
    /// happens here; a pending yield is noted for the next yield point.
    pub fn resume_condition_isr(&mut self, cond: CondIndex, resume: Resume) {
        if self.resume_sweep(cond, resume) {
            self.sched.set_pending_yield();
        }
    }

    /// Sets the broadcast flag and kicks any present waiters. Setting the
    /// flag twice before a waiter runs still wakes it exactly once.
    pub fn condition_ping(&mut self, cond: CondIndex) {
        self.conds[usize::from(cond.0)].ping = true;
        ringbuf::ring_entry!(self.ring, KernEvent::ConditionPing(cond.0));
        self.resume_condition(cond, Resume::OK, false);
    }

    /// Interrupt-safe ping.
    pub fn condition_ping_isr(&mut self, cond: CondIndex) {
        self.conds[usize::from(cond.0)].ping = true;
        ringbuf::ring_entry!(self.ring, KernEvent::ConditionPing(cond.0));
        self.resume_condition_isr(cond, Resume::OK);
    }

    fn resume_sweep(&mut self, cond: CondIndex, resume: Resume) -> bool {
        let ci = usize::from(cond.0);
        let mut stash = List::new();
        let mut woke_any = false;
        loop {
            let rec = match resume.matcher {
                ResumeMatch::All => {
                    self.conds[ci].waiters.pop(&mut self.suspends)
                }
                ResumeMatch::Param(v) => self.conds[ci]
                    .waiters
                    .search_pop(&mut self.suspends, |s| s.param == v),
            };
            let Some(r) = rec else { break };
            let task = {
                let rec = &mut self.suspends[usize::from(r)];
                rec.status = resume.status;
                rec.may_resume = true;
                rec.task
            };
            let t = &self.tasks[usize::from(task)];
            if t.state() == TaskState::Suspended && t.is_waiting_on(cond) {
                // A timed wait is threaded on the sleep list through the
                // same link the ready queue uses; unthread it first.
                self.sleep.remove(&mut self.tasks, TaskIndex(task));
                self.tasks[usize::from(task)].wake =
                    Some(WakeReason::Condition(cond));
                self.make_ready(TaskIndex(task));
                ringbuf::ring_entry!(
                    self.ring,
                    KernEvent::ConditionResume(cond.0)
                );
                woke_any = true;
            } else {
                // Task has moved on; give the record back for its owner to
                // reap.
                stash.push(&mut self.suspends, r);
            }
        }
        while let Some(r) = stash.pop(&mut self.suspends) {
            self.conds[ci].waiters.push(&mut self.suspends, r);
        }
        woke_any
    }

    /// Predicate: should a waiter keep waiting on `cond`?
    pub(crate) fn should_wait(&self, cond: CondIndex, cur: TaskIndex) -> bool {
        match self.conds[usize::from(cond.0)].kind {
            CondKind::Explicit => true,
            CondKind::FdRead(fd) => !self.fds[usize::from(fd)]
                .flags
                .contains(crate::fd::FdFlags::DATA_AVAILABLE),
            CondKind::FdWrite(fd) => !self.fds[usize::from(fd)]
                .flags
                .contains(crate::fd::FdFlags::SPACE_AVAILABLE),
            CondKind::FdLock(fd) => {
                let f = &self.fds[usize::from(fd)];
                f.lock_owner.is_some() && f.lock_owner != Some(cur)
            }
            CondKind::Semaphore(s) => self.sems[usize::from(s)].count == 0,
        }
    }

    pub(crate) fn cond_lock(&mut self, cond: CondIndex) {
        match self.conds[usize::from(cond.0)].kind {
            CondKind::FdRead(fd) | CondKind::FdWrite(fd) => {
                self.fd_get_lock(crate::fd::FdIndex(fd));
            }
            _ => {}
        }
    }

    pub(crate) fn cond_unlock(&mut self, cond: CondIndex) {
        match self.conds[usize::from(cond.0)].kind {
            CondKind::FdRead(fd) | CondKind::FdWrite(fd) => {
                self.fd_release_lock(crate::fd::FdIndex(fd));
            }
            _ => {}
        }
    }

    fn cond_lock_all(&mut self, conds: &[CondIndex]) {
        for &c in conds {
            self.cond_lock(c);
        }
    }

    fn cond_unlock_all(&mut self, conds: &[CondIndex]) {
        for &c in conds {
            self.cond_unlock(c);
        }
    }

    fn free_suspend(&mut self, r: u16) {
        self.suspends[usize::from(r)].may_resume = false;
        self.suspend_free.push(&mut self.suspends, r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{self, Host};
    use crate::task::StackBounds;

    fn noop(_: usize) {}

    fn kernel() -> Kernel<Host> {
        fake::reset();
        Kernel::new(Priority(10))
    }

    // Threads a suspend record for a non-running task onto a condition, the
    // way suspend_condition would if that task were the one executing.
    fn park_task(
        k: &mut Kernel<Host>,
        task: TaskIndex,
        cond: CondIndex,
        priority: Priority,
        param: u32,
    ) {
        let r = k.suspend_free.pop(&mut k.suspends).unwrap();
        let rec = &mut k.suspends[usize::from(r)];
        rec.task = task.0;
        rec.param = param;
        rec.priority = priority;
        rec.status = None;
        rec.may_resume = false;
        let c = &mut k.conds[usize::from(cond.0)];
        if c.priority_waiters {
            c.waiters.insert_sorted(&mut k.suspends, r, |at, new| {
                new.priority.is_more_important_than(at.priority)
            });
        } else {
            c.waiters.append(&mut k.suspends, r);
        }
        let t = &mut k.tasks[usize::from(task.0)];
        t.state = TaskState::Suspended;
        t.waiting_mask |= 1 << cond.0;
        t.wake = None;
    }

    #[test]
    fn precheck_skips_park_when_pinged() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        k.conds[usize::from(c.0)].ping = true;
        let (status, ix) = k.suspend_condition(
            &[c],
            &[WaitSpec::default()],
            false,
        );
        assert!(status.is_ok());
        assert_eq!(ix, 0);
        // Consumed exactly once.
        assert!(!k.conds[usize::from(c.0)].ping);
    }

    #[test]
    fn ping_wakes_exactly_once() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        // Two pings before the waiter runs collapse into one wakeup.
        k.conds[usize::from(c.0)].ping = true;
        k.conds[usize::from(c.0)].ping = true;
        let (status, _) =
            k.suspend_condition(&[c], &[WaitSpec::default()], false);
        assert!(status.is_ok());
        assert!(!k.conds[usize::from(c.0)].ping);
        // A second wait must actually park; give it a timeout to come back.
        let spec = WaitSpec {
            deadline: Some(Tick(10)),
            ..WaitSpec::default()
        };
        fake::on_park(|k| k.tick(Tick(10)));
        let (status, _) = k.suspend_condition(&[c], &[spec], false);
        assert_eq!(status, Err(Error::ConditionTimeout));
    }

    #[test]
    fn timeout_returns_after_deadline() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        let spec = WaitSpec {
            deadline: Some(Tick(25)),
            ..WaitSpec::default()
        };
        fake::on_park(|k| k.tick(Tick(24)));
        fake::on_park(|k| k.tick(Tick(25)));
        let (status, ix) = k.suspend_condition(&[c], &[spec], false);
        assert_eq!(status, Err(Error::ConditionTimeout));
        assert_eq!(ix, 0);
        // Woke on the tick that reached the deadline, not the one before.
        assert_eq!(k.now(), Tick(25));
        // Our record is gone from the waiter list.
        assert!(k.conds[usize::from(c.0)].waiters.is_empty());
    }

    #[test]
    fn multi_condition_returns_fired_index_and_cleans_the_rest() {
        let mut k = kernel();
        let c1 = k.create_condition(CondKind::Explicit, false);
        let c2 = k.create_condition(CondKind::Explicit, false);
        fake::on_park(move |k| k.condition_ping(c2));
        let (status, ix) = k.suspend_condition(
            &[c1, c2],
            &[WaitSpec::default(), WaitSpec::default()],
            false,
        );
        assert!(status.is_ok());
        assert_eq!(ix, 1);
        assert!(k.conds[usize::from(c1.0)].waiters.is_empty());
        assert!(k.conds[usize::from(c2.0)].waiters.is_empty());
        assert!(!k.conds[usize::from(c2.0)].ping);
    }

    #[test]
    fn priority_waiter_wins_single_resume() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, true);
        let slow = k
            .create_task("slow", Priority(10), StackBounds::default(), noop, 0)
            .unwrap();
        let fast = k
            .create_task("fast", Priority(5), StackBounds::default(), noop, 0)
            .unwrap();
        // Arrival order deliberately inverts priority order.
        park_task(&mut k, slow, c, Priority(10), 7);
        park_task(&mut k, fast, c, Priority(5), 7);

        k.resume_condition(
            c,
            Resume {
                status: None,
                matcher: ResumeMatch::Param(7),
            },
            false,
        );
        // Both match, so the sweep wakes both, but the priority-sorted list
        // puts the important one first in the ready queue.
        assert_eq!(k.tasks[usize::from(fast.0)].state(), TaskState::Ready);
        assert_eq!(k.sched.ready_head(), Some(fast.0));
    }

    #[test]
    fn param_match_skips_non_matching_waiters() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        let a = k
            .create_task("a", Priority(5), StackBounds::default(), noop, 0)
            .unwrap();
        let b = k
            .create_task("b", Priority(5), StackBounds::default(), noop, 0)
            .unwrap();
        park_task(&mut k, a, c, Priority(5), 1111);
        park_task(&mut k, b, c, Priority(5), 2222);

        k.resume_condition(
            c,
            Resume {
                status: None,
                matcher: ResumeMatch::Param(2222),
            },
            false,
        );
        assert_eq!(k.tasks[usize::from(a.0)].state(), TaskState::Suspended);
        assert_eq!(k.tasks[usize::from(b.0)].state(), TaskState::Ready);
        // a's record is still on the list for a future resume.
        assert_eq!(k.conds[usize::from(c.0)].waiters.num_items(&k.suspends), 1);
    }

    #[test]
    fn resume_with_error_status_surfaces_to_waiter() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        fake::on_park(move |k| {
            k.resume_condition(
                c,
                Resume {
                    status: Some(Error::NetLinkDown),
                    matcher: ResumeMatch::All,
                },
                false,
            )
        });
        let (status, ix) =
            k.suspend_condition(&[c], &[WaitSpec::default()], false);
        assert_eq!(status, Err(Error::NetLinkDown));
        assert_eq!(ix, 0);
    }

    #[test]
    fn stale_resume_leaves_record_for_owner() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        let a = k
            .create_task("a", Priority(5), StackBounds::default(), noop, 0)
            .unwrap();
        park_task(&mut k, a, c, Priority(5), 0);
        // The task times out behind the resumer's back.
        k.tasks[usize::from(a.0)].state = TaskState::Ready;
        k.resume_condition(c, Resume::OK, false);
        // Not rescheduled twice, and the record went back on the list.
        assert_eq!(k.conds[usize::from(c.0)].waiters.num_items(&k.suspends), 1);
    }

    #[test]
    fn expired_deadline_on_entry_times_out_without_parking() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        k.tick(Tick(100));
        let spec = WaitSpec {
            deadline: Some(Tick(50)),
            ..WaitSpec::default()
        };
        let (status, ix) = k.suspend_condition(&[c], &[spec], false);
        assert_eq!(status, Err(Error::ConditionTimeout));
        assert_eq!(ix, 0);
    }

    #[test]
    fn suspend_arena_drains_and_refills() {
        let mut k = kernel();
        let c = k.create_condition(CondKind::Explicit, false);
        let free_before = k.suspend_free.num_items(&k.suspends);
        let spec = WaitSpec {
            deadline: Some(Tick(5)),
            ..WaitSpec::default()
        };
        fake::on_park(|k| k.tick(Tick(5)));
        let _ = k.suspend_condition(&[c], &[spec], false);
        assert_eq!(k.suspend_free.num_items(&k.suspends), free_before);
    }
}
