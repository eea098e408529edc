// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores, as a thin skin over the condition framework.

use abi::{Error, KResult, Tick};

use crate::condition::{CondIndex, CondKind, Resume, WaitSpec};
use crate::{Kernel, MAX_SEMAPHORES};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct SemIndex(pub u16);

#[derive(Debug)]
pub struct Semaphore {
    pub(crate) count: u8,
    pub(crate) max: u8,
    pub(crate) cond: CondIndex,
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Creates a semaphore with `count` of `max` permits available.
    ///
    /// Waiters queue in priority order, so a contended release goes to the
    /// most important blocked task.
    pub fn create_semaphore(&mut self, count: u8, max: u8) -> SemIndex {
        assert!(count <= max);
        if self.sems.len() == MAX_SEMAPHORES {
            panic!("semaphore table full");
        }
        let ix = self.sems.len() as u16;
        let cond = self.create_condition(CondKind::Semaphore(ix), true);
        self.sems
            .push(Semaphore { count, max, cond })
            .ok()
            .unwrap();
        SemIndex(ix)
    }

    /// Takes a permit, waiting up to `deadline` for one to appear.
    ///
    /// A released permit wakes every waiter; each re-runs the availability
    /// check on its way out of the suspend loop, so only one of them
    /// actually gets the permit and the rest go back to sleep.
    pub fn sem_obtain(
        &mut self,
        sem: SemIndex,
        deadline: Option<Tick>,
    ) -> KResult<()> {
        let cond = self.sems[usize::from(sem.0)].cond;
        loop {
            if self.sems[usize::from(sem.0)].count > 0 {
                self.sems[usize::from(sem.0)].count -= 1;
                return Ok(());
            }
            let priority =
                self.tasks[usize::from(self.sched.current().0)].priority();
            self.suspend_on(
                cond,
                WaitSpec {
                    param: 0,
                    priority,
                    deadline,
                },
            )?;
        }
    }

    /// Returns a permit and kicks the waiters.
    pub fn sem_release(&mut self, sem: SemIndex) {
        let s = &mut self.sems[usize::from(sem.0)];
        assert!(s.count < s.max, "semaphore over-release");
        s.count += 1;
        let cond = s.cond;
        self.resume_condition(cond, Resume::OK, false);
    }

    /// Non-blocking acquire.
    pub fn sem_try_obtain(&mut self, sem: SemIndex) -> KResult<()> {
        let s = &mut self.sems[usize::from(sem.0)];
        if s.count > 0 {
            s.count -= 1;
            Ok(())
        } else {
            Err(Error::FsWouldBlock)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{self, Host};
    use abi::Priority;

    #[test]
    fn obtain_and_release() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        let s = k.create_semaphore(1, 1);
        k.sem_obtain(s, None).unwrap();
        assert_eq!(k.sem_try_obtain(s), Err(Error::FsWouldBlock));
        k.sem_release(s);
        k.sem_obtain(s, None).unwrap();
        k.sem_release(s);
    }

    #[test]
    fn contended_obtain_waits_for_release() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        let s = k.create_semaphore(0, 1);
        fake::on_park(move |k| k.sem_release(s));
        k.sem_obtain(s, None).unwrap();
        assert_eq!(k.sems[0].count, 0);
    }

    #[test]
    fn obtain_times_out_empty_handed() {
        fake::reset();
        let mut k: Kernel<Host> = Kernel::new(Priority(10));
        let s = k.create_semaphore(0, 1);
        fake::on_park(|k| k.tick(Tick(30)));
        let r = k.sem_obtain(s, Some(Tick(30)));
        assert_eq!(r, Err(Error::ConditionTimeout));
    }
}
