// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-arbitrated access to a page allocator region.
//!
//! The allocator itself (`pagemem`) is a plain data structure; exclusive
//! access on the host falls out of `&mut`. On a live system allocate and
//! free must additionally be serialized against other tasks, under either
//! a binary semaphore (so higher-priority tasks get memory first) or, when
//! none was given, the scheduler lock.

use pagemem::{Allocation, Region};

use crate::semaphore::SemIndex;
use crate::Kernel;

/// A region plus its serialization policy.
pub struct GuardedRegion<'a, const N: usize> {
    region: Region<'a, N>,
    lock: Option<SemIndex>,
}

impl<'a, const N: usize> GuardedRegion<'a, N> {
    /// Wraps `region`. Pass a binary semaphore to arbitrate by priority;
    /// `None` serializes under the scheduler lock instead.
    pub fn new(region: Region<'a, N>, lock: Option<SemIndex>) -> Self {
        Self { region, lock }
    }

    pub fn alloc<P: crate::arch::Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        len: u32,
    ) -> Option<Allocation> {
        match self.lock {
            Some(sem) => {
                kernel.sem_obtain(sem, None).ok()?;
                let r = self.region.alloc(len);
                kernel.sem_release(sem);
                r
            }
            None => {
                kernel.sched_lock();
                let r = self.region.alloc(len);
                kernel.sched_unlock();
                r
            }
        }
    }

    pub fn free<P: crate::arch::Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        a: Allocation,
    ) {
        match self.lock {
            Some(sem) => {
                if kernel.sem_obtain(sem, None).is_ok() {
                    self.region.free(a);
                    kernel.sem_release(sem);
                }
            }
            None => {
                kernel.sched_lock();
                self.region.free(a);
                kernel.sched_unlock();
            }
        }
    }

    pub fn region(&self) -> &Region<'a, N> {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region<'a, N> {
        &mut self.region
    }
}
