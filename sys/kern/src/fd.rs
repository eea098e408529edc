// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File descriptors: the uniform handle for devices, serial lines, and
//! sockets.
//!
//! A descriptor couples a buffer pool with two readiness conditions (data
//! to read, room to write) and a recursive ownership lock. Drivers hold
//! the lock across any multi-step transaction and must release it before
//! blocking on a *different* descriptor; the lock itself blocks through a
//! third, dedicated condition.
//!
//! Readiness is a pair of flag bits plus the helpers that flip them:
//! `fd_data_available`/`fd_data_flushed` for the read side and
//! `fd_space_available`/`fd_space_consumed` for the write side. Each
//! "available" helper also resumes the matching condition, which is how an
//! interrupt handler hands bytes to a sleeping reader.
//!
//! Two descriptors can be tied back to back with [`Kernel::fd_connect`];
//! writes to one then land on the other's receive queue. That is the
//! in-core transport used by the loopback tests and the network stack's
//! test devices; real device registers live outside the core.

use abi::{Error, KResult};
use bitflags::bitflags;

use crate::condition::{CondIndex, CondKind, Resume, WaitSpec};
use crate::fsbuf::{BufFlags, BufferPool, ListHandle, Slot};
use crate::{KernEvent, Kernel, TaskIndex, MAX_FDS};

/// Names a slot in the descriptor table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct FdIndex(pub u16);

bitflags! {
    /// Descriptor state and behavior bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FdFlags: u16 {
        /// Block instead of returning `FsWouldBlock`.
        const BLOCK = 1 << 0;
        /// Reads hand over whole buffer lists; writes accept them.
        const BUFFERED = 1 << 1;
        /// Receive queue is non-empty.
        const DATA_AVAILABLE = 1 << 2;
        /// The pool can supply at least one chunk.
        const SPACE_AVAILABLE = 1 << 3;
        /// Descriptor carries debug console traffic.
        const DEBUG = 1 << 4;
        /// Backend is interrupt-driven.
        const INT = 1 << 5;
        /// A transmit is in progress.
        const IN_TX = 1 << 6;
    }
}

/// Commands understood by [`Kernel::fd_ioctl`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoctlCmd {
    /// Drop everything queued for read; returns the list count dropped.
    FlushRx,
    /// Drop everything queued for transmit; returns the list count
    /// dropped.
    FlushTx,
    /// Returns the number of lists queued for read.
    QueuedRx,
}

#[derive(Debug)]
pub struct Fd {
    pub(crate) name: &'static str,
    pub(crate) flags: FdFlags,
    pub(crate) read_cond: CondIndex,
    pub(crate) write_cond: CondIndex,
    pub(crate) lock_cond: CondIndex,
    pub(crate) lock_owner: Option<TaskIndex>,
    pub(crate) lock_count: u8,
    pub(crate) pool: BufferPool,
    /// Back-to-back peer: our transmits land on its receive queue.
    pub(crate) link: Option<FdIndex>,
}

impl Fd {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> FdFlags {
        self.flags
    }
}

impl<P: crate::arch::Platform> Kernel<P> {
    /// Creates a descriptor backed by its own buffer pool.
    pub fn create_fd(
        &mut self,
        name: &'static str,
        flags: FdFlags,
        threshold_chunks: u16,
        threshold_lists: u16,
    ) -> KResult<FdIndex> {
        if self.fds.len() == MAX_FDS {
            return Err(Error::FsNoResource);
        }
        let ix = self.fds.len() as u16;
        let read_cond = self.create_condition(CondKind::FdRead(ix), false);
        let write_cond = self.create_condition(CondKind::FdWrite(ix), false);
        let lock_cond = self.create_condition(CondKind::FdLock(ix), true);
        self.fds
            .push(Fd {
                name,
                flags: flags | FdFlags::SPACE_AVAILABLE,
                read_cond,
                write_cond,
                lock_cond,
                lock_owner: None,
                lock_count: 0,
                pool: BufferPool::new(threshold_chunks, threshold_lists),
                link: None,
            })
            .ok()
            .unwrap();
        Ok(FdIndex(ix))
    }

    /// Ties two descriptors back to back.
    pub fn fd_connect(&mut self, a: FdIndex, b: FdIndex) {
        self.fds[usize::from(a.0)].link = Some(b);
        self.fds[usize::from(b.0)].link = Some(a);
    }

    pub fn fd_flags(&self, fd: FdIndex) -> FdFlags {
        self.fds[usize::from(fd.0)].flags
    }

    pub fn fd_pool(&self, fd: FdIndex) -> &BufferPool {
        &self.fds[usize::from(fd.0)].pool
    }

    pub fn fd_pool_mut(&mut self, fd: FdIndex) -> &mut BufferPool {
        &mut self.fds[usize::from(fd.0)].pool
    }

    pub fn fd_read_cond(&self, fd: FdIndex) -> CondIndex {
        self.fds[usize::from(fd.0)].read_cond
    }

    pub fn fd_write_cond(&self, fd: FdIndex) -> CondIndex {
        self.fds[usize::from(fd.0)].write_cond
    }

    // ---- ownership lock ----

    /// Takes the descriptor's lock, waiting if another task holds it.
    /// Reentrant on the same task.
    pub fn fd_get_lock(&mut self, fd: FdIndex) {
        let cur = self.sched.current();
        loop {
            let f = &mut self.fds[usize::from(fd.0)];
            match f.lock_owner {
                None => {
                    f.lock_owner = Some(cur);
                    f.lock_count = 1;
                    ringbuf::ring_entry!(self.ring, KernEvent::FdLocked(fd.0));
                    return;
                }
                Some(owner) if owner == cur => {
                    f.lock_count += 1;
                    return;
                }
                Some(_) => {
                    let cond = f.lock_cond;
                    let priority =
                        self.tasks[usize::from(cur.0)].priority();
                    // Wait for the holder to let go, then race for it.
                    let _ = self.suspend_on(
                        cond,
                        WaitSpec {
                            param: 0,
                            priority,
                            deadline: None,
                        },
                    );
                }
            }
        }
    }

    /// Non-blocking lock acquire.
    pub fn fd_try_get_lock(&mut self, fd: FdIndex) -> KResult<()> {
        let cur = self.sched.current();
        let f = &mut self.fds[usize::from(fd.0)];
        match f.lock_owner {
            None => {
                f.lock_owner = Some(cur);
                f.lock_count = 1;
                Ok(())
            }
            Some(owner) if owner == cur => {
                f.lock_count += 1;
                Ok(())
            }
            Some(_) => Err(Error::FsLockBusy),
        }
    }

    /// Releases one level of the lock; the final release wakes waiters.
    pub fn fd_release_lock(&mut self, fd: FdIndex) {
        let cur = self.sched.current();
        let f = &mut self.fds[usize::from(fd.0)];
        assert_eq!(
            f.lock_owner,
            Some(cur),
            "releasing a lock held by another task"
        );
        f.lock_count -= 1;
        if f.lock_count == 0 {
            f.lock_owner = None;
            let cond = f.lock_cond;
            self.resume_condition(cond, Resume::OK, false);
        }
    }

    // ---- readiness flags ----

    /// Marks the read side ready and wakes readers.
    pub fn fd_data_available(&mut self, fd: FdIndex) {
        self.fds[usize::from(fd.0)].flags |= FdFlags::DATA_AVAILABLE;
        ringbuf::ring_entry!(self.ring, KernEvent::FdDataAvailable(fd.0));
        let cond = self.fds[usize::from(fd.0)].read_cond;
        self.resume_condition(cond, Resume::OK, false);
    }

    /// Interrupt-safe variant of [`Kernel::fd_data_available`].
    pub fn fd_data_available_isr(&mut self, fd: FdIndex) {
        self.fds[usize::from(fd.0)].flags |= FdFlags::DATA_AVAILABLE;
        let cond = self.fds[usize::from(fd.0)].read_cond;
        self.resume_condition_isr(cond, Resume::OK);
    }

    /// Clears the read-ready bit once the receive queue drains.
    pub fn fd_data_flushed(&mut self, fd: FdIndex) {
        self.fds[usize::from(fd.0)].flags &= !FdFlags::DATA_AVAILABLE;
    }

    /// Marks the write side ready and wakes writers.
    pub fn fd_space_available(&mut self, fd: FdIndex) {
        self.fds[usize::from(fd.0)].flags |= FdFlags::SPACE_AVAILABLE;
        ringbuf::ring_entry!(self.ring, KernEvent::FdSpaceAvailable(fd.0));
        let cond = self.fds[usize::from(fd.0)].write_cond;
        self.resume_condition(cond, Resume::OK, false);
    }

    /// Clears the write-ready bit when the pool runs out of chunks.
    pub fn fd_space_consumed(&mut self, fd: FdIndex) {
        self.fds[usize::from(fd.0)].flags &= !FdFlags::SPACE_AVAILABLE;
    }

    // ---- data path ----

    /// Copies up to `buf.len()` bytes out of the oldest received list.
    ///
    /// Blocks (or returns `FsWouldBlock`) when nothing is queued.
    pub fn fd_read(&mut self, fd: FdIndex, buf: &mut [u8]) -> KResult<usize> {
        self.fd_get_lock(fd);
        let r = self.fd_read_locked(fd, buf);
        self.fd_release_lock(fd);
        r
    }

    fn fd_read_locked(
        &mut self,
        fd: FdIndex,
        buf: &mut [u8],
    ) -> KResult<usize> {
        loop {
            let fi = usize::from(fd.0);
            if self.fds[fi].flags.contains(FdFlags::DATA_AVAILABLE) {
                let pool = &mut self.fds[fi].pool;
                let Some(h) = pool.take(Slot::Rx) else {
                    // Flag raced ahead of the queue; treat as no data.
                    self.fd_data_flushed(fd);
                    continue;
                };
                let n = (pool.total_len(h) as usize).min(buf.len());
                pool.pull(h, Some(&mut buf[..n]), n, BufFlags::empty())?;
                if pool.total_len(h) == 0 {
                    pool.free_list(h);
                } else {
                    pool.give_front(Slot::Rx, h);
                }
                if self.fds[fi].pool.queued(Slot::Rx) == 0 {
                    self.fd_data_flushed(fd);
                }
                self.fd_space_available(fd);
                return Ok(n);
            }
            if !self.fds[fi].flags.contains(FdFlags::BLOCK) {
                return Err(Error::FsWouldBlock);
            }
            let cond = self.fds[fi].read_cond;
            let (status, _) = self.suspend_condition(
                &[cond],
                &[WaitSpec::default()],
                true,
            );
            status?;
        }
    }

    /// Detaches and returns the oldest received buffer list without
    /// copying. The descriptor must be `BUFFERED`.
    pub fn fd_read_buffer(&mut self, fd: FdIndex) -> KResult<ListHandle> {
        assert!(self.fds[usize::from(fd.0)]
            .flags
            .contains(FdFlags::BUFFERED));
        self.fd_get_lock(fd);
        let r = loop {
            let fi = usize::from(fd.0);
            if let Some(h) = self.fds[fi].pool.take(Slot::Rx) {
                if self.fds[fi].pool.queued(Slot::Rx) == 0 {
                    self.fd_data_flushed(fd);
                }
                break Ok(h);
            }
            self.fd_data_flushed(fd);
            if !self.fds[fi].flags.contains(FdFlags::BLOCK) {
                break Err(Error::FsWouldBlock);
            }
            let cond = self.fds[fi].read_cond;
            let (status, _) = self.suspend_condition(
                &[cond],
                &[WaitSpec::default()],
                true,
            );
            if let Err(e) = status {
                break Err(e);
            }
        };
        self.fd_release_lock(fd);
        r
    }

    /// Copies `bytes` into a fresh list and transmits it.
    pub fn fd_write(&mut self, fd: FdIndex, bytes: &[u8]) -> KResult<usize> {
        self.fd_get_lock(fd);
        let r = self.fd_write_locked(fd, bytes);
        self.fd_release_lock(fd);
        r
    }

    fn fd_write_locked(
        &mut self,
        fd: FdIndex,
        bytes: &[u8],
    ) -> KResult<usize> {
        let h = loop {
            let fi = usize::from(fd.0);
            let pool = &mut self.fds[fi].pool;
            match pool.alloc_list(BufFlags::empty()) {
                Ok(h) if pool.can_fit(h, bytes.len(), BufFlags::empty()) => {
                    break h;
                }
                Ok(h) => pool.free_list(h),
                Err(_) => {}
            }
            self.fd_space_consumed(fd);
            if !self.fds[fi].flags.contains(FdFlags::BLOCK) {
                return Err(Error::FsWouldBlock);
            }
            let cond = self.fds[fi].write_cond;
            let (status, _) = self.suspend_condition(
                &[cond],
                &[WaitSpec::default()],
                true,
            );
            status?;
        };
        let pool = &mut self.fds[usize::from(fd.0)].pool;
        pool.push(h, bytes, BufFlags::empty())?;
        self.fd_transmit(fd, h)?;
        Ok(bytes.len())
    }

    /// Queues an assembled list (already built in this descriptor's pool)
    /// for transmit.
    pub fn fd_write_buffer(
        &mut self,
        fd: FdIndex,
        h: ListHandle,
    ) -> KResult<()> {
        self.fd_get_lock(fd);
        let r = self.fd_transmit(fd, h);
        self.fd_release_lock(fd);
        r
    }

    fn fd_transmit(&mut self, fd: FdIndex, h: ListHandle) -> KResult<()> {
        let fi = usize::from(fd.0);
        self.fds[fi].flags |= FdFlags::IN_TX;
        let r = match self.fds[fi].link {
            Some(peer) => self.fd_deliver(fd, peer, h),
            None => {
                self.fds[fi].pool.give(Slot::Tx, h);
                Ok(())
            }
        };
        self.fds[fi].flags &= !FdFlags::IN_TX;
        if self.fds[fi].pool.free_chunk_count() == 0 {
            self.fd_space_consumed(fd);
        }
        r
    }

    // Copy a list across to the peer's pool and wake its readers. The
    // local list is freed on success; on a full peer the frame is dropped
    // (as a wire would drop it) but the local buffers still come back.
    fn fd_deliver(
        &mut self,
        fd: FdIndex,
        peer: FdIndex,
        h: ListHandle,
    ) -> KResult<()> {
        let len = self.fds[usize::from(fd.0)].pool.total_len(h) as usize;
        let mut scratch = [0u8; crate::fsbuf::FS_BUFFER_SIZE];
        let dst = {
            let dst_pool = &mut self.fds[usize::from(peer.0)].pool;
            match dst_pool.alloc_list(BufFlags::TH) {
                Ok(d) if dst_pool.can_fit(d, len, BufFlags::TH) => Some(d),
                Ok(d) => {
                    dst_pool.free_list(d);
                    None
                }
                Err(_) => None,
            }
        };
        let delivered = match dst {
            Some(d) => {
                let mut at = 0;
                while at < len {
                    let n = scratch.len().min(len - at);
                    self.fds[usize::from(fd.0)].pool.pull_offset(
                        h,
                        Some(&mut scratch[..n]),
                        n,
                        at,
                        BufFlags::empty(),
                    )?;
                    self.fds[usize::from(peer.0)].pool.push(
                        d,
                        &scratch[..n],
                        BufFlags::TH,
                    )?;
                    at += n;
                }
                self.fds[usize::from(peer.0)].pool.give(Slot::Rx, d);
                true
            }
            None => false,
        };
        self.fds[usize::from(fd.0)].pool.free_list(h);
        self.fd_space_available(fd);
        if delivered {
            self.fd_data_available(peer);
            Ok(())
        } else {
            Err(Error::NetThreshold)
        }
    }

    /// Control operations.
    pub fn fd_ioctl(&mut self, fd: FdIndex, cmd: IoctlCmd) -> KResult<u32> {
        let fi = usize::from(fd.0);
        match cmd {
            IoctlCmd::FlushRx => {
                let mut n = 0;
                while let Some(h) = self.fds[fi].pool.take(Slot::Rx) {
                    self.fds[fi].pool.free_list(h);
                    n += 1;
                }
                self.fd_data_flushed(fd);
                self.fd_space_available(fd);
                Ok(n)
            }
            IoctlCmd::FlushTx => {
                let mut n = 0;
                while let Some(h) = self.fds[fi].pool.take(Slot::Tx) {
                    self.fds[fi].pool.free_list(h);
                    n += 1;
                }
                self.fd_space_available(fd);
                Ok(n)
            }
            IoctlCmd::QueuedRx => {
                Ok(self.fds[fi].pool.queued(Slot::Rx) as u32)
            }
        }
    }

    /// Hands a received frame to a descriptor from interrupt context: the
    /// list must already sit in the descriptor's pool.
    pub fn fd_receive_isr(&mut self, fd: FdIndex, h: ListHandle) {
        self.fds[usize::from(fd.0)].pool.give(Slot::Rx, h);
        self.fd_data_available_isr(fd);
    }

    /// Returns a list obtained from [`Kernel::fd_read_buffer`] and lets
    /// writers know the chunks are back.
    pub fn fd_buffer_release(&mut self, fd: FdIndex, h: ListHandle) {
        self.fds[usize::from(fd.0)].pool.free_list(h);
        self.fd_space_available(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{self, Host};
    use abi::Priority;

    fn kernel() -> Kernel<Host> {
        fake::reset();
        Kernel::new(Priority(10))
    }

    fn pair(k: &mut Kernel<Host>) -> (FdIndex, FdIndex) {
        let a = k
            .create_fd("loop0", FdFlags::BLOCK, 2, 1)
            .unwrap();
        let b = k
            .create_fd("loop1", FdFlags::BLOCK, 2, 1)
            .unwrap();
        k.fd_connect(a, b);
        (a, b)
    }

    #[test]
    fn write_lands_on_peer_rx() {
        let mut k = kernel();
        let (a, b) = pair(&mut k);
        assert_eq!(k.fd_write(a, b"ping").unwrap(), 4);
        assert!(k.fds[usize::from(b.0)]
            .flags
            .contains(FdFlags::DATA_AVAILABLE));
        let mut buf = [0u8; 16];
        let n = k.fd_read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(!k.fds[usize::from(b.0)]
            .flags
            .contains(FdFlags::DATA_AVAILABLE));
    }

    #[test]
    fn nonblocking_read_reports_would_block() {
        let mut k = kernel();
        let a = k.create_fd("uart0", FdFlags::empty(), 0, 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(k.fd_read(a, &mut buf), Err(Error::FsWouldBlock));
    }

    #[test]
    fn blocking_read_waits_for_data() {
        let mut k = kernel();
        let (a, b) = pair(&mut k);
        fake::on_park(move |k| {
            k.fd_write(a, b"late").unwrap();
        });
        let mut buf = [0u8; 16];
        let n = k.fd_read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[test]
    fn lock_is_recursive_for_owner() {
        let mut k = kernel();
        let a = k.create_fd("dev", FdFlags::empty(), 0, 0).unwrap();
        k.fd_get_lock(a);
        k.fd_get_lock(a);
        assert_eq!(k.fds[0].lock_count, 2);
        k.fd_release_lock(a);
        assert!(k.fds[0].lock_owner.is_some());
        k.fd_release_lock(a);
        assert!(k.fds[0].lock_owner.is_none());
    }

    #[test]
    fn try_lock_fails_when_held_elsewhere() {
        let mut k = kernel();
        let a = k.create_fd("dev", FdFlags::empty(), 0, 0).unwrap();
        // Fake another owner.
        k.fds[0].lock_owner = Some(TaskIndex(99));
        k.fds[0].lock_count = 1;
        assert_eq!(k.fd_try_get_lock(a), Err(Error::FsLockBusy));
    }

    #[test]
    fn buffered_read_hands_over_the_list() {
        let mut k = kernel();
        let a = k
            .create_fd("eth0", FdFlags::BUFFERED, 2, 1)
            .unwrap();
        let h = k.fd_pool_mut(a).alloc_list(BufFlags::empty()).unwrap();
        k.fd_pool_mut(a).push(h, b"frame", BufFlags::empty()).unwrap();
        k.fd_receive_isr(a, h);
        let got = k.fd_read_buffer(a).unwrap();
        assert_eq!(got, h);
        assert_eq!(k.fd_pool(a).total_len(got), 5);
        k.fd_pool_mut(a).free_list(got);
    }

    #[test]
    fn flush_rx_drops_and_counts() {
        let mut k = kernel();
        let (a, b) = pair(&mut k);
        k.fd_write(a, b"one").unwrap();
        k.fd_write(a, b"two").unwrap();
        assert_eq!(k.fd_ioctl(b, IoctlCmd::QueuedRx).unwrap(), 2);
        assert_eq!(k.fd_ioctl(b, IoctlCmd::FlushRx).unwrap(), 2);
        assert_eq!(k.fd_ioctl(b, IoctlCmd::QueuedRx).unwrap(), 0);
    }
}
