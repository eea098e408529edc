// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-chunk buffer pools and chained buffer lists.
//!
//! Every buffered descriptor owns a [`BufferPool`]: a fixed arena of
//! [`FS_BUFFER_SIZE`]-byte chunks plus a fixed arena of list descriptors.
//! A [`ListHandle`] names one logical packet: an ordered chain of chunks
//! with a cached total length. The pool tracks four populations: free
//! chunks, free list descriptors, and the RX and TX queues of assembled
//! lists.
//!
//! Byte access is exclusively through push/pull (and their random-access
//! offset variants). `PACKED` reverses byte order across the whole span,
//! which is how little-endian scalars cross to and from network order
//! without an intermediate copy.
//!
//! Pool operations never block: callers that may suspend (the descriptor
//! layer) loop on the owning descriptor's space condition instead. That
//! keeps every operation here safe to use from interrupt context.
//!
//! The threshold reserve exists to keep the receive path from starving
//! transmit: `TH`-flagged allocations fail with `NetThreshold` rather than
//! taking the last reserved chunks, so an ACK can always be built.

use abi::{Error, KResult};
use bitflags::bitflags;
use slist::List;

/// Payload bytes per chunk. Compile-time constant by design.
pub const FS_BUFFER_SIZE: usize = 128;
/// Chunks per pool.
pub const POOL_CHUNKS: usize = 16;
/// List descriptors per pool.
pub const POOL_LISTS: usize = 8;

bitflags! {
    /// Options for push/pull operations.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct BufFlags: u16 {
        /// Operate at the head of the list (push: prepend; pull is from
        /// the head by default).
        const HEAD = 1 << 0;
        /// Pull from the tail of the list.
        const TAIL = 1 << 1;
        /// Reverse byte order across the span (LE scalar ⇄ network
        /// order).
        const PACKED = 1 << 2;
        /// Pull without consuming.
        const INPLACE = 1 << 3;
        /// Push over existing bytes instead of extending.
        const UPDATE = 1 << 4;
        /// Honor the pool's reserve threshold.
        const TH = 1 << 5;
        /// Ask the descriptor layer to wait for chunks; ignored here,
        /// where nothing may block.
        const SUSPEND = 1 << 6;
    }
}

/// Which assembled-list queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    Rx,
    Tx,
}

/// Names a list descriptor within one pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct ListHandle(pub u16);

#[derive(Debug)]
pub(crate) struct Chunk {
    pub(crate) data: [u8; FS_BUFFER_SIZE],
    /// First occupied byte.
    pub(crate) off: u16,
    /// Occupied byte count.
    pub(crate) len: u16,
    next: Option<u16>,
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            data: [0; FS_BUFFER_SIZE],
            off: 0,
            len: 0,
            next: None,
        }
    }
}

impl slist::Link for Chunk {
    fn next(&self) -> Option<u16> {
        self.next
    }
    fn set_next(&mut self, next: Option<u16>) {
        self.next = next;
    }
}

#[derive(Debug, Default)]
pub(crate) struct BufferList {
    pub(crate) chunks: List,
    pub(crate) total_len: u32,
    next: Option<u16>,
}

impl slist::Link for BufferList {
    fn next(&self) -> Option<u16> {
        self.next
    }
    fn set_next(&mut self, next: Option<u16>) {
        self.next = next;
    }
}

/// One descriptor's buffer memory.
#[derive(Debug)]
pub struct BufferPool {
    chunks: [Chunk; POOL_CHUNKS],
    chunk_free: List,
    free_chunks: u16,
    lists: [BufferList; POOL_LISTS],
    list_free: List,
    free_lists: u16,
    rx: List,
    tx: List,
    threshold_chunks: u16,
    threshold_lists: u16,
}

impl BufferPool {
    pub fn new(threshold_chunks: u16, threshold_lists: u16) -> Self {
        let mut pool = Self {
            chunks: core::array::from_fn(|_| Chunk::default()),
            chunk_free: List::new(),
            free_chunks: POOL_CHUNKS as u16,
            lists: core::array::from_fn(|_| BufferList::default()),
            list_free: List::new(),
            free_lists: POOL_LISTS as u16,
            rx: List::new(),
            tx: List::new(),
            threshold_chunks,
            threshold_lists,
        };
        for i in (0..POOL_CHUNKS as u16).rev() {
            pool.chunk_free.push(&mut pool.chunks, i);
        }
        for i in (0..POOL_LISTS as u16).rev() {
            pool.list_free.push(&mut pool.lists, i);
        }
        pool
    }

    /// Free chunk count; the conservation invariant for leak hunting.
    pub fn free_chunk_count(&self) -> u16 {
        self.free_chunks
    }

    pub fn free_list_count(&self) -> u16 {
        self.free_lists
    }

    /// Takes an empty list descriptor.
    pub fn alloc_list(&mut self, flags: BufFlags) -> KResult<ListHandle> {
        if flags.contains(BufFlags::TH)
            && self.free_lists <= self.threshold_lists
        {
            return Err(Error::NetThreshold);
        }
        match self.list_free.pop(&mut self.lists) {
            Some(ix) => {
                self.free_lists -= 1;
                let l = &mut self.lists[usize::from(ix)];
                debug_assert!(l.chunks.is_empty());
                l.total_len = 0;
                Ok(ListHandle(ix))
            }
            None => Err(Error::FsBufferNoSpace),
        }
    }

    /// Returns a list and all its chunks to the free populations.
    pub fn free_list(&mut self, h: ListHandle) {
        while let Some(c) = self.lists[usize::from(h.0)]
            .chunks
            .pop(&mut self.chunks)
        {
            self.release_chunk(c);
        }
        self.lists[usize::from(h.0)].total_len = 0;
        self.list_free.push(&mut self.lists, h.0);
        self.free_lists += 1;
    }

    pub fn total_len(&self, h: ListHandle) -> u32 {
        self.lists[usize::from(h.0)].total_len
    }

    /// Queues an assembled list on `slot`.
    pub fn give(&mut self, slot: Slot, h: ListHandle) {
        match slot {
            Slot::Rx => self.rx.append(&mut self.lists, h.0),
            Slot::Tx => self.tx.append(&mut self.lists, h.0),
        }
    }

    /// Requeues a partially-consumed list at the front of `slot`, so the
    /// remaining bytes stay first in line.
    pub fn give_front(&mut self, slot: Slot, h: ListHandle) {
        match slot {
            Slot::Rx => self.rx.push(&mut self.lists, h.0),
            Slot::Tx => self.tx.push(&mut self.lists, h.0),
        }
    }

    /// Dequeues the oldest list from `slot`.
    pub fn take(&mut self, slot: Slot) -> Option<ListHandle> {
        let l = match slot {
            Slot::Rx => self.rx.pop(&mut self.lists),
            Slot::Tx => self.tx.pop(&mut self.lists),
        };
        l.map(ListHandle)
    }

    pub fn queued(&self, slot: Slot) -> usize {
        match slot {
            Slot::Rx => self.rx.num_items(&self.lists),
            Slot::Tx => self.tx.num_items(&self.lists),
        }
    }

    /// Checks whether `len` more bytes can be pushed without failing,
    /// under the given threshold flags.
    pub fn can_fit(&self, h: ListHandle, len: usize, flags: BufFlags) -> bool {
        let tail_space = match self.lists[usize::from(h.0)]
            .chunks
            .tail()
        {
            Some(t) => {
                let c = &self.chunks[usize::from(t)];
                FS_BUFFER_SIZE - usize::from(c.off) - usize::from(c.len)
            }
            None => 0,
        };
        if len <= tail_space {
            return true;
        }
        let needed = (len - tail_space).div_ceil(FS_BUFFER_SIZE);
        let usable = if flags.contains(BufFlags::TH) {
            usize::from(self.free_chunks.saturating_sub(self.threshold_chunks))
        } else {
            usize::from(self.free_chunks)
        };
        needed <= usable
    }

    /// Appends (or, with `HEAD`, prepends) `bytes` to the list, taking
    /// chunks from the free population as needed. `PACKED` reverses the
    /// span. Fails without rollback; callers that care free the list.
    pub fn push(
        &mut self,
        h: ListHandle,
        bytes: &[u8],
        flags: BufFlags,
    ) -> KResult<()> {
        if flags.contains(BufFlags::UPDATE) {
            return self.push_offset(h, bytes, 0, flags);
        }
        if flags.contains(BufFlags::HEAD) {
            self.push_head(h, bytes, flags)
        } else {
            self.push_tail(h, bytes, flags)
        }
    }

    fn push_tail(
        &mut self,
        h: ListHandle,
        bytes: &[u8],
        flags: BufFlags,
    ) -> KResult<()> {
        let mut written = 0;
        while written < bytes.len() {
            let tail = match self.lists[usize::from(h.0)].chunks.tail() {
                Some(t)
                    if usize::from(self.chunks[usize::from(t)].off)
                        + usize::from(self.chunks[usize::from(t)].len)
                        < FS_BUFFER_SIZE =>
                {
                    t
                }
                _ => {
                    let c = self.obtain_chunk(flags)?;
                    self.chunks[usize::from(c)].off = 0;
                    self.chunks[usize::from(c)].len = 0;
                    self.lists[usize::from(h.0)]
                        .chunks
                        .append(&mut self.chunks, c);
                    c
                }
            };
            let c = &mut self.chunks[usize::from(tail)];
            let at = usize::from(c.off) + usize::from(c.len);
            let n = (FS_BUFFER_SIZE - at).min(bytes.len() - written);
            for k in 0..n {
                c.data[at + k] = src_byte(bytes, written + k, flags);
            }
            c.len += n as u16;
            written += n;
        }
        self.lists[usize::from(h.0)].total_len += bytes.len() as u32;
        Ok(())
    }

    fn push_head(
        &mut self,
        h: ListHandle,
        bytes: &[u8],
        flags: BufFlags,
    ) -> KResult<()> {
        // Fill backwards from the end of the span so the span reads in
        // order once it sits in front of the existing data.
        let mut remaining = bytes.len();
        while remaining > 0 {
            let head = match self.lists[usize::from(h.0)].chunks.head() {
                Some(hd) if self.chunks[usize::from(hd)].off > 0 => hd,
                _ => {
                    let c = self.obtain_chunk(flags)?;
                    self.chunks[usize::from(c)].off = FS_BUFFER_SIZE as u16;
                    self.chunks[usize::from(c)].len = 0;
                    self.lists[usize::from(h.0)]
                        .chunks
                        .push(&mut self.chunks, c);
                    c
                }
            };
            let c = &mut self.chunks[usize::from(head)];
            let n = usize::from(c.off).min(remaining);
            let dst = usize::from(c.off) - n;
            for k in 0..n {
                c.data[dst + k] = src_byte(bytes, remaining - n + k, flags);
            }
            c.off -= n as u16;
            c.len += n as u16;
            remaining -= n;
        }
        self.lists[usize::from(h.0)].total_len += bytes.len() as u32;
        Ok(())
    }

    /// Consumes `len` bytes from the head (or tail with `TAIL`). `out`
    /// receives them if present; `INPLACE` copies without consuming.
    pub fn pull(
        &mut self,
        h: ListHandle,
        out: Option<&mut [u8]>,
        len: usize,
        flags: BufFlags,
    ) -> KResult<()> {
        if self.lists[usize::from(h.0)].total_len < len as u32 {
            return Err(Error::FsBufferNoSpace);
        }
        if flags.contains(BufFlags::INPLACE) {
            return self.pull_offset(
                h,
                out,
                len,
                if flags.contains(BufFlags::TAIL) {
                    (self.lists[usize::from(h.0)].total_len as usize) - len
                } else {
                    0
                },
                flags,
            );
        }
        if flags.contains(BufFlags::TAIL) {
            self.pull_tail(h, out, len, flags)
        } else {
            self.pull_head(h, out, len, flags)
        }
    }

    fn pull_head(
        &mut self,
        h: ListHandle,
        mut out: Option<&mut [u8]>,
        len: usize,
        flags: BufFlags,
    ) -> KResult<()> {
        let mut done = 0;
        while done < len {
            let head = self.lists[usize::from(h.0)]
                .chunks
                .head()
                .ok_or(Error::FsBufferNoSpace)?;
            let c = &mut self.chunks[usize::from(head)];
            let n = usize::from(c.len).min(len - done);
            if let Some(out) = out.as_deref_mut() {
                for k in 0..n {
                    let b = c.data[usize::from(c.off) + k];
                    *dst_byte(out, done + k, len, flags) = b;
                }
            }
            c.off += n as u16;
            c.len -= n as u16;
            done += n;
            if c.len == 0 {
                let popped = self.lists[usize::from(h.0)]
                    .chunks
                    .pop(&mut self.chunks)
                    .unwrap();
                self.release_chunk(popped);
            }
        }
        self.lists[usize::from(h.0)].total_len -= len as u32;
        Ok(())
    }

    fn pull_tail(
        &mut self,
        h: ListHandle,
        mut out: Option<&mut [u8]>,
        len: usize,
        flags: BufFlags,
    ) -> KResult<()> {
        let mut left = len;
        while left > 0 {
            let tail = self.lists[usize::from(h.0)]
                .chunks
                .tail()
                .ok_or(Error::FsBufferNoSpace)?;
            let c = &mut self.chunks[usize::from(tail)];
            let n = usize::from(c.len).min(left);
            let src = usize::from(c.off) + usize::from(c.len) - n;
            if let Some(out) = out.as_deref_mut() {
                for k in 0..n {
                    let b = c.data[src + k];
                    *dst_byte(out, left - n + k, len, flags) = b;
                }
            }
            c.len -= n as u16;
            left -= n;
            if c.len == 0 {
                self.lists[usize::from(h.0)]
                    .chunks
                    .remove(&mut self.chunks, tail);
                self.release_chunk(tail);
            }
        }
        self.lists[usize::from(h.0)].total_len -= len as u32;
        Ok(())
    }

    /// Overwrites `bytes.len()` bytes in place at `offset`. The span must
    /// already exist.
    pub fn push_offset(
        &mut self,
        h: ListHandle,
        bytes: &[u8],
        offset: usize,
        flags: BufFlags,
    ) -> KResult<()> {
        let list = &self.lists[usize::from(h.0)];
        if (offset + bytes.len()) as u32 > list.total_len {
            return Err(Error::FsBufferNoSpace);
        }
        let mut cur = list.chunks.head();
        let mut skip = offset;
        let mut written = 0;
        while written < bytes.len() {
            let cx = cur.ok_or(Error::FsBufferNoSpace)?;
            let clen = usize::from(self.chunks[usize::from(cx)].len);
            if skip >= clen {
                skip -= clen;
                cur = slist::Link::next(&self.chunks[usize::from(cx)]);
                continue;
            }
            let c = &mut self.chunks[usize::from(cx)];
            let at = usize::from(c.off) + skip;
            let n = (clen - skip).min(bytes.len() - written);
            for k in 0..n {
                c.data[at + k] = src_byte(bytes, written + k, flags);
            }
            written += n;
            skip = 0;
            cur = slist::Link::next(&self.chunks[usize::from(cx)]);
        }
        Ok(())
    }

    /// Copies `len` bytes at `offset` without consuming anything.
    pub fn pull_offset(
        &mut self,
        h: ListHandle,
        mut out: Option<&mut [u8]>,
        len: usize,
        offset: usize,
        flags: BufFlags,
    ) -> KResult<()> {
        let list = &self.lists[usize::from(h.0)];
        if (offset + len) as u32 > list.total_len {
            return Err(Error::FsBufferNoSpace);
        }
        let mut cur = list.chunks.head();
        let mut skip = offset;
        let mut done = 0;
        while done < len {
            let cx = cur.ok_or(Error::FsBufferNoSpace)?;
            let c = &self.chunks[usize::from(cx)];
            let clen = usize::from(c.len);
            if skip >= clen {
                skip -= clen;
                cur = slist::Link::next(c);
                continue;
            }
            let n = (clen - skip).min(len - done);
            if let Some(out) = out.as_deref_mut() {
                for k in 0..n {
                    let b = c.data[usize::from(c.off) + skip + k];
                    *dst_byte(out, done + k, len, flags) = b;
                }
            }
            done += n;
            skip = 0;
            cur = slist::Link::next(&self.chunks[usize::from(cx)]);
        }
        Ok(())
    }

    fn obtain_chunk(&mut self, flags: BufFlags) -> KResult<u16> {
        if flags.contains(BufFlags::TH)
            && self.free_chunks <= self.threshold_chunks
        {
            return Err(Error::NetThreshold);
        }
        match self.chunk_free.pop(&mut self.chunks) {
            Some(c) => {
                self.free_chunks -= 1;
                Ok(c)
            }
            None => Err(Error::FsBufferNoSpace),
        }
    }

    fn release_chunk(&mut self, c: u16) {
        let chunk = &mut self.chunks[usize::from(c)];
        chunk.off = 0;
        chunk.len = 0;
        self.chunk_free.push(&mut self.chunks, c);
        self.free_chunks += 1;
    }
}

// Source indexing for pushes: PACKED walks the span back to front.
fn src_byte(bytes: &[u8], i: usize, flags: BufFlags) -> u8 {
    if flags.contains(BufFlags::PACKED) {
        bytes[bytes.len() - 1 - i]
    } else {
        bytes[i]
    }
}

// Destination indexing for pulls: PACKED fills the span back to front.
fn dst_byte(
    out: &mut [u8],
    i: usize,
    span: usize,
    flags: BufFlags,
) -> &mut u8 {
    if flags.contains(BufFlags::PACKED) {
        &mut out[span - 1 - i]
    } else {
        &mut out[i]
    }
}
