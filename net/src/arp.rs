// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address resolution.
//!
//! Each device carries a small fixed cache. Outbound IPv4 traffic for an
//! unresolved neighbor queues on its entry — many packets, one entry, one
//! request on the wire — and the whole queue drains in order the moment
//! the reply lands. Unanswered entries retry on the worker's timer up to
//! the configured ceiling and then die, dropping their queue. Resolved
//! entries that are still in use get refreshed ahead of expiry; idle ones
//! age out.
//!
//! A retry is only counted when the request actually reached the device;
//! a transmit failure leaves the budget alone so backpressure cannot
//! starve a neighbor that would have answered.

use abi::{Error, KResult, Tick};
use bitflags::bitflags;
use heapless::Deque;
use kern::arch::Platform;
use kern::fsbuf::{BufFlags, ListHandle};
use kern::hdr::{HdrPull, HdrPush};
use kern::Kernel;
use zerocopy::IntoBytes;

use crate::device::DevIndex;
use crate::wire::{EthAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4, IP_BROADCAST};
use crate::{NetEvent, NetStack, TftpBacking};

/// Cache entries per device.
pub const ARP_ENTRIES: usize = 4;
/// Packets that may wait on one unresolved entry.
pub const ARP_QUEUE_DEPTH: usize = 4;

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct ArpFlags: u8 {
        /// Entry holds a neighbor address.
        const VALID = 1 << 0;
        /// Resolution completed; `mac` is usable.
        const UP = 1 << 1;
        /// Something sent through this entry since the last refresh.
        const IN_USE = 1 << 2;
    }
}

#[derive(Debug, Default)]
pub struct ArpEntry {
    ip: u32,
    mac: EthAddr,
    flags: ArpFlags,
    retry: u8,
    next_event: Tick,
    queued: Deque<ListHandle, ARP_QUEUE_DEPTH>,
}

#[derive(Debug, Default)]
pub struct ArpCache {
    entries: [ArpEntry; ARP_ENTRIES],
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest pending timed event across the cache.
    pub fn next_event(&self) -> Option<Tick> {
        self.entries
            .iter()
            .filter(|e| e.flags.contains(ArpFlags::VALID))
            .map(|e| e.next_event)
            .reduce(|a, b| if a.since(b) > 0 { b } else { a })
    }

    /// Resolved address for `ip`, if present.
    pub fn lookup(&self, ip: u32) -> Option<EthAddr> {
        self.entries
            .iter()
            .find(|e| {
                e.flags.contains(ArpFlags::VALID | ArpFlags::UP) && e.ip == ip
            })
            .map(|e| e.mac)
    }

    fn find(&mut self, ip: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.flags.contains(ArpFlags::VALID) && e.ip == ip)
    }

    fn allocate(&mut self, ip: u32, now: Tick) -> Option<usize> {
        let slot = self.entries.iter().position(|e| {
            !e.flags.contains(ArpFlags::VALID)
                || !e.flags.contains(ArpFlags::IN_USE)
        })?;
        let e = &mut self.entries[slot];
        e.queued.clear();
        e.ip = ip;
        e.mac = EthAddr::default();
        e.flags = ArpFlags::VALID | ArpFlags::IN_USE;
        e.retry = 0;
        e.next_event = now;
        Some(slot)
    }
}

/// Sends an IPv4 frame to `dst_ip` on `dev`, resolving the neighbor as
/// needed. Consumes `h` on every path: transmitted, queued on an entry
/// (`NetBufferConsumed` — not a failure), or freed on error.
pub(crate) fn transmit_ipv4<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    dst_ip: u32,
    h: ListHandle,
) -> KResult<()> {
    if dst_ip == IP_BROADCAST {
        return stack.eth_transmit(
            kernel,
            dev,
            EthAddr::BROADCAST,
            ETHERTYPE_IPV4,
            h,
        );
    }

    let now = kernel.now();
    let d = &mut stack.devices[usize::from(dev.0)];
    if let Some(mac) = d.arp.lookup(dst_ip) {
        if let Some(ix) = d.arp.find(dst_ip) {
            d.arp.entries[ix].flags |= ArpFlags::IN_USE;
        }
        return stack.eth_transmit(kernel, dev, mac, ETHERTYPE_IPV4, h);
    }

    // Unresolved: queue behind the entry and make sure a request is out.
    let (slot, fresh) = match d.arp.find(dst_ip) {
        Some(ix) => (ix, false),
        None => match d.arp.allocate(dst_ip, now) {
            Some(ix) => (ix, true),
            None => {
                let fd = d.fd;
                kernel.fd_buffer_release(fd, h);
                return Err(Error::NetDstUnreachable);
            }
        },
    };
    let entry = &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
    if entry.queued.push_back(h).is_err() {
        let fd = stack.devices[usize::from(dev.0)].fd;
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetThreshold);
    }
    ringbuf::ring_entry!(stack.ring, NetEvent::ArpQueued(dst_ip));

    if fresh {
        let timeout = stack.arp_cfg.timeout;
        if send_request(stack, kernel, dev, dst_ip).is_ok() {
            let e = &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
            e.retry = 1;
            e.next_event = now.offset(timeout);
        }
    }
    Err(Error::NetBufferConsumed)
}

/// Handles a received ARP frame (Ethernet header already stripped).
pub(crate) fn receive<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    h: ListHandle,
) -> KResult<()> {
    let fd = stack.devices[usize::from(dev.0)].fd;
    let mut htype = [0u8; 2];
    let mut ptype = [0u8; 2];
    let mut sizes = [0u8; 2];
    let mut op = [0u8; 2];
    let mut sha = [0u8; 6];
    let mut spa = [0u8; 4];
    let mut tha = [0u8; 6];
    let mut tpa = [0u8; 4];
    let r = kern::hdr::parse(
        kernel.fd_pool_mut(fd),
        h,
        &mut [
            HdrPull { out: &mut htype, flags: BufFlags::PACKED },
            HdrPull { out: &mut ptype, flags: BufFlags::PACKED },
            HdrPull { out: &mut sizes, flags: BufFlags::empty() },
            HdrPull { out: &mut op, flags: BufFlags::PACKED },
            HdrPull { out: &mut sha, flags: BufFlags::empty() },
            HdrPull { out: &mut spa, flags: BufFlags::PACKED },
            HdrPull { out: &mut tha, flags: BufFlags::empty() },
            HdrPull { out: &mut tpa, flags: BufFlags::PACKED },
        ],
    );
    kernel.fd_buffer_release(fd, h);
    r.map_err(|_| Error::NetInvalidHeader)?;

    if u16::from_le_bytes(htype) != 1
        || u16::from_le_bytes(ptype) != ETHERTYPE_IPV4
        || sizes != [6, 4]
    {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        return Err(Error::NetInvalidHeader);
    }
    let sha = EthAddr(sha);
    let spa = u32::from_le_bytes(spa);
    let tpa = u32::from_le_bytes(tpa);
    let our_ip = match stack.devices[usize::from(dev.0)].ip {
        Some(ip) => ip.addr,
        None => return Ok(()),
    };

    match u16::from_le_bytes(op) {
        OP_REQUEST if tpa == our_ip => {
            send_packet(stack, kernel, dev, OP_REPLY, sha, sha, spa)
        }
        OP_REPLY if tpa == our_ip => {
            resolved(stack, kernel, dev, spa, sha);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The worker's timed pass over one device's cache.
pub(crate) fn timer<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
) {
    let now = kernel.now();
    let retry_ceiling = stack.arp_cfg.retry_count;
    let timeout = stack.arp_cfg.timeout;
    let update_time = stack.arp_cfg.update_time;

    for slot in 0..ARP_ENTRIES {
        let (ip, flags, retry, due) = {
            let e = &stack.devices[usize::from(dev.0)].arp.entries[slot];
            (e.ip, e.flags, e.retry, now.reached(e.next_event))
        };
        if !flags.contains(ArpFlags::VALID) || !due {
            continue;
        }

        if !flags.contains(ArpFlags::UP) {
            if retry >= retry_ceiling {
                // Neighbor never answered; drop it, queue and all.
                let fd = stack.devices[usize::from(dev.0)].fd;
                let e =
                    &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
                let mut dead = Deque::new();
                core::mem::swap(&mut e.queued, &mut dead);
                e.flags = ArpFlags::empty();
                while let Some(q) = dead.pop_front() {
                    kernel.fd_buffer_release(fd, q);
                }
                ringbuf::ring_entry!(stack.ring, NetEvent::ArpEntryDead(ip));
            } else if send_request(stack, kernel, dev, ip).is_ok() {
                let e =
                    &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
                e.retry += 1;
                e.next_event = now.offset(timeout);
            }
        } else if flags.contains(ArpFlags::IN_USE) {
            // Refresh an entry that is earning its keep; if nothing uses
            // it before the next pass it ages out instead.
            let _ = send_request(stack, kernel, dev, ip);
            let e = &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
            e.flags &= !ArpFlags::IN_USE;
            e.next_event = now.offset(update_time);
        } else {
            let e = &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
            e.flags = ArpFlags::empty();
            ringbuf::ring_entry!(stack.ring, NetEvent::ArpEntryDead(ip));
        }
    }
}

fn resolved<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    ip: u32,
    mac: EthAddr,
) {
    let update_time = stack.arp_cfg.update_time;
    let now = kernel.now();
    let Some(slot) = stack.devices[usize::from(dev.0)].arp.find(ip) else {
        return;
    };
    let e = &mut stack.devices[usize::from(dev.0)].arp.entries[slot];
    e.mac = mac;
    e.flags |= ArpFlags::UP;
    e.retry = 0;
    e.next_event = now.offset(update_time);
    let mut pending = Deque::new();
    core::mem::swap(&mut e.queued, &mut pending);
    ringbuf::ring_entry!(stack.ring, NetEvent::ArpResolved(ip));

    // Everything that was waiting goes out now, oldest first.
    while let Some(q) = pending.pop_front() {
        let _ = stack.eth_transmit(kernel, dev, mac, ETHERTYPE_IPV4, q);
    }
}

fn send_request<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    target_ip: u32,
) -> KResult<()> {
    ringbuf::ring_entry!(stack.ring, NetEvent::ArpRequest(target_ip));
    send_packet(
        stack,
        kernel,
        dev,
        OP_REQUEST,
        EthAddr::BROADCAST,
        EthAddr::default(),
        target_ip,
    )
}

// Builds and transmits one ARP packet. `eth_dst` addresses the frame;
// `tha` fills the target-hardware field.
fn send_packet<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    op: u16,
    eth_dst: EthAddr,
    tha: EthAddr,
    tpa: u32,
) -> KResult<()> {
    let d = &stack.devices[usize::from(dev.0)];
    let fd = d.fd;
    let our_mac = d.mac;
    let our_ip = d.ip.map(|ip| ip.addr).unwrap_or(0);

    let pool = kernel.fd_pool_mut(fd);
    let h = pool.alloc_list(BufFlags::TH)?;
    let r = kern::hdr::generate(
        pool,
        h,
        &[
            HdrPush { bytes: &1u16.to_le_bytes(), flags: BufFlags::PACKED },
            HdrPush {
                bytes: &ETHERTYPE_IPV4.to_le_bytes(),
                flags: BufFlags::PACKED,
            },
            HdrPush { bytes: &[6, 4], flags: BufFlags::empty() },
            HdrPush { bytes: &op.to_le_bytes(), flags: BufFlags::PACKED },
            HdrPush { bytes: our_mac.as_bytes(), flags: BufFlags::empty() },
            HdrPush { bytes: &our_ip.to_le_bytes(), flags: BufFlags::PACKED },
            HdrPush { bytes: tha.as_bytes(), flags: BufFlags::empty() },
            HdrPush { bytes: &tpa.to_le_bytes(), flags: BufFlags::PACKED },
        ],
    );
    if r.is_err() {
        kernel.fd_pool_mut(fd).free_list(h);
        return r;
    }
    stack.eth_transmit(kernel, dev, eth_dst, ETHERTYPE_ARP, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use kern::fsbuf::POOL_CHUNKS;

    fn queue_udp_payload(rig: &mut Rig, marker: u8) -> KResult<()> {
        let fd = rig.stack.device_fd(rig.dev);
        let h = rig
            .k
            .fd_pool_mut(fd)
            .alloc_list(BufFlags::empty())
            .unwrap();
        rig.k
            .fd_pool_mut(fd)
            .push(h, &[marker; 8], BufFlags::empty())
            .unwrap();
        transmit_ipv4(&mut rig.stack, &mut rig.k, rig.dev, PEER_IP, h)
    }

    #[test]
    fn request_goes_out_for_unresolved_neighbor() {
        let mut rig = rig();
        assert_eq!(
            queue_udp_payload(&mut rig, 1),
            Err(Error::NetBufferConsumed)
        );
        let frame = transmitted(&mut rig).expect("no ARP request sent");
        // Broadcast destination, ARP ethertype, opcode 1.
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(&frame[12..14], &ETHERTYPE_ARP.to_be_bytes());
        assert_eq!(&frame[20..22], &OP_REQUEST.to_be_bytes());
        // Target IP is the peer.
        assert_eq!(&frame[38..42], &PEER_IP.to_be_bytes());
    }

    #[test]
    fn queued_packets_flush_in_order_on_reply() {
        let mut rig = rig();
        for marker in 1..=3u8 {
            assert_eq!(
                queue_udp_payload(&mut rig, marker),
                Err(Error::NetBufferConsumed)
            );
        }
        // One coalesced request on the wire, nothing else.
        assert!(transmitted(&mut rig).is_some());
        assert!(transmitted(&mut rig).is_none());

        let reply = arp_frame(OP_REPLY, PEER_MAC, PEER_IP, DEV_MAC, DEV_IP);
        inject(&mut rig, &reply);
        deliver_pending(&mut rig);

        for marker in 1..=3u8 {
            let f = transmitted(&mut rig).expect("queued frame not flushed");
            assert_eq!(&f[0..6], &PEER_MAC.0);
            assert_eq!(f[14], marker);
        }

        // Resolution complete: a fourth packet bypasses the queue.
        assert_eq!(queue_udp_payload(&mut rig, 4), Ok(()));
        let f = transmitted(&mut rig).unwrap();
        assert_eq!(f[14], 4);
    }

    #[test]
    fn request_for_our_ip_gets_a_reply() {
        let mut rig = rig();
        let req = arp_frame(
            OP_REQUEST,
            PEER_MAC,
            PEER_IP,
            EthAddr::default(),
            DEV_IP,
        );
        inject(&mut rig, &req);
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("no ARP reply");
        assert_eq!(&f[0..6], &PEER_MAC.0);
        assert_eq!(&f[20..22], &OP_REPLY.to_be_bytes());
        // Sender fields are ours.
        assert_eq!(&f[22..28], &DEV_MAC.0);
        assert_eq!(&f[28..32], &DEV_IP.to_be_bytes());
    }

    #[test]
    fn retries_then_gives_up_and_frees_the_queue() {
        let mut rig = rig();
        let retry_count = rig.stack.arp_cfg.retry_count;
        let timeout = rig.stack.arp_cfg.timeout;
        assert_eq!(
            queue_udp_payload(&mut rig, 9),
            Err(Error::NetBufferConsumed)
        );
        let _ = transmitted(&mut rig); // initial request

        for i in 1..retry_count {
            let now = rig.k.now().offset(timeout);
            rig.k.tick(now);
            timer(&mut rig.stack, &mut rig.k, rig.dev);
            assert!(
                transmitted(&mut rig).is_some(),
                "retry {i} not transmitted"
            );
        }
        // Budget exhausted: the next pass kills the entry.
        let now = rig.k.now().offset(timeout);
        rig.k.tick(now);
        timer(&mut rig.stack, &mut rig.k, rig.dev);
        assert!(transmitted(&mut rig).is_none());
        let fd = rig.stack.device_fd(rig.dev);
        assert_eq!(
            rig.k.fd_pool(fd).free_chunk_count(),
            POOL_CHUNKS as u16
        );
        assert_eq!(
            rig.stack.device(rig.dev).arp.next_event(),
            None
        );
    }
}
