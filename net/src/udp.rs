// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP: the port registry and datagram demultiplexer.
//!
//! Ports are owned either by an application socket (datagrams queue and a
//! condition wakes the reader), or by one of the in-stack clients — the
//! DHCP client and the TFTP server — whose handlers run right in the
//! worker. Transmit checksums are left at zero, which RFC 768 permits;
//! integrity of the header path is covered by the IPv4 header checksum.

use abi::{Error, KResult};
use heapless::Deque;
use kern::arch::Platform;
use kern::condition::{CondIndex, CondKind, WaitSpec};
use kern::fsbuf::{BufFlags, ListHandle};
use kern::Kernel;

use crate::device::DevIndex;
use crate::{NetEvent, NetStack, TftpBacking, MAX_UDP_PORTS};

/// Datagrams that may queue on one application port.
pub const UDP_PORT_QUEUE: usize = 4;

pub const UDP_HDR_LEN: usize = 8;

/// An application's handle on a bound port.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct UdpSocket(pub u16);

/// A received datagram, still sitting in its device's pool.
#[derive(Copy, Clone, Debug)]
pub struct UdpDatagram {
    pub dev: DevIndex,
    pub h: ListHandle,
    pub src_ip: u32,
    pub src_port: u16,
}

pub(crate) enum PortOwner {
    App {
        cond: CondIndex,
        queue: Deque<UdpDatagram, UDP_PORT_QUEUE>,
    },
    Dhcp(DevIndex),
    Tftp,
}

pub(crate) struct UdpPort {
    pub(crate) port: u16,
    pub(crate) owner: PortOwner,
}

impl<B: TftpBacking> NetStack<B> {
    /// Binds `port` for an application. Received datagrams queue; readers
    /// block on the socket's condition.
    pub fn udp_bind<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        port: u16,
    ) -> KResult<UdpSocket> {
        let cond = kernel.create_condition(CondKind::Explicit, false);
        let ix = self.bind_port(
            port,
            PortOwner::App {
                cond,
                queue: Deque::new(),
            },
        )?;
        Ok(UdpSocket(ix))
    }

    pub(crate) fn bind_port(
        &mut self,
        port: u16,
        owner: PortOwner,
    ) -> KResult<u16> {
        if self.ports.iter().any(|p| p.port == port) {
            return Err(Error::FsNoResource);
        }
        if self.ports.len() == MAX_UDP_PORTS {
            return Err(Error::FsNoResource);
        }
        let ix = self.ports.len() as u16;
        self.ports.push(UdpPort { port, owner }).ok().unwrap();
        Ok(ix)
    }

    /// Receives one datagram into `buf`, blocking on the socket condition
    /// until one arrives. Returns the byte count and the sender.
    pub fn udp_recv_from<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        sock: UdpSocket,
        buf: &mut [u8],
    ) -> KResult<(usize, u32, u16)> {
        loop {
            let (cond, dg) = {
                let PortOwner::App { cond, queue } =
                    &mut self.ports[usize::from(sock.0)].owner
                else {
                    panic!("socket on a port the stack owns");
                };
                (*cond, queue.pop_front())
            };
            if let Some(dg) = dg {
                let fd = self.devices[usize::from(dg.dev.0)].fd;
                let pool = kernel.fd_pool_mut(fd);
                let n = (pool.total_len(dg.h) as usize).min(buf.len());
                pool.pull(dg.h, Some(&mut buf[..n]), n, BufFlags::empty())?;
                kernel.fd_buffer_release(fd, dg.h);
                return Ok((n, dg.src_ip, dg.src_port));
            }
            kernel.suspend_on(cond, WaitSpec::default())?;
        }
    }

    /// Sends `payload` from `src_port` to `dst_ip:dst_port` through
    /// `dev`.
    pub fn udp_send<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dev: DevIndex,
        src_port: u16,
        dst_ip: u32,
        dst_port: u16,
        payload: &[u8],
    ) -> KResult<()> {
        let fd = self.devices[usize::from(dev.0)].fd;
        let pool = kernel.fd_pool_mut(fd);
        let h = pool.alloc_list(BufFlags::empty())?;
        if let Err(e) = pool.push(h, payload, BufFlags::empty()) {
            pool.free_list(h);
            return Err(e);
        }
        self.udp_send_list(kernel, dev, src_port, dst_ip, dst_port, h)
    }

    /// Sends an already-built payload list. Consumes `h` on every path.
    pub(crate) fn udp_send_list<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dev: DevIndex,
        src_port: u16,
        dst_ip: u32,
        dst_port: u16,
        h: ListHandle,
    ) -> KResult<()> {
        let src_ip = self
            .devices[usize::from(dev.0)]
            .ip
            .map(|i| i.addr)
            .unwrap_or(0);
        let fd = self.devices[usize::from(dev.0)].fd;
        let pool = kernel.fd_pool_mut(fd);
        let len = UDP_HDR_LEN + pool.total_len(h) as usize;
        let mut header = [0u8; UDP_HDR_LEN];
        header[0..2].copy_from_slice(&src_port.to_be_bytes());
        header[2..4].copy_from_slice(&dst_port.to_be_bytes());
        header[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        // Checksum 0: not supplied.
        if let Err(e) = pool.push(h, &header, BufFlags::HEAD) {
            pool.free_list(h);
            return Err(e);
        }
        crate::ipv4::send(
            self,
            kernel,
            dev,
            src_ip,
            dst_ip,
            crate::ipv4::PROTO_UDP,
            h,
        )
    }

    /// Closes an application socket, dropping anything still queued.
    pub fn udp_close<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        sock: UdpSocket,
    ) {
        let ix = usize::from(sock.0);
        if let PortOwner::App { queue, .. } = &mut self.ports[ix].owner {
            let mut drained: Deque<UdpDatagram, UDP_PORT_QUEUE> = Deque::new();
            core::mem::swap(queue, &mut drained);
            while let Some(dg) = drained.pop_front() {
                let fd = self.devices[usize::from(dg.dev.0)].fd;
                kernel.fd_buffer_release(fd, dg.h);
            }
            self.ports[ix].port = 0;
        }
    }
}

/// Demultiplexes one datagram whose IPv4 header is already consumed.
pub(crate) fn receive<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    h: ListHandle,
    src_ip: u32,
    _dst_ip: u32,
) -> KResult<()> {
    let fd = stack.devices[usize::from(dev.0)].fd;
    let mut header = [0u8; UDP_HDR_LEN];
    let pool = kernel.fd_pool_mut(fd);
    if pool
        .pull(h, Some(&mut header), UDP_HDR_LEN, BufFlags::empty())
        .is_err()
    {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    let src_port = u16::from_be_bytes([header[0], header[1]]);
    let dst_port = u16::from_be_bytes([header[2], header[3]]);
    let udp_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if udp_len < UDP_HDR_LEN
        || (udp_len - UDP_HDR_LEN) as u32 > pool.total_len(h)
    {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }

    let Some(ix) = stack.ports.iter().position(|p| p.port == dst_port)
    else {
        ringbuf::ring_entry!(stack.ring, NetEvent::UdpUnreachable(dst_port));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetDstPortUnreachable);
    };

    ringbuf::ring_entry!(stack.ring, NetEvent::UdpDelivered(dst_port));
    match &mut stack.ports[ix].owner {
        PortOwner::App { cond, queue } => {
            let cond = *cond;
            let dg = UdpDatagram {
                dev,
                h,
                src_ip,
                src_port,
            };
            if queue.push_back(dg).is_err() {
                kernel.fd_buffer_release(fd, h);
                return Err(Error::NetThreshold);
            }
            kernel.condition_ping(cond);
            Ok(())
        }
        PortOwner::Dhcp(d) => {
            let d = *d;
            crate::dhcp::receive(stack, kernel, d, h)
        }
        PortOwner::Tftp => {
            crate::tftp::receive(stack, kernel, dev, h, src_ip, src_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use kern::arch::fake;

    #[test]
    fn bound_port_receives_datagram() {
        let mut rig = rig();
        let sock = rig.stack.udp_bind(&mut rig.k, 7000).unwrap();
        inject(
            &mut rig,
            &udp_frame(PEER_IP, DEV_IP, 5555, 7000, b"hello udp"),
        );
        deliver_pending(&mut rig);
        let mut buf = [0u8; 64];
        let (n, src_ip, src_port) = rig
            .stack
            .udp_recv_from(&mut rig.k, sock, &mut buf)
            .unwrap();
        assert_eq!(&buf[..n], b"hello udp");
        assert_eq!(src_ip, PEER_IP);
        assert_eq!(src_port, 5555);
    }

    #[test]
    fn unbound_port_is_unreachable() {
        let mut rig = rig();
        inject(
            &mut rig,
            &udp_frame(PEER_IP, DEV_IP, 5555, 4242, b"nobody home"),
        );
        deliver_pending(&mut rig);
        assert_eq!(
            rig.stack.ring().last_entry().unwrap().payload,
            crate::NetEvent::UdpUnreachable(4242),
        );
    }

    #[test]
    fn bad_ip_checksum_is_dropped() {
        let mut rig = rig();
        rig.stack.udp_bind(&mut rig.k, 7000).unwrap();
        let mut f = udp_frame(PEER_IP, DEV_IP, 5555, 7000, b"x");
        f[24] ^= 0x40; // corrupt the IP header after the checksum was set
        inject(&mut rig, &f);
        deliver_pending(&mut rig);
        assert_eq!(
            rig.stack.ring().last_entry().unwrap().payload,
            crate::NetEvent::DropBadChecksum(0),
        );
    }

    #[test]
    fn recv_returns_timeout_error_when_resumed_with_one() {
        let mut rig = rig();
        let sock = rig.stack.udp_bind(&mut rig.k, 9000).unwrap();
        // Nothing queued: the reader parks; tear the wait down by resuming
        // the socket condition with an error, the cancellation idiom.
        let cond = match &rig.stack.ports[usize::from(sock.0)].owner {
            PortOwner::App { cond, .. } => *cond,
            _ => unreachable!(),
        };
        fake::on_park(move |k| {
            k.resume_condition(
                cond,
                kern::Resume {
                    status: Some(abi::Error::ConditionDeleted),
                    matcher: kern::ResumeMatch::All,
                },
                false,
            );
        });
        let mut buf = [0u8; 16];
        let r = rig.stack.udp_recv_from(&mut rig.k, sock, &mut buf);
        assert_eq!(r, Err(abi::Error::ConditionDeleted));
    }

    #[test]
    fn send_resolves_then_delivers() {
        let mut rig = rig();
        // First send coalesces behind ARP.
        let r = rig.stack.udp_send(
            &mut rig.k,
            rig.dev,
            8000,
            PEER_IP,
            8001,
            b"payload",
        );
        assert_eq!(r, Err(abi::Error::NetBufferConsumed));
        let _arp_request = transmitted(&mut rig).unwrap();
        let reply = arp_frame(2, PEER_MAC, PEER_IP, DEV_MAC, DEV_IP);
        inject(&mut rig, &reply);
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("datagram not flushed");
        // Ethernet + IP + UDP + payload.
        assert_eq!(&f[0..6], &PEER_MAC.0);
        assert_eq!(f[23], crate::ipv4::PROTO_UDP);
        let udp = &f[34..];
        assert_eq!(&udp[0..2], &8000u16.to_be_bytes());
        assert_eq!(&udp[2..4], &8001u16.to_be_bytes());
        assert_eq!(&udp[8..], b"payload");
    }
}
