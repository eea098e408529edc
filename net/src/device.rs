// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network devices: a buffered descriptor plus link-layer state.

use abi::{Error, KResult};
use kern::arch::Platform;
use kern::fsbuf::{BufFlags, ListHandle};
use kern::{FdFlags, FdIndex, Kernel};
use zerocopy::IntoBytes;

use crate::arp::ArpCache;
use crate::dhcp::DhcpClient;
use crate::wire::{EthAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HDR_LEN};
use crate::worker::{Dispatch, Registration};
use crate::{NetEvent, NetStack, TftpBacking};

/// Names a device within one stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct DevIndex(pub u8);

/// Interface addressing, installed statically or by the DHCP client.
#[derive(Copy, Clone, Debug, Default)]
pub struct Ipv4State {
    pub addr: u32,
    pub mask: u32,
    pub gateway: Option<u32>,
}

pub struct NetDevice {
    pub(crate) fd: FdIndex,
    pub(crate) mac: EthAddr,
    pub(crate) link_up: bool,
    pub(crate) ip: Option<Ipv4State>,
    pub(crate) arp: ArpCache,
    pub(crate) dhcp: Option<DhcpClient>,
}

impl NetDevice {
    pub fn mac(&self) -> EthAddr {
        self.mac
    }

    pub fn address(&self) -> Option<Ipv4State> {
        self.ip
    }
}

impl<B: TftpBacking> NetStack<B> {
    /// Attaches a buffered descriptor as a network interface and registers
    /// its receive condition and ARP timer with the worker.
    pub fn add_device<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        fd: FdIndex,
        mac: EthAddr,
    ) -> KResult<DevIndex> {
        assert!(kernel.fd_flags(fd).contains(FdFlags::BUFFERED));
        if self.devices.is_full() {
            return Err(Error::FsNoResource);
        }
        let ix = DevIndex(self.devices.len() as u8);
        self.devices
            .push(NetDevice {
                fd,
                mac,
                link_up: true,
                ip: None,
                arp: ArpCache::new(),
                dhcp: None,
            })
            .ok()
            .unwrap();
        let rx_cond = kernel.fd_read_cond(fd);
        self.register(Registration::new(rx_cond, Dispatch::DeviceRx(ix)));
        let arp_cond =
            kernel.create_condition(kern::CondKind::Explicit, false);
        self.register(Registration::new(arp_cond, Dispatch::ArpTimer(ix)));
        Ok(ix)
    }

    /// Installs interface addressing by hand (no DHCP).
    pub fn set_address(
        &mut self,
        dev: DevIndex,
        addr: u32,
        mask: u32,
        gateway: Option<u32>,
    ) {
        self.devices[usize::from(dev.0)].ip = Some(Ipv4State {
            addr,
            mask,
            gateway,
        });
    }

    /// Administrative link control. Taking the link down fails senders
    /// with `NetLinkDown` until it comes back.
    pub fn set_link(&mut self, dev: DevIndex, up: bool) {
        self.devices[usize::from(dev.0)].link_up = up;
    }

    pub fn device(&self, dev: DevIndex) -> &NetDevice {
        &self.devices[usize::from(dev.0)]
    }

    pub fn device_fd(&self, dev: DevIndex) -> FdIndex {
        self.devices[usize::from(dev.0)].fd
    }

    /// Prepends the Ethernet header and hands the frame to the device.
    pub(crate) fn eth_transmit<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dev: DevIndex,
        dst: EthAddr,
        ethertype: u16,
        h: ListHandle,
    ) -> KResult<()> {
        let d = &self.devices[usize::from(dev.0)];
        if !d.link_up {
            kernel.fd_buffer_release(d.fd, h);
            return Err(Error::NetLinkDown);
        }
        let fd = d.fd;
        let src = d.mac;
        let pool = kernel.fd_pool_mut(fd);
        // Header fields go on front to back, so prepend them in reverse.
        pool.push(h, &ethertype.to_le_bytes(), BufFlags::PACKED | BufFlags::HEAD)?;
        pool.push(h, src.as_bytes(), BufFlags::HEAD)?;
        pool.push(h, dst.as_bytes(), BufFlags::HEAD)?;
        match kernel.fd_write_buffer(fd, h) {
            // A full far side is the wire's problem, not the sender's.
            Err(Error::NetThreshold) => {
                ringbuf::ring_entry!(self.ring, NetEvent::DropThreshold(dev.0));
                Ok(())
            }
            r => r,
        }
    }

    /// One received frame: strip the Ethernet header and dispatch on
    /// ethertype. Consumes `h` one way or another.
    pub(crate) fn eth_receive<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dev: DevIndex,
        h: ListHandle,
    ) {
        let fd = self.devices[usize::from(dev.0)].fd;
        ringbuf::ring_entry!(self.ring, NetEvent::RxFrame(dev.0));

        let pool = kernel.fd_pool_mut(fd);
        if pool.total_len(h) < ETH_HDR_LEN as u32 {
            ringbuf::ring_entry!(self.ring, NetEvent::DropBadHeader(dev.0));
            kernel.fd_buffer_release(fd, h);
            return;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        let mut ethertype = [0u8; 2];
        let r = kern::hdr::parse(
            pool,
            h,
            &mut [
                kern::hdr::HdrPull {
                    out: &mut dst,
                    flags: BufFlags::empty(),
                },
                kern::hdr::HdrPull {
                    out: &mut src,
                    flags: BufFlags::empty(),
                },
                kern::hdr::HdrPull {
                    out: &mut ethertype,
                    flags: BufFlags::PACKED,
                },
            ],
        );
        if r.is_err() {
            ringbuf::ring_entry!(self.ring, NetEvent::DropBadHeader(dev.0));
            kernel.fd_buffer_release(fd, h);
            return;
        }
        let dst = EthAddr(dst);
        let mac = self.devices[usize::from(dev.0)].mac;
        if dst != mac && !dst.is_broadcast() {
            kernel.fd_buffer_release(fd, h);
            return;
        }

        let status = match u16::from_le_bytes(ethertype) {
            ETHERTYPE_ARP => crate::arp::receive(self, kernel, dev, h),
            ETHERTYPE_IPV4 => crate::ipv4::receive(self, kernel, dev, h),
            _ => {
                kernel.fd_buffer_release(fd, h);
                Ok(())
            }
        };
        match status {
            Ok(()) | Err(Error::NetBufferConsumed) => {}
            Err(e) => {
                ringbuf::ring_entry!(
                    self.ring,
                    NetEvent::HandlerError(e.code())
                );
            }
        }
    }
}
