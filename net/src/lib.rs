// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kestrel network stack.
//!
//! One worker task owns everything here. It parks in a single
//! `suspend_condition` call over the full set of registrations — device
//! receive conditions plus the ARP, DHCP, and TFTP timers — and whichever
//! registration fires gets dispatched. Protocol handlers therefore never
//! race each other and never block: anything that cannot make progress
//! queues a buffer or arms a timer and returns.
//!
//! Frames move as buffer lists inside each device descriptor's pool; the
//! protocol layers touch them only through the header-table codec. A list
//! handed downward may be consumed (queued on an unresolved ARP entry, for
//! instance); that surfaces as `NetBufferConsumed`, which is a transfer of
//! ownership and not a failure.

#![cfg_attr(target_os = "none", no_std)]

pub mod arp;
pub mod device;
pub mod dhcp;
pub mod ipv4;
pub mod tftp;
pub mod udp;
pub mod wire;
pub mod worker;

use abi::{ArpConfig, DhcpConfig, TftpConfig};
use ringbuf::Ringbuf;

pub use crate::device::{DevIndex, NetDevice};
pub use crate::tftp::TftpBacking;
pub use crate::worker::Registration;

/// Network interfaces a stack can carry.
pub const MAX_DEVICES: usize = 2;
/// Bound UDP ports, across all owners.
pub const MAX_UDP_PORTS: usize = 8;
/// Worker registrations; bounded by the kernel's multi-wait width.
pub const MAX_REGISTRATIONS: usize = kern::MAX_WAIT_CONDS;

/// Events recorded in the stack's debug ring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum NetEvent {
    None,
    RxFrame(u8),
    DropBadHeader(u8),
    DropBadChecksum(u8),
    DropThreshold(u8),
    ArpRequest(u32),
    ArpResolved(u32),
    ArpQueued(u32),
    ArpEntryDead(u32),
    UdpDelivered(u16),
    UdpUnreachable(u16),
    NoRoute(u32),
    DhcpState(u8),
    DhcpBound(u32),
    TftpOpcode(u16),
    TftpDone,
    TftpError(i32),
    HandlerError(i32),
}

/// The stack: devices, port registry, protocol engines, and the worker's
/// registration table. `B` is the TFTP server's storage backing.
pub struct NetStack<B: TftpBacking> {
    pub(crate) devices: heapless::Vec<device::NetDevice, MAX_DEVICES>,
    pub(crate) ports: heapless::Vec<udp::UdpPort, MAX_UDP_PORTS>,
    pub(crate) registrations:
        heapless::Vec<worker::Registration, MAX_REGISTRATIONS>,
    pub(crate) tftp: Option<tftp::TftpServer<B>>,
    pub(crate) arp_cfg: ArpConfig,
    pub(crate) dhcp_cfg: DhcpConfig,
    pub(crate) tftp_cfg: TftpConfig,
    pub(crate) ring: Ringbuf<NetEvent, 32>,
}

impl<B: TftpBacking> NetStack<B> {
    pub fn new(
        arp_cfg: ArpConfig,
        dhcp_cfg: DhcpConfig,
        tftp_cfg: TftpConfig,
    ) -> Self {
        Self {
            devices: heapless::Vec::new(),
            ports: heapless::Vec::new(),
            registrations: heapless::Vec::new(),
            tftp: None,
            arp_cfg,
            dhcp_cfg,
            tftp_cfg,
            ring: Ringbuf::new(NetEvent::None),
        }
    }

    /// Most recent debug events, for tests and the debugger.
    pub fn ring(&self) -> &Ringbuf<NetEvent, 32> {
        &self.ring
    }
}
