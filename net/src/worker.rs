// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The network worker loop.
//!
//! One task services the whole stack. Its registration table pairs a
//! condition with a dispatch target; every trip through [`NetStack::poll`]
//! refreshes the timer deadlines from the protocol engines, parks on the
//! full set, and dispatches whichever entry ended the wait. A timeout is
//! dispatched too — that is how the ARP retry clock, the DHCP retransmit
//! clock, and the TFTP transaction clock tick.
//!
//! Handlers run with nothing held and must not block; they queue work and
//! arm deadlines instead.

use abi::{Error, Priority, Tick};
use kern::arch::Platform;
use kern::condition::{CondIndex, WaitSpec};
use kern::Kernel;

use crate::device::DevIndex;
use crate::{NetStack, TftpBacking, MAX_REGISTRATIONS};

/// Where a fired registration goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Frames have arrived on a device.
    DeviceRx(DevIndex),
    /// The device's ARP cache wants its next timed look.
    ArpTimer(DevIndex),
    /// The device's DHCP client wants its next timed event.
    DhcpTimer(DevIndex),
    /// The TFTP server's per-transaction clock.
    TftpTimer,
}

/// One worker registration.
#[derive(Copy, Clone, Debug)]
pub struct Registration {
    pub(crate) cond: CondIndex,
    pub(crate) priority: Priority,
    pub(crate) deadline: Option<Tick>,
    pub(crate) dispatch: Dispatch,
}

impl Registration {
    pub fn new(cond: CondIndex, dispatch: Dispatch) -> Self {
        Self {
            cond,
            priority: Priority::IDLE,
            deadline: None,
            dispatch,
        }
    }
}

impl<B: TftpBacking> NetStack<B> {
    /// Adds a registration. Runtime additions happen under the scheduler
    /// lock so the worker never sees a half-written table.
    pub(crate) fn register(&mut self, reg: Registration) {
        assert!(self.registrations.len() < MAX_REGISTRATIONS);
        self.registrations.push(reg).ok().unwrap();
    }

    /// Removes a registration at runtime.
    pub fn deregister<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dispatch: Dispatch,
    ) {
        kernel.sched_lock();
        let mut i = 0;
        while i < self.registrations.len() {
            if self.registrations[i].dispatch == dispatch {
                self.registrations.swap_remove(i);
            } else {
                i += 1;
            }
        }
        kernel.sched_unlock();
    }

    /// The worker body: park on every registration, dispatch the one that
    /// fired. Tests call this directly; on hardware a dedicated
    /// high-priority task does nothing else.
    pub fn poll<P: Platform>(&mut self, kernel: &mut Kernel<P>) {
        self.refresh_deadlines(kernel);

        let mut conds = [CondIndex(0); MAX_REGISTRATIONS];
        let mut specs = [WaitSpec::default(); MAX_REGISTRATIONS];
        let n = self.registrations.len();
        assert!(n > 0, "network worker with nothing to watch");
        for (i, r) in self.registrations.iter().enumerate() {
            conds[i] = r.cond;
            specs[i] = WaitSpec {
                param: 0,
                priority: r.priority,
                deadline: r.deadline,
            };
        }

        let (status, ix) =
            kernel.suspend_condition(&conds[..n], &specs[..n], false);
        let dispatch = self.registrations[ix].dispatch;
        match status {
            Ok(()) => self.dispatch_ready(kernel, dispatch),
            Err(Error::ConditionTimeout) => {
                self.dispatch_timeout(kernel, dispatch)
            }
            Err(_) => {
                // A registration was resumed with an error status; its
                // owner is being torn down. Nothing to service.
            }
        }
    }

    /// Runs the worker forever. The dedicated task's entry point.
    pub fn run<P: Platform>(&mut self, kernel: &mut Kernel<P>) -> ! {
        loop {
            self.poll(kernel);
        }
    }

    fn dispatch_ready<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dispatch: Dispatch,
    ) {
        match dispatch {
            Dispatch::DeviceRx(dev) => self.device_rx(kernel, dev),
            // A timer condition resumed without a timeout: a protocol
            // engine pinged it to ask for immediate service.
            Dispatch::ArpTimer(dev) => crate::arp::timer(self, kernel, dev),
            Dispatch::DhcpTimer(dev) => {
                crate::dhcp::timer(self, kernel, dev)
            }
            Dispatch::TftpTimer => crate::tftp::timer(self, kernel),
        }
    }

    fn dispatch_timeout<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dispatch: Dispatch,
    ) {
        match dispatch {
            // Device receive never times out (no deadline is armed).
            Dispatch::DeviceRx(_) => {}
            Dispatch::ArpTimer(dev) => crate::arp::timer(self, kernel, dev),
            Dispatch::DhcpTimer(dev) => {
                crate::dhcp::timer(self, kernel, dev)
            }
            Dispatch::TftpTimer => crate::tftp::timer(self, kernel),
        }
    }

    fn device_rx<P: Platform>(&mut self, kernel: &mut Kernel<P>, dev: DevIndex) {
        loop {
            let fd = self.devices[usize::from(dev.0)].fd;
            match kernel.fd_read_buffer(fd) {
                Ok(h) => self.eth_receive(kernel, dev, h),
                Err(_) => break,
            }
        }
    }

    pub(crate) fn refresh_deadlines<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
    ) {
        for i in 0..self.registrations.len() {
            let deadline = match self.registrations[i].dispatch {
                Dispatch::DeviceRx(_) => None,
                Dispatch::ArpTimer(dev) => {
                    self.devices[usize::from(dev.0)].arp.next_event()
                }
                Dispatch::DhcpTimer(dev) => self.devices[usize::from(dev.0)]
                    .dhcp
                    .as_ref()
                    .map(|c| c.deadline()),
                Dispatch::TftpTimer => {
                    self.tftp.as_ref().and_then(|t| t.deadline())
                }
            };
            self.registrations[i].deadline = deadline;
        }
        let _ = kernel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use kern::arch::fake;

    #[test]
    fn rx_dispatches_without_parking() {
        let mut rig = rig();
        let sock = rig.stack.udp_bind(&mut rig.k, 7000).unwrap();
        inject(
            &mut rig,
            &udp_frame(PEER_IP, DEV_IP, 5555, 7000, b"via worker"),
        );
        // Data is already pending, so the park pre-check fires straight
        // through to the device handler.
        rig.stack.poll(&mut rig.k);
        let mut buf = [0u8; 32];
        let (n, ..) = rig
            .stack
            .udp_recv_from(&mut rig.k, sock, &mut buf)
            .unwrap();
        assert_eq!(&buf[..n], b"via worker");
    }

    #[test]
    fn parked_worker_wakes_for_timer_deadline() {
        let mut rig = rig();
        // An unresolved send arms the ARP retry clock.
        let r = rig.stack.udp_send(
            &mut rig.k,
            rig.dev,
            8000,
            PEER_IP,
            8001,
            b"x",
        );
        assert_eq!(r, Err(abi::Error::NetBufferConsumed));
        let _request = transmitted(&mut rig).unwrap();

        // Nothing to receive: the worker parks until the retry deadline.
        let deadline = rig
            .stack
            .device(rig.dev)
            .arp
            .next_event()
            .expect("retry clock not armed");
        fake::on_park(move |k| k.tick(deadline));
        rig.stack.poll(&mut rig.k);

        // The timeout dispatched the ARP timer, which retransmitted.
        let retry = transmitted(&mut rig).expect("no retry request");
        assert_eq!(
            &retry[12..14],
            &crate::wire::ETHERTYPE_ARP.to_be_bytes()
        );
    }
}
