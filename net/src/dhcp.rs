// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCP client.
//!
//! The classic state walk: DISCOVER until an offer lands, REQUEST until
//! the server acknowledges, then sit bound until T1 (half the lease)
//! triggers RENEW, T2 (seven eighths) triggers REBIND, and expiry starts
//! the whole dance over. Retransmits back off by doubling, saturating at
//! the configured ceiling; exhausting the ceiling demotes the state
//! (REQUEST and REBIND fall back to DISCOVER, RENEW to REBIND). A fresh
//! transaction id is drawn on every entry to DISCOVER, RENEW, or REBIND.
//!
//! All of this runs on the network worker: received frames arrive through
//! the UDP port owner hook, and the retransmit clock is a worker timer
//! registration.

use abi::{Error, KResult, Tick, TICKS_PER_SEC};
use kern::arch::Platform;
use kern::fsbuf::{BufFlags, ListHandle};
use kern::Kernel;

use crate::device::{DevIndex, Ipv4State};
use crate::udp::PortOwner;
use crate::wire::IP_BROADCAST;
use crate::worker::{Dispatch, Registration};
use crate::{NetEvent, NetStack, TftpBacking};

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;

const BOOTP_REQUEST: u8 = 1;
const BOOTP_REPLY: u8 = 2;
const DHCP_MAGIC: u32 = 0x6382_5363;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;
const MSG_NAK: u8 = 6;

const OPT_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_HOSTNAME: u8 = 12;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_LIST: u8 = 55;
const OPT_END: u8 = 255;

const HOSTNAME: &[u8] = b"kestrel";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DhcpState {
    Stopped,
    Discover,
    Request,
    Renew,
    Rebind,
}

#[derive(Debug)]
pub struct DhcpClient {
    state: DhcpState,
    xid: u32,
    current_timeout: u32,
    deadline: Tick,
    lease_start: Tick,
    lease_ticks: u32,
    server_ip: u32,
    offered_ip: u32,
    start_time: Tick,
}

impl DhcpClient {
    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub(crate) fn deadline(&self) -> Tick {
        self.deadline
    }

    pub fn lease_expires(&self) -> Tick {
        self.lease_start.offset(self.lease_ticks)
    }
}

// Transaction ids only need to not repeat across nearby transactions.
fn fresh_xid(now: Tick, salt: u32) -> u32 {
    now.0
        .wrapping_mul(2654435761)
        .wrapping_add(salt)
        .wrapping_add(0x9E3779B9)
}

fn change_state(
    client: &mut DhcpClient,
    state: DhcpState,
    now: Tick,
    base_timeout: u32,
) {
    client.state = state;
    client.current_timeout = base_timeout / 2;

    client.deadline = match state {
        DhcpState::Renew => client.lease_start.offset(client.lease_ticks / 2),
        DhcpState::Rebind => {
            client.lease_start.offset(client.lease_ticks / 8 * 7)
        }
        _ => now,
    };
    // Never schedule past the end of the lease.
    if state != DhcpState::Discover && client.lease_ticks != 0 {
        let expiry = client.lease_expires();
        if client.deadline.since(expiry) > 0 {
            client.deadline = expiry;
        }
    }

    if matches!(
        state,
        DhcpState::Discover | DhcpState::Renew | DhcpState::Rebind
    ) {
        client.xid = fresh_xid(now, client.xid);
    }
    if state == DhcpState::Discover {
        client.server_ip = 0;
        client.offered_ip = 0;
        client.lease_start = now;
        client.lease_ticks = 0;
    }
}

impl<B: TftpBacking> NetStack<B> {
    /// Starts the DHCP client on `dev`: binds the client port, registers
    /// the retransmit timer, and enters DISCOVER.
    pub fn enable_dhcp<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        dev: DevIndex,
    ) -> KResult<()> {
        self.bind_port(DHCP_CLIENT_PORT, PortOwner::Dhcp(dev))?;
        let cond = kernel.create_condition(kern::CondKind::Explicit, false);
        self.register(Registration::new(cond, Dispatch::DhcpTimer(dev)));

        let now = kernel.now();
        let mut client = DhcpClient {
            state: DhcpState::Stopped,
            xid: 0,
            current_timeout: self.dhcp_cfg.base_timeout,
            deadline: now,
            lease_start: now,
            lease_ticks: 0,
            server_ip: 0,
            offered_ip: 0,
            start_time: now,
        };
        change_state(
            &mut client,
            DhcpState::Discover,
            now,
            self.dhcp_cfg.base_timeout,
        );
        self.devices[usize::from(dev.0)].dhcp = Some(client);
        Ok(())
    }

    pub fn dhcp_client(&self, dev: DevIndex) -> Option<&DhcpClient> {
        self.devices[usize::from(dev.0)].dhcp.as_ref()
    }
}

/// The retransmit clock for one device's client.
pub(crate) fn timer<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
) {
    let now = kernel.now();
    let base = stack.dhcp_cfg.base_timeout;
    let max = stack.dhcp_cfg.max_timeout;

    let Some(client) = stack.devices[usize::from(dev.0)].dhcp.as_mut()
    else {
        return;
    };
    if client.state == DhcpState::Stopped || !now.reached(client.deadline) {
        return;
    }

    // A bound client whose lease ran out starts over from scratch.
    let expired = !matches!(
        client.state,
        DhcpState::Discover | DhcpState::Request
    ) && client.lease_ticks != 0
        && now.reached(client.lease_expires());
    if expired {
        change_state(client, DhcpState::Discover, now, base);
        stack.devices[usize::from(dev.0)].ip = None;
        ringbuf::ring_entry!(stack.ring, NetEvent::DhcpState(dev.0));
        return;
    }

    // Back off: double, saturating at the ceiling. An exhausted backoff
    // demotes the state rather than retrying forever.
    let exhausted = client.current_timeout >= max;
    client.current_timeout = client.current_timeout.saturating_mul(2).min(max);
    client.deadline = now.offset(client.current_timeout);

    let state = client.state;
    match state {
        DhcpState::Stopped => {}
        DhcpState::Discover => {
            let _ = send_message(stack, kernel, dev, MSG_DISCOVER);
        }
        DhcpState::Request | DhcpState::Rebind if exhausted => {
            let client =
                stack.devices[usize::from(dev.0)].dhcp.as_mut().unwrap();
            change_state(client, DhcpState::Discover, now, base);
            ringbuf::ring_entry!(stack.ring, NetEvent::DhcpState(dev.0));
        }
        DhcpState::Renew if exhausted => {
            let client =
                stack.devices[usize::from(dev.0)].dhcp.as_mut().unwrap();
            change_state(client, DhcpState::Rebind, now, base);
            ringbuf::ring_entry!(stack.ring, NetEvent::DhcpState(dev.0));
        }
        DhcpState::Request | DhcpState::Renew | DhcpState::Rebind => {
            let _ = send_message(stack, kernel, dev, MSG_REQUEST);
        }
    }
}

/// Handles a frame delivered to the client port.
pub(crate) fn receive<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    h: ListHandle,
) -> KResult<()> {
    let fd = stack.devices[usize::from(dev.0)].fd;
    let our_mac = stack.devices[usize::from(dev.0)].mac;

    // Fixed BOOTP part.
    let mut fixed = [0u8; 44]; // op..chaddr
    let pool = kernel.fd_pool_mut(fd);
    let parse = (|| -> KResult<(u8, u32, u32, [u8; 6])> {
        pool.pull(h, Some(&mut fixed), 44, BufFlags::empty())?;
        pool.pull(h, None, 192, BufFlags::empty())?; // sname + file
        let mut magic = [0u8; 4];
        pool.pull(h, Some(&mut magic), 4, BufFlags::empty())?;
        if u32::from_be_bytes(magic) != DHCP_MAGIC {
            return Err(Error::NetInvalidHeader);
        }
        let op = fixed[0];
        let xid = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let yiaddr =
            u32::from_be_bytes([fixed[16], fixed[17], fixed[18], fixed[19]]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&fixed[28..34]);
        Ok((op, xid, yiaddr, chaddr))
    })();
    let (op, xid, yiaddr, chaddr) = match parse {
        Ok(v) => v,
        Err(e) => {
            ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
            kernel.fd_buffer_release(fd, h);
            return Err(e);
        }
    };

    // Options.
    let mut msg_type = 0u8;
    let mut server_id = 0u32;
    let mut lease_secs = 0u32;
    let mut router = 0u32;
    let mut mask = 0u32;
    let pool = kernel.fd_pool_mut(fd);
    while pool.total_len(h) > 0 {
        let mut code = [0u8];
        if pool.pull(h, Some(&mut code), 1, BufFlags::empty()).is_err() {
            break;
        }
        match code[0] {
            0 => continue,
            OPT_END => break,
            c => {
                let mut len = [0u8];
                if pool.pull(h, Some(&mut len), 1, BufFlags::empty()).is_err()
                {
                    break;
                }
                let n = usize::from(len[0]);
                let mut val = [0u8; 16];
                if n > val.len() {
                    let _ = pool.pull(h, None, n, BufFlags::empty());
                    continue;
                }
                if pool
                    .pull(h, Some(&mut val[..n]), n, BufFlags::empty())
                    .is_err()
                {
                    break;
                }
                let word = |v: &[u8]| {
                    u32::from_be_bytes([v[0], v[1], v[2], v[3]])
                };
                match c {
                    OPT_MSG_TYPE if n == 1 => msg_type = val[0],
                    OPT_SERVER_ID if n == 4 => server_id = word(&val),
                    OPT_LEASE if n == 4 => lease_secs = word(&val),
                    OPT_ROUTER if n >= 4 => router = word(&val),
                    OPT_MASK if n == 4 => mask = word(&val),
                    _ => {}
                }
            }
        }
    }
    kernel.fd_buffer_release(fd, h);

    let now = kernel.now();
    let base = stack.dhcp_cfg.base_timeout;
    let Some(client) = stack.devices[usize::from(dev.0)].dhcp.as_mut()
    else {
        return Ok(());
    };

    // Not our conversation.
    if op != BOOTP_REPLY || xid != client.xid || chaddr != our_mac.0 {
        return Err(Error::NetUnknownSource);
    }

    match (client.state, msg_type) {
        (DhcpState::Discover, MSG_OFFER) => {
            client.offered_ip = yiaddr;
            client.server_ip = server_id;
            // The transaction continues under the DISCOVER xid; only
            // DISCOVER/RENEW/REBIND entries draw a fresh one.
            change_state(client, DhcpState::Request, now, base);
            ringbuf::ring_entry!(stack.ring, NetEvent::DhcpState(dev.0));
        }
        (
            DhcpState::Request | DhcpState::Renew | DhcpState::Rebind,
            MSG_ACK,
        ) => {
            client.lease_start = now;
            client.lease_ticks = lease_secs.saturating_mul(TICKS_PER_SEC);
            if server_id != 0 {
                client.server_ip = server_id;
            }
            let addr = if yiaddr != 0 { yiaddr } else { client.offered_ip };
            let gateway = if router != 0 {
                Some(router)
            } else {
                Some(client.server_ip)
            };
            let mask = if mask != 0 { mask } else { 0xFFFF_FF00 };
            change_state(client, DhcpState::Renew, now, base);
            stack.devices[usize::from(dev.0)].ip = Some(Ipv4State {
                addr,
                mask,
                gateway,
            });
            ringbuf::ring_entry!(stack.ring, NetEvent::DhcpBound(addr));
        }
        (_, MSG_NAK) => {
            change_state(client, DhcpState::Discover, now, base);
            ringbuf::ring_entry!(stack.ring, NetEvent::DhcpState(dev.0));
        }
        // A reply that does not fit the current state is stale; drop it.
        _ => {}
    }
    Ok(())
}

fn send_message<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    msg_type: u8,
) -> KResult<()> {
    let d = &stack.devices[usize::from(dev.0)];
    let fd = d.fd;
    let mac = d.mac;
    let client = d.dhcp.as_ref().unwrap();
    let xid = client.xid;
    let state = client.state;
    let secs = (kernel.now().since(client.start_time).max(0) as u32)
        / TICKS_PER_SEC;
    let ciaddr = match state {
        DhcpState::Renew => d.ip.map(|i| i.addr).unwrap_or(0),
        _ => 0,
    };
    let requested = client.offered_ip;
    let server = client.server_ip;
    // RENEW unicasts to the server that owns the lease.
    let dst_ip = match state {
        DhcpState::Renew if server != 0 => server,
        _ => IP_BROADCAST,
    };

    let pool = kernel.fd_pool_mut(fd);
    let h = pool.alloc_list(BufFlags::TH)?;
    let r = (|| -> KResult<()> {
        let mut fixed = [0u8; 44];
        fixed[0] = BOOTP_REQUEST;
        fixed[1] = 1; // ethernet
        fixed[2] = 6;
        fixed[4..8].copy_from_slice(&xid.to_be_bytes());
        fixed[8..10].copy_from_slice(&(secs as u16).to_be_bytes());
        fixed[10] = 0x80; // broadcast flag
        fixed[12..16].copy_from_slice(&ciaddr.to_be_bytes());
        fixed[28..34].copy_from_slice(&mac.0);
        pool.push(h, &fixed, BufFlags::empty())?;
        pool.push(h, &[0u8; 192], BufFlags::empty())?; // sname + file
        pool.push(h, &DHCP_MAGIC.to_be_bytes(), BufFlags::empty())?;

        pool.push(h, &[OPT_MSG_TYPE, 1, msg_type], BufFlags::empty())?;
        if msg_type == MSG_REQUEST && state == DhcpState::Request {
            let mut opt = [0u8; 6];
            opt[0] = OPT_REQUESTED_IP;
            opt[1] = 4;
            opt[2..6].copy_from_slice(&requested.to_be_bytes());
            pool.push(h, &opt, BufFlags::empty())?;
            opt[0] = OPT_SERVER_ID;
            opt[2..6].copy_from_slice(&server.to_be_bytes());
            pool.push(h, &opt, BufFlags::empty())?;
        }
        pool.push(
            h,
            &[OPT_PARAM_LIST, 2, OPT_MASK, OPT_ROUTER],
            BufFlags::empty(),
        )?;
        let mut host = [0u8; 2 + HOSTNAME.len()];
        host[0] = OPT_HOSTNAME;
        host[1] = HOSTNAME.len() as u8;
        host[2..].copy_from_slice(HOSTNAME);
        pool.push(h, &host, BufFlags::empty())?;
        pool.push(h, &[OPT_END], BufFlags::empty())?;
        Ok(())
    })();
    if let Err(e) = r {
        kernel.fd_pool_mut(fd).free_list(h);
        return Err(e);
    }

    match stack.udp_send_list(
        kernel,
        dev,
        DHCP_CLIENT_PORT,
        dst_ip,
        DHCP_SERVER_PORT,
        h,
    ) {
        Ok(()) | Err(Error::NetBufferConsumed) => Ok(()),
        Err(e) => Err(e),
    }
}
