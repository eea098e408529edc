// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal IPv4: header build/verify and routing to the neighbor layer.
//!
//! No fragmentation and no options; the targets this runs on speak
//! datagrams small enough not to need either. Off-subnet destinations go
//! through the configured gateway's neighbor entry.

use abi::{Error, KResult};
use kern::arch::Platform;
use kern::fsbuf::{BufFlags, ListHandle};
use kern::Kernel;

use crate::device::DevIndex;
use crate::wire::{ip_in_subnet, IP_BROADCAST};
use crate::{NetEvent, NetStack, TftpBacking};

pub const PROTO_UDP: u8 = 17;

/// IPv4 header length; options are not produced or accepted.
pub const IPV4_HDR_LEN: usize = 20;

/// Folded ones'-complement sum of `bytes` (odd tails zero-padded).
fn ones_sum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for w in &mut chunks {
        sum += u32::from(u16::from_be_bytes([w[0], w[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Checksum value to place in a header whose checksum field is zero.
pub fn checksum(header: &[u8]) -> u16 {
    !ones_sum(header)
}

/// Verifies a header that includes its checksum field.
pub fn checksum_ok(header: &[u8]) -> bool {
    ones_sum(header) == 0xFFFF
}

/// Handles a received IPv4 frame (Ethernet header already stripped).
pub(crate) fn receive<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    h: ListHandle,
) -> KResult<()> {
    let fd = stack.devices[usize::from(dev.0)].fd;
    let mut header = [0u8; IPV4_HDR_LEN];
    let pool = kernel.fd_pool_mut(fd);
    if pool
        .pull(h, Some(&mut header), IPV4_HDR_LEN, BufFlags::INPLACE)
        .is_err()
    {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    if header[0] != 0x45 {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    if !checksum_ok(&header) {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadChecksum(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidChecksum);
    }

    let total_len =
        usize::from(u16::from_be_bytes([header[2], header[3]]));
    let proto = header[9];
    let src_ip = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let dst_ip = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);

    // Trim link padding, then consume the header for real.
    let pool = kernel.fd_pool_mut(fd);
    let have = pool.total_len(h) as usize;
    if have < total_len {
        ringbuf::ring_entry!(stack.ring, NetEvent::DropBadHeader(dev.0));
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    if have > total_len {
        pool.pull(h, None, have - total_len, BufFlags::TAIL)?;
    }
    pool.pull(h, None, IPV4_HDR_LEN, BufFlags::empty())?;

    // For us? Interface address, broadcast, or an unconfigured interface
    // listening for its DHCP answer.
    let our = stack.devices[usize::from(dev.0)].ip.map(|i| i.addr);
    let for_us = dst_ip == IP_BROADCAST
        || our == Some(dst_ip)
        || (our.is_none() && proto == PROTO_UDP);
    if !for_us {
        kernel.fd_buffer_release(fd, h);
        return Ok(());
    }

    match proto {
        PROTO_UDP => crate::udp::receive(stack, kernel, dev, h, src_ip, dst_ip),
        _ => {
            kernel.fd_buffer_release(fd, h);
            Ok(())
        }
    }
}

/// Prepends an IPv4 header onto `h` and routes it. Consumes `h`.
pub(crate) fn send<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    src_ip: u32,
    dst_ip: u32,
    proto: u8,
    h: ListHandle,
) -> KResult<()> {
    let d = &stack.devices[usize::from(dev.0)];
    let fd = d.fd;
    if !d.link_up {
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetLinkDown);
    }

    let pool = kernel.fd_pool_mut(fd);
    let total = IPV4_HDR_LEN + pool.total_len(h) as usize;
    let mut header = [0u8; IPV4_HDR_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    header[8] = 64; // ttl
    header[9] = proto;
    header[12..16].copy_from_slice(&src_ip.to_be_bytes());
    header[16..20].copy_from_slice(&dst_ip.to_be_bytes());
    let csum = checksum(&header);
    header[10..12].copy_from_slice(&csum.to_be_bytes());
    pool.push(h, &header, BufFlags::HEAD)?;

    // Route: on-subnet neighbors directly, everything else via the
    // gateway, broadcast straight out.
    if dst_ip == IP_BROADCAST {
        return crate::arp::transmit_ipv4(stack, kernel, dev, dst_ip, h);
    }
    let ip = stack.devices[usize::from(dev.0)].ip;
    let next_hop = match ip {
        Some(i) if ip_in_subnet(i.addr, dst_ip, i.mask) => dst_ip,
        Some(i) => match i.gateway {
            Some(gw) => gw,
            None => {
                ringbuf::ring_entry!(stack.ring, NetEvent::NoRoute(dst_ip));
                kernel.fd_buffer_release(fd, h);
                return Err(Error::NetDstUnreachable);
            }
        },
        None => {
            kernel.fd_buffer_release(fd, h);
            return Err(Error::NetNoAddress);
        }
    };
    crate::arp::transmit_ipv4(stack, kernel, dev, next_hop, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_vector() {
        // Classic example header from RFC 1071 discussions.
        let mut h = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11,
            0x00, 0x00, 0xC0, 0xA8, 0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        let c = checksum(&h);
        assert_eq!(c, 0xB861);
        h[10..12].copy_from_slice(&c.to_be_bytes());
        assert!(checksum_ok(&h));
        // One flipped bit must not verify.
        h[4] ^= 0x01;
        assert!(!checksum_ok(&h));
    }

    #[test]
    fn odd_length_sums_pad_with_zero() {
        assert_eq!(ones_sum(&[0xFF]), 0xFF00);
    }
}
