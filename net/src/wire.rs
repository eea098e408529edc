// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level primitive types shared by the protocol modules.

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Bytes of an Ethernet header: destination, source, ethertype.
pub const ETH_HDR_LEN: usize = 14;

/// A MAC address, kept in wire order.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    pub const BROADCAST: Self = EthAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl Default for EthAddr {
    fn default() -> Self {
        EthAddr([0; 6])
    }
}

/// An IPv4 address as a host-order integer; `to_be_bytes` is its wire
/// form.
pub fn ip_in_subnet(addr: u32, other: u32, mask: u32) -> bool {
    (addr & mask) == (other & mask)
}

/// The limited broadcast address.
pub const IP_BROADCAST: u32 = 0xFFFF_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_membership() {
        let mask = 0xFFFF_FF00;
        assert!(ip_in_subnet(0xC0A8_0102, 0xC0A8_01FE, mask));
        assert!(!ip_in_subnet(0xC0A8_0102, 0xC0A8_0201, mask));
    }

    #[test]
    fn broadcast_mac() {
        assert!(EthAddr::BROADCAST.is_broadcast());
        assert!(!EthAddr([0; 6]).is_broadcast());
    }
}
