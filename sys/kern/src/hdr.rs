// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative header generation and parsing.
//!
//! A protocol header is a table of fields; each entry names the bytes and
//! the push/pull options (`PACKED` for network-order scalars, `UPDATE` for
//! patch-after-the-fact fields like checksums). [`generate`] walks the
//! table pushing onto a buffer list; [`parse`] walks it pulling. Both stop
//! at the first failure. This is the only way the protocol layers touch
//! buffer internals, which keeps wire layout knowledge in one table per
//! protocol.

use abi::KResult;

use crate::fsbuf::{BufFlags, BufferPool, ListHandle};

/// One field of an outgoing header.
pub struct HdrPush<'a> {
    pub bytes: &'a [u8],
    pub flags: BufFlags,
}

/// One field of an incoming header.
pub struct HdrPull<'a> {
    pub out: &'a mut [u8],
    pub flags: BufFlags,
}

/// Pushes each table entry in order onto `list`.
pub fn generate(
    pool: &mut BufferPool,
    list: ListHandle,
    table: &[HdrPush<'_>],
) -> KResult<()> {
    for field in table {
        pool.push(list, field.bytes, field.flags)?;
    }
    Ok(())
}

/// Pulls each table entry in order from the head of `list`.
pub fn parse(
    pool: &mut BufferPool,
    list: ListHandle,
    table: &mut [HdrPull<'_>],
) -> KResult<()> {
    for field in table {
        let len = field.out.len();
        pool.pull(list, Some(field.out), len, field.flags)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Error;

    // A representative address-resolution shaped header: fixed scalars,
    // then addresses, all round-tripped bit for bit.
    #[test]
    fn generate_parse_round_trip() {
        let mut pool = BufferPool::new(0, 0);
        let list = pool.alloc_list(BufFlags::empty()).unwrap();

        let hardware_type: u16 = 1;
        let protocol_type: u16 = 0x0800;
        let sizes: [u8; 2] = [6, 4];
        let op: u16 = 2;
        let mac = [0x02, 0x00, 0xA1, 0xB2, 0xC3, 0xD4];
        let ip: u32 = 0xC0A8_0132;

        generate(
            &mut pool,
            list,
            &[
                HdrPush {
                    bytes: &hardware_type.to_le_bytes(),
                    flags: BufFlags::PACKED,
                },
                HdrPush {
                    bytes: &protocol_type.to_le_bytes(),
                    flags: BufFlags::PACKED,
                },
                HdrPush {
                    bytes: &sizes,
                    flags: BufFlags::empty(),
                },
                HdrPush {
                    bytes: &op.to_le_bytes(),
                    flags: BufFlags::PACKED,
                },
                HdrPush {
                    bytes: &mac,
                    flags: BufFlags::empty(),
                },
                HdrPush {
                    bytes: &ip.to_le_bytes(),
                    flags: BufFlags::PACKED,
                },
            ],
        )
        .unwrap();

        assert_eq!(pool.total_len(list), 18);

        let mut r_hw = [0u8; 2];
        let mut r_proto = [0u8; 2];
        let mut r_sizes = [0u8; 2];
        let mut r_op = [0u8; 2];
        let mut r_mac = [0u8; 6];
        let mut r_ip = [0u8; 4];
        parse(
            &mut pool,
            list,
            &mut [
                HdrPull {
                    out: &mut r_hw,
                    flags: BufFlags::PACKED,
                },
                HdrPull {
                    out: &mut r_proto,
                    flags: BufFlags::PACKED,
                },
                HdrPull {
                    out: &mut r_sizes,
                    flags: BufFlags::empty(),
                },
                HdrPull {
                    out: &mut r_op,
                    flags: BufFlags::PACKED,
                },
                HdrPull {
                    out: &mut r_mac,
                    flags: BufFlags::empty(),
                },
                HdrPull {
                    out: &mut r_ip,
                    flags: BufFlags::PACKED,
                },
            ],
        )
        .unwrap();

        assert_eq!(u16::from_le_bytes(r_hw), hardware_type);
        assert_eq!(u16::from_le_bytes(r_proto), protocol_type);
        assert_eq!(r_sizes, sizes);
        assert_eq!(u16::from_le_bytes(r_op), op);
        assert_eq!(r_mac, mac);
        assert_eq!(u32::from_le_bytes(r_ip), ip);
        assert_eq!(pool.total_len(list), 0);
        pool.free_list(list);
    }

    #[test]
    fn generate_short_circuits_on_failure() {
        let mut pool = BufferPool::new(0, 0);
        let list = pool.alloc_list(BufFlags::empty()).unwrap();
        let huge = [0u8; crate::fsbuf::FS_BUFFER_SIZE * crate::fsbuf::POOL_CHUNKS];
        let tail = [1u8; 4];
        let r = generate(
            &mut pool,
            list,
            &[
                HdrPush {
                    bytes: &huge,
                    flags: BufFlags::empty(),
                },
                HdrPush {
                    bytes: &huge,
                    flags: BufFlags::empty(),
                },
                HdrPush {
                    bytes: &tail,
                    flags: BufFlags::empty(),
                },
            ],
        );
        assert_eq!(r, Err(Error::FsBufferNoSpace));
        // The failed generate never reached the tail entry.
        assert!(pool.total_len(list) < (2 * huge.len() + 4) as u32);
        pool.free_list(list);
    }
}
