// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TFTP server, single client at a time.
//!
//! The first request packet binds the client's transfer id (its address
//! and port); packets from anyone else get an error reply and do not
//! disturb the transfer in progress. Data moves in 512-byte blocks with
//! lockstep ACKs, a short block marks the end, and an idle transaction is
//! cleared by the worker's timer. Storage is behind [`TftpBacking`] — the
//! filesystem itself is not the server's business.

use abi::{Error, KResult, Tick};
use kern::arch::Platform;
use kern::fsbuf::{BufFlags, ListHandle};
use kern::Kernel;

use crate::device::DevIndex;
use crate::udp::PortOwner;
use crate::worker::{Dispatch, Registration};
use crate::{NetEvent, NetStack};

pub const TFTP_PORT: u16 = 69;
pub const TFTP_BLOCK_SIZE: usize = 512;
const MAX_FILENAME: usize = 64;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERR: u16 = 5;

const ERR_NOT_FOUND: u16 = 1;
const ERR_ILLEGAL: u16 = 4;
const ERR_UNKNOWN_TID: u16 = 5;

/// Storage the server reads and writes. Offsets are byte positions from
/// the start of the open file.
pub trait TftpBacking {
    fn open_read(&mut self, name: &[u8]) -> KResult<()>;
    fn open_write(&mut self, name: &[u8]) -> KResult<()>;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> KResult<usize>;
    fn write(&mut self, offset: u32, data: &[u8]) -> KResult<()>;
    fn close(&mut self);
}

/// Backing for builds that carry the server but no storage; every request
/// fails cleanly.
#[derive(Debug, Default)]
pub struct NullBacking;

impl TftpBacking for NullBacking {
    fn open_read(&mut self, _name: &[u8]) -> KResult<()> {
        Err(Error::TftpFsError)
    }
    fn open_write(&mut self, _name: &[u8]) -> KResult<()> {
        Err(Error::TftpFsError)
    }
    fn read(&mut self, _offset: u32, _buf: &mut [u8]) -> KResult<usize> {
        Err(Error::TftpFsError)
    }
    fn write(&mut self, _offset: u32, _data: &[u8]) -> KResult<()> {
        Err(Error::TftpFsError)
    }
    fn close(&mut self) {}
}

/// The bound client's transfer id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Tid {
    dev: DevIndex,
    ip: u32,
    port: u16,
}

pub struct TftpServer<B: TftpBacking> {
    backing: B,
    client: Option<Tid>,
    block_num: u16,
    last_block: bool,
    writing: bool,
    deadline: Option<Tick>,
}

impl<B: TftpBacking> TftpServer<B> {
    pub(crate) fn deadline(&self) -> Option<Tick> {
        self.deadline
    }

    pub fn busy(&self) -> bool {
        self.client.is_some()
    }
}

impl<B: TftpBacking> NetStack<B> {
    /// Starts the TFTP server on its well-known port.
    pub fn start_tftp<P: Platform>(
        &mut self,
        kernel: &mut Kernel<P>,
        backing: B,
    ) -> KResult<()> {
        self.bind_port(TFTP_PORT, PortOwner::Tftp)?;
        let cond = kernel.create_condition(kern::CondKind::Explicit, false);
        self.register(Registration::new(cond, Dispatch::TftpTimer));
        self.tftp = Some(TftpServer {
            backing,
            client: None,
            block_num: 0,
            last_block: false,
            writing: false,
            deadline: None,
        });
        Ok(())
    }

    pub fn tftp_server(&self) -> Option<&TftpServer<B>> {
        self.tftp.as_ref()
    }
}

/// Clears an idle transaction when its clock runs out.
pub(crate) fn timer<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
) {
    let now = kernel.now();
    let Some(server) = stack.tftp.as_mut() else { return };
    let Some(deadline) = server.deadline else { return };
    if server.client.is_some() && now.reached(deadline) {
        server.backing.close();
        server.client = None;
        server.deadline = None;
        ringbuf::ring_entry!(
            stack.ring,
            NetEvent::TftpError(Error::ConditionTimeout.code())
        );
    }
}

/// Handles a frame delivered to the server's port.
pub(crate) fn receive<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    dev: DevIndex,
    h: ListHandle,
    src_ip: u32,
    src_port: u16,
) -> KResult<()> {
    let fd = stack.devices[usize::from(dev.0)].fd;
    let tid = Tid {
        dev,
        ip: src_ip,
        port: src_port,
    };

    let mut op = [0u8; 2];
    if kernel
        .fd_pool_mut(fd)
        .pull(h, Some(&mut op), 2, BufFlags::PACKED)
        .is_err()
    {
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    let op = u16::from_le_bytes(op);
    ringbuf::ring_entry!(stack.ring, NetEvent::TftpOpcode(op));

    if stack.tftp.is_none() {
        kernel.fd_buffer_release(fd, h);
        return Ok(());
    }

    match op {
        OP_RRQ | OP_WRQ => request(stack, kernel, tid, h, op),
        OP_DATA => data(stack, kernel, tid, h),
        OP_ACK => ack(stack, kernel, tid, h),
        OP_ERR => {
            kernel.fd_buffer_release(fd, h);
            let server = stack.tftp.as_mut().unwrap();
            if server.client == Some(tid) {
                server.backing.close();
                server.client = None;
                server.deadline = None;
            }
            Ok(())
        }
        _ => {
            kernel.fd_buffer_release(fd, h);
            send_error(stack, kernel, tid, ERR_ILLEGAL, b"bad opcode");
            Err(Error::NetInvalidHeader)
        }
    }
}

fn request<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    h: ListHandle,
    op: u16,
) -> KResult<()> {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;

    // Filename: bytes up to the NUL. The transfer mode that follows is
    // not examined; both octet and netascii move bytes the same way here.
    let mut name = [0u8; MAX_FILENAME];
    let mut name_len = 0;
    let status = loop {
        let mut b = [0u8];
        if kernel
            .fd_pool_mut(fd)
            .pull(h, Some(&mut b), 1, BufFlags::empty())
            .is_err()
        {
            break Err(Error::NetInvalidHeader);
        }
        if b[0] == 0 {
            break Ok(());
        }
        if name_len == MAX_FILENAME {
            break Err(Error::TftpLongFilename);
        }
        name[name_len] = b[0];
        name_len += 1;
    };
    kernel.fd_buffer_release(fd, h);
    status?;

    let server = stack.tftp.as_mut().unwrap();
    if server.client.is_some() && server.client != Some(tid) {
        send_error(stack, kernel, tid, ERR_ILLEGAL, b"server busy");
        return Err(Error::TftpExhausted);
    }

    let timeout = stack.tftp_cfg.timeout;
    let now = kernel.now();
    let server = stack.tftp.as_mut().unwrap();
    server.client = Some(tid);
    server.deadline = Some(now.offset(timeout));

    if op == OP_WRQ {
        let opened = stack
            .tftp
            .as_mut()
            .unwrap()
            .backing
            .open_write(&name[..name_len]);
        if opened.is_err() {
            clear_with_error(stack, kernel, tid, ERR_NOT_FOUND, b"open failed");
            return Err(Error::TftpFsError);
        }
        let server = stack.tftp.as_mut().unwrap();
        server.writing = true;
        server.block_num = 0;
        server.last_block = false;
        send_ack(stack, kernel, tid, 0);
        return Ok(());
    }

    // RRQ: first block goes out immediately.
    let opened = stack
        .tftp
        .as_mut()
        .unwrap()
        .backing
        .open_read(&name[..name_len]);
    if opened.is_err() {
        clear_with_error(stack, kernel, tid, ERR_NOT_FOUND, b"file not found");
        return Err(Error::TftpFsError);
    }
    let mut block = [0u8; TFTP_BLOCK_SIZE];
    let n = match stack.tftp.as_mut().unwrap().backing.read(0, &mut block) {
        Ok(n) => n,
        Err(e) => {
            clear_with_error(stack, kernel, tid, ERR_ILLEGAL, b"read failed");
            return Err(e);
        }
    };
    let server = stack.tftp.as_mut().unwrap();
    server.writing = false;
    server.block_num = 1;
    server.last_block = n < TFTP_BLOCK_SIZE;
    send_data(stack, kernel, tid, 1, &block[..n]);
    Ok(())
}

fn data<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    h: ListHandle,
) -> KResult<()> {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;

    if stack.tftp.as_ref().unwrap().client != Some(tid) {
        kernel.fd_buffer_release(fd, h);
        send_error(stack, kernel, tid, ERR_UNKNOWN_TID, b"unknown TID");
        return Err(Error::TftpUnknownTid);
    }
    if !stack.tftp.as_ref().unwrap().writing {
        // DATA during a read transfer is noise.
        kernel.fd_buffer_release(fd, h);
        return Err(Error::TftpFrameDrop);
    }

    let mut block = [0u8; 2];
    let pool = kernel.fd_pool_mut(fd);
    if pool.pull(h, Some(&mut block), 2, BufFlags::PACKED).is_err() {
        kernel.fd_buffer_release(fd, h);
        return Err(Error::NetInvalidHeader);
    }
    let block = u16::from_le_bytes(block);
    let len = (pool.total_len(h) as usize).min(TFTP_BLOCK_SIZE);
    let mut payload = [0u8; TFTP_BLOCK_SIZE];
    let r = pool.pull(h, Some(&mut payload[..len]), len, BufFlags::empty());
    kernel.fd_buffer_release(fd, h);
    r?;

    let expected = stack.tftp.as_ref().unwrap().block_num.wrapping_add(1);
    if block == expected {
        let off = u32::from(block - 1) * TFTP_BLOCK_SIZE as u32;
        let wrote = stack
            .tftp
            .as_mut()
            .unwrap()
            .backing
            .write(off, &payload[..len]);
        if wrote.is_err() {
            clear_with_error(stack, kernel, tid, ERR_ILLEGAL, b"write failed");
            return Err(Error::TftpFsError);
        }
        let timeout = stack.tftp_cfg.timeout;
        let now = kernel.now();
        let server = stack.tftp.as_mut().unwrap();
        server.block_num = block;
        server.deadline = Some(now.offset(timeout));
        let done = len < TFTP_BLOCK_SIZE;
        send_ack(stack, kernel, tid, block);
        if done {
            let server = stack.tftp.as_mut().unwrap();
            server.backing.close();
            server.client = None;
            server.deadline = None;
            ringbuf::ring_entry!(stack.ring, NetEvent::TftpDone);
        }
        Ok(())
    } else if block > expected {
        send_error(stack, kernel, tid, ERR_ILLEGAL, b"block out of order");
        Err(Error::TftpBlockOutOfBounds)
    } else {
        // Duplicate of something already written; re-ack so the client
        // moves on.
        let have = stack.tftp.as_ref().unwrap().block_num;
        send_ack(stack, kernel, tid, have);
        Ok(())
    }
}

fn ack<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    h: ListHandle,
) -> KResult<()> {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;

    if stack.tftp.as_ref().unwrap().client != Some(tid) {
        kernel.fd_buffer_release(fd, h);
        send_error(stack, kernel, tid, ERR_UNKNOWN_TID, b"unknown TID");
        return Err(Error::TftpUnknownTid);
    }
    if stack.tftp.as_ref().unwrap().writing {
        // ACKs belong to read transfers; we ack writes, not the client.
        kernel.fd_buffer_release(fd, h);
        return Err(Error::TftpFrameDrop);
    }

    let mut block = [0u8; 2];
    let r = kernel
        .fd_pool_mut(fd)
        .pull(h, Some(&mut block), 2, BufFlags::PACKED);
    kernel.fd_buffer_release(fd, h);
    r?;
    let block = u16::from_le_bytes(block);

    let have = stack.tftp.as_ref().unwrap().block_num;
    if block != have {
        if block > have {
            send_error(stack, kernel, tid, ERR_ILLEGAL, b"ack out of order");
            return Err(Error::TftpBlockOutOfBounds);
        }
        // Stale ACK; the in-flight block will be acked again.
        return Ok(());
    }

    if stack.tftp.as_ref().unwrap().last_block {
        let server = stack.tftp.as_mut().unwrap();
        server.backing.close();
        server.client = None;
        server.deadline = None;
        ringbuf::ring_entry!(stack.ring, NetEvent::TftpDone);
        return Ok(());
    }

    // Next block out.
    let off = u32::from(have) * TFTP_BLOCK_SIZE as u32;
    let mut buf = [0u8; TFTP_BLOCK_SIZE];
    let n = match stack.tftp.as_mut().unwrap().backing.read(off, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            clear_with_error(stack, kernel, tid, ERR_ILLEGAL, b"read failed");
            return Err(e);
        }
    };
    let timeout = stack.tftp_cfg.timeout;
    let now = kernel.now();
    let server = stack.tftp.as_mut().unwrap();
    server.block_num = server.block_num.wrapping_add(1);
    server.last_block = n < TFTP_BLOCK_SIZE;
    server.deadline = Some(now.offset(timeout));
    let block_num = server.block_num;
    send_data(stack, kernel, tid, block_num, &buf[..n]);
    Ok(())
}

fn send_data<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    block: u16,
    payload: &[u8],
) {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;
    let pool = kernel.fd_pool_mut(fd);
    let Ok(h) = pool.alloc_list(BufFlags::TH) else { return };
    let r = kern::hdr::generate(
        pool,
        h,
        &[
            kern::hdr::HdrPush {
                bytes: &OP_DATA.to_le_bytes(),
                flags: BufFlags::PACKED | BufFlags::TH,
            },
            kern::hdr::HdrPush {
                bytes: &block.to_le_bytes(),
                flags: BufFlags::PACKED | BufFlags::TH,
            },
            kern::hdr::HdrPush {
                bytes: payload,
                flags: BufFlags::TH,
            },
        ],
    );
    if r.is_err() {
        kernel.fd_pool_mut(fd).free_list(h);
        return;
    }
    let _ = stack.udp_send_list(kernel, tid.dev, TFTP_PORT, tid.ip, tid.port, h);
}

fn send_ack<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    block: u16,
) {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;
    let pool = kernel.fd_pool_mut(fd);
    // ACKs ride the reserve: this is exactly the traffic the threshold
    // keeps chunks aside for.
    let Ok(h) = pool.alloc_list(BufFlags::empty()) else { return };
    let mut frame = [0u8; 4];
    frame[0..2].copy_from_slice(&OP_ACK.to_be_bytes());
    frame[2..4].copy_from_slice(&block.to_be_bytes());
    if pool.push(h, &frame, BufFlags::empty()).is_err() {
        pool.free_list(h);
        return;
    }
    let _ = stack.udp_send_list(kernel, tid.dev, TFTP_PORT, tid.ip, tid.port, h);
}

fn send_error<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    code: u16,
    msg: &[u8],
) {
    let fd = stack.devices[usize::from(tid.dev.0)].fd;
    let pool = kernel.fd_pool_mut(fd);
    let Ok(h) = pool.alloc_list(BufFlags::empty()) else { return };
    let r = (|| -> KResult<()> {
        pool.push(h, &OP_ERR.to_be_bytes(), BufFlags::empty())?;
        pool.push(h, &code.to_be_bytes(), BufFlags::empty())?;
        pool.push(h, msg, BufFlags::empty())?;
        pool.push(h, &[0], BufFlags::empty())?;
        Ok(())
    })();
    if r.is_err() {
        kernel.fd_pool_mut(fd).free_list(h);
        return;
    }
    let _ = stack.udp_send_list(kernel, tid.dev, TFTP_PORT, tid.ip, tid.port, h);
    ringbuf::ring_entry!(stack.ring, NetEvent::TftpError(code as i32));
}

fn clear_with_error<B: TftpBacking, P: Platform>(
    stack: &mut NetStack<B>,
    kernel: &mut Kernel<P>,
    tid: Tid,
    code: u16,
    msg: &[u8],
) {
    send_error(stack, kernel, tid, code, msg);
    let server = stack.tftp.as_mut().unwrap();
    server.backing.close();
    server.client = None;
    server.deadline = None;
}

/// In-memory backing for the test suites.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemBacking {
    pub files: Vec<(Vec<u8>, Vec<u8>)>,
    open: Option<usize>,
}

#[cfg(test)]
impl MemBacking {
    pub fn with_file(name: &[u8], content: Vec<u8>) -> Self {
        Self {
            files: vec![(name.to_vec(), content)],
            open: None,
        }
    }
}

#[cfg(test)]
impl TftpBacking for MemBacking {
    fn open_read(&mut self, name: &[u8]) -> KResult<()> {
        self.open = self.files.iter().position(|(n, _)| n == name);
        self.open.map(|_| ()).ok_or(Error::TftpFsError)
    }
    fn open_write(&mut self, name: &[u8]) -> KResult<()> {
        self.files.push((name.to_vec(), Vec::new()));
        self.open = Some(self.files.len() - 1);
        Ok(())
    }
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> KResult<usize> {
        let ix = self.open.ok_or(Error::TftpFsError)?;
        let content = &self.files[ix].1;
        let start = (offset as usize).min(content.len());
        let n = (content.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }
    fn write(&mut self, offset: u32, data: &[u8]) -> KResult<()> {
        let ix = self.open.ok_or(Error::TftpFsError)?;
        let content = &mut self.files[ix].1;
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
    fn close(&mut self) {
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn tftp_rig(content_len: usize) -> Rig {
        let mut rig = rig();
        let content = (0..content_len).map(|i| i as u8).collect();
        let backing = MemBacking::with_file(b"boot.bin", content);
        rig.stack.start_tftp(&mut rig.k, backing).unwrap();
        // The peer resolves us directly; pre-prime its neighbor entry by
        // answering the first request inline in each test instead.
        rig
    }

    fn rrq(name: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&OP_RRQ.to_be_bytes());
        p.extend_from_slice(name);
        p.push(0);
        p.extend_from_slice(b"octet");
        p.push(0);
        udp_frame(PEER_IP, DEV_IP, 50000, TFTP_PORT, &p)
    }

    fn ack_frame(block: u16, src_port: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&OP_ACK.to_be_bytes());
        p.extend_from_slice(&block.to_be_bytes());
        udp_frame(PEER_IP, DEV_IP, src_port, TFTP_PORT, &p)
    }

    /// Answer the ARP request the first transmit triggers, so the data
    /// frames flow. Returns the flushed first frame.
    fn resolve_peer(rig: &mut Rig) -> Vec<u8> {
        let req = transmitted(rig).expect("expected ARP request first");
        assert_eq!(&req[12..14], &crate::wire::ETHERTYPE_ARP.to_be_bytes());
        let reply = arp_frame(2, PEER_MAC, PEER_IP, DEV_MAC, DEV_IP);
        inject(rig, &reply);
        deliver_pending(rig);
        transmitted(rig).expect("queued frame after resolution")
    }

    fn tftp_payload(frame: &[u8]) -> &[u8] {
        &frame[14 + 20 + 8..]
    }

    #[test]
    fn read_of_1025_bytes_takes_three_blocks() {
        let mut rig = tftp_rig(1025);
        inject(&mut rig, &rrq(b"boot.bin"));
        deliver_pending(&mut rig);

        // DATA 1: 512 bytes (behind ARP resolution of the new peer).
        let f = resolve_peer(&mut rig);
        let p = tftp_payload(&f);
        assert_eq!(&p[0..2], &OP_DATA.to_be_bytes());
        assert_eq!(&p[2..4], &1u16.to_be_bytes());
        assert_eq!(p.len() - 4, 512);

        inject(&mut rig, &ack_frame(1, 50000));
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("no DATA 2");
        let p = tftp_payload(&f);
        assert_eq!(&p[2..4], &2u16.to_be_bytes());
        assert_eq!(p.len() - 4, 512);

        inject(&mut rig, &ack_frame(2, 50000));
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("no DATA 3");
        let p = tftp_payload(&f);
        assert_eq!(&p[2..4], &3u16.to_be_bytes());
        assert_eq!(p.len() - 4, 1);
        assert_eq!(p[4], 0); // 1024 % 256

        // Final ACK clears the connection.
        inject(&mut rig, &ack_frame(3, 50000));
        deliver_pending(&mut rig);
        assert!(!rig.stack.tftp_server().unwrap().busy());
    }

    #[test]
    fn wrong_tid_gets_error_without_breaking_transfer() {
        let mut rig = tftp_rig(100);
        inject(&mut rig, &rrq(b"boot.bin"));
        deliver_pending(&mut rig);
        let _data1 = resolve_peer(&mut rig);

        // A second client barges in with an ACK from a different port.
        inject(&mut rig, &ack_frame(1, 50001));
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("no error reply");
        let p = tftp_payload(&f);
        assert_eq!(&p[0..2], &OP_ERR.to_be_bytes());
        assert_eq!(&p[2..4], &ERR_UNKNOWN_TID.to_be_bytes());
        // Original transfer still alive.
        assert!(rig.stack.tftp_server().unwrap().busy());
    }

    #[test]
    fn missing_file_answers_not_found() {
        let mut rig = tftp_rig(10);
        inject(&mut rig, &rrq(b"nope.bin"));
        deliver_pending(&mut rig);
        let f = resolve_peer(&mut rig);
        let p = tftp_payload(&f);
        assert_eq!(&p[0..2], &OP_ERR.to_be_bytes());
        assert_eq!(&p[2..4], &ERR_NOT_FOUND.to_be_bytes());
        assert!(!rig.stack.tftp_server().unwrap().busy());
    }

    #[test]
    fn write_request_round_trip() {
        let mut rig = tftp_rig(0);
        let mut p = Vec::new();
        p.extend_from_slice(&OP_WRQ.to_be_bytes());
        p.extend_from_slice(b"upload.bin");
        p.push(0);
        p.extend_from_slice(b"octet");
        p.push(0);
        inject(
            &mut rig,
            &udp_frame(PEER_IP, DEV_IP, 50000, TFTP_PORT, &p),
        );
        deliver_pending(&mut rig);
        let f = resolve_peer(&mut rig);
        let a = tftp_payload(&f);
        assert_eq!(&a[0..2], &OP_ACK.to_be_bytes());
        assert_eq!(&a[2..4], &0u16.to_be_bytes());

        // One short data block ends the transfer.
        let mut d = Vec::new();
        d.extend_from_slice(&OP_DATA.to_be_bytes());
        d.extend_from_slice(&1u16.to_be_bytes());
        d.extend_from_slice(b"tiny payload");
        inject(
            &mut rig,
            &udp_frame(PEER_IP, DEV_IP, 50000, TFTP_PORT, &d),
        );
        deliver_pending(&mut rig);
        let f = transmitted(&mut rig).expect("no final ACK");
        let a = tftp_payload(&f);
        assert_eq!(&a[0..2], &OP_ACK.to_be_bytes());
        assert_eq!(&a[2..4], &1u16.to_be_bytes());
        assert!(!rig.stack.tftp_server().unwrap().busy());
    }

    #[test]
    fn idle_transaction_times_out() {
        let mut rig = tftp_rig(100);
        inject(&mut rig, &rrq(b"boot.bin"));
        deliver_pending(&mut rig);
        let _ = resolve_peer(&mut rig);
        assert!(rig.stack.tftp_server().unwrap().busy());

        let timeout = rig.stack.tftp_cfg.timeout;
        let deadline = rig.k.now().offset(timeout);
        rig.k.tick(deadline);
        timer(&mut rig.stack, &mut rig.k);
        assert!(!rig.stack.tftp_server().unwrap().busy());
    }
}
