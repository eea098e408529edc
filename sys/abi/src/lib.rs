// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI definitions for the Kestrel kernel and the layers above it.
//!
//! Everything here is deliberately small and dependency-free: status codes
//! with stable numeric values, the kernel time unit, task priorities, and
//! the configuration records tunable at system bring-up.

#![cfg_attr(not(test), no_std)]

/// Status codes returned across every public kernel and driver surface.
///
/// The numeric values are part of the ABI: external tooling that parses
/// status codes out of traces or wire dumps relies on them, so variants may
/// be added but never renumbered. `Ok(())` stands in for the original
/// `SUCCESS (0)`.
///
/// Note that [`Error::NetBufferConsumed`] is not a failure. It signals that
/// ownership of a buffer passed down the stack was transferred; the caller
/// must not free or reuse the buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    /// A timed wait elapsed before the condition was satisfied.
    ConditionTimeout = -800,
    /// The waited-on object was torn down while tasks were parked on it.
    ConditionDeleted = -801,

    /// An ioctl command the backend does not implement.
    FsInvalidCommand = -901,
    /// The buffer pool cannot supply a chunk (or list) right now.
    FsBufferNoSpace = -902,
    /// A fixed-capacity kernel table is full.
    FsNoResource = -903,
    /// Non-blocking descriptor could not make progress.
    FsWouldBlock = -904,
    /// Descriptor lock is held by another task (non-blocking acquire).
    FsLockBusy = -905,

    /// Ownership of the buffer moved down the stack. Not a failure.
    NetBufferConsumed = -1000,
    /// Frame too short or malformed for the expected header.
    NetInvalidHeader = -1001,
    /// Header checksum mismatch.
    NetInvalidChecksum = -1002,
    /// No interface or route can reach the destination address.
    NetDstUnreachable = -1003,
    /// No listener bound to the destination port.
    NetDstPortUnreachable = -1004,
    /// The pool reserve would be breached; retry later.
    NetThreshold = -1005,
    /// Interface is administratively or physically down.
    NetLinkDown = -1006,
    /// Frame arrived from a source the stack refuses to talk to.
    NetUnknownSource = -1007,
    /// No address has been configured on the receiving interface.
    NetNoAddress = -1008,

    /// Backing store rejected a TFTP read or write.
    TftpFsError = -1100,
    /// Packet from a transfer ID other than the bound client.
    TftpUnknownTid = -1101,
    /// DATA/ACK block number outside the window.
    TftpBlockOutOfBounds = -1102,
    /// Frame was valid but dropped (duplicate, stale, or unsolicited).
    TftpFrameDrop = -1103,
    /// A transfer is already in progress.
    TftpExhausted = -1104,
    /// Request filename exceeds the server's buffer.
    TftpLongFilename = -1105,

    /// Console cursor moved past the last row.
    LcdRowFull = -1300,
}

impl Error {
    /// Returns the stable integer form of this code, for trace consumers.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Shorthand result type used across the kernel crates.
pub type KResult<T> = core::result::Result<T, Error>;

/// System timer rate. Protocol code uses this to convert wire-format
/// second counts into ticks.
pub const TICKS_PER_SEC: u32 = 100;

/// Kernel time, measured in ticks of the system timer.
///
/// Ticks are 32 bits and wrap; all comparisons must go through
/// [`Tick::since`], which computes a signed difference and therefore stays
/// correct across the wrap as long as the two instants are within half the
/// tick space of one another.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Tick(pub u32);

impl Tick {
    /// Signed distance from `earlier` to `self`, wrap-safe.
    pub fn since(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// True if `self` is at or past `deadline`.
    pub fn reached(self, deadline: Tick) -> bool {
        self.since(deadline) >= 0
    }

    /// The instant `delay` ticks after `self`.
    pub fn offset(self, delay: u32) -> Tick {
        Tick(self.0.wrapping_add(delay))
    }
}

/// Scheduling priority of a task or a suspend record.
///
/// Numerically lower priorities are more important, so `Priority(0)` always
/// wins a wakeup race. This matches the ordering used by the sorted ready
/// queue and by multi-condition resume arbitration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Default for Priority {
    /// The least important priority; what a suspend record gets when its
    /// caller does not care about arbitration order.
    fn default() -> Self {
        Priority::IDLE
    }
}

impl Priority {
    /// Priority given to a suspend record that has not expressed one; loses
    /// every arbitration.
    pub const IDLE: Self = Priority(u8::MAX);

    /// Checks if `self` strictly beats `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// ARP cache tuning. All times are in ticks.
#[derive(Copy, Clone, Debug)]
pub struct ArpConfig {
    /// Requests sent for an unresolved entry before it is declared dead.
    pub retry_count: u8,
    /// Delay between requests for an unresolved entry.
    pub timeout: u32,
    /// Refresh interval for an in-use resolved entry.
    pub update_time: u32,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            timeout: 1000,
            update_time: 15_000,
        }
    }
}

/// DHCP client retransmit tuning. All times are in ticks.
#[derive(Copy, Clone, Debug)]
pub struct DhcpConfig {
    /// First retransmit interval; doubles per attempt.
    pub base_timeout: u32,
    /// Ceiling the doubling saturates at.
    pub max_timeout: u32,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            base_timeout: 2000,
            max_timeout: 64_000,
        }
    }
}

/// TFTP server tuning.
#[derive(Copy, Clone, Debug)]
pub struct TftpConfig {
    /// Ticks a transaction may sit idle before the connection is cleared.
    pub timeout: u32,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self { timeout: 5000 }
    }
}
