//! Shared packet pool between the 6top layer, upper layers and the MAC.
//!
//! Every in-flight frame lives in a fixed-size [`PacketEntry`]; ownership is
//! tracked explicitly with [`Component`] tags rather than by moving buffers
//! around. A component that wants to transmit fills an entry and writes
//! `owner = Component::SixtopToMac`, the handoff sentinel; the MAC claims
//! such entries through `Sixtop::next_ready_frame` and reports completion
//! with the entry's handle. At most one component mutates an entry at a
//! time.
//!
//! Headers are built by prepending: the payload window starts empty at the
//! tail of the buffer and grows toward the front, with an explicit bounds
//! check on every reservation. Parsed headers are consumed by advancing the
//! window start.

use crate::net::ieee802154::{FrameKind, KeyId, MacAddress, SecurityLevel};
use crate::Error;

/// Buffer space per pool entry. Covers one 802.15.4 frame payload.
pub const PACKET_BUF_LEN: usize = 128;

/// Number of entries in the pool.
pub const POOL_SIZE: usize = 10;

/// Components that can create or own a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Entry is free.
    Null,
    /// 6top-originated traffic: 6P requests, EBs, KAs.
    Sixtop,
    /// 6P responses, tracked separately so the outstanding-response limit
    /// can be enforced by scanning the pool.
    SixtopRes,
    /// Handoff sentinel: filled and ready for the radio.
    SixtopToMac,
    /// Claimed by the MAC (transmitting, or holding a received frame).
    Mac,
    /// Upper-layer payload handed down through `send`.
    Upper,
}

/// One pool slot: buffer window plus the link metadata the MAC and the 6P
/// machine need to carry alongside it.
#[derive(Debug)]
pub struct PacketEntry {
    pub creator: Component,
    pub owner: Component,
    pub l2_dest: MacAddress,
    pub kind: FrameKind,
    pub security: Option<(SecurityLevel, KeyId)>,
    pub payload_ie: bool,
    pub retries_left: u8,
    /// Offset within the payload where the MAC patches the current ASN at
    /// transmit time (EBs only).
    pub asn_offset: Option<usize>,

    // 6P shadow fields, mirrored from the frame so send-done handling does
    // not have to re-parse the buffer. Wire encoding, 0 = unset.
    pub six_command: u8,
    pub six_return_code: u8,
    pub six_frame_id: u8,
    pub six_cell_options: u8,

    buf: [u8; PACKET_BUF_LEN],
    start: usize,
    end: usize,
}

impl PacketEntry {
    fn new() -> PacketEntry {
        PacketEntry {
            creator: Component::Null,
            owner: Component::Null,
            l2_dest: MacAddress::None,
            kind: FrameKind::Data,
            security: None,
            payload_ie: false,
            retries_left: 0,
            asn_offset: None,
            six_command: 0,
            six_return_code: 0,
            six_frame_id: 0,
            six_cell_options: 0,
            buf: [0; PACKET_BUF_LEN],
            start: PACKET_BUF_LEN,
            end: PACKET_BUF_LEN,
        }
    }

    fn reset(&mut self, creator: Component) {
        *self = PacketEntry::new();
        self.creator = creator;
        self.owner = creator;
    }

    pub fn is_free(&self) -> bool {
        self.owner == Component::Null
    }

    /// The assembled frame payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn payload_len(&self) -> usize {
        self.end - self.start
    }

    /// Reserves `bytes.len()` bytes in front of the current payload and
    /// copies `bytes` there.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.start {
            return Err(Error::Overflow);
        }
        self.start -= bytes.len();
        self.buf[self.start..self.start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn prepend_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.prepend(&[byte])
    }

    /// Fills the payload window with `bytes` wholesale (receive path).
    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > PACKET_BUF_LEN {
            return Err(Error::Overflow);
        }
        self.start = PACKET_BUF_LEN - bytes.len();
        self.end = PACKET_BUF_LEN;
        self.buf[self.start..].copy_from_slice(bytes);
        Ok(())
    }

    /// Drops `n` consumed header bytes from the front of the payload.
    pub fn toss_header(&mut self, n: usize) -> Result<(), Error> {
        if self.start + n > self.end {
            return Err(Error::Overflow);
        }
        self.start += n;
        Ok(())
    }
}

/// Index handle for a pool entry. Valid until the entry is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHandle(u8);

pub struct PacketPool {
    entries: [PacketEntry; POOL_SIZE],
}

impl PacketPool {
    pub fn new() -> PacketPool {
        PacketPool {
            entries: core::array::from_fn(|_| PacketEntry::new()),
        }
    }

    /// Claims a free entry for `creator`, or fails with `NoBuffer`.
    pub fn allocate(&mut self, creator: Component) -> Result<PacketHandle, Error> {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.is_free() {
                entry.reset(creator);
                return Ok(PacketHandle(i as u8));
            }
        }
        log::warn!("packet pool exhausted ({:?})", creator);
        Err(Error::NoBuffer)
    }

    pub fn free(&mut self, handle: PacketHandle) {
        self.entries[handle.0 as usize].reset(Component::Null);
    }

    pub fn get(&self, handle: PacketHandle) -> &PacketEntry {
        &self.entries[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: PacketHandle) -> &mut PacketEntry {
        &mut self.entries[handle.0 as usize]
    }

    /// First in-use entry matching `pred`, scanning in slot order.
    pub fn find<F: Fn(&PacketEntry) -> bool>(&self, pred: F) -> Option<PacketHandle> {
        self.entries
            .iter()
            .position(|e| !e.is_free() && pred(e))
            .map(|i| PacketHandle(i as u8))
    }

    pub fn count<F: Fn(&PacketEntry) -> bool>(&self, pred: F) -> usize {
        self.entries.iter().filter(|e| !e.is_free() && pred(e)).count()
    }

    /// Frees every in-use entry matching `pred`; returns how many.
    pub fn free_matching<F: Fn(&PacketEntry) -> bool>(&mut self, pred: F) -> usize {
        let mut n = 0;
        for entry in self.entries.iter_mut() {
            if !entry.is_free() && pred(entry) {
                entry.reset(Component::Null);
                n += 1;
            }
        }
        n
    }

    pub fn num_free(&self) -> usize {
        self.entries.iter().filter(|e| e.is_free()).count()
    }
}
