//! Typed adapter between the 6P machine and the TSCH schedule table.
//!
//! The table itself belongs to the slot engine; this module owns the
//! translation from wire-level [`CellOptions`] to typed link parameters,
//! the availability predicates the response handler runs over proposed
//! cell lists, and the deterministic auto-cell placement used to bootstrap
//! unicast traffic before any 6P exchange has happened.

use crate::net::ieee802154::MacAddress;
use crate::net::sixtop::frame::{CellList, CellOptions};
use crate::Error;

/// Direction class of a scheduled cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Tx,
    Rx,
    TxRx,
}

/// Typed parameters of one schedule entry, as the slot engine understands
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSpec {
    pub cell_type: CellType,
    pub shared: bool,
    pub anycast: bool,
    /// ACK backoff rank for anycast receivers: 0 answers immediately, 1
    /// defers one slot. Always 0 for non-anycast cells.
    pub priority: u8,
}

/// Snapshot of one occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub link_type: CellType,
    pub shared: bool,
    pub anycast: bool,
    /// Installed by the bootstrap auto-cell rule rather than by 6P.
    pub auto: bool,
    pub priority: u8,
    pub neighbor: MacAddress,
}

/// Contract of the external schedule table.
pub trait ScheduleTable {
    fn frame_length(&self) -> u16;

    fn num_free_entries(&self) -> u16;

    fn is_slot_free(&self, slot_offset: u16) -> bool;

    /// Installs a cell. Returns false when the slot is occupied or the
    /// table is full.
    fn add_slot(
        &mut self,
        slot_offset: u16,
        spec: LinkSpec,
        auto: bool,
        channel_offset: u16,
        neighbor1: MacAddress,
        neighbor2: MacAddress,
    ) -> bool;

    /// Removes a cell matching type, shared flag and neighbor. Returns
    /// false when no such cell exists at the offset.
    fn remove_slot(
        &mut self,
        slot_offset: u16,
        cell_type: CellType,
        shared: bool,
        neighbor: MacAddress,
    ) -> bool;

    fn slot_info(&self, slot_offset: u16) -> Option<SlotInfo>;

    /// Next negotiated (non-auto) cell of `cell_type` to `neighbor` at or
    /// after `start_offset`, as `(slot, channel, priority)`.
    fn next_matching(
        &self,
        start_offset: u16,
        neighbor: MacAddress,
        cell_type: CellType,
    ) -> Option<(u16, u16, u8)>;

    /// Drops every cell scheduled with `neighbor`, negotiated or auto.
    fn remove_all_to(&mut self, neighbor: MacAddress);
}

/// Maps a wire options byte onto typed link parameters.
///
/// Exactly seven combinations are legal; anything else is a protocol
/// error answered on the wire:
///
/// | options                     | type | shared | anycast | priority |
/// |-----------------------------|------|--------|---------|----------|
/// | TX                          | TX   | no     | no      | 0        |
/// | RX                          | RX   | no     | no      | 0        |
/// | TX\|RX\|SHARED              | TXRX | yes    | no      | 0        |
/// | TX\|ANYCAST[\|PRIORITY]     | TX   | no     | yes     | 0 or 1   |
/// | RX\|ANYCAST[\|PRIORITY]     | RX   | no     | yes     | 0 or 1   |
pub fn translate_options(options: CellOptions) -> Result<LinkSpec, Error> {
    let priority = if options.contains(CellOptions::PRIORITY) {
        1
    } else {
        0
    };
    // PRIORITY qualifies anycast cells only.
    if priority != 0 && !options.contains(CellOptions::ANYCAST) {
        return Err(Error::Protocol);
    }
    match options & !CellOptions::PRIORITY {
        o if o == CellOptions::TX => Ok(LinkSpec {
            cell_type: CellType::Tx,
            shared: false,
            anycast: false,
            priority: 0,
        }),
        o if o == CellOptions::RX => Ok(LinkSpec {
            cell_type: CellType::Rx,
            shared: false,
            anycast: false,
            priority: 0,
        }),
        o if o == CellOptions::TX | CellOptions::RX | CellOptions::SHARED => Ok(LinkSpec {
            cell_type: CellType::TxRx,
            shared: true,
            anycast: false,
            priority: 0,
        }),
        o if o == CellOptions::TX | CellOptions::ANYCAST => Ok(LinkSpec {
            cell_type: CellType::Tx,
            shared: false,
            anycast: true,
            priority,
        }),
        o if o == CellOptions::RX | CellOptions::ANYCAST => Ok(LinkSpec {
            cell_type: CellType::Rx,
            shared: false,
            anycast: true,
            priority,
        }),
        _ => Err(Error::Protocol),
    }
}

/// A requester's TX is the responder's RX and vice versa; the other bits
/// describe the cell itself and are shared by both views.
pub fn flip_direction(options: CellOptions) -> CellOptions {
    let mut flipped = options & !(CellOptions::TX | CellOptions::RX);
    if options.contains(CellOptions::TX) {
        flipped |= CellOptions::RX;
    }
    if options.contains(CellOptions::RX) {
        flipped |= CellOptions::TX;
    }
    flipped
}

/// Filters `cells` down to entries that can actually be scheduled: an
/// in-use entry survives iff its slot is free, and at most `max` survive
/// (later survivors are marked unused, not dropped, so the response can
/// echo positions faithfully). True iff at least one entry survived.
pub fn are_available_to_schedule<S: ScheduleTable>(
    schedule: &S,
    max: u8,
    cells: &mut CellList,
) -> bool {
    let mut kept = 0u8;
    for cell in cells.iter_mut() {
        if !cell.in_use {
            continue;
        }
        if kept >= max || !schedule.is_slot_free(cell.slot_offset) {
            cell.in_use = false;
        } else {
            kept += 1;
        }
    }
    kept > 0
}

/// Checks that every in-use entry of `cells` names an existing cell of the
/// requested type with `neighbor`. Unlike scheduling, removal is
/// all-or-nothing: one mismatch fails the whole set.
pub fn are_available_to_remove<S: ScheduleTable>(
    schedule: &S,
    max: u8,
    cells: &mut CellList,
    neighbor: MacAddress,
    spec: &LinkSpec,
) -> bool {
    let mut kept = 0u8;
    for cell in cells.iter_mut() {
        if !cell.in_use {
            continue;
        }
        if kept >= max {
            cell.in_use = false;
            continue;
        }
        match schedule.slot_info(cell.slot_offset) {
            Some(info) if info.link_type == spec.cell_type && info.neighbor == neighbor => {
                kept += 1;
            }
            _ => return false,
        }
    }
    kept > 0
}

/// Installs every in-use entry of `cells`. Entries marked unused are never
/// installed. Returns the number installed.
pub fn add_cells<S: ScheduleTable>(
    schedule: &mut S,
    cells: &CellList,
    spec: LinkSpec,
    neighbor1: MacAddress,
    neighbor2: MacAddress,
) -> usize {
    let mut n = 0;
    for cell in cells.iter().filter(|c| c.in_use) {
        if schedule.add_slot(
            cell.slot_offset,
            spec,
            false,
            cell.channel_offset,
            neighbor1,
            neighbor2,
        ) {
            n += 1;
        } else {
            log::warn!(
                "schedule rejected cell ({},{})",
                cell.slot_offset,
                cell.channel_offset
            );
        }
    }
    n
}

/// Removes every in-use entry of `cells`. Returns the number removed.
pub fn remove_cells<S: ScheduleTable>(
    schedule: &mut S,
    cells: &CellList,
    spec: LinkSpec,
    neighbor: MacAddress,
) -> usize {
    let mut n = 0;
    for cell in cells.iter().filter(|c| c.in_use) {
        if schedule.remove_slot(cell.slot_offset, spec.cell_type, spec.shared, neighbor) {
            n += 1;
        }
    }
    n
}

/// Slots below this offset are left to shared/EB traffic and never chosen
/// for auto cells.
pub const AUTOCELL_SLOT_BASE: u16 = 4;

/// Channel offsets available to the hopping sequence.
pub const NUM_CHANNELS: u16 = 16;

/// Deterministic auto-cell placement: both ends derive the same
/// `(slot, channel)` from the peer's EUI-64 alone, so bootstrap traffic
/// has a TX cell before any 6P exchange is possible.
pub fn autocell_offsets(eui64: [u8; 8], frame_length: u16) -> (u16, u16) {
    // FNV-1a fold over the address bytes.
    let mut h: u32 = 0x811c_9dc5;
    for b in eui64 {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    let span = frame_length.saturating_sub(AUTOCELL_SLOT_BASE).max(1) as u32;
    let slot = AUTOCELL_SLOT_BASE + (h % span) as u16;
    let channel = ((h >> 16) % NUM_CHANNELS as u32) as u16;
    (slot, channel)
}
