//! Management scheduler: periodic Enhanced Beacon and Keep-Alive emission.
//!
//! Two timers drive this path. The EB timer fires once per slotframe and
//! attempts a beacon with probability `1/eb_portion`, but only while the
//! node is a useful network member (synchronized, keyed, ranked, DAO
//! sent); outside that window every sixtop-authored frame still queued is
//! flushed so a desynchronized node goes quiet. The maintenance timer runs
//! on a per-node jittered period; every 30th tick ages the neighbor table,
//! every other tick offers a Keep-Alive to whichever neighbor the table
//! nominates, provided a negotiated TX cell to it exists.
//!
//! The EB payload is a fixed MLME IE template. The slotframe length is
//! patched in here; the ASN and join metric are left for the MAC to patch
//! at transmit time through the offset recorded in the packet entry.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use rand_core::RngCore;

use crate::net::ieee802154::{FrameKind, MacAddress, SHORT_BROADCAST};
use crate::net::neighbors::NeighborTable;
use crate::packet::Component;
use crate::time::TimerService;

use super::schedule::{CellType, ScheduleTable};
use super::sf::SchedulingFunction;
use super::{NodeState, Sixtop};

/// MLME payload IE bytestream of an Enhanced Beacon: TSCH synchronization,
/// slotframe and link, timeslot template and channel hopping sub-IEs.
/// Mutable fields are patched through the offsets below.
pub const EB_IES: [u8; 28] = [
    0x1a, 0x88, // MLME payload IE, 26 content bytes
    0x06, 0x1a, // sync sub-IE, 6 bytes
    0x00, 0x00, 0x00, 0x00, 0x00, // ASN, patched by the MAC
    0x00, // join metric, patched by the MAC
    0x0a, 0x1b, // slotframe and link sub-IE, 10 bytes
    0x01, // one slotframe
    0x00, // slotframe handle
    0x00, 0x00, // slotframe length, patched here
    0x01, // one link
    0x00, 0x00, // slot offset 0
    0x00, 0x00, // channel offset 0
    0x0f, // TX|RX|shared|timekeeping
    0x01, 0x1c, // timeslot sub-IE, 1 byte
    0x00, // timeslot template id
    0x01, 0xc8, // channel hopping sub-IE (long form), 1 byte
    0x00, // hopping sequence id
];

/// Offset of the 5-byte ASN field within [`EB_IES`].
pub const EB_ASN_OFFSET: usize = 4;
/// Offset of the join metric byte within [`EB_IES`].
pub const EB_JOIN_METRIC_OFFSET: usize = 9;
/// Offset of the 2-byte slotframe length within [`EB_IES`].
pub const EB_SLOTFRAME_LEN_OFFSET: usize = 14;

impl<S, N, T, F, X, R> Sixtop<S, N, T, F, X, R>
where
    S: ScheduleTable,
    N: NeighborTable,
    T: TimerService,
    F: SchedulingFunction,
    X: NodeState,
    R: RngCore,
{
    pub(super) fn eb_timer_fired(&mut self) {
        let advertising = self.node.is_synchronized()
            && self.node.security_enabled()
            && self.node.dag_rank() != self.node.default_dag_rank()
            && self.node.dao_sent();
        if !advertising {
            self.flush_own_traffic();
            return;
        }
        if self.rng.next_u32() % self.config.eb_portion != 0 {
            return;
        }
        if self.busy_sending_eb {
            return;
        }
        let Ok(handle) = self.pool.allocate(Component::Sixtop) else {
            return;
        };
        let frame_length = self.schedule.frame_length();
        let mut ies = EB_IES;
        LittleEndian::write_u16(
            &mut ies[EB_SLOTFRAME_LEN_OFFSET..EB_SLOTFRAME_LEN_OFFSET + 2],
            frame_length,
        );
        if self.pool.get_mut(handle).prepend(&ies).is_err() {
            self.pool.free(handle);
            return;
        }
        {
            let pkt = self.pool.get_mut(handle);
            pkt.kind = FrameKind::Beacon;
            pkt.l2_dest = MacAddress::Short(SHORT_BROADCAST);
            pkt.payload_ie = true;
            pkt.asn_offset = Some(EB_ASN_OFFSET);
        }
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);
        self.busy_sending_eb = true;
        debug!("EB queued (slotframe length {})", frame_length);
    }

    pub(super) fn maintenance_timer_fired(&mut self) {
        self.maintenance_counter = (self.maintenance_counter + 1) % super::MAINTENANCE_PERIOD_TICKS;
        if self.maintenance_counter == 0 {
            self.neighbors.age();
            return;
        }
        self.try_send_ka();
    }

    fn try_send_ka(&mut self) {
        if self.busy_sending_ka || !self.node.is_synchronized() {
            return;
        }
        let Some(parent) = self.neighbors.ka_neighbor(self.config.ka_period_ms) else {
            return;
        };
        if self
            .schedule
            .next_matching(0, parent, CellType::Tx)
            .is_none()
        {
            debug!("no negotiated TX cell to {:?}, skipping KA", parent);
            return;
        }
        let Ok(handle) = self.pool.allocate(Component::Sixtop) else {
            return;
        };
        {
            let pkt = self.pool.get_mut(handle);
            pkt.kind = FrameKind::Data;
            pkt.l2_dest = parent;
        }
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);
        self.busy_sending_ka = true;
        debug!("KA queued to {:?}", parent);
    }

    /// A node that may not advertise also must not keep stale management
    /// or 6P traffic queued: drop everything this layer authored that the
    /// MAC has not picked up yet, and collapse the bookkeeping that
    /// referred to it.
    fn flush_own_traffic(&mut self) {
        let flushed = self.pool.free_matching(|p| {
            p.owner == Component::SixtopToMac
                && matches!(p.creator, Component::Sixtop | Component::SixtopRes)
        });
        if flushed > 0 {
            debug!("flushed {} queued sixtop frame(s)", flushed);
        }
        self.busy_sending_eb = false;
        self.busy_sending_ka = false;
        if self.pool.count(|p| p.creator == Component::SixtopRes) == 0 {
            self.pending_response = None;
        }
        if !self.txn.is_idle() {
            self.finish_txn();
        }
    }
}
