//! 6top sublayer core: the 6P transaction machine and the packet paths
//! feeding it.
//!
//! The [`Sixtop`] struct holds all of the layer's state and is driven by
//! five entry points, each running to completion on the caller's task:
//!
//! - [`Sixtop::request`]: a Scheduling Function starts a 6P transaction
//!   (the request originator).
//! - [`Sixtop::send`]: an upper layer hands down a data packet; the unicast
//!   path installs a bootstrap auto cell when no TX cell to the peer exists
//!   yet.
//! - [`Sixtop::notify_send_done`]: the MAC finished (or gave up on) a frame
//!   this layer queued.
//! - [`Sixtop::notify_receive`]: the MAC delivered a 6P frame; requests go
//!   to the response handler, responses to the transaction machine.
//! - [`Sixtop::timer_fired`]: timeouts and the periodic management timers.
//!
//! Outbound frames are not pushed anywhere: the layer marks pool entries
//! ready (`owner = SixtopToMac`) and the MAC claims them through
//! [`Sixtop::next_ready_frame`], mirroring the shared-queue handoff of
//! TSCH stacks.
//!
//! A transaction's schedule mutations are applied at the last possible
//! moment on each side: the initiator applies on accepting a successful
//! response, the responder when its response's send-done reports an ack.
//! The per-link sequence number advances at the same two points and
//! nowhere else, which keeps both ends' schedules and seqnums consistent
//! under any single failure.

use log::{debug, info, warn};
use rand_core::RngCore;

use crate::net::ieee802154::{FrameKind, MacAddress, PanId, SecurityLevel};
use crate::net::neighbors::NeighborTable;
use crate::packet::{Component, PacketEntry, PacketHandle, PacketPool, PACKET_BUF_LEN};
use crate::time::{TimerId, TimerService};
use crate::Error;

pub mod frame;
pub mod fsm;
pub mod mgmt;
pub mod schedule;
pub mod sf;

#[cfg(test)]
mod tests;

use frame::{
    CellList, CellOptions, Command, MsgType, Parsed, RequestFields, ResponseFields, ReturnCode,
    IANA_6TOP_6P_VERSION,
};
use fsm::{TxnContext, TxnState};
use schedule::{
    add_cells, are_available_to_remove, are_available_to_schedule, autocell_offsets,
    flip_direction, remove_cells, translate_options, CellType, LinkSpec, ScheduleTable,
};
use sf::{MetadataKind, SchedulingFunction};

/// Outstanding 6P responses allowed before inbound requests are dropped.
pub const MAX_6P_RESPONSES: usize = 1;

/// Maintenance timer counter modulus; counter value 0 runs neighbor aging,
/// every other tick attempts a Keep-Alive.
pub const MAINTENANCE_PERIOD_TICKS: u8 = 30;

/// Base of the jittered maintenance period; the actual period is drawn
/// uniformly from `[872, 872 + 255]` ms at construction.
pub const MAINTENANCE_BASE_MS: u32 = 872;

/// Static configuration of the sublayer.
#[derive(Debug, Clone)]
pub struct Config {
    pub pan_id: PanId,
    /// Handle of the slotframe all 6P transactions refer to.
    pub slotframe_handle: u8,
    pub slot_duration_ms: u32,
    /// An EB is attempted with probability `1 / eb_portion` per EB timer
    /// fire.
    pub eb_portion: u32,
    /// Link-quiet interval handed to the neighbor table when choosing a
    /// Keep-Alive target.
    pub ka_period_ms: u32,
    /// Response-wait timeout of the transaction machine.
    pub sixtop_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pan_id: 0xcafe,
            slotframe_handle: 0,
            slot_duration_ms: 15,
            eb_portion: 4,
            ka_period_ms: 2000,
            sixtop_timeout_ms: 8000,
        }
    }
}

/// Node-wide state consulted when gating management traffic and stamping
/// security attributes. Owned by the stack outside this crate.
pub trait NodeState {
    fn is_synchronized(&self) -> bool;

    /// Whether the security module holds usable keys.
    fn security_enabled(&self) -> bool;

    fn dag_rank(&self) -> u16;

    /// Rank value meaning "not part of a DAG yet".
    fn default_dag_rank(&self) -> u16 {
        0xffff
    }

    fn dao_sent(&self) -> bool;

    /// Security level and key index for a frame of the given kind.
    fn security(&self, kind: FrameKind) -> Option<(SecurityLevel, u8)>;
}

/// Arguments of [`Sixtop::request`], mirroring the 6P request fields the
/// Scheduling Function controls.
pub struct RequestParams<'a> {
    pub command: Command,
    pub neighbor: MacAddress,
    /// Second receiver of a dual-parent (anycast) ADD; `None` otherwise.
    pub neighbor2: MacAddress,
    pub num_cells: u8,
    pub options: CellOptions,
    pub add_cells: Option<&'a CellList>,
    pub del_cells: Option<&'a CellList>,
    pub sfid: u8,
    pub list_offset: u16,
    pub list_max_cells: u16,
}

/// Deferred effect of a 6P response this node sent: schedule mutations and
/// the seqnum advance happen only when the response is acked on the wire.
struct PendingResponse {
    command: Option<Command>,
    code: ReturnCode,
    peer: MacAddress,
    /// Second receiver identity, set when answering as the middle node of
    /// a 3-step handshake.
    peer2: MacAddress,
    /// Requester-view options of the transaction.
    options: CellOptions,
    cells: CellList,
    del_cells: CellList,
}

/// The 6top sublayer. One value per node; see the module docs for the
/// event model.
pub struct Sixtop<S, N, T, F, X, R>
where
    S: ScheduleTable,
    N: NeighborTable,
    T: TimerService,
    F: SchedulingFunction,
    X: NodeState,
    R: RngCore,
{
    config: Config,
    pool: PacketPool,
    txn: TxnContext,
    pending_response: Option<PendingResponse>,
    schedule: S,
    neighbors: N,
    timers: T,
    sf: F,
    node: X,
    rng: R,
    eb_timer: TimerId,
    maintenance_timer: TimerId,
    maintenance_counter: u8,
    busy_sending_eb: bool,
    busy_sending_ka: bool,
}

impl<S, N, T, F, X, R> Sixtop<S, N, T, F, X, R>
where
    S: ScheduleTable,
    N: NeighborTable,
    T: TimerService,
    F: SchedulingFunction,
    X: NodeState,
    R: RngCore,
{
    pub fn new(
        config: Config,
        schedule: S,
        neighbors: N,
        mut timers: T,
        sf: F,
        node: X,
        mut rng: R,
    ) -> Self {
        let eb_timer =
            timers.start_periodic(schedule.frame_length() as u32 * config.slot_duration_ms);
        let maintenance_timer =
            timers.start_periodic(MAINTENANCE_BASE_MS + (rng.next_u32() & 0xff));
        Sixtop {
            config,
            pool: PacketPool::new(),
            txn: TxnContext::new(),
            pending_response: None,
            schedule,
            neighbors,
            timers,
            sf,
            node,
            rng,
            eb_timer,
            maintenance_timer,
            maintenance_counter: 0,
            busy_sending_eb: false,
            busy_sending_ka: false,
        }
    }

    pub fn txn_state(&self) -> TxnState {
        self.txn.state
    }

    pub fn schedule(&self) -> &S {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut S {
        &mut self.schedule
    }

    pub fn neighbors(&self) -> &N {
        &self.neighbors
    }

    pub fn neighbors_mut(&mut self) -> &mut N {
        &mut self.neighbors
    }

    /// Handle of the armed response-wait timeout, if any.
    pub fn txn_timeout(&self) -> Option<TimerId> {
        self.txn.timeout_timer
    }

    pub fn sf(&self) -> &F {
        &self.sf
    }

    pub fn sf_mut(&mut self) -> &mut F {
        &mut self.sf
    }

    pub fn pool_mut(&mut self) -> &mut PacketPool {
        &mut self.pool
    }

    pub fn packet(&self, handle: PacketHandle) -> &PacketEntry {
        self.pool.get(handle)
    }

    /// Hands the next frame this layer queued to the MAC, transferring
    /// ownership of the entry.
    pub fn next_ready_frame(&mut self) -> Option<PacketHandle> {
        let h = self.pool.find(|p| p.owner == Component::SixtopToMac)?;
        self.pool.get_mut(h).owner = Component::Mac;
        Some(h)
    }

    /// Upstream send: stamps data-frame attributes onto a pool entry the
    /// caller filled and queues it for the MAC.
    pub fn send(&mut self, handle: PacketHandle) -> Result<(), Error> {
        if self.pool.get(handle).l2_dest.is_none() {
            return Err(Error::NoNeighbor);
        }
        self.pool.get_mut(handle).kind = FrameKind::Data;
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);
        Ok(())
    }

    /// Starts a 6P transaction (the request originator).
    ///
    /// Fails without side effects when the transaction machine is busy,
    /// the neighbor is unusable, or no packet buffer is available. On
    /// success exactly one request frame is queued and the machine is in
    /// the command's send-done wait state.
    pub fn request(&mut self, params: &RequestParams) -> Result<(), Error> {
        if !self.txn.is_idle() {
            return Err(Error::InvalidState);
        }
        let peer = params.neighbor;
        if !peer.is_unicast() {
            return Err(Error::NoNeighbor);
        }

        // A new request replaces any unsent one still queued to this peer.
        let stale = self.pool.free_matching(|p| {
            p.creator == Component::Sixtop
                && p.owner == Component::SixtopToMac
                && p.six_command != 0
                && p.l2_dest == peer
        });
        if stale > 0 {
            debug!("preempted {} queued 6P request(s) to {:?}", stale, peer);
        }

        let mut options = params.options;
        let relay_target = if params.command == Command::Add
            && !params.neighbor2.is_none()
            && params.add_cells.is_none()
        {
            // Dual-parent reservation: the responder relays our ADD to the
            // second receiver, so its identity rides in the request.
            options |= CellOptions::ANYCAST;
            match params.neighbor2.to_eui64(self.config.pan_id) {
                Some(eui) => Some(eui),
                None => return Err(Error::NoNeighbor),
            }
        } else {
            None
        };

        let seqnum = self.neighbors.seqnum(peer);
        let metadata = self.sf.metadata();
        let handle = self.pool.allocate(Component::Sixtop)?;
        let empty = CellList::new();
        let fields = RequestFields {
            command: params.command,
            sfid: params.sfid,
            seqnum,
            metadata,
            options,
            num_cells: params.num_cells,
            add_cells: params.add_cells.unwrap_or(&empty),
            del_cells: params.del_cells.unwrap_or(&empty),
            list_offset: params.list_offset,
            list_max_cells: params.list_max_cells,
            relay_target,
        };
        if let Err(e) = frame::build_request(self.pool.get_mut(handle), &fields) {
            self.pool.free(handle);
            return Err(e);
        }
        {
            let pkt = self.pool.get_mut(handle);
            pkt.l2_dest = peer;
            pkt.kind = FrameKind::Data;
            pkt.payload_ie = true;
            pkt.six_command = params.command as u8;
            pkt.six_frame_id = self.config.slotframe_handle;
            pkt.six_cell_options = options.bits();
        }
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);

        self.txn.state = TxnState::senddone_wait(params.command);
        self.txn.neighbor_first = peer;
        self.txn.neighbor_second = params.neighbor2;
        self.txn.cell_options = options;
        if params.command == Command::Clear {
            self.txn.neighbor_clear = peer;
        }
        if let Some(del) = params.del_cells {
            self.txn.cells_to_delete = del.clone();
        }
        debug!(
            "6P {:?} -> {:?} seqnum {} ({} cells)",
            params.command, peer, seqnum, params.num_cells
        );
        Ok(())
    }

    /// MAC completion callback for any frame obtained through
    /// [`Sixtop::next_ready_frame`]. `acked` is false when the MAC
    /// exhausted its retries.
    pub fn notify_send_done(&mut self, handle: PacketHandle, acked: bool) {
        let (creator, kind, six_command, dest) = {
            let p = self.pool.get(handle);
            (p.creator, p.kind, p.six_command, p.l2_dest)
        };
        self.pool.free(handle);
        match creator {
            Component::Sixtop if six_command != 0 => {
                self.request_senddone(six_command, dest, acked)
            }
            Component::SixtopRes => self.response_senddone(acked),
            Component::Sixtop if kind == FrameKind::Beacon => self.busy_sending_eb = false,
            Component::Sixtop => self.busy_sending_ka = false,
            _ => {}
        }
    }

    /// MAC receive callback for a frame carrying a 6top payload IE. The
    /// entry's payload is consumed here; the entry is released before any
    /// handling happens.
    pub fn notify_receive(&mut self, handle: PacketHandle, src: MacAddress) {
        let mut buf = [0u8; PACKET_BUF_LEN];
        let len = {
            let payload = self.pool.get(handle).payload();
            buf[..payload.len()].copy_from_slice(payload);
            payload.len()
        };
        self.pool.free(handle);
        let bytes = &buf[..len];

        let parsed = match frame::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping 6P frame from {:?}: {:?}", src, e);
                return;
            }
        };
        let body = &bytes[parsed.header_len..];
        match parsed.msg_type {
            MsgType::Request => self.handle_request(src, &parsed, body),
            MsgType::Response => self.handle_response(src, &parsed, body),
            MsgType::Confirmation => {
                debug!("unsupported 6P confirmation from {:?}", src);
            }
        }
    }

    /// Timer service callback.
    pub fn timer_fired(&mut self, id: TimerId) {
        if id == self.eb_timer {
            self.eb_timer_fired();
        } else if id == self.maintenance_timer {
            self.maintenance_timer_fired();
        } else if self.txn.timeout_timer == Some(id) {
            self.transaction_timeout();
        } else {
            debug!("spurious timer {:?}", id);
        }
    }

    // ----- internal: outbound path ---------------------------------------

    fn stamp_security(&mut self, handle: PacketHandle) {
        let kind = self.pool.get(handle).kind;
        self.pool.get_mut(handle).security = self.node.security(kind);
    }

    /// Marks the entry ready for the MAC, installing a bootstrap auto cell
    /// first when this is unicast traffic with no TX cell to the peer.
    fn enqueue_to_mac(&mut self, handle: PacketHandle) {
        let dest = self.pool.get(handle).l2_dest;
        if dest.is_unicast() {
            self.maybe_install_autocell(dest);
        }
        self.pool.get_mut(handle).owner = Component::SixtopToMac;
    }

    fn maybe_install_autocell(&mut self, dest: MacAddress) {
        let Some(eui) = dest.to_eui64(self.config.pan_id) else {
            return;
        };
        if self
            .schedule
            .next_matching(0, dest, CellType::Tx)
            .is_some()
        {
            return;
        }
        let (slot, channel) = autocell_offsets(eui, self.schedule.frame_length());
        let installed = matches!(
            self.schedule.slot_info(slot),
            Some(info) if info.auto && info.neighbor == dest
        );
        if installed {
            return;
        }
        let spec = LinkSpec {
            cell_type: CellType::Tx,
            shared: false,
            anycast: false,
            priority: 0,
        };
        if self
            .schedule
            .add_slot(slot, spec, true, channel, dest, MacAddress::None)
        {
            debug!("auto TX cell ({},{}) -> {:?}", slot, channel, dest);
        } else {
            warn!("auto cell slot {} unavailable for {:?}", slot, dest);
        }
    }

    // ----- internal: send-done edges -------------------------------------

    fn request_senddone(&mut self, command: u8, dest: MacAddress, acked: bool) {
        let Some(command) = Command::from_wire(command) else {
            return;
        };
        if self.txn.state != TxnState::senddone_wait(command) || self.txn.neighbor_first != dest
        {
            debug!("stale 6P {:?} send-done for {:?}", command, dest);
            return;
        }
        if acked {
            // The middle node of a 3-step handshake parks in WaitAddRequest
            // instead of the response-wait state.
            self.txn.state = if command == Command::Add
                && !self.txn.neighbor_ongoing_3step.is_none()
            {
                TxnState::WaitAddRequest
            } else {
                TxnState::response_wait(command)
            };
            self.txn.timeout_timer =
                Some(self.timers.start_oneshot(self.config.sixtop_timeout_ms));
            debug!("6P {:?} acked by {:?}, awaiting response", command, dest);
        } else {
            warn!("6P {:?} request to {:?} undeliverable", command, dest);
            if command == Command::Clear {
                // CLEAR is idempotent; a dead peer must not leave stale
                // cells behind.
                self.clear_fallback();
            } else {
                self.txn.reset();
            }
        }
    }

    fn response_senddone(&mut self, acked: bool) {
        let Some(pending) = self.pending_response.take() else {
            return;
        };
        if !acked {
            debug!("6P response to {:?} undeliverable", pending.peer);
            return;
        }
        if !pending.code.is_success() {
            return;
        }
        let Some(command) = pending.command else {
            return;
        };
        match command {
            Command::Clear => {
                info!("CLEAR from {:?} applied", pending.peer);
                self.schedule.remove_all_to(pending.peer);
                self.neighbors.reset_seqnum(pending.peer);
                // The link restarts from seqnum 0; nothing to advance.
                return;
            }
            Command::Add => {
                let Ok(spec) = translate_options(flip_direction(pending.options)) else {
                    return;
                };
                add_cells(
                    &mut self.schedule,
                    &pending.cells,
                    spec,
                    pending.peer,
                    pending.peer2,
                );
            }
            Command::Delete => {
                let Ok(spec) = translate_options(flip_direction(pending.options)) else {
                    return;
                };
                remove_cells(&mut self.schedule, &pending.cells, spec, pending.peer);
            }
            Command::Relocate => {
                let Ok(spec) = translate_options(flip_direction(pending.options)) else {
                    return;
                };
                remove_cells(&mut self.schedule, &pending.del_cells, spec, pending.peer);
                add_cells(
                    &mut self.schedule,
                    &pending.cells,
                    spec,
                    pending.peer,
                    MacAddress::None,
                );
            }
            Command::Count | Command::List => {}
        }
        self.neighbors.advance_seqnum(pending.peer);
    }

    // ----- internal: inbound requests ------------------------------------

    fn handle_request(&mut self, src: MacAddress, parsed: &Parsed, body: &[u8]) {
        if self.pending_response.is_some()
            || self.pool.count(|p| p.creator == Component::SixtopRes) >= MAX_6P_RESPONSES
        {
            debug!("6P response outstanding, dropping request from {:?}", src);
            return;
        }

        let command = Command::from_wire(parsed.code);

        // Validation chain; the first failure decides the return code.
        let reject = if parsed.version != IANA_6TOP_6P_VERSION {
            Some(ReturnCode::VersionErr)
        } else if parsed.sfid != self.sf.sfid() {
            Some(ReturnCode::SfidErr)
        } else if command.is_none() {
            Some(ReturnCode::Error)
        } else if command != Some(Command::Clear) && parsed.seqnum != self.neighbors.seqnum(src)
        {
            warn!(
                "6P seqnum mismatch from {:?}: got {}, stored {}",
                src,
                parsed.seqnum,
                self.neighbors.seqnum(src)
            );
            Some(ReturnCode::SeqnumErr)
        } else if !self.request_gate_open(command.unwrap_or(Command::Clear), src) {
            Some(ReturnCode::Reset)
        } else if self.sf.translate_metadata() != MetadataKind::FrameId {
            Some(ReturnCode::Error)
        } else {
            None
        };
        if let Some(code) = reject {
            debug!("rejecting 6P request from {:?}: {:?}", src, code);
            self.queue_response(
                parsed.seqnum,
                None,
                PendingResponse {
                    command,
                    code,
                    peer: src,
                    peer2: MacAddress::None,
                    options: CellOptions::empty(),
                    cells: CellList::new(),
                    del_cells: CellList::new(),
                },
            );
            return;
        }
        let command = command.unwrap_or(Command::Clear);

        let body = match frame::parse_request_body(command, body) {
            Ok(b) => b,
            Err(e) => {
                debug!("malformed 6P {:?} body from {:?}: {:?}", command, src, e);
                self.queue_response(
                    parsed.seqnum,
                    None,
                    PendingResponse {
                        command: Some(command),
                        code: ReturnCode::Error,
                        peer: src,
                        peer2: MacAddress::None,
                        options: CellOptions::empty(),
                        cells: CellList::new(),
                        del_cells: CellList::new(),
                    },
                );
                return;
            }
        };
        self.dispatch_request(src, parsed.seqnum, body);
    }

    /// Request acceptance gate. ADD admits the 3-step restart case: the
    /// initiator of the handshake we are relaying may reissue its request.
    fn request_gate_open(&mut self, command: Command, src: MacAddress) -> bool {
        if self.txn.is_idle() {
            return true;
        }
        if command == Command::Add && self.txn.state == TxnState::WaitAddRequest {
            if src == self.txn.neighbor_ongoing_3step {
                return true;
            }
            // A foreign ADD while relaying voids the held-open handshake.
            self.finish_txn();
            return false;
        }
        false
    }

    fn dispatch_request(&mut self, src: MacAddress, echo_seqnum: u8, body: frame::RequestBody) {
        use frame::RequestBody;
        match body {
            RequestBody::Clear => {
                // Effect deferred to the response send-done.
                self.queue_response(
                    echo_seqnum,
                    None,
                    PendingResponse {
                        command: Some(Command::Clear),
                        code: ReturnCode::Success,
                        peer: src,
                        peer2: MacAddress::None,
                        options: CellOptions::empty(),
                        cells: CellList::new(),
                        del_cells: CellList::new(),
                    },
                );
            }
            RequestBody::Count { options } => {
                let Ok(spec) = translate_options(flip_direction(options)) else {
                    self.reject_request(src, echo_seqnum, Command::Count, ReturnCode::Error);
                    return;
                };
                let mut count: u16 = 0;
                let mut start = 0;
                while let Some((slot, _, _)) =
                    self.schedule.next_matching(start, src, spec.cell_type)
                {
                    count += 1;
                    start = slot + 1;
                }
                self.queue_response(
                    echo_seqnum,
                    Some(count),
                    PendingResponse {
                        command: Some(Command::Count),
                        code: ReturnCode::Success,
                        peer: src,
                        peer2: MacAddress::None,
                        options,
                        cells: CellList::new(),
                        del_cells: CellList::new(),
                    },
                );
            }
            RequestBody::List {
                options,
                offset,
                max_cells,
            } => {
                let Ok(spec) = translate_options(flip_direction(options)) else {
                    self.reject_request(src, echo_seqnum, Command::List, ReturnCode::Error);
                    return;
                };
                let mut cells = CellList::new();
                let mut skipped = 0;
                let mut start = 0;
                let mut exhausted = true;
                let wanted = (max_cells as usize).min(frame::CELLLIST_MAX_LEN);
                while let Some((slot, channel, _)) =
                    self.schedule.next_matching(start, src, spec.cell_type)
                {
                    if skipped < offset {
                        skipped += 1;
                    } else if cells.len() < wanted {
                        let _ = cells.push(frame::CellInfo::new(slot, channel));
                    } else {
                        exhausted = false;
                        break;
                    }
                    start = slot + 1;
                }
                let code = if exhausted {
                    ReturnCode::Eol
                } else {
                    ReturnCode::Success
                };
                self.queue_response(
                    echo_seqnum,
                    None,
                    PendingResponse {
                        command: Some(Command::List),
                        code,
                        peer: src,
                        peer2: MacAddress::None,
                        options,
                        cells,
                        del_cells: CellList::new(),
                    },
                );
            }
            RequestBody::Add {
                options,
                num_cells,
                cells,
                relay_target,
            } => {
                if let Some(target) = relay_target {
                    self.relay_add_request(src, echo_seqnum, options, num_cells, target);
                    return;
                }
                if translate_options(flip_direction(options)).is_err() {
                    self.reject_request(src, echo_seqnum, Command::Add, ReturnCode::Error);
                    return;
                }
                if self.schedule.num_free_entries() < num_cells as u16 {
                    self.reject_request(src, echo_seqnum, Command::Add, ReturnCode::Busy);
                    return;
                }
                let mut cells = cells;
                if !are_available_to_schedule(&self.schedule, num_cells, &mut cells) {
                    self.reject_request(src, echo_seqnum, Command::Add, ReturnCode::CellListErr);
                    return;
                }
                self.queue_response(
                    echo_seqnum,
                    None,
                    PendingResponse {
                        command: Some(Command::Add),
                        code: ReturnCode::Success,
                        peer: src,
                        peer2: MacAddress::None,
                        options,
                        cells,
                        del_cells: CellList::new(),
                    },
                );
            }
            RequestBody::Delete {
                options,
                num_cells,
                cells,
            } => {
                let Ok(spec) = translate_options(flip_direction(options)) else {
                    self.reject_request(src, echo_seqnum, Command::Delete, ReturnCode::Error);
                    return;
                };
                let mut cells = cells;
                if !are_available_to_remove(&self.schedule, num_cells, &mut cells, src, &spec) {
                    self.reject_request(
                        src,
                        echo_seqnum,
                        Command::Delete,
                        ReturnCode::CellListErr,
                    );
                    return;
                }
                self.queue_response(
                    echo_seqnum,
                    None,
                    PendingResponse {
                        command: Some(Command::Delete),
                        code: ReturnCode::Success,
                        peer: src,
                        peer2: MacAddress::None,
                        options,
                        cells,
                        del_cells: CellList::new(),
                    },
                );
            }
            RequestBody::Relocate {
                options,
                num_cells,
                del_cells,
                add_cells,
            } => {
                let Ok(spec) = translate_options(flip_direction(options)) else {
                    self.reject_request(src, echo_seqnum, Command::Relocate, ReturnCode::Error);
                    return;
                };
                let mut del_cells = del_cells;
                if !are_available_to_remove(
                    &self.schedule,
                    num_cells,
                    &mut del_cells,
                    src,
                    &spec,
                ) {
                    self.reject_request(
                        src,
                        echo_seqnum,
                        Command::Relocate,
                        ReturnCode::CellListErr,
                    );
                    return;
                }
                let mut add_cells = add_cells;
                if !are_available_to_schedule(&self.schedule, num_cells, &mut add_cells) {
                    self.reject_request(
                        src,
                        echo_seqnum,
                        Command::Relocate,
                        ReturnCode::CellListErr,
                    );
                    return;
                }
                self.queue_response(
                    echo_seqnum,
                    None,
                    PendingResponse {
                        command: Some(Command::Relocate),
                        code: ReturnCode::Success,
                        peer: src,
                        peer2: MacAddress::None,
                        options,
                        cells: add_cells,
                        del_cells,
                    },
                );
            }
        }
    }

    /// Step 2 of the 3-step anycast handshake: this node sits between the
    /// initiator and the second receiver. The initiator's request is held
    /// open (WaitAddRequest) while our own ADD request, carrying our
    /// candidate cells and the PRIORITY mark, runs against the second
    /// receiver.
    fn relay_add_request(
        &mut self,
        initiator: MacAddress,
        echo_seqnum: u8,
        options: CellOptions,
        num_cells: u8,
        target: [u8; 8],
    ) {
        if self.txn.state == TxnState::WaitAddRequest {
            // Restart by the same initiator; drop the previous handshake.
            self.finish_txn();
        }
        if translate_options(flip_direction(options)).is_err() {
            self.reject_request(initiator, echo_seqnum, Command::Add, ReturnCode::Error);
            return;
        }
        let mut candidates = CellList::new();
        if !self.sf.candidate_add_cell_list(&mut candidates, num_cells) {
            self.reject_request(
                initiator,
                echo_seqnum,
                Command::Add,
                ReturnCode::CellListErr,
            );
            return;
        }
        let second = MacAddress::Long(target);
        let seqnum = self.neighbors.seqnum(second);
        let sfid = self.sf.sfid();
        let metadata = self.sf.metadata();
        let relay_options = options | CellOptions::PRIORITY;
        let Ok(handle) = self.pool.allocate(Component::Sixtop) else {
            self.reject_request(initiator, echo_seqnum, Command::Add, ReturnCode::Busy);
            return;
        };
        let empty = CellList::new();
        let fields = RequestFields {
            command: Command::Add,
            sfid,
            seqnum,
            metadata,
            options: relay_options,
            num_cells,
            add_cells: &candidates,
            del_cells: &empty,
            list_offset: 0,
            list_max_cells: 0,
            relay_target: None,
        };
        if frame::build_request(self.pool.get_mut(handle), &fields).is_err() {
            self.pool.free(handle);
            self.reject_request(initiator, echo_seqnum, Command::Add, ReturnCode::Busy);
            return;
        }
        {
            let pkt = self.pool.get_mut(handle);
            pkt.l2_dest = second;
            pkt.kind = FrameKind::Data;
            pkt.payload_ie = true;
            pkt.six_command = Command::Add as u8;
            pkt.six_frame_id = self.config.slotframe_handle;
            pkt.six_cell_options = relay_options.bits();
        }
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);

        self.txn.state = TxnState::senddone_wait(Command::Add);
        self.txn.neighbor_first = second;
        self.txn.neighbor_ongoing_3step = initiator;
        self.txn.cell_options = options;
        debug!(
            "relaying anycast ADD from {:?} to {:?} ({} candidates)",
            initiator,
            second,
            candidates.len()
        );
    }

    fn reject_request(
        &mut self,
        peer: MacAddress,
        echo_seqnum: u8,
        command: Command,
        code: ReturnCode,
    ) {
        debug!("6P {:?} from {:?} rejected: {:?}", command, peer, code);
        self.queue_response(
            echo_seqnum,
            None,
            PendingResponse {
                command: Some(command),
                code,
                peer,
                peer2: MacAddress::None,
                options: CellOptions::empty(),
                cells: CellList::new(),
                del_cells: CellList::new(),
            },
        );
    }

    /// Builds and queues a 6P response and records its deferred effect.
    fn queue_response(&mut self, echo_seqnum: u8, count: Option<u16>, pending: PendingResponse) {
        let sfid = self.sf.sfid();
        let metadata = self.sf.metadata();
        let Ok(handle) = self.pool.allocate(Component::SixtopRes) else {
            warn!("no buffer for 6P response to {:?}", pending.peer);
            return;
        };
        let fields = ResponseFields {
            code: pending.code,
            sfid,
            seqnum: echo_seqnum,
            metadata,
            cells: &pending.cells,
            count,
        };
        if frame::build_response(self.pool.get_mut(handle), &fields).is_err() {
            warn!("6P response to {:?} does not fit", pending.peer);
            self.pool.free(handle);
            return;
        }
        {
            let pkt = self.pool.get_mut(handle);
            pkt.l2_dest = pending.peer;
            pkt.kind = FrameKind::Data;
            pkt.payload_ie = true;
            pkt.six_command = pending.command.map_or(0, |c| c as u8);
            pkt.six_return_code = pending.code as u8;
            pkt.six_frame_id = self.config.slotframe_handle;
            pkt.six_cell_options = flip_direction(pending.options).bits();
        }
        self.stamp_security(handle);
        self.enqueue_to_mac(handle);
        self.pending_response = Some(pending);
    }

    // ----- internal: inbound responses -----------------------------------

    fn handle_response(&mut self, src: MacAddress, parsed: &Parsed, body: &[u8]) {
        if self.txn.state == TxnState::WaitAddRequest {
            self.handle_relay_response(src, parsed, body);
            return;
        }
        if !self.txn.state.is_response_wait() || src != self.txn.neighbor_first {
            warn!(
                "unexpected 6P response from {:?} in {:?}",
                src, self.txn.state
            );
            // Drop any request of ours still queued to this peer, but touch
            // neither the schedule nor the seqnum.
            self.pool.free_matching(|p| {
                p.creator == Component::Sixtop
                    && p.owner == Component::SixtopToMac
                    && p.six_command != 0
                    && p.l2_dest == src
            });
            return;
        }
        let command = match self.txn.state.command() {
            Some(c) => c,
            None => return,
        };
        let Some(code) = ReturnCode::from_wire(parsed.code) else {
            debug!("unknown 6P return code {:#x} from {:?}", parsed.code, src);
            return;
        };

        if command == Command::Clear {
            // CLEAR converges regardless of what came back.
            self.finish_txn();
            self.schedule.remove_all_to(src);
            self.neighbors.reset_seqnum(src);
            info!("link to {:?} cleared", src);
            if !code.is_success() {
                self.sf.handle_rc_error(code, src);
            }
            return;
        }
        if parsed.seqnum != self.neighbors.seqnum(src) {
            warn!(
                "6P response seqnum mismatch from {:?}: got {}, stored {}",
                src,
                parsed.seqnum,
                self.neighbors.seqnum(src)
            );
            self.finish_txn();
            self.sf.handle_rc_error(ReturnCode::SeqnumErr, src);
            return;
        }
        if !code.is_success() {
            warn!("6P {:?} to {:?} answered {:?}", command, src, code);
            self.finish_txn();
            self.sf.handle_rc_error(code, src);
            return;
        }

        match command {
            Command::Add => {
                let Ok(cells) = frame::parse_cell_list(body) else {
                    self.fail_malformed_response(src);
                    return;
                };
                let Ok(spec) = translate_options(self.txn.cell_options) else {
                    self.fail_malformed_response(src);
                    return;
                };
                add_cells(
                    &mut self.schedule,
                    &cells,
                    spec,
                    self.txn.neighbor_first,
                    self.txn.neighbor_second,
                );
            }
            Command::Delete => {
                let Ok(cells) = frame::parse_cell_list(body) else {
                    self.fail_malformed_response(src);
                    return;
                };
                let Ok(spec) = translate_options(self.txn.cell_options) else {
                    self.fail_malformed_response(src);
                    return;
                };
                remove_cells(&mut self.schedule, &cells, spec, src);
            }
            Command::Relocate => {
                let Ok(cells) = frame::parse_cell_list(body) else {
                    self.fail_malformed_response(src);
                    return;
                };
                let Ok(spec) = translate_options(self.txn.cell_options) else {
                    self.fail_malformed_response(src);
                    return;
                };
                let old = self.txn.cells_to_delete.clone();
                remove_cells(&mut self.schedule, &old, spec, src);
                add_cells(&mut self.schedule, &cells, spec, src, MacAddress::None);
            }
            Command::Count => {
                let Ok(count) = frame::parse_count(body) else {
                    self.fail_malformed_response(src);
                    return;
                };
                info!("{:?} holds {} matching cells", src, count);
            }
            Command::List => {
                match frame::parse_cell_list(body) {
                    Ok(cells) => {
                        for cell in &cells {
                            info!(
                                "{:?} cell ({},{})",
                                src, cell.slot_offset, cell.channel_offset
                            );
                        }
                    }
                    Err(_) => {
                        self.fail_malformed_response(src);
                        return;
                    }
                }
            }
            Command::Clear => unreachable!("handled above"),
        }
        self.neighbors.advance_seqnum(src);
        self.finish_txn();
        debug!("6P {:?} with {:?} completed", command, src);
    }

    /// Step 3 of the 3-step handshake: the second receiver answered our
    /// relayed request. Mirror the outcome to the initiator (step 4); our
    /// own cells install when that response is acked.
    fn handle_relay_response(&mut self, src: MacAddress, parsed: &Parsed, body: &[u8]) {
        if src != self.txn.neighbor_first {
            debug!("ignoring response from {:?} while relaying", src);
            return;
        }
        let Some(code) = ReturnCode::from_wire(parsed.code) else {
            return;
        };
        if parsed.seqnum != self.neighbors.seqnum(src) {
            warn!("relay response seqnum mismatch from {:?}", src);
            self.finish_txn();
            self.sf.handle_rc_error(ReturnCode::SeqnumErr, src);
            return;
        }
        let initiator = self.txn.neighbor_ongoing_3step;
        let options = self.txn.cell_options;
        let echo_seqnum = self.neighbors.seqnum(initiator);

        if code.is_success() {
            let Ok(cells) = frame::parse_cell_list(body) else {
                self.fail_malformed_response(src);
                return;
            };
            self.neighbors.advance_seqnum(src);
            self.finish_txn();
            self.queue_response(
                echo_seqnum,
                None,
                PendingResponse {
                    command: Some(Command::Add),
                    code: ReturnCode::Success,
                    peer: initiator,
                    peer2: src,
                    options,
                    cells,
                    del_cells: CellList::new(),
                },
            );
        } else {
            warn!("second receiver {:?} rejected anycast ADD: {:?}", src, code);
            self.finish_txn();
            self.queue_response(
                echo_seqnum,
                None,
                PendingResponse {
                    command: Some(Command::Add),
                    code,
                    peer: initiator,
                    peer2: MacAddress::None,
                    options: CellOptions::empty(),
                    cells: CellList::new(),
                    del_cells: CellList::new(),
                },
            );
        }
    }

    fn fail_malformed_response(&mut self, src: MacAddress) {
        debug!("malformed 6P response from {:?}", src);
        self.finish_txn();
        self.sf.handle_rc_error(ReturnCode::Error, src);
    }

    // ----- internal: failure paths ---------------------------------------

    /// Local CLEAR: a dead or unreachable peer still loses all its cells
    /// on this side, and the link restarts from seqnum 0.
    fn clear_fallback(&mut self) {
        let peer = self.txn.neighbor_clear;
        info!("CLEAR fallback: flushing schedule to {:?}", peer);
        self.finish_txn();
        self.schedule.remove_all_to(peer);
        self.neighbors.reset_seqnum(peer);
        self.sf.handle_rc_error(ReturnCode::Reset, peer);
    }

    fn transaction_timeout(&mut self) {
        warn!("6P transaction timeout in {:?}", self.txn.state);
        self.txn.timeout_timer = None;
        if self.txn.state == TxnState::WaitClearResponse {
            self.clear_fallback();
            return;
        }
        let peer = self.txn.neighbor_first;
        self.txn.reset();
        // No automatic retry; the SF owns that policy.
        self.sf.handle_rc_error(ReturnCode::Reset, peer);
    }

    fn finish_txn(&mut self) {
        if let Some(t) = self.txn.timeout_timer.take() {
            self.timers.cancel(t);
        }
        self.txn.reset();
    }
}
