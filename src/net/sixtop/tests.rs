//! End-to-end transaction tests: two or three `Sixtop` nodes wired through
//! an in-memory link, with test doubles standing in for the schedule table,
//! neighbor table, timer service, Scheduling Function and node state.
//!
//! The harness moves one frame at a time: `deliver` claims the next ready
//! frame from the sender, acknowledges it (send-done) and injects it into
//! the receiver; `drop_frame` simulates a MAC that exhausted its retries.
//! Timer ids are deterministic: the constructor arms the EB timer first
//! (id 1) and the maintenance timer second (id 2).

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use rand_core::RngCore;

use super::frame::{CellInfo, CellList, CellOptions, Command, ReturnCode};
use super::fsm::TxnState;
use super::mgmt::{EB_ASN_OFFSET, EB_IES, EB_SLOTFRAME_LEN_OFFSET};
use super::schedule::{
    autocell_offsets, CellType, LinkSpec, ScheduleTable, SlotInfo,
};
use super::sf::{MetadataKind, SchedulingFunction, SFID_MSF};
use super::{Config, NodeState, RequestParams, Sixtop};
use crate::net::ieee802154::{FrameKind, MacAddress, SecurityLevel, SHORT_BROADCAST};
use crate::net::neighbors::NeighborTable;
use crate::packet::Component;
use crate::time::{TimerId, TimerService};
use crate::Error;

const EB_TIMER: TimerId = TimerId(1);
const MAINTENANCE_TIMER: TimerId = TimerId(2);

const FRAME_LENGTH: u16 = 101;

fn addr(tag: u8) -> MacAddress {
    MacAddress::Long([tag; 8])
}

fn cells(pairs: &[(u16, u16)]) -> CellList {
    let mut list = CellList::new();
    for &(s, c) in pairs {
        list.push(CellInfo::new(s, c)).unwrap();
    }
    list
}

// ----- test doubles -------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    info: SlotInfo,
    channel: u16,
    neighbor2: MacAddress,
}

#[derive(Default)]
struct TestSchedule {
    slots: std::collections::BTreeMap<u16, Slot>,
    capacity: u16,
}

impl TestSchedule {
    fn new() -> TestSchedule {
        TestSchedule {
            slots: Default::default(),
            capacity: 50,
        }
    }

    fn cell(&self, slot: u16) -> Option<&Slot> {
        self.slots.get(&slot)
    }

    fn cells_to(&self, neighbor: MacAddress) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|(_, s)| s.info.neighbor == neighbor || s.neighbor2 == neighbor)
            .map(|(slot, _)| *slot)
            .collect()
    }
}

impl ScheduleTable for TestSchedule {
    fn frame_length(&self) -> u16 {
        FRAME_LENGTH
    }

    fn num_free_entries(&self) -> u16 {
        self.capacity - self.slots.len() as u16
    }

    fn is_slot_free(&self, slot_offset: u16) -> bool {
        !self.slots.contains_key(&slot_offset)
    }

    fn add_slot(
        &mut self,
        slot_offset: u16,
        spec: LinkSpec,
        auto: bool,
        channel_offset: u16,
        neighbor1: MacAddress,
        neighbor2: MacAddress,
    ) -> bool {
        if self.slots.contains_key(&slot_offset) || self.num_free_entries() == 0 {
            return false;
        }
        self.slots.insert(
            slot_offset,
            Slot {
                info: SlotInfo {
                    link_type: spec.cell_type,
                    shared: spec.shared,
                    anycast: spec.anycast,
                    auto,
                    priority: spec.priority,
                    neighbor: neighbor1,
                },
                channel: channel_offset,
                neighbor2,
            },
        );
        true
    }

    fn remove_slot(
        &mut self,
        slot_offset: u16,
        cell_type: CellType,
        shared: bool,
        neighbor: MacAddress,
    ) -> bool {
        match self.slots.get(&slot_offset) {
            Some(s)
                if s.info.link_type == cell_type
                    && s.info.shared == shared
                    && s.info.neighbor == neighbor =>
            {
                self.slots.remove(&slot_offset);
                true
            }
            _ => false,
        }
    }

    fn slot_info(&self, slot_offset: u16) -> Option<SlotInfo> {
        self.slots.get(&slot_offset).map(|s| s.info)
    }

    fn next_matching(
        &self,
        start_offset: u16,
        neighbor: MacAddress,
        cell_type: CellType,
    ) -> Option<(u16, u16, u8)> {
        self.slots
            .range(start_offset..)
            .find(|(_, s)| {
                !s.info.auto && s.info.link_type == cell_type && s.info.neighbor == neighbor
            })
            .map(|(slot, s)| (*slot, s.channel, s.info.priority))
    }

    fn remove_all_to(&mut self, neighbor: MacAddress) {
        self.slots
            .retain(|_, s| s.info.neighbor != neighbor && s.neighbor2 != neighbor);
    }
}

struct TestNeighbors {
    seqnums: Vec<(MacAddress, u8)>,
    ka_target: Option<MacAddress>,
    aged: Rc<RefCell<usize>>,
}

impl TestNeighbors {
    fn new() -> TestNeighbors {
        TestNeighbors {
            seqnums: Vec::new(),
            ka_target: None,
            aged: Rc::new(RefCell::new(0)),
        }
    }
}

impl NeighborTable for TestNeighbors {
    fn seqnum(&self, neighbor: MacAddress) -> u8 {
        self.seqnums
            .iter()
            .find(|(n, _)| *n == neighbor)
            .map_or(0, |(_, s)| *s)
    }

    fn set_seqnum(&mut self, neighbor: MacAddress, seqnum: u8) {
        if let Some(entry) = self.seqnums.iter_mut().find(|(n, _)| *n == neighbor) {
            entry.1 = seqnum;
        } else {
            self.seqnums.push((neighbor, seqnum));
        }
    }

    fn ka_neighbor(&mut self, _ka_period_ms: u32) -> Option<MacAddress> {
        self.ka_target
    }

    fn age(&mut self) {
        *self.aged.borrow_mut() += 1;
    }
}

struct TestTimers {
    next_id: u32,
    canceled: Rc<RefCell<Vec<TimerId>>>,
}

impl TestTimers {
    fn new() -> TestTimers {
        TestTimers {
            next_id: 0,
            canceled: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl TimerService for TestTimers {
    fn start_oneshot(&mut self, _duration_ms: u32) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }

    fn start_periodic(&mut self, _period_ms: u32) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }

    fn cancel(&mut self, id: TimerId) {
        self.canceled.borrow_mut().push(id);
    }
}

struct TestSf {
    candidates: CellList,
    rc_errors: Rc<RefCell<Vec<(ReturnCode, MacAddress)>>>,
}

impl TestSf {
    fn new() -> TestSf {
        TestSf {
            candidates: CellList::new(),
            rc_errors: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl SchedulingFunction for TestSf {
    fn sfid(&self) -> u8 {
        SFID_MSF
    }

    fn metadata(&self) -> u16 {
        0
    }

    fn translate_metadata(&self) -> MetadataKind {
        MetadataKind::FrameId
    }

    fn handle_rc_error(&mut self, code: ReturnCode, peer: MacAddress) {
        self.rc_errors.borrow_mut().push((code, peer));
    }

    fn candidate_add_cell_list(&mut self, cells: &mut CellList, num_cells: u8) -> bool {
        if self.candidates.is_empty() || num_cells == 0 {
            return false;
        }
        for cell in &self.candidates {
            let _ = cells.push(*cell);
        }
        true
    }
}

#[derive(Debug, Clone)]
struct Flags {
    synchronized: bool,
    security: bool,
    rank: u16,
    dao_sent: bool,
}

#[derive(Clone)]
struct TestNode {
    flags: Rc<RefCell<Flags>>,
}

impl TestNode {
    fn new() -> TestNode {
        TestNode {
            flags: Rc::new(RefCell::new(Flags {
                synchronized: true,
                security: true,
                rank: 512,
                dao_sent: true,
            })),
        }
    }
}

impl NodeState for TestNode {
    fn is_synchronized(&self) -> bool {
        self.flags.borrow().synchronized
    }

    fn security_enabled(&self) -> bool {
        self.flags.borrow().security
    }

    fn dag_rank(&self) -> u16 {
        self.flags.borrow().rank
    }

    fn dao_sent(&self) -> bool {
        self.flags.borrow().dao_sent
    }

    fn security(&self, kind: FrameKind) -> Option<(SecurityLevel, u8)> {
        match kind {
            FrameKind::Beacon => Some((SecurityLevel::Mic32, 1)),
            FrameKind::Data => Some((SecurityLevel::EncMic32, 2)),
        }
    }
}

struct XorShift(u32);

impl RngCore for XorShift {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            *b = self.next_u32() as u8;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

// ----- harness ------------------------------------------------------------

type Node = Sixtop<TestSchedule, TestNeighbors, TestTimers, TestSf, TestNode, XorShift>;

struct Handles {
    rc_errors: Rc<RefCell<Vec<(ReturnCode, MacAddress)>>>,
    flags: Rc<RefCell<Flags>>,
    aged: Rc<RefCell<usize>>,
    canceled: Rc<RefCell<Vec<TimerId>>>,
}

fn make_node() -> (Node, Handles) {
    make_node_with_config(Config::default())
}

fn make_node_with_config(config: Config) -> (Node, Handles) {
    let sf = TestSf::new();
    let node = TestNode::new();
    let neighbors = TestNeighbors::new();
    let timers = TestTimers::new();
    let handles = Handles {
        rc_errors: sf.rc_errors.clone(),
        flags: node.flags.clone(),
        aged: neighbors.aged.clone(),
        canceled: timers.canceled.clone(),
    };
    let sixtop = Sixtop::new(
        config,
        TestSchedule::new(),
        neighbors,
        timers,
        sf,
        node,
        XorShift(0x2545_f491),
    );
    (sixtop, handles)
}

/// Moves the sender's next ready frame over the link: acknowledge it to the
/// sender, then hand its payload to the receiver. Returns false when the
/// sender had nothing queued.
fn deliver(from: &mut Node, from_addr: MacAddress, to: &mut Node) -> bool {
    let Some(h) = from.next_ready_frame() else {
        return false;
    };
    let bytes = from.packet(h).payload().to_vec();
    from.notify_send_done(h, true);
    let rx = to.pool_mut().allocate(Component::Mac).unwrap();
    to.pool_mut().get_mut(rx).fill(&bytes).unwrap();
    to.notify_receive(rx, from_addr);
    true
}

/// The sender's next ready frame never makes it: MAC retries exhausted.
fn drop_frame(from: &mut Node) -> bool {
    let Some(h) = from.next_ready_frame() else {
        return false;
    };
    from.notify_send_done(h, false);
    true
}

/// Silently discards the sender's next ready frame after acking it, as if
/// the receiver missed it above the MAC.
fn lose_after_ack(from: &mut Node) -> bool {
    let Some(h) = from.next_ready_frame() else {
        return false;
    };
    from.notify_send_done(h, true);
    true
}

fn add_request<'a>(peer: MacAddress, num: u8, list: &'a CellList) -> RequestParams<'a> {
    RequestParams {
        command: Command::Add,
        neighbor: peer,
        neighbor2: MacAddress::None,
        num_cells: num,
        options: CellOptions::TX,
        add_cells: Some(list),
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    }
}

// ----- two-step transactions ----------------------------------------------

#[test]
fn two_step_add_success() {
    let (mut a, h_a) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));
    a.neighbors_mut().set_seqnum(b_addr, 7);
    b.neighbors_mut().set_seqnum(a_addr, 7);

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert_eq!(a.txn_state(), TxnState::WaitAddReqSendDone);

    assert!(deliver(&mut a, a_addr, &mut b));
    assert_eq!(a.txn_state(), TxnState::WaitAddResponse);
    let timeout = a.txn_timeout().expect("timeout armed");
    // The responder serves the request without entering the transaction
    // machine itself.
    assert_eq!(b.txn_state(), TxnState::Idle);

    assert!(deliver(&mut b, b_addr, &mut a));
    assert_eq!(a.txn_state(), TxnState::Idle);
    assert!(h_a.canceled.borrow().contains(&timeout));

    // P1: both ends advanced once, to the same value.
    assert_eq!(a.neighbors().seqnum(b_addr), 8);
    assert_eq!(b.neighbors().seqnum(a_addr), 8);

    // A transmits at (3,11), B receives there.
    let a_cell = a.schedule().cell(3).expect("initiator cell");
    assert_eq!(a_cell.info.link_type, CellType::Tx);
    assert_eq!(a_cell.info.neighbor, b_addr);
    assert_eq!(a_cell.channel, 11);
    assert!(!a_cell.info.auto);
    let b_cell = b.schedule().cell(3).expect("responder cell");
    assert_eq!(b_cell.info.link_type, CellType::Rx);
    assert_eq!(b_cell.info.neighbor, a_addr);
    assert_eq!(b_cell.channel, 11);
}

#[test]
fn responder_trims_busy_slots_to_requested_count() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    // Slot 3 is taken on B; A proposes three cells but wants only one.
    let spec = LinkSpec {
        cell_type: CellType::Rx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    b.schedule_mut()
        .add_slot(3, spec, false, 0, addr(0xc), MacAddress::None);

    let list = cells(&[(3, 11), (5, 2), (7, 4)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));

    // Only (5,2) survives: slot 3 was busy and the count cap dropped (7,4).
    assert!(a.schedule().cell(5).is_some());
    assert!(a.schedule().cell(7).is_none());
    assert_eq!(b.schedule().cell(5).unwrap().info.neighbor, a_addr);
    assert!(b.schedule().cell(7).is_none());
}

#[test]
fn seqnum_mismatch_changes_nothing() {
    let (mut a, h_a) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));
    a.neighbors_mut().set_seqnum(b_addr, 7);
    b.neighbors_mut().set_seqnum(a_addr, 9);

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));

    // SEQNUM_ERR reached the SF; no schedule change, no seqnum advance.
    assert_eq!(
        h_a.rc_errors.borrow().as_slice(),
        &[(ReturnCode::SeqnumErr, b_addr)]
    );
    assert!(a.schedule().cell(3).is_none());
    assert!(b.schedule().cell(3).is_none());
    assert_eq!(a.neighbors().seqnum(b_addr), 7);
    assert_eq!(b.neighbors().seqnum(a_addr), 9);
    assert_eq!(a.txn_state(), TxnState::Idle);
}

#[test]
fn clear_with_dead_peer_falls_back_locally() {
    let (mut a, h_a) = make_node();
    let b_addr = addr(0xb);
    a.neighbors_mut().set_seqnum(b_addr, 5);
    let spec = LinkSpec {
        cell_type: CellType::Tx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(7, spec, false, 3, b_addr, MacAddress::None);

    a.request(&RequestParams {
        command: Command::Clear,
        neighbor: b_addr,
        neighbor2: MacAddress::None,
        num_cells: 0,
        options: CellOptions::empty(),
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    assert_eq!(a.txn_state(), TxnState::WaitClearReqSendDone);

    // MAC retries exhausted: the peer is gone, clear locally anyway.
    assert!(drop_frame(&mut a));
    assert_eq!(a.txn_state(), TxnState::Idle);
    assert!(a.schedule().cells_to(b_addr).is_empty());
    assert_eq!(a.neighbors().seqnum(b_addr), 0);
    assert_eq!(
        h_a.rc_errors.borrow().as_slice(),
        &[(ReturnCode::Reset, b_addr)]
    );
}

#[test]
fn clear_is_idempotent() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    // Negotiate one cell, then CLEAR twice; the second round must be a
    // no-op ending in the same state.
    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));

    for _ in 0..2 {
        a.request(&RequestParams {
            command: Command::Clear,
            neighbor: b_addr,
            neighbor2: MacAddress::None,
            num_cells: 0,
            options: CellOptions::empty(),
            add_cells: None,
            del_cells: None,
            sfid: SFID_MSF,
            list_offset: 0,
            list_max_cells: 0,
        })
        .unwrap();
        assert!(deliver(&mut a, a_addr, &mut b));
        assert!(deliver(&mut b, b_addr, &mut a));
        assert!(a.schedule().cells_to(b_addr).is_empty());
        assert!(b.schedule().cells_to(a_addr).is_empty());
        assert_eq!(a.neighbors().seqnum(b_addr), 0);
        assert_eq!(b.neighbors().seqnum(a_addr), 0);
        assert_eq!(a.txn_state(), TxnState::Idle);
    }
}

#[test]
fn add_then_delete_restores_free_entries() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    // Negotiated TX cells in both directions so the bootstrap auto-cell
    // rule stays out of the entry accounting.
    let spec = LinkSpec {
        cell_type: CellType::Tx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(90, spec, false, 0, b_addr, MacAddress::None);
    b.schedule_mut()
        .add_slot(91, spec, false, 0, a_addr, MacAddress::None);
    let free_a = a.schedule().num_free_entries();
    let free_b = b.schedule().num_free_entries();

    let list = cells(&[(3, 11), (5, 2)]);
    a.request(&add_request(b_addr, 2, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));
    assert_eq!(a.schedule().num_free_entries(), free_a - 2);
    assert_eq!(b.schedule().num_free_entries(), free_b - 2);

    a.request(&RequestParams {
        command: Command::Delete,
        neighbor: b_addr,
        neighbor2: MacAddress::None,
        num_cells: 2,
        options: CellOptions::TX,
        add_cells: None,
        del_cells: Some(&list),
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));
    assert_eq!(a.schedule().num_free_entries(), free_a);
    assert_eq!(b.schedule().num_free_entries(), free_b);
    assert_eq!(a.neighbors().seqnum(b_addr), 2);
    assert_eq!(b.neighbors().seqnum(a_addr), 2);
}

#[test]
fn relocate_moves_cells() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    let old = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &old)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));

    let new = cells(&[(20, 6)]);
    a.request(&RequestParams {
        command: Command::Relocate,
        neighbor: b_addr,
        neighbor2: MacAddress::None,
        num_cells: 1,
        options: CellOptions::TX,
        add_cells: Some(&new),
        del_cells: Some(&old),
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a));

    for node in [&a, &b] {
        assert!(node.schedule().cell(3).is_none());
        assert!(node.schedule().cell(20).is_some());
    }
    assert_eq!(b.schedule().cell(20).unwrap().info.link_type, CellType::Rx);
}

#[test]
fn list_returns_cells_with_eol() {
    let (mut a, _) = make_node();
    let (mut b, h_b) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    // A holds two RX cells from B, i.e. B transmits in them.
    let spec = LinkSpec {
        cell_type: CellType::Rx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(2, spec, false, 4, b_addr, MacAddress::None);
    a.schedule_mut()
        .add_slot(5, spec, false, 7, b_addr, MacAddress::None);

    b.request(&RequestParams {
        command: Command::List,
        neighbor: a_addr,
        neighbor2: MacAddress::None,
        num_cells: 0,
        options: CellOptions::TX,
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 10,
    })
    .unwrap();
    assert!(deliver(&mut b, b_addr, &mut a));
    assert!(deliver(&mut a, a_addr, &mut b));

    // EOL is a success: the transaction completed and both seqnums moved.
    assert_eq!(b.txn_state(), TxnState::Idle);
    assert!(h_b.rc_errors.borrow().is_empty());
    assert_eq!(b.neighbors().seqnum(a_addr), 1);
    assert_eq!(a.neighbors().seqnum(b_addr), 1);
}

#[test]
fn count_reports_matching_cells() {
    let (mut a, _) = make_node();
    let (mut b, h_b) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    let spec = LinkSpec {
        cell_type: CellType::Rx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    for slot in [2, 5, 9] {
        a.schedule_mut()
            .add_slot(slot, spec, false, 0, b_addr, MacAddress::None);
    }

    b.request(&RequestParams {
        command: Command::Count,
        neighbor: a_addr,
        neighbor2: MacAddress::None,
        num_cells: 0,
        options: CellOptions::TX,
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    assert!(deliver(&mut b, b_addr, &mut a));
    assert!(deliver(&mut a, a_addr, &mut b));
    assert_eq!(b.txn_state(), TxnState::Idle);
    assert!(h_b.rc_errors.borrow().is_empty());
    assert_eq!(b.neighbors().seqnum(a_addr), 1);
}

// ----- three-step anycast -------------------------------------------------

#[test]
fn three_step_anycast_add() {
    let (mut i, _) = make_node();
    let (mut p1, _) = make_node();
    let (mut p2, _) = make_node();
    let (i_addr, p1_addr, p2_addr) = (addr(0x1), addr(0x2), addr(0x3));

    p1.sf_mut().candidates = cells(&[(4, 2), (9, 5)]);

    i.request(&RequestParams {
        command: Command::Add,
        neighbor: p1_addr,
        neighbor2: p2_addr,
        num_cells: 1,
        options: CellOptions::TX | CellOptions::ANYCAST,
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();

    // Step 1: I -> P1, empty list. P1 relays instead of answering.
    assert!(deliver(&mut i, i_addr, &mut p1));
    assert_eq!(i.txn_state(), TxnState::WaitAddResponse);
    assert_eq!(p1.txn_state(), TxnState::WaitAddReqSendDone);

    // Step 2: P1 -> P2, candidate list with the PRIORITY mark.
    assert!(deliver(&mut p1, p1_addr, &mut p2));
    assert_eq!(p1.txn_state(), TxnState::WaitAddRequest);

    // Step 3: P2 -> P1, agreed subset. P2 installs priority 1 on ack.
    assert!(deliver(&mut p2, p2_addr, &mut p1));

    // Step 4: P1 -> I, same subset. P1 installs priority 0 on ack.
    assert!(deliver(&mut p1, p1_addr, &mut i));
    assert_eq!(i.txn_state(), TxnState::Idle);
    assert_eq!(p1.txn_state(), TxnState::Idle);

    // Both receivers hold the identical cell with deterministic backoff
    // ranks; the initiator's TX cell names both of them.
    let p1_cell = p1.schedule().cell(4).expect("primary receiver cell");
    assert_eq!(p1_cell.info.link_type, CellType::Rx);
    assert!(p1_cell.info.anycast);
    assert_eq!(p1_cell.info.priority, 0);
    assert_eq!(p1_cell.info.neighbor, i_addr);
    assert_eq!(p1_cell.neighbor2, p2_addr);
    assert_eq!(p1_cell.channel, 2);

    let p2_cell = p2.schedule().cell(4).expect("secondary receiver cell");
    assert_eq!(p2_cell.info.link_type, CellType::Rx);
    assert!(p2_cell.info.anycast);
    assert_eq!(p2_cell.info.priority, 1);
    assert_eq!(p2_cell.channel, 2);

    let i_cell = i.schedule().cell(4).expect("initiator cell");
    assert_eq!(i_cell.info.link_type, CellType::Tx);
    assert!(i_cell.info.anycast);
    assert_eq!(i_cell.info.priority, 0);
    assert_eq!(i_cell.info.neighbor, p1_addr);
    assert_eq!(i_cell.neighbor2, p2_addr);
    assert_eq!(i_cell.channel, 2);

    assert!(p1.schedule().cell(9).is_none());

    // Each link advanced exactly once.
    assert_eq!(i.neighbors().seqnum(p1_addr), 1);
    assert_eq!(p1.neighbors().seqnum(i_addr), 1);
    assert_eq!(p1.neighbors().seqnum(p2_addr), 1);
    assert_eq!(p2.neighbors().seqnum(p1_addr), 1);
}

#[test]
fn relay_without_candidates_is_refused() {
    let (mut i, h_i) = make_node();
    let (mut p1, _) = make_node();
    let (i_addr, p1_addr, p2_addr) = (addr(0x1), addr(0x2), addr(0x3));

    // P1's SF has nothing to offer.
    i.request(&RequestParams {
        command: Command::Add,
        neighbor: p1_addr,
        neighbor2: p2_addr,
        num_cells: 1,
        options: CellOptions::TX | CellOptions::ANYCAST,
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    assert!(deliver(&mut i, i_addr, &mut p1));
    assert_eq!(p1.txn_state(), TxnState::Idle);
    assert!(deliver(&mut p1, p1_addr, &mut i));
    assert_eq!(i.txn_state(), TxnState::Idle);
    assert_eq!(
        h_i.rc_errors.borrow().as_slice(),
        &[(ReturnCode::CellListErr, p1_addr)]
    );
    // No negotiated cell came out of the failed handshake (the bootstrap
    // auto cell from sending the request does not count).
    assert!(i
        .schedule()
        .next_matching(0, p1_addr, CellType::Tx)
        .is_none());
}

// ----- state conflicts and unexpected traffic -----------------------------

#[test]
fn concurrent_request_is_reset_without_touching_the_transaction() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (mut c, h_c) = make_node();
    let (a_addr, b_addr, c_addr) = (addr(0xa), addr(0xb), addr(0xc));

    // A is mid-transaction with B, response still pending.
    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));
    assert_eq!(a.txn_state(), TxnState::WaitAddResponse);

    // C knocks with its own ADD.
    let list_c = cells(&[(40, 1)]);
    c.request(&add_request(a_addr, 1, &list_c)).unwrap();
    assert!(deliver(&mut c, c_addr, &mut a));
    assert!(deliver(&mut a, a_addr, &mut c));

    assert_eq!(
        h_c.rc_errors.borrow().as_slice(),
        &[(ReturnCode::Reset, a_addr)]
    );
    assert_eq!(c.txn_state(), TxnState::Idle);
    assert!(c.schedule().cell(40).is_none());

    // A's transaction with B is unaffected and completes.
    assert_eq!(a.txn_state(), TxnState::WaitAddResponse);
    assert!(deliver(&mut b, b_addr, &mut a));
    assert_eq!(a.txn_state(), TxnState::Idle);
    assert!(a.schedule().cell(3).is_some());
}

#[test]
fn second_transaction_is_refused_while_busy() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert_eq!(
        a.request(&add_request(addr(0xc), 1, &list)),
        Err(Error::InvalidState)
    );
}

#[test]
fn late_response_after_timeout_changes_nothing() {
    let (mut a, h_a) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));

    // The response-wait timeout fires before B's answer arrives.
    let timeout = a.txn_timeout().expect("timeout armed");
    a.timer_fired(timeout);
    assert_eq!(a.txn_state(), TxnState::Idle);
    assert_eq!(
        h_a.rc_errors.borrow().as_slice(),
        &[(ReturnCode::Reset, b_addr)]
    );

    // B's late response must not install anything or move the seqnum.
    assert!(deliver(&mut b, b_addr, &mut a));
    assert!(a.schedule().cell(3).is_none());
    assert_eq!(a.neighbors().seqnum(b_addr), 0);
}

#[test]
fn responder_drops_requests_while_a_response_is_outstanding() {
    let (mut a, _) = make_node();
    let (mut b, _) = make_node();
    let (mut c, _) = make_node();
    let (a_addr, b_addr, c_addr) = (addr(0xa), addr(0xb), addr(0xc));

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));

    // B now holds an unsent response for A; C's request is dropped
    // silently, with no response queued for it.
    let list_c = cells(&[(50, 0)]);
    c.request(&add_request(b_addr, 1, &list_c)).unwrap();
    assert!(deliver(&mut c, c_addr, &mut b));
    assert!(deliver(&mut b, b_addr, &mut a)); // the response to A
    assert!(!deliver(&mut b, b_addr, &mut c)); // nothing for C
}

#[test]
fn lost_response_leaves_schedules_untouched() {
    let (mut a, h_a) = make_node();
    let (mut b, _) = make_node();
    let (a_addr, b_addr) = (addr(0xa), addr(0xb));

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert!(deliver(&mut a, a_addr, &mut b));

    // B's response dies on the wire: neither side applies anything.
    assert!(drop_frame(&mut b));
    assert!(b.schedule().cell(3).is_none());
    assert_eq!(b.neighbors().seqnum(a_addr), 0);

    let timeout = a.txn_timeout().unwrap();
    a.timer_fired(timeout);
    assert!(a.schedule().cell(3).is_none());
    assert_eq!(a.neighbors().seqnum(b_addr), 0);
    assert_eq!(
        h_a.rc_errors.borrow().as_slice(),
        &[(ReturnCode::Reset, b_addr)]
    );
}

#[test]
fn clear_timeout_applies_local_fallback() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    a.neighbors_mut().set_seqnum(b_addr, 9);
    let spec = LinkSpec {
        cell_type: CellType::Tx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(7, spec, false, 3, b_addr, MacAddress::None);

    a.request(&RequestParams {
        command: Command::Clear,
        neighbor: b_addr,
        neighbor2: MacAddress::None,
        num_cells: 0,
        options: CellOptions::empty(),
        add_cells: None,
        del_cells: None,
        sfid: SFID_MSF,
        list_offset: 0,
        list_max_cells: 0,
    })
    .unwrap();
    // Request acked, then the response never comes.
    assert!(lose_after_ack(&mut a));
    assert_eq!(a.txn_state(), TxnState::WaitClearResponse);
    let timeout = a.txn_timeout().unwrap();
    a.timer_fired(timeout);
    assert_eq!(a.txn_state(), TxnState::Idle);
    assert!(a.schedule().cells_to(b_addr).is_empty());
    assert_eq!(a.neighbors().seqnum(b_addr), 0);
}

#[test]
fn queued_request_is_preempted_by_a_new_one() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);

    // A stale, unsent request to B sits in the pool (e.g. left behind by a
    // collapsed transaction).
    let stale = a.pool_mut().allocate(Component::Sixtop).unwrap();
    {
        let pkt = a.pool_mut().get_mut(stale);
        pkt.owner = Component::SixtopToMac;
        pkt.l2_dest = b_addr;
        pkt.six_command = Command::Add as u8;
    }

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    // Exactly one request to B remains queued.
    assert!(a.next_ready_frame().is_some());
    assert!(a.next_ready_frame().is_none());
}

#[test]
fn request_fails_cleanly_when_the_pool_is_exhausted() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    while a.pool_mut().allocate(Component::Upper).is_ok() {}

    let list = cells(&[(3, 11)]);
    assert_eq!(
        a.request(&add_request(b_addr, 1, &list)),
        Err(Error::NoBuffer)
    );
    assert_eq!(a.txn_state(), TxnState::Idle);
}

#[test]
fn request_requires_a_unicast_neighbor() {
    let (mut a, _) = make_node();
    let list = cells(&[(3, 11)]);
    assert_eq!(
        a.request(&add_request(MacAddress::None, 1, &list)),
        Err(Error::NoNeighbor)
    );
    assert_eq!(
        a.request(&add_request(MacAddress::Short(SHORT_BROADCAST), 1, &list)),
        Err(Error::NoNeighbor)
    );
}

// ----- send path and auto cells -------------------------------------------

#[test]
fn unicast_send_installs_one_auto_cell() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    let (slot, channel) = autocell_offsets(b_addr.to_eui64(0xcafe).unwrap(), FRAME_LENGTH);

    for _ in 0..2 {
        let h = a.pool_mut().allocate(Component::Upper).unwrap();
        {
            let pkt = a.pool_mut().get_mut(h);
            pkt.l2_dest = b_addr;
            pkt.prepend(&[0x42]).unwrap();
        }
        a.send(h).unwrap();
    }

    let cell = a.schedule().cell(slot).expect("auto cell installed");
    assert!(cell.info.auto);
    assert_eq!(cell.info.link_type, CellType::Tx);
    assert_eq!(cell.info.neighbor, b_addr);
    assert_eq!(cell.channel, channel);
    assert_eq!(a.schedule().cells_to(b_addr).len(), 1);

    // Both frames went out with data security stamped.
    let h = a.next_ready_frame().unwrap();
    assert_eq!(a.packet(h).security, Some((SecurityLevel::EncMic32, 2)));
    assert_eq!(a.packet(h).kind, FrameKind::Data);
}

#[test]
fn no_auto_cell_when_a_negotiated_tx_cell_exists() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    let spec = LinkSpec {
        cell_type: CellType::Tx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(30, spec, false, 1, b_addr, MacAddress::None);

    let h = a.pool_mut().allocate(Component::Upper).unwrap();
    a.pool_mut().get_mut(h).l2_dest = b_addr;
    a.send(h).unwrap();
    assert_eq!(a.schedule().cells_to(b_addr), std::vec![30]);
}

#[test]
fn send_requires_a_destination() {
    let (mut a, _) = make_node();
    let h = a.pool_mut().allocate(Component::Upper).unwrap();
    assert_eq!(a.send(h), Err(Error::NoNeighbor));
}

// ----- management plane ---------------------------------------------------

#[test]
fn eb_is_emitted_with_patched_slotframe_length() {
    let (mut a, _) = make_node_with_config(Config {
        eb_portion: 1,
        ..Config::default()
    });
    a.timer_fired(EB_TIMER);

    let h = a.next_ready_frame().expect("EB queued");
    let pkt = a.packet(h);
    assert_eq!(pkt.kind, FrameKind::Beacon);
    assert!(pkt.l2_dest.is_broadcast());
    assert_eq!(pkt.asn_offset, Some(EB_ASN_OFFSET));
    assert_eq!(pkt.security, Some((SecurityLevel::Mic32, 1)));
    let payload = pkt.payload();
    assert_eq!(payload.len(), EB_IES.len());
    assert_eq!(
        &payload[EB_SLOTFRAME_LEN_OFFSET..EB_SLOTFRAME_LEN_OFFSET + 2],
        &FRAME_LENGTH.to_le_bytes()
    );

    // Busy until send-done; no second EB in between.
    a.timer_fired(EB_TIMER);
    let again = a.next_ready_frame();
    assert!(again.is_none());
    a.notify_send_done(h, true);
    a.timer_fired(EB_TIMER);
    assert!(a.next_ready_frame().is_some());
}

#[test]
fn unadvertisable_node_flushes_its_queue() {
    let (mut a, h_a) = make_node_with_config(Config {
        eb_portion: 1,
        ..Config::default()
    });
    let b_addr = addr(0xb);

    let list = cells(&[(3, 11)]);
    a.request(&add_request(b_addr, 1, &list)).unwrap();
    assert_eq!(a.txn_state(), TxnState::WaitAddReqSendDone);

    h_a.flags.borrow_mut().dao_sent = false;
    a.timer_fired(EB_TIMER);

    // The queued request is gone and the machine collapsed with it.
    assert!(a.next_ready_frame().is_none());
    assert_eq!(a.txn_state(), TxnState::Idle);
}

#[test]
fn ka_targets_the_nominated_neighbor_over_a_negotiated_cell() {
    let (mut a, _) = make_node();
    let b_addr = addr(0xb);
    a.neighbors_mut().ka_target = Some(b_addr);

    // No negotiated TX cell yet: the KA is skipped.
    a.timer_fired(MAINTENANCE_TIMER);
    assert!(a.next_ready_frame().is_none());

    let spec = LinkSpec {
        cell_type: CellType::Tx,
        shared: false,
        anycast: false,
        priority: 0,
    };
    a.schedule_mut()
        .add_slot(30, spec, false, 1, b_addr, MacAddress::None);
    a.timer_fired(MAINTENANCE_TIMER);

    let h = a.next_ready_frame().expect("KA queued");
    let pkt = a.packet(h);
    assert_eq!(pkt.l2_dest, b_addr);
    assert_eq!(pkt.kind, FrameKind::Data);
    assert_eq!(pkt.payload_len(), 0);

    // Busy flag blocks a second KA until send-done.
    a.timer_fired(MAINTENANCE_TIMER);
    assert!(a.next_ready_frame().is_none());
    a.notify_send_done(h, true);
    a.timer_fired(MAINTENANCE_TIMER);
    assert!(a.next_ready_frame().is_some());
}

#[test]
fn maintenance_counter_triggers_aging_every_period() {
    let (mut a, h_a) = make_node();
    for _ in 0..super::MAINTENANCE_PERIOD_TICKS {
        a.timer_fired(MAINTENANCE_TIMER);
    }
    assert_eq!(*h_a.aged.borrow(), 1);
    for _ in 0..super::MAINTENANCE_PERIOD_TICKS {
        a.timer_fired(MAINTENANCE_TIMER);
    }
    assert_eq!(*h_a.aged.borrow(), 2);
}
