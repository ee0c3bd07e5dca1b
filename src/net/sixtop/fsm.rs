//! Transaction state machine. One node admits at most one outstanding 6P
//! transaction; its context and state live here, while the event handlers
//! driving the transitions (send-done, receive, timeout) live in the parent
//! module.
//!
//! Every command walks the same two-step shape:
//!
//! ```text
//! IDLE --request(OP)--> WAIT_<OP>_REQ_SENDDONE --acked--> WAIT_<OP>_RESPONSE --response--> IDLE
//! ```
//!
//! The single irregular transition is the 3-step anycast ADD: the middle
//! node of the handshake leaves WAIT_ADDREQUEST_SENDDONE for
//! `WaitAddRequest` instead of the response-wait state, keyed on
//! `neighbor_ongoing_3step`.

use crate::net::ieee802154::MacAddress;
use crate::net::sixtop::frame::{CellList, CellOptions, Command};
use crate::time::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    WaitAddReqSendDone,
    WaitAddResponse,
    WaitDeleteReqSendDone,
    WaitDeleteResponse,
    WaitRelocateReqSendDone,
    WaitRelocateResponse,
    WaitCountReqSendDone,
    WaitCountResponse,
    WaitListReqSendDone,
    WaitListResponse,
    WaitClearReqSendDone,
    WaitClearResponse,
    /// Middle node of a 3-step anycast ADD, holding the initiator's request
    /// open while its own relayed request runs against the second receiver.
    WaitAddRequest,
}

impl TxnState {
    /// State entered when the request for `command` is handed to the MAC.
    pub fn senddone_wait(command: Command) -> TxnState {
        match command {
            Command::Add => TxnState::WaitAddReqSendDone,
            Command::Delete => TxnState::WaitDeleteReqSendDone,
            Command::Relocate => TxnState::WaitRelocateReqSendDone,
            Command::Count => TxnState::WaitCountReqSendDone,
            Command::List => TxnState::WaitListReqSendDone,
            Command::Clear => TxnState::WaitClearReqSendDone,
        }
    }

    /// State entered once the request was acked and a response is awaited.
    pub fn response_wait(command: Command) -> TxnState {
        match command {
            Command::Add => TxnState::WaitAddResponse,
            Command::Delete => TxnState::WaitDeleteResponse,
            Command::Relocate => TxnState::WaitRelocateResponse,
            Command::Count => TxnState::WaitCountResponse,
            Command::List => TxnState::WaitListResponse,
            Command::Clear => TxnState::WaitClearResponse,
        }
    }

    /// The command a non-idle state belongs to.
    pub fn command(self) -> Option<Command> {
        match self {
            TxnState::Idle => None,
            TxnState::WaitAddReqSendDone
            | TxnState::WaitAddResponse
            | TxnState::WaitAddRequest => Some(Command::Add),
            TxnState::WaitDeleteReqSendDone | TxnState::WaitDeleteResponse => {
                Some(Command::Delete)
            }
            TxnState::WaitRelocateReqSendDone | TxnState::WaitRelocateResponse => {
                Some(Command::Relocate)
            }
            TxnState::WaitCountReqSendDone | TxnState::WaitCountResponse => Some(Command::Count),
            TxnState::WaitListReqSendDone | TxnState::WaitListResponse => Some(Command::List),
            TxnState::WaitClearReqSendDone | TxnState::WaitClearResponse => Some(Command::Clear),
        }
    }

    pub fn is_response_wait(self) -> bool {
        matches!(
            self,
            TxnState::WaitAddResponse
                | TxnState::WaitDeleteResponse
                | TxnState::WaitRelocateResponse
                | TxnState::WaitCountResponse
                | TxnState::WaitListResponse
                | TxnState::WaitClearResponse
        )
    }
}

/// Context of the (single) in-flight transaction.
#[derive(Debug)]
pub struct TxnContext {
    pub state: TxnState,
    /// Primary peer: the node the request went to. On the middle node of a
    /// 3-step handshake this is the second receiver being relayed to.
    pub neighbor_first: MacAddress,
    /// Secondary peer of an anycast reservation (initiator side).
    pub neighbor_second: MacAddress,
    /// Peer of a pending CLEAR, kept for the local fallback on failure.
    pub neighbor_clear: MacAddress,
    /// Set iff this node is the middle of a 3-step handshake: the
    /// initiator the held-open request came from.
    pub neighbor_ongoing_3step: MacAddress,
    /// Options of the running transaction, requester view.
    pub cell_options: CellOptions,
    /// Snapshot of the cells a RELOCATE will remove once it succeeds.
    pub cells_to_delete: CellList,
    /// Response-wait timeout, armed on the senddone edge.
    pub timeout_timer: Option<TimerId>,
}

impl TxnContext {
    pub fn new() -> TxnContext {
        TxnContext {
            state: TxnState::Idle,
            neighbor_first: MacAddress::None,
            neighbor_second: MacAddress::None,
            neighbor_clear: MacAddress::None,
            neighbor_ongoing_3step: MacAddress::None,
            cell_options: CellOptions::empty(),
            cells_to_delete: CellList::new(),
            timeout_timer: None,
        }
    }

    /// Collapses back to IDLE. The timeout timer must already have been
    /// canceled or fired; this only forgets the handle.
    pub fn reset(&mut self) {
        *self = TxnContext::new();
    }

    pub fn is_idle(&self) -> bool {
        self.state == TxnState::Idle
    }
}
