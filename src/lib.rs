//! Implements the 6top sublayer of an IEEE 802.15.4e TSCH mesh stack: the
//! distributed scheduling plane that negotiates per-pair cell reservations
//! between neighboring nodes on top of a shared slotframe, as defined by the
//! IETF 6TiSCH architecture. The wire protocol is 6P.
//!
//! The layer exposes a send interface to upper layers and drives the MAC
//! through a shared packet pool; frames the MAC completed or received come
//! back in through `notify_send_done` and `notify_receive`. A Scheduling
//! Function (the allocation policy, e.g. MSF) sits on top and asks this layer
//! to add, delete, relocate, count or list cells with a given neighbor; the
//! resulting 6P transactions are run by a single-slot state machine,
//! including a three-step anycast variant for dual-parent reservations.
//! Periodic management traffic (Enhanced Beacons and Keep-Alives) is emitted
//! from the same layer, gated on synchronization and routing state.
//!
//! ```text
//! Transmit:                           Receive:
//!
//!   +-------------------+              +-------------------+
//!   | SF / Upper layers |              |  TransactionFSM   |
//!   +-------------------+              | / ResponseHandler |
//!        |                             +-------------------+
//!   request(..) / send(..)                  ^
//!        |                                  |
//!        v                             notify_receive(..)
//!   +----------+                            |
//!   |  Sixtop  |                       +----------+
//!   +----------+                       |  Sixtop  |
//!        |                             +----------+
//!   next_ready_frame()                      ^
//!        |                                  |
//!        v                                  |
//!   +----------+                       +----------+
//!   |   MAC    |                       |   MAC    |
//!   +----------+                       +----------+
//! ```
//!
//! The slot engine, packet radio, schedule table, neighbor table, timer
//! service and security store are external collaborators reached through the
//! traits in [`net::sixtop::schedule`], [`net::neighbors`], [`time`] and
//! [`net::sixtop::NodeState`]. All of the layer's own state lives in a
//! single [`net::sixtop::Sixtop`] value; every entry point runs to
//! completion on the caller's (cooperative) task.

#![cfg_attr(not(test), no_std)]

pub mod net;
pub mod packet;
pub mod time;

/// Errors surfaced to local callers of the 6top layer.
///
/// Wire-level outcomes of a 6P exchange are a separate space, see
/// [`net::sixtop::frame::ReturnCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The transaction machine is busy or a precondition does not hold.
    InvalidState,
    /// No usable destination neighbor was supplied.
    NoNeighbor,
    /// The packet pool is exhausted.
    NoBuffer,
    /// The composed frame exceeds the buffer window.
    Overflow,
    /// Malformed or unsupported frame content.
    Protocol,
}
