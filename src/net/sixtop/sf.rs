//! Scheduling Function dispatch. The SF is the allocation policy sitting on
//! top of 6P (MSF being the minimal default); the transaction machine calls
//! back into it through this narrow capability interface and never decides
//! which cells to ask for on its own.

use crate::net::ieee802154::MacAddress;
use crate::net::sixtop::frame::{CellList, ReturnCode};

/// SFID registered for the Minimal Scheduling Function.
pub const SFID_MSF: u8 = 0;

/// A receiver's interpretation of the 2-byte metadata field of 6P
/// requests. This implementation produces and requires slotframe ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    FrameId,
    Other,
}

/// Callbacks registered by the active Scheduling Function. Implementations
/// are zero-sized where possible; all calls are synchronous.
pub trait SchedulingFunction {
    /// Identifier stamped into outgoing requests and checked on incoming
    /// ones.
    fn sfid(&self) -> u8;

    /// Metadata for outgoing requests: the current slotframe id.
    fn metadata(&self) -> u16;

    /// How this node reads the metadata of incoming requests. Anything but
    /// `FrameId` makes the responder answer `ERROR`.
    fn translate_metadata(&self) -> MetadataKind;

    /// A transaction ended with a non-success code (or collapsed on a
    /// timeout, reported as `RESET`); the SF decides whether to retry,
    /// reselect, or issue a CLEAR.
    fn handle_rc_error(&mut self, code: ReturnCode, peer: MacAddress);

    /// Fills `cells` with up to `num_cells` candidate cells this node can
    /// offer as a responder (used when relaying a 3-step anycast ADD).
    /// Returns false when no candidates are available.
    fn candidate_add_cell_list(&mut self, cells: &mut CellList, num_cells: u8) -> bool;
}
