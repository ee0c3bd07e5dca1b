//! 6P wire codec: builds outbound 6P frames by prepending header fields onto
//! a packet entry, and validates/extracts inbound ones.
//!
//! A 6P frame is an IEEE 802.15.4 payload IE (outer to inner): the 2-byte
//! IETF IE descriptor, the 6top sub-IE id, a version/type byte, the code
//! byte (command for requests, return code for responses), SFID, sequence
//! number, 2-byte metadata, then the command-specific body. All multi-byte
//! integers are little-endian; cell entries are 4 bytes each.

use byteorder::{ByteOrder, LittleEndian};

use crate::packet::PacketEntry;
use crate::Error;

/// IANA "IETF IE" payload IE group id.
pub const IANA_IETF_IE_GROUP_ID: u16 = 0x5;
/// Payload IE type bit.
pub const IANA_IETF_IE_TYPE: u16 = 0x1;
/// Sub-IE id assigned to 6top.
pub const IANA_6TOP_SUBIE_ID: u8 = 0x00;
/// 6P protocol version emitted and accepted by this implementation.
pub const IANA_6TOP_6P_VERSION: u8 = 0x00;

/// Upper bound on cells carried per 6P message, bounded by the payload IE
/// length budget of one frame.
pub const CELLLIST_MAX_LEN: usize = 8;

/// Fixed 6P header length past the 2-byte IE descriptor.
const SIXP_HDR_LEN: usize = 7;
/// Full header length including the IE descriptor.
pub const SIXP_TOTAL_HDR_LEN: usize = 2 + SIXP_HDR_LEN;

bitflags::bitflags! {
    /// Cell option bits of 6P ADD/DELETE/RELOCATE/COUNT/LIST messages.
    ///
    /// `RELAY` never describes a cell: it marks a first-step anycast ADD
    /// request whose body carries the relay target address instead of a
    /// cell list, and is stripped before the options reach the schedule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CellOptions: u8 {
        const TX = 0x01;
        const RX = 0x02;
        const SHARED = 0x04;
        const ANYCAST = 0x08;
        const PRIORITY = 0x10;
        const RELAY = 0x20;
    }
}

/// 6P message type, bits 4-5 of the version/type byte. Value 3 is reserved
/// and rejected on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Request = 0,
    Response = 1,
    Confirmation = 2,
}

/// 6P request commands. Value 6 (SIGNAL) is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add = 0x01,
    Delete = 0x02,
    Relocate = 0x03,
    Count = 0x04,
    List = 0x05,
    Clear = 0x07,
}

impl Command {
    pub fn from_wire(v: u8) -> Option<Command> {
        match v {
            0x01 => Some(Command::Add),
            0x02 => Some(Command::Delete),
            0x03 => Some(Command::Relocate),
            0x04 => Some(Command::Count),
            0x05 => Some(Command::List),
            0x07 => Some(Command::Clear),
            _ => None,
        }
    }
}

/// 6P response return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0x00,
    /// End of list; terminal success for LIST.
    Eol = 0x01,
    Error = 0x02,
    Reset = 0x03,
    VersionErr = 0x04,
    SfidErr = 0x05,
    SeqnumErr = 0x06,
    CellListErr = 0x07,
    Busy = 0x08,
    Locked = 0x09,
}

impl ReturnCode {
    pub fn from_wire(v: u8) -> Option<ReturnCode> {
        match v {
            0x00 => Some(ReturnCode::Success),
            0x01 => Some(ReturnCode::Eol),
            0x02 => Some(ReturnCode::Error),
            0x03 => Some(ReturnCode::Reset),
            0x04 => Some(ReturnCode::VersionErr),
            0x05 => Some(ReturnCode::SfidErr),
            0x06 => Some(ReturnCode::SeqnumErr),
            0x07 => Some(ReturnCode::CellListErr),
            0x08 => Some(ReturnCode::Busy),
            0x09 => Some(ReturnCode::Locked),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReturnCode::Success | ReturnCode::Eol)
    }
}

/// One scheduled slot within a slotframe. Equality is on the offsets;
/// `in_use` is bookkeeping that survives subset filtering so entries keep
/// their position in a list.
#[derive(Debug, Clone, Copy)]
pub struct CellInfo {
    pub slot_offset: u16,
    pub channel_offset: u16,
    pub in_use: bool,
}

impl CellInfo {
    pub fn new(slot_offset: u16, channel_offset: u16) -> CellInfo {
        CellInfo {
            slot_offset,
            channel_offset,
            in_use: true,
        }
    }
}

impl PartialEq for CellInfo {
    fn eq(&self, other: &CellInfo) -> bool {
        self.slot_offset == other.slot_offset && self.channel_offset == other.channel_offset
    }
}

impl Eq for CellInfo {}

/// Fixed-capacity ordered cell list. Entries are only ever marked
/// `in_use = false`, never removed, so positions are stable.
pub type CellList = heapless::Vec<CellInfo, CELLLIST_MAX_LEN>;

/// Fields of an outbound 6P request.
pub struct RequestFields<'a> {
    pub command: Command,
    pub sfid: u8,
    pub seqnum: u8,
    pub metadata: u16,
    pub options: CellOptions,
    pub num_cells: u8,
    pub add_cells: &'a CellList,
    pub del_cells: &'a CellList,
    pub list_offset: u16,
    pub list_max_cells: u16,
    /// Second receiver of a 3-step anycast ADD; replaces the (empty) cell
    /// list on the wire and sets the `RELAY` marker.
    pub relay_target: Option<[u8; 8]>,
}

/// Fields of an outbound 6P response.
pub struct ResponseFields<'a> {
    pub code: ReturnCode,
    pub sfid: u8,
    pub seqnum: u8,
    pub metadata: u16,
    pub cells: &'a CellList,
    /// COUNT responses carry a 16-bit total instead of a cell list.
    pub count: Option<u16>,
}

fn prepend_u16(pkt: &mut PacketEntry, v: u16) -> Result<(), Error> {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    pkt.prepend(&b)
}

/// Prepends the in-use entries of `cells`, preserving list order on the
/// wire. Entries marked unused are never serialized.
fn prepend_cells(pkt: &mut PacketEntry, cells: &CellList) -> Result<(), Error> {
    for cell in cells.iter().rev().filter(|c| c.in_use) {
        prepend_u16(pkt, cell.channel_offset)?;
        prepend_u16(pkt, cell.slot_offset)?;
    }
    Ok(())
}

/// Prepends the fixed 6P header and IE descriptor in front of whatever body
/// is already in the packet.
fn prepend_header(
    pkt: &mut PacketEntry,
    msg_type: MsgType,
    code: u8,
    sfid: u8,
    seqnum: u8,
    metadata: u16,
) -> Result<(), Error> {
    prepend_u16(pkt, metadata)?;
    pkt.prepend_byte(seqnum)?;
    pkt.prepend_byte(sfid)?;
    pkt.prepend_byte(code)?;
    pkt.prepend_byte(IANA_6TOP_6P_VERSION | ((msg_type as u8) << 4))?;
    pkt.prepend_byte(IANA_6TOP_SUBIE_ID)?;
    let ie_len = pkt.payload_len() as u16;
    prepend_u16(
        pkt,
        (ie_len & 0x07ff) | (IANA_IETF_IE_GROUP_ID << 11) | (IANA_IETF_IE_TYPE << 15),
    )
}

/// Assembles a complete 6P request into `pkt`. Fails with `Overflow` when
/// the frame does not fit the buffer window; the packet content is
/// unspecified after a failure and the entry should be released.
pub fn build_request(pkt: &mut PacketEntry, req: &RequestFields) -> Result<(), Error> {
    let mut options = req.options;
    match req.command {
        Command::Add => {
            if let Some(target) = req.relay_target {
                options |= CellOptions::RELAY;
                pkt.prepend(&target)?;
            } else {
                prepend_cells(pkt, req.add_cells)?;
            }
            pkt.prepend_byte(req.num_cells)?;
            pkt.prepend_byte(options.bits())?;
        }
        Command::Delete => {
            prepend_cells(pkt, req.del_cells)?;
            pkt.prepend_byte(req.num_cells)?;
            pkt.prepend_byte(options.bits())?;
        }
        Command::Relocate => {
            prepend_cells(pkt, req.add_cells)?;
            prepend_cells(pkt, req.del_cells)?;
            pkt.prepend_byte(req.num_cells)?;
            pkt.prepend_byte(options.bits())?;
        }
        Command::List => {
            prepend_u16(pkt, req.list_max_cells)?;
            prepend_u16(pkt, req.list_offset)?;
            pkt.prepend_byte(0)?; // reserved
            pkt.prepend_byte(options.bits())?;
        }
        Command::Count => {
            pkt.prepend_byte(options.bits())?;
        }
        Command::Clear => {}
    }
    prepend_header(
        pkt,
        MsgType::Request,
        req.command as u8,
        req.sfid,
        req.seqnum,
        req.metadata,
    )
}

/// Assembles a complete 6P response into `pkt`.
pub fn build_response(pkt: &mut PacketEntry, res: &ResponseFields) -> Result<(), Error> {
    if let Some(count) = res.count {
        prepend_u16(pkt, count)?;
    } else {
        prepend_cells(pkt, res.cells)?;
    }
    prepend_header(
        pkt,
        MsgType::Response,
        res.code as u8,
        res.sfid,
        res.seqnum,
        res.metadata,
    )
}

/// Why an inbound frame was rejected before reaching the handlers.
/// Rejected frames are logged and dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    WrongIe,
    WrongSubIe,
    ReservedType,
    UnknownCommand,
    BadBody,
}

/// Validated 6P header fields. The body starts `header_len` bytes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parsed {
    pub version: u8,
    pub msg_type: MsgType,
    pub code: u8,
    pub sfid: u8,
    pub seqnum: u8,
    pub metadata: u16,
    pub header_len: usize,
}

/// Validates the IE wrapper and 6P header of `buf`.
///
/// Checked here: IE group id and type bit, sub-IE id, and the reserved
/// message type 3. Version and SFID are extracted but judged by the
/// response handler, which answers them on the wire.
pub fn parse(buf: &[u8]) -> Result<Parsed, ParseError> {
    if buf.len() < SIXP_TOTAL_HDR_LEN {
        return Err(ParseError::Truncated);
    }
    let ie_hdr = LittleEndian::read_u16(&buf[0..2]);
    if (ie_hdr >> 11) & 0xf != IANA_IETF_IE_GROUP_ID || (ie_hdr >> 15) != IANA_IETF_IE_TYPE {
        return Err(ParseError::WrongIe);
    }
    if (ie_hdr & 0x07ff) as usize != buf.len() - 2 {
        return Err(ParseError::Truncated);
    }
    if buf[2] != IANA_6TOP_SUBIE_ID {
        return Err(ParseError::WrongSubIe);
    }
    let version = buf[3] & 0x0f;
    let msg_type = match (buf[3] >> 4) & 0x3 {
        0 => MsgType::Request,
        1 => MsgType::Response,
        2 => MsgType::Confirmation,
        _ => return Err(ParseError::ReservedType),
    };
    Ok(Parsed {
        version,
        msg_type,
        code: buf[4],
        sfid: buf[5],
        seqnum: buf[6],
        metadata: LittleEndian::read_u16(&buf[7..9]),
        header_len: SIXP_TOTAL_HDR_LEN,
    })
}

/// Body of a validated 6P request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Add {
        options: CellOptions,
        num_cells: u8,
        cells: CellList,
        relay_target: Option<[u8; 8]>,
    },
    Delete {
        options: CellOptions,
        num_cells: u8,
        cells: CellList,
    },
    Relocate {
        options: CellOptions,
        num_cells: u8,
        del_cells: CellList,
        add_cells: CellList,
    },
    Count {
        options: CellOptions,
    },
    List {
        options: CellOptions,
        offset: u16,
        max_cells: u16,
    },
    Clear,
}

/// Decodes a 4-byte-per-entry cell list.
pub fn parse_cell_list(body: &[u8]) -> Result<CellList, ParseError> {
    if body.len() % 4 != 0 || body.len() / 4 > CELLLIST_MAX_LEN {
        return Err(ParseError::BadBody);
    }
    let mut cells = CellList::new();
    for chunk in body.chunks_exact(4) {
        let cell = CellInfo::new(
            LittleEndian::read_u16(&chunk[0..2]),
            LittleEndian::read_u16(&chunk[2..4]),
        );
        cells.push(cell).map_err(|_| ParseError::BadBody)?;
    }
    Ok(cells)
}

/// Decodes the command-specific body of a request.
pub fn parse_request_body(command: Command, body: &[u8]) -> Result<RequestBody, ParseError> {
    match command {
        Command::Add => {
            if body.len() < 2 {
                return Err(ParseError::Truncated);
            }
            let options = CellOptions::from_bits(body[0]).ok_or(ParseError::BadBody)?;
            let num_cells = body[1];
            if options.contains(CellOptions::RELAY) {
                let rest = &body[2..];
                if rest.len() != 8 {
                    return Err(ParseError::BadBody);
                }
                let mut target = [0u8; 8];
                target.copy_from_slice(rest);
                Ok(RequestBody::Add {
                    options: options & !CellOptions::RELAY,
                    num_cells,
                    cells: CellList::new(),
                    relay_target: Some(target),
                })
            } else {
                Ok(RequestBody::Add {
                    options,
                    num_cells,
                    cells: parse_cell_list(&body[2..])?,
                    relay_target: None,
                })
            }
        }
        Command::Delete => {
            if body.len() < 2 {
                return Err(ParseError::Truncated);
            }
            let options = CellOptions::from_bits(body[0]).ok_or(ParseError::BadBody)?;
            Ok(RequestBody::Delete {
                options,
                num_cells: body[1],
                cells: parse_cell_list(&body[2..])?,
            })
        }
        Command::Relocate => {
            if body.len() < 2 {
                return Err(ParseError::Truncated);
            }
            let options = CellOptions::from_bits(body[0]).ok_or(ParseError::BadBody)?;
            let num_cells = body[1] as usize;
            let cells = parse_cell_list(&body[2..])?;
            // First num_cells entries are the relocation set, the remainder
            // are the proposed replacements.
            if cells.len() < num_cells {
                return Err(ParseError::BadBody);
            }
            let mut del_cells = CellList::new();
            let mut add_cells = CellList::new();
            for (i, cell) in cells.iter().enumerate() {
                let list = if i < num_cells {
                    &mut del_cells
                } else {
                    &mut add_cells
                };
                list.push(*cell).map_err(|_| ParseError::BadBody)?;
            }
            Ok(RequestBody::Relocate {
                options,
                num_cells: num_cells as u8,
                del_cells,
                add_cells,
            })
        }
        Command::Count => {
            if body.len() != 1 {
                return Err(ParseError::BadBody);
            }
            let options = CellOptions::from_bits(body[0]).ok_or(ParseError::BadBody)?;
            Ok(RequestBody::Count { options })
        }
        Command::List => {
            if body.len() != 6 {
                return Err(ParseError::BadBody);
            }
            let options = CellOptions::from_bits(body[0]).ok_or(ParseError::BadBody)?;
            Ok(RequestBody::List {
                options,
                offset: LittleEndian::read_u16(&body[2..4]),
                max_cells: LittleEndian::read_u16(&body[4..6]),
            })
        }
        Command::Clear => {
            if !body.is_empty() {
                return Err(ParseError::BadBody);
            }
            Ok(RequestBody::Clear)
        }
    }
}

/// Decodes the 16-bit total of a COUNT response.
pub fn parse_count(body: &[u8]) -> Result<u16, ParseError> {
    if body.len() != 2 {
        return Err(ParseError::BadBody);
    }
    Ok(LittleEndian::read_u16(body))
}
