//! Link-layer types shared across the sublayer: addresses, frame kinds and
//! the security attributes stamped onto outgoing packets.

pub type PanId = u16;

pub const SHORT_BROADCAST: u16 = 0xffff;

/// A link-layer destination or neighbor identity.
///
/// `Ip6` appears when an upper layer hands down a packet that still names
/// its IPv6 next hop; `Anycast` marks frames whose acknowledgment may come
/// from any of several named receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAddress {
    None,
    Short(u16),
    Long([u8; 8]),
    Ip6(u128),
    Anycast,
}

impl MacAddress {
    pub fn is_none(&self) -> bool {
        matches!(self, MacAddress::None)
    }

    /// Broadcast/multicast is detected on the short form only.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, MacAddress::Short(SHORT_BROADCAST))
    }

    /// True for addresses a unicast frame can be sent to.
    pub fn is_unicast(&self) -> bool {
        match self {
            MacAddress::Short(a) => *a != SHORT_BROADCAST,
            MacAddress::Long(_) => true,
            _ => false,
        }
    }

    /// EUI-64 form of the address, used by the auto-cell hash. Short
    /// addresses expand with the PAN id the way 6LoWPAN derives interface
    /// identifiers from 16-bit addresses.
    pub fn to_eui64(&self, pan_id: PanId) -> Option<[u8; 8]> {
        match self {
            MacAddress::Long(b) => Some(*b),
            MacAddress::Short(s) if *s != SHORT_BROADCAST => Some([
                0,
                0,
                pan_id as u8,
                (pan_id >> 8) as u8,
                0,
                0,
                *s as u8,
                (s >> 8) as u8,
            ]),
            _ => None,
        }
    }
}

/// IEEE 802.15.4 security levels, in on-wire encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    None = 0,
    Mic32 = 1,
    Mic64 = 2,
    Mic128 = 3,
    Enc = 4,
    EncMic32 = 5,
    EncMic64 = 6,
    EncMic128 = 7,
}

/// Key index into the security module's key store.
pub type KeyId = u8;

/// Frame classes this layer originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Beacon,
    Data,
}
