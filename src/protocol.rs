//! Wire-level constants for the EMC line protocol.
//!
//! EMC frames are 7-bit ASCII lines terminated by `\n` (or `\r\n` on input).
//! The first byte of a line classifies it; bytes in `[0x80, 0xfe]` open a
//! binary packet instead, carrying the channel as `0xff - byte`.

/// Line tag: request (`?i`, `?g ...`, `?o ...`).
pub const TAG_REQUEST: u8 = b'?';
/// Line tag: response (`]i ...`, `]00 READY.`).
pub const TAG_RESPONSE: u8 = b']';
/// Line tag: sync request, no body. Asks a host for a full state dump.
pub const TAG_SYNC: u8 = b'@';
/// Line tag: help request, no body.
pub const TAG_HELP: u8 = b'!';

pub const REQUEST_INFO: u8 = b'i';
pub const REQUEST_PING: u8 = b'g';
pub const REQUEST_BYE: u8 = b'z';
pub const REQUEST_SERVICE: u8 = b's';

pub const RESPONSE_INFO: u8 = b'i';
pub const RESPONSE_SERVICE: u8 = b's';
pub const RESPONSE_SUPPORT: u8 = b's';
pub const RESPONSE_CHANNEL: u8 = b'c';
pub const RESPONSE_PONG: u8 = b'g';
pub const RESPONSE_BYE: u8 = b'z';

/// Event tag appended to support/channel responses when a resource comes up.
pub const ENABLE_TAG: u8 = b'+';
/// Event tag appended to support/channel responses when a resource goes away.
pub const DISABLE_TAG: u8 = b'-';

pub const PROTOCOL_NAME: &str = "emc";
pub const PROTOCOL_VERSION: &str = "1.0";

/// Remote endpoint name, at most this many bytes.
pub const NAME_SIZE: usize = 24;
/// Remote endpoint info string (machine type), at most this many bytes.
pub const INFO_SIZE: usize = 8;

pub const MACHINE_NAME_NONE: &str = "(anonymous)";
pub const MACHINE_TYPE_GENERIC: &str = "generic";
pub const ORDER_LE: &str = "le";
pub const ORDER_BE: &str = "be";

/// Byte that opens a packet for channel 1; channel `c` maps to `0xff - c`.
pub const PACKET_MARKER_BASE: u8 = 0xff;
/// Packet header: one marker byte plus three hex digits of `size / 8`.
pub const PACKET_HEAD_SIZE: usize = 4;
/// Packet bodies are zero-padded to a multiple of this.
pub const PACKET_SIZE_MULTIPLIER: usize = 8;
/// Largest representable packet body: the three hex header digits encode
/// `size / 8`, so the rounded body tops out at `0xfff * 8`.
pub const PACKET_SIZE_MAX: usize = 0xfff * PACKET_SIZE_MULTIPLIER;

/// Channel identifiers live in `[CHID_MIN, CHID_MAX]`.
pub const CHID_MIN: u8 = 1;
pub const CHID_MAX: u8 = 127;

pub const NUL: u8 = 0x00;
pub const EOL: u8 = b'\n';
pub const RET: u8 = b'\r';
pub const SPC: u8 = b' ';
/// Upper bound of the printable ASCII range; `0x7f` itself is consumed silently.
pub const ASCII_MAX: u8 = 0x7f;

/// Endpoint role: which side of the request/response contract this reactor
/// plays. A host answers requests and never issues them; a user issues
/// requests and consumes responses; a proxy relays without responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undef,
    Host,
    User,
    Proxy,
}

/// Environment scope of a reactor's link, ordered from most to least remote.
/// Stages gate behaviour on it; the ping timer, for one, only runs on
/// [`Ring::Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ring {
    Network,
    Machine,
    Session,
    Process,
}

/// Render a packet header for `channel` and a body of `rounded` bytes
/// (already rounded to [`PACKET_SIZE_MULTIPLIER`]).
pub(crate) fn packet_header(channel: u8, rounded: usize) -> [u8; PACKET_HEAD_SIZE] {
    let eights = rounded / PACKET_SIZE_MULTIPLIER;
    let digits = format!("{eights:03x}");
    let d = digits.as_bytes();
    [PACKET_MARKER_BASE - channel, d[0], d[1], d[2]]
}

/// Round `size` up to the packet size multiplier.
pub(crate) fn round_packet_size(size: usize) -> usize {
    size.div_ceil(PACKET_SIZE_MULTIPLIER) * PACKET_SIZE_MULTIPLIER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_geometry() {
        assert_eq!(PACKET_SIZE_MAX, 32760);
        assert_eq!(round_packet_size(0), 0);
        assert_eq!(round_packet_size(1), 8);
        assert_eq!(round_packet_size(8), 8);
        assert_eq!(round_packet_size(9), 16);
        // the maximum rounded body still fits the three header digits
        assert_eq!(packet_header(1, PACKET_SIZE_MAX), [0xfe, b'f', b'f', b'f']);
    }

    #[test]
    fn packet_header_encoding() {
        // Channel 5, empty body: the wire bytes `\xfa000`.
        assert_eq!(packet_header(5, 0), [0xfa, b'0', b'0', b'0']);
        // Channel 1, 16-byte body -> two eights.
        assert_eq!(packet_header(1, 16), [0xfe, b'0', b'0', b'2']);
        // Channel 127 maps to the lowest marker byte.
        assert_eq!(packet_header(127, 8)[0], 0x80);
    }

    #[test]
    fn ring_ordering() {
        assert!(Ring::Network < Ring::Machine);
        assert!(Ring::Session < Ring::Process);
    }
}
