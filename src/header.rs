//! CCSDS primary header: the fixed 6-byte, 48-bit-packed prefix of every Space Packet.
//!
//! This is the one piece of the wire format whose layout is load-bearing and fixed, so (unlike
//! the dynamically-defined user data) it is described with a compile-time bitfield rather than
//! parsed field-by-field at runtime.

use modular_bitfield_msb::prelude::*;

/// Link-layer header found at the start of every CCSDS Space Packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PrimaryHeader {
    pub version: B3,
    pub packet_type: bool,
    pub sec_hdr_flag: bool,
    pub apid: B11,
    pub seq_flags: B2,
    pub seq_count: B14,
    /// User-data length in bytes, minus 1. Total packet size is `7 + pkt_len` bytes.
    pub pkt_len: B16,
}

/// Byte length of [`PrimaryHeader`].
pub const PRIMARY_HEADER_BYTES: usize = 6;

/// Default names of the seven primary-header fields, in declaration order, as they are inserted
/// into a packet's parse context. Overridable via
/// [`crate::generator::GeneratorConfig::header_name_map`].
pub const DEFAULT_HEADER_NAMES: [&str; 7] = [
    "VERSION",
    "TYPE",
    "SEC_HDR_FLG",
    "PKT_APID",
    "SEQ_FLGS",
    "SRC_SEQ_CTR",
    "PKT_LEN",
];

impl PrimaryHeader {
    /// Total packet size in bytes, including this header: `7 + pkt_len`.
    pub fn total_packet_bytes(&self) -> usize {
        PRIMARY_HEADER_BYTES + 1 + self.pkt_len() as usize
    }

    /// Decodes the 6-byte CCSDS primary header.
    pub fn parse(bytes: &[u8; PRIMARY_HEADER_BYTES]) -> Self {
        Self::from_bytes(*bytes)
    }
}
