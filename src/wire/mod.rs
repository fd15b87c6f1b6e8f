//! AKARI-UDP Wire Format
//!
//! Defines the v3 datagram layout and the authenticated encode/decode
//! paths. Every datagram starts with a fixed header:
//!
//! ```text
//! [magic "AK":2][version:1][kind:1][flags:1][reserved:1]
//! [identifier:2|8][seq:2][seq_total:2][payload_len:2][timestamp:4*]
//! ```
//!
//! All multi-byte integers are big-endian. The identifier is 2 bytes when
//! the short-identifier flag is set, 8 bytes otherwise; the 32-bit
//! wall-clock timestamp is present only in the long-identifier variant.
//!
//! Authentication trails the payload: a 16-byte truncated HMAC-SHA-256
//! over `header || payload` in plaintext mode, or the Poly1305 tag of the
//! XChaCha20-Poly1305 construction (payload encrypted, header as AAD) when
//! the encrypt flag is set. Under the aggregate-tag flag, intermediate
//! response-body datagrams omit the per-datagram tag entirely.

mod crypto;
mod debug;
mod decode;
mod encode;
mod payload;
#[cfg(test)]
mod tests;

pub use crypto::{aggregate_tag, PskKey, TAG_LEN};
pub use debug::debug_dump;
pub use decode::{decode_packet, Codec};
pub use encode::{
    encode_ack, encode_error, encode_nack_body, encode_nack_head, encode_request,
    encode_resp_body, encode_resp_head, encode_resp_head_cont,
};
pub use payload::{
    AckPayload, ErrorPayload, NackPayload, Packet, Payload, ReqPayload, RequestMethod,
    RespBodyPayload, RespHeadPayload,
};

use thiserror::Error;

/// Protocol magic, the first two bytes of every datagram.
pub const MAGIC: [u8; 2] = *b"AK";

/// Legacy versions, recognized only to be rejected with an error reply.
pub const VERSION_V1: u8 = 0x01;
pub const VERSION_V2: u8 = 0x02;
/// Current protocol version, the only one either engine speaks.
pub const VERSION_V3: u8 = 0x03;

/// Payload is encrypted with XChaCha20-Poly1305 (header as AAD).
pub const FLAG_ENCRYPT: u8 = 0x80;
/// One aggregate tag over the whole body instead of per-datagram tags.
pub const FLAG_AGG_TAG: u8 = 0x40;
/// Identifier field is 16-bit; header carries no timestamp.
pub const FLAG_SHORT_ID: u8 = 0x20;
/// RespHead body length field is 24-bit.
pub const FLAG_SHORT_LEN: u8 = 0x10;
/// Marks a head datagram that completes an empty-body response.
pub const FLAG_FINAL: u8 = 0x08;

/// The bits that must stay identical across every datagram of a request.
/// FINAL is a per-datagram marker and is excluded.
pub const NEGOTIATED_FLAGS: u8 = FLAG_ENCRYPT | FLAG_AGG_TAG | FLAG_SHORT_ID | FLAG_SHORT_LEN;

/// Sentinel first-lost value meaning "all sequences received".
pub const ACK_ALL_RECEIVED: u16 = 0xFFFF;

/// Errors from wire-level encoding, decoding, and the receive gate.
///
/// Every rejection is local and silent at the packet layer; engines count
/// them and move on. Only `ProtocolViolation` (an encode-side refusal) is
/// surfaced to callers directly.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    #[error("unsupported version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("authentication failed")]
    AuthFailed,

    #[error("duplicate datagram inside the replay window")]
    Replay,

    #[error("timestamp outside the acceptance window")]
    Stale,

    #[error("payload size {0} exceeds the 16-bit wire limit")]
    PayloadTooLarge(usize),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("format error: {0}")]
    Fmt(#[from] std::fmt::Error),
}

/// Datagram kinds carried in the header's kind field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Target URL plus optional request header block.
    Req = 0,
    /// Status code, declared body length, first header-block chunk.
    RespHead = 1,
    /// Continuation header-block chunk.
    RespHeadCont = 2,
    /// One body chunk (or the parity chunk at the final index).
    RespBody = 3,
    /// Bitmap of missing head-chunk indices.
    NackHead = 4,
    /// Bitmap of missing body sequences.
    NackBody = 5,
    /// Numeric code, HTTP status hint, short message.
    Error = 6,
    /// First-lost sequence report.
    Ack = 7,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketKind::Req),
            1 => Some(PacketKind::RespHead),
            2 => Some(PacketKind::RespHeadCont),
            3 => Some(PacketKind::RespBody),
            4 => Some(PacketKind::NackHead),
            5 => Some(PacketKind::NackBody),
            6 => Some(PacketKind::Error),
            7 => Some(PacketKind::Ack),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Kinds that carry response state to the initiator. These are the
    /// kinds the initiator-side replay gate protects; control kinds are
    /// exempt because recovery depends on their duplicates.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            PacketKind::RespHead | PacketKind::RespHeadCont | PacketKind::RespBody | PacketKind::Error
        )
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Req => "Req",
            PacketKind::RespHead => "RespHead",
            PacketKind::RespHeadCont => "RespHeadCont",
            PacketKind::RespBody => "RespBody",
            PacketKind::NackHead => "NackHead",
            PacketKind::NackBody => "NackBody",
            PacketKind::Error => "Error",
            PacketKind::Ack => "Ack",
        };
        write!(f, "{}", name)
    }
}

/// Fixed header portion shared by both identifier widths:
/// magic + version + kind + flags + reserved + seq + seq_total + payload_len.
const FIXED_LEN: usize = 2 + 1 + 1 + 1 + 1 + 2 + 2 + 2;

/// Long-identifier header length: fixed part + 8-byte id + 4-byte timestamp.
pub const HEADER_LEN_LONG: usize = FIXED_LEN + 8 + 4;
/// Short-identifier header length: fixed part + 2-byte id, no timestamp.
pub const HEADER_LEN_SHORT: usize = FIXED_LEN + 2;

/// Parsed v3 datagram header.
///
/// In short-identifier mode `identifier` holds the 16-bit value
/// zero-extended and `timestamp` is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: PacketKind,
    pub flags: u8,
    pub identifier: u64,
    pub seq: u16,
    pub seq_total: u16,
    pub payload_len: u16,
    /// Wall-clock seconds; absent (zero) in short-identifier mode.
    pub timestamp: u32,
}

impl Header {
    /// Encoded length for this header's flag set.
    pub fn encoded_len(&self) -> usize {
        header_len(self.flags)
    }

    pub fn short_id(&self) -> bool {
        self.flags & FLAG_SHORT_ID != 0
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPT != 0
    }

    /// Serialize to the exact wire bytes (used verbatim as AEAD AAD).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION_V3);
        buf.push(self.kind.to_byte());
        buf.push(self.flags);
        buf.push(0); // reserved
        if self.short_id() {
            buf.extend_from_slice(&(self.identifier as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&self.identifier.to_be_bytes());
        }
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.seq_total.to_be_bytes());
        buf.extend_from_slice(&self.payload_len.to_be_bytes());
        if !self.short_id() {
            buf.extend_from_slice(&self.timestamp.to_be_bytes());
        }
        buf
    }

    /// Parse a header from the front of a datagram.
    ///
    /// Only the magic and version are inspected before anything else; all
    /// later fields stay untrusted until the caller has verified the tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN_SHORT {
            return Err(WireError::Malformed("datagram shorter than minimum header"));
        }
        if bytes[0..2] != MAGIC {
            return Err(WireError::Malformed("bad magic"));
        }
        let version = bytes[2];
        if version != VERSION_V3 {
            return Err(WireError::UnsupportedVersion(version));
        }
        let kind = PacketKind::from_byte(bytes[3])
            .ok_or(WireError::Malformed("unknown packet kind"))?;
        let flags = bytes[4];
        if bytes[5] != 0 {
            return Err(WireError::Malformed("reserved byte nonzero"));
        }

        let short_id = flags & FLAG_SHORT_ID != 0;
        if !short_id && bytes.len() < HEADER_LEN_LONG {
            return Err(WireError::Malformed("datagram shorter than long header"));
        }

        let mut off = 6;
        let identifier = if short_id {
            let id = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
            off += 2;
            u64::from(id)
        } else {
            let id = u64::from_be_bytes(bytes[off..off + 8].try_into().expect("8-byte slice"));
            off += 8;
            id
        };
        let seq = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
        let seq_total = u16::from_be_bytes([bytes[off + 2], bytes[off + 3]]);
        let payload_len = u16::from_be_bytes([bytes[off + 4], bytes[off + 5]]);
        off += 6;
        let timestamp = if short_id {
            0
        } else {
            u32::from_be_bytes(bytes[off..off + 4].try_into().expect("4-byte slice"))
        };

        Ok(Header {
            kind,
            flags,
            identifier,
            seq,
            seq_total,
            payload_len,
            timestamp,
        })
    }
}

/// Header length implied by a flag set.
pub fn header_len(flags: u8) -> usize {
    if flags & FLAG_SHORT_ID != 0 {
        HEADER_LEN_SHORT
    } else {
        HEADER_LEN_LONG
    }
}
