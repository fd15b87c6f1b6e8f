//! Typed datagram payloads.
//!
//! Kind-specific fields are modelled as a tagged sum so dispatch is
//! exhaustive at compile time.

use super::{Header, WireError};

/// Request method carried in the Req payload's first byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestMethod {
    Get = 0,
    Head = 1,
    Post = 2,
}

impl RequestMethod {
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(RequestMethod::Get),
            1 => Ok(RequestMethod::Head),
            2 => Ok(RequestMethod::Post),
            _ => Err(WireError::Malformed("unsupported request method")),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestMethod::Get => "GET",
            RequestMethod::Head => "HEAD",
            RequestMethod::Post => "POST",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReqPayload {
    pub method: RequestMethod,
    pub url: String,
    /// Encoded request header block; empty for a bare GET.
    pub header_block: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RespHeadPayload {
    pub status_code: u16,
    /// Declared body length in bytes.
    pub body_len: u32,
    /// Total number of header-block chunks.
    pub hdr_chunks: u8,
    /// Index of the chunk carried by this datagram.
    pub hdr_idx: u8,
    pub header_block: Vec<u8>,
    /// Whole response body carried inline. Only legal on a final-marker
    /// head with a body sequence total of zero: small responses collapse
    /// into a single datagram.
    pub inline_body: Vec<u8>,
    /// Body datagram total from the header's seq_total field.
    pub body_seq_total: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RespBodyPayload {
    pub seq: u16,
    pub seq_total: u16,
    pub chunk: Vec<u8>,
    /// Aggregate tag, present only on the final-index datagram of an
    /// aggregate-tag response.
    pub agg_tag: Option<[u8; 16]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NackPayload {
    /// Missing-sequence bitmap, bit `i` of byte `i / 8` (LSB first).
    pub bitmap: Vec<u8>,
}

impl NackPayload {
    /// Iterate the sequence numbers whose bits are set.
    pub fn set_bits(&self) -> impl Iterator<Item = u16> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(byte_idx, byte)| {
            (0..8u16).filter_map(move |bit| {
                if byte & (1 << bit) != 0 {
                    Some(byte_idx as u16 * 8 + bit)
                } else {
                    None
                }
            })
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckPayload {
    /// Lowest missing sequence, or `ACK_ALL_RECEIVED`.
    pub first_lost: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error_code: u8,
    pub http_status: u16,
    pub message: String,
}

/// Decoded kind-specific payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Req(ReqPayload),
    RespHead(RespHeadPayload),
    RespHeadCont {
        hdr_chunks: u8,
        hdr_idx: u8,
        header_block: Vec<u8>,
    },
    RespBody(RespBodyPayload),
    NackHead(NackPayload),
    NackBody(NackPayload),
    Error(ErrorPayload),
    Ack(AckPayload),
}

/// A fully decoded and authenticated datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Payload,
}
