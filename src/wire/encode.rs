//! Datagram builders.
//!
//! Each builder assembles the kind-specific payload, stamps the header,
//! and finalizes authentication. The returned bytes are exactly what goes
//! on the wire; the responder caches them verbatim for retransmission.

use super::crypto::{PskKey, TAG_LEN};
use super::{
    Header, PacketKind, RequestMethod, WireError, FLAG_AGG_TAG, FLAG_ENCRYPT,
};

/// Longest single-datagram payload the 16-bit length field can carry.
const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Longest error message emitted on the wire; anything longer is truncated.
const ERROR_MESSAGE_MAX: usize = 200;

fn ensure_payload_size(total: usize) -> Result<u16, WireError> {
    if total > MAX_PAYLOAD {
        Err(WireError::PayloadTooLarge(total))
    } else {
        Ok(total as u16)
    }
}

/// Append authentication and produce the final wire bytes.
///
/// `include_tag` is false only for intermediate aggregate-tag body
/// datagrams, which carry no per-datagram tag.
fn finalize_packet(
    header: &Header,
    payload: &[u8],
    key: &PskKey,
    include_tag: bool,
) -> Result<Vec<u8>, WireError> {
    if header.flags & FLAG_ENCRYPT != 0 && header.flags & FLAG_AGG_TAG != 0 {
        return Err(WireError::ProtocolViolation(
            "encrypt and aggregate-tag are mutually exclusive under per-datagram AEAD",
        ));
    }
    debug_assert_eq!(payload.len(), header.payload_len as usize);

    let header_bytes = header.to_bytes();
    let mut buf = Vec::with_capacity(header_bytes.len() + payload.len() + TAG_LEN);
    buf.extend_from_slice(&header_bytes);
    if header.encrypted() {
        let (ciphertext, tag) = key.seal(header, payload)?;
        buf.extend_from_slice(&ciphertext);
        buf.extend_from_slice(&tag);
    } else if include_tag {
        buf.extend_from_slice(payload);
        let tag = key.tag(&buf);
        buf.extend_from_slice(&tag);
    } else {
        buf.extend_from_slice(payload);
    }
    Ok(buf)
}

/// Encode a request datagram.
pub fn encode_request(
    method: RequestMethod,
    url: &str,
    header_block: &[u8],
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    let url_bytes = url.as_bytes();
    if url_bytes.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(url_bytes.len()));
    }
    let payload_len = ensure_payload_size(1 + 2 + 2 + url_bytes.len() + header_block.len())?;
    let header = Header {
        kind: PacketKind::Req,
        flags,
        identifier,
        seq: 0,
        seq_total: 1,
        payload_len,
        timestamp,
    };
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.push(method.to_byte());
    payload.extend_from_slice(&(url_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&(header_block.len() as u16).to_be_bytes());
    payload.extend_from_slice(url_bytes);
    payload.extend_from_slice(header_block);
    finalize_packet(&header, &payload, key, true)
}

/// Encode the first response-head datagram: status, declared body length,
/// header-chunk bookkeeping, the first header-block chunk, and, for a
/// single-datagram response, the whole body inline.
///
/// `body_seq_total` is the body datagram total including parity; zero with
/// the final-marker flag set means the body (possibly empty) travels
/// inline and no body datagrams follow.
#[allow(clippy::too_many_arguments)]
pub fn encode_resp_head(
    status_code: u16,
    body_len: u32,
    hdr_chunk: &[u8],
    hdr_chunks: u8,
    hdr_idx: u8,
    inline_body: &[u8],
    body_seq_total: u16,
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    if !inline_body.is_empty() && body_seq_total != 0 {
        return Err(WireError::ProtocolViolation(
            "inline body with a nonzero body sequence total",
        ));
    }
    if flags & super::FLAG_SHORT_LEN != 0 && body_len > 0x00FF_FFFF {
        return Err(WireError::PayloadTooLarge(body_len as usize));
    }
    let len_field = if flags & super::FLAG_SHORT_LEN != 0 { 3 } else { 4 };
    let payload_len =
        ensure_payload_size(2 + len_field + 1 + 1 + 2 + hdr_chunk.len() + inline_body.len())?;
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.extend_from_slice(&status_code.to_be_bytes());
    if len_field == 3 {
        payload.extend_from_slice(&body_len.to_be_bytes()[1..]);
    } else {
        payload.extend_from_slice(&body_len.to_be_bytes());
    }
    payload.push(hdr_chunks);
    payload.push(hdr_idx);
    payload.extend_from_slice(&(hdr_chunk.len() as u16).to_be_bytes());
    payload.extend_from_slice(hdr_chunk);
    payload.extend_from_slice(inline_body);

    let header = Header {
        kind: PacketKind::RespHead,
        flags,
        identifier,
        seq: 0,
        seq_total: body_seq_total,
        payload_len,
        timestamp,
    };
    finalize_packet(&header, &payload, key, true)
}

/// Encode a continuation header-block chunk. Head continuations always
/// carry per-datagram tags, aggregate-tag mode included.
pub fn encode_resp_head_cont(
    hdr_chunk: &[u8],
    hdr_chunks: u8,
    hdr_idx: u8,
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    let payload_len = ensure_payload_size(1 + 1 + hdr_chunk.len())?;
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.push(hdr_chunks);
    payload.push(hdr_idx);
    payload.extend_from_slice(hdr_chunk);

    let header = Header {
        kind: PacketKind::RespHeadCont,
        flags,
        identifier,
        seq: u16::from(hdr_idx),
        seq_total: u16::from(hdr_chunks),
        payload_len,
        timestamp,
    };
    finalize_packet(&header, &payload, key, true)
}

/// Encode one body chunk.
///
/// Under the aggregate-tag flag the per-datagram tag is omitted and
/// `agg_tag` (present only on the final-index datagram) is appended to the
/// payload instead.
#[allow(clippy::too_many_arguments)]
pub fn encode_resp_body(
    chunk: &[u8],
    seq: u16,
    seq_total: u16,
    agg_tag: Option<&[u8; TAG_LEN]>,
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    let agg_mode = flags & FLAG_AGG_TAG != 0;
    if agg_tag.is_some() && !agg_mode {
        return Err(WireError::ProtocolViolation(
            "aggregate tag supplied without the aggregate-tag flag",
        ));
    }
    let tag_extra = agg_tag.map(|t| t.len()).unwrap_or(0);
    let payload_len = ensure_payload_size(chunk.len() + tag_extra)?;
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.extend_from_slice(chunk);
    if let Some(tag) = agg_tag {
        payload.extend_from_slice(tag);
    }

    let header = Header {
        kind: PacketKind::RespBody,
        flags,
        identifier,
        seq,
        seq_total,
        payload_len,
        timestamp,
    };
    finalize_packet(&header, &payload, key, !agg_mode)
}

fn encode_nack(
    kind: PacketKind,
    bitmap: &[u8],
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    if bitmap.is_empty() {
        return Err(WireError::ProtocolViolation("empty NACK bitmap"));
    }
    if bitmap.len() > u8::MAX as usize {
        return Err(WireError::PayloadTooLarge(bitmap.len()));
    }
    let payload_len = ensure_payload_size(1 + bitmap.len())?;
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.push(bitmap.len() as u8);
    payload.extend_from_slice(bitmap);

    let header = Header {
        kind,
        flags,
        identifier,
        seq: 0,
        seq_total: 1,
        payload_len,
        timestamp,
    };
    finalize_packet(&header, &payload, key, true)
}

/// Encode a missing-head-chunk bitmap.
pub fn encode_nack_head(
    bitmap: &[u8],
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    encode_nack(PacketKind::NackHead, bitmap, identifier, timestamp, flags, key)
}

/// Encode a missing-body-sequence bitmap.
pub fn encode_nack_body(
    bitmap: &[u8],
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    encode_nack(PacketKind::NackBody, bitmap, identifier, timestamp, flags, key)
}

/// Encode a first-lost report (`ACK_ALL_RECEIVED` means complete).
pub fn encode_ack(
    first_lost: u16,
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    let header = Header {
        kind: PacketKind::Ack,
        flags,
        identifier,
        seq: 0,
        seq_total: 1,
        payload_len: 2,
        timestamp,
    };
    finalize_packet(&header, &first_lost.to_be_bytes(), key, true)
}

/// Encode an error datagram. Messages beyond 200 bytes are truncated with
/// a `...` suffix so the reply always fits one datagram.
pub fn encode_error(
    error_code: u8,
    http_status: u16,
    message: &str,
    identifier: u64,
    timestamp: u32,
    flags: u8,
    key: &PskKey,
) -> Result<Vec<u8>, WireError> {
    let message = truncate_message(message);
    let msg_bytes = message.as_bytes();
    let payload_len = ensure_payload_size(1 + 2 + msg_bytes.len())?;
    let mut payload = Vec::with_capacity(payload_len as usize);
    payload.push(error_code);
    payload.extend_from_slice(&http_status.to_be_bytes());
    payload.extend_from_slice(msg_bytes);

    let header = Header {
        kind: PacketKind::Error,
        flags,
        identifier,
        seq: 0,
        seq_total: 1,
        payload_len,
        timestamp,
    };
    finalize_packet(&header, &payload, key, true)
}

fn truncate_message(message: &str) -> std::borrow::Cow<'_, str> {
    if message.len() <= ERROR_MESSAGE_MAX {
        return message.into();
    }
    let mut cut = ERROR_MESSAGE_MAX - 3;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut]).into()
}
