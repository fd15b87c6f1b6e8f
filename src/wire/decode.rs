//! Datagram decoding and the authenticated receive gate.
//!
//! `decode_packet` is the pure half: structural checks, tag verification,
//! payload parsing. `Codec` wraps it with the per-engine receive gates,
//! replay rejection and timestamp skew, so engines never see a datagram
//! that has not passed every check.

use crate::replay::ReplayCache;

use super::crypto::{PskKey, TAG_LEN};
use super::payload::{
    AckPayload, ErrorPayload, NackPayload, Packet, Payload, ReqPayload, RequestMethod,
    RespBodyPayload, RespHeadPayload,
};
use super::{Header, PacketKind, WireError, ACK_ALL_RECEIVED, FLAG_AGG_TAG, FLAG_SHORT_LEN};

/// Maximum tolerated distance between a datagram's wall-clock timestamp
/// and the receiver's reference, in seconds.
pub const MAX_TIMESTAMP_SKEW_SECS: u32 = 30;

/// Request payload preamble: method(1) + url_len(2) + hdr_len(2).
const REQ_OVERHEAD: usize = 5;
/// Error payload preamble: code(1) + http_status(2).
const ERROR_MIN_LEN: usize = 3;

/// Decode and authenticate a single datagram.
///
/// Nothing beyond the magic and version bytes is trusted before the tag
/// verifies; any structural inconsistency fails closed.
pub fn decode_packet(datagram: &[u8], key: &PskKey) -> Result<Packet, WireError> {
    let header = Header::from_bytes(datagram)?;
    let header_len = header.encoded_len();

    let encrypted = header.encrypted();
    let agg_mode = header.flags & FLAG_AGG_TAG != 0;
    if encrypted && agg_mode {
        return Err(WireError::Malformed(
            "encrypt and aggregate-tag flags set together",
        ));
    }

    // Only response-body datagrams drop the per-datagram tag in aggregate
    // mode; every other kind stays individually authenticated.
    let tagless = agg_mode && header.kind == PacketKind::RespBody;
    let tag_len = if tagless { 0 } else { TAG_LEN };
    let payload_len = header.payload_len as usize;
    let expected_len = header_len + payload_len + tag_len;
    if datagram.len() != expected_len {
        return Err(WireError::Malformed("declared payload length mismatch"));
    }

    let header_bytes = &datagram[..header_len];
    let payload_bytes = &datagram[header_len..header_len + payload_len];
    let tag_bytes = &datagram[header_len + payload_len..];

    let plain = if encrypted {
        key.open(&header, header_bytes, payload_bytes, tag_bytes)?
    } else {
        if !tagless {
            key.verify_tag(&datagram[..header_len + payload_len], tag_bytes)?;
        }
        payload_bytes.to_vec()
    };

    let payload = decode_payload(&header, &plain)?;
    Ok(Packet { header, payload })
}

fn decode_payload(header: &Header, payload: &[u8]) -> Result<Payload, WireError> {
    match header.kind {
        PacketKind::Req => decode_req(payload),
        PacketKind::RespHead => decode_resp_head(header, payload),
        PacketKind::RespHeadCont => decode_resp_head_cont(payload),
        PacketKind::RespBody => decode_resp_body(header, payload),
        PacketKind::NackHead => decode_nack(payload).map(Payload::NackHead),
        PacketKind::NackBody => decode_nack(payload).map(Payload::NackBody),
        PacketKind::Error => decode_error(payload),
        PacketKind::Ack => decode_ack(payload),
    }
}

fn decode_req(payload: &[u8]) -> Result<Payload, WireError> {
    if payload.len() < REQ_OVERHEAD {
        return Err(WireError::Malformed("request payload truncated"));
    }
    let method = RequestMethod::from_byte(payload[0])?;
    let url_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    let hdr_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if payload.len() != REQ_OVERHEAD + url_len + hdr_len {
        return Err(WireError::Malformed("request length fields inconsistent"));
    }
    let url = std::str::from_utf8(&payload[REQ_OVERHEAD..REQ_OVERHEAD + url_len])
        .map_err(|_| WireError::Malformed("request URL is not UTF-8"))?
        .to_string();
    let header_block = payload[REQ_OVERHEAD + url_len..].to_vec();
    Ok(Payload::Req(ReqPayload {
        method,
        url,
        header_block,
    }))
}

fn decode_resp_head(header: &Header, payload: &[u8]) -> Result<Payload, WireError> {
    let len_field = if header.flags & FLAG_SHORT_LEN != 0 { 3 } else { 4 };
    let preamble = 2 + len_field + 1 + 1 + 2;
    if payload.len() < preamble {
        return Err(WireError::Malformed("response head payload truncated"));
    }
    let status_code = u16::from_be_bytes([payload[0], payload[1]]);
    let body_len = if len_field == 3 {
        u32::from_be_bytes([0, payload[2], payload[3], payload[4]])
    } else {
        u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]])
    };
    let hdr_chunks = payload[2 + len_field];
    let hdr_idx = payload[2 + len_field + 1];
    if hdr_chunks == 0 || hdr_idx >= hdr_chunks {
        return Err(WireError::Malformed("head chunk index out of range"));
    }
    let block_len =
        u16::from_be_bytes([payload[2 + len_field + 2], payload[2 + len_field + 3]]) as usize;
    let block_end = preamble
        .checked_add(block_len)
        .filter(|end| *end <= payload.len())
        .ok_or(WireError::Malformed("head block length inconsistent"))?;
    let inline_body = payload[block_end..].to_vec();
    if !inline_body.is_empty() && header.seq_total != 0 {
        return Err(WireError::Malformed("inline body with body datagrams declared"));
    }
    Ok(Payload::RespHead(RespHeadPayload {
        status_code,
        body_len,
        hdr_chunks,
        hdr_idx,
        header_block: payload[preamble..block_end].to_vec(),
        inline_body,
        body_seq_total: header.seq_total,
    }))
}

fn decode_resp_head_cont(payload: &[u8]) -> Result<Payload, WireError> {
    if payload.len() < 2 {
        return Err(WireError::Malformed("head continuation payload truncated"));
    }
    let hdr_chunks = payload[0];
    let hdr_idx = payload[1];
    if hdr_chunks == 0 || hdr_idx >= hdr_chunks {
        return Err(WireError::Malformed("head chunk index out of range"));
    }
    Ok(Payload::RespHeadCont {
        hdr_chunks,
        hdr_idx,
        header_block: payload[2..].to_vec(),
    })
}

fn decode_resp_body(header: &Header, payload: &[u8]) -> Result<Payload, WireError> {
    let agg_mode = header.flags & FLAG_AGG_TAG != 0;
    let carries_tag = agg_mode && header.seq_total > 0 && header.seq == header.seq_total - 1;
    if carries_tag {
        if payload.len() < TAG_LEN {
            return Err(WireError::Malformed("aggregate tag missing from final chunk"));
        }
        let split = payload.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&payload[split..]);
        Ok(Payload::RespBody(RespBodyPayload {
            seq: header.seq,
            seq_total: header.seq_total,
            chunk: payload[..split].to_vec(),
            agg_tag: Some(tag),
        }))
    } else {
        Ok(Payload::RespBody(RespBodyPayload {
            seq: header.seq,
            seq_total: header.seq_total,
            chunk: payload.to_vec(),
            agg_tag: None,
        }))
    }
}

fn decode_nack(payload: &[u8]) -> Result<NackPayload, WireError> {
    if payload.is_empty() {
        return Err(WireError::Malformed("NACK payload empty"));
    }
    let bitmap_len = payload[0] as usize;
    if bitmap_len == 0 {
        return Err(WireError::Malformed("NACK bitmap length zero"));
    }
    if payload.len() != 1 + bitmap_len {
        return Err(WireError::Malformed("NACK bitmap length inconsistent"));
    }
    Ok(NackPayload {
        bitmap: payload[1..].to_vec(),
    })
}

fn decode_ack(payload: &[u8]) -> Result<Payload, WireError> {
    // An empty Ack payload is legal shorthand for "all received".
    let first_lost = match payload.len() {
        0 => ACK_ALL_RECEIVED,
        2 => u16::from_be_bytes([payload[0], payload[1]]),
        _ => return Err(WireError::Malformed("Ack payload length invalid")),
    };
    Ok(Payload::Ack(AckPayload { first_lost }))
}

fn decode_error(payload: &[u8]) -> Result<Payload, WireError> {
    if payload.len() < ERROR_MIN_LEN {
        return Err(WireError::Malformed("error payload truncated"));
    }
    let error_code = payload[0];
    let http_status = u16::from_be_bytes([payload[1], payload[2]]);
    let message = std::str::from_utf8(&payload[3..])
        .map_err(|_| WireError::Malformed("error message is not UTF-8"))?
        .to_string();
    Ok(Payload::Error(ErrorPayload {
        error_code,
        http_status,
        message,
    }))
}

/// Per-engine receive gate: decode + timestamp skew + replay rejection.
///
/// Response-bearing kinds are replay-gated by
/// `(identifier, timestamp, seq, kind)`; control kinds (`Req`, NACKs,
/// `Ack`) pass through because the protocol relies on their duplicates
/// for recovery. The responder additionally gates `Req` datagrams via
/// [`Codec::note_request`] after a response-cache miss.
pub struct Codec {
    key: PskKey,
    replay: ReplayCache,
}

impl Codec {
    pub fn new(key: PskKey, replay_window_ms: u64) -> Self {
        Self {
            key,
            replay: ReplayCache::new(replay_window_ms),
        }
    }

    pub fn key(&self) -> &PskKey {
        &self.key
    }

    /// Decode one inbound datagram.
    ///
    /// `now_ms` is the receiver's monotonic-to-wall reference in Unix
    /// milliseconds; it drives both the skew check and replay ageing.
    pub fn decode(&mut self, datagram: &[u8], now_ms: u64) -> Result<Packet, WireError> {
        let packet = decode_packet(datagram, &self.key)?;
        let header = &packet.header;

        if !header.short_id() {
            let now_secs = (now_ms / 1000) as i64;
            let skew = (i64::from(header.timestamp) - now_secs).unsigned_abs();
            if skew > u64::from(MAX_TIMESTAMP_SKEW_SECS) {
                return Err(WireError::Stale);
            }
        }

        if header.kind.is_response() {
            let fresh = self.replay.check_and_insert(
                (header.identifier, header.timestamp, header.seq, header.kind.to_byte()),
                now_ms,
            );
            if !fresh {
                return Err(WireError::Replay);
            }
        }

        Ok(packet)
    }

    /// Responder-side replay gate for a request that missed the response
    /// cache. Returns false when the same `(identifier, timestamp)` was
    /// already seen inside the window.
    pub fn note_request(&mut self, identifier: u64, timestamp: u32, now_ms: u64) -> bool {
        self.replay
            .check_and_insert((identifier, timestamp, 0, PacketKind::Req.to_byte()), now_ms)
    }

    /// Drop replay entries that aged out of the window.
    pub fn sweep(&mut self, now_ms: u64) {
        self.replay.sweep(now_ms);
    }
}
