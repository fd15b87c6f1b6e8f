//! Datagram inspection helper.
//!
//! Decodes a raw datagram and pretty-prints the header fields, the
//! kind-specific payload summary, and the hex-encoded authentication
//! material. Diagnostic only; the output format is not stable.

use std::fmt::Write;

use super::{decode_packet, PacketKind, Payload, PskKey, WireError, FLAG_AGG_TAG, TAG_LEN};

/// Format a datagram for inspection. The datagram must decode (and
/// authenticate) under `key`; a tampered or foreign-key datagram fails
/// the same way `decode_packet` does.
pub fn debug_dump(datagram: &[u8], key: &PskKey) -> Result<String, WireError> {
    let packet = decode_packet(datagram, key)?;
    let header = &packet.header;
    let header_len = header.encoded_len();

    let tagless = header.flags & FLAG_AGG_TAG != 0 && header.kind == PacketKind::RespBody;
    let tag_hex = if tagless {
        "(deferred to aggregate tag)".to_string()
    } else {
        hex::encode(&datagram[datagram.len() - TAG_LEN..])
    };

    let mut out = String::new();
    writeln!(&mut out, "=== AKARI-UDP packet ===")?;
    writeln!(&mut out, "len: {} bytes", datagram.len())?;
    writeln!(
        &mut out,
        "header ({} bytes): {}",
        header_len,
        hex::encode(&datagram[..header_len])
    )?;
    writeln!(&mut out, "tag: {}", tag_hex)?;
    writeln!(&mut out, "-- header fields --")?;
    writeln!(
        &mut out,
        "magic=AK version=3 kind={} flags={:#04x} identifier={} seq={}/{} payload_len={} timestamp={}",
        header.kind,
        header.flags,
        header.identifier,
        header.seq,
        header.seq_total,
        header.payload_len,
        header.timestamp
    )?;

    writeln!(&mut out, "-- payload --")?;
    match &packet.payload {
        Payload::Req(req) => {
            writeln!(
                &mut out,
                "Req: method={} url={} header_block={}B",
                req.method,
                req.url,
                req.header_block.len()
            )?;
        }
        Payload::RespHead(head) => {
            writeln!(
                &mut out,
                "RespHead: status={} body_len={} hdr_chunk={}/{} block={}B inline_body={}B",
                head.status_code,
                head.body_len,
                head.hdr_idx,
                head.hdr_chunks,
                head.header_block.len(),
                head.inline_body.len()
            )?;
        }
        Payload::RespHeadCont {
            hdr_chunks,
            hdr_idx,
            header_block,
        } => {
            writeln!(
                &mut out,
                "RespHeadCont: hdr_chunk={}/{} block={}B",
                hdr_idx,
                hdr_chunks,
                header_block.len()
            )?;
        }
        Payload::RespBody(body) => {
            writeln!(
                &mut out,
                "RespBody: seq={}/{} chunk={}B agg_tag={}",
                body.seq,
                body.seq_total,
                body.chunk.len(),
                body.agg_tag.map(hex::encode).unwrap_or_else(|| "-".to_string())
            )?;
        }
        Payload::NackHead(nack) | Payload::NackBody(nack) => {
            let bits: Vec<u16> = nack.set_bits().collect();
            writeln!(
                &mut out,
                "{}: bitmap={}B missing={:?}",
                header.kind,
                nack.bitmap.len(),
                bits
            )?;
        }
        Payload::Ack(ack) => {
            writeln!(&mut out, "Ack: first_lost={}", ack.first_lost)?;
        }
        Payload::Error(err) => {
            writeln!(
                &mut out,
                "Error: code={} http_status={} message=\"{}\"",
                err.error_code, err.http_status, err.message
            )?;
        }
    }

    Ok(out)
}
