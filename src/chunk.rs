//! Response chunker.
//!
//! Splits a fetched response (status, header block, body) into the
//! deterministic datagram sequence the responder emits: one or more head
//! datagrams carrying the header block, dense body chunks sized to the
//! working MTU, an optional XOR parity chunk, and optional verbatim
//! duplicates. The plan owns its datagrams; the responder caches the
//! unique ones for retransmission and sends `emit_order` as-is.

use crate::wire::{
    self, aggregate_tag, header_len, PskKey, WireError, FLAG_AGG_TAG, FLAG_FINAL, FLAG_SHORT_LEN,
    TAG_LEN,
};

/// Chunking parameters, frozen at engine construction.
#[derive(Clone, Debug)]
pub struct ChunkOptions {
    /// Working per-datagram size; chunk budgets are derived from it.
    pub mtu_budget: usize,
    /// Negotiated flag set for the whole response.
    pub flags: u8,
    /// Append one XOR parity chunk covering the data chunks.
    pub parity: bool,
    /// Verbatim copies of each head datagram (loss of the head is fatal to
    /// progress, so a higher factor than the body is the usual choice).
    pub head_copies: u8,
    /// Verbatim copies of each body datagram.
    pub body_copies: u8,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            mtu_budget: 1200,
            flags: 0,
            parity: false,
            head_copies: 1,
            body_copies: 1,
        }
    }
}

/// The ordered datagram plan for one response.
pub struct ChunkPlan {
    /// Unique head datagrams indexed by head-chunk index.
    pub head: Vec<Vec<u8>>,
    /// Unique body datagrams indexed by sequence (parity last, if any).
    pub body: Vec<Vec<u8>>,
    /// Indices into head/body in emission order, duplicates included.
    emit: Vec<PlanSlot>,
}

#[derive(Clone, Copy)]
enum PlanSlot {
    Head(usize),
    Body(usize),
}

impl ChunkPlan {
    /// Datagrams in emission order (duplicates expanded).
    pub fn emit_order(&self) -> impl Iterator<Item = &[u8]> {
        self.emit.iter().map(move |slot| match slot {
            PlanSlot::Head(i) => self.head[*i].as_slice(),
            PlanSlot::Body(i) => self.body[*i].as_slice(),
        })
    }

    /// Total number of datagrams that will be emitted.
    pub fn emit_len(&self) -> usize {
        self.emit.len()
    }
}

/// Per-datagram body budget for a flag set: MTU minus header minus the
/// 16 tag bytes. The budget is kept uniform across aggregate-tag modes so
/// the final chunk always has room for the appended tag.
pub fn body_chunk_budget(mtu_budget: usize, flags: u8) -> usize {
    mtu_budget.saturating_sub(header_len(flags) + TAG_LEN)
}

/// RespHead payload preamble: status(2) + body_len(3|4) + hdr_chunks(1) +
/// hdr_idx(1) + hdr_block_len(2).
fn head_preamble(flags: u8) -> usize {
    if flags & FLAG_SHORT_LEN != 0 {
        2 + 3 + 2 + 2
    } else {
        2 + 4 + 2 + 2
    }
}

/// Build the datagram plan for one response.
pub fn chunk_response(
    status_code: u16,
    header_block: &[u8],
    body: &[u8],
    identifier: u64,
    timestamp: u32,
    opts: &ChunkOptions,
    key: &PskKey,
) -> Result<ChunkPlan, WireError> {
    let chunk_budget = body_chunk_budget(opts.mtu_budget, opts.flags);
    if chunk_budget == 0 {
        return Err(WireError::ProtocolViolation("MTU budget leaves no payload room"));
    }
    if opts.flags & FLAG_SHORT_LEN != 0 && body.len() > 0x00FF_FFFF {
        return Err(WireError::PayloadTooLarge(body.len()));
    }

    // Split the header block. The first head chunk shares its datagram
    // with the response preamble; continuations lose only the two index
    // bytes.
    let first_budget = chunk_budget.saturating_sub(head_preamble(opts.flags));
    let cont_budget = chunk_budget.saturating_sub(2);
    if first_budget == 0 || cont_budget == 0 {
        return Err(WireError::ProtocolViolation("MTU budget leaves no head room"));
    }

    // A response whose header block and body both fit beside the preamble
    // collapses into one final-marker head datagram with the body inline.
    if header_block.len() + body.len() <= first_budget {
        let head_flags = opts.flags | FLAG_FINAL;
        let head = wire::encode_resp_head(
            status_code,
            body.len() as u32,
            header_block,
            1,
            0,
            body,
            0,
            identifier,
            timestamp,
            head_flags,
            key,
        )?;
        let head_copies = opts.head_copies.max(1) as usize;
        let emit = (0..head_copies).map(|_| PlanSlot::Head(0)).collect();
        return Ok(ChunkPlan {
            head: vec![head],
            body: Vec::new(),
            emit,
        });
    }

    let first_chunk_len = header_block.len().min(first_budget);
    let (first_hdr, rest_hdr) = header_block.split_at(first_chunk_len);
    let cont_chunks: Vec<&[u8]> = rest_hdr.chunks(cont_budget).collect();
    let hdr_chunks_total = 1 + cont_chunks.len();
    if hdr_chunks_total > u8::MAX as usize {
        return Err(WireError::PayloadTooLarge(header_block.len()));
    }
    let hdr_chunks_total = hdr_chunks_total as u8;

    // Split the body into dense chunks, last one possibly shorter.
    let data_chunks: Vec<&[u8]> = if body.is_empty() {
        Vec::new()
    } else {
        body.chunks(chunk_budget).collect()
    };
    let data_total = data_chunks.len();
    let parity = opts.parity && data_total > 0;
    let seq_total = data_total + usize::from(parity);
    if seq_total > u16::MAX as usize {
        return Err(WireError::PayloadTooLarge(body.len()));
    }
    let seq_total = seq_total as u16;

    let agg_mode = opts.flags & FLAG_AGG_TAG != 0;
    let agg = if agg_mode && data_total > 0 {
        Some(aggregate_tag(key, data_chunks.iter().copied()))
    } else {
        None
    };

    let mut head_flags = opts.flags;
    if data_total == 0 {
        head_flags |= FLAG_FINAL;
    }

    let mut head = Vec::with_capacity(hdr_chunks_total as usize);
    head.push(wire::encode_resp_head(
        status_code,
        body.len() as u32,
        first_hdr,
        hdr_chunks_total,
        0,
        &[],
        seq_total,
        identifier,
        timestamp,
        head_flags,
        key,
    )?);
    for (i, chunk) in cont_chunks.iter().enumerate() {
        head.push(wire::encode_resp_head_cont(
            chunk,
            hdr_chunks_total,
            (i + 1) as u8,
            identifier,
            timestamp,
            opts.flags,
            key,
        )?);
    }

    let mut body_datagrams = Vec::with_capacity(seq_total as usize);
    for (seq, chunk) in data_chunks.iter().enumerate() {
        let is_final_index = !parity && seq == data_total - 1;
        let tag = if is_final_index { agg.as_ref() } else { None };
        body_datagrams.push(wire::encode_resp_body(
            chunk,
            seq as u16,
            seq_total,
            tag,
            identifier,
            timestamp,
            opts.flags,
            key,
        )?);
    }
    if parity {
        let parity_chunk = xor_parity(&data_chunks);
        body_datagrams.push(wire::encode_resp_body(
            &parity_chunk,
            data_total as u16,
            seq_total,
            agg.as_ref(),
            identifier,
            timestamp,
            opts.flags,
            key,
        )?);
    }

    let head_copies = opts.head_copies.max(1) as usize;
    let body_copies = opts.body_copies.max(1) as usize;
    let mut emit = Vec::with_capacity(head.len() * head_copies + body_datagrams.len() * body_copies);
    for i in 0..head.len() {
        for _ in 0..head_copies {
            emit.push(PlanSlot::Head(i));
        }
    }
    for i in 0..body_datagrams.len() {
        for _ in 0..body_copies {
            emit.push(PlanSlot::Body(i));
        }
    }

    Ok(ChunkPlan {
        head,
        body: body_datagrams,
        emit,
    })
}

/// Byte-wise XOR of all chunks, each padded to the longest chunk length.
pub fn xor_parity(chunks: &[&[u8]]) -> Vec<u8> {
    let width = chunks.iter().map(|c| c.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; width];
    for chunk in chunks {
        for (i, byte) in chunk.iter().enumerate() {
            parity[i] ^= byte;
        }
    }
    parity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_packet, PacketKind, Payload};

    const PSK: &[u8] = b"test-psk-0000-test";

    fn key() -> PskKey {
        PskKey::new(PSK)
    }

    fn opts(mtu: usize) -> ChunkOptions {
        ChunkOptions {
            mtu_budget: mtu,
            ..ChunkOptions::default()
        }
    }

    fn decode_all(plan: &ChunkPlan) -> Vec<crate::wire::Packet> {
        plan.emit_order()
            .map(|dg| decode_packet(dg, &key()).expect("plan datagrams decode"))
            .collect()
    }

    #[test]
    fn test_empty_body_single_final_head() {
        let plan = chunk_response(200, &[], &[], 7, 100, &opts(1200), &key()).unwrap();
        assert_eq!(plan.head.len(), 1);
        assert!(plan.body.is_empty());

        let packets = decode_all(&plan);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.kind, PacketKind::RespHead);
        assert_ne!(packets[0].header.flags & FLAG_FINAL, 0);
        assert_eq!(packets[0].header.seq_total, 0);
    }

    #[test]
    fn test_body_split_is_dense_and_reassembles() {
        let body: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let plan = chunk_response(200, &[], &body, 7, 100, &opts(1200), &key()).unwrap();
        let budget = body_chunk_budget(1200, 0);
        let expected_chunks = body.len().div_ceil(budget);
        assert_eq!(plan.body.len(), expected_chunks);

        let mut reassembled = Vec::new();
        for (seq, dg) in plan.body.iter().enumerate() {
            match decode_packet(dg, &key()).unwrap().payload {
                Payload::RespBody(b) => {
                    assert_eq!(b.seq as usize, seq);
                    assert_eq!(b.seq_total as usize, expected_chunks);
                    reassembled.extend_from_slice(&b.chunk);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
        assert_eq!(reassembled, body);
    }

    #[test]
    fn test_head_block_splits_across_continuations() {
        let block = vec![0xAB; 5000];
        let plan = chunk_response(200, &block, b"x", 7, 100, &opts(1200), &key()).unwrap();
        assert!(plan.head.len() > 1);

        let mut combined = Vec::new();
        let mut declared_total = 0;
        for dg in &plan.head {
            match decode_packet(dg, &key()).unwrap().payload {
                Payload::RespHead(h) => {
                    declared_total = h.hdr_chunks;
                    combined.extend_from_slice(&h.header_block);
                }
                Payload::RespHeadCont { header_block, .. } => {
                    combined.extend_from_slice(&header_block);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
        assert_eq!(declared_total as usize, plan.head.len());
        assert_eq!(combined, block);
    }

    #[test]
    fn test_parity_chunk_appended() {
        let body = vec![0x55; 2500];
        let mut options = opts(1200);
        options.parity = true;
        let plan = chunk_response(200, &[], &body, 7, 100, &options, &key()).unwrap();

        let budget = body_chunk_budget(1200, 0);
        let data_total = body.len().div_ceil(budget);
        assert_eq!(plan.body.len(), data_total + 1);

        let last = decode_packet(plan.body.last().unwrap(), &key()).unwrap();
        match last.payload {
            Payload::RespBody(b) => {
                assert_eq!(b.seq as usize, data_total);
                assert_eq!(b.seq_total as usize, data_total + 1);
                assert_eq!(b.chunk.len(), budget);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_xor_parity_repairs_any_single_chunk() {
        let chunks: Vec<&[u8]> = vec![b"hello world", b"second chunk!", b"tail"];
        let parity = xor_parity(&chunks);
        for missing in 0..chunks.len() {
            let mut survivors: Vec<&[u8]> =
                chunks.iter().enumerate().filter(|(i, _)| *i != missing).map(|(_, c)| *c).collect();
            survivors.push(&parity);
            let repaired = xor_parity(&survivors);
            assert_eq!(&repaired[..chunks[missing].len()], chunks[missing]);
            assert!(repaired[chunks[missing].len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_duplication_factors() {
        let body = vec![1u8; 2000];
        let mut options = opts(1200);
        options.head_copies = 4;
        options.body_copies = 2;
        let plan = chunk_response(200, &[], &body, 7, 100, &options, &key()).unwrap();
        assert_eq!(
            plan.emit_len(),
            plan.head.len() * 4 + plan.body.len() * 2
        );
        // Copies are verbatim.
        let first_two: Vec<&[u8]> = plan.emit_order().take(2).collect();
        assert_eq!(first_two[0], first_two[1]);
    }

    #[test]
    fn test_agg_tag_on_final_data_chunk() {
        let body = vec![9u8; 2500];
        let mut options = opts(1200);
        options.flags = FLAG_AGG_TAG;
        let plan = chunk_response(200, &[], &body, 7, 100, &options, &key()).unwrap();

        let packets: Vec<_> = plan
            .body
            .iter()
            .map(|dg| decode_packet(dg, &key()).unwrap())
            .collect();
        for (i, p) in packets.iter().enumerate() {
            match &p.payload {
                Payload::RespBody(b) => {
                    assert_eq!(b.agg_tag.is_some(), i == packets.len() - 1);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[test]
    fn test_agg_tag_rides_on_parity_datagram() {
        let body = vec![9u8; 2500];
        let mut options = opts(1200);
        options.flags = FLAG_AGG_TAG;
        options.parity = true;
        let plan = chunk_response(200, &[], &body, 7, 100, &options, &key()).unwrap();

        for (i, dg) in plan.body.iter().enumerate() {
            let packet = decode_packet(dg, &key()).unwrap();
            match packet.payload {
                Payload::RespBody(b) => {
                    assert_eq!(b.agg_tag.is_some(), i == plan.body.len() - 1);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }
}
