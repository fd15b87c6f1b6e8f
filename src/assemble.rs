//! Per-request response assembly.
//!
//! Collects head and body datagrams for one identifier, tolerating loss,
//! reordering, and duplicates. Completion is byte-driven: the assembler
//! decides whether the final body index is a parity chunk by accounting
//! the accepted payload bytes against the declared body length, so a
//! response can never complete with wrong bytes: at most one missing
//! chunk is ever reconstructed, and only when the XOR arithmetic lands
//! exactly on the declared length.
//!
//! Under the aggregate-tag flag the assembler holds completed bodies in a
//! tag-pending state: `finish` refuses to hand out a single byte until the
//! aggregate tag has verified over the delivered data.

use std::collections::HashMap;

use crate::headers::decode_header_block;
use crate::wire::{
    aggregate_tag, Packet, Payload, PskKey, WireError, ACK_ALL_RECEIVED, FLAG_AGG_TAG, FLAG_FINAL,
    NEGOTIATED_FLAGS, TAG_LEN,
};

/// Outcome of feeding one datagram to the assembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accepted {
    /// New information was recorded.
    Fresh,
    /// Already had this chunk; dropped silently.
    Duplicate,
}

/// The assembled result handed back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// How a complete body is to be delivered.
struct Completion {
    /// Number of data chunks (parity, if any, excluded).
    data_count: u16,
    /// Sequence to reconstruct via XOR, with its exact byte length.
    repair: Option<(u16, usize)>,
}

/// Collects the datagrams of a single response.
pub struct ResponseAssembler {
    identifier: u64,
    /// Whether any datagram has been accepted yet.
    received: bool,
    /// Negotiated flag bits, either seeded from the request or taken from
    /// the first accepted datagram.
    flags: Option<u8>,
    status_code: Option<u16>,
    body_len: Option<u32>,
    body_seq_total: Option<u16>,
    hdr_total: Option<u8>,
    hdr_chunks: HashMap<u8, Vec<u8>>,
    body_chunks: HashMap<u16, Vec<u8>>,
    /// Whole body carried inline by a final-marker head.
    inline_body: Option<Vec<u8>>,
    agg_tag: Option<[u8; TAG_LEN]>,
}

impl ResponseAssembler {
    pub fn new(identifier: u64) -> Self {
        Self {
            identifier,
            received: false,
            flags: None,
            status_code: None,
            body_len: None,
            body_seq_total: None,
            hdr_total: None,
            hdr_chunks: HashMap::new(),
            body_chunks: HashMap::new(),
            inline_body: None,
            agg_tag: None,
        }
    }

    /// Assembler that only accepts datagrams matching a flag set already
    /// negotiated by the request, instead of adopting whatever the first
    /// datagram carries.
    pub fn expecting(identifier: u64, flags: u8) -> Self {
        let mut assembler = Self::new(identifier);
        assembler.flags = Some(flags & NEGOTIATED_FLAGS);
        assembler
    }

    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    /// True once the first response datagram has been accepted.
    pub fn started(&self) -> bool {
        self.received
    }

    /// Feed one authenticated datagram.
    ///
    /// Rejects datagrams for other identifiers, inconsistent flag sets,
    /// out-of-range sequences, and a late head that contradicts the first
    /// one; all of these are `Malformed` and leave state untouched.
    pub fn accept(&mut self, packet: &Packet) -> Result<Accepted, WireError> {
        if packet.header.identifier != self.identifier {
            return Err(WireError::Malformed("datagram for a different identifier"));
        }
        let negotiated = packet.header.flags & NEGOTIATED_FLAGS;
        match self.flags {
            Some(flags) if flags != negotiated => {
                return Err(WireError::Malformed("flag set differs from first datagram"));
            }
            _ => {}
        }

        let accepted = match &packet.payload {
            Payload::RespHead(head) => {
                if head.body_seq_total == 0 {
                    if head.inline_body.len() != head.body_len as usize {
                        return Err(WireError::Malformed("inline body length mismatch"));
                    }
                    if packet.header.flags & FLAG_FINAL == 0 {
                        return Err(WireError::Malformed("empty sequence without final marker"));
                    }
                } else if !head.inline_body.is_empty() {
                    return Err(WireError::Malformed("inline body with body datagrams declared"));
                }
                if let Some(known) = self.body_len {
                    if known != head.body_len {
                        return Err(WireError::Malformed("duplicate head with different body length"));
                    }
                }
                if let Some(total) = self.body_seq_total {
                    if total != head.body_seq_total {
                        return Err(WireError::Malformed("duplicate head with different sequence total"));
                    }
                }
                self.check_hdr_total(head.hdr_chunks)?;

                self.status_code = Some(head.status_code);
                self.body_len = Some(head.body_len);
                self.body_seq_total = Some(head.body_seq_total);
                self.hdr_total = Some(head.hdr_chunks);
                if head.body_seq_total == 0 && self.inline_body.is_none() {
                    self.inline_body = Some(head.inline_body.clone());
                }
                self.insert_hdr_chunk(head.hdr_idx, &head.header_block)
            }
            Payload::RespHeadCont {
                hdr_chunks,
                hdr_idx,
                header_block,
            } => {
                self.check_hdr_total(*hdr_chunks)?;
                self.hdr_total = Some(*hdr_chunks);
                self.insert_hdr_chunk(*hdr_idx, header_block)
            }
            Payload::RespBody(body) => {
                if body.chunk.is_empty() {
                    return Err(WireError::Malformed("empty body chunk"));
                }
                if let Some(total) = self.body_seq_total {
                    if total != body.seq_total {
                        return Err(WireError::Malformed("body chunk with different sequence total"));
                    }
                }
                if body.seq >= body.seq_total {
                    return Err(WireError::Malformed("body sequence beyond declared total"));
                }
                self.body_seq_total = Some(body.seq_total);
                if let Some(tag) = body.agg_tag {
                    self.agg_tag.get_or_insert(tag);
                }
                match self.body_chunks.entry(body.seq) {
                    std::collections::hash_map::Entry::Occupied(_) => Accepted::Duplicate,
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(body.chunk.clone());
                        Accepted::Fresh
                    }
                }
            }
            _ => return Err(WireError::Malformed("kind not part of a response")),
        };

        if self.flags.is_none() {
            self.flags = Some(negotiated);
        }
        self.received = true;
        Ok(accepted)
    }

    fn check_hdr_total(&self, declared: u8) -> Result<(), WireError> {
        match self.hdr_total {
            Some(total) if total != declared => {
                Err(WireError::Malformed("head chunk count changed between datagrams"))
            }
            _ => Ok(()),
        }
    }

    fn insert_hdr_chunk(&mut self, idx: u8, block: &[u8]) -> Accepted {
        match self.hdr_chunks.entry(idx) {
            std::collections::hash_map::Entry::Occupied(_) => Accepted::Duplicate,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(block.to_vec());
                Accepted::Fresh
            }
        }
    }

    fn agg_expected(&self) -> bool {
        self.flags.map(|f| f & FLAG_AGG_TAG != 0).unwrap_or(false)
    }

    pub fn header_complete(&self) -> bool {
        match self.hdr_total {
            Some(total) => (0..total).all(|i| self.hdr_chunks.contains_key(&i)),
            None => false,
        }
    }

    /// Whether the body can be delivered (including via parity repair and,
    /// in aggregate mode, with the tag in hand).
    pub fn body_complete(&self) -> bool {
        match self.completion() {
            Some(completion) => {
                !(self.agg_expected() && completion.data_count > 0 && self.agg_tag.is_none())
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.header_complete() && self.body_complete()
    }

    /// Decide how (whether) the accepted chunks form the declared body.
    fn completion(&self) -> Option<Completion> {
        let total = self.body_seq_total?;
        let body_len = self.body_len? as usize;
        if total == 0 {
            let inline = self.inline_body.as_ref()?;
            return (inline.len() == body_len).then_some(Completion {
                data_count: 0,
                repair: None,
            });
        }

        let missing: Vec<u16> = (0..total)
            .filter(|seq| !self.body_chunks.contains_key(seq))
            .collect();
        let bytes_through = |count: u16| -> usize {
            (0..count)
                .filter_map(|seq| self.body_chunks.get(&seq))
                .map(Vec::len)
                .sum()
        };

        match missing.as_slice() {
            [] => {
                if bytes_through(total) == body_len {
                    // Every index is a data chunk.
                    Some(Completion {
                        data_count: total,
                        repair: None,
                    })
                } else if bytes_through(total - 1) == body_len {
                    // Final index is parity; the data prefix already adds up.
                    Some(Completion {
                        data_count: total - 1,
                        repair: None,
                    })
                } else {
                    None
                }
            }
            [missing_seq] if *missing_seq == total - 1 => {
                // Only the final index is absent. If the data prefix adds
                // up it was the parity chunk and nothing needs repair.
                (bytes_through(total - 1) == body_len).then_some(Completion {
                    data_count: total - 1,
                    repair: None,
                })
            }
            [missing_seq] => {
                // One data chunk lost with the final index in hand: usable
                // only when that final index is parity, which the byte
                // accounting decides. A repaired length that does not fit
                // inside the XOR width means there was no parity chunk.
                let have: usize = self
                    .body_chunks
                    .iter()
                    .filter(|(seq, _)| **seq < total - 1)
                    .map(|(_, chunk)| chunk.len())
                    .sum();
                let repaired_len = body_len.checked_sub(have)?;
                let width = self.body_chunks.values().map(Vec::len).max()?;
                (1..=width).contains(&repaired_len).then_some(Completion {
                    data_count: total - 1,
                    repair: Some((*missing_seq, repaired_len)),
                })
            }
            _ => None,
        }
    }

    /// Lowest missing body sequence, for `Ack` emission.
    pub fn first_lost(&self) -> u16 {
        match self.body_seq_total {
            Some(total) => (0..total)
                .find(|seq| !self.body_chunks.contains_key(seq))
                .unwrap_or(ACK_ALL_RECEIVED),
            None => 0,
        }
    }

    /// Bitmap of missing body sequences, at most `max_bits` of them.
    /// None when nothing is missing or the total is still unknown.
    pub fn missing_body_bitmap(&self, max_bits: usize) -> Option<Vec<u8>> {
        let total = self.body_seq_total?;
        let missing: Vec<u16> = (0..total)
            .filter(|seq| !self.body_chunks.contains_key(seq))
            .take(max_bits)
            .collect();
        build_bitmap(&missing)
    }

    /// Bitmap of missing head-chunk indices, at most `max_bits` of them.
    /// With the head count still unknown (no head datagram arrived yet),
    /// index 0 is named: every response has at least one head chunk.
    pub fn missing_head_bitmap(&self, max_bits: usize) -> Option<Vec<u8>> {
        let total = self.hdr_total.unwrap_or(1);
        let missing: Vec<u16> = (0..total)
            .filter(|i| !self.hdr_chunks.contains_key(i))
            .map(u16::from)
            .take(max_bits)
            .collect();
        build_bitmap(&missing)
    }

    /// Whether a head NACK would name anything. True as well when body
    /// datagrams arrived but no head was ever seen.
    pub fn head_incomplete(&self) -> bool {
        match self.hdr_total {
            Some(_) => !self.header_complete(),
            None => self.started(),
        }
    }

    /// Produce the final response, repairing via parity and verifying the
    /// aggregate tag when the flag demands it. Consumes the assembler.
    pub fn finish(mut self, key: &PskKey) -> Result<AssembledResponse, WireError> {
        if !self.header_complete() {
            return Err(WireError::Malformed("header block incomplete"));
        }
        let completion = self
            .completion()
            .ok_or(WireError::Malformed("body incomplete"))?;

        if let Some((seq, len)) = completion.repair {
            let total = self.body_seq_total.expect("completion implies total");
            let survivors: Vec<&[u8]> = (0..total)
                .filter(|s| *s != seq)
                .filter_map(|s| self.body_chunks.get(&s))
                .map(Vec::as_slice)
                .collect();
            let mut repaired = crate::chunk::xor_parity(&survivors);
            repaired.truncate(len);
            self.body_chunks.insert(seq, repaired);
        }

        let mut body = Vec::with_capacity(self.body_len.unwrap_or(0) as usize);
        if let Some(inline) = &self.inline_body {
            body.extend_from_slice(inline);
        }
        for seq in 0..completion.data_count {
            body.extend_from_slice(
                self.body_chunks
                    .get(&seq)
                    .expect("completion guarantees data chunks"),
            );
        }

        if self.agg_expected() && completion.data_count > 0 {
            let tag = self.agg_tag.ok_or(WireError::AuthFailed)?;
            let expected = aggregate_tag(key, std::iter::once(body.as_slice()));
            if tag != expected {
                return Err(WireError::AuthFailed);
            }
        }

        let mut block = Vec::new();
        for idx in 0..self.hdr_total.unwrap_or(0) {
            block.extend_from_slice(&self.hdr_chunks[&idx]);
        }
        let headers = decode_header_block(&block)
            .map_err(|_| WireError::Malformed("header block undecodable"))?;

        Ok(AssembledResponse {
            status_code: self
                .status_code
                .ok_or(WireError::Malformed("status code never arrived"))?,
            headers,
            body,
        })
    }
}

/// Build an LSB-first missing-sequence bitmap. None for an empty set.
pub fn build_bitmap(missing: &[u16]) -> Option<Vec<u8>> {
    let max_seq = *missing.iter().max()?;
    let mut bitmap = vec![0u8; max_seq as usize / 8 + 1];
    for &seq in missing {
        bitmap[seq as usize / 8] |= 1 << (seq % 8);
    }
    Some(bitmap)
}
