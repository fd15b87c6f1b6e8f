use super::*;

const PSK: &[u8] = b"test-psk-0000-test";
const ID: u64 = 0x0102_0304_0506_0708;
const TS: u32 = 0x6463_6261;

fn key() -> PskKey {
    PskKey::new(PSK)
}

#[test]
fn test_request_round_trip() {
    let url = "https://example.com/search?q=akari";
    let datagram = encode_request(RequestMethod::Get, url, &[], ID, TS, 0, &key()).unwrap();
    let packet = decode_packet(&datagram, &key()).unwrap();

    assert_eq!(packet.header.kind, PacketKind::Req);
    assert_eq!(packet.header.identifier, ID);
    assert_eq!(packet.header.timestamp, TS);
    assert_eq!(
        packet.payload,
        Payload::Req(ReqPayload {
            method: RequestMethod::Get,
            url: url.to_string(),
            header_block: Vec::new(),
        })
    );
}

#[test]
fn test_request_round_trip_with_header_block() {
    let block = [0x01, 0x00, 0x05, b't', b'e', b's', b't', b'/'];
    let datagram =
        encode_request(RequestMethod::Post, "https://example.com/", &block, ID, TS, 0, &key())
            .unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::Req(req) => {
            assert_eq!(req.method, RequestMethod::Post);
            assert_eq!(req.header_block, block);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_encode_decode_is_byte_stable() {
    // Cacheable re-emit requires byte-for-byte identity: encoding the same
    // content twice must yield identical datagrams.
    let a = encode_resp_body(b"chunk", 1, 4, None, ID, TS, 0, &key()).unwrap();
    let b = encode_resp_body(b"chunk", 1, 4, None, ID, TS, 0, &key()).unwrap();
    assert_eq!(a, b);

    let ea = encode_resp_body(b"chunk", 1, 4, None, ID, TS, FLAG_ENCRYPT, &key()).unwrap();
    let eb = encode_resp_body(b"chunk", 1, 4, None, ID, TS, FLAG_ENCRYPT, &key()).unwrap();
    assert_eq!(ea, eb);
}

#[test]
fn test_resp_head_round_trip() {
    let datagram =
        encode_resp_head(206, 1_000_000, b"hdr", 2, 0, &[], 7, ID, TS, 0, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::RespHead(head) => {
            assert_eq!(head.status_code, 206);
            assert_eq!(head.body_len, 1_000_000);
            assert_eq!(head.hdr_chunks, 2);
            assert_eq!(head.hdr_idx, 0);
            assert_eq!(head.header_block, b"hdr");
            assert!(head.inline_body.is_empty());
            assert_eq!(head.body_seq_total, 7);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_resp_head_inline_body_round_trip() {
    let datagram =
        encode_resp_head(200, 5, b"hdr", 1, 0, b"hello", 0, ID, TS, FLAG_FINAL, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::RespHead(head) => {
            assert_eq!(head.header_block, b"hdr");
            assert_eq!(head.inline_body, b"hello");
            assert_eq!(head.body_seq_total, 0);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Inline body beside declared body datagrams is refused at encode.
    assert!(matches!(
        encode_resp_head(200, 5, b"", 1, 0, b"hello", 3, ID, TS, 0, &key()),
        Err(WireError::ProtocolViolation(_))
    ));
}

#[test]
fn test_resp_head_short_len_overflow_refused() {
    // A body length beyond 24 bits must fail instead of truncating.
    assert!(matches!(
        encode_resp_head(200, 0x0100_0000, b"", 1, 0, &[], 3, ID, TS, FLAG_SHORT_LEN, &key()),
        Err(WireError::PayloadTooLarge(_))
    ));
}

#[test]
fn test_resp_head_short_len_round_trip() {
    let datagram =
        encode_resp_head(200, 0x00AB_CDEF, b"", 1, 0, &[], 3, ID, TS, FLAG_SHORT_LEN, &key())
            .unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::RespHead(head) => assert_eq!(head.body_len, 0x00AB_CDEF),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_short_identifier_round_trip() {
    let datagram =
        encode_request(RequestMethod::Get, "https://e.com", &[], 0xBEEF, TS, FLAG_SHORT_ID, &key())
            .unwrap();
    // Short header: no timestamp, 2-byte identifier.
    assert_eq!(datagram.len(), HEADER_LEN_SHORT + 5 + 13 + 16);
    let packet = decode_packet(&datagram, &key()).unwrap();
    assert_eq!(packet.header.identifier, 0xBEEF);
    assert_eq!(packet.header.timestamp, 0);
}

#[test]
fn test_encrypted_round_trip() {
    let datagram =
        encode_resp_body(b"secret chunk", 2, 5, None, ID, TS, FLAG_ENCRYPT, &key()).unwrap();
    // Ciphertext on the wire must differ from the plaintext.
    assert!(!datagram
        .windows(b"secret chunk".len())
        .any(|w| w == b"secret chunk"));

    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::RespBody(body) => {
            assert_eq!(body.chunk, b"secret chunk");
            assert_eq!(body.seq, 2);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_wrong_key_fails_closed() {
    let datagram = encode_resp_body(b"chunk", 0, 1, None, ID, TS, 0, &key()).unwrap();
    let wrong = PskKey::new(b"another-psk");
    assert!(matches!(
        decode_packet(&datagram, &wrong),
        Err(WireError::AuthFailed)
    ));

    let encrypted = encode_resp_body(b"chunk", 0, 1, None, ID, TS, FLAG_ENCRYPT, &key()).unwrap();
    assert!(matches!(
        decode_packet(&encrypted, &wrong),
        Err(WireError::AuthFailed)
    ));
}

#[test]
fn test_any_flipped_bit_is_rejected() {
    for flags in [0u8, FLAG_ENCRYPT] {
        let datagram = encode_resp_body(b"tamper target", 1, 3, None, ID, TS, flags, &key()).unwrap();
        for byte in 0..datagram.len() {
            for bit in 0..8 {
                let mut mutated = datagram.clone();
                mutated[byte] ^= 1 << bit;
                assert!(
                    decode_packet(&mutated, &key()).is_err(),
                    "flip of byte {} bit {} accepted (flags {:#04x})",
                    byte,
                    bit,
                    flags
                );
            }
        }
    }
}

#[test]
fn test_truncated_and_extended_datagrams_rejected() {
    let datagram = encode_resp_body(b"chunk", 0, 1, None, ID, TS, 0, &key()).unwrap();

    let mut short = datagram.clone();
    short.pop();
    assert!(matches!(
        decode_packet(&short, &key()),
        Err(WireError::Malformed(_)) | Err(WireError::AuthFailed)
    ));

    let mut long = datagram;
    long.push(0);
    assert!(matches!(
        decode_packet(&long, &key()),
        Err(WireError::Malformed(_))
    ));
}

#[test]
fn test_bad_magic_and_reserved_byte() {
    let mut datagram = encode_ack(3, ID, TS, 0, &key()).unwrap();
    datagram[0] = b'X';
    assert!(matches!(
        decode_packet(&datagram, &key()),
        Err(WireError::Malformed("bad magic"))
    ));

    let mut datagram = encode_ack(3, ID, TS, 0, &key()).unwrap();
    datagram[5] = 1;
    assert!(matches!(
        decode_packet(&datagram, &key()),
        Err(WireError::Malformed("reserved byte nonzero"))
    ));
}

#[test]
fn test_unknown_version_rejected() {
    let mut datagram = encode_ack(3, ID, TS, 0, &key()).unwrap();
    datagram[2] = VERSION_V2;
    assert!(matches!(
        decode_packet(&datagram, &key()),
        Err(WireError::UnsupportedVersion(VERSION_V2))
    ));
}

#[test]
fn test_encrypt_with_agg_tag_refused_both_ways() {
    let err = encode_resp_body(b"x", 0, 1, None, ID, TS, FLAG_ENCRYPT | FLAG_AGG_TAG, &key())
        .unwrap_err();
    assert!(matches!(err, WireError::ProtocolViolation(_)));

    // A forged datagram claiming both flags must decode as malformed.
    let mut datagram = encode_resp_body(b"x", 0, 1, None, ID, TS, FLAG_ENCRYPT, &key()).unwrap();
    datagram[4] |= FLAG_AGG_TAG;
    assert!(matches!(
        decode_packet(&datagram, &key()),
        Err(WireError::Malformed(_))
    ));
}

#[test]
fn test_agg_mode_intermediate_chunks_have_no_tag() {
    let plain = encode_resp_body(b"chunk", 0, 3, None, ID, TS, 0, &key()).unwrap();
    let agg = encode_resp_body(b"chunk", 0, 3, None, ID, TS, FLAG_AGG_TAG, &key()).unwrap();
    assert_eq!(plain.len(), agg.len() + TAG_LEN);

    match decode_packet(&agg, &key()).unwrap().payload {
        Payload::RespBody(body) => {
            assert_eq!(body.chunk, b"chunk");
            assert!(body.agg_tag.is_none());
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_agg_mode_final_chunk_carries_tag() {
    let tag = aggregate_tag(&key(), [b"whole body".as_slice()]);
    let datagram =
        encode_resp_body(b"whole body", 2, 3, Some(&tag), ID, TS, FLAG_AGG_TAG, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::RespBody(body) => {
            assert_eq!(body.chunk, b"whole body");
            assert_eq!(body.agg_tag, Some(tag));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_nack_round_trip_and_set_bits() {
    let datagram = encode_nack_body(&[0b0000_0110, 0b0000_0001], ID, TS, 0, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::NackBody(nack) => {
            assert_eq!(nack.set_bits().collect::<Vec<_>>(), vec![1, 2, 8]);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_empty_nack_bitmap_illegal() {
    assert!(matches!(
        encode_nack_body(&[], ID, TS, 0, &key()),
        Err(WireError::ProtocolViolation(_))
    ));

    // Hand-build a NACK with bitmap_len = 0 and a fresh tag.
    let header = Header {
        kind: PacketKind::NackBody,
        flags: 0,
        identifier: ID,
        seq: 0,
        seq_total: 1,
        payload_len: 1,
        timestamp: TS,
    };
    let mut datagram = header.to_bytes();
    datagram.push(0);
    let tag = key().tag(&datagram);
    datagram.extend_from_slice(&tag);
    assert!(matches!(
        decode_packet(&datagram, &key()),
        Err(WireError::Malformed(_))
    ));
}

#[test]
fn test_ack_round_trip_and_empty_payload() {
    let datagram = encode_ack(41, ID, TS, 0, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::Ack(ack) => assert_eq!(ack.first_lost, 41),
        other => panic!("unexpected payload {:?}", other),
    }

    // Zero-length Ack payload is legal shorthand for "all received".
    let header = Header {
        kind: PacketKind::Ack,
        flags: 0,
        identifier: ID,
        seq: 0,
        seq_total: 1,
        payload_len: 0,
        timestamp: TS,
    };
    let mut datagram = header.to_bytes();
    let tag = key().tag(&datagram);
    datagram.extend_from_slice(&tag);
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::Ack(ack) => assert_eq!(ack.first_lost, ACK_ALL_RECEIVED),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_error_round_trip_and_truncation() {
    let datagram = encode_error(20, 504, "upstream timed out", ID, TS, 0, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::Error(err) => {
            assert_eq!(err.error_code, 20);
            assert_eq!(err.http_status, 504);
            assert_eq!(err.message, "upstream timed out");
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let long = "x".repeat(400);
    let datagram = encode_error(30, 502, &long, ID, TS, 0, &key()).unwrap();
    match decode_packet(&datagram, &key()).unwrap().payload {
        Payload::Error(err) => {
            assert!(err.message.ends_with("..."));
            assert_eq!(err.message.len(), 200);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_debug_dump_formats_header_and_payload() {
    let datagram =
        encode_request(RequestMethod::Get, "https://example.com/x", &[], ID, TS, 0, &key()).unwrap();
    let dump = debug_dump(&datagram, &key()).unwrap();
    assert!(dump.contains("kind=Req"));
    assert!(dump.contains(&format!("identifier={}", ID)));
    assert!(dump.contains("url=https://example.com/x"));

    let error = encode_error(20, 504, "late", ID, TS, 0, &key()).unwrap();
    let dump = debug_dump(&error, &key()).unwrap();
    assert!(dump.contains("code=20 http_status=504"));
}

#[test]
fn test_debug_dump_rejects_what_decode_rejects() {
    let mut datagram = encode_ack(1, ID, TS, 0, &key()).unwrap();
    let last = datagram.len() - 1;
    datagram[last] ^= 1;
    assert!(matches!(
        debug_dump(&datagram, &key()),
        Err(WireError::AuthFailed)
    ));
}

#[test]
fn test_psk_normalization_matches_for_odd_lengths() {
    // A non-32-byte PSK is hashed; the codec must agree with itself.
    let short_key = PskKey::new(b"pw");
    let datagram = encode_ack(0, ID, TS, 0, &short_key).unwrap();
    assert!(decode_packet(&datagram, &short_key).is_ok());

    let long_key = PskKey::new(&[7u8; 48]);
    let datagram = encode_ack(0, ID, TS, 0, &long_key).unwrap();
    assert!(decode_packet(&datagram, &long_key).is_ok());
}

// ============================================================================
// Codec gate: replay and staleness
// ============================================================================

fn now_ms() -> u64 {
    u64::from(TS) * 1000
}

#[test]
fn test_codec_replays_response_kinds() {
    let mut codec = Codec::new(key(), 30_000);
    let datagram = encode_resp_body(b"chunk", 0, 1, None, ID, TS, 0, &key()).unwrap();

    assert!(codec.decode(&datagram, now_ms()).is_ok());
    assert!(matches!(
        codec.decode(&datagram, now_ms() + 10),
        Err(WireError::Replay)
    ));
    // Outside the window the same bytes are acceptable again.
    assert!(codec.decode(&datagram, now_ms() + 30_011).is_ok());
}

#[test]
fn test_codec_distinguishes_sequences() {
    let mut codec = Codec::new(key(), 30_000);
    let a = encode_resp_body(b"chunk", 0, 2, None, ID, TS, 0, &key()).unwrap();
    let b = encode_resp_body(b"chunk", 1, 2, None, ID, TS, 0, &key()).unwrap();
    assert!(codec.decode(&a, now_ms()).is_ok());
    assert!(codec.decode(&b, now_ms()).is_ok());
}

#[test]
fn test_codec_never_gates_control_kinds() {
    let mut codec = Codec::new(key(), 30_000);
    let req = encode_request(RequestMethod::Get, "https://e.com", &[], ID, TS, 0, &key()).unwrap();
    let nack = encode_nack_body(&[0b1], ID, TS, 0, &key()).unwrap();
    let ack = encode_ack(1, ID, TS, 0, &key()).unwrap();
    for datagram in [&req, &nack, &ack] {
        assert!(codec.decode(datagram, now_ms()).is_ok());
        assert!(codec.decode(datagram, now_ms() + 1).is_ok());
    }
}

#[test]
fn test_codec_rejects_stale_timestamps() {
    let mut codec = Codec::new(key(), 30_000);
    let datagram = encode_resp_body(b"chunk", 0, 1, None, ID, TS, 0, &key()).unwrap();

    let skewed_past = (u64::from(TS) + 31) * 1000;
    assert!(matches!(
        codec.decode(&datagram, skewed_past),
        Err(WireError::Stale)
    ));
    let skewed_future = (u64::from(TS) - 31) * 1000;
    assert!(matches!(
        codec.decode(&datagram, skewed_future),
        Err(WireError::Stale)
    ));
    // At the edge of the window the datagram passes.
    assert!(codec.decode(&datagram, (u64::from(TS) + 30) * 1000).is_ok());
}

#[test]
fn test_codec_skips_skew_check_for_short_ids() {
    let mut codec = Codec::new(key(), 30_000);
    let datagram =
        encode_resp_body(b"chunk", 0, 1, None, 0xBEEF, 0, FLAG_SHORT_ID, &key()).unwrap();
    assert!(codec.decode(&datagram, now_ms()).is_ok());
}

#[test]
fn test_note_request_gates_identifier_timestamp_pairs() {
    let mut codec = Codec::new(key(), 30_000);
    assert!(codec.note_request(ID, TS, now_ms()));
    assert!(!codec.note_request(ID, TS, now_ms() + 5));
    assert!(codec.note_request(ID, TS + 1, now_ms() + 5));
    assert!(codec.note_request(ID, TS, now_ms() + 30_006));
}
