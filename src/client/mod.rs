//! Initiator engine.
//!
//! Owns one UDP socket and drives a single request at a time through the
//! state machine: send `Req` with bounded retry, feed every authenticated
//! datagram to the assembler, emit NACK/ACK control datagrams on gap
//! dwell, fall back to heartbeat re-emission through silences, and yield
//! either the assembled response or a typed failure at the deadline.
//! Concurrent callers use [`AkariClientPool`].

mod id_alloc;
mod pool;

pub use id_alloc::IdAllocator;
pub use pool::AkariClientPool;

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::assemble::{Accepted, ResponseAssembler};
use crate::clock::{unix_millis, unix_secs};
use crate::headers::encode_header_block;
use crate::wire::{
    self, Codec, Payload, PskKey, RequestMethod, WireError, ACK_ALL_RECEIVED, FLAG_AGG_TAG,
    FLAG_ENCRYPT, NEGOTIATED_FLAGS,
};

/// Default replay-rejection window.
const REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Typed failure observed at the initiator API.
#[derive(Debug, Error)]
pub enum Failure {
    /// Hard deadline reached; carries whatever counters accrued.
    #[error("request timed out")]
    Timeout { stats: TransferStats },

    #[error("peer error {code} (http {http_status}): {message}")]
    Peer {
        code: u8,
        http_status: u16,
        message: String,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("response authentication failed")]
    AuthFailed,
}

/// Per-request configuration. `flags` of `None` falls back to the
/// client-wide default flag set.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    /// Hard deadline for the whole fetch.
    pub timeout: Duration,
    /// Fresh NACK emissions allowed per request.
    pub max_nack_rounds: u32,
    /// Most sequences named in one NACK bitmap.
    pub max_nack_bits: usize,
    /// Req retransmissions while no response datagram has arrived.
    pub initial_request_retries: u32,
    /// Interval between those retransmissions.
    pub initial_request_retry_interval: Duration,
    /// Dwell before an unchanged first gap triggers a NACK.
    pub first_gap_timeout: Duration,
    /// Silence before the most recent NACK (or a first-lost Ack) is
    /// re-emitted.
    pub heartbeat_interval: Duration,
    /// Multiplier applied to the heartbeat interval on consecutive
    /// silences.
    pub heartbeat_backoff: f64,
    /// Random extra delay added to each heartbeat, flap protection.
    pub retry_jitter: Duration,
    /// Flag override for this request.
    pub flags: Option<u8>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_nack_rounds: 3,
            max_nack_bits: 256,
            initial_request_retries: 1,
            initial_request_retry_interval: Duration::from_millis(500),
            first_gap_timeout: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_backoff: 1.5,
            retry_jitter: Duration::ZERO,
            flags: None,
        }
    }
}

/// Transfer counters for one fetch; every field is non-decreasing over
/// the life of the request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub nacks_sent: u32,
    pub request_retries: u32,
}

/// A completed tunnelled response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stats: TransferStats,
}

/// The browser-side tunnel endpoint.
pub struct AkariClient {
    remote_addr: SocketAddr,
    socket: UdpSocket,
    codec: Codec,
    default_flags: u8,
    ids: IdAllocator,
}

impl AkariClient {
    /// Resolve the responder address and bind an ephemeral socket.
    pub async fn new(
        remote_host: &str,
        remote_port: u16,
        psk: &[u8],
        default_flags: u8,
    ) -> Result<Self, Failure> {
        let remote_addr = tokio::net::lookup_host((remote_host, remote_port))
            .await?
            .next()
            .ok_or(Failure::ProtocolViolation("remote host does not resolve"))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(remote_addr).await?;

        let default_flags = default_flags & NEGOTIATED_FLAGS;
        Ok(Self {
            remote_addr,
            socket,
            codec: Codec::new(PskKey::new(psk), REPLAY_WINDOW.as_millis() as u64),
            ids: IdAllocator::new(default_flags & wire::FLAG_SHORT_ID != 0),
            default_flags,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Fetch one URL through the tunnel.
    ///
    /// The returned body is in wire-declared sequence order regardless of
    /// arrival order. On the hard deadline the accrued counters are
    /// dropped with the partial state and `Timeout` is returned.
    pub async fn fetch(
        &mut self,
        url: &str,
        method: RequestMethod,
        headers: &[(String, String)],
        config: &RequestConfig,
    ) -> Result<HttpResponse, Failure> {
        let flags = config.flags.unwrap_or(self.default_flags) & NEGOTIATED_FLAGS;
        if flags & FLAG_ENCRYPT != 0 && flags & FLAG_AGG_TAG != 0 {
            // Refused before any datagram leaves the socket.
            return Err(Failure::ProtocolViolation(
                "encrypt and aggregate-tag are mutually exclusive under per-datagram AEAD",
            ));
        }

        self.codec.sweep(unix_millis());
        let identifier = self.ids.allocate();
        let result = self.run_request(url, method, headers, flags, identifier, config).await;
        self.ids.release(identifier);
        result
    }

    async fn run_request(
        &mut self,
        url: &str,
        method: RequestMethod,
        headers: &[(String, String)],
        flags: u8,
        identifier: u64,
        config: &RequestConfig,
    ) -> Result<HttpResponse, Failure> {
        let header_block = encode_header_block(headers)
            .map_err(|_| Failure::ProtocolViolation("request headers unencodable"))?;
        let request = wire::encode_request(
            method,
            url,
            &header_block,
            identifier,
            unix_secs(),
            flags,
            self.codec.key(),
        )
        .map_err(wire_failure)?;

        debug!(identifier, %url, %method, "sending request");
        self.socket.send(&request).await?;

        let mut stats = TransferStats {
            bytes_sent: request.len() as u64,
            ..TransferStats::default()
        };
        let deadline = Instant::now() + config.timeout;
        let mut assembler = ResponseAssembler::expecting(identifier, flags);

        // Initial-request retry state: armed until the first valid
        // response datagram cancels it or the budget runs out.
        let mut retries_left = config.initial_request_retries;
        let mut retry_at = (retries_left > 0)
            .then(|| Instant::now() + config.initial_request_retry_interval);

        // Gap dwell: (first missing sequence, unchanged since).
        let mut gap: Option<(u16, Instant)> = None;
        let mut nack_rounds = 0u32;
        let mut last_nack: Option<Vec<u8>> = None;

        // Heartbeat: silence recovery with multiplicative backoff.
        let mut heartbeat_interval = config.heartbeat_interval;
        let mut heartbeat_at = Instant::now() + heartbeat_interval;

        let mut buf = vec![0u8; 65535];
        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(identifier, "hard deadline reached");
                return Err(Failure::Timeout { stats });
            }

            let mut wake = deadline;
            if let Some(at) = retry_at {
                wake = wake.min(at);
            }
            if assembler.started() {
                wake = wake.min(heartbeat_at);
                // The gap deadline only matters while NACK rounds remain;
                // past the bound the heartbeat is the sole wake source.
                if nack_rounds < config.max_nack_rounds {
                    if let Some((_, since)) = gap {
                        wake = wake.min(since + config.first_gap_timeout);
                    }
                }
            }

            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                            // ICMP port unreachable; the retry machinery
                            // already covers this case.
                            continue;
                        }
                        Err(e) => return Err(Failure::Transport(e)),
                    };
                    stats.bytes_received += len as u64;

                    let packet = match self.codec.decode(&buf[..len], unix_millis()) {
                        Ok(packet) => packet,
                        Err(e) => {
                            trace!(identifier, error = %e, "dropping datagram");
                            continue;
                        }
                    };
                    if packet.header.identifier != identifier {
                        trace!(got = packet.header.identifier, "datagram for another identifier");
                        continue;
                    }

                    if let Payload::Error(err) = &packet.payload {
                        debug!(identifier, code = err.error_code, "peer error");
                        return Err(Failure::Peer {
                            code: err.error_code,
                            http_status: err.http_status,
                            message: err.message.clone(),
                        });
                    }

                    match assembler.accept(&packet) {
                        Ok(Accepted::Fresh) => {
                            // Any valid response datagram cancels the
                            // initial-request retry loop and resets the
                            // heartbeat clock.
                            retry_at = None;
                            heartbeat_interval = config.heartbeat_interval;
                            heartbeat_at = Instant::now() + heartbeat_interval;

                            if assembler.is_complete() {
                                break;
                            }
                            update_gap(&assembler, &mut gap);
                        }
                        Ok(Accepted::Duplicate) => {}
                        Err(e) => {
                            trace!(identifier, error = %e, "assembler rejected datagram");
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Failure::Timeout { stats });
                    }

                    if let Some(at) = retry_at {
                        if now >= at {
                            debug!(identifier, retries_left, "retransmitting request");
                            self.socket.send(&request).await?;
                            stats.bytes_sent += request.len() as u64;
                            stats.request_retries += 1;
                            retries_left -= 1;
                            retry_at = (retries_left > 0)
                                .then(|| now + config.initial_request_retry_interval);
                            continue;
                        }
                    }

                    if !assembler.started() {
                        continue;
                    }

                    // Gap dwell expired: name the missing sequences.
                    if let Some((_, since)) = gap {
                        if now >= since + config.first_gap_timeout && nack_rounds < config.max_nack_rounds {
                            if let Some(nack) = self.build_nack(&assembler, identifier, flags, config)? {
                                self.socket.send(&nack).await?;
                                stats.bytes_sent += nack.len() as u64;
                                stats.nacks_sent += 1;
                                nack_rounds += 1;
                                last_nack = Some(nack);
                                gap = gap.map(|(seq, _)| (seq, now));
                                heartbeat_at = now + heartbeat_interval;
                                continue;
                            }
                        }
                    }

                    // Silence: re-emit the latest NACK, or a first-lost
                    // Ack when none was ever needed.
                    if now >= heartbeat_at {
                        let datagram = match &last_nack {
                            Some(nack) => nack.clone(),
                            None => wire::encode_ack(
                                assembler.first_lost(),
                                identifier,
                                unix_secs(),
                                flags,
                                self.codec.key(),
                            )
                            .map_err(wire_failure)?,
                        };
                        debug!(identifier, interval_ms = heartbeat_interval.as_millis() as u64, "heartbeat re-emission");
                        self.socket.send(&datagram).await?;
                        stats.bytes_sent += datagram.len() as u64;
                        if last_nack.is_some() {
                            stats.nacks_sent += 1;
                        }

                        heartbeat_interval = Duration::from_secs_f64(
                            heartbeat_interval.as_secs_f64() * config.heartbeat_backoff.max(1.0),
                        );
                        let jitter = if config.retry_jitter.is_zero() {
                            Duration::ZERO
                        } else {
                            config.retry_jitter.mul_f64(rand::thread_rng().gen::<f64>())
                        };
                        heartbeat_at = now + heartbeat_interval + jitter;
                    }
                }
            }
        }

        let response = assembler.finish(self.codec.key()).map_err(|e| match e {
            WireError::AuthFailed => Failure::AuthFailed,
            _ => Failure::ProtocolViolation("assembled response undecodable"),
        })?;
        debug!(
            identifier,
            status = response.status_code,
            body_len = response.body.len(),
            nacks = stats.nacks_sent,
            retries = stats.request_retries,
            "request complete"
        );
        Ok(HttpResponse {
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
            stats,
        })
    }

    /// Head gaps take priority: nothing completes without the head.
    fn build_nack(
        &self,
        assembler: &ResponseAssembler,
        identifier: u64,
        flags: u8,
        config: &RequestConfig,
    ) -> Result<Option<Vec<u8>>, Failure> {
        if assembler.head_incomplete() {
            if let Some(bitmap) = assembler.missing_head_bitmap(config.max_nack_bits) {
                let nack =
                    wire::encode_nack_head(&bitmap, identifier, unix_secs(), flags, self.codec.key())
                        .map_err(wire_failure)?;
                return Ok(Some(nack));
            }
        }
        if let Some(bitmap) = assembler.missing_body_bitmap(config.max_nack_bits) {
            let nack = wire::encode_nack_body(&bitmap, identifier, unix_secs(), flags, self.codec.key())
                .map_err(wire_failure)?;
            return Ok(Some(nack));
        }
        Ok(None)
    }
}

/// Track the first-gap transition. Each advance restarts the dwell clock
/// so a NACK fires only once the gap has actually stalled.
fn update_gap(assembler: &ResponseAssembler, gap: &mut Option<(u16, Instant)>) {
    let first_lost = assembler.first_lost();
    if first_lost == ACK_ALL_RECEIVED && !assembler.head_incomplete() {
        *gap = None;
        return;
    }
    match gap {
        Some((seq, _)) if *seq == first_lost => {}
        _ => *gap = Some((first_lost, Instant::now())),
    }
}

fn wire_failure(error: WireError) -> Failure {
    match error {
        WireError::ProtocolViolation(what) => Failure::ProtocolViolation(what),
        WireError::PayloadTooLarge(_) => Failure::ProtocolViolation("payload exceeds wire limits"),
        WireError::AuthFailed => Failure::AuthFailed,
        _ => Failure::ProtocolViolation("datagram construction failed"),
    }
}
