//! Responder engine.
//!
//! Demultiplexes inbound datagrams by identifier, invokes the fetch
//! capability exactly once per identifier, streams the chunked response,
//! and answers NACK/ACK control datagrams by replaying precisely the
//! requested subset from the per-identifier cache. Single-threaded
//! cooperative: one socket, one task, timer-driven cache sweeps.

mod cache;

pub use cache::{CachedResponse, ResponseCache};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_response, ChunkOptions};
use crate::clock::{unix_millis, unix_secs};
use crate::fetch::{
    Fetcher, ERROR_BODY_TOO_LARGE, ERROR_INTERNAL, ERROR_UNENCRYPTED_REFUSED,
    ERROR_UNSUPPORTED_VERSION,
};
use crate::headers::encode_header_block;
use crate::wire::{
    self, Codec, Packet, Payload, PskKey, WireError, ACK_ALL_RECEIVED, FLAG_ENCRYPT,
    NEGOTIATED_FLAGS, VERSION_V1, VERSION_V2,
};

/// Default replay-rejection window.
const REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Interval of the maintenance tick sweeping caches.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Most datagrams replayed for one `Ack(first_lost)`.
const ACK_RESEND_CAP: usize = 64;

/// Errors terminating the serve loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(std::io::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Responder-side policy, frozen at construction.
#[derive(Clone, Debug)]
pub struct ResponderPolicy {
    /// Reject plaintext requests with `Error(0x40, 400)`.
    pub require_encryption: bool,
    /// Retention window for emitted responses (retransmit source).
    pub resp_cache_ttl: Duration,
    /// Working per-datagram size for the chunker.
    pub mtu_budget: usize,
    /// Append an XOR parity chunk to every response body.
    pub parity_enabled: bool,
    /// Verbatim copies of each head datagram.
    pub head_duplication: u8,
    /// Verbatim copies of each body datagram.
    pub body_duplication: u8,
}

impl Default for ResponderPolicy {
    fn default() -> Self {
        Self {
            require_encryption: false,
            resp_cache_ttl: Duration::from_secs(5),
            mtu_budget: 1200,
            parity_enabled: false,
            head_duplication: 1,
            body_duplication: 1,
        }
    }
}

/// The origin-side gateway engine.
pub struct AkariServer {
    socket: UdpSocket,
    codec: Codec,
    fetcher: Arc<dyn Fetcher>,
    policy: ResponderPolicy,
    cache: ResponseCache,
}

impl AkariServer {
    /// Bind the responder socket.
    pub async fn bind(
        bind_host: &str,
        bind_port: u16,
        psk: &[u8],
        fetcher: Arc<dyn Fetcher>,
        policy: ResponderPolicy,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind((bind_host, bind_port))
            .await
            .map_err(ServerError::Bind)?;
        info!(local_addr = %socket.local_addr()?, "responder listening");
        Ok(Self {
            socket,
            codec: Codec::new(PskKey::new(psk), REPLAY_WINDOW.as_millis() as u64),
            cache: ResponseCache::new(policy.resp_cache_ttl.as_millis() as u64),
            fetcher,
            policy,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run until cancelled (drop the future or select against a shutdown
    /// signal). Cancellation abandons in-flight re-emits and the cache.
    pub async fn serve(&mut self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; 65535];
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await?,
                        Err(e) => {
                            // Transient errors (ICMP port unreachable and
                            // friends) must not kill the loop.
                            warn!(error = %e, "recv_from failed");
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now_ms = unix_millis();
                    self.cache.sweep(now_ms);
                    self.codec.sweep(now_ms);
                }
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<(), ServerError> {
        let now_ms = unix_millis();
        let packet = match self.codec.decode(datagram, now_ms) {
            Ok(packet) => packet,
            Err(WireError::UnsupportedVersion(version)) => {
                self.reject_version(datagram, version, peer).await?;
                return Ok(());
            }
            Err(e) => {
                debug!(%peer, error = %e, "discarding datagram");
                return Ok(());
            }
        };

        match &packet.payload {
            Payload::Req(_) => self.handle_request(&packet, peer, now_ms).await?,
            Payload::NackHead(nack) => {
                let targets = self.cache.touch(packet.header.identifier, now_ms).map(|entry| {
                    let selected: Vec<Vec<u8>> = nack
                        .set_bits()
                        .filter_map(|idx| entry.head.get(idx as usize).cloned())
                        .collect();
                    (entry.peer, selected)
                });
                self.replay(packet.header.identifier, targets, "head NACK").await?;
            }
            Payload::NackBody(nack) => {
                let targets = self.cache.touch(packet.header.identifier, now_ms).map(|entry| {
                    let selected: Vec<Vec<u8>> = nack
                        .set_bits()
                        .filter_map(|seq| entry.body.get(seq as usize).cloned())
                        .collect();
                    (entry.peer, selected)
                });
                self.replay(packet.header.identifier, targets, "body NACK").await?;
            }
            Payload::Ack(ack) => {
                if ack.first_lost == ACK_ALL_RECEIVED {
                    return Ok(());
                }
                let targets = self.cache.touch(packet.header.identifier, now_ms).map(|entry| {
                    let selected: Vec<Vec<u8>> = entry
                        .body
                        .iter()
                        .skip(ack.first_lost as usize)
                        .take(ACK_RESEND_CAP)
                        .cloned()
                        .collect();
                    (entry.peer, selected)
                });
                self.replay(packet.header.identifier, targets, "first-lost ACK").await?;
            }
            Payload::Error(err) => {
                debug!(
                    identifier = packet.header.identifier,
                    code = err.error_code,
                    "peer reported an error, discarding cached response"
                );
                self.cache.remove(packet.header.identifier);
            }
            _ => {
                warn!(%peer, kind = %packet.header.kind, "response kind received by responder, ignoring");
            }
        }
        Ok(())
    }

    async fn handle_request(
        &mut self,
        packet: &Packet,
        peer: SocketAddr,
        now_ms: u64,
    ) -> Result<(), ServerError> {
        let Payload::Req(req) = &packet.payload else {
            return Ok(());
        };
        let identifier = packet.header.identifier;
        let flags = packet.header.flags & NEGOTIATED_FLAGS;

        if self.policy.require_encryption && packet.header.flags & FLAG_ENCRYPT == 0 {
            debug!(identifier, %peer, "plaintext request refused by policy");
            self.send_error(
                ERROR_UNENCRYPTED_REFUSED,
                400,
                "encryption required",
                identifier,
                flags,
                peer,
            )
            .await?;
            return Ok(());
        }

        // A known identifier is a duplicate request: re-emit the head and
        // let the initiator drive retransmits. Never refetch.
        if let Some(entry) = self.cache.touch(identifier, now_ms) {
            debug!(identifier, %peer, "duplicate request, re-emitting head");
            let heads: Vec<Vec<u8>> = entry.head.clone();
            let to = entry.peer;
            for dg in &heads {
                self.socket.send_to(dg, to).await?;
            }
            return Ok(());
        }

        // Past the response cache, a repeated (identifier, timestamp) is a
        // replay and must not re-invoke the fetcher.
        if !self.codec.note_request(identifier, packet.header.timestamp, now_ms) {
            debug!(identifier, %peer, "replayed request dropped");
            return Ok(());
        }

        info!(identifier, url = %req.url, method = %req.method, %peer, "handling request");
        let request_headers = match crate::headers::decode_header_block(&req.header_block) {
            Ok(headers) => headers,
            Err(e) => {
                debug!(identifier, error = %e, "request header block undecodable");
                return Ok(());
            }
        };

        let fetched = match self.fetcher.fetch(&req.url, req.method, &request_headers).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let (code, status) = e.wire_code();
                warn!(identifier, url = %req.url, error = %e, code, "fetch failed");
                self.send_error(code, status, &e.to_string(), identifier, flags, peer)
                    .await?;
                return Ok(());
            }
        };

        let header_block = match encode_header_block(&fetched.headers) {
            Ok(block) => block,
            Err(e) => {
                warn!(identifier, error = %e, "response headers unencodable");
                self.send_error(ERROR_INTERNAL, 500, "internal server error", identifier, flags, peer)
                    .await?;
                return Ok(());
            }
        };

        let opts = ChunkOptions {
            mtu_budget: self.policy.mtu_budget,
            flags,
            parity: self.policy.parity_enabled,
            head_copies: self.policy.head_duplication,
            body_copies: self.policy.body_duplication,
        };
        let plan = match chunk_response(
            fetched.status_code,
            &header_block,
            &fetched.body,
            identifier,
            unix_secs(),
            &opts,
            self.codec.key(),
        ) {
            Ok(plan) => plan,
            Err(WireError::PayloadTooLarge(size)) => {
                warn!(identifier, size, "response too large for the sequence space");
                self.send_error(ERROR_BODY_TOO_LARGE, 502, "response too large", identifier, flags, peer)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                warn!(identifier, error = %e, "chunking failed");
                self.send_error(ERROR_INTERNAL, 500, "internal server error", identifier, flags, peer)
                    .await?;
                return Ok(());
            }
        };

        debug!(
            identifier,
            status = fetched.status_code,
            body_len = fetched.body.len(),
            datagrams = plan.emit_len(),
            "streaming response"
        );
        for dg in plan.emit_order() {
            self.socket.send_to(dg, peer).await?;
        }
        self.cache.insert(identifier, plan, peer, now_ms);
        Ok(())
    }

    /// Re-emit a selected subset of cached datagrams, bit-identical.
    async fn replay(
        &mut self,
        identifier: u64,
        targets: Option<(SocketAddr, Vec<Vec<u8>>)>,
        what: &str,
    ) -> Result<(), ServerError> {
        match targets {
            Some((peer, datagrams)) if !datagrams.is_empty() => {
                debug!(identifier, count = datagrams.len(), "re-emitting for {}", what);
                for dg in &datagrams {
                    self.socket.send_to(dg, peer).await?;
                }
            }
            Some(_) => {}
            None => debug!(identifier, "{} for unknown or expired identifier", what),
        }
        Ok(())
    }

    async fn send_error(
        &self,
        code: u8,
        http_status: u16,
        message: &str,
        identifier: u64,
        flags: u8,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        match wire::encode_error(
            code,
            http_status,
            message,
            identifier,
            unix_secs(),
            flags,
            self.codec.key(),
        ) {
            Ok(datagram) => {
                self.socket.send_to(&datagram, peer).await?;
            }
            Err(e) => warn!(identifier, error = %e, "failed to encode error datagram"),
        }
        Ok(())
    }

    /// Answer a datagram of a version this engine does not speak. The
    /// identifier is recovered best-effort from the legacy fixed layout;
    /// nothing else in the datagram is trusted.
    async fn reject_version(
        &self,
        datagram: &[u8],
        version: u8,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        let identifier = match version {
            VERSION_V1 | VERSION_V2 if datagram.len() >= 14 => {
                u64::from_be_bytes(datagram[6..14].try_into().expect("8-byte slice"))
            }
            _ => 0,
        };
        debug!(%peer, version, identifier, "rejecting unsupported version");
        self.send_error(
            ERROR_UNSUPPORTED_VERSION,
            505,
            "unsupported protocol version",
            identifier,
            0,
            peer,
        )
        .await
    }
}

/// Convenience: bind and serve in one call, in the shape the upper layers
/// consume.
pub async fn serve(
    bind_host: &str,
    bind_port: u16,
    psk: &[u8],
    fetcher: Arc<dyn Fetcher>,
    policy: ResponderPolicy,
) -> Result<(), ServerError> {
    let mut server = AkariServer::bind(bind_host, bind_port, psk, fetcher, policy).await?;
    server.serve().await
}
