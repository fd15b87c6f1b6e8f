//! Datagram authentication primitives.
//!
//! Two schemes share one normalized key: truncated HMAC-SHA-256 when the
//! payload travels in the clear, and XChaCha20-Poly1305 with the header as
//! associated data when the encrypt flag is set. The AEAD nonce is a pure
//! function of header fields that are themselves covered by the tag, so a
//! bit-identical retransmit reuses the same nonce by construction, which
//! is exactly what the responder's cache replay requires.

use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{Header, WireError};

/// Authentication tag length for both schemes.
pub const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Normalized pre-shared key.
///
/// A PSK of exactly 32 bytes is used verbatim; anything else is replaced by
/// its SHA-256 digest. The same 32 bytes feed HMAC and the AEAD cipher.
/// Read-only after construction.
#[derive(Clone)]
pub struct PskKey([u8; 32]);

impl PskKey {
    pub fn new(psk: &[u8]) -> Self {
        let key = if psk.len() == 32 {
            let mut out = [0u8; 32];
            out.copy_from_slice(psk);
            out
        } else {
            Sha256::digest(psk).into()
        };
        PskKey(key)
    }

    /// Truncated HMAC-SHA-256 over arbitrary bytes.
    pub fn tag(&self, data: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(data);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }

    /// Constant-time verification of a truncated HMAC tag.
    pub fn verify_tag(&self, data: &[u8], tag: &[u8]) -> Result<(), WireError> {
        if tag.len() != TAG_LEN {
            return Err(WireError::AuthFailed);
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(data);
        mac.verify_truncated_left(tag).map_err(|_| WireError::AuthFailed)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new_from_slice(&self.0).expect("32-byte key")
    }

    /// Encrypt a payload; returns ciphertext and detached Poly1305 tag.
    pub fn seal(&self, header: &Header, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; TAG_LEN]), WireError> {
        let aad = header.to_bytes();
        let mut combined = self
            .cipher()
            .encrypt(
                &derive_nonce(header),
                AeadPayload { msg: plaintext, aad: &aad },
            )
            .map_err(|_| WireError::AuthFailed)?;
        let split = combined.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&combined[split..]);
        combined.truncate(split);
        Ok((combined, tag))
    }

    /// Decrypt and authenticate a payload against the header bytes as AAD.
    pub fn open(
        &self,
        header: &Header,
        header_bytes: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        if tag.len() != TAG_LEN {
            return Err(WireError::AuthFailed);
        }
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);
        self.cipher()
            .decrypt(
                &derive_nonce(header),
                AeadPayload { msg: &combined, aad: header_bytes },
            )
            .map_err(|_| WireError::AuthFailed)
    }
}

impl std::fmt::Debug for PskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "PskKey(..)")
    }
}

/// Nonce layout: identifier(8) | seq(2) | flags & 0x03 (1) | zero pad to 24.
fn derive_nonce(header: &Header) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[0..8].copy_from_slice(&header.identifier.to_be_bytes());
    nonce[8..10].copy_from_slice(&header.seq.to_be_bytes());
    nonce[10] = header.flags & 0x03;
    XNonce::from(nonce)
}

/// Aggregate tag over the ordered concatenation of data body payloads.
///
/// Computed incrementally so callers can feed chunks without concatenating
/// the whole body first.
pub fn aggregate_tag<'a>(key: &PskKey, chunks: impl IntoIterator<Item = &'a [u8]>) -> [u8; TAG_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

impl PskKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
