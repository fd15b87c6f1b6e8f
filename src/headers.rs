//! HTTP header-block codec.
//!
//! Compresses a list of `(name, value)` pairs using a small static name
//! table. Each entry is either `[id:1][value_len:2][value]` for a name in
//! the table, or `[0][name_len:1][name][value_len:2][value]` for a literal
//! name. Duplicate names are preserved in insertion order and the decoder
//! is the exact inverse. The block itself is opaque to the wire codec and
//! may be split across head datagrams by the chunker.

use thiserror::Error;

/// Static name table. IDs are fixed protocol constants; 0 is reserved for
/// the literal form.
const STATIC_NAMES: &[(u8, &str)] = &[
    (1, "content-type"),
    (2, "content-length"),
    (3, "cache-control"),
    (4, "etag"),
    (5, "last-modified"),
    (6, "date"),
    (7, "server"),
    (8, "content-encoding"),
    (9, "accept-ranges"),
    (10, "set-cookie"),
    (11, "location"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderBlockError {
    #[error("header block truncated")]
    Truncated,

    #[error("unknown static header id {0}")]
    UnknownId(u8),

    #[error("header name longer than 255 bytes")]
    NameTooLong,

    #[error("header value longer than 65535 bytes")]
    ValueTooLong,

    #[error("header text is not UTF-8")]
    InvalidUtf8,
}

fn static_id(name: &str) -> Option<u8> {
    STATIC_NAMES
        .iter()
        .find(|(_, n)| name.eq_ignore_ascii_case(n))
        .map(|(id, _)| *id)
}

fn static_name(id: u8) -> Option<&'static str> {
    STATIC_NAMES.iter().find(|(i, _)| *i == id).map(|(_, n)| *n)
}

/// Encode header pairs into a block.
pub fn encode_header_block(headers: &[(String, String)]) -> Result<Vec<u8>, HeaderBlockError> {
    let mut block = Vec::new();
    for (name, value) in headers {
        let value_bytes = value.as_bytes();
        if value_bytes.len() > u16::MAX as usize {
            return Err(HeaderBlockError::ValueTooLong);
        }
        match static_id(name) {
            Some(id) => block.push(id),
            None => {
                let name_bytes = name.as_bytes();
                if name_bytes.len() > u8::MAX as usize {
                    return Err(HeaderBlockError::NameTooLong);
                }
                block.push(0);
                block.push(name_bytes.len() as u8);
                block.extend_from_slice(name_bytes);
            }
        }
        block.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
        block.extend_from_slice(value_bytes);
    }
    Ok(block)
}

/// Decode a block back into ordered header pairs.
pub fn decode_header_block(block: &[u8]) -> Result<Vec<(String, String)>, HeaderBlockError> {
    let mut headers = Vec::new();
    let mut pos = 0;
    while pos < block.len() {
        let id = block[pos];
        pos += 1;
        let name = if id == 0 {
            let name_len = *block.get(pos).ok_or(HeaderBlockError::Truncated)? as usize;
            pos += 1;
            let raw = block
                .get(pos..pos + name_len)
                .ok_or(HeaderBlockError::Truncated)?;
            pos += name_len;
            std::str::from_utf8(raw)
                .map_err(|_| HeaderBlockError::InvalidUtf8)?
                .to_string()
        } else {
            static_name(id)
                .ok_or(HeaderBlockError::UnknownId(id))?
                .to_string()
        };

        let len_bytes = block
            .get(pos..pos + 2)
            .ok_or(HeaderBlockError::Truncated)?;
        let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        pos += 2;
        let raw = block
            .get(pos..pos + value_len)
            .ok_or(HeaderBlockError::Truncated)?;
        pos += value_len;
        let value = std::str::from_utf8(raw)
            .map_err(|_| HeaderBlockError::InvalidUtf8)?
            .to_string();

        headers.push((name, value));
    }
    Ok(headers)
}
