//! The origin-fetch capability.
//!
//! The responder never speaks HTTP itself; it is handed a single-method
//! capability at construction and reports its outcomes faithfully on the
//! wire. This is the only runtime polymorphism in the crate.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::wire::RequestMethod;

/// Wire error codes carried in `Error` datagrams, each paired with an
/// HTTP-style status hint for the initiator to map upstream.
pub const ERROR_INVALID_URL: u8 = 10;
pub const ERROR_BODY_TOO_LARGE: u8 = 11;
pub const ERROR_UPSTREAM_TIMEOUT: u8 = 20;
pub const ERROR_UPSTREAM_FAILURE: u8 = 30;
pub const ERROR_UNENCRYPTED_REFUSED: u8 = 0x40;
pub const ERROR_UNSUPPORTED_VERSION: u8 = 0x50;
pub const ERROR_INTERNAL: u8 = 255;

/// A fetched origin response, ready for chunking.
#[derive(Clone, Debug)]
pub struct FetchedResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Failures a fetcher may report.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("response body exceeds the {0}-byte cap")]
    BodyTooLarge(usize),

    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl FetchError {
    /// `(error_code, http_status)` pair for the wire `Error` datagram.
    pub fn wire_code(&self) -> (u8, u16) {
        match self {
            FetchError::InvalidUrl(_) => (ERROR_INVALID_URL, 400),
            FetchError::BodyTooLarge(_) => (ERROR_BODY_TOO_LARGE, 502),
            FetchError::UpstreamTimeout(_) => (ERROR_UPSTREAM_TIMEOUT, 504),
            FetchError::Upstream(_) => (ERROR_UPSTREAM_FAILURE, 502),
        }
    }
}

/// Origin-side fetch capability handed to the responder at construction.
///
/// Invoked exactly once per request identifier; duplicate requests are
/// served from the responder's cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        method: RequestMethod,
        headers: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError>;
}
