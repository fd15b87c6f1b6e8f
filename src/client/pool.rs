//! Pool of independent initiator engines.
//!
//! Each member owns its socket and request state; the pool only hands a
//! free member to the caller, so engines never share mutable state. A
//! round-robin scan prefers an idle member and otherwise waits on the
//! next one in turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{AkariClient, Failure, HttpResponse, RequestConfig};
use crate::wire::RequestMethod;

pub struct AkariClientPool {
    members: Vec<Arc<Mutex<AkariClient>>>,
    next: AtomicUsize,
}

impl AkariClientPool {
    /// Build `pool_size` clients against the same responder.
    pub async fn new(
        remote_host: &str,
        remote_port: u16,
        psk: &[u8],
        default_flags: u8,
        pool_size: usize,
    ) -> Result<Self, Failure> {
        let pool_size = pool_size.max(1);
        let mut members = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            members.push(Arc::new(Mutex::new(
                AkariClient::new(remote_host, remote_port, psk, default_flags).await?,
            )));
        }
        Ok(Self {
            members,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Dispatch a request to an available member.
    pub async fn send_request(
        &self,
        url: &str,
        method: RequestMethod,
        headers: &[(String, String)],
        config: &RequestConfig,
    ) -> Result<HttpResponse, Failure> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        // One pass for an idle member first.
        for offset in 0..self.members.len() {
            let member = &self.members[(start + offset) % self.members.len()];
            if let Ok(mut client) = member.try_lock() {
                return client.fetch(url, method, headers, config).await;
            }
        }
        // All busy: queue on the round-robin choice.
        let member = &self.members[start % self.members.len()];
        let mut client = member.lock().await;
        client.fetch(url, method, headers, config).await
    }
}
