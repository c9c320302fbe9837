//! Upstream HTTP Port (spec §4 L1): the one place that actually opens a
//! connection to an Antigravity base URL. Wraps `wreq` (a `reqwest`-shaped
//! client the Antigravity provider build already depends on) rather than
//! plain `reqwest`.
//!
//! Grounded on `gproxy-core::upstream_client::WreqUpstreamClient` and the
//! ad hoc `wreq::Client::builder()` call sites in
//! `providers::antigravity::mod.rs`, extended with a per-account
//! concurrency cap (spec §5 ambient concurrency notes) gproxy's
//! single-tenant client doesn't need.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{Mutex, Semaphore, mpsc};
use wreq::{Client, Proxy};

use antigate_provider_core::AccountId;

use crate::retry_loop::TransportFailureKind;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: Bytes,
}

pub struct StreamingUpstreamResponse {
    pub status: u16,
    pub chunks: mpsc::Receiver<Result<Bytes, TransportFailureKind>>,
}

pub struct UpstreamRequest<'a> {
    pub url: &'a str,
    pub bearer_token: &'a str,
    pub body: Bytes,
    pub headers: &'a [(&'static str, String)],
}

/// Per-proxy `wreq::Client` cache plus a per-account semaphore so one noisy
/// account can't starve the connection pool the others share.
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<Option<String>, Client>>,
    account_limits: Mutex<HashMap<AccountId, Arc<Semaphore>>>,
    max_concurrent_per_account: usize,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig, max_concurrent_per_account: usize) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            account_limits: Mutex::new(HashMap::new()),
            max_concurrent_per_account: max_concurrent_per_account.max(1),
        }
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<Client, TransportFailureKind> {
        let key = proxy.map(str::to_string);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .read_timeout(self.config.stream_idle_timeout);
        if let Some(proxy_url) = proxy {
            let proxy = Proxy::all(proxy_url).map_err(|_| TransportFailureKind::Other)?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|_| TransportFailureKind::Other)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn permit_for(&self, account_id: AccountId) -> Arc<Semaphore> {
        let mut limits = self.account_limits.lock().await;
        limits
            .entry(account_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_account)))
            .clone()
    }

    fn build_request(&self, client: &Client, request: UpstreamRequest<'_>) -> wreq::RequestBuilder {
        let mut builder = client
            .post(request.url)
            .bearer_auth(request.bearer_token)
            .body(request.body);
        for (name, value) in request.headers {
            builder = builder.header(*name, value.as_str());
        }
        builder
    }

    /// Non-streaming send: buffers the full body. Used for the
    /// stream-to-nonstream bridge, which always calls the streaming
    /// endpoint upstream but collapses it before returning to the client.
    pub async fn send(
        &self,
        account_id: AccountId,
        request: UpstreamRequest<'_>,
    ) -> Result<UpstreamResponse, TransportFailureKind> {
        let semaphore = self.permit_for(account_id).await;
        let _permit = semaphore.acquire_owned().await.map_err(|_| TransportFailureKind::Other)?;

        let client = self.client_for(self.config.proxy.as_deref()).await?;
        let builder = self.build_request(&client, request);
        let response = builder.send().await.map_err(classify_wreq_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_wreq_error)?;
        Ok(UpstreamResponse { status, body })
    }

    /// Streaming send: the returned channel is fed by a spawned forwarding
    /// task guarded by `stream_idle_timeout`, so a silent upstream can't
    /// hang the caller forever. Holds the account's concurrency permit for
    /// the lifetime of the forward, not just the initial request.
    pub async fn send_streaming(
        &self,
        account_id: AccountId,
        request: UpstreamRequest<'_>,
    ) -> Result<StreamingUpstreamResponse, TransportFailureKind> {
        let semaphore = self.permit_for(account_id).await;
        let permit = semaphore.acquire_owned().await.map_err(|_| TransportFailureKind::Other)?;

        let client = self.client_for(self.config.proxy.as_deref()).await?;
        let builder = self.build_request(&client, request);
        let response = builder.send().await.map_err(classify_wreq_error)?;
        let status = response.status().as_u16();

        let idle_timeout = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Result<Bytes, TransportFailureKind>>(32);

        tokio::spawn(async move {
            let _permit = permit;
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx.send(Err(TransportFailureKind::ReadTimeout)).await;
                        break;
                    }
                };
                let Some(chunk) = item else { break };
                match chunk {
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(classify_wreq_error(err))).await;
                        break;
                    }
                }
            }
        });

        Ok(StreamingUpstreamResponse { status, chunks: rx })
    }
}

/// Maps a `wreq::Error` to the taxonomy [`crate::retry_loop`] branches on.
/// Grounded on `gproxy-core::upstream_client::classify_wreq_error`.
fn classify_wreq_error(error: wreq::Error) -> TransportFailureKind {
    let message = error.to_string().to_ascii_lowercase();
    if error.is_timeout() {
        return if message.contains("read") || message.contains("idle") {
            TransportFailureKind::ReadTimeout
        } else {
            TransportFailureKind::Timeout
        };
    }
    if error.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportFailureKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportFailureKind::Tls;
        }
        return TransportFailureKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportFailureKind::Tls;
    }
    TransportFailureKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn account_limit_is_created_lazily_and_reused() {
        let client = WreqUpstreamClient::new(UpstreamClientConfig::default(), 2);
        let first = client.permit_for(1).await;
        let second = client.permit_for(1).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.available_permits(), 2);
    }

    #[tokio::test]
    async fn distinct_accounts_get_distinct_semaphores() {
        let client = WreqUpstreamClient::new(UpstreamClientConfig::default(), 1);
        let a = client.permit_for(1).await;
        let b = client.permit_for(2).await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
