use std::env;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use reqwest::Proxy;
use serde::{Deserialize, Serialize};

use super::{NetworkErrorKind, TransportError};
use crate::context::Context;
use crate::error::ErrorContext;
use crate::pipeline::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::request::{Request, Response};
use crate::{Error, Result};

/// Connection pool and dialing settings for [`HttpSender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Budget for establishing a connection, TCP and TLS together.
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    /// Expected share of `connect_timeout` spent in the TLS handshake. The
    /// connector exposes a single connect budget, so this only raises it.
    pub tls_handshake_timeout: Duration,
    pub proxy_url: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 100,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            proxy_url: None,
        }
    }
}

impl TransportOptions {
    /// Defaults overridden by `QUEUE_STORAGE_HTTP_*` and `QUEUE_STORAGE_PROXY_URL`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pool_max_idle_per_host: env_parse("QUEUE_STORAGE_HTTP_POOL_MAX_IDLE_PER_HOST")
                .unwrap_or(defaults.pool_max_idle_per_host),
            pool_idle_timeout: env_parse("QUEUE_STORAGE_HTTP_POOL_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool_idle_timeout),
            connect_timeout: env_parse("QUEUE_STORAGE_HTTP_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            proxy_url: env::var("QUEUE_STORAGE_PROXY_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            ..defaults
        }
    }

    pub fn with_pool_max_idle_per_host(mut self, n: usize) -> Self {
        self.pool_max_idle_per_host = n;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    fn effective_connect_timeout(&self) -> Duration {
        self.connect_timeout.max(self.tls_handshake_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Final pipeline stage: sends the request over a pooled `reqwest::Client`.
///
/// Clones share one connection pool. [`HttpSender::shutdown`] releases it for
/// every clone at once; later sends fail with [`NetworkErrorKind::Shutdown`].
#[derive(Clone)]
pub struct HttpSender {
    client: Arc<ArcSwapOption<reqwest::Client>>,
}

impl HttpSender {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .pool_idle_timeout(Some(options.pool_idle_timeout))
            .connect_timeout(options.effective_connect_timeout())
            .tcp_keepalive(Some(options.tcp_keepalive));

        if let Some(proxy_url) = &options.proxy_url {
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid proxy URL: {}", e),
                    ErrorContext::new()
                        .with_field_path("transport.proxy_url")
                        .with_details(proxy_url.clone())
                        .with_source("http_sender"),
                )
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build HTTP client: {}", e),
                ErrorContext::new().with_source("http_sender"),
            )
        })?;

        tracing::debug!(
            pool_max_idle_per_host = options.pool_max_idle_per_host,
            connect_timeout_ms = options.effective_connect_timeout().as_millis() as u64,
            proxy = options.proxy_url.is_some(),
            "HTTP sender ready"
        );

        Ok(Self {
            client: Arc::new(ArcSwapOption::from_pointee(client)),
        })
    }

    /// Drop the pooled client. Idempotent.
    pub fn shutdown(&self) {
        if self.client.swap(None).is_some() {
            tracing::debug!("HTTP sender shut down; idle connections released");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.client.load().is_none()
    }

    async fn execute(client: &reqwest::Client, ctx: &Context, request: Request) -> Result<Response> {
        let summary = request.summary();
        let attempt = ctx.attempt().max(1);

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body.into_reqwest(attempt)? {
            builder = builder.body(body);
        }
        if let Some(remaining) = ctx.remaining() {
            builder = builder.timeout(remaining);
        }

        let response = builder.send().await.map_err(TransportError::from)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::from)?;

        Ok(Response {
            status,
            headers,
            body,
            request: summary,
        })
    }
}

impl std::fmt::Debug for HttpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSender")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[async_trait::async_trait]
impl Policy for HttpSender {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        let client = self.client.load_full().ok_or_else(|| {
            TransportError::new(NetworkErrorKind::Shutdown, "HTTP sender has been shut down")
        })?;
        if let Some(reason) = ctx.err() {
            return Err(Error::Cancelled { reason });
        }

        tokio::select! {
            biased;
            reason = ctx.done() => Err(Error::Cancelled { reason }),
            result = Self::execute(&client, ctx, request) => result,
        }
    }
}

impl PolicyFactory for HttpSender {
    fn create(&self, _next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(self.clone())
    }

    fn name(&self) -> &str {
        "http_sender"
    }
}
