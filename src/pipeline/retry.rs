//! Retry policy
//!
//! Runs the downstream chain up to `max_tries` times. Each try gets its own
//! deadline (never past the caller's), a rewound copy of the request and a
//! server-side `timeout` query parameter. Transient failures back off
//! exponentially with jitter, or by a fixed delay.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use super::request_id::{new_request_id, CLIENT_REQUEST_ID_HEADER};
use super::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::context::{earliest, Context};
use crate::logging::LogLevel;
use crate::request::{Request, Response};
use crate::transport::{NetworkErrorKind, TransportError};
use crate::{Error, Result};

const DEFAULT_MAX_TRIES: u32 = 4;
const DEFAULT_TRY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_EXPONENTIAL_DELAY: Duration = Duration::from_secs(4);
const DEFAULT_FIXED_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

// Jitter band applied to exponential delays: [0.8, 1.3)
const JITTER_MIN: f64 = 0.8;
const JITTER_SPAN: f64 = 0.5;

/// Backoff shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyKind {
    #[default]
    Exponential,
    Fixed,
}

impl FromStr for RetryPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(RetryPolicyKind::Exponential),
            "fixed" => Ok(RetryPolicyKind::Fixed),
            other => Err(Error::validation(format!(
                "unknown retry policy '{}', expected 'exponential' or 'fixed'",
                other
            ))),
        }
    }
}

/// Retry configuration. Zero fields mean "use the default":
///
/// | Field | Default |
/// |-------|---------|
/// | `max_tries` | 4 (1 disables retries) |
/// | `try_timeout` | 60s |
/// | `retry_delay` | 4s exponential, 30s fixed |
/// | `max_retry_delay` | 120s |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub policy: RetryPolicyKind,
    pub max_tries: u32,
    pub try_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `QUEUE_STORAGE_*` retry variables. Unparseable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(policy) = env::var("QUEUE_STORAGE_RETRY_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            options.policy = policy;
        }
        if let Some(n) = env_parse::<u32>("QUEUE_STORAGE_MAX_TRIES") {
            options.max_tries = n;
        }
        if let Some(secs) = env_parse::<u64>("QUEUE_STORAGE_TRY_TIMEOUT_SECS") {
            options.try_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("QUEUE_STORAGE_RETRY_DELAY_MS") {
            options.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUEUE_STORAGE_MAX_RETRY_DELAY_MS") {
            options.max_retry_delay = Duration::from_millis(ms);
        }
        options
    }

    pub fn with_policy(mut self, policy: RetryPolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
        self.try_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Copy with every zero field replaced by its default and `retry_delay`
    /// clamped to `max_retry_delay`.
    pub fn with_defaults(&self) -> Self {
        let mut o = self.clone();
        if o.max_tries == 0 {
            o.max_tries = DEFAULT_MAX_TRIES;
        }
        if o.try_timeout.is_zero() {
            o.try_timeout = DEFAULT_TRY_TIMEOUT;
        }
        if o.retry_delay.is_zero() {
            o.retry_delay = match o.policy {
                RetryPolicyKind::Exponential => DEFAULT_EXPONENTIAL_DELAY,
                RetryPolicyKind::Fixed => DEFAULT_FIXED_DELAY,
            };
        }
        if o.max_retry_delay.is_zero() {
            o.max_retry_delay = DEFAULT_MAX_RETRY_DELAY;
        }
        if o.retry_delay > o.max_retry_delay {
            o.retry_delay = o.max_retry_delay;
        }
        o
    }

    /// Delay before retry number `retry` (1-based: the wait after the first
    /// failed try is retry 1). Expects defaulted options.
    pub fn calc_delay(&self, retry: u32) -> Duration {
        self.calc_delay_with_jitter(retry, JITTER_MIN + fastrand::f64() * JITTER_SPAN)
    }

    pub(crate) fn calc_delay_with_jitter(&self, retry: u32, jitter: f64) -> Duration {
        match self.policy {
            RetryPolicyKind::Fixed => self.retry_delay.min(self.max_retry_delay),
            RetryPolicyKind::Exponential => {
                let exponent = retry.saturating_sub(1).min(62) as i32;
                let secs = self.retry_delay.as_secs_f64() * 2f64.powi(exponent) * jitter;
                if !secs.is_finite() || secs >= self.max_retry_delay.as_secs_f64() {
                    self.max_retry_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Statuses that signal a transient condition.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Whether another attempt could succeed where this error failed.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Transport(t) => t.is_retryable(),
        Error::Service(e) => is_retryable_status(e.status()),
        _ => false,
    }
}

/// Why a try should be repeated, if it should.
fn retry_cause(result: &Result<Response>) -> Option<String> {
    match result {
        Ok(resp) if is_retryable_status(resp.status) => {
            Some(format!("status {}", resp.status.as_u16()))
        }
        Ok(_) => None,
        Err(err) if is_retryable(err) => Some(err.to_string()),
        Err(_) => None,
    }
}

/// Ask the service to give up one second after the client would.
fn set_server_timeout(url: &mut Url, budget: Duration) {
    let param = format!("timeout={}", budget.as_secs() + 1);
    let query = url
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty() && *p != "timeout" && !p.starts_with("timeout="))
        .chain(std::iter::once(param.as_str()))
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
}

#[derive(Debug, Clone)]
pub struct RetryPolicyFactory {
    options: RetryOptions,
}

impl RetryPolicyFactory {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options: options.with_defaults(),
        }
    }

    /// The defaulted options this factory applies.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

impl PolicyFactory for RetryPolicyFactory {
    fn create(&self, next: PolicyRef, options: &PolicyOptions) -> PolicyRef {
        Arc::new(RetryPolicy {
            next,
            options: self.options.clone(),
            log: options.clone(),
        })
    }

    fn name(&self) -> &str {
        "retry"
    }
}

struct RetryPolicy {
    next: PolicyRef,
    options: RetryOptions,
    log: PolicyOptions,
}

impl RetryPolicy {
    async fn attempt(&self, ctx: &Context, attempt: u32, request: &Request) -> Result<Response> {
        let mut request = request.rewind(attempt)?;
        if attempt > 1 && request.generated_request_id {
            request.set_header(CLIENT_REQUEST_ID_HEADER, &new_request_id())?;
        }

        let now = Instant::now();
        let try_deadline = earliest(ctx.deadline(), now + self.options.try_timeout);
        set_server_timeout(&mut request.url, try_deadline.saturating_duration_since(now));
        let try_ctx = ctx.for_attempt(attempt, try_deadline);

        let result = tokio::select! {
            biased;
            reason = ctx.done() => return Err(Error::Cancelled { reason }),
            r = tokio::time::timeout_at(try_deadline, self.next.send(&try_ctx, request)) => {
                r.unwrap_or_else(|_| Err(self.try_timed_out(attempt)))
            }
        };

        if result.is_err() {
            if let Some(reason) = ctx.err() {
                return Err(Error::Cancelled { reason });
            }
        }
        match result {
            // The try's own deadline fired below us while the caller is still waiting.
            Err(Error::Cancelled { .. }) => Err(self.try_timed_out(attempt)),
            other => other,
        }
    }

    fn try_timed_out(&self, attempt: u32) -> Error {
        TransportError::new(
            NetworkErrorKind::Timeout,
            format!(
                "try {} exceeded its {:?} timeout",
                attempt, self.options.try_timeout
            ),
        )
        .into()
    }
}

#[async_trait::async_trait]
impl Policy for RetryPolicy {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        let max_tries = self.options.max_tries.max(1);
        let mut attempt = 1;
        loop {
            if let Some(reason) = ctx.err() {
                return Err(Error::Cancelled { reason });
            }

            let result = self.attempt(ctx, attempt, &request).await;
            let cause = match retry_cause(&result) {
                Some(cause) => cause,
                None => return result,
            };
            if attempt >= max_tries {
                if self.log.should_log(LogLevel::Info) {
                    self.log.log(
                        LogLevel::Info,
                        &format!(
                            "retry: giving up after {} tries; last failure: {}",
                            attempt, cause
                        ),
                    );
                }
                return result;
            }

            let delay = self.options.calc_delay(attempt);
            if self.log.should_log(LogLevel::Info) {
                self.log.log(
                    LogLevel::Info,
                    &format!(
                        "retry: try {} of {} failed ({}); retrying in {:?}",
                        attempt, max_tries, cause, delay
                    ),
                );
            }

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(Error::Cancelled { reason }),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
