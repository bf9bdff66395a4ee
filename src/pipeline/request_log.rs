//! Request log policy: one entry before and one after every try.
//!
//! Severity of the closing entry:
//!
//! | Outcome | Level |
//! |---------|-------|
//! | transport error | `Error` |
//! | 5xx, or 4xx other than 404/409/412/416 | `Error` |
//! | success slower than the threshold | `Warning` |
//! | anything else | `Info` |

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use super::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::context::Context;
use crate::logging::LogLevel;
use crate::request::{Request, Response};
use crate::Result;

const REDACTED: &str = "REDACTED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLogOptions {
    /// Tries slower than this log at `Warning`. `None` turns the check off.
    pub log_warning_if_try_over_threshold: Option<Duration>,
}

impl Default for RequestLogOptions {
    fn default() -> Self {
        Self {
            log_warning_if_try_over_threshold: Some(Duration::from_secs(3)),
        }
    }
}

impl RequestLogOptions {
    pub fn with_threshold(threshold: Option<Duration>) -> Self {
        Self {
            log_warning_if_try_over_threshold: threshold,
        }
    }
}

/// `url` with the SAS `sig` parameter masked.
pub fn redacted_url(url: &Url) -> Url {
    let Some(query) = url.query() else {
        return url.clone();
    };
    let mut changed = false;
    let masked = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if name.eq_ignore_ascii_case("sig") => {
                changed = true;
                format!("{}={}", name, REDACTED)
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    let mut out = url.clone();
    if changed {
        out.set_query(Some(&masked));
    }
    out
}

/// Routine client errors returned by existence probes and conditional calls.
fn is_expected_client_error(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND
            | StatusCode::CONFLICT
            | StatusCode::PRECONDITION_FAILED
            | StatusCode::RANGE_NOT_SATISFIABLE
    )
}

fn is_failure_status(status: StatusCode) -> bool {
    status.is_server_error() || (status.is_client_error() && !is_expected_client_error(status))
}

#[derive(Debug, Clone)]
pub struct RequestLogPolicyFactory {
    options: RequestLogOptions,
}

impl RequestLogPolicyFactory {
    pub fn new(options: RequestLogOptions) -> Self {
        Self { options }
    }
}

impl PolicyFactory for RequestLogPolicyFactory {
    fn create(&self, next: PolicyRef, options: &PolicyOptions) -> PolicyRef {
        Arc::new(RequestLogPolicy {
            next,
            threshold: self
                .options
                .log_warning_if_try_over_threshold
                .filter(|t| !t.is_zero()),
            log: options.clone(),
        })
    }

    fn name(&self) -> &str {
        "request_log"
    }
}

struct RequestLogPolicy {
    next: PolicyRef,
    threshold: Option<Duration>,
    log: PolicyOptions,
}

impl RequestLogPolicy {
    fn outcome_level(&self, result: &Result<Response>, elapsed: Duration) -> LogLevel {
        match result {
            Err(_) => LogLevel::Error,
            Ok(resp) if is_failure_status(resp.status) => LogLevel::Error,
            Ok(_) if self.threshold.is_some_and(|t| elapsed > t) => LogLevel::Warning,
            Ok(_) => LogLevel::Info,
        }
    }
}

#[async_trait::async_trait]
impl Policy for RequestLogPolicy {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        let try_number = ctx.attempt().max(1);
        let method = request.method.clone();
        let url = redacted_url(&request.url);
        let client_request_id = request.client_request_id().unwrap_or("-").to_string();

        if self.log.should_log(LogLevel::Info) {
            self.log.log(
                LogLevel::Info,
                &format!(
                    "==> OUTGOING REQUEST (try={}) {} {} client-request-id={}",
                    try_number, method, url, client_request_id
                ),
            );
        }

        let start = Instant::now();
        let result = self.next.send(ctx, request).await;
        let elapsed = start.elapsed();

        let level = self.outcome_level(&result, elapsed);
        if !self.log.should_log(level) {
            return result;
        }

        let slow = match self.threshold {
            Some(t) if elapsed > t => format!(" [SLOW >{:?}]", t),
            _ => String::new(),
        };
        let message = match &result {
            Ok(resp) => format!(
                "<== {} {} {} (try={}, duration={:?}{}) request-id={} client-request-id={}",
                resp.status.as_u16(),
                method,
                url,
                try_number,
                elapsed,
                slow,
                resp.request_id().unwrap_or("-"),
                client_request_id
            ),
            Err(err) => format!(
                "<== REQUEST ERROR {} {} (try={}, duration={:?}{}) client-request-id={}: {}",
                method, url, try_number, elapsed, slow, client_request_id, err
            ),
        };
        self.log.log(level, &message);
        result
    }
}
