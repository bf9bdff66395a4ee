//! Telemetry policy: stamps `User-Agent` on every request.

use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::header::{HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use super::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::context::Context;
use crate::error::ErrorContext;
use crate::request::{Request, Response};
use crate::{Error, Result};

static PLATFORM_INFO: Lazy<String> = Lazy::new(|| {
    format!(
        "queue-storage/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Application-supplied prefix for the `User-Agent` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryOptions {
    /// e.g. `"order-service/2.1"`; empty for none.
    pub value: String,
}

impl TelemetryOptions {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryPolicyFactory {
    user_agent: HeaderValue,
}

impl TelemetryPolicyFactory {
    /// Fails when `options.value` cannot be carried in a header.
    pub fn new(options: &TelemetryOptions) -> Result<Self> {
        let value = options.value.trim();
        let user_agent = if value.is_empty() {
            PLATFORM_INFO.clone()
        } else {
            format!("{} {}", value, *PLATFORM_INFO)
        };
        let user_agent = HeaderValue::from_str(&user_agent).map_err(|e| {
            Error::configuration_with_context(
                format!("telemetry value is not a valid header value: {}", e),
                ErrorContext::new()
                    .with_field_path("telemetry.value")
                    .with_details(options.value.clone())
                    .with_source("telemetry_policy"),
            )
        })?;
        Ok(Self { user_agent })
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.to_str().unwrap_or_default()
    }
}

impl PolicyFactory for TelemetryPolicyFactory {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(TelemetryPolicy {
            next,
            user_agent: self.user_agent.clone(),
        })
    }

    fn name(&self) -> &str {
        "telemetry"
    }
}

struct TelemetryPolicy {
    next: PolicyRef,
    user_agent: HeaderValue,
}

#[async_trait::async_trait]
impl Policy for TelemetryPolicy {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        request.headers.insert(USER_AGENT, self.user_agent.clone());
        self.next.send(ctx, request).await
    }
}
