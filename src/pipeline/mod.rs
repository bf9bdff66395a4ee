//! 请求流水线模块：由有序策略组成的请求处理链。
//!
//! # Request Pipeline
//!
//! Every service call passes through a [`Pipeline`]: an ordered list of
//! [`PolicyFactory`] values composed once, at construction, into a single chain
//! of [`Policy`] objects. Each policy may edit the request, call the next
//! policy, and inspect or replace what comes back.
//!
//! ## Default Chain
//!
//! ```text
//! Telemetry → UniqueRequestId → Retry → Credential → [method] → RequestLog → HttpSender
//!   User-Agent   x-ms-client-     backoff   SharedKey     per-call   timing and   pooled
//!                request-id       per try   signing       slot       severity     reqwest
//! ```
//!
//! Policies above Retry run once per operation. Policies below it run once per
//! attempt, so each attempt is re-signed and logged on its own.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Policy`] | One stage of the chain |
//! | [`PolicyFactory`] | Builds a stage bound to the next one |
//! | [`PipelineBuilder`] | Orders factories and marks the method slot |
//! | [`Pipeline`] | The composed chain, shared by every call |
//!
//! ## Submodules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`telemetry`] | `User-Agent` stamping |
//! | [`request_id`] | Client correlation id |
//! | [`retry`] | Per-try timeouts, classification and backoff |
//! | [`request_log`] | Per-try outcome logging |

pub mod request_id;
pub mod request_log;
pub mod retry;
pub mod telemetry;

#[cfg(test)]
mod tests;

pub use request_id::{UniqueRequestIdPolicyFactory, CLIENT_REQUEST_ID_HEADER};
pub use request_log::{RequestLogOptions, RequestLogPolicyFactory};
pub use retry::{RetryOptions, RetryPolicyFactory, RetryPolicyKind};
pub use telemetry::{TelemetryOptions, TelemetryPolicyFactory};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::credential::{Credential, CredentialPolicyFactory};
use crate::error::ErrorContext;
use crate::logging::{LogLevel, LogOptions, LogSink};
use crate::request::{Request, Response};
use crate::transport::{HttpSender, TransportOptions};
use crate::{Error, Result};

/// One stage of the request pipeline.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response>;
}

/// Shared handle to a composed stage.
pub type PolicyRef = Arc<dyn Policy>;

/// Builds a [`Policy`] that forwards to `next`.
pub trait PolicyFactory: Send + Sync {
    fn create(&self, next: PolicyRef, options: &PolicyOptions) -> PolicyRef;

    /// Name used in diagnostics
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Services handed to every factory: currently the log sink.
#[derive(Clone)]
pub struct PolicyOptions {
    log: Arc<dyn LogSink>,
}

impl PolicyOptions {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    /// Ask before formatting a log line.
    pub fn should_log(&self, level: LogLevel) -> bool {
        level != LogLevel::None && self.log.should_log(level)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level != LogLevel::None {
            self.log.log(level, message);
        }
    }
}

impl fmt::Debug for PolicyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyOptions").finish_non_exhaustive()
    }
}

/// Everything a [`Pipeline`] is configured with.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    #[serde(skip)]
    pub log: LogOptions,
    pub retry: RetryOptions,
    pub request_log: RequestLogOptions,
    pub telemetry: TelemetryOptions,
    pub transport: TransportOptions,
    /// Replaces the pooled HTTP sender as the last stage.
    #[serde(skip)]
    pub http_sender: Option<Arc<dyn PolicyFactory>>,
}

impl PipelineOptions {
    pub fn with_http_sender(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.http_sender = Some(factory);
        self
    }

    pub fn with_log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("log", &self.log)
            .field("retry", &self.retry)
            .field("request_log", &self.request_log)
            .field("telemetry", &self.telemetry)
            .field("transport", &self.transport)
            .field(
                "http_sender",
                &self.http_sender.as_ref().map(|f| f.name().to_string()),
            )
            .finish()
    }
}

const METHOD_MARKER_NAME: &str = "method_marker";

/// Placeholder where [`Pipeline::send_with_method`] injects a per-call
/// factory. In the default chain it passes requests straight through.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodMarker;

impl PolicyFactory for MethodMarker {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        next
    }

    fn name(&self) -> &str {
        METHOD_MARKER_NAME
    }
}

/// Terminates the chain below the sender. Reached only when a custom sender
/// forwards instead of answering.
struct EndOfPipeline;

#[async_trait::async_trait]
impl Policy for EndOfPipeline {
    async fn send(&self, _ctx: &Context, _request: Request) -> Result<Response> {
        Err(Error::configuration_with_context(
            "request reached the end of the pipeline without being sent",
            ErrorContext::new()
                .with_field_path("http_sender")
                .with_source("pipeline"),
        ))
    }
}

type FactoryList = Arc<[Arc<dyn PolicyFactory>]>;

fn compose(factories: &[Arc<dyn PolicyFactory>], tail: PolicyRef, options: &PolicyOptions) -> PolicyRef {
    factories
        .iter()
        .rev()
        .fold(tail, |next, factory| factory.create(next, options))
}

/// Orders factories and records where the method slot sits.
#[derive(Default)]
pub struct PipelineBuilder {
    factories: Vec<Arc<dyn PolicyFactory>>,
    marker: Option<usize>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Earlier stages see the request first.
    pub fn policy(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Mark the method slot at the current position.
    pub fn method_marker(mut self) -> Self {
        self.marker = Some(self.factories.len());
        self
    }

    /// Compose the chain. Without a marker the method slot sits directly
    /// above the sender.
    pub fn build(mut self, options: PipelineOptions) -> Result<Pipeline> {
        let options = Arc::new(options);
        let policy_options = PolicyOptions::new(options.log.resolve());

        let (sender_factory, sender): (Arc<dyn PolicyFactory>, Option<HttpSender>) =
            match &options.http_sender {
                Some(custom) => (custom.clone(), None),
                None => {
                    let sender = HttpSender::new(&options.transport)?;
                    (Arc::new(sender.clone()), Some(sender))
                }
            };

        let marker = self.marker.unwrap_or(self.factories.len());
        let lower_factories: FactoryList = self.factories.split_off(marker).into();
        let upper: FactoryList = self.factories.into();

        let tail = sender_factory.create(Arc::new(EndOfPipeline), &policy_options);
        let lower = compose(&lower_factories, tail, &policy_options);
        let head = compose(&upper, lower.clone(), &policy_options);

        tracing::debug!(
            upper = upper.len(),
            lower = lower_factories.len(),
            sender = sender_factory.name(),
            "pipeline composed"
        );

        Ok(Pipeline {
            upper,
            lower_factories,
            sender_factory,
            lower,
            head,
            policy_options,
            sender,
            options,
        })
    }
}

/// The composed policy chain. Cheap to clone; clones share the chain and
/// the connection pool.
#[derive(Clone)]
pub struct Pipeline {
    upper: FactoryList,
    lower_factories: FactoryList,
    sender_factory: Arc<dyn PolicyFactory>,
    lower: PolicyRef,
    head: PolicyRef,
    policy_options: PolicyOptions,
    sender: Option<HttpSender>,
    options: Arc<PipelineOptions>,
}

impl Pipeline {
    /// Build the default chain.
    ///
    /// `credential` is required; pass [`AnonymousCredential`] for public
    /// resources or SAS URLs. The anonymous credential adds no stage.
    ///
    /// [`AnonymousCredential`]: crate::credential::AnonymousCredential
    pub fn new(credential: Option<Arc<dyn Credential>>, options: PipelineOptions) -> Result<Self> {
        let credential = credential.ok_or_else(|| {
            Error::configuration_with_context(
                "a credential is required; use AnonymousCredential for public or SAS access",
                ErrorContext::new()
                    .with_field_path("credential")
                    .with_source("pipeline"),
            )
        })?;

        let mut builder = PipelineBuilder::new()
            .policy(Arc::new(TelemetryPolicyFactory::new(&options.telemetry)?))
            .policy(Arc::new(UniqueRequestIdPolicyFactory))
            .policy(Arc::new(RetryPolicyFactory::new(options.retry.clone())));
        if !credential.is_anonymous() {
            builder = builder.policy(Arc::new(CredentialPolicyFactory::new(credential)));
        }
        builder
            .method_marker()
            .policy(Arc::new(RequestLogPolicyFactory::new(
                options.request_log.clone(),
            )))
            .build(options)
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Send `request` through the full chain.
    pub async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        self.head.send(ctx, request).await
    }

    /// Send with `method` occupying the method slot for this call only.
    pub async fn send_with_method(
        &self,
        ctx: &Context,
        method: &dyn PolicyFactory,
        request: Request,
    ) -> Result<Response> {
        let slot = method.create(self.lower.clone(), &self.policy_options);
        let head = compose(&self.upper, slot, &self.policy_options);
        head.send(ctx, request).await
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Stage names from the caller's side to the wire.
    pub fn policy_names(&self) -> Vec<&str> {
        self.upper
            .iter()
            .map(|f| f.name())
            .chain(std::iter::once(METHOD_MARKER_NAME))
            .chain(self.lower_factories.iter().map(|f| f.name()))
            .chain(std::iter::once(self.sender_factory.name()))
            .collect()
    }

    /// Release the pooled HTTP client. Sends afterwards fail with a
    /// non-retryable shutdown error. No effect with a custom sender.
    pub fn shutdown(&self) {
        if let Some(sender) = &self.sender {
            sender.shutdown();
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.policy_names())
            .finish()
    }
}
