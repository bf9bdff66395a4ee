//! # queue-storage
//!
//! 队列存储客户端运行时：每个 API 调用都经过的请求流水线。
//!
//! Client runtime for a remote message-queue storage service reached over
//! HTTP(S). Every queue or message operation is issued through a [`Pipeline`]:
//! an ordered chain of policies that stamps telemetry and correlation headers,
//! retries transient failures with backoff, signs the request, logs the
//! outcome and finally hands it to a pooled HTTP transport.
//!
//! ## Request Flow
//!
//! ```text
//! caller → Telemetry → UniqueRequestId → Retry → Credential → [method] → RequestLog → HttpSender
//!                                                                                       │
//! caller ← ─────────────────────────── response / error ──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use queue_storage::pipeline::{PipelineOptions, RetryOptions, RetryPolicyKind};
//! use queue_storage::{Context, Pipeline, Request, SharedKeyCredential};
//!
//! #[tokio::main]
//! async fn main() -> queue_storage::Result<()> {
//!     let credential = SharedKeyCredential::new("myaccount", "c2VjcmV0LWtleQ==")?;
//!     let options = PipelineOptions {
//!         retry: RetryOptions::new()
//!             .with_policy(RetryPolicyKind::Exponential)
//!             .with_max_tries(3)
//!             .with_try_timeout(Duration::from_secs(3)),
//!         ..Default::default()
//!     };
//!     let pipeline = Pipeline::new(Some(Arc::new(credential)), options)?;
//!
//!     let url = url::Url::parse("https://myaccount.queue.core.windows.net/orders?restype=queue")
//!         .map_err(|e| queue_storage::Error::validation(e.to_string()))?;
//!     let ctx = Context::with_timeout(Duration::from_secs(30));
//!     let response = pipeline.send(&ctx, Request::new(reqwest::Method::PUT, url)).await?;
//!     let response = response.error_for_status()?;
//!     println!("created: {}", response.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pipeline`] | Policy chain, pipeline construction and the built-in policies |
//! | [`transport`] | Pooled HTTP sender and network error classification |
//! | [`credential`] | Request signing capabilities |
//! | [`context`] | Cancellation and deadline propagation |
//! | [`request`] | Request, body and response types |
//! | [`logging`] | Log levels and sinks consulted by the policies |

pub mod context;
pub mod credential;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod transport;

pub use context::{CancelReason, Context};
pub use credential::{AnonymousCredential, Credential, SharedKeyCredential};
pub use logging::{LogLevel, LogOptions, LogSink};
pub use pipeline::{Pipeline, PipelineOptions, Policy, PolicyFactory};
pub use request::{Body, Request, Response};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, StorageError};
