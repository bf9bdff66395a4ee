//! Mock queue service shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use mockito::{Server, ServerGuard};
use queue_storage::logging::FnSink;
use queue_storage::pipeline::{PipelineOptions, RetryOptions};
use queue_storage::{Credential, LogLevel, LogOptions, Pipeline};
use url::Url;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fast backoff so retry scenarios finish in milliseconds.
pub fn quick_retry(max_tries: u32) -> RetryOptions {
    RetryOptions::new()
        .with_max_tries(max_tries)
        .with_try_timeout(Duration::from_secs(5))
        .with_retry_delay(Duration::from_millis(20))
        .with_max_retry_delay(Duration::from_millis(100))
}

pub type Captured = Arc<Mutex<Vec<(LogLevel, String)>>>;

pub fn capture_log() -> (LogOptions, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink_captured = captured.clone();
    let sink = FnSink::up_to(LogLevel::Debug, move |level, msg| {
        sink_captured.lock().unwrap().push((level, msg.to_string()));
    });
    (LogOptions::with_sink(Arc::new(sink)), captured)
}

/// A mock queue endpoint and helpers to build pipelines against it.
pub struct MockQueueServer {
    pub server: ServerGuard,
}

impl MockQueueServer {
    pub async fn new() -> Self {
        init_tracing();
        Self {
            server: Server::new_async().await,
        }
    }

    pub fn url(&self, path_and_query: &str) -> Url {
        Url::parse(&format!("{}{}", self.server.url(), path_and_query)).unwrap()
    }

    pub fn pipeline(&self, credential: Arc<dyn Credential>, retry: RetryOptions) -> Pipeline {
        let options = PipelineOptions {
            retry,
            ..Default::default()
        };
        Pipeline::new(Some(credential), options).unwrap()
    }
}
