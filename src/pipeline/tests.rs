use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use url::Url;

use super::*;
use crate::context::CancelReason;
use crate::credential::{AnonymousCredential, SharedKeyCredential};
use crate::logging::FnSink;
use crate::request::{Body, ByteStream};
use crate::transport::{NetworkErrorKind, TransportError};

#[derive(Debug, Clone)]
enum Step {
    Status(u16),
    Fail(NetworkErrorKind),
    /// Never answers.
    Hang,
    /// Answers after a delay.
    Slow(Duration, u16),
    /// Forwards to the next stage instead of answering.
    Forward,
}

#[derive(Debug, Clone)]
struct Seen {
    at: Instant,
    attempt: u32,
    url: Url,
    headers: HeaderMap,
}

/// Final stage that plays back `steps`, repeating the last one.
#[derive(Clone)]
struct ScriptedSender {
    steps: Arc<Vec<Step>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl ScriptedSender {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(steps),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

struct ScriptedPolicy {
    script: ScriptedSender,
    next: PolicyRef,
}

#[async_trait::async_trait]
impl Policy for ScriptedPolicy {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        let step = {
            let mut seen = self.script.seen.lock().unwrap();
            seen.push(Seen {
                at: Instant::now(),
                attempt: ctx.attempt(),
                url: request.url.clone(),
                headers: request.headers.clone(),
            });
            let idx = (seen.len() - 1).min(self.script.steps.len() - 1);
            self.script.steps[idx].clone()
        };
        // consume the body the way the wire would
        request.body.clone().into_reqwest(ctx.attempt().max(1))?;

        match step {
            Step::Status(code) => Ok(Response::new(StatusCode::from_u16(code).unwrap(), &request)),
            Step::Fail(kind) => Err(TransportError::new(kind, "scripted failure").into()),
            Step::Hang => std::future::pending().await,
            Step::Slow(delay, code) => {
                tokio::time::sleep(delay).await;
                Ok(Response::new(StatusCode::from_u16(code).unwrap(), &request))
            }
            Step::Forward => self.next.send(ctx, request).await,
        }
    }
}

impl PolicyFactory for ScriptedSender {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(ScriptedPolicy {
            script: self.clone(),
            next,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

type Entries = Arc<Mutex<Vec<(LogLevel, String)>>>;

fn capture_up_to(max: LogLevel) -> (LogOptions, Entries) {
    let entries: Entries = Arc::new(Mutex::new(Vec::new()));
    let sink_entries = entries.clone();
    let sink = FnSink::up_to(max, move |level, msg| {
        sink_entries.lock().unwrap().push((level, msg.to_string()));
    });
    (LogOptions::with_sink(Arc::new(sink)), entries)
}

fn example_retry() -> RetryOptions {
    RetryOptions::new()
        .with_policy(RetryPolicyKind::Exponential)
        .with_max_tries(3)
        .with_try_timeout(Duration::from_secs(3))
        .with_retry_delay(Duration::from_secs(1))
        .with_max_retry_delay(Duration::from_secs(3))
}

fn pipeline_with(script: &ScriptedSender, retry: RetryOptions) -> Pipeline {
    let options = PipelineOptions {
        retry,
        log: LogOptions::disabled(),
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap()
}

fn request() -> Request {
    Request::new(
        Method::PUT,
        Url::parse("https://myaccount.queue.example.net/orders/messages").unwrap(),
    )
    .with_body("<QueueMessage><MessageText>hi</MessageText></QueueMessage>")
}

#[test]
fn test_missing_credential_rejected() {
    let err = Pipeline::new(None, PipelineOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(
        err.context().and_then(|c| c.field_path.as_deref()),
        Some("credential")
    );
}

#[test]
fn test_default_policy_order() {
    let script = ScriptedSender::new(vec![Step::Status(200)]);
    let credential = SharedKeyCredential::new("myaccount", "c2VjcmV0LWtleQ==").unwrap();
    let options = PipelineOptions::default().with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(credential)), options).unwrap();
    assert_eq!(
        pipeline.policy_names(),
        vec![
            "telemetry",
            "unique_request_id",
            "retry",
            "credential",
            "method_marker",
            "request_log",
            "scripted"
        ]
    );

    let anonymous = pipeline_with(&script, RetryOptions::default());
    assert!(!anonymous.policy_names().contains(&"credential"));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_two_server_errors() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(500), Step::Status(201)]);
    let pipeline = pipeline_with(&script, example_retry());

    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert_eq!(resp.status, StatusCode::CREATED);

    let seen = script.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(
        seen.iter().map(|s| s.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let first_wait = seen[1].at - seen[0].at;
    let second_wait = seen[2].at - seen[1].at;
    assert!(first_wait >= Duration::from_millis(800) && first_wait < Duration::from_millis(1300));
    assert!(second_wait >= Duration::from_millis(1600) && second_wait <= Duration::from_secs(3));
    assert!(second_wait >= first_wait);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_response() {
    let script = ScriptedSender::new(vec![Step::Status(503)]);
    let pipeline = pipeline_with(&script, RetryOptions::new().with_max_tries(4));

    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(script.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_error() {
    let script = ScriptedSender::new(vec![Step::Fail(NetworkErrorKind::ConnectionRefused)]);
    let pipeline = pipeline_with(&script, example_retry());

    let err = pipeline.send(&Context::background(), request()).await.unwrap_err();
    match err {
        Error::Transport(t) => assert_eq!(t.kind(), NetworkErrorKind::ConnectionRefused),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(script.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_is_not_retried() {
    let script = ScriptedSender::new(vec![Step::Status(403), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());

    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_try_disables_retries() {
    let script = ScriptedSender::new(vec![Step::Status(500)]);
    let pipeline = pipeline_with(&script, RetryOptions::new().with_max_tries(1));

    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_classified() {
    let script = ScriptedSender::new(vec![Step::Fail(NetworkErrorKind::ConnectionReset), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert!(resp.is_success());
    assert_eq!(script.calls(), 2);

    let script = ScriptedSender::new(vec![Step::Fail(NetworkErrorKind::Tls), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    let err = pipeline.send(&Context::background(), request()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(ref t) if t.kind() == NetworkErrorKind::Tls));
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_id_fresh_per_attempt() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(500), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    pipeline.send(&Context::background(), request()).await.unwrap();

    let ids: Vec<String> = script
        .seen()
        .iter()
        .map(|s| s.headers[CLIENT_REQUEST_ID_HEADER].to_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    for id in &ids {
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_caller_request_id_kept_across_attempts() {
    let script = ScriptedSender::new(vec![Step::Status(503), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    let req = request()
        .with_header(CLIENT_REQUEST_ID_HEADER, "order-42")
        .unwrap();
    pipeline.send(&Context::background(), req).await.unwrap();

    for seen in script.seen() {
        assert_eq!(seen.headers[CLIENT_REQUEST_ID_HEADER], "order-42");
    }
}

#[tokio::test(start_paused = true)]
async fn test_per_try_timeout_is_retried() {
    let script = ScriptedSender::new(vec![Step::Hang, Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());

    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert!(resp.is_success());

    let seen = script.seen();
    assert_eq!(seen.len(), 2);
    // 3s try timeout plus a backoff in [0.8s, 1.3s)
    let gap = seen[1].at - seen[0].at;
    assert!(gap >= Duration::from_millis(3800) && gap < Duration::from_millis(4300));
}

#[tokio::test(start_paused = true)]
async fn test_server_timeout_query_param() {
    let script = ScriptedSender::new(vec![Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    pipeline.send(&Context::background(), request()).await.unwrap();

    assert_eq!(script.seen()[0].url.query(), Some("timeout=4"));
}

#[tokio::test(start_paused = true)]
async fn test_outer_deadline_is_not_retried() {
    let script = ScriptedSender::new(vec![Step::Hang]);
    let pipeline = pipeline_with(&script, RetryOptions::new().with_try_timeout(Duration::from_secs(60)));

    let ctx = Context::with_timeout(Duration::from_secs(2));
    let err = pipeline.send(&ctx, request()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cancelled {
            reason: CancelReason::DeadlineExceeded
        }
    ));
    assert_eq!(script.calls(), 1);
    // the server-side timeout follows the shorter caller deadline
    assert_eq!(script.seen()[0].url.query(), Some("timeout=3"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_promptly() {
    let script = ScriptedSender::new(vec![Step::Status(500)]);
    let pipeline = pipeline_with(
        &script,
        RetryOptions::new()
            .with_retry_delay(Duration::from_secs(10))
            .with_max_retry_delay(Duration::from_secs(60)),
    );

    let ctx = Context::background();
    let task = {
        let pipeline = pipeline.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { pipeline.send(&ctx, request()).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled_at = Instant::now();
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Cancelled {
            reason: CancelReason::Cancelled
        }
    ));
    assert!(Instant::now() - cancelled_at < Duration::from_millis(10));
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_before_send() {
    let script = ScriptedSender::new(vec![Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());
    let ctx = Context::background();
    ctx.cancel();

    let err = pipeline.send(&ctx, request()).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(script.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_body_cannot_be_retried() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());

    let stream: ByteStream = Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(b"chunk"))]));
    let req = request().with_body(Body::from_stream(stream));
    let err = pipeline.send(&Context::background(), req).await.unwrap_err();
    assert!(matches!(err, Error::BodyNotReplayable { attempt: 2 }));
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_each_attempt_signed() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(200)]);
    let credential = SharedKeyCredential::new("myaccount", "c2VjcmV0LWtleQ==").unwrap();
    let options = PipelineOptions {
        retry: example_retry(),
        log: LogOptions::disabled(),
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(credential)), options).unwrap();

    pipeline.send(&Context::background(), request()).await.unwrap();
    let seen = script.seen();
    assert_eq!(seen.len(), 2);
    for s in &seen {
        let auth = s.headers["authorization"].to_str().unwrap();
        assert!(auth.starts_with("SharedKey myaccount:"));
        assert!(s.headers.contains_key("x-ms-date"));
    }
    // the request id differs, so the signatures differ
    assert_ne!(seen[0].headers["authorization"], seen[1].headers["authorization"]);
}

#[tokio::test]
async fn test_user_agent_stamped() {
    let script = ScriptedSender::new(vec![Step::Status(200)]);
    let options = PipelineOptions {
        telemetry: TelemetryOptions::new("order-service/2.1"),
        log: LogOptions::disabled(),
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap();
    pipeline.send(&Context::background(), request()).await.unwrap();

    let ua = script.seen()[0].headers["user-agent"].to_str().unwrap().to_string();
    assert!(ua.starts_with("order-service/2.1 queue-storage/"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_try_logged_as_warning() {
    let script = ScriptedSender::new(vec![Step::Slow(Duration::from_secs(4), 200)]);
    let (log, entries) = capture_up_to(LogLevel::Debug);
    let options = PipelineOptions {
        retry: RetryOptions::new().with_try_timeout(Duration::from_secs(30)),
        log,
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap();
    pipeline.send(&Context::background(), request()).await.unwrap();

    let entries = entries.lock().unwrap();
    let warnings: Vec<_> = entries.iter().filter(|(l, _)| *l == LogLevel::Warning).collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].1.contains("SLOW"));
    assert!(entries
        .iter()
        .any(|(l, m)| *l == LogLevel::Info && m.contains("OUTGOING REQUEST")));
}

#[tokio::test(start_paused = true)]
async fn test_fast_try_not_warned() {
    let script = ScriptedSender::new(vec![Step::Slow(Duration::from_secs(1), 200)]);
    let (log, entries) = capture_up_to(LogLevel::Debug);
    let options = PipelineOptions {
        log,
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap();
    pipeline.send(&Context::background(), request()).await.unwrap();

    assert!(entries
        .lock()
        .unwrap()
        .iter()
        .all(|(l, _)| *l != LogLevel::Warning));
}

#[tokio::test(start_paused = true)]
async fn test_filtered_sink_never_sees_warning() {
    let script = ScriptedSender::new(vec![Step::Slow(Duration::from_secs(4), 200)]);
    let (log, entries) = capture_up_to(LogLevel::Error);
    let options = PipelineOptions {
        log,
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap();
    pipeline.send(&Context::background(), request()).await.unwrap();

    assert!(entries.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failures_logged_at_error_and_retries_at_info() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(404)]);
    let (log, entries) = capture_up_to(LogLevel::Info);
    let options = PipelineOptions {
        retry: example_retry(),
        log,
        ..Default::default()
    }
    .with_http_sender(Arc::new(script.clone()));
    let pipeline = Pipeline::new(Some(Arc::new(AnonymousCredential)), options).unwrap();
    let resp = pipeline.send(&Context::background(), request()).await.unwrap();
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let entries = entries.lock().unwrap();
    let errors: Vec<_> = entries.iter().filter(|(l, _)| *l == LogLevel::Error).collect();
    assert_eq!(errors.len(), 1, "only the 500 is an error: {:?}", *entries);
    assert!(errors[0].1.starts_with("<== 500"));
    assert!(entries
        .iter()
        .any(|(l, m)| *l == LogLevel::Info && m.starts_with("retry: try 1 of 3 failed (status 500)")));
    assert!(entries
        .iter()
        .any(|(l, m)| *l == LogLevel::Info && m.starts_with("<== 404")));
}

struct TagMethod;

struct TagPolicy {
    next: PolicyRef,
}

#[async_trait::async_trait]
impl Policy for TagPolicy {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        request.set_header("x-ms-peekonly", "true")?;
        self.next.send(ctx, request).await
    }
}

impl PolicyFactory for TagMethod {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(TagPolicy { next })
    }
}

#[tokio::test(start_paused = true)]
async fn test_method_factory_runs_per_attempt_below_retry() {
    let script = ScriptedSender::new(vec![Step::Status(500), Step::Status(200)]);
    let pipeline = pipeline_with(&script, example_retry());

    pipeline
        .send_with_method(&Context::background(), &TagMethod, request())
        .await
        .unwrap();
    let seen = script.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|s| s.headers.contains_key("x-ms-peekonly")));

    pipeline.send(&Context::background(), request()).await.unwrap();
    assert!(!script.seen()[2].headers.contains_key("x-ms-peekonly"));
}

#[tokio::test]
async fn test_sender_that_forwards_hits_end_of_pipeline() {
    let script = ScriptedSender::new(vec![Step::Forward]);
    let pipeline = pipeline_with(&script, example_retry());
    let err = pipeline.send(&Context::background(), request()).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_builder_without_marker_puts_slot_above_sender() {
    let script = ScriptedSender::new(vec![Step::Status(200)]);
    let pipeline = Pipeline::builder()
        .policy(Arc::new(UniqueRequestIdPolicyFactory))
        .build(PipelineOptions::default().with_http_sender(Arc::new(script)))
        .unwrap();
    assert_eq!(
        pipeline.policy_names(),
        vec!["unique_request_id", "method_marker", "scripted"]
    );
}

#[test]
fn test_options_from_yaml() {
    let yaml = r#"
retry:
  policy: fixed
  max_tries: 5
  retry_delay: { secs: 2, nanos: 0 }
telemetry:
  value: billing/1.0
request_log:
  log_warning_if_try_over_threshold: ~
"#;
    let options: PipelineOptions = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(options.retry.policy, RetryPolicyKind::Fixed);
    assert_eq!(options.retry.max_tries, 5);
    assert_eq!(options.retry.retry_delay, Duration::from_secs(2));
    assert_eq!(options.telemetry.value, "billing/1.0");
    assert_eq!(options.request_log.log_warning_if_try_over_threshold, None);
    assert_eq!(options.transport, TransportOptions::default());
    assert!(options.http_sender.is_none());
}
