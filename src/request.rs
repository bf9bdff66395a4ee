//! Request, body and response types that flow through the pipeline.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::error::StorageError;
use crate::pipeline::request_id::CLIENT_REQUEST_ID_HEADER;
use crate::{Error, Result};

/// A body stream that can be read exactly once.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>>;

/// Request payload.
///
/// `Empty` and `Bytes` can be replayed on every retry attempt. `Stream` is
/// handed to the transport once; a later attempt fails with
/// [`Error::BodyNotReplayable`].
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(OneShotStream),
}

impl Body {
    pub fn from_stream(stream: ByteStream) -> Self {
        Body::Stream(OneShotStream(Arc::new(Mutex::new(Some(stream)))))
    }

    /// Length in bytes when known up front.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    fn can_replay(&self) -> bool {
        match self {
            Body::Empty | Body::Bytes(_) => true,
            Body::Stream(shot) => shot.lock().is_some(),
        }
    }

    /// Convert for the wire, consuming a one-shot stream.
    pub(crate) fn into_reqwest(self, attempt: u32) -> Result<Option<reqwest::Body>> {
        match self {
            Body::Empty => Ok(None),
            Body::Bytes(b) => Ok(Some(reqwest::Body::from(b))),
            Body::Stream(shot) => {
                let stream = shot
                    .lock()
                    .take()
                    .ok_or(Error::BodyNotReplayable { attempt })?;
                Ok(Some(reqwest::Body::wrap_stream(stream)))
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::from(Bytes::from(v))
    }
}

/// Shared slot holding a stream until the transport takes it.
#[derive(Clone)]
pub struct OneShotStream(Arc<Mutex<Option<ByteStream>>>);

impl OneShotStream {
    // The slot only ever holds or yields the stream, so a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, Option<ByteStream>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outbound HTTP request, mutated in place by each policy.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    // true when the correlation id was generated by the pipeline rather than the caller
    pub(crate) generated_request_id: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::Empty,
            generated_request_id: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header. Invalid names or values are rejected as validation errors.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn client_request_id(&self) -> Option<&str> {
        self.header_str(CLIENT_REQUEST_ID_HEADER)
    }

    /// Copy of this request for attempt number `attempt` (1-based).
    pub fn rewind(&self, attempt: u32) -> Result<Request> {
        if !self.body.can_replay() {
            return Err(Error::BodyNotReplayable { attempt });
        }
        Ok(self.clone())
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            url: self.url.clone(),
            client_request_id: self.client_request_id().map(str::to_string),
        }
    }
}

/// The parts of the originating request a response keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: Method,
    pub url: Url,
    pub client_request_id: Option<String>,
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::validation(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::validation(format!("invalid value for header '{}': {}", name, e)))?;
    Ok((name, value))
}

/// Result of a completed attempt.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request: RequestSummary,
}

impl Response {
    pub fn new(status: StatusCode, request: &Request) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request: request.summary(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header. Invalid names or values are rejected as validation errors.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Service-assigned request id (`x-ms-request-id`).
    pub fn request_id(&self) -> Option<&str> {
        self.header_str("x-ms-request-id")
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a 4xx/5xx response into [`Error::Service`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(StorageError::from_response(self).into())
        } else {
            Ok(self)
        }
    }
}
