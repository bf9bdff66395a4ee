//! 传输层：连接池化的 HTTP 发送器与网络错误分类。
//!
//! Transport layer: the pooled HTTP sender at the end of every pipeline, and
//! the uniform [`TransportError`] the retry policy classifies.

pub mod http;

pub use http::{HttpSender, TransportOptions};

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Enumerated network failure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Connect, read or per-try timeout.
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    /// Name resolution failed.
    Dns,
    /// Connection could not be established for another reason.
    Connect,
    /// TLS negotiation failed (certificate or protocol mismatch).
    Tls,
    /// The peer closed the connection mid-message.
    UnexpectedEof,
    /// The request could not be built (bad URL, header, ...).
    InvalidRequest,
    /// The sender was shut down.
    Shutdown,
    Other,
}

impl NetworkErrorKind {
    /// Transient conditions worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::ConnectionAborted
                | NetworkErrorKind::Dns
                | NetworkErrorKind::Connect
                | NetworkErrorKind::UnexpectedEof
        )
    }

    fn from_io(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionRefused => Some(NetworkErrorKind::ConnectionRefused),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Some(NetworkErrorKind::ConnectionReset)
            }
            io::ErrorKind::ConnectionAborted => Some(NetworkErrorKind::ConnectionAborted),
            io::ErrorKind::TimedOut => Some(NetworkErrorKind::Timeout),
            io::ErrorKind::UnexpectedEof => Some(NetworkErrorKind::UnexpectedEof),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::ConnectionReset => "connection reset",
            NetworkErrorKind::ConnectionAborted => "connection aborted",
            NetworkErrorKind::Dns => "dns resolution failed",
            NetworkErrorKind::Connect => "connect failed",
            NetworkErrorKind::Tls => "tls failure",
            NetworkErrorKind::UnexpectedEof => "unexpected eof",
            NetworkErrorKind::InvalidRequest => "invalid request",
            NetworkErrorKind::Shutdown => "sender shut down",
            NetworkErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A transport-level failure with its classification.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: NetworkErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> NetworkErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest(&err);
        TransportError::new(kind, "HTTP request failed").with_source(err)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = NetworkErrorKind::from_io(err.kind()).unwrap_or(NetworkErrorKind::Other);
        TransportError::new(kind, "I/O failure").with_source(err)
    }
}

const DNS_MARKERS: &[&str] = &["dns", "failed to lookup", "name or service not known", "no such host"];
const TLS_MARKERS: &[&str] = &["tls", "certificate", "handshake"];

/// Map a `reqwest` error onto [`NetworkErrorKind`], preferring the underlying
/// `io::ErrorKind` when one is present in the source chain.
pub(crate) fn classify_reqwest(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    if let Some(kind) = io_kind_in_chain(err).and_then(NetworkErrorKind::from_io) {
        return kind;
    }
    if err.is_connect() {
        return classify_connect_text(&chain_text(err));
    }
    if err.is_body() || err.is_decode() {
        return NetworkErrorKind::UnexpectedEof;
    }
    if err.is_builder() || err.is_redirect() {
        return NetworkErrorKind::InvalidRequest;
    }
    if err.is_request() {
        // "connection closed before message completed" and friends
        return NetworkErrorKind::ConnectionReset;
    }
    NetworkErrorKind::Other
}

fn classify_connect_text(text: &str) -> NetworkErrorKind {
    let text = text.to_lowercase();
    if DNS_MARKERS.iter().any(|m| text.contains(m)) {
        NetworkErrorKind::Dns
    } else if TLS_MARKERS.iter().any(|m| text.contains(m)) {
        NetworkErrorKind::Tls
    } else {
        NetworkErrorKind::Connect
    }
}

fn io_kind_in_chain(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

fn chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}
