use crate::context::CancelReason;
use crate::request::Response;
use crate::transport::TransportError;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::StatusCode;
use thiserror::Error;

/// Header carrying the service-specific error code on failed responses.
pub const ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or option that caused the error (e.g., "retry.max_tries", "telemetry.value")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "pipeline_builder", "shared_key_credential")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A response the service delivered successfully but whose status reports a failure.
///
/// Keeps the raw [`Response`] so callers can inspect headers such as
/// `x-ms-request-id` when filing support tickets.
#[derive(Debug, Clone)]
pub struct StorageError {
    status: StatusCode,
    service_code: Option<String>,
    message: String,
    response: Response,
}

impl StorageError {
    /// Build from a failed response. The service code comes from the
    /// `x-ms-error-code` header, falling back to the `<Code>` element of the body.
    pub fn from_response(response: Response) -> Self {
        let body = String::from_utf8_lossy(&response.body);
        let (body_code, body_message) = parse_error_body(&body);
        let service_code = response
            .header_str(ERROR_CODE_HEADER)
            .map(str::to_string)
            .or(body_code);
        let message = body_message.unwrap_or_else(|| {
            response
                .status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string()
        });
        Self {
            status: response.status,
            service_code,
            message,
            response,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn service_code(&self) -> Option<&str> {
        self.service_code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn response(&self) -> &Response {
        &self.response
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HTTP {} ({}): {}",
            self.status.as_u16(),
            self.service_code.as_deref().unwrap_or("no service code"),
            self.message
        )?;
        if let Some(id) = self.response.header_str("x-ms-request-id") {
            write!(f, " [request id {}]", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {}

#[derive(Clone, Copy)]
enum ErrorField {
    Code,
    Message,
}

/// `Error/Code` and `Error/Message` from a service error body. Malformed XML
/// yields whatever was read before the fault.
fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut code: Option<String> = None;
    let mut message: Option<String> = None;
    let mut in_error = false;
    let mut current: Option<ErrorField> = None;
    let mut buf = Vec::new();

    loop {
        let text = match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.local_name().as_ref() {
                    b"Error" => in_error = true,
                    b"Code" if in_error => current = Some(ErrorField::Code),
                    b"Message" if in_error => current = Some(ErrorField::Message),
                    _ => {}
                }
                None
            }
            Ok(Event::Text(e)) if current.is_some() => e.unescape().ok().map(|t| t.into_owned()),
            Ok(Event::CData(e)) if current.is_some() => {
                Some(String::from_utf8_lossy(&e.into_inner()).into_owned())
            }
            Ok(Event::End(ref e)) => {
                match e.local_name().as_ref() {
                    b"Error" => in_error = false,
                    b"Code" | b"Message" => current = None,
                    _ => {}
                }
                None
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => None,
        };
        if let (Some(field), Some(text)) = (current, text) {
            let slot = match field {
                ErrorField::Code => &mut code,
                ErrorField::Message => &mut message,
            };
            slot.get_or_insert_with(String::new).push_str(&text);
        }
        buf.clear();
    }

    (code, message)
}

/// Unified error type for the queue storage runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Service error: {0}")]
    Service(Box<StorageError>),

    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("Request body cannot be rewound for attempt {attempt}")]
    BodyNotReplayable { attempt: u32 },

    #[error("Credential error: {message}")]
    Credential { message: String },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_with_context(msg, ErrorContext::new())
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Error::Credential {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Validation { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    /// True when the caller's context ended the operation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// The service response behind a [`Error::Service`], if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Error::Service(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Service(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use reqwest::Method;

    fn failed_response(status: u16, body: &str) -> Response {
        let request = Request::new(
            Method::GET,
            url::Url::parse("https://acct.queue.example.net/missing").unwrap(),
        );
        Response::new(StatusCode::from_u16(status).unwrap(), &request).with_body(body.to_string())
    }

    #[test]
    fn test_storage_error_prefers_header_code() {
        let resp = failed_response(
            404,
            "<?xml version=\"1.0\"?><Error><Code>BodyCode</Code><Message>The specified queue does not exist.</Message></Error>",
        )
        .with_header(ERROR_CODE_HEADER, "QueueNotFound")
        .unwrap();

        let err = StorageError::from_response(resp);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.service_code(), Some("QueueNotFound"));
        assert_eq!(err.message(), "The specified queue does not exist.");
    }

    #[test]
    fn test_storage_error_falls_back_to_body_code() {
        let resp = failed_response(
            409,
            "<Error><Code>QueueAlreadyExists</Code><Message>exists</Message></Error>",
        );
        let err = StorageError::from_response(resp);
        assert_eq!(err.service_code(), Some("QueueAlreadyExists"));
    }

    #[test]
    fn test_storage_error_unescapes_message() {
        let resp = failed_response(
            400,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>OutOfRangeQueryParameterValue</Code>\
<Message>Value for &quot;numofmessages&quot; must be &lt;= 32</Message></Error>",
        );
        let err = StorageError::from_response(resp);
        assert_eq!(err.service_code(), Some("OutOfRangeQueryParameterValue"));
        assert_eq!(err.message(), "Value for \"numofmessages\" must be <= 32");
    }

    #[test]
    fn test_storage_error_matches_prefixed_and_attributed_tags() {
        let resp = failed_response(
            403,
            "<m:Error xmlns:m=\"urn:queue\"><m:Code lang=\"en\">AuthenticationFailed</m:Code>\
<m:Message><![CDATA[Signature <did not> match.]]></m:Message></m:Error>",
        );
        let err = StorageError::from_response(resp);
        assert_eq!(err.service_code(), Some("AuthenticationFailed"));
        assert_eq!(err.message(), "Signature <did not> match.");
    }

    #[test]
    fn test_storage_error_ignores_code_outside_error_element() {
        let resp = failed_response(
            500,
            "<Details><Code>Nested</Code></Details><Error><Message>boom</Message></Error>",
        );
        let err = StorageError::from_response(resp);
        assert_eq!(err.service_code(), None);
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_storage_error_without_body_uses_reason_phrase() {
        let err = StorageError::from_response(failed_response(403, ""));
        assert_eq!(err.service_code(), None);
        assert_eq!(err.message(), "Forbidden");
        assert!(err.to_string().starts_with("HTTP 403"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::configuration_with_context(
            "credential is required",
            ErrorContext::new()
                .with_field_path("credential")
                .with_source("pipeline_builder"),
        );
        let text = err.to_string();
        assert!(text.contains("credential is required"));
        assert!(text.contains("field: credential"));
        assert!(text.contains("source: pipeline_builder"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_cancellation_helpers() {
        let err = Error::Cancelled {
            reason: CancelReason::DeadlineExceeded,
        };
        assert!(err.is_cancellation());
        assert!(err.storage_error().is_none());
        assert!(!Error::validation("bad").is_cancellation());
    }
}
