use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use awc::error::{ConnectError, SendRequestError};
use thiserror::Error;

pub const MSG_DECRYPTION_FAILED: &str = "Decryption Failed";
pub const MSG_METHOD_NOT_ALLOWED: &str = "Method Not Allowed";
pub const MSG_PAYLOAD_TOO_LARGE: &str = "Payload Too Large";
pub const MSG_BAD_GATEWAY: &str = "Bad Gateway";
pub const MSG_INTERNAL_ERROR: &str = "Internal Decrypter Error";

/// Every decryption-side fault (missing keys, bad base64, failed tag check,
/// malformed plaintext) collapses into this one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decryption failed")]
pub struct DecryptError;

/// Why an upstream could not be reached. Logged, never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableReason {
    Dns,
    ConnectRefused,
    ConnectTimeout,
    Timeout,
    Io,
    InvalidUrl,
    Other,
}

impl UnreachableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnreachableReason::Dns => "dns",
            UnreachableReason::ConnectRefused => "connect_refused",
            UnreachableReason::ConnectTimeout => "connect_timeout",
            UnreachableReason::Timeout => "timeout",
            UnreachableReason::Io => "io",
            UnreachableReason::InvalidUrl => "invalid_url",
            UnreachableReason::Other => "other",
        }
    }

    pub fn from_send_error(err: &SendRequestError) -> Self {
        match err {
            SendRequestError::Url(_) => UnreachableReason::InvalidUrl,
            SendRequestError::Connect(ConnectError::Resolver(_))
            | SendRequestError::Connect(ConnectError::NoRecords)
            | SendRequestError::Connect(ConnectError::Unresolved) => UnreachableReason::Dns,
            SendRequestError::Connect(ConnectError::Timeout) => UnreachableReason::ConnectTimeout,
            SendRequestError::Connect(ConnectError::Io(e))
                if e.kind() == std::io::ErrorKind::ConnectionRefused => UnreachableReason::ConnectRefused,
            SendRequestError::Connect(_) => UnreachableReason::Io,
            SendRequestError::Send(_) => UnreachableReason::Io,
            SendRequestError::Timeout => UnreachableReason::Timeout,
            _ => UnreachableReason::Other,
        }
    }
}

/// Errors raised while handling one inbound request. Each maps to exactly one
/// status code; the detail stays in the log.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("upstream unreachable ({}): {detail}", .reason.as_str())]
    UpstreamUnreachable { reason: UnreachableReason, detail: String },
    #[error("internal: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn unreachable(err: SendRequestError) -> Self {
        RelayError::UpstreamUnreachable {
            reason: UnreachableReason::from_send_error(&err),
            detail: err.to_string(),
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        RelayError::Internal(err.to_string())
    }

    fn client_message(&self) -> &'static str {
        match self {
            RelayError::Decrypt(_) => MSG_DECRYPTION_FAILED,
            RelayError::MethodNotAllowed => MSG_METHOD_NOT_ALLOWED,
            RelayError::PayloadTooLarge { .. } => MSG_PAYLOAD_TOO_LARGE,
            RelayError::UpstreamUnreachable { .. } => MSG_BAD_GATEWAY,
            RelayError::Internal(_) => MSG_INTERNAL_ERROR,
        }
    }
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Decrypt(_) => StatusCode::BAD_REQUEST,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        // The rest of an oversized body is never read, so the connection can't be reused.
        if let RelayError::PayloadTooLarge { .. } = self {
            response.force_close();
        }
        response.content_type("text/plain").body(self.client_message())
    }
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid upstream url {url:?}: {reason}")]
    InvalidUpstream { url: String, reason: String },
    #[error("invalid route entry {0:?}, expected prefix=url")]
    InvalidRoute(String),
    #[error("route prefix {0:?} must start with '/'")]
    InvalidPrefix(String),
    #[error("tunnel id {0:?} may only contain letters, digits, '-' and '_'")]
    InvalidTunnelId(String),
    #[error("unknown log level {0:?}")]
    InvalidLogLevel(String),
    #[error("failed to compile rewrite pattern: {0}")]
    Pattern(#[from] regex::Error),
}
