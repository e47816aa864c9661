use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;

/// Application-level code the service returns when the session token has
/// expired. Not an HTTP error.
pub const SESSION_EXPIRED_CODE: &str = "390112";

/// Code returned when the master token itself has expired, making renewal
/// impossible.
pub const MASTER_TOKEN_EXPIRED_CODE: &str = "390114";

/// Query is still executing (synchronous submission).
pub const QUERY_IN_PROGRESS_CODE: &str = "333333";

/// Query is still executing (asynchronous submission).
pub const QUERY_IN_PROGRESS_ASYNC_CODE: &str = "333334";

#[derive(Debug, thiserror::Error)]
pub enum SnowflakeError {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid URL: {0}")]
    UrlParseError(String),

    #[error("Request errored with status code: {0}")]
    HttpError(StatusCode),

    #[error("Request timed out after {elapsed:?} and {attempts} attempt(s); last failure: {last}")]
    RetryTimeout {
        elapsed: Duration,
        attempts: u32,
        last: LastFailure,
    },

    #[error("Request gave up after {attempts} attempt(s); last failure: {last}")]
    RetryGivenUp { attempts: u32, last: LastFailure },

    #[error("Snowflake Query Error ({code}): {message}{}", fmt_query_id(.query_id))]
    QueryError {
        code: String,
        message: String,
        sql_state: Option<String>,
        query_id: Option<String>,
    },

    #[error("Snowflake Auth Error ({code}): {message}")]
    AuthError { code: String, message: String },

    #[error("Failed to renew session ({code}): {message}")]
    RenewError { code: String, message: String },

    #[error("Session expired again after renewal")]
    SessionExpired,

    #[error("Async query {query_id} was cancelled")]
    AsyncCancelled { query_id: String },

    #[error("Async query {query_id} exceeded its deadline of {deadline:?}")]
    AsyncDeadlineExceeded { query_id: String, deadline: Duration },

    #[error("Invalid connection parameters: {0}")]
    InvalidConnectionParameters(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_query_id(query_id: &Option<String>) -> String {
    match query_id {
        Some(id) => format!(" (query id: {id})"),
        None => String::new(),
    }
}

impl SnowflakeError {
    /// Whether this error came from the network layer and the request may
    /// succeed if tried again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.kind != TransportErrorKind::Other,
            _ => false,
        }
    }

    pub(crate) fn query_error(
        code: Option<String>,
        message: Option<String>,
        sql_state: Option<String>,
        query_id: Option<String>,
    ) -> Self {
        Self::QueryError {
            code: code.unwrap_or_default(),
            message: message.unwrap_or_default(),
            sql_state,
            query_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    /// The connection dropped while sending the request or reading the body.
    ConnectionReset,
    Connect,
    /// Anything else. Not retried.
    Other,
}

/// Network-level failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionReset, message)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else if e.is_request() || e.is_body() {
            TransportErrorKind::ConnectionReset
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

/// The last thing that went wrong before a retry loop stopped.
#[derive(Debug)]
pub enum LastFailure {
    Status(StatusCode),
    Error(Box<SnowflakeError>),
}

impl LastFailure {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(s) => Some(*s),
            Self::Error(_) => None,
        }
    }
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP status {status}"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

pub type Result<T, E = SnowflakeError> = std::result::Result<T, E>;
