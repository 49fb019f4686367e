use thiserror::Error;

/// Top-level error type for startup and construction paths.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Error from the messaging channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Session store / storage error.
    #[error("memory error: {0}")]
    Memory(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure delivering a message through the protocol service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The service could not be reached (connection refused, DNS, reset).
    #[error("protocol service unreachable: {0}")]
    Unreachable(String),

    /// The service answered but refused the request.
    #[error("protocol service rejected the request: {0}")]
    Rejected(String),

    /// The service did not answer in time.
    #[error("protocol service timed out")]
    Timeout,
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Failure talking to the AI backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Credentials were refused. No further request can succeed.
    #[error("backend authentication failed: {0}")]
    AuthFailure(String),

    /// The backend asked us to slow down.
    #[error("backend rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// No answer within the request deadline.
    #[error("backend request timed out")]
    Timeout,

    /// The backend answered with something we could not interpret.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    /// Connection failure or server-side error.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Auth failures take the whole client down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }
}
