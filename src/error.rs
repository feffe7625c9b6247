use thiserror::Error;

/// How an error should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff, bounded attempts
    Transient,
    /// Stop the process in an orderly way
    Fatal,
    /// Expected race (already filled, duplicate cancel); log and carry on
    Benign,
    /// Bad candle data; reported, never auto-corrected
    DataIntegrity,
}

/// HTTP status codes that indicate a permanent client error
pub const FATAL_HTTP_STATUSES: [u16; 6] = [400, 401, 402, 403, 404, 429];

/// Venue code returned when cancelling an order that no longer exists
pub const UNKNOWN_ORDER_CODE: i64 = 110001;

/// Errors surfaced by the exchange capability and transport
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("exchange asked to retry: {0}")]
    RetryRequested(String),

    #[error("post-only order would take liquidity")]
    PostOnlyWouldCross,

    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },

    #[error("unknown order {0} (already filled or cancelled?)")]
    UnknownOrder(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("venue has no kline interval for {0}")]
    UnsupportedInterval(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Http { status, .. } if FATAL_HTTP_STATUSES.contains(status) => {
                ErrorKind::Fatal
            }
            ExchangeError::Http { status, .. } if *status >= 500 => ErrorKind::Transient,
            ExchangeError::Http { .. } => ErrorKind::Fatal,
            ExchangeError::Connection(_)
            | ExchangeError::RetryRequested(_)
            | ExchangeError::PostOnlyWouldCross => ErrorKind::Transient,
            ExchangeError::Venue { code, .. } if *code == UNKNOWN_ORDER_CODE => ErrorKind::Benign,
            ExchangeError::Venue { .. } => ErrorKind::Fatal,
            ExchangeError::UnknownOrder(_) => ErrorKind::Benign,
            ExchangeError::Decode(_) | ExchangeError::UnsupportedInterval(_) => ErrorKind::Fatal,
            ExchangeError::RetriesExhausted { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_benign(&self) -> bool {
        self.kind() == ErrorKind::Benign
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ExchangeError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None if e.is_decode() => ExchangeError::Decode(e.to_string()),
            None => ExchangeError::Connection(e.to_string()),
        }
    }
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("strategy error: {0}")]
    Strategy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Exchange(e) => e.kind(),
            EngineError::DataIntegrity(_) => ErrorKind::DataIntegrity,
            EngineError::Config(_) | EngineError::Fatal(_) | EngineError::Io(_) => ErrorKind::Fatal,
            EngineError::InvalidOrder(_) | EngineError::Strategy(_) => ErrorKind::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}
