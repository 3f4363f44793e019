use thiserror::Error;

/// Well-known error codes returned by the remote store.
pub mod codes {
    pub const OTHER_CAUSE: i32 = -1;
    pub const INTERNAL_SERVER_ERROR: i32 = 1;
    pub const CONNECTION_FAILED: i32 = 100;
    pub const OBJECT_NOT_FOUND: i32 = 101;
    pub const INVALID_QUERY: i32 = 102;
    pub const INVALID_CLASS_NAME: i32 = 103;
    pub const MISSING_OBJECT_ID: i32 = 104;
    pub const INVALID_KEY_NAME: i32 = 105;
    pub const INVALID_POINTER: i32 = 106;
    pub const INVALID_JSON: i32 = 107;
    pub const INCORRECT_TYPE: i32 = 111;
    pub const OBJECT_TOO_LARGE: i32 = 116;
    pub const DUPLICATE_VALUE: i32 = 137;
}

/// Coarse classification used by callers and by the command cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad key, value or type; never enqueued.
    Validation,
    /// Transient transport failure; retryable.
    Connection,
    /// Error returned by the server for a well-formed request; permanent.
    Server,
    /// The operation can never succeed as requested (cycles, protocol drift).
    Structural,
    Cancelled,
    /// Local disk or cache budget failure.
    Storage,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Data for key '{0}' is not available; fetch the entity first")]
    DataUnavailable(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("Circular dependency while saving: {0}")]
    CircularDependency(String),

    #[error("Internal consistency error: {0}")]
    Inconsistent(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Command cache full: {0}")]
    CacheFull(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) | Self::InvalidValue(_) | Self::DataUnavailable(_) => {
                ErrorKind::Validation
            }
            Self::Connection(_) => ErrorKind::Connection,
            Self::Server { .. } | Self::Codec(_) => ErrorKind::Server,
            Self::CircularDependency(_) | Self::Inconsistent(_) => ErrorKind::Structural,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::CacheFull(_) | Self::Io(_) | Self::LockError(_) => ErrorKind::Storage,
        }
    }

    /// True for transient failures the command cache should retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Server { code, .. } => *code,
            Self::Connection(_) => codes::CONNECTION_FAILED,
            Self::Codec(_) => codes::INVALID_JSON,
            _ => codes::OTHER_CAUSE,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
