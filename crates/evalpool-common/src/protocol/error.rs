use thiserror::Error;

/// Reasons an interpreter could not be handed out by the pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("acquisition cancelled by caller")]
    Cancelled,

    #[error("engine is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("code is required")]
    EmptyCode,

    #[error("failed to acquire interpreter: {0}")]
    Acquisition(#[from] AcquireError),

    #[error("execution error: {0}")]
    Script(String),

    #[error("execution timeout after {0}ms")]
    Timeout(u64),

    #[error("failed to export result: {0}")]
    Conversion(String),

    #[error("interpreter error: {0}")]
    Interpreter(String),

    #[error("engine not configured: missing `{0}` section")]
    NotConfigured(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine not started")]
    NotStarted,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvalError {
    /// Returns true for errors raised before the script ever ran.
    pub fn is_validation(&self) -> bool {
        matches!(self, EvalError::EmptyCode)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EvalError::Timeout(_))
    }

    pub fn is_acquisition(&self) -> bool {
        matches!(self, EvalError::Acquisition(_))
    }
}

impl From<std::net::AddrParseError> for EvalError {
    fn from(err: std::net::AddrParseError) -> Self {
        EvalError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;
