pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// wire protocol errors; fatal for the offending connection
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// connection lifecycle errors
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// a connection deliberately killed by the backpressure policy
    #[error("suspect connection: {0}")]
    SuspectConnection(String),

    /// startup errors; prevent the acceptor from starting
    #[error("bind error: {0}")]
    Bind(String),
}

impl AppError {
    /// True for errors the backpressure policy raised on purpose; these are
    /// reported at a higher severity than ordinary connection failures.
    pub fn is_suspect_kill(&self) -> bool {
        matches!(self, AppError::SuspectConnection(_))
    }
}
