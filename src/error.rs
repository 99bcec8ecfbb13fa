use thiserror::Error;

/// Errors produced by the sharing engine, the compute nodes, the transport and the coordinator.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters or message contents.
    #[error("validation error: {0}")]
    Validation(String),

    /// Fewer points or party results than required were supplied.
    #[error("insufficient shares: need {needed}, got {got}")]
    InsufficientShares { needed: usize, got: usize },

    /// Two points share an x-coordinate, so a Lagrange denominator is zero.
    #[error("duplicate x-coordinate {0} among supplied points")]
    DuplicateCoordinate(u32),

    /// Connection-level failure (refused, timed out, reset, ...). Retryable.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown computation `{0}`")]
    UnknownComputation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a send that failed with this error is worth repeating once the peer is up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<serde_cbor::Error> for Error {
    fn from(err: serde_cbor::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
