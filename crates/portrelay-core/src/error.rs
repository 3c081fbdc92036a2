use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("bind on port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("no I/O for {0:?}")]
    IdleTimeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// `true` for the timeout kinds, which are reported separately from
    /// plain I/O failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectTimeout { .. } | RelayError::IdleTimeout(_)
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
