//! Error types for the proxy chain

use std::io;
use thiserror::Error;

/// Proxy chain error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid proxy URL: {0}")]
    InvalidProxyUrl(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("Upstream dial failed: {0}")]
    Dial(String),

    #[error("Upstream CONNECT rejected: {0}")]
    ConnectRejected(String),

    #[error("Listen error: {0}")]
    Listen(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_proxy_url<S: Into<String>>(msg: S) -> Self {
        Error::InvalidProxyUrl(msg.into())
    }

    pub fn unsupported_scheme<S: Into<String>>(msg: S) -> Self {
        Error::UnsupportedScheme(msg.into())
    }

    pub fn invalid_target<S: Into<String>>(msg: S) -> Self {
        Error::InvalidTarget(msg.into())
    }

    pub fn dial<S: Into<String>>(msg: S) -> Self {
        Error::Dial(msg.into())
    }

    pub fn connect_rejected<S: Into<String>>(msg: S) -> Self {
        Error::ConnectRejected(msg.into())
    }

    pub fn listen<S: Into<String>>(msg: S) -> Self {
        Error::Listen(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::listen("port busy");
        assert!(matches!(e, Error::Listen(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::connect_rejected("status 407");
        assert_eq!(e.to_string(), "Upstream CONNECT rejected: status 407");
    }
}
