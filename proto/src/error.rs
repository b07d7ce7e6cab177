//! Per-connection failure reasons, mapped 1:1 to the report-line text a
//! crawled peer sees emitted on stdout.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    #[error("Bad Address")]
    BadAddress,
    #[error("Bad Handshake {0}")]
    BadHandshake(String),
    #[error("Bad Headers {0}")]
    BadHeaders(String),
    #[error("Bad X-Ultrapeer: {0}")]
    BadXUltrapeer(String),
    #[error("Multiple X-Ultrapeer")]
    MultipleXUltrapeer,
    #[error("Timeout")]
    Timeout,
    #[error("Connection Dropped")]
    ConnectionDropped,
    #[error("Failed: {0}")]
    Failed(String),
    #[error("Bind error")]
    BindError,
}
