// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Coarse network-layer failure classes, mirrored onto the wire as part
/// of a failure response's `ErrorClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    SequenceMismatch,
    RpcMessageMalformed,
    ConnectionClosed,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::SequenceMismatch => "sequence number mismatch",
            NetworkErrorKind::RpcMessageMalformed => "malformed rpc message",
            NetworkErrorKind::ConnectionClosed => "connection closed",
        };
        f.write_str(s)
    }
}

/// Coarse classification carried in a failure response, so a caller can
/// branch on class without parsing the message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Platform,
    Network,
    Argument,
    State,
    NotFound,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("platform error: {0}")]
    Platform(#[from] std::io::Error),

    #[error("network error: {kind}: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("not implemented")]
    NotImplemented,

    #[error("not supported")]
    NotSupported,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("argument must not be null/empty")]
    ArgumentNull,

    #[error("argument out of bounds")]
    ArgumentOutOfBounds,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("user callback failed: {0}")]
    UserCallback(String),

    #[error("segment allocation retries exceeded")]
    AllocationRetryExceeded,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Platform(_) => ErrorClass::Platform,
            Error::Network { .. } => ErrorClass::Network,
            Error::Argument(_) | Error::ArgumentNull | Error::ArgumentOutOfBounds => {
                ErrorClass::Argument
            }
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::NotImplemented
            | Error::NotSupported
            | Error::InvalidOperation(_)
            | Error::Timeout
            | Error::Configuration(_)
            | Error::UserCallback(_)
            | Error::AllocationRetryExceeded => ErrorClass::State,
        }
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Error::Network {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
