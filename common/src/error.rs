use std::io;

use thiserror::Error;

/// Coarse failure taxonomy used by the control loop when logging sub-task errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connection,
    Protocol,
    Decode,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Decode => "decode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Status,
    Header,
    ChunkSize,
}

impl LineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Header => "header",
            Self::ChunkSize => "chunk size",
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to connect to {endpoint} after {attempts} attempt(s): {source}")]
    Connect {
        endpoint: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("timed out waiting for response data")]
    Timeout,
    #[error("connection closed by peer mid-response")]
    Closed,
    #[error("unexpected status line `{0}`")]
    UnexpectedStatus(String),
    #[error("response headers are not terminated by an empty line")]
    MissingHeaderTerminator,
    #[error("{} line exceeds {limit} bytes", kind.as_str())]
    LineTooLong { kind: LineKind, limit: usize },
    #[error("invalid chunk size line `{0}`")]
    InvalidChunkSize(String),
    #[error("chunk data is not followed by CRLF")]
    MissingChunkTerminator,
    #[error("response body exceeds {capacity} bytes")]
    BodyOverflow { capacity: usize },
    #[error("malformed settings document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request body exceeds {capacity} bytes")]
    RequestTooLarge { capacity: usize },
}

impl HttpError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Connect { .. } | Self::Io(_) => FailureClass::Connection,
            Self::Timeout
            | Self::Closed
            | Self::UnexpectedStatus(_)
            | Self::MissingHeaderTerminator
            | Self::LineTooLong {
                kind: LineKind::Status | LineKind::Header,
                ..
            } => FailureClass::Protocol,
            Self::LineTooLong {
                kind: LineKind::ChunkSize,
                ..
            }
            | Self::InvalidChunkSize(_)
            | Self::MissingChunkTerminator
            | Self::BodyOverflow { .. }
            | Self::Json(_)
            | Self::RequestTooLarge { .. } => FailureClass::Decode,
        }
    }
}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor did not respond")]
    Offline,
    #[error("sensor reading failed checksum")]
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("api host must not be empty")]
    EmptyHost,
    #[error("api retry budget must be at least one attempt")]
    NoRetries,
    #[error("{field} may only contain ASCII letters, digits, '-', '_' or '.'")]
    InvalidCredential { field: &'static str },
    #[error("telemetry body needs up to {needed} bytes but the buffer holds {capacity}")]
    TelemetryBodyTooLarge { needed: usize, capacity: usize },
    #[error("a pinned certificate requires https")]
    PinWithoutTls,
    #[error("pinned certificate is not a PEM certificate")]
    MalformedPin,
}
