//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps onto the wire status-code taxonomy shared by RPC clients and
//! servers (see [`ErrorKind::status_code`]); failures that crossed an RPC
//! boundary are carried as [`Error::Remote`] with their cause chain intact.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification shared by local and remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    Inconsistent,
    ServerError,
    Timeout,
    ContainerConfig,
}

impl ErrorKind {
    /// Wire status code. Timeout is client-local and never sent, 408 is only
    /// used for log output.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Timeout => 408,
            ErrorKind::Inconsistent | ErrorKind::ServerError | ErrorKind::ContainerConfig => 500,
        }
    }

    /// Classify a status code received in a reply.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            400 => ErrorKind::BadRequest,
            401 | 403 => ErrorKind::Unauthorized,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            _ => ErrorKind::ServerError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Inconsistent => "Inconsistent",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ContainerConfig => "ContainerConfigError",
        };
        f.write_str(name)
    }
}

/// One hop of a cross-process failure trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseFrame {
    pub label: String,
    pub trace: String,
}

impl CauseFrame {
    pub fn new(label: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            trace: trace.into(),
        }
    }
}

/// A failure reported by a remote RPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    pub kind: ErrorKind,
    pub status_code: u16,
    pub message: String,
    pub cause_chain: Vec<CauseFrame>,
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status_code, self.message)
    }
}

/// Main error enum for the container.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Policy or precondition deny (401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced entity absent (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent-write version mismatch (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal invariant violated (500).
    #[error("inconsistent: {0}")]
    Inconsistent(String),

    /// Uncategorized failure (500).
    #[error("server error: {0}")]
    Server(String),

    /// Client-local deadline expiry.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Misconfigured process or container (500).
    #[error("container config error: {0}")]
    ContainerConfig(String),

    /// Listener or broker channel closed underneath the caller.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Failure reported by the far side of an RPC call.
    #[error("{0}")]
    Remote(Box<RemoteFault>),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Inconsistent(_) => ErrorKind::Inconsistent,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ContainerConfig(_) => ErrorKind::ContainerConfig,
            Error::Remote(fault) => fault.kind,
            Error::Server(_) | Error::ChannelClosed(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::ServerError
            }
        }
    }

    /// Status code to put on the wire for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Remote(fault) => fault.status_code,
            other => other.kind().status_code(),
        }
    }

    /// The bare reason string, without the kind prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::BadRequest(msg)
            | Error::Unauthorized(msg)
            | Error::NotFound(msg)
            | Error::Conflict(msg)
            | Error::Inconsistent(msg)
            | Error::Server(msg)
            | Error::Timeout(msg)
            | Error::ContainerConfig(msg)
            | Error::ChannelClosed(msg) => msg.clone(),
            Error::Remote(fault) => fault.message.clone(),
            Error::Serialization(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Cause chain carried from remote hops; empty for local errors.
    pub fn cause_chain(&self) -> &[CauseFrame] {
        match self {
            Error::Remote(fault) => &fault.cause_chain,
            _ => &[],
        }
    }

    /// Rebuild an error from a non-200 reply.
    pub fn from_reply(status_code: u16, message: impl Into<String>, cause_chain: Vec<CauseFrame>) -> Self {
        Error::Remote(Box::new(RemoteFault {
            kind: ErrorKind::from_status_code(status_code),
            status_code,
            message: message.into(),
            cause_chain,
        }))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

// Convenience constructors
impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn container_config(msg: impl Into<String>) -> Self {
        Self::ContainerConfig(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_for_wire_kinds() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::ServerError,
        ] {
            assert_eq!(ErrorKind::from_status_code(kind.status_code()), kind);
        }
        assert_eq!(ErrorKind::from_status_code(403), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::Inconsistent.status_code(), 500);
    }

    #[test]
    fn test_message_has_no_kind_prefix() {
        let err = Error::bad_request("missing arg");
        assert_eq!(err.message(), "missing arg");
        assert_eq!(err.to_string(), "bad request: missing arg");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_remote_error_keeps_status_and_chain() {
        let err = Error::from_reply(
            401,
            "denied",
            vec![CauseFrame::new("in remote call to svc", "svc.op")],
        );
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.message(), "denied");
        assert_eq!(err.cause_chain().len(), 1);
    }

    #[test]
    fn test_channel_closed_is_server_error() {
        assert_eq!(Error::channel_closed("q").kind(), ErrorKind::ServerError);
        assert!(Error::timeout("x").is_timeout());
    }
}
