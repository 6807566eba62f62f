//! Error taxonomy for simbridge
//!
//! One closed enum covers every failure the server can surface. Transport
//! layers map kinds onto HTTP status codes and WebSocket error frames; the
//! kind string is part of the wire contract.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid device type, OS version, or config value
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Session, device, app, or file missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state
    #[error("bad state: {0}")]
    BadState(String),

    /// Resource in use (device mutex, active recording)
    #[error("busy: {0}")]
    Busy(String),

    /// Connection denied by the sliding-window rate limiter
    #[error("rate limited")]
    RateLimited,

    /// Connection denied by the per-session cap
    #[error("connection cap exceeded")]
    CapExceeded,

    /// External call exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Host tool failed with a nonzero exit or malformed output
    #[error("host driver: {0}")]
    Driver(String),

    /// Persistence read/write failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed client message
    #[error("protocol: {0}")]
    Protocol(String),

    /// Invariant violated
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string used in WebSocket error frames and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::NotFound(_) => "not-found",
            Error::BadState(_) => "bad-state",
            Error::Busy(_) => "busy",
            Error::RateLimited => "rate-limited",
            Error::CapExceeded => "cap-exceeded",
            Error::Timeout(_) => "timeout",
            Error::Driver(_) => "host-driver",
            Error::Io(_) => "io",
            Error::Protocol(_) => "protocol",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a retry inside the host driver is worthwhile.
    ///
    /// Only timeouts and tool failures qualify; everything else is a
    /// deterministic rejection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Driver(_))
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Error::Driver(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Internal(format!("webrtc: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::RateLimited.kind(), "rate-limited");
        assert_eq!(Error::CapExceeded.kind(), "cap-exceeded");
        assert_eq!(Error::Timeout("boot".into()).kind(), "timeout");
        assert_eq!(Error::Driver("exit 1".into()).kind(), "host-driver");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("x".into()).is_transient());
        assert!(Error::Driver("x".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::RateLimited.is_transient());
    }
}
