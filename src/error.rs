//! Error handling for the PBX core.
//!
//! Every non-fatal variant maps to exactly one SIP status code via
//! [`Error::status_code`], so the worker state machine never has to decide
//! the wire response separately from the error it caught.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or non-conforming SIP message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing or invalid credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Request denied by profile policy (call caps, dialing policy).
    #[error("Authorization denied: {0}")]
    Authorization(String),

    /// Destination could not be resolved or has no route.
    #[error("Routing error: {0}")]
    Routing(RoutingFailure),

    /// Arena or registry exhausted.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// Transport send failure, DNS timeout, etc. Caller may retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Startup-only: configuration invalid, bind failure, arena allocation
    /// failure before the event loop starts.
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Distinguishes "no such destination" (404) from "destination known but
/// unreachable right now" (480), per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    Unknown,
    Unreachable,
}

impl std::fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingFailure::Unknown => write!(f, "no route to destination"),
            RoutingFailure::Unreachable => write!(f, "destination unreachable"),
        }
    }
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn unknown_route<S: Into<String>>(_msg: S) -> Self {
        Self::Routing(RoutingFailure::Unknown)
    }

    pub fn unreachable<S: Into<String>>(_msg: S) -> Self {
        Self::Routing(RoutingFailure::Unreachable)
    }

    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The SIP status code the worker should send back for this failure.
    /// Only meaningful for per-event errors; `Fatal`/`Config`/`Io` are
    /// startup-only and never reach a transaction.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 400,
            Error::Authentication(_) => 401,
            Error::Authorization(_) => 403,
            Error::Routing(RoutingFailure::Unknown) => 404,
            Error::Routing(RoutingFailure::Unreachable) => 480,
            Error::Capacity(_) => 503,
            Error::Transient(_) => 408,
            Error::InvalidState(_) => 481,
            Error::NotSupported(_) => 405,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_mapping() {
        assert_eq!(Error::authentication("no auth").status_code(), 401);
        assert_eq!(Error::authorization("denied").status_code(), 403);
        assert_eq!(Error::unknown_route("x").status_code(), 404);
        assert_eq!(Error::unreachable("x").status_code(), 480);
        assert_eq!(Error::capacity("full").status_code(), 503);
    }
}
