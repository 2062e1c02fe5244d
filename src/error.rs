//! Error types for launching the functions runtime and forwarding requests to it

use hyper::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Reasons a runtime launch attempt can fail.
///
/// None of these are fatal to the host: the launcher converts every variant into
/// [`LaunchOutcome::Failed`](crate::launcher::LaunchOutcome::Failed).
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The configured command line could not be split into a program and arguments
    #[error("Invalid runtime command: {0}")]
    InvalidCommand(String),

    /// The runtime process could not be started (missing binary, permissions)
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The inter-process message channel could not be created
    #[error("Failed to set up the runtime message channel: {0}")]
    Channel(#[source] io::Error),

    /// No readiness message arrived before the deadline
    #[error("Timeout error, could not hear back from `{program}` in a reasonable amount of time")]
    Timeout { program: String, timeout: Duration },

    /// The first message could not be decoded as `{ip, port}`
    #[error("Malformed readiness message from `{program}`: {reason}")]
    MalformedReadiness { program: String, reason: String },

    /// The runtime closed its side of the channel (usually by exiting) before it was ready
    #[error("`{program}` closed its message channel before signaling readiness")]
    ChannelClosed { program: String },

    /// The message channel needs Unix file descriptor passing
    #[error("The runtime message channel is only supported on Unix platforms")]
    UnsupportedPlatform,
}

/// Errors raised while forwarding a single request to the runtime
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The runtime base URL or the rewritten request URI is not a valid absolute URI
    #[error("Invalid proxy target: {0}")]
    InvalidTarget(String),

    /// The outgoing request could not be assembled
    #[error("Request build error: {0}")]
    RequestBuild(String),

    /// The runtime refused the connection, reset it, or sent a broken response
    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

impl ProxyError {
    /// Status a host should answer with when it renders this error itself
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RequestBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short machine-readable code, suitable for an `X-Proxy-Error` header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyError::InvalidTarget(_) => "INVALID_TARGET",
            ProxyError::RequestBuild(_) => "REQUEST_BUILD_FAILED",
            ProxyError::Upstream(e) if e.is_connect() => "CONNECTION_FAILED",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}
