//! Error types for router transports, command execution and output parsing.
//!
//! Every failure the collector can surface is a [`WrtError`]. Callers that
//! only care about the broad category (reconnect and retry, skip this
//! source, fix the configuration) should match on [`WrtError::kind`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure category used by callers to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host unreachable, authentication refused or negotiation failed.
    /// The current operation is lost; the caller should wait and retry.
    Connection,
    /// The remote command failed or the connection dropped mid-command.
    Command,
    /// A source could not be read at all (structural marker missing).
    Parse,
    /// Invalid construction parameters or input values.
    Config,
}

/// Errors that can occur while collecting device state from a router.
#[derive(Error, Debug)]
pub enum WrtError {
    /// Could not establish a session with the router.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The router rejected the supplied credentials.
    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    /// A remote command exited with a failure status or returned no result.
    #[error("command error: {0}")]
    CommandError(String),

    /// The command did not complete within the per-call timeout.
    ///
    /// Contains the partial output received before the timeout.
    #[error("exec command timeout: {0}")]
    ExecTimeout(String),

    /// The session was closed while a command was in flight.
    #[error("channel disconnect while waiting for output")]
    ChannelDisconnectError,

    /// A command was issued on a transport that is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// A source's expected structural marker was not found.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A MAC address string could not be parsed.
    #[error("invalid mac address '{0}'")]
    InvalidMacAddress(String),

    /// Construction parameters were rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The request type does not fit the transport (page on a shell, etc).
    #[error("unsupported request for {transport} transport: {request}")]
    UnsupportedRequest { transport: String, request: String },

    /// No recorded output matches the replayed request.
    #[error("replay mismatch: {0}")]
    ReplayMismatchError(String),

    /// Internal invariant failure (poisoned lock, encode failure).
    #[error("internal error: {0}")]
    InternalServerError(String),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// An error occurred in the HTTP client.
    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Socket level I/O failure.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WrtError {
    /// Maps the error onto the connection / command / parse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WrtError::ConnectionError(_)
            | WrtError::AuthenticationFailed(_)
            | WrtError::NotConnected
            | WrtError::Ssh2Error(_)
            | WrtError::RusshError(_) => ErrorKind::Connection,
            WrtError::HttpError(e) if e.is_connect() => ErrorKind::Connection,
            WrtError::CommandError(_)
            | WrtError::ExecTimeout(_)
            | WrtError::ChannelDisconnectError
            | WrtError::HttpError(_)
            | WrtError::IoError(_)
            | WrtError::ReplayMismatchError(_) => ErrorKind::Command,
            WrtError::ParseError(_) => ErrorKind::Parse,
            WrtError::InvalidMacAddress(_)
            | WrtError::InvalidConfig(_)
            | WrtError::UnsupportedRequest { .. }
            | WrtError::InternalServerError(_) => ErrorKind::Config,
        }
    }

    /// True when the caller should reconnect before retrying.
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}
