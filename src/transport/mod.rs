//! Router transports.
//!
//! A [`Transport`] owns one connection to one router and knows three
//! operations: connect, run a [`Request`] and return its raw text, and
//! disconnect. The variant is picked once, from [`RouterConfig::transport`],
//! by [`build_transport`].
//!
//! # Variants
//!
//! - [`SshTransport`] - one SSH session, one exec channel per command
//! - [`TelnetTransport`] - one interactive shell framed by its prompt
//! - [`HttpTransport`] - stateless status-page fetches with basic auth
//! - [`ReplayTransport`] - serves outputs from a recorded session
//!
//! Any transport can be wrapped in a [`RecordingTransport`] to capture a
//! session as JSONL for later replay.
//!
//! # Connection state
//!
//! Transports start [`ConnectionState::Disconnected`], pass through
//! `Connecting`, and end up `Connected` or `Failed`. Every transport error
//! leaves the transport `Failed`; transports never reconnect on their own.

use std::borrow::Cow;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::{debug, trace};
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::catalog::{Request, ShellCommand};
use crate::config::{self, RouterConfig, SecurityLevel, TransportKind};
use crate::error::WrtError;

pub use http::HttpTransport;
pub use recording::{
    NormalizeOptions, RecordingTransport, ReplayTransport, SessionEvent, SessionRecordEntry,
    SessionRecordLevel, SessionRecorder,
};
pub use ssh::SshTransport;
pub use telnet::TelnetTransport;

/// Lifecycle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A connection to one router.
///
/// Implementations serialize their own I/O: `run` takes `&mut self`, so two
/// commands can never interleave on one session.
#[async_trait]
pub trait Transport: Send {
    /// Which command surface this transport speaks.
    fn kind(&self) -> TransportKind;

    /// `user@host:port`, for logs and recordings.
    fn target(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Establishes the connection, replacing any previous one.
    async fn connect(&mut self) -> Result<(), WrtError>;

    /// Runs one request and returns its raw text output.
    async fn run(&mut self, request: &Request) -> Result<String, WrtError>;

    /// Releases the connection. Calling it twice is harmless.
    async fn disconnect(&mut self) -> Result<(), WrtError>;
}

/// Builds the transport selected by `config`.
pub fn build_transport(config: &RouterConfig) -> Result<Box<dyn Transport>, WrtError> {
    config.validate()?;
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Ssh => Box::new(SshTransport::new(config)),
        TransportKind::Telnet => Box::new(TelnetTransport::new(config)),
        TransportKind::Http => Box::new(HttpTransport::new(config)),
    };
    debug!("built {} transport for {}", config.transport, config.target());
    Ok(transport)
}

pub(crate) fn unsupported(kind: TransportKind, request: &Request) -> WrtError {
    WrtError::UnsupportedRequest {
        transport: kind.to_string(),
        request: request.to_string(),
    }
}

/// SSH algorithm preferences for a security level.
pub(crate) fn preferred(level: SecurityLevel) -> Preferred {
    match level {
        SecurityLevel::Secure => Preferred {
            kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
            key: Cow::Borrowed(config::SECURE_KEY_TYPES),
            cipher: Cow::Borrowed(config::SECURE_CIPHERS),
            mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        },
        SecurityLevel::Balanced => Preferred {
            kex: Cow::Borrowed(config::BALANCED_KEX_ORDER),
            key: Cow::Borrowed(config::BALANCED_KEY_TYPES),
            cipher: Cow::Borrowed(config::BALANCED_CIPHERS),
            mac: Cow::Borrowed(config::BALANCED_MAC_ALGORITHMS),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        },
        SecurityLevel::LegacyCompatible => Preferred {
            kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
            key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
            cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
            mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        },
    }
}

mod http;
mod recording;
mod ssh;
mod telnet;
