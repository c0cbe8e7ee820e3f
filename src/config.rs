//! Router connection parameters and SSH algorithm profiles.
//!
//! [`RouterConfig`] holds everything needed to build a transport: host,
//! transport kind, port, credentials and the per-call timeout. The algorithm
//! lists below back the [`SecurityLevel`] profiles. Older DD-WRT builds ship
//! dropbear versions that only speak SHA-1 key exchange and CBC ciphers, so
//! the legacy profile keeps those around.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::WrtError;

/// Default per-call timeout, matching the router's slow busybox userland.
pub const DEFAULT_TIMEOUT_SECS: u64 = 9;

/// Default login name on DD-WRT for every transport.
pub const DEFAULT_USERNAME: &str = "root";

/// Transport used to reach the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Secure remote shell.
    #[default]
    #[serde(alias = "shell-secure")]
    Ssh,
    /// Plaintext remote terminal.
    #[serde(alias = "shell-plain")]
    Telnet,
    /// Status-page fetch over the web UI.
    #[serde(alias = "hypertext")]
    Http,
}

impl TransportKind {
    /// Port used when the configuration leaves it unset.
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Ssh => 22,
            TransportKind::Telnet => 23,
            TransportKind::Http => 80,
        }
    }

    /// True for transports that run shell commands on a session.
    pub fn is_shell(self) -> bool {
        matches!(self, TransportKind::Ssh | TransportKind::Telnet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Telnet => "telnet",
            TransportKind::Http => "http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = WrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" | "shell-secure" => Ok(TransportKind::Ssh),
            "telnet" | "shell-plain" => Ok(TransportKind::Telnet),
            "http" | "hypertext" => Ok(TransportKind::Http),
            other => Err(WrtError::InvalidConfig(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

/// Security level used for SSH algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Strict modern algorithms.
    Secure,
    /// Good security with broader compatibility (default).
    #[default]
    Balanced,
    /// Maximum compatibility with old dropbear builds.
    LegacyCompatible,
}

/// Construction parameters for one router collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouterConfig {
    /// Router host name or IP address.
    pub host: String,

    /// Transport used to reach the router.
    #[serde(default)]
    pub transport: TransportKind,

    /// Port override. When unset the transport default is used.
    #[serde(default)]
    pub port: Option<u16>,

    /// Login name.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for shell login or HTTP basic auth.
    #[serde(default)]
    pub password: Option<String>,

    /// Private key for SSH key authentication. Passed through to the SSH
    /// library untouched.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Passphrase for an encrypted key file.
    #[serde(default)]
    pub key_passphrase: Option<String>,

    /// Per-call timeout in seconds, applied to every connect and command.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// SSH algorithm profile.
    #[serde(default)]
    pub security: SecurityLevel,

    /// Verify the SSH host key against `~/.ssh/known_hosts`.
    #[serde(default)]
    pub check_host_key: bool,
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl RouterConfig {
    pub fn new(host: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            host: host.into(),
            transport,
            port: None,
            username: default_username(),
            password: None,
            key_file: None,
            key_passphrase: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            security: SecurityLevel::default(),
            check_host_key: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = Some(password.into());
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.key_file = Some(path.into());
        self.key_passphrase = passphrase;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_security(mut self, level: SecurityLevel) -> Self {
        self.security = level;
        self
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `user@host:port`, used as the log and recording identifier.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port())
    }

    /// Checks that the parameters can build a transport.
    pub fn validate(&self) -> Result<(), WrtError> {
        if self.host.trim().is_empty() {
            return Err(WrtError::InvalidConfig("host is empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(WrtError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.key_file.is_some() && self.transport != TransportKind::Ssh {
            return Err(WrtError::InvalidConfig(format!(
                "key file authentication is not available over {}",
                self.transport
            )));
        }
        let has_password = self.password.as_deref().is_some_and(|p| !p.is_empty());
        match self.transport {
            TransportKind::Ssh if !has_password && self.key_file.is_none() => Err(
                WrtError::InvalidConfig("ssh requires a password or a key file".to_string()),
            ),
            TransportKind::Telnet | TransportKind::Http if !has_password => Err(
                WrtError::InvalidConfig(format!("{} requires a password", self.transport)),
            ),
            _ => Ok(()),
        }
    }
}

/// Modern key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

/// Secure list plus SHA-1 group exchange, still common on dropbear 2016+.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
];

pub const BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1,
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

/// Everything russh can negotiate, including unauthenticated modes.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G16_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
    cipher::CLEAR,
    cipher::NONE,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::NONE,
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];
