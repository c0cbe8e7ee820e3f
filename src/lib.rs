//! # wrtprobe - Device presence collector for DD-WRT routers
//!
//! `wrtprobe` logs into a DD-WRT router over SSH, Telnet or the web UI,
//! reads the tables that say which devices are around (wireless
//! associations, ARP, IPv6/IPv4 neighbors, DHCP leases) and merges them into
//! one registry keyed by MAC address. Consecutive polls are diffed so callers
//! learn who joined and who left.
//!
//! ## Features
//!
//! - **Three transports**: SSH (with legacy dropbear algorithm profiles),
//!   Telnet and the `*.live.asp` status pages of the web UI
//! - **Firmware detection**: Broadcom `wl` and mac80211 `iw` builds
//! - **Tolerant parsers**: malformed lines are skipped, never fatal
//! - **Deterministic merge**: field-by-field precedence between sources
//! - **Session recording**: JSONL capture and offline replay of a session
//! - **WAN traffic**: byte counters and per-second transfer rates
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wrtprobe::collector::RouterCollector;
//! use wrtprobe::config::{RouterConfig, TransportKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::new("192.168.1.1", TransportKind::Ssh)
//!         .with_credentials("root", "admin");
//!     let collector = RouterCollector::new(config)?;
//!
//!     for (mac, device) in &collector.get_all().await? {
//!         println!("{mac} {:?} {:?}", device.ip, device.hostname);
//!     }
//!     collector.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`collector::RouterCollector`] - Facade: queries, polls and diffs
//! - [`transport::Transport`] - Connection to one router
//! - [`catalog::CommandCatalog`] - Logical query to command or page
//! - [`parse`] - Output grammars
//! - [`registry::MergeEngine`] - Merge and diff of partial views
//! - [`traffic::RateMeter`] - Transfer rates from counter readings
//! - [`error::WrtError`] - Error types
//! - [`config`] - Connection parameters and SSH algorithm profiles

pub mod catalog;
pub mod collector;
pub mod config;
pub mod error;
pub mod mac;
pub mod parse;
pub mod registry;
pub mod traffic;
pub mod transport;
