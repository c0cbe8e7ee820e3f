//! Polls a router every 30 seconds and prints who joined and who left.
//!
//! ```text
//! WRT_HOST=192.168.1.1 WRT_PASSWORD=admin cargo run --example poll_loop
//! ```
//!
//! `WRT_TRANSPORT` picks `ssh` (default), `telnet` or `http`.

use std::time::Duration;

use anyhow::Context;
use wrtprobe::collector::RouterCollector;
use wrtprobe::config::{RouterConfig, SecurityLevel, TransportKind};

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let host = std::env::var("WRT_HOST").unwrap_or_else(|_| "192.168.1.1".to_string());
    let password = std::env::var("WRT_PASSWORD").context("WRT_PASSWORD is not set")?;
    let username = std::env::var("WRT_USER").unwrap_or_else(|_| "root".to_string());
    let transport: TransportKind = std::env::var("WRT_TRANSPORT")
        .unwrap_or_else(|_| "ssh".to_string())
        .parse()?;

    let config = RouterConfig::new(host, transport)
        .with_credentials(username, password)
        .with_security(SecurityLevel::LegacyCompatible);
    let collector = RouterCollector::new(config)?;
    println!("polling {} over {}", collector.target(), collector.kind());

    loop {
        match collector.poll().await {
            Ok(report) => {
                for mac in &report.diff.newly_connected {
                    let device = report.registry.get(mac);
                    let ip = device.and_then(|d| d.ip).map(|ip| ip.to_string());
                    let name = device.and_then(|d| d.hostname.clone());
                    println!(
                        "+ {mac} {} {}",
                        ip.unwrap_or_else(|| "-".to_string()),
                        name.unwrap_or_else(|| "-".to_string())
                    );
                }
                for mac in &report.diff.disconnected {
                    println!("- {mac}");
                }
                for source in &report.failed_sources {
                    eprintln!("source {source:?} unreadable this cycle");
                }
                if collector.kind().is_shell() {
                    match collector.get_transfer_rates().await {
                        Ok(rates) => {
                            let (rx, tx) = rates.human_readable();
                            println!("wan rx {rx} tx {tx}");
                        }
                        Err(e) => eprintln!("traffic counters unavailable: {e}"),
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) if e.is_connection() => {
                eprintln!("router unreachable ({e}), retrying in {RETRY_DELAY:?}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                eprintln!("poll failed: {e}");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}
