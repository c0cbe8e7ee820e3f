//! WAN traffic counters and transfer rates.
//!
//! The router keeps cumulative byte counters for its WAN port under
//! `/sys/class/net`. A [`RateMeter`] turns successive readings into
//! per-second rates. Rates are only recomputed once the readings are far
//! enough apart to smooth out bursts; closer readings return the last rates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default minimum spacing between the two readings a rate is built from.
pub const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(30);

/// One reading of the WAN byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub observed_at: DateTime<Utc>,
}

/// Transfer rates in bytes per second, rounded up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferRates {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
}

impl TransferRates {
    /// `(rx, tx)` formatted for display, e.g. `("1.5 KiB/s", "0 B/s")`.
    pub fn human_readable(&self) -> (String, String) {
        (
            format_rate(self.rx_bytes_per_sec),
            format_rate(self.tx_bytes_per_sec),
        )
    }
}

/// Formats a rate in bytes per second with binary units.
pub fn format_rate(bytes_per_sec: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    if bytes_per_sec >= GIB {
        format!("{:.1} GiB/s", bytes_per_sec as f64 / GIB as f64)
    } else if bytes_per_sec >= MIB {
        format!("{:.1} MiB/s", bytes_per_sec as f64 / MIB as f64)
    } else if bytes_per_sec >= KIB {
        format!("{:.1} KiB/s", bytes_per_sec as f64 / KIB as f64)
    } else {
        format!("{bytes_per_sec} B/s")
    }
}

/// Bytes moved between two readings of one counter. A counter that went
/// down wrapped or was reset by a reboot, so all of its current value is new.
fn counter_delta(previous: u64, current: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

fn per_second(bytes: u64, elapsed: Duration) -> u64 {
    (bytes as f64 / elapsed.as_secs_f64()).ceil() as u64
}

/// Turns counter readings into rates.
#[derive(Debug, Clone)]
pub struct RateMeter {
    min_interval: Duration,
    baseline: Option<TransferTotals>,
    latest: TransferRates,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_INTERVAL)
    }
}

impl RateMeter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            baseline: None,
            latest: TransferRates::default(),
        }
    }

    /// Rates from the last completed measurement; zero before the first.
    pub fn rates(&self) -> TransferRates {
        self.latest
    }

    /// Feeds one reading and returns the current rates.
    ///
    /// The first reading only sets the baseline. A reading less than the
    /// minimum interval after the baseline leaves both baseline and rates
    /// alone. A reading older than the baseline (clock stepped back)
    /// becomes the new baseline.
    pub fn update(&mut self, sample: TransferTotals) -> TransferRates {
        let Some(base) = self.baseline else {
            self.baseline = Some(sample);
            return self.latest;
        };
        let Ok(elapsed) = (sample.observed_at - base.observed_at).to_std() else {
            log::debug!("counter reading predates the baseline, restarting");
            self.baseline = Some(sample);
            return self.latest;
        };
        if elapsed.is_zero() || elapsed < self.min_interval {
            return self.latest;
        }

        self.latest = TransferRates {
            rx_bytes_per_sec: per_second(counter_delta(base.rx_bytes, sample.rx_bytes), elapsed),
            tx_bytes_per_sec: per_second(counter_delta(base.tx_bytes, sample.tx_bytes), elapsed),
        };
        self.baseline = Some(sample);
        self.latest
    }

    /// Forgets the baseline and the last rates.
    pub fn reset(&mut self) {
        self.baseline = None;
        self.latest = TransferRates::default();
    }
}
