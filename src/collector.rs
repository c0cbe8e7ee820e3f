//! Collector facade.
//!
//! [`RouterCollector`] is what callers hold: one router, one transport, one
//! merge engine. Every public operation takes the collector's async lock
//! first, so queries from concurrent tasks queue up and never interleave on
//! the transport.
//!
//! Each query starts by making sure the transport is connected. A transport
//! left `Failed` by an earlier error is reconnected here, and a failed
//! reconnect is returned to the caller. The collector never retries on its
//! own.
//!
//! ```rust,no_run
//! use wrtprobe::collector::RouterCollector;
//! use wrtprobe::config::{RouterConfig, TransportKind};
//!
//! # async fn run() -> Result<(), wrtprobe::error::WrtError> {
//! let config = RouterConfig::new("192.168.1.1", TransportKind::Ssh)
//!     .with_credentials("root", "admin");
//! let collector = RouterCollector::new(config)?;
//!
//! let report = collector.poll().await?;
//! for mac in &report.diff.newly_connected {
//!     println!("{mac} joined");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::catalog::{CatalogEntry, CommandCatalog, Query, Request, WirelessTool};
use crate::config::{RouterConfig, TransportKind};
use crate::error::{ErrorKind, WrtError};
use crate::parse::{self, PartialTable, StatusBlock};
use crate::registry::{Contribution, MergeEngine, Registry, RegistryDiff, Source, merge};
use crate::traffic::{RateMeter, TransferRates, TransferTotals};
use crate::transport::{self, ConnectionState, RecordingTransport, SessionRecorder, Transport};

/// Source of `last_seen` timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Result of one full poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub registry: Registry,
    pub diff: RegistryDiff,
    /// Tables that could not be read this cycle. Their devices are missing
    /// from `registry` unless another table saw them.
    ///
    /// Entries name the table (wireless, ARP, neighbor, lease) even over
    /// HTTP, where the records themselves are all labeled
    /// [`Source::Http`]: one status page carries several tables, and this
    /// says which of them was unreadable.
    pub failed_sources: Vec<Source>,
}

/// The tables a collector reads, in poll order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Wireless,
    Arp,
    Neighbor,
    Lease,
}

const POLL_ORDER: [Feed; 4] = [Feed::Wireless, Feed::Arp, Feed::Neighbor, Feed::Lease];

impl Feed {
    fn source(self) -> Source {
        match self {
            Feed::Wireless => Source::Wireless,
            Feed::Arp => Source::Arp,
            Feed::Neighbor => Source::Neighbor,
            Feed::Lease => Source::Lease,
        }
    }
}

/// Status pages already fetched during one query, by path.
type PageCache = BTreeMap<String, String>;

struct CollectorState {
    transport: Box<dyn Transport>,
    catalog: CommandCatalog,
    tool: Option<WirelessTool>,
    interfaces: Option<Vec<String>>,
    engine: MergeEngine,
    meter: RateMeter,
}

impl CollectorState {
    fn is_shell(&self) -> bool {
        self.catalog.kind().is_shell()
    }

    /// Tool and interfaces are properties of the running firmware; a new
    /// connection may reach a rebooted or reflashed router.
    fn forget_discovery(&mut self) {
        self.tool = None;
        self.interfaces = None;
    }

    async fn ensure_connected(&mut self) -> Result<(), WrtError> {
        let state = self.transport.state();
        if state.is_connected() {
            return Ok(());
        }
        debug!("{} is {}, connecting", self.transport.target(), state);
        self.forget_discovery();
        self.transport.connect().await
    }

    async fn run(&mut self, entry: &CatalogEntry, pages: &mut PageCache) -> Result<String, WrtError> {
        if let Request::Page(page) = &entry.request {
            if let Some(body) = pages.get(&page.path) {
                return Ok(body.clone());
            }
            let body = self.transport.run(&entry.request).await?;
            pages.insert(page.path.clone(), body.clone());
            return Ok(body);
        }
        self.transport.run(&entry.request).await
    }

    async fn wireless_tool(&mut self) -> Result<WirelessTool, WrtError> {
        if let Some(tool) = self.tool {
            return Ok(tool);
        }
        let Some(entry) = self.catalog.resolve(Query::WirelessToolProbe, &[]) else {
            return Err(transport::unsupported(
                self.catalog.kind(),
                &Request::probe(crate::catalog::WL_PROBE_CMD),
            ));
        };
        let raw = self.transport.run(&entry.request).await?;
        let tool = WirelessTool::from_probe(&raw);
        debug!("{} wireless tool: {:?}", self.transport.target(), tool);
        self.tool = Some(tool);
        Ok(tool)
    }

    /// Queries the interface list without touching the cache.
    async fn discover_interfaces(&mut self) -> Result<Vec<String>, WrtError> {
        let tool = self.wireless_tool().await?;
        let Some(entry) = self.catalog.resolve(Query::WirelessInterfaces(tool), &[]) else {
            return Ok(Vec::new());
        };
        let raw = self.transport.run(&entry.request).await?;
        Ok(parse::parse_interfaces(&raw))
    }

    async fn interfaces(&mut self) -> Result<Vec<String>, WrtError> {
        if let Some(cached) = &self.interfaces {
            return Ok(cached.clone());
        }
        let found = self.discover_interfaces().await?;
        debug!(
            "{} wireless interfaces: {:?}",
            self.transport.target(),
            found
        );
        self.interfaces = Some(found.clone());
        Ok(found)
    }

    async fn read(&mut self, feed: Feed, pages: &mut PageCache) -> Result<PartialTable, WrtError> {
        match feed {
            Feed::Wireless if self.is_shell() => {
                let tool = self.wireless_tool().await?;
                let interfaces = self.interfaces().await?;
                let Some(entry) = self.catalog.resolve(Query::Associations(tool), &interfaces)
                else {
                    debug!("{} has no wireless interfaces", self.transport.target());
                    return Ok(PartialTable::new());
                };
                let raw = self.run(&entry, pages).await?;
                Ok(parse::parse_associations(&raw, entry.framing.as_ref()))
            }
            Feed::Wireless => {
                self.read_table(
                    Query::Associations(WirelessTool::Wl),
                    pages,
                    |raw: &str| parse::parse_associations(raw, None),
                    Some(StatusBlock::ActiveWireless),
                )
                .await
            }
            Feed::Arp => {
                self.read_table(Query::Arp, pages, parse::parse_arp, Some(StatusBlock::ArpTable))
                    .await
            }
            Feed::Neighbor => {
                self.read_table(Query::Neighbors, pages, parse::parse_neighbors, None)
                    .await
            }
            Feed::Lease => {
                self.read_table(
                    Query::Leases,
                    pages,
                    parse::parse_leases,
                    Some(StatusBlock::DhcpLeases),
                )
                .await
            }
        }
    }

    /// Runs a query and parses its output with the shell grammar or, for a
    /// status page, the given data block. A query the transport cannot
    /// answer reads as an empty table.
    async fn read_table(
        &mut self,
        query: Query,
        pages: &mut PageCache,
        shell_grammar: fn(&str) -> PartialTable,
        block: Option<StatusBlock>,
    ) -> Result<PartialTable, WrtError> {
        let Some(entry) = self.catalog.resolve(query, &[]) else {
            return Ok(PartialTable::new());
        };
        let raw = self.run(&entry, pages).await?;
        match (&entry.request, block) {
            (Request::Page(_), Some(block)) => parse::parse_status_page(&raw, block),
            _ => Ok(shell_grammar(&raw)),
        }
    }

    async fn counter(&mut self, query: Query) -> Result<u64, WrtError> {
        let Some(entry) = self.catalog.resolve(query, &[]) else {
            return Err(WrtError::UnsupportedRequest {
                transport: self.catalog.kind().to_string(),
                request: format!("{query:?}"),
            });
        };
        let raw = self.transport.run(&entry.request).await?;
        parse::parse_counter(&raw)
    }

    async fn transfer_totals(
        &mut self,
        observed_at: DateTime<Utc>,
    ) -> Result<TransferTotals, WrtError> {
        let rx_bytes = self.counter(Query::RxBytes).await?;
        let tx_bytes = self.counter(Query::TxBytes).await?;
        Ok(TransferTotals {
            rx_bytes,
            tx_bytes,
            observed_at,
        })
    }

    /// Label under which a feed's records enter the merge.
    fn source_of(&self, feed: Feed) -> Source {
        if self.is_shell() {
            feed.source()
        } else {
            Source::Http
        }
    }
}

/// Collects device presence from one router.
pub struct RouterCollector {
    target: String,
    kind: TransportKind,
    clock: Clock,
    state: Mutex<CollectorState>,
}

impl RouterCollector {
    /// Builds a collector and its transport from `config`.
    ///
    /// Nothing is sent to the router until the first query.
    pub fn new(config: RouterConfig) -> Result<Self, WrtError> {
        let transport = transport::build_transport(&config)?;
        Ok(Self::with_transport(transport))
    }

    /// Like [`RouterCollector::new`], recording the session into `recorder`.
    pub fn with_recorder(config: RouterConfig, recorder: SessionRecorder) -> Result<Self, WrtError> {
        let transport = transport::build_transport(&config)?;
        Ok(Self::with_transport(Box::new(RecordingTransport::new(
            transport, recorder,
        ))))
    }

    /// Wraps an existing transport, for instance a
    /// [`ReplayTransport`](crate::transport::ReplayTransport).
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        let kind = transport.kind();
        Self {
            target: transport.target().to_string(),
            kind,
            clock: Arc::new(Utc::now),
            state: Mutex::new(CollectorState {
                transport,
                catalog: CommandCatalog::new(kind),
                tool: None,
                interfaces: None,
                engine: MergeEngine::new(),
                meter: RateMeter::default(),
            }),
        }
    }

    /// Replaces the clock that stamps `last_seen`.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Minimum spacing between the counter readings a transfer rate is
    /// computed from. Defaults to
    /// [`DEFAULT_RATE_INTERVAL`](crate::traffic::DEFAULT_RATE_INTERVAL).
    pub fn with_rate_interval(mut self, interval: Duration) -> Self {
        self.state.get_mut().meter = RateMeter::new(interval);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Current transport state. Waits for any running query.
    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.transport.state()
    }

    /// Connects now instead of on the first query. No-op when connected.
    pub async fn connect(&self) -> Result<(), WrtError> {
        self.state.lock().await.ensure_connected().await
    }

    pub async fn disconnect(&self) -> Result<(), WrtError> {
        let mut state = self.state.lock().await;
        state.forget_discovery();
        state.transport.disconnect().await
    }

    /// Clients associated to any radio.
    pub async fn get_wireless_clients(&self) -> Result<Registry, WrtError> {
        self.single(Feed::Wireless).await
    }

    pub async fn get_arp(&self) -> Result<Registry, WrtError> {
        self.single(Feed::Arp).await
    }

    /// Neighbor table. Empty over HTTP, which does not expose one.
    pub async fn get_neighbors(&self) -> Result<Registry, WrtError> {
        self.single(Feed::Neighbor).await
    }

    pub async fn get_leases(&self) -> Result<Registry, WrtError> {
        self.single(Feed::Lease).await
    }

    /// Full merged view. Runs a poll cycle and drops the diff.
    pub async fn get_all(&self) -> Result<Registry, WrtError> {
        Ok(self.poll().await?.registry)
    }

    /// Registry produced by the last poll cycle, without touching the router.
    pub async fn last_registry(&self) -> Registry {
        self.state.lock().await.engine.registry().clone()
    }

    /// Runs one full cycle: reads every source, merges, diffs against the
    /// previous cycle and keeps the result as the new baseline.
    ///
    /// A source whose output cannot be read at all is listed in
    /// [`PollReport::failed_sources`] and the others still contribute.
    /// Connection and command failures abort the cycle and leave the
    /// baseline untouched.
    pub async fn poll(&self) -> Result<PollReport, WrtError> {
        let mut state = self.state.lock().await;
        state.ensure_connected().await?;

        let mut pages = PageCache::new();
        let mut tables = Vec::with_capacity(POLL_ORDER.len());
        let mut failed_sources = Vec::new();
        for feed in POLL_ORDER {
            match state.read(feed, &mut pages).await {
                Ok(table) => tables.push((feed, table)),
                Err(e) if e.kind() == ErrorKind::Parse => {
                    warn!("{} {:?} source unreadable: {}", self.target, feed, e);
                    failed_sources.push(feed.source());
                }
                Err(e) => return Err(e),
            }
        }

        let contributions = if state.is_shell() {
            tables
                .into_iter()
                .map(|(feed, table)| Contribution::new(feed.source(), table))
                .collect::<Vec<_>>()
        } else {
            // Web UI tables all carry the same label, so layer them here in
            // poll order: leases override the ARP block.
            let mut combined = PartialTable::new();
            for (_, table) in tables {
                combined.overlay(table);
            }
            vec![Contribution::new(Source::Http, combined)]
        };

        let report = state.engine.merge_cycle(&contributions, (self.clock)());
        Ok(PollReport {
            registry: report.registry,
            diff: report.diff,
            failed_sources,
        })
    }

    /// Reads the cumulative WAN byte counters. Shell transports only; the
    /// web UI status pages carry no counters.
    pub async fn get_transfer_totals(&self) -> Result<TransferTotals, WrtError> {
        let mut state = self.state.lock().await;
        state.ensure_connected().await?;
        state.transfer_totals((self.clock)()).await
    }

    /// Reads the counters and returns WAN rates in bytes per second.
    ///
    /// The first call only records a baseline and returns zero rates. Calls
    /// closer than the rate interval to the baseline return the previous
    /// rates.
    pub async fn get_transfer_rates(&self) -> Result<TransferRates, WrtError> {
        let mut state = self.state.lock().await;
        state.ensure_connected().await?;
        let totals = state.transfer_totals((self.clock)()).await?;
        Ok(state.meter.update(totals))
    }

    /// Re-queries the wireless interfaces, replacing the cached set when it
    /// changed. Returns the current set; always empty over HTTP.
    pub async fn refresh_interfaces(&self) -> Result<Vec<String>, WrtError> {
        let mut state = self.state.lock().await;
        state.ensure_connected().await?;
        if !state.is_shell() {
            return Ok(Vec::new());
        }
        let found = state.discover_interfaces().await?;
        let changed = match &state.interfaces {
            Some(cached) => {
                cached.iter().collect::<BTreeSet<_>>() != found.iter().collect::<BTreeSet<_>>()
            }
            None => true,
        };
        if changed {
            debug!("{} interface set now {:?}", self.target, found);
            state.interfaces = Some(found.clone());
        }
        Ok(found)
    }

    /// One source merged on its own. Leaves the poll baseline alone.
    async fn single(&self, feed: Feed) -> Result<Registry, WrtError> {
        let mut state = self.state.lock().await;
        state.ensure_connected().await?;
        let mut pages = PageCache::new();
        let table = state.read(feed, &mut pages).await?;
        let source = state.source_of(feed);
        Ok(merge(&[Contribution::new(source, table)], (self.clock)()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ShellCommand;
    use crate::mac::MacAddress;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    /// Answers requests from a shared table. Unknown requests, and requests
    /// listed in `exit_failures` that do not tolerate failure, fail like a
    /// non-zero exit.
    struct ScriptedRouter {
        kind: TransportKind,
        state: ConnectionState,
        outputs: Arc<StdMutex<BTreeMap<String, String>>>,
        exit_failures: Arc<StdMutex<BTreeSet<String>>>,
        connects: Arc<AtomicUsize>,
        refuse_connect: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl Transport for ScriptedRouter {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn target(&self) -> &str {
            "root@192.168.1.1:22"
        }
        fn state(&self) -> ConnectionState {
            self.state
        }
        async fn connect(&mut self) -> Result<(), WrtError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if *self.refuse_connect.lock().unwrap() {
                self.state = ConnectionState::Failed;
                return Err(WrtError::ConnectionError("connection refused".into()));
            }
            self.state = ConnectionState::Connected;
            Ok(())
        }
        async fn run(&mut self, request: &Request) -> Result<String, WrtError> {
            let output = self.outputs.lock().unwrap().get(request.text()).cloned();
            let exited_non_zero = self.exit_failures.lock().unwrap().contains(request.text());
            let tolerant = matches!(
                request,
                Request::Shell(ShellCommand {
                    tolerate_failure: true,
                    ..
                })
            );
            match output {
                Some(output) if !exited_non_zero || tolerant => Ok(output),
                _ => {
                    self.state = ConnectionState::Failed;
                    Err(WrtError::CommandError(format!("{} failed", request.text())))
                }
            }
        }
        async fn disconnect(&mut self) -> Result<(), WrtError> {
            self.state = ConnectionState::Disconnected;
            Ok(())
        }
    }

    struct Harness {
        collector: RouterCollector,
        outputs: Arc<StdMutex<BTreeMap<String, String>>>,
        exit_failures: Arc<StdMutex<BTreeSet<String>>>,
        connects: Arc<AtomicUsize>,
        refuse_connect: Arc<StdMutex<bool>>,
    }

    const ASSOC_SCRIPT: &str = "echo '@@iface=eth1'; wl -i eth1 assoclist 2>&1; echo '@@iface=eth2'; wl -i eth2 assoclist 2>&1";

    fn shell_outputs() -> BTreeMap<String, String> {
        [
            ("wl ver", "6.37.14.126 (r561982)\nwl0: Oct  2 2020 version 6.37.14.126\n"),
            (
                "nvram show 2> /dev/null | grep 'wl._ifname'",
                "wl0_ifname=eth1\nwl1_ifname=eth2\n",
            ),
            (
                ASSOC_SCRIPT,
                "@@iface=eth1\nassoclist AA:BB:CC:DD:EE:01\n@@iface=eth2\nassoclist AA:BB:CC:DD:EE:02\n",
            ),
            ("arp -n", "? (192.168.1.10) at aa:bb:cc:dd:ee:01 [ether]  on br0\n"),
            (
                "ip neigh",
                "192.168.1.11 dev br0 lladdr aa:bb:cc:dd:ee:02 REACHABLE\n192.168.1.99 dev br0  FAILED\n",
            ),
            (
                "cat /tmp/dnsmasq.leases",
                "1700000000 aa:bb:cc:dd:ee:01 192.168.1.10 phone 01:aa:bb:cc:dd:ee:01\n0 aa:bb:cc:dd:ee:03 192.168.1.12 * *\n",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn harness(kind: TransportKind, outputs: BTreeMap<String, String>) -> Harness {
        let outputs = Arc::new(StdMutex::new(outputs));
        let exit_failures = Arc::new(StdMutex::new(BTreeSet::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let refuse_connect = Arc::new(StdMutex::new(false));
        let transport = ScriptedRouter {
            kind,
            state: ConnectionState::Disconnected,
            outputs: outputs.clone(),
            exit_failures: exit_failures.clone(),
            connects: connects.clone(),
            refuse_connect: refuse_connect.clone(),
        };
        let fixed = DateTime::<Utc>::from_timestamp(1_700_000_500, 0).unwrap();
        Harness {
            collector: RouterCollector::with_transport(Box::new(transport)).with_clock(move || fixed),
            outputs,
            exit_failures,
            connects,
            refuse_connect,
        }
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn get_all_merges_every_shell_source() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        let registry = h.collector.get_all().await.unwrap();

        assert_eq!(registry.len(), 3);
        let phone = registry.get(&mac("aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(phone.ip, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(phone.hostname.as_deref(), Some("phone"));
        assert_eq!(phone.interface.as_deref(), Some("eth1"));
        assert_eq!(phone.source, Source::Lease);
        assert!(phone.lease_expires.is_some());

        let tablet = registry.get(&mac("aa:bb:cc:dd:ee:02")).unwrap();
        assert_eq!(tablet.ip, Some("192.168.1.11".parse().unwrap()));
        assert_eq!(tablet.interface.as_deref(), Some("eth2"));
        assert_eq!(tablet.source, Source::Neighbor);

        let printer = registry.get(&mac("aa:bb:cc:dd:ee:03")).unwrap();
        assert_eq!(printer.hostname, None);
        assert_eq!(printer.lease_expires, None);
    }

    #[tokio::test]
    async fn get_all_twice_is_idempotent() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        let first = h.collector.poll().await.unwrap();
        assert_eq!(first.diff.newly_connected.len(), 3);

        let second = h.collector.poll().await.unwrap();
        assert_eq!(first.registry, second.registry);
        assert!(second.diff.is_unchanged());
        assert_eq!(second.diff.still_connected.len(), 3);
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_reports_departures() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        h.collector.poll().await.unwrap();

        h.outputs
            .lock()
            .unwrap()
            .insert("cat /tmp/dnsmasq.leases".into(), String::new());
        let report = h.collector.poll().await.unwrap();
        assert_eq!(
            report.diff.disconnected,
            [mac("aa:bb:cc:dd:ee:03")].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(report.diff.newly_connected.is_empty());
    }

    #[tokio::test]
    async fn single_source_queries_do_not_move_the_baseline() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        let leases = h.collector.get_leases().await.unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases.values().all(|r| r.source == Source::Lease));

        let arp = h.collector.get_arp().await.unwrap();
        assert_eq!(arp.len(), 1);

        assert!(h.collector.last_registry().await.is_empty());
        let report = h.collector.poll().await.unwrap();
        assert_eq!(report.diff.newly_connected.len(), 3);
    }

    #[tokio::test]
    async fn command_failure_leaves_transport_failed_and_next_query_reconnects() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        h.collector.get_arp().await.unwrap();

        h.outputs.lock().unwrap().remove("arp -n");
        let err = h.collector.get_arp().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command);
        assert_eq!(h.collector.state().await, ConnectionState::Failed);

        h.outputs
            .lock()
            .unwrap()
            .insert("arp -n".into(), String::new());
        assert!(h.collector.get_arp().await.unwrap().is_empty());
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.collector.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_reconnect_is_surfaced() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        *h.refuse_connect.lock().unwrap() = true;
        let err = h.collector.get_all().await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(h.collector.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn interface_cache_survives_queries_until_refresh() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        h.collector.get_wireless_clients().await.unwrap();

        h.outputs.lock().unwrap().insert(
            "nvram show 2> /dev/null | grep 'wl._ifname'".into(),
            "wl0_ifname=eth1\n".into(),
        );
        // Cached set still drives the association script.
        let clients = h.collector.get_wireless_clients().await.unwrap();
        assert_eq!(clients.len(), 2);

        let refreshed = h.collector.refresh_interfaces().await.unwrap();
        assert_eq!(refreshed, vec!["eth1".to_string()]);
        h.outputs.lock().unwrap().insert(
            "echo '@@iface=eth1'; wl -i eth1 assoclist 2>&1".into(),
            "@@iface=eth1\nassoclist AA:BB:CC:DD:EE:01\n".into(),
        );
        let clients = h.collector.get_wireless_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
    }

    #[tokio::test]
    async fn unsafe_interface_names_are_never_interpolated() {
        let mut outputs = shell_outputs();
        outputs.insert(
            "nvram show 2> /dev/null | grep 'wl._ifname'".into(),
            "wl0_ifname=eth1;reboot\n".into(),
        );
        let h = harness(TransportKind::Ssh, outputs);
        let clients = h.collector.get_wireless_clients().await.unwrap();
        assert!(clients.is_empty());
        assert!(h.collector.refresh_interfaces().await.unwrap().is_empty());
    }

    const LAN_PAGE: &str = "{lan_ip::192.168.1.1}\n{dhcp_leases:: 'phone','192.168.1.10','aa:bb:cc:dd:ee:01','1 day 00:00:00','113'}\n{arp_table:: 'phone-arp','192.168.1.10','aa:bb:cc:dd:ee:01','13','tv','192.168.1.20','aa:bb:cc:dd:ee:04','1'}\n";
    const WIRELESS_PAGE: &str = "{active_wireless::'aa:bb:cc:dd:ee:01','eth1','3:13:14','72M','24M','HT20','-9','-92','83','1048'}\n";

    fn http_outputs(wireless: &str) -> BTreeMap<String, String> {
        [("Status_Lan.live.asp", LAN_PAGE), ("Status_Wireless.live.asp", wireless)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn http_poll_combines_pages_under_one_label() {
        let h = harness(TransportKind::Http, http_outputs(WIRELESS_PAGE));
        let report = h.collector.poll().await.unwrap();
        assert!(report.failed_sources.is_empty());
        assert_eq!(report.registry.len(), 2);

        let phone = report.registry.get(&mac("aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(phone.hostname.as_deref(), Some("phone"));
        assert_eq!(phone.interface.as_deref(), Some("eth1"));
        assert_eq!(phone.source, Source::Http);

        assert!(h.collector.get_neighbors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_page_only_fails_its_source() {
        let h = harness(TransportKind::Http, http_outputs("<html>session expired</html>"));
        let report = h.collector.poll().await.unwrap();
        assert_eq!(report.failed_sources, vec![Source::Wireless]);
        assert_eq!(report.registry.len(), 2);

        let err = h.collector.get_wireless_clients().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn last_seen_comes_from_the_clock() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        let registry = h.collector.get_all().await.unwrap();
        let expected = DateTime::<Utc>::from_timestamp(1_700_000_500, 0).unwrap();
        assert!(registry.values().all(|r| r.last_seen == expected));
    }

    #[tokio::test]
    async fn disabled_last_radio_does_not_sink_the_wireless_source() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        h.outputs.lock().unwrap().insert(
            ASSOC_SCRIPT.into(),
            "@@iface=eth1\nassoclist AA:BB:CC:DD:EE:01\n@@iface=eth2\nwl: wl driver adapter not found\n"
                .into(),
        );
        // Status of the script is the failing last section's.
        h.exit_failures
            .lock()
            .unwrap()
            .insert(ASSOC_SCRIPT.to_string());

        let report = h.collector.poll().await.unwrap();
        assert!(report.failed_sources.is_empty());
        let phone = report.registry.get(&mac("aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(phone.interface.as_deref(), Some("eth1"));
        assert_eq!(h.collector.state().await, ConnectionState::Connected);

        let wireless = h.collector.get_wireless_clients().await.unwrap();
        assert_eq!(wireless.len(), 1);
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_tolerant_exit_failure_still_aborts_the_cycle() {
        let h = harness(TransportKind::Ssh, shell_outputs());
        h.exit_failures.lock().unwrap().insert("arp -n".to_string());
        let err = h.collector.poll().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command);
        assert!(h.collector.last_registry().await.is_empty());
    }

    #[tokio::test]
    async fn failed_sources_name_the_unreadable_table_over_http() {
        let lan_without_arp = "{lan_ip::192.168.1.1}\n{dhcp_leases:: 'phone','192.168.1.10','aa:bb:cc:dd:ee:01','1 day 00:00:00','113'}\n";
        let mut outputs = http_outputs(WIRELESS_PAGE);
        outputs.insert("Status_Lan.live.asp".into(), lan_without_arp.into());
        let h = harness(TransportKind::Http, outputs);

        let report = h.collector.poll().await.unwrap();
        assert_eq!(report.failed_sources, vec![Source::Arp]);
        assert_eq!(report.registry.len(), 1);
        let phone = report.registry.get(&mac("aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(phone.source, Source::Http);
        assert_eq!(phone.hostname.as_deref(), Some("phone"));
    }

    fn with_counters(mut outputs: BTreeMap<String, String>, rx: u64, tx: u64) -> BTreeMap<String, String> {
        outputs.insert(
            "cat /sys/class/net/eth0/statistics/rx_bytes".into(),
            format!("{rx}\n"),
        );
        outputs.insert(
            "cat /sys/class/net/eth0/statistics/tx_bytes".into(),
            format!("{tx}\n"),
        );
        outputs
    }

    #[tokio::test]
    async fn transfer_totals_are_stamped_by_the_clock() {
        let h = harness(TransportKind::Telnet, with_counters(shell_outputs(), 1_849_283_741, 92_113));
        let totals = h.collector.get_transfer_totals().await.unwrap();
        assert_eq!(totals.rx_bytes, 1_849_283_741);
        assert_eq!(totals.tx_bytes, 92_113);
        assert_eq!(
            totals.observed_at,
            DateTime::<Utc>::from_timestamp(1_700_000_500, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn transfer_rates_follow_the_clock() {
        let h = harness(TransportKind::Ssh, with_counters(shell_outputs(), 1_000, 500));
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let clock = now.clone();
        let collector = h
            .collector
            .with_clock(move || {
                DateTime::<Utc>::from_timestamp(clock.load(Ordering::SeqCst), 0).unwrap()
            })
            .with_rate_interval(Duration::from_secs(30));
        let set_counters = |rx: u64, tx: u64| {
            let mut outputs = h.outputs.lock().unwrap();
            let current = std::mem::take(&mut *outputs);
            *outputs = with_counters(current, rx, tx);
        };

        assert_eq!(
            collector.get_transfer_rates().await.unwrap(),
            TransferRates::default()
        );

        now.fetch_add(10, Ordering::SeqCst);
        set_counters(900_000, 900_000);
        assert_eq!(
            collector.get_transfer_rates().await.unwrap(),
            TransferRates::default()
        );

        now.fetch_add(50, Ordering::SeqCst);
        set_counters(61_000, 6_500);
        let rates = collector.get_transfer_rates().await.unwrap();
        assert_eq!(rates.rx_bytes_per_sec, 1_000);
        assert_eq!(rates.tx_bytes_per_sec, 100);
        assert_eq!(rates.human_readable().1, "100 B/s");
    }

    #[tokio::test]
    async fn unreadable_counter_is_a_parse_error() {
        let mut outputs = with_counters(shell_outputs(), 0, 0);
        outputs.insert(
            "cat /sys/class/net/eth0/statistics/rx_bytes".into(),
            "cat: can't open '/sys/class/net/eth0/statistics/rx_bytes'\n".into(),
        );
        let h = harness(TransportKind::Ssh, outputs);
        let err = h.collector.get_transfer_totals().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn http_has_no_traffic_counters() {
        let h = harness(TransportKind::Http, http_outputs(WIRELESS_PAGE));
        let err = h.collector.get_transfer_rates().await.unwrap_err();
        assert!(matches!(err, WrtError::UnsupportedRequest { .. }));
    }
}
