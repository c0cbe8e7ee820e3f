//! Command catalog.
//!
//! Maps the collector's logical queries onto the literal shell commands or
//! status-page paths each transport understands. The catalog performs no
//! I/O. Per-interface association dumps are assembled into one script whose
//! sections are introduced by a marker line; the marker contract travels to
//! the parser as an [`InterfaceFraming`] value instead of an implicit string
//! convention.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::TransportKind;
use crate::parse::is_valid_interface_name;

/// Detects which wireless userland the firmware ships.
pub const WL_PROBE_CMD: &str = "wl ver";
/// Broadcom builds keep radio interface names in `wlN_ifname` nvram keys.
pub const WL_IFNAMES_CMD: &str = "nvram show 2> /dev/null | grep 'wl._ifname'";
/// mac80211 builds list radios through `iw dev`.
pub const IW_IFNAMES_CMD: &str = "iw dev | grep Interface";
pub const ARP_CMD: &str = "arp -n";
pub const NEIGH_CMD: &str = "ip neigh";
pub const LEASES_CMD: &str = "cat /tmp/dnsmasq.leases";
/// Cumulative WAN counters.
pub const RX_BYTES_CMD: &str = "cat /sys/class/net/eth0/statistics/rx_bytes";
pub const TX_BYTES_CMD: &str = "cat /sys/class/net/eth0/statistics/tx_bytes";

pub const WIRELESS_STATUS_PAGE: &str = "Status_Wireless.live.asp";
pub const LAN_STATUS_PAGE: &str = "Status_Lan.live.asp";

/// Prefix of the line that opens each interface's section.
pub const IFACE_MARKER_PREFIX: &str = "@@iface=";

/// Wireless userland flavor, which decides the per-interface commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WirelessTool {
    /// Broadcom proprietary driver, `wl` utility.
    Wl,
    /// mac80211 drivers, `iw` utility.
    Iw,
}

impl WirelessTool {
    /// Interprets the output of [`WL_PROBE_CMD`].
    ///
    /// A working `wl` prints a driver line containing `version`; on mac80211
    /// builds the command is missing and prints an error instead.
    pub fn from_probe(output: &str) -> WirelessTool {
        if output
            .lines()
            .any(|line| line.contains("version") && !line.contains("not found"))
        {
            WirelessTool::Wl
        } else {
            WirelessTool::Iw
        }
    }

    fn association_command(self, interface: &str) -> String {
        match self {
            WirelessTool::Wl => format!("wl -i {interface} assoclist"),
            WirelessTool::Iw => format!("iw dev {interface} station dump"),
        }
    }
}

/// Logical queries the collector issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    WirelessToolProbe,
    WirelessInterfaces(WirelessTool),
    Associations(WirelessTool),
    Arp,
    Neighbors,
    Leases,
    RxBytes,
    TxBytes,
}

/// A shell command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ShellCommand {
    pub command: String,
    /// A non-zero exit returns the output instead of failing. Used for
    /// probes whose failure is itself the answer.
    #[serde(default)]
    pub tolerate_failure: bool,
}

/// A status page fetched from the web UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PageRequest {
    pub path: String,
}

/// What a transport is asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Shell(ShellCommand),
    Page(PageRequest),
}

impl Request {
    pub fn shell(command: impl Into<String>) -> Self {
        Request::Shell(ShellCommand {
            command: command.into(),
            tolerate_failure: false,
        })
    }

    pub fn probe(command: impl Into<String>) -> Self {
        Request::Shell(ShellCommand {
            command: command.into(),
            tolerate_failure: true,
        })
    }

    pub fn page(path: impl Into<String>) -> Self {
        Request::Page(PageRequest { path: path.into() })
    }

    /// Command line or page path, used for logging and replay lookup.
    pub fn text(&self) -> &str {
        match self {
            Request::Shell(cmd) => &cmd.command,
            Request::Page(page) => &page.path,
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Shell(cmd) => write!(f, "shell `{}`", cmd.command),
            Request::Page(page) => write!(f, "page /{}", page.path),
        }
    }
}

/// Interface-section contract between the association script and its parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceFraming {
    interfaces: Vec<String>,
}

impl InterfaceFraming {
    /// Builds framing for the given interfaces. Names that are not safe
    /// shell tokens are dropped.
    pub fn new<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept: Vec<String> = Vec::new();
        for name in interfaces {
            let name = name.as_ref();
            if !is_valid_interface_name(name) {
                log::warn!("refusing to frame unsafe interface name {name:?}");
                continue;
            }
            if !kept.iter().any(|k| k == name) {
                kept.push(name.to_string());
            }
        }
        Self { interfaces: kept }
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// The marker line printed before `interface`'s output.
    pub fn marker_line(interface: &str) -> String {
        format!("{IFACE_MARKER_PREFIX}{interface}")
    }

    /// If `line` is a marker for a framed interface, returns that interface.
    pub fn interface_of<'a>(&'a self, line: &str) -> Option<&'a str> {
        let name = line.trim().strip_prefix(IFACE_MARKER_PREFIX)?;
        self.interfaces
            .iter()
            .find(|framed| framed.as_str() == name)
            .map(String::as_str)
    }

    /// One shell script that dumps every interface's associations, each
    /// section preceded by its marker line.
    ///
    /// Driver errors go to stdout, into the failing interface's section. The
    /// script's exit status is only the last section's, so it carries no
    /// meaning and the catalog marks the request failure-tolerant.
    pub fn script(&self, tool: WirelessTool) -> String {
        self.interfaces
            .iter()
            .map(|iface| {
                format!(
                    "echo '{}'; {} 2>&1",
                    Self::marker_line(iface),
                    tool.association_command(iface)
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A resolved catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub request: Request,
    /// Present when the output is split into interface sections.
    pub framing: Option<InterfaceFraming>,
}

impl CatalogEntry {
    fn plain(request: Request) -> Self {
        Self {
            request,
            framing: None,
        }
    }
}

/// Per-transport command catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCatalog {
    kind: TransportKind,
}

impl CommandCatalog {
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Resolves a logical query.
    ///
    /// Returns `None` when the transport has no way to answer the query
    /// (the web UI exposes no neighbor table, for instance) or when an
    /// association dump is requested with no usable interfaces.
    pub fn resolve(&self, query: Query, interfaces: &[String]) -> Option<CatalogEntry> {
        if self.kind.is_shell() {
            Self::resolve_shell(query, interfaces)
        } else {
            Self::resolve_http(query)
        }
    }

    fn resolve_shell(query: Query, interfaces: &[String]) -> Option<CatalogEntry> {
        let entry = match query {
            Query::WirelessToolProbe => CatalogEntry::plain(Request::probe(WL_PROBE_CMD)),
            Query::WirelessInterfaces(WirelessTool::Wl) => {
                CatalogEntry::plain(Request::probe(WL_IFNAMES_CMD))
            }
            Query::WirelessInterfaces(WirelessTool::Iw) => {
                CatalogEntry::plain(Request::probe(IW_IFNAMES_CMD))
            }
            Query::Associations(tool) => {
                let framing = InterfaceFraming::new(interfaces);
                if framing.is_empty() {
                    return None;
                }
                CatalogEntry {
                    request: Request::probe(framing.script(tool)),
                    framing: Some(framing),
                }
            }
            Query::Arp => CatalogEntry::plain(Request::shell(ARP_CMD)),
            Query::Neighbors => CatalogEntry::plain(Request::shell(NEIGH_CMD)),
            Query::Leases => CatalogEntry::plain(Request::shell(LEASES_CMD)),
            Query::RxBytes => CatalogEntry::plain(Request::shell(RX_BYTES_CMD)),
            Query::TxBytes => CatalogEntry::plain(Request::shell(TX_BYTES_CMD)),
        };
        Some(entry)
    }

    fn resolve_http(query: Query) -> Option<CatalogEntry> {
        match query {
            Query::Associations(_) => Some(CatalogEntry::plain(Request::page(WIRELESS_STATUS_PAGE))),
            Query::Arp | Query::Leases => Some(CatalogEntry::plain(Request::page(LAN_STATUS_PAGE))),
            Query::WirelessToolProbe
            | Query::WirelessInterfaces(_)
            | Query::Neighbors
            | Query::RxBytes
            | Query::TxBytes => None,
        }
    }
}
