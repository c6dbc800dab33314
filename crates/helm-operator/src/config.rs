//! Process options parsed from the command line

use std::ffi::OsString;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use clap::{ArgAction, Parser};
use helm_common::crd::parse_duration;
use helm_common::leader_election::DEFAULT_LEASE_NAME;

use crate::error::ValidationError;

/// Default number of concurrent HelmRelease reconciles
pub const DEFAULT_CONCURRENT: usize = 4;
/// Default revisit interval for releases waiting on dependencies
pub const DEFAULT_REQUEUE_DEPENDENCY: Duration = Duration::from_secs(30);
/// Default time allowed for in-flight reconciles on shutdown
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the metrics endpoint listens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsBindAddress {
    /// `0`: no metrics endpoint
    Disabled,
    /// Listen on this address
    Listen(SocketAddr),
}

impl MetricsBindAddress {
    /// The listen address, if enabled
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Disabled => None,
            Self::Listen(addr) => Some(*addr),
        }
    }
}

impl fmt::Display for MetricsBindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("0"),
            Self::Listen(addr) => write!(f, "{addr}"),
        }
    }
}

/// Parse `host:port`, `:port` or `0`
fn parse_metrics_addr(raw: &str) -> Result<MetricsBindAddress, String> {
    if raw == "0" {
        return Ok(MetricsBindAddress::Disabled);
    }
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in bind address {raw:?}"))?;
        return Ok(MetricsBindAddress::Listen(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port,
        ))));
    }
    if let Some(port) = raw.strip_prefix("localhost:") {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in bind address {raw:?}"))?;
        return Ok(MetricsBindAddress::Listen(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            port,
        ))));
    }
    raw.parse::<SocketAddr>()
        .map(MetricsBindAddress::Listen)
        .map_err(|_| format!("invalid bind address {raw:?}, expected host:port, :port or 0"))
}

fn parse_go_duration(raw: &str) -> Result<Duration, String> {
    parse_duration(raw)
}

/// Command line of the controller manager
#[derive(Parser, Debug)]
#[command(name = "helm-controller", version, about, long_about = None)]
struct Cli {
    /// The address the metric endpoint binds to (`0` disables it)
    #[arg(long = "metrics-addr", default_value = ":8080", value_parser = parse_metrics_addr)]
    metrics_addr: MetricsBindAddress,

    /// Enable leader election for controller manager
    ///
    /// Enabling this will ensure there is only one active controller manager.
    #[arg(
        long = "enable-leader-election",
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    enable_leader_election: bool,

    /// The number of concurrent HelmRelease reconciles
    #[arg(long, default_value_t = DEFAULT_CONCURRENT as u64, value_parser = clap::value_parser!(u64).range(1..))]
    concurrent: u64,

    /// The interval at which failing dependencies are reevaluated
    #[arg(long = "requeue-dependency", default_value = "30s", value_parser = parse_go_duration)]
    requeue_dependency: Duration,

    /// Set logging to JSON format
    #[arg(
        long = "log-json",
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    log_json: bool,

    /// Time allowed for in-flight reconciles to finish on shutdown
    #[arg(long = "graceful-shutdown-timeout", default_value = "30s", value_parser = parse_go_duration)]
    graceful_shutdown_timeout: Duration,

    /// Namespace of the leader election lease (defaults to the pod namespace)
    #[arg(long = "leader-election-namespace")]
    leader_election_namespace: Option<String>,

    /// Name of the leader election lease
    #[arg(long = "leader-election-id", default_value = DEFAULT_LEASE_NAME)]
    leader_election_id: String,
}

/// Validated, immutable start-up parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Metrics endpoint bind address
    pub metrics_addr: MetricsBindAddress,
    /// Whether only the lease holder dispatches work
    pub enable_leader_election: bool,
    /// Concurrent HelmRelease reconciles, at least 1
    pub concurrent: usize,
    /// Revisit interval for releases waiting on dependencies; zero only
    /// revisits them on their next change
    pub requeue_dependency: Duration,
    /// Structured JSON log output
    pub log_json: bool,
    /// Time allowed for in-flight reconciles on shutdown
    pub graceful_shutdown_timeout: Duration,
    /// Lease namespace override
    pub leader_election_namespace: Option<String>,
    /// Lease name
    pub leader_election_id: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            metrics_addr: MetricsBindAddress::Listen(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                8080,
            ))),
            enable_leader_election: false,
            concurrent: DEFAULT_CONCURRENT,
            requeue_dependency: DEFAULT_REQUEUE_DEPENDENCY,
            log_json: false,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            leader_election_namespace: None,
            leader_election_id: DEFAULT_LEASE_NAME.to_string(),
        }
    }
}

impl ProcessOptions {
    /// Parse the raw argument list, program name first
    ///
    /// Pure: nothing is printed and the process is never exited, so callers
    /// decide what to do with `--help`, `--version` and invalid input.
    pub fn parse<I, T>(args: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;

        let concurrent = usize::try_from(cli.concurrent).map_err(|_| ValidationError::Invalid {
            flag: "concurrent",
            message: format!("{} does not fit this platform", cli.concurrent),
        })?;
        if cli.leader_election_id.trim().is_empty() {
            return Err(ValidationError::Invalid {
                flag: "leader-election-id",
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            metrics_addr: cli.metrics_addr,
            enable_leader_election: cli.enable_leader_election,
            concurrent,
            requeue_dependency: cli.requeue_dependency,
            log_json: cli.log_json,
            graceful_shutdown_timeout: cli.graceful_shutdown_timeout,
            leader_election_namespace: cli.leader_election_namespace.filter(|ns| !ns.is_empty()),
            leader_election_id: cli.leader_election_id,
        })
    }
}
