//! This module controls configuration parsing from the end user. A malformed
//! configuration is fatal at startup, nowhere else.
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use netstats_core::{
    identity::{NetworkIdentity, NetworkType},
    settings::Settings,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

fn default_iface_refresh_seconds() -> u64 {
    30
}

fn default_classify_unknown() -> bool {
    true
}

/// Main configuration struct for the daemon
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory the recorders keep their segments in
    pub data_dir: PathBuf,
    /// Directory searched for retired single-file stats at startup
    #[serde(default)]
    pub legacy_dir: Option<PathBuf>,
    /// Accounting tunables
    #[serde(default)]
    pub settings: Settings,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
    /// How often interfaces, the default route and the global alert are
    /// re-examined
    #[serde(default = "default_iface_refresh_seconds")]
    pub iface_refresh_seconds: u64,
    /// Networks declared up front, by interface
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    /// Treat undeclared interfaces as networks, classified by name
    #[serde(default = "default_classify_unknown")]
    pub classify_unknown: bool,
    /// Application ids installed for every user, used when a user is removed
    #[serde(default)]
    pub app_ids: Vec<i32>,
}

impl Config {
    /// Load a configuration from `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid configuration.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Fails if `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Period of the interface refresh tick
    #[must_use]
    pub fn iface_refresh(&self) -> Duration {
        Duration::from_secs(self.iface_refresh_seconds.max(1))
    }

    /// Period of the poll tick
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.poll_interval_seconds.max(1))
    }
}

/// Telemetry configuration
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// Expose internal metrics for scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

/// The class of a declared network
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Cellular
    Mobile,
    /// Wi-Fi
    Wifi,
    /// Wired ethernet
    Ethernet,
    /// Bluetooth PAN
    Bluetooth,
    /// WiMAX
    Wimax,
    /// Virtual private network
    Vpn,
    /// Proxy
    Proxy,
}

impl From<NetworkKind> for NetworkType {
    fn from(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::Mobile => NetworkType::Mobile,
            NetworkKind::Wifi => NetworkType::Wifi,
            NetworkKind::Ethernet => NetworkType::Ethernet,
            NetworkKind::Bluetooth => NetworkType::Bluetooth,
            NetworkKind::Wimax => NetworkType::Wimax,
            NetworkKind::Vpn => NetworkType::Vpn,
            NetworkKind::Proxy => NetworkType::Proxy,
        }
    }
}

/// A network reachable through one interface
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Base interface
    pub iface: String,
    /// Class of network
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    /// Carrier subscriber, cellular only
    #[serde(default)]
    pub subscriber_id: Option<String>,
    /// Network id, for Wi-Fi the SSID
    #[serde(default)]
    pub network_id: Option<String>,
    /// Whether the device is roaming on this network
    #[serde(default)]
    pub roaming: bool,
    /// Whether the network is metered, defaulting by class
    #[serde(default)]
    pub metered: Option<bool>,
    /// Interfaces stacked on top of `iface`, for example a clat tunnel
    #[serde(default)]
    pub stacked_ifaces: Vec<String>,
}

impl NetworkConfig {
    /// The identity traffic on this network is accounted to
    #[must_use]
    pub fn identity(&self) -> NetworkIdentity {
        let mut identity = NetworkIdentity::new(self.kind.into()).with_roaming(self.roaming);
        if let Some(subscriber_id) = &self.subscriber_id {
            identity = identity.with_subscriber_id(subscriber_id.clone());
        }
        if let Some(network_id) = &self.network_id {
            identity = identity.with_network_id(network_id.clone());
        }
        if let Some(metered) = self.metered {
            identity = identity.with_metered(metered);
        }
        identity
    }
}
