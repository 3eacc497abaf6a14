//! Host implementations of the service's collaborators
//!
//! Connectivity on a plain host is derived from the configuration and from
//! whatever interfaces the kernel reports. Permissions are granted to the
//! system and to root only; every other caller sees its own data.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use metrics::counter;
use netstats_core::{
    identity::{NetworkIdentity, NetworkType},
    observer::DiagnosticSink,
    platform::{
        Caller, ConnectivitySource, NetworkState, PackageDirectory, Permission, PermissionOracle,
        TrustedTime,
    },
    stats::{self, SYSTEM_UID},
};
use tracing::warn;

use crate::config::NetworkConfig;

/// Interfaces and routes, as the kernel reports them.
pub trait InterfaceProbe: Send + Sync {
    /// Names of every interface with counters
    fn interfaces(&self) -> Vec<String>;
    /// Interface carrying the IPv4 default route, if any
    fn default_route(&self) -> Option<String>;
}

/// Checked by the daemon for a fired global alert.
pub trait AlertProbe: Send + Sync {
    /// True once, when the armed alert has been crossed
    fn take_alert(&self) -> bool;
}

/// A one-shot byte alert emulated over cumulative totals, for hosts whose
/// kernel offers no quota alert.
#[derive(Debug, Default)]
pub struct SoftwareAlert {
    armed: Mutex<Option<Armed>>,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    baseline: u64,
    bytes: u64,
}

impl SoftwareAlert {
    /// Fire once `bytes` more than `current_total` have been seen, replacing
    /// any alert already armed.
    pub fn arm(&self, current_total: u64, bytes: u64) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        *armed = Some(Armed {
            baseline: current_total,
            bytes,
        });
    }

    /// Disarm and return true if `current_total` crossed the alert. A total
    /// below the baseline means the counters were reset; the alert is
    /// re-armed from there.
    pub fn check(&self, current_total: u64) -> bool {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(alert) = armed.as_mut() else {
            return false;
        };
        if current_total < alert.baseline {
            alert.baseline = current_total;
            return false;
        }
        if current_total - alert.baseline >= alert.bytes {
            *armed = None;
            return true;
        }
        false
    }
}

/// Guess the class of network behind an interface from its name.
///
/// Returns `None` for loopback and for names no rule recognises.
#[must_use]
pub fn classify_iface(name: &str) -> Option<NetworkType> {
    const RULES: &[(&str, NetworkType)] = &[
        ("wl", NetworkType::Wifi),
        ("eth", NetworkType::Ethernet),
        ("en", NetworkType::Ethernet),
        ("usb", NetworkType::Ethernet),
        ("rmnet", NetworkType::Mobile),
        ("ccmni", NetworkType::Mobile),
        ("wwan", NetworkType::Mobile),
        ("wwp", NetworkType::Mobile),
        ("bt-pan", NetworkType::Bluetooth),
        ("bnep", NetworkType::Bluetooth),
        ("tun", NetworkType::Vpn),
        ("tap", NetworkType::Vpn),
        ("wg", NetworkType::Vpn),
        ("ppp", NetworkType::Vpn),
    ];
    RULES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, network_type)| *network_type)
}

/// Connectivity from declared networks, optionally extended with every
/// interface the probe reports that a name rule recognises.
pub struct HostConnectivity {
    declared: Vec<NetworkState>,
    probe: Arc<dyn InterfaceProbe>,
    classify_unknown: bool,
}

impl fmt::Debug for HostConnectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConnectivity")
            .field("declared", &self.declared)
            .field("classify_unknown", &self.classify_unknown)
            .finish_non_exhaustive()
    }
}

impl HostConnectivity {
    /// Build from the configured networks
    #[must_use]
    pub fn new(
        networks: &[NetworkConfig],
        probe: Arc<dyn InterfaceProbe>,
        classify_unknown: bool,
    ) -> Self {
        let declared = networks
            .iter()
            .map(|network| NetworkState {
                identity: network.identity(),
                iface: Some(network.iface.clone()),
                stacked_ifaces: network.stacked_ifaces.clone(),
                connected: true,
            })
            .collect();
        Self {
            declared,
            probe,
            classify_unknown,
        }
    }

    fn is_declared(&self, iface: &str) -> bool {
        self.declared.iter().any(|network| {
            network.iface.as_deref() == Some(iface)
                || network.stacked_ifaces.iter().any(|s| s == iface)
        })
    }
}

impl ConnectivitySource for HostConnectivity {
    fn networks(&self) -> Vec<NetworkState> {
        let mut networks = self.declared.clone();
        if self.classify_unknown {
            let mut discovered = self.probe.interfaces();
            discovered.sort();
            for iface in discovered {
                if self.is_declared(&iface) {
                    continue;
                }
                let Some(network_type) = classify_iface(&iface) else {
                    continue;
                };
                networks.push(NetworkState {
                    identity: NetworkIdentity::new(network_type),
                    iface: Some(iface),
                    stacked_ifaces: Vec::new(),
                    connected: true,
                });
            }
        }
        networks
    }

    fn default_iface(&self) -> Option<String> {
        self.probe.default_route().or_else(|| {
            self.declared
                .iter()
                .find(|network| network.connected)
                .and_then(|network| network.iface.clone())
        })
    }
}

/// Grants everything to the system and to root, nothing to anyone else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPermissions;

impl SystemPermissions {
    fn is_privileged(caller: &Caller) -> bool {
        caller.uid == 0 || stats::app_id(caller.uid) == SYSTEM_UID
    }
}

impl PermissionOracle for SystemPermissions {
    fn has_permission(&self, caller: &Caller, _permission: Permission) -> bool {
        Self::is_privileged(caller)
    }

    fn has_usage_access(&self, _caller: &Caller) -> bool {
        false
    }

    fn is_device_or_profile_owner(&self, caller: &Caller) -> bool {
        Self::is_privileged(caller)
    }
}

/// Installed applications as listed in the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPackages {
    app_ids: Vec<i32>,
}

impl ConfiguredPackages {
    /// Serve `app_ids`
    #[must_use]
    pub fn new(app_ids: Vec<i32>) -> Self {
        Self { app_ids }
    }
}

impl PackageDirectory for ConfiguredPackages {
    fn installed_app_ids(&self) -> Vec<i32> {
        self.app_ids.clone()
    }
}

/// Writes every diagnostic entry to its own file.
///
/// Files are named `TAG-MILLIS-SEQ.txt` so entries sort by time.
pub struct FileSink {
    dir: PathBuf,
    time: Arc<dyn TrustedTime>,
    sequence: AtomicU64,
}

impl fmt::Debug for FileSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSink")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileSink {
    /// Write entries under `dir`, creating it on first use
    #[must_use]
    pub fn new(dir: &Path, time: Arc<dyn TrustedTime>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            time,
            sequence: AtomicU64::new(0),
        }
    }
}

impl DiagnosticSink for FileSink {
    fn add_text(&self, tag: &str, text: &str) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{tag}-{millis}-{sequence}.txt",
            millis = self.time.current_time_millis()
        );
        let path = self.dir.join(name);
        let result = fs::create_dir_all(&self.dir).and_then(|()| fs::write(&path, text));
        if let Err(err) = result {
            warn!(path = %path.display(), %err, "unable to write diagnostic entry");
            counter!("diagnostic_write_failures_total").increment(1);
        }
    }
}
