//! Collaborators the service consumes
//!
//! The service never reaches out to the host directly. Counters,
//! connectivity, trusted time, permissions and the various notification
//! seams are all injected as trait objects bundled in a [`Platform`]. The
//! daemon provides host implementations; tests provide fakes.

use std::{
    fmt,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use crate::{
    identity::NetworkIdentity,
    observer::DiagnosticSink,
    stats::{CounterSet, NetworkStats, Uid},
};

/// Errors produced by a [`CounterSource`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source cannot provide this table on this host
    #[error("counter table not supported")]
    Unsupported,
    /// The source failed
    #[error("counter source failed: {0}")]
    Failed(String),
}

/// The interface-level tables a [`CounterSource`] can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceSummary {
    /// Device-level counters, every interface as the kernel sees it
    Dev,
    /// Counters accounted after packet filtering
    Xt,
}

/// Raw counters, as sampled from the kernel or its stand-in.
pub trait CounterSource: Send + Sync {
    /// Whether bandwidth accounting is switched on at all
    fn is_bandwidth_control_enabled(&self) -> bool;

    /// Cumulative per-owner counters, restricted to `owner` when given.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unsupported`] if the host has no per-owner
    /// accounting, or [`SourceError::Failed`] if sampling failed.
    fn counters_by_owner(&self, owner: Option<Uid>) -> Result<NetworkStats, SourceError>;

    /// Cumulative per-interface counters.
    ///
    /// # Errors
    ///
    /// As [`CounterSource::counters_by_owner`].
    fn interface_summary(&self, summary: InterfaceSummary) -> Result<NetworkStats, SourceError>;

    /// Cumulative counters of tethered clients.
    ///
    /// # Errors
    ///
    /// As [`CounterSource::counters_by_owner`].
    fn tethering_counters(&self) -> Result<NetworkStats, SourceError>;

    /// Arm the one-shot alert that fires after `bytes` more traffic.
    ///
    /// # Errors
    ///
    /// Fails if the alert cannot be registered.
    fn set_global_alert(&self, bytes: u64) -> Result<(), SourceError>;

    /// Attribute further traffic of `owner` to `set`.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the change.
    fn set_owner_counter_set(&self, owner: Uid, set: CounterSet) -> Result<(), SourceError>;

    /// Zero the kernel counters of a removed owner.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the change.
    fn reset_owner_counters(&self, owner: Uid) -> Result<(), SourceError>;
}

/// One network as reported by connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    /// Identity of the network
    pub identity: NetworkIdentity,
    /// Base interface carrying the network, if any
    pub iface: Option<String>,
    /// Stacked interfaces, for example a 464xlat tunnel on top of the base
    pub stacked_ifaces: Vec<String>,
    /// False while the network is still connecting
    pub connected: bool,
}

/// Current connectivity.
pub trait ConnectivitySource: Send + Sync {
    /// Every known network
    fn networks(&self) -> Vec<NetworkState>;
    /// Interface of the default network, if there is one
    fn default_iface(&self) -> Option<String>;
}

/// A wall clock that may be corrected from a trusted source.
///
/// Every instant is in epoch milliseconds.
pub trait TrustedTime: Send + Sync {
    /// True once the trusted source has been consulted at least once
    fn has_cache(&self) -> bool;
    /// Milliseconds since the trusted source was last consulted
    fn cache_age_ms(&self) -> i64;
    /// Consult the trusted source, returning false on failure
    fn force_refresh(&self) -> bool;
    /// Current time, trusted if possible
    fn current_time_millis(&self) -> i64;
    /// Milliseconds since boot, monotonic
    fn elapsed_realtime_ms(&self) -> u64;
}

/// [`TrustedTime`] backed by the system clock, which is always trusted.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    /// Create a clock whose elapsed realtime starts now
    #[must_use]
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedTime for SystemClock {
    fn has_cache(&self) -> bool {
        true
    }

    fn cache_age_ms(&self) -> i64 {
        0
    }

    fn force_refresh(&self) -> bool {
        true
    }

    fn current_time_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }

    fn elapsed_realtime_ms(&self) -> u64 {
        u64::try_from(self.boot.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Owner identity of the caller
    pub uid: Uid,
    /// Package the caller claims to be, used for usage-access grants
    pub package: Option<String>,
}

impl Caller {
    /// A caller without a package
    #[must_use]
    pub fn new(uid: Uid) -> Self {
        Self { uid, package: None }
    }

    /// Attach a package name
    #[must_use]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }
}

/// Platform permissions the service checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read usage history of any owner
    ReadNetworkUsageHistory,
    /// Change accounting state
    ModifyNetworkAccounting,
    /// Read interface and connectivity details
    AccessNetworkState,
    /// Produce diagnostic dumps
    Dump,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadNetworkUsageHistory => "READ_NETWORK_USAGE_HISTORY",
            Self::ModifyNetworkAccounting => "MODIFY_NETWORK_ACCOUNTING",
            Self::AccessNetworkState => "ACCESS_NETWORK_STATE",
            Self::Dump => "DUMP",
        };
        f.write_str(name)
    }
}

/// Answers permission questions about callers.
pub trait PermissionOracle: Send + Sync {
    /// Does `caller` hold `permission`?
    fn has_permission(&self, caller: &Caller, permission: Permission) -> bool;
    /// Has the user granted `caller`'s package usage access?
    fn has_usage_access(&self, caller: &Caller) -> bool;
    /// Is `caller` a device or profile owner?
    fn is_device_or_profile_owner(&self, caller: &Caller) -> bool;
}

/// Installed applications.
pub trait PackageDirectory: Send + Sync {
    /// App ids of every installed package, independent of user
    fn installed_app_ids(&self) -> Vec<i32>;
}

/// Told whenever a poll recorded fresh data.
pub trait UpdateListener: Send + Sync {
    /// Fresh data is available
    fn stats_updated(&self);
}

/// Keeps the host awake while held.
pub trait WakeLock: Send + Sync {
    /// Take the lock
    fn acquire(&self);
    /// Drop the lock
    fn release(&self);
}

/// Holds a [`WakeLock`] until dropped.
pub(crate) struct WakeGuard<'a> {
    lock: &'a dyn WakeLock,
}

impl<'a> WakeGuard<'a> {
    pub(crate) fn hold(lock: &'a dyn WakeLock) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Vendor hook for tethering counters the kernel does not see.
pub trait TetherStatsPlugin: Send + Sync {
    /// Fold extra counters into the freshly sampled tables. Each table is
    /// cumulative, like the samples it is folded into.
    fn add_tether_stats(&self, uid: &mut NetworkStats, xt: &mut NetworkStats, dev: &mut NetworkStats);
}

/// Does nothing. Stands in for every notification seam the host does not
/// care about.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl UpdateListener for Noop {
    fn stats_updated(&self) {}
}

impl WakeLock for Noop {
    fn acquire(&self) {}
    fn release(&self) {}
}

impl TetherStatsPlugin for Noop {
    fn add_tether_stats(
        &self,
        _uid: &mut NetworkStats,
        _xt: &mut NetworkStats,
        _dev: &mut NetworkStats,
    ) {
    }
}

/// Every collaborator the service needs.
#[derive(Clone)]
pub struct Platform {
    /// Raw counters
    pub counters: Arc<dyn CounterSource>,
    /// Connectivity
    pub connectivity: Arc<dyn ConnectivitySource>,
    /// Wall clock
    pub time: Arc<dyn TrustedTime>,
    /// Permissions
    pub permissions: Arc<dyn PermissionOracle>,
    /// Installed applications
    pub packages: Arc<dyn PackageDirectory>,
    /// Fresh-data notifications
    pub listener: Arc<dyn UpdateListener>,
    /// Held across each poll
    pub wake_lock: Arc<dyn WakeLock>,
    /// Extra tethering counters
    pub tether_plugin: Arc<dyn TetherStatsPlugin>,
    /// Destination of anomaly reports
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
