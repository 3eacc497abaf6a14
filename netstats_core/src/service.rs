//! The accounting service
//!
//! [`Service`] owns the four recorders and every piece of mutable state
//! polling touches: the interface to identity mappings, the queued
//! operation counts and the owner counter sets. All of it sits behind one
//! mutex so triggers arriving concurrently are serialized. External
//! triggers enter through [`Service::handle_event`], which answers with an
//! [`Operation`] telling the caller whether to keep going.

use std::{
    fs,
    ops::{BitOr, Range},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::{
    collection::{self, Collection},
    identity::IdentitySet,
    observer::{NonMonotonicObserver, ReportingObserver},
    platform::{Caller, InterfaceSummary, Permission, Platform, SourceError, WakeGuard},
    recorder::{self, Recorder},
    rotator::FileRotator,
    settings::{DimensionConfig, Settings},
    stats::{self, CounterSet, Counters, Entry, NetworkStats, TAG_NONE, Tag, Uid},
    template::NetworkTemplate,
};

mod dump;
pub mod session;

pub use dump::DumpArgs;
pub use session::{AccessLevel, Session};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Smallest persist threshold [`Service::advise_persist_threshold`] accepts
pub const MIN_ADVISED_THRESHOLD: u64 = 128 * KIB;
/// Largest persist threshold [`Service::advise_persist_threshold`] accepts
pub const MAX_ADVISED_THRESHOLD: u64 = 2 * MIB;

/// Segment prefix of the device-level recorder
pub const PREFIX_DEV: &str = "dev";
/// Segment prefix of the identity-level recorder
pub const PREFIX_XT: &str = "xt";
/// Segment prefix of the per-owner recorder
pub const PREFIX_UID: &str = "uid";
/// Segment prefix of the per-owner tagged recorder
pub const PREFIX_UID_TAG: &str = "uid_tag";

const LEGACY_NETWORK_FILE: &str = "netstats.bin";
const LEGACY_XT_FILE: &str = "netstats_xt.bin";
const LEGACY_UID_FILE: &str = "netstats_uid.bin";

/// Errors produced by [`Service`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller lacks a platform permission
    #[error("caller lacks permission {permission}")]
    PermissionDenied {
        /// The permission required
        permission: Permission,
    },
    /// The caller may not see the requested owner's data
    #[error("network stats history of uid {owner} is forbidden for caller {caller}")]
    AccessDenied {
        /// Owner requested
        owner: Uid,
        /// Identity of the caller
        caller: Uid,
    },
    /// The request itself is malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Bandwidth accounting is switched off on this host
    #[error("bandwidth module disabled")]
    Disabled,
    /// [`Service::system_ready`] has not completed
    #[error("service not ready")]
    NotReady,
    /// [`Service::shutdown`] already ran
    #[error("service shut down")]
    ShutDown,
    /// A recorder failed
    #[error(transparent)]
    Recorder(#[from] recorder::Error),
    /// The counter source failed
    #[error(transparent)]
    Source(#[from] SourceError),
    /// A dump could not be written
    #[error("unable to write dump: {0}")]
    Dump(#[from] std::io::Error),
}

impl From<collection::Error> for Error {
    fn from(err: collection::Error) -> Self {
        match err {
            collection::Error::AccessDenied { owner, caller } => Self::AccessDenied { owner, caller },
            other => Self::Recorder(recorder::Error::Collection(other)),
        }
    }
}

impl From<recorder::DumpError> for Error {
    fn from(err: recorder::DumpError) -> Self {
        match err {
            recorder::DumpError::Io(err) => Self::Dump(err),
            recorder::DumpError::Recorder(err) => Self::Recorder(err),
        }
    }
}

/// Which recorders a poll persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFlags(u32);

impl PollFlags {
    /// Persist the interface-level recorders if over threshold
    pub const NETWORK: Self = Self(0x1);
    /// Persist the per-owner recorders if over threshold
    pub const UID: Self = Self(0x2);
    /// Persist every recorder if over threshold
    pub const ALL: Self = Self(0x3);
    /// Persist every recorder regardless of threshold
    pub const FORCE: Self = Self(0x100);

    /// True when every flag of `other` is set
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PollFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// External triggers the service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The periodic poll alarm fired
    PollAlarm,
    /// Networks came or went
    ConnectivityChanged,
    /// Tethering started or stopped
    TetheringChanged,
    /// The global byte alert fired
    GlobalAlertReached,
    /// An application owner was uninstalled
    OwnerRemoved(Uid),
    /// A user and every application it owned went away
    UserRemoved(i32),
    /// The host is going down
    Shutdown,
}

/// What the caller of [`Service::handle_event`] should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Keep delivering events
    Continue,
    /// The service is shut down, stop
    Exit,
}

/// Where the service keeps its data and how it behaves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every recorder's segments
    pub data_dir: PathBuf,
    /// Directory searched for retired single-file stats during
    /// [`Service::system_ready`]
    pub legacy_dir: Option<PathBuf>,
    /// Tunables
    pub settings: Settings,
}

pub(crate) struct Recorders {
    pub(crate) dev: Recorder,
    pub(crate) xt: Recorder,
    pub(crate) uid: Recorder,
    pub(crate) uid_tag: Recorder,
}

enum Lifecycle {
    Uninitialized,
    Disabled,
    Ready(Box<Recorders>),
    ShutDown,
}

pub(crate) struct State {
    lifecycle: Lifecycle,
    pub(crate) active_ifaces: FxHashMap<String, Arc<IdentitySet>>,
    pub(crate) active_uid_ifaces: FxHashMap<String, Arc<IdentitySet>>,
    mobile_ifaces: Vec<String>,
    active_iface: Option<String>,
    owner_sets: FxHashMap<Uid, CounterSet>,
    operations: NetworkStats,
    persist_threshold: u64,
}

impl State {
    fn recorders(&mut self) -> Result<&mut Recorders, Error> {
        match &mut self.lifecycle {
            Lifecycle::Ready(recorders) => Ok(&mut **recorders),
            Lifecycle::Uninitialized => Err(Error::NotReady),
            Lifecycle::Disabled => Err(Error::Disabled),
            Lifecycle::ShutDown => Err(Error::ShutDown),
        }
    }
}

struct Snapshots {
    uid: NetworkStats,
    xt: NetworkStats,
    dev: NetworkStats,
}

/// Network usage accounting over four recorders.
pub struct Service {
    config: Config,
    platform: Platform,
    observer: Arc<dyn NonMonotonicObserver>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn or_empty(result: Result<NetworkStats, SourceError>) -> Result<NetworkStats, SourceError> {
    match result {
        Err(SourceError::Unsupported) => Ok(NetworkStats::new(0)),
        other => other,
    }
}

fn persist(recorder: &mut Recorder, now: i64, force: bool) {
    let result = if force {
        recorder.force_persist(now)
    } else {
        recorder.maybe_persist(now)
    };
    if let Err(err) = result {
        error!(recorder = recorder.cookie(), %err, "problem persisting stats");
        counter!("persist_failures_total", "recorder" => recorder.cookie().to_string())
            .increment(1);
    }
}

fn remove_legacy(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(path = %path.display(), %err, "unable to remove legacy stats");
    }
}

impl Service {
    /// Create a service that does nothing until [`Service::system_ready`].
    #[must_use]
    pub fn new(config: Config, platform: Platform) -> Self {
        let observer: Arc<dyn NonMonotonicObserver> =
            Arc::new(ReportingObserver::new(Arc::clone(&platform.diagnostics)));
        let persist_threshold = config.settings.persist_threshold.as_u64();
        Self {
            config,
            platform,
            observer,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Uninitialized,
                active_ifaces: FxHashMap::default(),
                active_uid_ifaces: FxHashMap::default(),
                mobile_ifaces: Vec::new(),
                active_iface: None,
                owner_sets: FxHashMap::default(),
                operations: NetworkStats::new(0),
                persist_threshold,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> i64 {
        self.platform.time.current_time_millis()
    }

    fn require(&self, caller: &Caller, permission: Permission) -> Result<(), Error> {
        if self.platform.permissions.has_permission(caller, permission) {
            Ok(())
        } else {
            Err(Error::PermissionDenied { permission })
        }
    }

    fn require_bandwidth_control(&self) -> Result<(), Error> {
        if self.platform.counters.is_bandwidth_control_enabled() {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    fn build_recorder(
        &self,
        prefix: &str,
        dimension: &DimensionConfig,
        only_tags: bool,
    ) -> Result<Recorder, Error> {
        let rotator = FileRotator::new(
            &self.config.data_dir,
            prefix,
            dimension.rotate_age_ms(),
            dimension.delete_age_ms(),
        )
        .map_err(recorder::Error::from)?;
        Ok(Recorder::new(
            rotator,
            Arc::clone(&self.observer),
            prefix,
            dimension.bucket_duration_ms(),
            only_tags,
        ))
    }

    fn update_persist_thresholds(&self, recorders: &mut Recorders, threshold: u64) {
        let settings = &self.config.settings;
        let pick = |dimension: &DimensionConfig| {
            dimension.persist_bytes.map_or(threshold, |b| b.as_u64())
        };
        recorders.dev.set_persist_threshold(pick(&settings.dev));
        recorders.xt.set_persist_threshold(pick(&settings.xt));
        recorders.uid.set_persist_threshold(pick(&settings.uid));
        recorders.uid_tag.set_persist_threshold(pick(&settings.uid_tag));
    }

    fn register_global_alert(&self, state: &State) {
        let bytes = self.config.settings.global_alert_bytes(state.persist_threshold);
        if let Err(err) = self.platform.counters.set_global_alert(bytes) {
            warn!(%err, "problem registering for global alert");
        }
    }

    /// Build the recorders, import retired stats, establish the counter
    /// baseline and arm the global alert. Calling this again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if bandwidth accounting is off, in which
    /// case every later call fails the same way, or an error if the data
    /// directory is unusable.
    pub fn system_ready(&self) -> Result<(), Error> {
        let mut state = self.lock();
        match state.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Ready(_) => return Ok(()),
            Lifecycle::Disabled => return Err(Error::Disabled),
            Lifecycle::ShutDown => return Err(Error::ShutDown),
        }
        if !self.platform.counters.is_bandwidth_control_enabled() {
            warn!("bandwidth controls disabled, unable to track stats");
            state.lifecycle = Lifecycle::Disabled;
            return Err(Error::Disabled);
        }

        let settings = &self.config.settings;
        let mut recorders = Box::new(Recorders {
            dev: self.build_recorder(PREFIX_DEV, &settings.dev, false)?,
            xt: self.build_recorder(PREFIX_XT, &settings.xt, false)?,
            uid: self.build_recorder(PREFIX_UID, &settings.uid, false)?,
            uid_tag: self.build_recorder(PREFIX_UID_TAG, &settings.uid_tag, true)?,
        });
        self.update_persist_thresholds(&mut recorders, state.persist_threshold);
        if let Some(legacy_dir) = &self.config.legacy_dir {
            if let Err(err) = import_legacy(&mut recorders, legacy_dir) {
                error!(%err, "problem during legacy upgrade");
            }
        }

        let now = self.now();
        if let Err(err) = recorders.xt.get_or_load_complete(now) {
            warn!(%err, "unable to load identity-level history");
        }
        state.lifecycle = Lifecycle::Ready(recorders);

        let state = &mut *state;
        match self.sample(&state.operations) {
            Ok(snapshots) => record_snapshots(state, snapshots, now),
            Err(err) => warn!(%err, "problem reading network stats"),
        }
        self.register_global_alert(state);
        info!(data_dir = %self.config.data_dir.display(), "network stats service ready");
        Ok(())
    }

    /// Import the retired single-file stats found in `dir`, replacing what
    /// the affected recorders hold. Imported files are deleted.
    ///
    /// # Errors
    ///
    /// Fails if the service is not ready or a file cannot be imported.
    pub fn import_legacy_format(&self, dir: &Path) -> Result<(), Error> {
        let mut state = self.lock();
        import_legacy(state.recorders()?, dir)
    }

    /// Sample every counter table. Nothing is recorded unless every table
    /// could be read.
    fn sample(&self, operations: &NetworkStats) -> Result<Snapshots, SourceError> {
        let counters = self.platform.counters.as_ref();
        let mut uid = or_empty(counters.counters_by_owner(None))?;
        match counters.tethering_counters() {
            Ok(tether) => uid.combine_all(&tether),
            Err(SourceError::Unsupported) => {}
            Err(err) => error!(%err, "problem reading tethering stats"),
        }
        uid.combine_all(operations);
        let mut xt = or_empty(counters.interface_summary(InterfaceSummary::Xt))?;
        let mut dev = or_empty(counters.interface_summary(InterfaceSummary::Dev))?;
        self.platform
            .tether_plugin
            .add_tether_stats(&mut uid, &mut xt, &mut dev);

        let elapsed = self.platform.time.elapsed_realtime_ms();
        for snapshot in [&mut uid, &mut xt, &mut dev] {
            snapshot.elapsed_realtime_ms = elapsed;
        }
        Ok(Snapshots { uid, xt, dev })
    }

    /// Refresh trusted time if stale, then poll under the lock.
    fn perform_poll(&self, flags: PollFlags) {
        let time = self.platform.time.as_ref();
        if time.cache_age_ms() > self.config.settings.time_cache_max_age_ms()
            && !time.force_refresh()
        {
            warn!("unable to refresh trusted time");
        }
        let mut state = self.lock();
        self.poll_locked(&mut state, flags);
    }

    pub(crate) fn poll_locked(&self, state: &mut State, flags: PollFlags) {
        if !matches!(state.lifecycle, Lifecycle::Ready(_)) {
            return;
        }
        let _wake = WakeGuard::hold(self.platform.wake_lock.as_ref());
        let now = self.now();
        let snapshots = match self.sample(&state.operations) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                error!(%err, "problem reading network stats");
                counter!("poll_failures_total").increment(1);
                return;
            }
        };
        record_snapshots(state, snapshots, now);

        let Lifecycle::Ready(recorders) = &mut state.lifecycle else {
            return;
        };
        if flags.contains(PollFlags::FORCE) {
            for recorder in recorders.all_mut() {
                persist(recorder, now, true);
            }
        } else {
            if flags.contains(PollFlags::NETWORK) {
                persist(&mut recorders.dev, now, false);
                persist(&mut recorders.xt, now, false);
            }
            if flags.contains(PollFlags::UID) {
                persist(&mut recorders.uid, now, false);
                persist(&mut recorders.uid_tag, now, false);
            }
        }
        if self.config.settings.sample_enabled {
            emit_sample(recorders);
        }
        counter!("polls_total").increment(1);
        debug!(?flags, now, "polled network stats");
        self.platform.listener.stats_updated();
    }

    /// Poll once with `PollFlags::NETWORK`, then rebuild the interface to
    /// identity mappings from connectivity.
    fn update_ifaces(&self) {
        let mut state = self.lock();
        if !matches!(state.lifecycle, Lifecycle::Ready(_)) {
            return;
        }
        self.poll_locked(&mut state, PollFlags::NETWORK);

        let connectivity = self.platform.connectivity.as_ref();
        let mut ifaces: FxHashMap<String, IdentitySet> = FxHashMap::default();
        let mut uid_ifaces: FxHashMap<String, IdentitySet> = FxHashMap::default();
        let mut mobile: Vec<String> = Vec::new();
        for network in connectivity.networks().into_iter().filter(|n| n.connected) {
            let is_mobile = network.identity.network_type.is_mobile();
            if let Some(base) = &network.iface {
                ifaces
                    .entry(base.clone())
                    .or_default()
                    .insert(network.identity.clone());
                uid_ifaces
                    .entry(base.clone())
                    .or_default()
                    .insert(network.identity.clone());
                if is_mobile {
                    mobile.push(base.clone());
                }
            }
            for stacked in &network.stacked_ifaces {
                uid_ifaces
                    .entry(stacked.clone())
                    .or_default()
                    .insert(network.identity.clone());
                if is_mobile {
                    mobile.push(stacked.clone());
                }
            }
        }
        mobile.sort();
        mobile.dedup();

        state.active_iface = connectivity.default_iface();
        state.active_ifaces = ifaces
            .into_iter()
            .map(|(iface, set)| (iface, set.into_shared()))
            .collect();
        state.active_uid_ifaces = uid_ifaces
            .into_iter()
            .map(|(iface, set)| (iface, set.into_shared()))
            .collect();
        state.mobile_ifaces = mobile;
        info!(
            active = ?state.active_iface,
            ifaces = state.active_ifaces.len(),
            uid_ifaces = state.active_uid_ifaces.len(),
            "updated active interfaces"
        );
    }

    /// React to an external trigger.
    ///
    /// # Errors
    ///
    /// Fails if owner removal cannot complete. Polls never fail; their
    /// problems are logged.
    pub fn handle_event(&self, event: Event) -> Result<Operation, Error> {
        debug!(?event, "handling event");
        match event {
            Event::PollAlarm => {
                self.perform_poll(PollFlags::ALL);
                self.register_global_alert(&self.lock());
            }
            Event::ConnectivityChanged => self.update_ifaces(),
            Event::TetheringChanged => self.perform_poll(PollFlags::NETWORK),
            Event::GlobalAlertReached => {
                self.perform_poll(PollFlags::NETWORK);
                self.register_global_alert(&self.lock());
            }
            Event::OwnerRemoved(owner) => self.remove_owners(&[owner])?,
            Event::UserRemoved(user) => self.remove_user(user)?,
            Event::Shutdown => {
                self.shutdown()?;
                return Ok(Operation::Exit);
            }
        }
        Ok(Operation::Continue)
    }

    /// Poll, then erase every trace of `owners` from the per-owner
    /// recorders and the kernel.
    ///
    /// # Errors
    ///
    /// Fails if the service is not ready or segments cannot be rewritten.
    pub fn remove_owners(&self, owners: &[Uid]) -> Result<(), Error> {
        let mut state = self.lock();
        state.recorders()?;
        self.poll_locked(&mut state, PollFlags::ALL | PollFlags::FORCE);

        let recorders = state.recorders()?;
        let untagged = recorders.uid.remove_owners(owners);
        let tagged = recorders.uid_tag.remove_owners(owners);
        state.operations = state.operations.without_owners(owners);
        for owner in owners {
            state.owner_sets.remove(owner);
            if let Err(err) = self.platform.counters.reset_owner_counters(*owner) {
                warn!(owner, %err, "unable to reset kernel counters");
            }
        }
        counter!("owners_removed_total").increment(owners.len() as u64);
        untagged?;
        tagged?;
        Ok(())
    }

    /// Remove every owner `user` had, one per installed application.
    ///
    /// # Errors
    ///
    /// As [`Service::remove_owners`].
    pub fn remove_user(&self, user: i32) -> Result<(), Error> {
        let owners: Vec<Uid> = self
            .platform
            .packages
            .installed_app_ids()
            .into_iter()
            .map(|app| stats::uid_for_user(user, app))
            .collect();
        info!(user, owners = owners.len(), "removing user");
        self.remove_owners(&owners)
    }

    /// Persist everything and release the recorders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if the service never became ready.
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.lock();
        let now = self.now();
        for recorder in state.recorders()?.all_mut() {
            persist(recorder, now, true);
        }
        state.lifecycle = Lifecycle::ShutDown;
        info!("network stats service shut down");
        Ok(())
    }

    /// Poll and persist every recorder.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ReadNetworkUsageHistory`].
    pub fn force_update(&self, caller: &Caller) -> Result<(), Error> {
        self.require(caller, Permission::ReadNetworkUsageHistory)?;
        self.perform_poll(PollFlags::ALL);
        Ok(())
    }

    /// Re-read connectivity.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ReadNetworkUsageHistory`].
    pub fn force_update_ifaces(&self, caller: &Caller) -> Result<(), Error> {
        self.require(caller, Permission::ReadNetworkUsageHistory)?;
        self.update_ifaces();
        Ok(())
    }

    /// Poll, then empty the per-owner and identity-level history of
    /// networks matching `template`.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ModifyNetworkAccounting`], before
    /// [`Service::system_ready`] or if segments cannot be rewritten.
    pub fn reset_data_usage_for_all_owners(
        &self,
        caller: &Caller,
        template: &NetworkTemplate,
    ) -> Result<(), Error> {
        self.require(caller, Permission::ModifyNetworkAccounting)?;
        let mut state = self.lock();
        state.recorders()?;
        self.poll_locked(&mut state, PollFlags::ALL | PollFlags::FORCE);
        let recorders = state.recorders()?;
        let results = [
            recorders.uid.reset_data_usage(template),
            recorders.uid_tag.reset_data_usage(template),
            recorders.xt.reset_data_usage(template),
        ];
        results.into_iter().collect::<Result<(), _>>()?;
        Ok(())
    }

    /// Adopt a new persist threshold, clamped to
    /// [[`MIN_ADVISED_THRESHOLD`], [`MAX_ADVISED_THRESHOLD`]], and re-arm
    /// the global alert.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ModifyNetworkAccounting`] or with
    /// bandwidth accounting off.
    pub fn advise_persist_threshold(&self, caller: &Caller, bytes: u64) -> Result<(), Error> {
        self.require(caller, Permission::ModifyNetworkAccounting)?;
        self.require_bandwidth_control()?;
        let now = self.now();
        let mut state = self.lock();
        state.persist_threshold = bytes.clamp(MIN_ADVISED_THRESHOLD, MAX_ADVISED_THRESHOLD);
        let threshold = state.persist_threshold;
        let Ok(recorders) = state.recorders() else {
            return Ok(());
        };
        self.update_persist_thresholds(recorders, threshold);
        for recorder in recorders.all_mut() {
            persist(recorder, now, false);
        }
        self.register_global_alert(&state);
        Ok(())
    }

    /// The persist threshold last advised
    #[must_use]
    pub fn persist_threshold(&self) -> u64 {
        self.lock().persist_threshold
    }

    /// The global alert threshold in force
    #[must_use]
    pub fn global_alert_bytes(&self) -> u64 {
        self.config
            .settings
            .global_alert_bytes(self.lock().persist_threshold)
    }

    /// Identity-level complete history.
    pub(crate) fn xt_complete(&self) -> Result<Arc<Collection>, Error> {
        let now = self.now();
        let mut state = self.lock();
        Ok(state.recorders()?.xt.get_or_load_complete(now)?)
    }

    /// Per-owner complete history, tagged rows when `tagged`.
    pub(crate) fn owner_complete(&self, tagged: bool) -> Result<Arc<Collection>, Error> {
        let now = self.now();
        let mut state = self.lock();
        let recorders = state.recorders()?;
        let recorder = if tagged {
            &mut recorders.uid_tag
        } else {
            &mut recorders.uid
        };
        Ok(recorder.get_or_load_complete(now)?)
    }

    /// Bytes in both directions on networks matching `template`.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ReadNetworkUsageHistory`], with
    /// bandwidth accounting off or before [`Service::system_ready`].
    pub fn get_network_total_bytes(
        &self,
        caller: &Caller,
        template: &NetworkTemplate,
        range: Range<i64>,
    ) -> Result<u64, Error> {
        self.require(caller, Permission::ReadNetworkUsageHistory)?;
        self.require_bandwidth_control()?;
        let xt = self.xt_complete()?;
        Ok(xt
            .get_summary(template, range, self.now(), stats::SYSTEM_UID)
            .total_bytes())
    }

    /// Live counters of `owner` with queued operation counts spliced in and
    /// interfaces collapsed.
    ///
    /// # Errors
    ///
    /// Fails with bandwidth accounting off, if the source fails, or without
    /// [`Permission::AccessNetworkState`] when asking about another owner.
    pub fn get_data_snapshot_for_owner(
        &self,
        caller: &Caller,
        owner: Uid,
    ) -> Result<NetworkStats, Error> {
        if caller.uid != owner {
            self.require(caller, Permission::AccessNetworkState)?;
        }
        self.require_bandwidth_control()?;
        let mut network = self.platform.counters.counters_by_owner(Some(owner))?;
        network.splice_operations_from(&self.lock().operations);
        Ok(network.flatten_ifaces())
    }

    /// Interfaces currently carrying mobile networks
    #[must_use]
    pub fn get_mobile_ifaces(&self) -> Vec<String> {
        self.lock().mobile_ifaces.clone()
    }

    /// Count `count` more operations of `owner` under `tag`, on the active
    /// interface and the owner's current counter set. The untagged row is
    /// incremented as well.
    ///
    /// # Errors
    ///
    /// Fails on a negative count or [`TAG_NONE`], or without
    /// [`Permission::ModifyNetworkAccounting`] when counting for another
    /// owner.
    pub fn increment_operation_count(
        &self,
        caller: &Caller,
        owner: Uid,
        tag: Tag,
        count: i64,
    ) -> Result<(), Error> {
        if caller.uid != owner {
            self.require(caller, Permission::ModifyNetworkAccounting)?;
        }
        let Ok(count) = u64::try_from(count) else {
            return Err(Error::InvalidArgument("operation count can only be incremented"));
        };
        if tag == TAG_NONE {
            return Err(Error::InvalidArgument("operation count must have specific tag"));
        }
        let mut state = self.lock();
        let set = state
            .owner_sets
            .get(&owner)
            .copied()
            .unwrap_or(CounterSet::Default);
        let iface = state.active_iface.clone();
        let counters = Counters::new(0, 0, 0, 0, count);
        for tag in [tag, TAG_NONE] {
            state.operations.combine_values(
                Entry::new(iface.as_deref(), owner, set, tag).with_counters(counters),
            );
        }
        Ok(())
    }

    /// Attribute further traffic of `owner` to the foreground set, or back
    /// to the default one.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::ModifyNetworkAccounting`].
    pub fn set_owner_foreground(
        &self,
        caller: &Caller,
        owner: Uid,
        foreground: bool,
    ) -> Result<(), Error> {
        self.require(caller, Permission::ModifyNetworkAccounting)?;
        let set = if foreground {
            CounterSet::Foreground
        } else {
            CounterSet::Default
        };
        let mut state = self.lock();
        let old = state
            .owner_sets
            .get(&owner)
            .copied()
            .unwrap_or(CounterSet::Default);
        if old != set {
            state.owner_sets.insert(owner, set);
            if let Err(err) = self.platform.counters.set_owner_counter_set(owner, set) {
                warn!(owner, %err, "problem changing kernel counter set");
            }
        }
        Ok(())
    }
}

impl Recorders {
    fn all_mut(&mut self) -> [&mut Recorder; 4] {
        [
            &mut self.dev,
            &mut self.xt,
            &mut self.uid,
            &mut self.uid_tag,
        ]
    }
}

/// Record one set of snapshots. Every dimension sees the same pair of
/// samples.
fn record_snapshots(state: &mut State, snapshots: Snapshots, now: i64) {
    let State {
        lifecycle,
        active_ifaces,
        active_uid_ifaces,
        ..
    } = state;
    let Lifecycle::Ready(recorders) = lifecycle else {
        return;
    };
    recorders.dev.record_snapshot(snapshots.dev, active_ifaces, now);
    recorders.xt.record_snapshot(snapshots.xt, active_ifaces, now);
    recorders
        .uid
        .record_snapshot(snapshots.uid.clone(), active_uid_ifaces, now);
    recorders
        .uid_tag
        .record_snapshot(snapshots.uid, active_uid_ifaces, now);
}

fn import_legacy(recorders: &mut Recorders, dir: &Path) -> Result<(), Error> {
    let network = dir.join(LEGACY_NETWORK_FILE);
    if network.exists() {
        recorders.dev.import_legacy_network(&network)?;
        remove_legacy(&network);
    }
    let xt = dir.join(LEGACY_XT_FILE);
    if xt.exists() {
        remove_legacy(&xt);
    }
    let uid = dir.join(LEGACY_UID_FILE);
    if uid.exists() {
        recorders.uid.import_legacy_uid(&uid)?;
        recorders.uid_tag.import_legacy_uid(&uid)?;
        remove_legacy(&uid);
    }
    Ok(())
}

/// Log coarse since-boot totals of mobile and Wi-Fi traffic.
fn emit_sample(recorders: &Recorders) {
    for (template, network) in [
        (NetworkTemplate::MobileWildcard, "mobile"),
        (NetworkTemplate::WifiWildcard, "wifi"),
    ] {
        let dev = recorders.dev.total_since_boot(&template);
        let xt = recorders.xt.total_since_boot(&template);
        let uid = recorders.uid.total_since_boot(&template);
        info!(
            network,
            dev_rx_bytes = dev.rx_bytes,
            dev_tx_bytes = dev.tx_bytes,
            xt_rx_bytes = xt.rx_bytes,
            xt_tx_bytes = xt.tx_bytes,
            uid_rx_bytes = uid.rx_bytes,
            uid_tx_bytes = uid.tx_bytes,
            "usage sample"
        );
        for (dimension, totals) in [("dev", dev), ("xt", xt), ("uid", uid)] {
            #[allow(clippy::cast_precision_loss)]
            let bytes = totals.total_bytes() as f64;
            gauge!("since_boot_bytes", "network" => network, "dimension" => dimension).set(bytes);
        }
    }
}

#[cfg(test)]
mod tests;
