use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
};

use tempfile::TempDir;

use super::*;
use crate::{
    history::Fields,
    identity::{NetworkIdentity, NetworkType},
    observer::{TAG_NETSTATS_ERROR, tests::MemorySink},
    platform::{
        ConnectivitySource, CounterSource, NetworkState, Noop, PackageDirectory,
        PermissionOracle, TrustedTime, UpdateListener,
    },
    stats::{SYSTEM_UID, UID_ALL, UID_REMOVED},
};

const OWNER: Uid = 10_001;
const OTHER: Uid = 10_002;
const START: i64 = 1_700_000_000_000;
const MINUTE: i64 = 60_000;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct FakeCounters {
    disabled: bool,
    uid_unsupported: bool,
    failing: Mutex<bool>,
    uid: Mutex<NetworkStats>,
    iface: Mutex<NetworkStats>,
    alerts: Mutex<Vec<u64>>,
    resets: Mutex<Vec<Uid>>,
    sets: Mutex<Vec<(Uid, CounterSet)>>,
}

impl FakeCounters {
    /// Add traffic of `owner` on `iface`, to the owner table and the
    /// interface tables alike.
    fn traffic(&self, iface: &str, owner: Uid, tag: Tag, rx: u64, tx: u64) {
        let counters = Counters::new(rx, rx / 100 + 1, tx, tx / 100 + 1, 0);
        lock(&self.uid).combine_values(
            Entry::new(Some(iface), owner, CounterSet::Default, tag).with_counters(counters),
        );
        if tag == TAG_NONE {
            lock(&self.iface).combine_values(
                Entry::new(Some(iface), UID_ALL, CounterSet::All, TAG_NONE)
                    .with_counters(counters),
            );
        }
    }

    fn fail(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    fn check(&self) -> Result<(), SourceError> {
        if *lock(&self.failing) {
            Err(SourceError::Failed("sampling failed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CounterSource for FakeCounters {
    fn is_bandwidth_control_enabled(&self) -> bool {
        !self.disabled
    }

    fn counters_by_owner(&self, owner: Option<Uid>) -> Result<NetworkStats, SourceError> {
        self.check()?;
        if self.uid_unsupported {
            return Err(SourceError::Unsupported);
        }
        let stats = lock(&self.uid);
        Ok(stats
            .iter()
            .filter(|e| owner.is_none_or(|owner| e.uid == owner))
            .cloned()
            .collect())
    }

    fn interface_summary(&self, _summary: InterfaceSummary) -> Result<NetworkStats, SourceError> {
        self.check()?;
        Ok(lock(&self.iface).clone())
    }

    fn tethering_counters(&self) -> Result<NetworkStats, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn set_global_alert(&self, bytes: u64) -> Result<(), SourceError> {
        lock(&self.alerts).push(bytes);
        Ok(())
    }

    fn set_owner_counter_set(&self, owner: Uid, set: CounterSet) -> Result<(), SourceError> {
        lock(&self.sets).push((owner, set));
        Ok(())
    }

    fn reset_owner_counters(&self, owner: Uid) -> Result<(), SourceError> {
        lock(&self.resets).push(owner);
        let mut stats = lock(&self.uid);
        *stats = stats.without_owners(&[owner]);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnectivity {
    networks: Mutex<Vec<NetworkState>>,
}

impl FakeConnectivity {
    fn connect(&self, identity: NetworkIdentity, iface: &str, stacked: &[&str]) {
        lock(&self.networks).push(NetworkState {
            identity,
            iface: Some(iface.to_string()),
            stacked_ifaces: stacked.iter().map(ToString::to_string).collect(),
            connected: true,
        });
    }
}

impl ConnectivitySource for FakeConnectivity {
    fn networks(&self) -> Vec<NetworkState> {
        lock(&self.networks).clone()
    }

    fn default_iface(&self) -> Option<String> {
        lock(&self.networks).first().and_then(|n| n.iface.clone())
    }
}

struct ManualTime {
    now: AtomicI64,
    elapsed: AtomicU64,
}

impl ManualTime {
    fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
        self.elapsed
            .fetch_add(u64::try_from(ms).unwrap(), Ordering::Relaxed);
    }
}

impl TrustedTime for ManualTime {
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
        self.now.load(Ordering::Relaxed)
    }

    fn elapsed_realtime_ms(&self) -> u64 {
        self.elapsed.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct FakePermissions {
    granted: Mutex<Vec<(Uid, Permission)>>,
    usage_access: Mutex<Vec<Uid>>,
    profile_owners: Mutex<Vec<Uid>>,
}

impl PermissionOracle for FakePermissions {
    fn has_permission(&self, caller: &Caller, permission: Permission) -> bool {
        caller.uid == SYSTEM_UID || lock(&self.granted).contains(&(caller.uid, permission))
    }

    fn has_usage_access(&self, caller: &Caller) -> bool {
        lock(&self.usage_access).contains(&caller.uid)
    }

    fn is_device_or_profile_owner(&self, caller: &Caller) -> bool {
        lock(&self.profile_owners).contains(&caller.uid)
    }
}

struct FakePackages(Vec<i32>);

impl PackageDirectory for FakePackages {
    fn installed_app_ids(&self) -> Vec<i32> {
        self.0.clone()
    }
}

#[derive(Default)]
struct CountingListener(AtomicUsize);

impl UpdateListener for CountingListener {
    fn stats_updated(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

struct Harness {
    dir: TempDir,
    counters: Arc<FakeCounters>,
    connectivity: Arc<FakeConnectivity>,
    time: Arc<ManualTime>,
    permissions: Arc<FakePermissions>,
    listener: Arc<CountingListener>,
    sink: Arc<MemorySink>,
    service: Service,
}

impl Harness {
    fn new() -> Self {
        Self::with_counters(FakeCounters::default())
    }

    fn with_counters(counters: FakeCounters) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::build(dir, Arc::new(counters), Settings::default())
    }

    fn build(dir: TempDir, counters: Arc<FakeCounters>, settings: Settings) -> Self {
        let connectivity = Arc::new(FakeConnectivity::default());
        let time = Arc::new(ManualTime {
            now: AtomicI64::new(START),
            elapsed: AtomicU64::new(0),
        });
        let permissions = Arc::new(FakePermissions::default());
        let listener = Arc::new(CountingListener::default());
        let sink = Arc::new(MemorySink::default());
        let platform = Platform {
            counters: counters.clone(),
            connectivity: connectivity.clone(),
            time: time.clone(),
            permissions: permissions.clone(),
            packages: Arc::new(FakePackages(vec![OWNER, OTHER])),
            listener: listener.clone(),
            wake_lock: Arc::new(Noop),
            tether_plugin: Arc::new(Noop),
            diagnostics: sink.clone(),
        };
        let config = Config {
            data_dir: dir.path().join("netstats"),
            legacy_dir: Some(dir.path().to_path_buf()),
            settings,
        };
        Self {
            dir,
            counters,
            connectivity,
            time,
            permissions,
            listener,
            sink,
            service: Service::new(config, platform),
        }
    }

    /// Ready service with Wi-Fi connected on wlan0.
    fn ready() -> Self {
        let harness = Self::new();
        harness.service.system_ready().unwrap();
        harness.connectivity.connect(
            NetworkIdentity::new(NetworkType::Wifi).with_network_id("home"),
            "wlan0",
            &[],
        );
        harness.event(Event::ConnectivityChanged);
        harness
    }

    fn event(&self, event: Event) -> Operation {
        self.service.handle_event(event).unwrap()
    }

    fn poll_after(&self, ms: i64) {
        self.time.advance(ms);
        self.event(Event::PollAlarm);
    }

    fn system() -> Caller {
        Caller::new(SYSTEM_UID)
    }

    fn owner_rx(&self, owner: Uid) -> u64 {
        let mut session = self.service.open_session(Self::system()).unwrap();
        session
            .get_summary_for_all_owners(&NetworkTemplate::All, i64::MIN..i64::MAX, false)
            .unwrap()
            .iter()
            .filter(|e| e.uid == owner)
            .map(|e| e.counters.rx_bytes)
            .sum()
    }
}

#[test]
fn disabled_bandwidth_control_fails_fast() {
    let harness = Harness::with_counters(FakeCounters {
        disabled: true,
        ..FakeCounters::default()
    });
    assert!(matches!(harness.service.system_ready(), Err(Error::Disabled)));
    assert!(matches!(
        harness.service.open_session(Harness::system()),
        Err(Error::Disabled)
    ));
    assert!(matches!(
        harness.service.remove_owners(&[OWNER]),
        Err(Error::Disabled)
    ));
}

#[test]
fn operations_before_ready_fail_and_polls_do_nothing() {
    let harness = Harness::new();
    assert!(matches!(
        harness.service.remove_owners(&[OWNER]),
        Err(Error::NotReady)
    ));
    harness.event(Event::PollAlarm);
    assert_eq!(harness.listener.0.load(Ordering::Relaxed), 0);
}

#[test]
fn counters_preceding_ready_are_not_counted() {
    let harness = Harness::new();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 1_000, 0);
    harness.service.system_ready().unwrap();
    harness.connectivity.connect(
        NetworkIdentity::new(NetworkType::Wifi).with_network_id("home"),
        "wlan0",
        &[],
    );
    harness.event(Event::ConnectivityChanged);

    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 500, 0);
    harness.poll_after(MINUTE);
    assert_eq!(harness.owner_rx(OWNER), 500);

    let wifi = harness
        .service
        .get_network_total_bytes(
            &Harness::system(),
            &NetworkTemplate::WifiWildcard,
            i64::MIN..i64::MAX,
        )
        .unwrap();
    assert_eq!(wifi, 500);
    let mobile = harness
        .service
        .get_network_total_bytes(
            &Harness::system(),
            &NetworkTemplate::MobileWildcard,
            i64::MIN..i64::MAX,
        )
        .unwrap();
    assert_eq!(mobile, 0);
}

#[test]
fn failed_sample_aborts_the_whole_poll() {
    let harness = Harness::ready();
    let polls = harness.listener.0.load(Ordering::Relaxed);
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 300, 0);
    harness.counters.fail(true);
    harness.poll_after(MINUTE);
    assert_eq!(harness.listener.0.load(Ordering::Relaxed), polls);
    assert_eq!(harness.owner_rx(OWNER), 0);

    harness.counters.fail(false);
    harness.poll_after(MINUTE);
    assert_eq!(harness.listener.0.load(Ordering::Relaxed), polls + 1);
    assert_eq!(harness.owner_rx(OWNER), 300);
}

#[test]
fn unsupported_owner_counters_still_record_interfaces() {
    let harness = Harness::with_counters(FakeCounters {
        uid_unsupported: true,
        ..FakeCounters::default()
    });
    harness.service.system_ready().unwrap();
    harness.connectivity.connect(
        NetworkIdentity::new(NetworkType::Wifi).with_network_id("home"),
        "wlan0",
        &[],
    );
    harness.event(Event::ConnectivityChanged);
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 700, 0);
    harness.poll_after(MINUTE);
    let total = harness
        .service
        .get_network_total_bytes(&Harness::system(), &NetworkTemplate::All, i64::MIN..i64::MAX)
        .unwrap();
    assert_eq!(total, 700);
    assert_eq!(harness.owner_rx(OWNER), 0);
}

#[test]
fn stacked_interfaces_count_for_owners_only() {
    let harness = Harness::new();
    harness.service.system_ready().unwrap();
    harness.connectivity.connect(
        NetworkIdentity::new(NetworkType::Mobile).with_subscriber_id("310"),
        "rmnet0",
        &["clat0"],
    );
    harness.event(Event::ConnectivityChanged);
    assert_eq!(
        harness.service.get_mobile_ifaces(),
        vec!["clat0".to_string(), "rmnet0".to_string()]
    );

    harness.counters.traffic("clat0", OWNER, TAG_NONE, 400, 0);
    harness.poll_after(MINUTE);
    assert_eq!(harness.owner_rx(OWNER), 400);
    let xt = harness
        .service
        .get_network_total_bytes(&Harness::system(), &NetworkTemplate::All, i64::MIN..i64::MAX)
        .unwrap();
    assert_eq!(xt, 0);
}

#[test]
fn owner_removal_folds_history_into_removed() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 800, 0);
    harness.counters.traffic("wlan0", OWNER, 0x7, 90, 0);
    harness.counters.traffic("wlan0", OTHER, TAG_NONE, 50, 0);
    harness.poll_after(MINUTE);

    assert_eq!(harness.event(Event::OwnerRemoved(OWNER)), Operation::Continue);
    assert_eq!(harness.owner_rx(OWNER), 0);
    assert_eq!(harness.owner_rx(UID_REMOVED), 800);
    assert_eq!(harness.owner_rx(OTHER), 50);
    assert_eq!(*lock(&harness.counters.resets), vec![OWNER]);

    let mut session = harness.service.open_session(Harness::system()).unwrap();
    let tagged = session
        .get_history_for_owner(
            &NetworkTemplate::All,
            OWNER,
            CounterSet::All,
            0x7,
            Fields::ALL,
            None,
        )
        .unwrap();
    assert_eq!(tagged.total_bytes(), 0);

    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 60, 0);
    harness.poll_after(MINUTE);
    assert_eq!(harness.owner_rx(OWNER), 60);
}

#[test]
fn user_removal_expands_to_every_installed_application() {
    let harness = Harness::ready();
    harness.event(Event::UserRemoved(10));
    assert_eq!(
        *lock(&harness.counters.resets),
        vec![
            stats::uid_for_user(10, OWNER),
            stats::uid_for_user(10, OTHER)
        ]
    );
}

#[test]
fn operation_counts_are_validated_and_spliced() {
    let harness = Harness::ready();
    let owner = Caller::new(OWNER);
    assert!(matches!(
        harness.service.increment_operation_count(&owner, OWNER, 0x7, -1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        harness
            .service
            .increment_operation_count(&owner, OWNER, TAG_NONE, 1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        harness.service.increment_operation_count(&owner, OTHER, 0x7, 1),
        Err(Error::PermissionDenied {
            permission: Permission::ModifyNetworkAccounting
        })
    ));

    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.counters.traffic("wlan0", OWNER, 0x7, 10, 0);
    harness
        .service
        .increment_operation_count(&owner, OWNER, 0x7, 3)
        .unwrap();
    let snapshot = harness
        .service
        .get_data_snapshot_for_owner(&owner, OWNER)
        .unwrap();
    for tag in [TAG_NONE, 0x7] {
        let row = snapshot
            .find(None, OWNER, CounterSet::Default, tag)
            .unwrap();
        assert_eq!(row.counters.operations, 3);
    }
    assert!(matches!(
        harness.service.get_data_snapshot_for_owner(&owner, OTHER),
        Err(Error::PermissionDenied { .. })
    ));
}

#[test]
fn foreground_changes_reach_the_kernel_once() {
    let harness = Harness::ready();
    let system = Harness::system();
    harness
        .service
        .set_owner_foreground(&system, OWNER, true)
        .unwrap();
    harness
        .service
        .set_owner_foreground(&system, OWNER, true)
        .unwrap();
    harness
        .service
        .set_owner_foreground(&system, OWNER, false)
        .unwrap();
    assert_eq!(
        *lock(&harness.counters.sets),
        vec![(OWNER, CounterSet::Foreground), (OWNER, CounterSet::Default)]
    );
    assert!(matches!(
        harness
            .service
            .set_owner_foreground(&Caller::new(OWNER), OWNER, true),
        Err(Error::PermissionDenied { .. })
    ));
}

#[test]
fn owners_only_see_their_own_history() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.counters.traffic("wlan0", OTHER, TAG_NONE, 200, 0);
    harness.poll_after(MINUTE);

    lock(&harness.permissions.usage_access).push(OWNER);
    let mut session = harness.service.open_session(Caller::new(OWNER)).unwrap();
    let own = session.get_history_for_owner(
        &NetworkTemplate::All,
        OWNER,
        CounterSet::All,
        TAG_NONE,
        Fields::ALL,
        None,
    );
    assert_eq!(own.unwrap().total_bytes(), 100);
    let other = session.get_history_for_owner(
        &NetworkTemplate::All,
        OTHER,
        CounterSet::All,
        TAG_NONE,
        Fields::ALL,
        None,
    );
    assert!(matches!(
        other,
        Err(Error::AccessDenied {
            owner: OTHER,
            caller: OWNER
        })
    ));
    assert_eq!(session.get_relevant_owners().unwrap(), vec![OWNER]);

    let summary = session
        .get_summary_for_all_owners(&NetworkTemplate::All, i64::MIN..i64::MAX, false)
        .unwrap();
    assert!(summary.iter().all(|e| e.uid == OWNER));

    let device = session
        .get_device_summary_for_network(&NetworkTemplate::All, 0..i64::MAX)
        .unwrap();
    assert_eq!(device.len(), 1);
    assert_eq!(device.total().rx_bytes, 300);
    session.close();

    let mut system = harness.service.open_session(Harness::system()).unwrap();
    assert_eq!(system.get_relevant_owners().unwrap(), vec![OWNER, OTHER]);
}

#[test]
fn session_queries_require_usage_history_permission() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.counters.traffic("wlan0", OTHER, TAG_NONE, 200, 0);
    harness.poll_after(MINUTE);

    let denied = |result: Result<(), Error>| {
        matches!(
            result,
            Err(Error::PermissionDenied {
                permission: Permission::ReadNetworkUsageHistory
            })
        )
    };
    let template = NetworkTemplate::All;
    let mut session = harness.service.open_session(Caller::new(OWNER)).unwrap();
    assert!(denied(session.get_relevant_owners().map(drop)));
    assert!(denied(
        session
            .get_device_summary_for_network(&template, 0..i64::MAX)
            .map(drop)
    ));
    assert!(denied(
        session
            .get_summary_for_network(&template, 0..i64::MAX)
            .map(drop)
    ));
    assert!(denied(
        session
            .get_summary_for_all_owners(&template, i64::MIN..i64::MAX, true)
            .map(drop)
    ));
    assert!(denied(
        session
            .get_history_for_owner(&template, OWNER, CounterSet::All, TAG_NONE, Fields::ALL, None)
            .map(drop)
    ));
    assert!(
        session
            .get_history_for_network(&template, Fields::ALL)
            .is_ok()
    );
    session.close();

    lock(&harness.permissions.profile_owners).push(OWNER);
    let mut admin = harness.service.open_session(Caller::new(OWNER)).unwrap();
    assert!(admin.get_relevant_owners().is_ok());
    assert!(denied(
        admin
            .get_summary_for_network(&template, 0..i64::MAX)
            .map(drop)
    ));
    admin.close();

    lock(&harness.permissions.granted).push((OWNER, Permission::ReadNetworkUsageHistory));
    let granted = harness.service.open_session(Caller::new(OWNER)).unwrap();
    let network = granted
        .get_summary_for_network(&template, 0..i64::MAX)
        .unwrap();
    assert_eq!(network.total().rx_bytes, 300);
}

#[test]
fn sessions_keep_the_history_they_loaded() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.poll_after(MINUTE);

    let mut session = harness.service.open_session(Harness::system()).unwrap();
    assert_eq!(owner_total(&mut session), 100);

    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 50, 0);
    harness.poll_after(MINUTE);
    assert_eq!(owner_total(&mut session), 100);

    let mut fresh = harness.service.open_session(Harness::system()).unwrap();
    assert_eq!(owner_total(&mut fresh), 150);
}

fn owner_total(session: &mut Session<'_>) -> u64 {
    session
        .get_history_for_owner(
            &NetworkTemplate::All,
            OWNER,
            CounterSet::All,
            TAG_NONE,
            Fields::ALL,
            None,
        )
        .unwrap()
        .total_bytes()
}

#[test]
fn advised_threshold_is_clamped_and_rearms_alert() {
    let harness = Harness::ready();
    let system = Harness::system();
    assert_eq!(
        *lock(&harness.counters.alerts).last().unwrap(),
        2 * 1024 * 1024
    );

    harness.service.advise_persist_threshold(&system, 1).unwrap();
    assert_eq!(harness.service.persist_threshold(), MIN_ADVISED_THRESHOLD);
    assert_eq!(
        *lock(&harness.counters.alerts).last().unwrap(),
        MIN_ADVISED_THRESHOLD
    );

    harness
        .service
        .advise_persist_threshold(&system, u64::MAX)
        .unwrap();
    assert_eq!(harness.service.global_alert_bytes(), MAX_ADVISED_THRESHOLD);
    assert!(matches!(
        harness
            .service
            .advise_persist_threshold(&Caller::new(OWNER), 1),
        Err(Error::PermissionDenied { .. })
    ));
}

#[test]
fn decreasing_counters_reach_the_diagnostic_sink() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.poll_after(MINUTE);
    {
        let mut uid = lock(&harness.counters.uid);
        *uid = uid.without_owners(&[OWNER]);
    }
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 10, 0);
    harness.poll_after(MINUTE);

    let entries = lock(&harness.sink.entries);
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|(tag, _)| tag == TAG_NETSTATS_ERROR));
    assert!(entries.iter().any(|(_, text)| text.contains("uid")));
    drop(entries);
    assert_eq!(harness.owner_rx(OWNER), 100);
}

#[test]
fn shutdown_persists_and_a_restart_reads_it_back() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 900, 0);
    harness.poll_after(MINUTE);
    assert_eq!(harness.event(Event::Shutdown), Operation::Exit);
    assert!(matches!(
        harness.service.handle_event(Event::PollAlarm),
        Ok(Operation::Continue)
    ));
    assert!(matches!(
        harness.service.remove_owners(&[OWNER]),
        Err(Error::ShutDown)
    ));

    let Harness { dir, counters, .. } = harness;
    let restarted = Harness::build(dir, counters, Settings::default());
    restarted.service.system_ready().unwrap();
    assert_eq!(restarted.owner_rx(OWNER), 900);
}

#[test]
fn reset_data_usage_clears_matching_networks() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.poll_after(MINUTE);
    assert!(matches!(
        harness
            .service
            .reset_data_usage_for_all_owners(&Caller::new(OWNER), &NetworkTemplate::All),
        Err(Error::PermissionDenied { .. })
    ));
    harness
        .service
        .reset_data_usage_for_all_owners(&Harness::system(), &NetworkTemplate::WifiWildcard)
        .unwrap();
    assert_eq!(harness.owner_rx(OWNER), 0);
    let xt = harness
        .service
        .get_network_total_bytes(&Harness::system(), &NetworkTemplate::All, i64::MIN..i64::MAX)
        .unwrap();
    assert_eq!(xt, 0);
}

#[test]
fn legacy_identity_file_is_discarded() {
    let harness = Harness::new();
    let legacy = harness.dir.path().join("netstats_xt.bin");
    std::fs::write(&legacy, b"retired").unwrap();
    harness.service.system_ready().unwrap();
    assert!(!legacy.exists());
}

#[test]
fn dumps_require_permission_and_follow_arguments() {
    let harness = Harness::ready();
    harness.counters.traffic("wlan0", OWNER, TAG_NONE, 100, 0);
    harness.poll_after(MINUTE);
    let system = Harness::system();
    let dump = |args: &[&str]| {
        let mut out = Vec::new();
        harness
            .service
            .dump(&system, &DumpArgs::parse(args), &mut out)
            .unwrap();
        String::from_utf8(out).unwrap()
    };

    let full = dump(&["--uid"]);
    assert!(full.starts_with("Active interfaces:\n  iface=wlan0 ident="));
    assert!(full.contains("\nActive UID interfaces:\n"));
    assert!(full.contains("\nDev stats:\n  Pending bytes: "));
    assert!(full.contains("\nXt stats:\n"));
    assert!(full.contains("\nUID stats:\n"));
    assert!(!full.contains("UID tag stats:"));

    let checkin = dump(&["--checkin", "detail"]);
    let mut lines = checkin.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("v1,"));
    assert_eq!(lines.next(), Some("xt"));
    assert!(checkin.contains("\nuid\n"));
    assert!(checkin.contains("\ntag\n"));

    assert_eq!(dump(&["--poll"]), "Forced poll\n");

    let mut out = Vec::new();
    assert!(matches!(
        harness
            .service
            .dump(&Caller::new(OWNER), &DumpArgs::default(), &mut out),
        Err(Error::PermissionDenied {
            permission: Permission::Dump
        })
    ));
}
