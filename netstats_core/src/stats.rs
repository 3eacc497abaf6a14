//! Tables of sampled traffic counters
//!
//! A [`NetworkStats`] is one snapshot (or the delta between two snapshots) of
//! the raw counters the operating system keeps: one row per interface,
//! owner, counter set and tag. The owner-id, counter set and tag vocabulary
//! used across the crate lives here too.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::observer::{NonMonotonicObserver, NonMonotonicReport};

/// Numeric identity of the application that traffic is attributed to.
pub type Uid = i32;
/// Application-supplied sub-classification within an owner.
pub type Tag = i32;

/// Wildcard owner, also the owner of interface-level rows
pub const UID_ALL: Uid = -1;
/// Reserved owner collecting traffic of owners that no longer exist
pub const UID_REMOVED: Uid = -4;
/// Reserved owner for traffic tethered through the device
pub const UID_TETHERING: Uid = -5;
/// The system identity; callers with this application id see every owner
pub const SYSTEM_UID: Uid = 1000;
/// Owner ids are partitioned into per-user ranges of this width
pub const PER_USER_RANGE: i32 = 100_000;
/// The "untagged" sentinel
pub const TAG_NONE: Tag = 0;

/// Start of the counter set range reserved for debug accounting
pub const SET_DEBUG_START: i32 = 1000;

/// The user an owner id belongs to
#[must_use]
pub fn user_id(uid: Uid) -> i32 {
    uid / PER_USER_RANGE
}

/// The application id of an owner, independent of user
#[must_use]
pub fn app_id(uid: Uid) -> i32 {
    uid % PER_USER_RANGE
}

/// The owner id for `app_id` installed for `user_id`
#[must_use]
pub fn uid_for_user(user_id: i32, app_id: i32) -> Uid {
    user_id * PER_USER_RANGE + app_id % PER_USER_RANGE
}

/// Render a tag the way dumps print it
#[must_use]
pub fn tag_to_string(tag: Tag) -> String {
    format!("0x{tag:x}")
}

/// Coarse sub-partition of an owner's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CounterSet {
    /// Wildcard, matches every set in queries
    All,
    /// Background traffic
    #[default]
    Default,
    /// Traffic while the owner was in the foreground
    Foreground,
    /// Debug-only accounting ranges, never summarised
    Debug(i32),
}

/// Debug set for traffic entering a VPN
pub const SET_DBG_VPN_IN: CounterSet = CounterSet::Debug(1001);
/// Debug set for traffic leaving a VPN
pub const SET_DBG_VPN_OUT: CounterSet = CounterSet::Debug(1002);

impl CounterSet {
    /// The on-disk integer code
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::All => -1,
            Self::Default => 0,
            Self::Foreground => 1,
            Self::Debug(code) => code,
        }
    }

    /// Decode an integer code, `None` when it names no known set
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::All),
            0 => Some(Self::Default),
            1 => Some(Self::Foreground),
            code if code >= SET_DEBUG_START => Some(Self::Debug(code)),
            _ => None,
        }
    }

    /// True for the debug-only ranges
    #[must_use]
    pub fn is_debug(self) -> bool {
        matches!(self, Self::Debug(_))
    }

    /// Does a query for `self` select data recorded under `data`? The
    /// wildcard leaves out debug sets, which only an exact query selects.
    #[must_use]
    pub fn matches(self, data: Self) -> bool {
        if self == Self::All {
            !data.is_debug()
        } else {
            self == data
        }
    }

    /// Short form used by checkin output
    #[must_use]
    pub fn checkin_name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Default => "def",
            Self::Foreground => "fg",
            SET_DBG_VPN_IN => "vpnin",
            SET_DBG_VPN_OUT => "vpnout",
            Self::Debug(_) => "unk",
        }
    }
}

impl PartialOrd for CounterSet {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CounterSet {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.code().cmp(&other.code())
    }
}

impl fmt::Display for CounterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::All => write!(f, "ALL"),
            Self::Default => write!(f, "DEFAULT"),
            Self::Foreground => write!(f, "FOREGROUND"),
            SET_DBG_VPN_IN => write!(f, "DBG_VPN_IN"),
            SET_DBG_VPN_OUT => write!(f, "DBG_VPN_OUT"),
            Self::Debug(code) => write!(f, "DEBUG_{code}"),
        }
    }
}

/// The additive counters carried by every row and every bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Bytes received
    pub rx_bytes: u64,
    /// Packets received
    pub rx_packets: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
    /// Packets transmitted
    pub tx_packets: u64,
    /// Application-level operations
    pub operations: u64,
}

impl Counters {
    /// Construct from individual values
    #[must_use]
    pub fn new(
        rx_bytes: u64,
        rx_packets: u64,
        tx_bytes: u64,
        tx_packets: u64,
        operations: u64,
    ) -> Self {
        Self {
            rx_bytes,
            rx_packets,
            tx_bytes,
            tx_packets,
            operations,
        }
    }

    /// Sum of received and transmitted bytes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    /// True when every counter is zero
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Add `other` into `self`, saturating
    pub fn add(&mut self, other: &Self) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.operations = self.operations.saturating_add(other.operations);
    }

    /// Would subtracting `earlier` from `self` go negative in any field?
    #[must_use]
    pub fn decreased_from(&self, earlier: &Self) -> bool {
        self.rx_bytes < earlier.rx_bytes
            || self.rx_packets < earlier.rx_packets
            || self.tx_bytes < earlier.tx_bytes
            || self.tx_packets < earlier.tx_packets
            || self.operations < earlier.operations
    }

    /// Field-wise difference, clamping decreases to zero
    #[must_use]
    pub fn saturating_delta(&self, earlier: &Self) -> Self {
        Self {
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            tx_packets: self.tx_packets.saturating_sub(earlier.tx_packets),
            operations: self.operations.saturating_sub(earlier.operations),
        }
    }
}

/// One row of a [`NetworkStats`] table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Interface name, `None` when the row covers all interfaces
    pub iface: Option<String>,
    /// Owner the traffic is attributed to
    pub uid: Uid,
    /// Counter set
    pub set: CounterSet,
    /// Tag, [`TAG_NONE`] when untagged
    pub tag: Tag,
    /// The counters themselves
    pub counters: Counters,
}

impl Entry {
    /// A zeroed row for the given key
    #[must_use]
    pub fn new(iface: Option<&str>, uid: Uid, set: CounterSet, tag: Tag) -> Self {
        Self {
            iface: iface.map(str::to_string),
            uid,
            set,
            tag,
            counters: Counters::default(),
        }
    }

    /// Replace this row's counters
    #[must_use]
    pub fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }

    fn key(&self) -> RowKey {
        (self.iface.clone(), self.uid, self.set, self.tag)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "iface={} uid={} set={} tag={} rxBytes={} rxPackets={} txBytes={} txPackets={} operations={}",
            self.iface.as_deref().unwrap_or("*"),
            self.uid,
            self.set,
            tag_to_string(self.tag),
            c.rx_bytes,
            c.rx_packets,
            c.tx_bytes,
            c.tx_packets,
            c.operations
        )
    }
}

type RowKey = (Option<String>, Uid, CounterSet, Tag);

/// A table of counter rows, unique per (iface, owner, set, tag).
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    /// Monotonic clock reading, in milliseconds, when the sample was taken.
    /// For deltas this is the elapsed time between the two samples.
    pub elapsed_realtime_ms: u64,
    rows: Vec<Entry>,
    index: FxHashMap<RowKey, usize>,
}

impl PartialEq for NetworkStats {
    fn eq(&self, other: &Self) -> bool {
        self.elapsed_realtime_ms == other.elapsed_realtime_ms && self.rows == other.rows
    }
}

impl NetworkStats {
    /// An empty table sampled at `elapsed_realtime_ms`
    #[must_use]
    pub fn new(elapsed_realtime_ms: u64) -> Self {
        Self {
            elapsed_realtime_ms,
            rows: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.rows.iter()
    }

    /// Find the row for a key
    #[must_use]
    pub fn find(&self, iface: Option<&str>, uid: Uid, set: CounterSet, tag: Tag) -> Option<&Entry> {
        self.index
            .get(&(iface.map(str::to_string), uid, set, tag))
            .map(|&i| &self.rows[i])
    }

    /// Add `entry` into the row with the same key, creating it if needed.
    pub fn combine_values(&mut self, entry: Entry) -> &mut Self {
        if let Some(&i) = self.index.get(&entry.key()) {
            self.rows[i].counters.add(&entry.counters);
        } else {
            self.index.insert(entry.key(), self.rows.len());
            self.rows.push(entry);
        }
        self
    }

    /// Combine every row of `other` into this table.
    pub fn combine_all(&mut self, other: &Self) {
        for entry in &other.rows {
            self.combine_values(entry.clone());
        }
    }

    /// Sum of every row's counters
    #[must_use]
    pub fn total(&self) -> Counters {
        let mut total = Counters::default();
        for entry in &self.rows {
            total.add(&entry.counters);
        }
        total
    }

    /// Sum of every row's rx and tx bytes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total().total_bytes()
    }

    /// Overwrite the operation count of each row with the matching row in
    /// `operations`, or zero when there is none.
    pub fn splice_operations_from(&mut self, operations: &Self) {
        for entry in &mut self.rows {
            entry.counters.operations = operations
                .index
                .get(&entry.key())
                .map_or(0, |&j| operations.rows[j].counters.operations);
        }
    }

    /// A copy of this table without any row owned by one of `owners`.
    #[must_use]
    pub fn without_owners(&self, owners: &[Uid]) -> Self {
        let mut kept = Self::new(self.elapsed_realtime_ms);
        for entry in self.rows.iter().filter(|e| !owners.contains(&e.uid)) {
            kept.combine_values(entry.clone());
        }
        kept
    }

    /// A copy of this table with every row's interface collapsed.
    #[must_use]
    pub fn flatten_ifaces(&self) -> Self {
        let mut flat = Self::new(self.elapsed_realtime_ms);
        for entry in &self.rows {
            let mut entry = entry.clone();
            entry.iface = None;
            flat.combine_values(entry);
        }
        flat
    }

    /// Compute `self - previous`, row by row.
    ///
    /// Rows only present in `self` pass through whole, rows only present in
    /// `previous` are dropped. A row whose counters went backwards, or a
    /// clock that went backwards, is reported to `observer` and clamped to
    /// zero.
    #[must_use]
    pub fn subtract(
        &self,
        previous: &Self,
        observer: &dyn NonMonotonicObserver,
        cookie: &str,
    ) -> Self {
        let elapsed = if self.elapsed_realtime_ms < previous.elapsed_realtime_ms {
            observer.found_non_monotonic(&NonMonotonicReport {
                cookie,
                left: self,
                left_index: None,
                right: previous,
                right_index: None,
            });
            0
        } else {
            self.elapsed_realtime_ms - previous.elapsed_realtime_ms
        };

        let mut result = Self::new(elapsed);
        for (i, entry) in self.rows.iter().enumerate() {
            let mut delta = entry.clone();
            if let Some(&j) = previous.index.get(&entry.key()) {
                let before = &previous.rows[j].counters;
                if entry.counters.decreased_from(before) {
                    observer.found_non_monotonic(&NonMonotonicReport {
                        cookie,
                        left: self,
                        left_index: Some(i),
                        right: previous,
                        right_index: Some(j),
                    });
                }
                delta.counters = entry.counters.saturating_delta(before);
            }
            result.combine_values(delta);
        }
        result
    }
}

impl FromIterator<Entry> for NetworkStats {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut stats = Self::new(0);
        for entry in iter {
            stats.combine_values(entry);
        }
        stats
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NetworkStats: elapsedRealtime={}", self.elapsed_realtime_ms)?;
        for (i, entry) in self.rows.iter().enumerate() {
            writeln!(f, "  [{i}] {entry}")?;
        }
        Ok(())
    }
}
