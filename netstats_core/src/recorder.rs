//! One accounting dimension: snapshot deltas, pending data, segments
//!
//! A [`Recorder`] turns successive cumulative [`NetworkStats`] samples into
//! deltas, folds them into an in-memory pending [`Collection`] and spills
//! that collection into the active segment of its [`FileRotator`] once
//! enough bytes accumulate. The complete history, segments plus pending, is
//! loaded lazily and shared with query sessions through an [`Arc`].

use std::{
    fmt,
    io::{self, Write},
    ops::Range,
    path::Path,
    sync::Arc,
};

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::{
    collection::{self, Collection},
    dump::IndentingWriter,
    identity::IdentitySet,
    observer::NonMonotonicObserver,
    rotator::{self, FileRotator, Rewriter, SegmentReader},
    stats::{Counters, NetworkStats, SYSTEM_UID, TAG_NONE, Uid},
    template::NetworkTemplate,
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Smallest persist threshold a recorder accepts
pub const MIN_PERSIST_THRESHOLD: u64 = KIB;
/// Largest persist threshold a recorder accepts
pub const MAX_PERSIST_THRESHOLD: u64 = 100 * MIB;

/// Errors produced by [`Recorder`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Segment storage failed
    #[error(transparent)]
    Rotator(#[from] rotator::Error),
    /// A legacy file could not be imported
    #[error(transparent)]
    Collection(#[from] collection::Error),
}

/// Reads the existing segment, if any, and writes it back with `pending`
/// merged in. An undecodable segment is replaced.
struct CombiningRewriter<'a> {
    existing: Collection,
    pending: &'a Collection,
}

impl<'a> CombiningRewriter<'a> {
    fn new(pending: &'a Collection) -> Self {
        Self {
            existing: Collection::new(pending.bucket_duration()),
            pending,
        }
    }
}

impl SegmentReader for CombiningRewriter<'_> {
    fn read(&mut self, data: &[u8]) -> Result<(), collection::Error> {
        if let Err(err) = self.existing.read_from(data) {
            warn!(%err, "replacing undecodable active segment");
            counter!("segment_decode_failures_total").increment(1);
            self.existing.reset();
        }
        Ok(())
    }
}

impl Rewriter for CombiningRewriter<'_> {
    fn reset(&mut self) {
        self.existing.reset();
    }

    fn should_write(&self) -> bool {
        true
    }

    fn write(&mut self, out: &mut Vec<u8>) {
        self.existing.record_collection(self.pending);
        self.existing.write_to(out);
    }
}

/// Applies an in-place edit to each segment, rewriting only those that
/// changed. An undecodable segment holds no usable data and is left as is.
struct EditingRewriter<F> {
    temp: Collection,
    edit: F,
}

impl<F: FnMut(&mut Collection)> SegmentReader for EditingRewriter<F> {
    fn read(&mut self, data: &[u8]) -> Result<(), collection::Error> {
        if let Err(err) = self.temp.read_from(data) {
            warn!(%err, "leaving undecodable segment unedited");
            counter!("segment_decode_failures_total").increment(1);
            self.temp.reset();
            return Ok(());
        }
        self.temp.clear_dirty();
        (self.edit)(&mut self.temp);
        Ok(())
    }
}

impl<F: FnMut(&mut Collection)> Rewriter for EditingRewriter<F> {
    fn reset(&mut self) {
        self.temp.reset();
    }

    fn should_write(&self) -> bool {
        self.temp.is_dirty()
    }

    fn write(&mut self, out: &mut Vec<u8>) {
        self.temp.write_to(out);
    }
}

/// Records one dimension of counters.
pub struct Recorder {
    rotator: FileRotator,
    observer: Arc<dyn NonMonotonicObserver>,
    cookie: String,
    bucket_duration: i64,
    only_tags: bool,
    persist_threshold: u64,
    last_snapshot: Option<NetworkStats>,
    pending: Collection,
    since_boot: Collection,
    complete: Option<Arc<Collection>>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("cookie", &self.cookie)
            .field("bucket_duration", &self.bucket_duration)
            .field("only_tags", &self.only_tags)
            .field("persist_threshold", &self.persist_threshold)
            .field("pending_bytes", &self.pending.total_bytes())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create a recorder persisting through `rotator`. When `only_tags`
    /// the recorder keeps tagged rows only, otherwise untagged rows only.
    #[must_use]
    pub fn new(
        rotator: FileRotator,
        observer: Arc<dyn NonMonotonicObserver>,
        cookie: &str,
        bucket_duration_ms: i64,
        only_tags: bool,
    ) -> Self {
        Self {
            rotator,
            observer,
            cookie: cookie.to_string(),
            bucket_duration: bucket_duration_ms,
            only_tags,
            persist_threshold: 2 * MIB,
            last_snapshot: None,
            pending: Collection::new(bucket_duration_ms),
            since_boot: Collection::new(bucket_duration_ms),
            complete: None,
        }
    }

    /// Name used in logs, metrics and diagnostics
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Current persist threshold in bytes
    #[must_use]
    pub fn persist_threshold(&self) -> u64 {
        self.persist_threshold
    }

    /// Set the persist threshold, clamped to
    /// [[`MIN_PERSIST_THRESHOLD`], [`MAX_PERSIST_THRESHOLD`]].
    pub fn set_persist_threshold(&mut self, bytes: u64) {
        self.persist_threshold = bytes.clamp(MIN_PERSIST_THRESHOLD, MAX_PERSIST_THRESHOLD);
        debug!(recorder = %self.cookie, threshold = self.persist_threshold, "persist threshold");
    }

    /// Bytes recorded but not yet written to a segment
    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        self.pending.total_bytes()
    }

    /// Forget every in-memory state, including the baseline snapshot.
    pub fn reset(&mut self) {
        self.last_snapshot = None;
        self.pending.reset();
        self.since_boot.reset();
        self.complete = None;
    }

    /// Traffic recorded since this recorder was created on networks
    /// matching `template`.
    #[must_use]
    pub fn total_since_boot(&self, template: &NetworkTemplate) -> Counters {
        self.since_boot
            .get_summary(template, i64::MIN..i64::MAX, i64::MAX, SYSTEM_UID)
            .total()
    }

    /// Every segment overlapping `range` merged with pending data. A segment
    /// that cannot be decoded is skipped.
    ///
    /// # Errors
    ///
    /// Fails if segments cannot be listed or read.
    pub fn load(&self, range: Range<i64>) -> Result<Collection, Error> {
        let mut loaded = load_segments(&self.rotator, self.bucket_duration, range)?;
        loaded.record_collection(&self.pending);
        Ok(loaded)
    }

    /// The complete history, loaded on first use and kept current by every
    /// later snapshot. Expired segments are removed before a load.
    ///
    /// # Errors
    ///
    /// Fails if segments cannot be rotated, listed or read.
    pub fn get_or_load_complete(&mut self, now: i64) -> Result<Arc<Collection>, Error> {
        if let Some(complete) = &self.complete {
            return Ok(Arc::clone(complete));
        }
        self.rotator.maybe_rotate(now)?;
        let complete = Arc::new(self.load(i64::MIN..i64::MAX)?);
        debug!(recorder = %self.cookie, keys = complete.len(), "loaded complete history");
        self.complete = Some(Arc::clone(&complete));
        Ok(complete)
    }

    /// Record the difference between `snapshot` and the previous one. The
    /// first snapshot only establishes a baseline. Rows on interfaces
    /// absent from `ifaces` are ignored.
    pub fn record_snapshot(
        &mut self,
        snapshot: NetworkStats,
        ifaces: &FxHashMap<String, Arc<IdentitySet>>,
        now: i64,
    ) {
        let Some(previous) = self.last_snapshot.take() else {
            self.last_snapshot = Some(snapshot);
            return;
        };
        let delta = snapshot.subtract(&previous, self.observer.as_ref(), &self.cookie);
        let end = now;
        let start = end.saturating_sub(i64::try_from(delta.elapsed_realtime_ms).unwrap_or(i64::MAX));

        let mut unknown: FxHashSet<&str> = FxHashSet::default();
        let mut complete = self.complete.as_mut().map(Arc::make_mut);
        for entry in delta.iter() {
            let Some(ident) = entry.iface.as_deref().and_then(|iface| ifaces.get(iface)) else {
                unknown.insert(entry.iface.as_deref().unwrap_or("?"));
                continue;
            };
            if entry.counters.is_empty() || (entry.tag == TAG_NONE) == self.only_tags {
                continue;
            }
            let (uid, set, tag, counters) = (entry.uid, entry.set, entry.tag, &entry.counters);
            self.pending.record_data(ident, uid, set, tag, start, end, counters);
            self.since_boot.record_data(ident, uid, set, tag, start, end, counters);
            if let Some(complete) = complete.as_deref_mut() {
                complete.record_data(ident, uid, set, tag, start, end, counters);
            }
        }
        if !unknown.is_empty() {
            debug!(recorder = %self.cookie, ?unknown, "ignoring stats of unknown interfaces");
        }
        #[allow(clippy::cast_precision_loss)]
        let pending = self.pending.total_bytes() as f64;
        gauge!("pending_bytes", "recorder" => self.cookie.clone()).set(pending);
        self.last_snapshot = Some(snapshot);
    }

    /// Persist if pending bytes reached the threshold, otherwise just
    /// rotate.
    ///
    /// # Errors
    ///
    /// Fails if segments cannot be rewritten or rotated.
    pub fn maybe_persist(&mut self, now: i64) -> Result<(), Error> {
        if self.pending.total_bytes() >= self.persist_threshold {
            self.force_persist(now)
        } else {
            self.rotator.maybe_rotate(now).map_err(Error::from)
        }
    }

    /// Write pending data into the active segment. An active segment past
    /// its rotate age is closed first so it receives nothing further.
    /// Pending data is kept if the write fails.
    ///
    /// # Errors
    ///
    /// Fails if segments cannot be rewritten or rotated.
    pub fn force_persist(&mut self, now: i64) -> Result<(), Error> {
        if !self.pending.is_dirty() {
            return Ok(());
        }
        self.rotator.maybe_rotate(now)?;
        self.rotator
            .rewrite_active(&mut CombiningRewriter::new(&self.pending), now)?;
        self.rotator.maybe_rotate(now)?;
        let bytes = self.pending.total_bytes();
        debug!(recorder = %self.cookie, bytes, "persisted pending data");
        counter!("persisted_bytes_total", "recorder" => self.cookie.clone()).increment(bytes);
        self.pending.reset();
        gauge!("pending_bytes", "recorder" => self.cookie.clone()).set(0.0);
        Ok(())
    }

    /// Remove every trace of `owners`, on disk and in memory. Memory is
    /// cleaned even when a segment cannot be rewritten.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be read or rewritten.
    pub fn remove_owners(&mut self, owners: &[Uid]) -> Result<(), Error> {
        let mut rewriter = EditingRewriter {
            temp: Collection::new(self.bucket_duration),
            edit: |collection: &mut Collection| collection.remove_owners(owners),
        };
        let rewritten = self.rotator.rewrite_all(&mut rewriter);
        self.pending.remove_owners(owners);
        self.since_boot.remove_owners(owners);
        if let Some(complete) = self.complete.as_mut() {
            Arc::make_mut(complete).remove_owners(owners);
        }
        if let Some(last) = self.last_snapshot.as_mut() {
            *last = last.without_owners(owners);
        }
        rewritten?;
        info!(recorder = %self.cookie, ?owners, "removed owners");
        Ok(())
    }

    /// Empty every history on networks matching `template`, on disk and in
    /// memory. Memory is cleaned even when a segment cannot be rewritten.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be read or rewritten.
    pub fn reset_data_usage(&mut self, template: &NetworkTemplate) -> Result<(), Error> {
        let mut rewriter = EditingRewriter {
            temp: Collection::new(self.bucket_duration),
            edit: |collection: &mut Collection| collection.reset_data_usage(template),
        };
        let rewritten = self.rotator.rewrite_all(&mut rewriter);
        self.pending.reset_data_usage(template);
        self.since_boot.reset_data_usage(template);
        if let Some(complete) = self.complete.as_mut() {
            Arc::make_mut(complete).reset_data_usage(template);
        }
        rewritten?;
        info!(recorder = %self.cookie, %template, "reset data usage");
        Ok(())
    }

    /// Replace every segment with the contents of a retired interface-level
    /// file. A missing file imports nothing.
    ///
    /// # Errors
    ///
    /// Fails if the file is malformed or segments cannot be written.
    pub fn import_legacy_network(&mut self, path: &Path) -> Result<(), Error> {
        let mut imported = Collection::new(self.bucket_duration);
        imported.read_legacy_network(path)?;
        self.import(&imported)
    }

    /// Replace every segment with the rows of a retired per-owner file that
    /// this recorder keeps. A missing file imports nothing.
    ///
    /// # Errors
    ///
    /// Fails if the file is malformed or segments cannot be written.
    pub fn import_legacy_uid(&mut self, path: &Path) -> Result<(), Error> {
        let mut imported = Collection::new(self.bucket_duration);
        imported.read_legacy_uid(path, self.only_tags)?;
        self.import(&imported)
    }

    fn import(&mut self, imported: &Collection) -> Result<(), Error> {
        self.rotator.delete_all()?;
        self.complete = None;
        if imported.is_empty() {
            return Ok(());
        }
        self.rotator.rewrite_active(
            &mut CombiningRewriter::new(imported),
            imported.start_millis(),
        )?;
        self.rotator.maybe_rotate(imported.end_millis())?;
        info!(
            recorder = %self.cookie,
            keys = imported.len(),
            bytes = imported.total_bytes(),
            "imported legacy history"
        );
        Ok(())
    }

    /// Human-readable dump of pending bytes and either the complete history
    /// or what was recorded since boot.
    ///
    /// # Errors
    ///
    /// Fails if the writer fails or the complete history cannot be loaded.
    pub fn dump<W: Write>(
        &mut self,
        out: &mut IndentingWriter<W>,
        full: bool,
        now: i64,
    ) -> Result<(), DumpError> {
        writeln!(out, "Pending bytes: {}", self.pending.total_bytes())?;
        if full {
            writeln!(out, "Complete history:")?;
            let complete = self.get_or_load_complete(now)?;
            complete.dump(out)?;
        } else {
            writeln!(out, "History since boot:")?;
            self.since_boot.dump(out)?;
        }
        Ok(())
    }

    /// Checkin dump of the complete history over `range`.
    ///
    /// # Errors
    ///
    /// Fails if the writer fails or the complete history cannot be loaded.
    pub fn dump_checkin<W: Write>(
        &mut self,
        out: &mut W,
        range: Range<i64>,
        now: i64,
    ) -> Result<(), DumpError> {
        let complete = self.get_or_load_complete(now)?;
        complete.dump_checkin(out, range)?;
        Ok(())
    }
}

/// Errors produced while dumping a [`Recorder`]
#[derive(thiserror::Error, Debug)]
pub enum DumpError {
    /// The output failed
    #[error("unable to write dump: {0}")]
    Io(#[from] io::Error),
    /// The history could not be loaded
    #[error(transparent)]
    Recorder(#[from] Error),
}

/// Decode every segment of `rotator` overlapping `range` into one
/// collection without touching the segments. Undecodable segments are
/// logged and skipped.
///
/// # Errors
///
/// Fails if segments cannot be listed or read.
pub fn load_segments(
    rotator: &FileRotator,
    bucket_duration_ms: i64,
    range: Range<i64>,
) -> Result<Collection, Error> {
    let mut loaded = Collection::new(bucket_duration_ms);
    rotator.read_matching(range.start, range.end, &mut |path, data| {
        let mut segment = Collection::new(bucket_duration_ms);
        match segment.read_from(data) {
            Ok(()) => loaded.record_collection(&segment),
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping undecodable segment");
                counter!("segment_decode_failures_total").increment(1);
            }
        }
    })?;
    loaded.clear_dirty();
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        collection::OwnerFilter,
        history::Fields,
        identity::tests::{mobile, wifi},
        observer::tests::CountingObserver,
        stats::{CounterSet, Entry, UID_REMOVED},
    };

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    fn recorder(dir: &Path, only_tags: bool) -> (Recorder, Arc<CountingObserver>) {
        let rotator = FileRotator::new(dir, "uid", 15 * DAY, 90 * DAY).unwrap();
        let observer = Arc::new(CountingObserver::default());
        let recorder = Recorder::new(rotator, observer.clone(), "uid", HOUR, only_tags);
        (recorder, observer)
    }

    fn ifaces() -> FxHashMap<String, Arc<IdentitySet>> {
        let mut map = FxHashMap::default();
        map.insert("wlan0".to_string(), wifi("home"));
        map.insert("rmnet0".to_string(), mobile("310"));
        map
    }

    fn sample(elapsed: u64, rows: &[(&str, Uid, i32, u64)]) -> NetworkStats {
        let mut stats = NetworkStats::new(elapsed);
        for &(iface, uid, tag, rx) in rows {
            stats.combine_values(
                Entry::new(Some(iface), uid, CounterSet::Default, tag)
                    .with_counters(Counters::new(rx, 1, 0, 0, 0)),
            );
        }
        stats
    }

    fn owner_rx(collection: &Collection, uid: Uid) -> u64 {
        collection
            .get_history(
                &NetworkTemplate::All,
                OwnerFilter::owner(uid),
                Fields::ALL,
                i64::MIN..i64::MAX,
                SYSTEM_UID,
            )
            .unwrap()
            .buckets()
            .map(|b| b.counters.rx_bytes)
            .sum()
    }

    #[test]
    fn first_snapshot_is_only_a_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[("wlan0", 10_001, 0, 5_000)]), &ifaces(), HOUR);
        assert_eq!(recorder.pending_bytes(), 0);
        recorder.record_snapshot(
            sample(HOUR as u64, &[("wlan0", 10_001, 0, 5_400)]),
            &ifaces(),
            2 * HOUR,
        );
        assert_eq!(recorder.pending_bytes(), 400);
    }

    #[test]
    fn unknown_interfaces_and_other_tag_kind_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), true);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(
            sample(
                1_000,
                &[
                    ("wlan0", 10_001, 0, 100),
                    ("wlan0", 10_001, 7, 30),
                    ("eth9", 10_001, 7, 50),
                ],
            ),
            &ifaces(),
            1_000,
        );
        assert_eq!(recorder.pending_bytes(), 30);
    }

    #[test]
    fn persisted_data_survives_a_fresh_recorder() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut recorder, _) = recorder(dir.path(), false);
            recorder.record_snapshot(sample(0, &[]), &ifaces(), HOUR);
            recorder.record_snapshot(
                sample(1_000, &[("rmnet0", 10_001, 0, 2_000)]),
                &ifaces(),
                HOUR + 1_000,
            );
            recorder.force_persist(HOUR + 1_000).unwrap();
            assert_eq!(recorder.pending_bytes(), 0);
        }
        let (mut recorder, _) = recorder(dir.path(), false);
        let complete = recorder.get_or_load_complete(HOUR + 2_000).unwrap();
        assert_eq!(owner_rx(&complete, 10_001), 2_000);
    }

    #[test]
    fn below_threshold_stays_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.set_persist_threshold(0);
        assert_eq!(recorder.persist_threshold(), MIN_PERSIST_THRESHOLD);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), 10);
        recorder.maybe_persist(10).unwrap();
        assert_eq!(recorder.pending_bytes(), 100);
        assert!(recorder.rotator.segment_paths().unwrap().is_empty());

        recorder.record_snapshot(sample(20, &[("wlan0", 1, 0, 2_000)]), &ifaces(), 20);
        recorder.maybe_persist(20).unwrap();
        assert_eq!(recorder.pending_bytes(), 0);
        assert_eq!(recorder.rotator.segment_paths().unwrap().len(), 1);
    }

    #[test]
    fn stale_active_segment_is_closed_before_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        let old = 100 * DAY - 20 * DAY;
        recorder.record_snapshot(sample(0, &[]), &ifaces(), old);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), old + 10);
        recorder.force_persist(old + 10).unwrap();
        let first = recorder.rotator.segment_paths().unwrap();
        let before = fs::read(&first[0]).unwrap();

        let now = 100 * DAY;
        recorder.record_snapshot(sample(20, &[("wlan0", 1, 0, 300)]), &ifaces(), now);
        recorder.force_persist(now).unwrap();
        let segments = recorder.rotator.segment_paths().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(fs::read(&segments[0]).unwrap(), before);

        let mut fresh = Recorder::new(
            recorder.rotator.clone(),
            Arc::new(CountingObserver::default()),
            "uid",
            HOUR,
            false,
        );
        let complete = fresh.get_or_load_complete(now).unwrap();
        assert_eq!(owner_rx(&complete, 1), 300);
    }

    #[test]
    fn undecodable_segment_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), 10);
        recorder.force_persist(10).unwrap();
        fs::write(dir.path().join("uid.0-5"), b"garbage").unwrap();

        let complete = recorder.get_or_load_complete(20).unwrap();
        assert_eq!(owner_rx(&complete, 1), 100);
    }

    #[test]
    fn complete_history_tracks_new_snapshots_without_touching_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        let held = recorder.get_or_load_complete(0).unwrap();
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), 10);
        assert_eq!(owner_rx(&held, 1), 0);
        let current = recorder.get_or_load_complete(10).unwrap();
        assert_eq!(owner_rx(&current, 1), 100);
    }

    #[test]
    fn owner_removal_reaches_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(
            sample(10, &[("wlan0", 1, 0, 100), ("wlan0", 2, 0, 40)]),
            &ifaces(),
            10,
        );
        recorder.force_persist(10).unwrap();
        recorder.record_snapshot(
            sample(20, &[("wlan0", 1, 0, 150), ("wlan0", 2, 0, 40)]),
            &ifaces(),
            20,
        );
        recorder.remove_owners(&[1]).unwrap();

        let reloaded = recorder.load(i64::MIN..i64::MAX).unwrap();
        assert_eq!(owner_rx(&reloaded, 1), 0);
        assert_eq!(owner_rx(&reloaded, UID_REMOVED), 150);
        assert_eq!(owner_rx(&reloaded, 2), 40);
        assert_eq!(recorder.total_since_boot(&NetworkTemplate::All).rx_bytes, 190);
    }

    #[test]
    fn owner_removal_survives_an_undecodable_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), 10);
        let garbage = dir.path().join("uid.0-5");
        fs::write(&garbage, b"garbage").unwrap();

        recorder.remove_owners(&[1]).unwrap();
        assert_eq!(fs::read(&garbage).unwrap(), b"garbage");
        recorder.force_persist(20).unwrap();

        let reloaded = recorder.load(i64::MIN..i64::MAX).unwrap();
        assert_eq!(owner_rx(&reloaded, 1), 0);
        assert_eq!(owner_rx(&reloaded, UID_REMOVED), 100);
        recorder.reset_data_usage(&NetworkTemplate::All).unwrap();
    }

    #[test]
    fn decreasing_counters_are_reported_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, observer) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[("wlan0", 1, 0, 500)]), &ifaces(), 0);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 200)]), &ifaces(), 10);
        assert_eq!(observer.count(), 1);
        assert_eq!(recorder.pending_bytes(), 0);
    }

    #[test]
    fn reset_data_usage_clears_matching_network_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(
            sample(10, &[("wlan0", 1, 0, 100), ("rmnet0", 1, 0, 60)]),
            &ifaces(),
            10,
        );
        recorder.force_persist(10).unwrap();
        recorder.reset_data_usage(&NetworkTemplate::WifiWildcard).unwrap();
        let reloaded = recorder.load(i64::MIN..i64::MAX).unwrap();
        assert_eq!(owner_rx(&reloaded, 1), 60);
    }

    #[test]
    fn missing_legacy_file_imports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder
            .import_legacy_uid(&dir.path().join("netstats_uid.bin"))
            .unwrap();
        assert!(recorder.rotator.segment_paths().unwrap().is_empty());
    }

    #[test]
    fn dump_reports_pending_and_since_boot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _) = recorder(dir.path(), false);
        recorder.record_snapshot(sample(0, &[]), &ifaces(), 0);
        recorder.record_snapshot(sample(10, &[("wlan0", 1, 0, 100)]), &ifaces(), 10);
        let mut out = IndentingWriter::new(Vec::new());
        recorder.dump(&mut out, false, 10).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.starts_with("Pending bytes: 100\nHistory since boot:\n"));
        assert!(text.contains("uid=1"));
    }
}
