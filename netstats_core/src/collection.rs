//! Histories indexed by aggregation key
//!
//! A [`Collection`] holds one [`History`] per (identity set, owner, counter
//! set, tag) and owns the binary layout that segment files are written in:
//!
//! ```text
//! collection := magic:i32 version:i32 ident_count:i32 *ident_block
//! ident_block := identity_set entry_count:i32 *(uid:i32 set:i32 tag:i32 history)
//! ```

use std::{
    collections::BTreeMap,
    fs, io,
    io::Write,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::BufMut;
use rustc_hash::FxHashMap;

use crate::{
    codec::{self, Reader},
    dump::IndentingWriter,
    history::{self, Fields, History},
    identity::{self, IdentitySet},
    stats::{
        self, CounterSet, Counters, Entry, NetworkStats, SYSTEM_UID, TAG_NONE, Tag, UID_ALL,
        UID_REMOVED, UID_TETHERING, Uid,
    },
    template::NetworkTemplate,
};

/// File header magic, ASCII "ANET"
pub const FILE_MAGIC: i32 = 0x414E_4554;

const VERSION_NETWORK_INIT: i32 = 1;
const VERSION_UID_INIT: i32 = 1;
const VERSION_UID_WITH_IDENT: i32 = 2;
const VERSION_UID_WITH_TAG: i32 = 3;
const VERSION_UID_WITH_SET: i32 = 4;
const VERSION_UNIFIED_INIT: i32 = 16;

/// Errors produced by [`Collection`] operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading a legacy file failed for a reason other than absence
    #[error("unable to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// Input did not begin with [`FILE_MAGIC`]
    #[error("unexpected magic: {magic:#x}")]
    BadMagic {
        /// The value found
        magic: i32,
    },
    /// Header carried a version this crate cannot read
    #[error("unexpected version: {version}")]
    UnknownVersion {
        /// The version found
        version: i32,
    },
    /// A counter set code outside every known range
    #[error("unknown counter set code: {code}")]
    UnknownSet {
        /// The code found
        code: i32,
    },
    /// Primitive decode failed, usually truncation
    #[error(transparent)]
    Codec(#[from] codec::Error),
    /// An embedded identity set failed to decode
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// An embedded history failed to decode
    #[error(transparent)]
    History(#[from] history::Error),
    /// The caller may not see the requested owner's data
    #[error("network stats history of uid {owner} is forbidden for caller {caller}")]
    AccessDenied {
        /// Owner requested
        owner: Uid,
        /// Identity of the caller
        caller: Uid,
    },
}

/// The aggregation key of one history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    /// Networks active when the traffic was counted
    pub ident: Arc<IdentitySet>,
    /// Owner
    pub uid: Uid,
    /// Counter set
    pub set: CounterSet,
    /// Tag
    pub tag: Tag,
}

impl Key {
    /// Construct a key
    #[must_use]
    pub fn new(ident: Arc<IdentitySet>, uid: Uid, set: CounterSet, tag: Tag) -> Self {
        Self {
            ident,
            uid,
            set,
            tag,
        }
    }
}

/// The owner part of a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerFilter {
    /// Owner, [`UID_ALL`] for interface-level rows
    pub uid: Uid,
    /// Counter set, [`CounterSet::All`] for every set
    pub set: CounterSet,
    /// Tag, matched exactly
    pub tag: Tag,
}

impl OwnerFilter {
    /// Untagged traffic of `uid` in every non-debug counter set
    #[must_use]
    pub fn owner(uid: Uid) -> Self {
        Self {
            uid,
            set: CounterSet::All,
            tag: TAG_NONE,
        }
    }

    /// Interface-level rows, as kept by the network recorders
    #[must_use]
    pub fn network() -> Self {
        Self::owner(UID_ALL)
    }
}

/// May `caller` see data attributed to `owner`?
///
/// The system identity sees everything; everyone else sees their own data
/// and the pseudo-owners that carry no application's traffic.
#[must_use]
pub fn is_accessible(owner: Uid, caller: Uid) -> bool {
    stats::app_id(caller) == SYSTEM_UID
        || owner == caller
        || matches!(owner, UID_ALL | UID_REMOVED | UID_TETHERING)
}

/// In-memory index of histories with cached range, total and dirty state.
#[derive(Debug, Clone)]
pub struct Collection {
    bucket_duration: i64,
    stats: FxHashMap<Key, History>,
    start_millis: i64,
    end_millis: i64,
    total_bytes: u64,
    dirty: bool,
}

impl Collection {
    /// An empty collection recording into `bucket_duration_ms` buckets
    #[must_use]
    pub fn new(bucket_duration_ms: i64) -> Self {
        Self {
            bucket_duration: bucket_duration_ms.max(1),
            stats: FxHashMap::default(),
            start_millis: i64::MAX,
            end_millis: i64::MIN,
            total_bytes: 0,
            dirty: false,
        }
    }

    /// Drop every history and derived state
    pub fn reset(&mut self) {
        self.stats.clear();
        self.start_millis = i64::MAX;
        self.end_millis = i64::MIN;
        self.total_bytes = 0;
        self.dirty = false;
    }

    /// Configured bucket width in milliseconds
    #[must_use]
    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    /// Earliest bucket start, `i64::MAX` when empty
    #[must_use]
    pub fn start_millis(&self) -> i64 {
        self.start_millis
    }

    /// First instant from which every bucket is fully populated
    #[must_use]
    pub fn first_atomic_bucket_millis(&self) -> i64 {
        if self.start_millis == i64::MAX {
            i64::MAX
        } else {
            self.start_millis.saturating_add(self.bucket_duration)
        }
    }

    /// Latest bucket end, `i64::MIN` when empty
    #[must_use]
    pub fn end_millis(&self) -> i64 {
        self.end_millis
    }

    /// Bytes recorded across every history
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// True if anything changed since [`Collection::clear_dirty`]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Forget that anything changed
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// True when nothing has ever been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start_millis == i64::MAX && self.end_millis == i64::MIN
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Iterate every key and its history, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &History)> {
        self.stats.iter()
    }

    fn note_recorded(&mut self, start: i64, end: i64, bytes: u64) {
        self.start_millis = self.start_millis.min(start);
        self.end_millis = self.end_millis.max(end);
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        self.dirty = true;
    }

    /// Rebuild cached range and total from the histories.
    fn recompute_derived(&mut self) {
        self.start_millis = i64::MAX;
        self.end_millis = i64::MIN;
        self.total_bytes = 0;
        for history in self.stats.values() {
            if history.is_empty() {
                continue;
            }
            self.start_millis = self.start_millis.min(history.start());
            self.end_millis = self.end_millis.max(history.end());
            self.total_bytes = self.total_bytes.saturating_add(history.total_bytes());
        }
    }

    /// The history for `key`, created empty or re-bucketed so that it
    /// records at this collection's bucket width.
    fn find_or_create_history(&mut self, key: Key) -> &mut History {
        let duration = self.bucket_duration;
        let history = self
            .stats
            .entry(key)
            .or_insert_with(|| History::new(duration));
        if history.bucket_duration() != duration {
            *history = History::rebucketed(history, duration);
        }
        history
    }

    /// Record `counters` observed over `[start, end)` against a key. A
    /// reversed interval records nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn record_data(
        &mut self,
        ident: &Arc<IdentitySet>,
        uid: Uid,
        set: CounterSet,
        tag: Tag,
        start: i64,
        end: i64,
        counters: &Counters,
    ) {
        if end < start {
            return;
        }
        let history = self.find_or_create_history(Key::new(Arc::clone(ident), uid, set, tag));
        history.record_data(start, end, counters);
        let (start, end) = (history.start(), history.end());
        self.note_recorded(start, end, counters.total_bytes());
    }

    fn record_history(&mut self, key: Key, history: &History) {
        if history.is_empty() {
            return;
        }
        self.note_recorded(history.start(), history.end(), history.total_bytes());
        self.stats
            .entry(key)
            .or_insert_with(|| History::new(history.bucket_duration()))
            .record_entire_history(history);
    }

    /// Merge every history of `other` into this collection.
    pub fn record_collection(&mut self, other: &Self) {
        for (key, history) in &other.stats {
            self.record_history(key.clone(), history);
        }
    }

    /// Sorted, de-duplicated owners that `caller` may see.
    #[must_use]
    pub fn get_relevant_owners(&self, caller: Uid) -> Vec<Uid> {
        let mut owners: Vec<Uid> = self
            .stats
            .keys()
            .map(|key| key.uid)
            .filter(|&uid| is_accessible(uid, caller))
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Sum every history matching `template` and `owner` over `range` into
    /// a fresh history retaining `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessDenied`] if `caller` may not see `owner.uid`.
    pub fn get_history(
        &self,
        template: &NetworkTemplate,
        owner: OwnerFilter,
        fields: Fields,
        range: Range<i64>,
        caller: Uid,
    ) -> Result<History, Error> {
        if !is_accessible(owner.uid, caller) {
            return Err(Error::AccessDenied {
                owner: owner.uid,
                caller,
            });
        }
        let mut combined = History::with_fields(self.bucket_duration, fields);
        if range.is_empty() {
            return Ok(combined);
        }
        for (key, history) in &self.stats {
            if key.uid == owner.uid
                && owner.set.matches(key.set)
                && key.tag == owner.tag
                && template.matches_set(&key.ident)
            {
                combined.record_history(history, range.start, range.end);
            }
        }
        Ok(combined)
    }

    /// One flattened-interface row per (owner, set, tag) matching
    /// `template`, skipping debug sets and owners `caller` may not see.
    #[must_use]
    pub fn get_summary(
        &self,
        template: &NetworkTemplate,
        range: Range<i64>,
        now: i64,
        caller: Uid,
    ) -> NetworkStats {
        let elapsed = u64::try_from(range.end.saturating_sub(range.start)).unwrap_or(0);
        let mut summary = NetworkStats::new(elapsed);
        if range.is_empty() {
            return summary;
        }
        for (key, history) in &self.stats {
            if key.set.is_debug()
                || !is_accessible(key.uid, caller)
                || !template.matches_set(&key.ident)
            {
                continue;
            }
            let values = history.get_values(range.start, range.end, now);
            if !values.counters.is_empty() {
                summary.combine_values(
                    Entry::new(None, key.uid, key.set, key.tag).with_counters(values.counters),
                );
            }
        }
        summary
    }

    /// Remove every history owned by one of `owners`.
    ///
    /// Untagged default-set history is first folded into the matching
    /// [`UID_REMOVED`] key so device totals are preserved; tagged and
    /// non-default history is dropped.
    pub fn remove_owners(&mut self, owners: &[Uid]) {
        let doomed: Vec<Key> = self
            .stats
            .keys()
            .filter(|key| owners.contains(&key.uid))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        for key in doomed {
            let Some(history) = self.stats.remove(&key) else {
                continue;
            };
            if key.tag == TAG_NONE && key.set == CounterSet::Default {
                let removed =
                    Key::new(key.ident, UID_REMOVED, CounterSet::Default, TAG_NONE);
                self.find_or_create_history(removed)
                    .record_entire_history(&history);
            }
        }
        self.recompute_derived();
        self.dirty = true;
    }

    /// Replace every history whose identity set matches `template` with an
    /// empty one.
    pub fn reset_data_usage(&mut self, template: &NetworkTemplate) {
        let duration = self.bucket_duration;
        let mut changed = false;
        for (key, history) in &mut self.stats {
            if template.matches_set(&key.ident) {
                *history = History::new(duration);
                changed = true;
            }
        }
        if changed {
            self.recompute_derived();
            self.dirty = true;
        }
    }

    /// Append the binary form of this collection to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut by_ident: BTreeMap<&Arc<IdentitySet>, Vec<(&Key, &History)>> = BTreeMap::new();
        for (key, history) in &self.stats {
            by_ident.entry(&key.ident).or_default().push((key, history));
        }

        out.put_i32(FILE_MAGIC);
        out.put_i32(VERSION_UNIFIED_INIT);
        codec::put_count(out, by_ident.len());
        for (ident, mut entries) in by_ident {
            entries.sort_by(|a, b| a.0.cmp(b.0));
            ident.write_to(out);
            codec::put_count(out, entries.len());
            for (key, history) in entries {
                out.put_i32(key.uid);
                out.put_i32(key.set.code());
                out.put_i32(key.tag);
                history.write_to(out);
            }
        }
    }

    /// The binary form of this collection
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    /// Merge a collection previously written by [`Collection::write_to`].
    ///
    /// # Errors
    ///
    /// Fails on a bad magic, an unknown version or malformed contents. On
    /// failure the histories read so far have already been merged.
    pub fn read_from(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut reader = Reader::new(data);
        read_magic(&mut reader)?;
        let version = reader.i32("collection version")?;
        if version != VERSION_UNIFIED_INIT {
            return Err(Error::UnknownVersion { version });
        }
        let ident_count = reader.count("identity count")?;
        for _ in 0..ident_count {
            let ident = IdentitySet::read_from(&mut reader)?.into_shared();
            let count = reader.count("entry count")?;
            for _ in 0..count {
                let uid = reader.i32("uid")?;
                let set = read_set(&mut reader)?;
                let tag = reader.i32("tag")?;
                let history = History::read_from(&mut reader)?;
                self.record_history(Key::new(Arc::clone(&ident), uid, set, tag), &history);
            }
        }
        Ok(())
    }

    /// Import a file in the retired interface-only layout. A missing file
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed input.
    pub fn read_legacy_network(&mut self, path: &Path) -> Result<(), Error> {
        let Some(data) = read_optional(path)? else {
            return Ok(());
        };
        let mut reader = Reader::new(&data);
        read_magic(&mut reader)?;
        match reader.i32("legacy network version")? {
            VERSION_NETWORK_INIT => {
                let size = reader.count("identity count")?;
                for _ in 0..size {
                    let ident = IdentitySet::read_from(&mut reader)?.into_shared();
                    let history = History::read_from(&mut reader)?;
                    self.record_history(
                        Key::new(ident, UID_ALL, CounterSet::All, TAG_NONE),
                        &history,
                    );
                }
                Ok(())
            }
            version => Err(Error::UnknownVersion { version }),
        }
    }

    /// Import a file in the retired per-owner layout, keeping tagged rows
    /// when `only_tags` and untagged rows otherwise. The two oldest
    /// versions carry no usable identity mapping and are accepted without
    /// importing anything. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed input.
    pub fn read_legacy_uid(&mut self, path: &Path, only_tags: bool) -> Result<(), Error> {
        let Some(data) = read_optional(path)? else {
            return Ok(());
        };
        let mut reader = Reader::new(&data);
        read_magic(&mut reader)?;
        match reader.i32("legacy uid version")? {
            VERSION_UID_INIT | VERSION_UID_WITH_IDENT => Ok(()),
            version @ (VERSION_UID_WITH_TAG | VERSION_UID_WITH_SET) => {
                let ident_count = reader.count("identity count")?;
                for _ in 0..ident_count {
                    let ident = IdentitySet::read_from(&mut reader)?.into_shared();
                    let count = reader.count("entry count")?;
                    for _ in 0..count {
                        let uid = reader.i32("uid")?;
                        let set = if version >= VERSION_UID_WITH_SET {
                            read_set(&mut reader)?
                        } else {
                            CounterSet::Default
                        };
                        let tag = reader.i32("tag")?;
                        let history = History::read_from(&mut reader)?;
                        if (tag == TAG_NONE) != only_tags {
                            self.record_history(
                                Key::new(Arc::clone(&ident), uid, set, tag),
                                &history,
                            );
                        }
                    }
                }
                Ok(())
            }
            version => Err(Error::UnknownVersion { version }),
        }
    }

    fn sorted_keys(&self) -> Vec<&Key> {
        let mut keys: Vec<&Key> = self.stats.keys().collect();
        keys.sort();
        keys
    }

    /// Key-sorted dump of every history.
    ///
    /// # Errors
    ///
    /// Propagates failures of the underlying writer.
    pub fn dump<W: Write>(&self, out: &mut IndentingWriter<W>) -> io::Result<()> {
        for key in self.sorted_keys() {
            writeln!(
                out,
                "ident={} uid={} set={} tag={}",
                key.ident,
                key.uid,
                key.set,
                stats::tag_to_string(key.tag)
            )?;
            out.increase_indent();
            if let Some(history) = self.stats.get(key) {
                history.dump(out, true)?;
            }
            out.decrease_indent();
        }
        Ok(())
    }

    /// Compact dump grouped under the fixed checkin templates, covering
    /// whole buckets inside `range`.
    ///
    /// # Errors
    ///
    /// Propagates failures of the underlying writer.
    pub fn dump_checkin<W: Write>(&self, out: &mut W, range: Range<i64>) -> io::Result<()> {
        for (template, prefix) in NetworkTemplate::checkin_groups() {
            let mut grouped: BTreeMap<(Uid, CounterSet, Tag), History> = BTreeMap::new();
            for (key, history) in &self.stats {
                if key.set.is_debug() || !template.matches_set(&key.ident) {
                    continue;
                }
                grouped
                    .entry((key.uid, key.set, key.tag))
                    .or_insert_with(|| History::new(history.bucket_duration()))
                    .record_history(history, range.start, range.end);
            }
            for ((uid, set, tag), history) in grouped {
                if history.is_empty() {
                    continue;
                }
                writeln!(out, "c,{prefix},{uid},{},{tag}", set.checkin_name())?;
                history.dump_checkin(out)?;
            }
        }
        Ok(())
    }
}

fn read_magic(reader: &mut Reader<'_>) -> Result<(), Error> {
    let magic = reader.i32("magic")?;
    if magic != FILE_MAGIC {
        return Err(Error::BadMagic { magic });
    }
    Ok(())
}

fn read_set(reader: &mut Reader<'_>) -> Result<CounterSet, Error> {
    let code = reader.i32("set")?;
    CounterSet::from_code(code).ok_or(Error::UnknownSet { code })
}

/// Read a whole file, treating absence as "no data".
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
