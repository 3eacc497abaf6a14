//! Fixed-width time buckets of traffic counters
//!
//! A [`History`] is the time series for a single aggregation key. Samples
//! spanning several buckets are apportioned by time overlap, walking from the
//! newest affected bucket backwards; integer remainders land in the oldest
//! bucket so no byte is ever lost to rounding.

use std::io::{self, Write};

use bytes::BufMut;

use crate::{
    codec::{self, Reader},
    dump::IndentingWriter,
    stats::Counters,
};

const VERSION_INIT: i32 = 1;

/// Errors produced when decoding a [`History`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Underlying primitive decode failed
    #[error(transparent)]
    Codec(#[from] codec::Error),
    /// History header carried a version this crate does not know
    #[error("unknown history version: {version}")]
    UnknownVersion {
        /// The version found
        version: i32,
    },
    /// Bucket duration was zero or negative
    #[error("invalid bucket duration: {duration}")]
    InvalidBucketDuration {
        /// The duration found
        duration: i64,
    },
    /// Buckets were not strictly increasing or not aligned
    #[error("misaligned bucket start {start} for duration {duration}")]
    MisalignedBucket {
        /// Offending bucket start
        start: i64,
        /// The history's bucket duration
        duration: i64,
    },
}

/// Selects which counters a [`History`] retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fields(u8);

impl Fields {
    /// Time the key was observed active
    pub const ACTIVE_TIME: Self = Self(0x01);
    /// Received bytes
    pub const RX_BYTES: Self = Self(0x02);
    /// Received packets
    pub const RX_PACKETS: Self = Self(0x04);
    /// Transmitted bytes
    pub const TX_BYTES: Self = Self(0x08);
    /// Transmitted packets
    pub const TX_PACKETS: Self = Self(0x10);
    /// Operation counts
    pub const OPERATIONS: Self = Self(0x20);
    /// Every field
    pub const ALL: Self = Self(0x3f);

    /// True when every field in `other` is selected
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn mask(self, counters: &Counters) -> Counters {
        let pick = |field, value| if self.contains(field) { value } else { 0 };
        Counters {
            rx_bytes: pick(Self::RX_BYTES, counters.rx_bytes),
            rx_packets: pick(Self::RX_PACKETS, counters.rx_packets),
            tx_bytes: pick(Self::TX_BYTES, counters.tx_bytes),
            tx_packets: pick(Self::TX_PACKETS, counters.tx_packets),
            operations: pick(Self::OPERATIONS, counters.operations),
        }
    }
}

impl std::ops::BitOr for Fields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::ALL
    }
}

/// One time slice `[start, start + bucket_duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bucket {
    /// Start of the slice, epoch milliseconds
    pub start: i64,
    /// Milliseconds of the slice covered by recorded samples
    pub active_time: i64,
    /// The counters
    pub counters: Counters,
}

/// Totals returned from [`History::get_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Values {
    /// Apportioned active time
    pub active_time: i64,
    /// Apportioned counters
    pub counters: Counters,
}

/// A time-sorted series of non-overlapping, aligned buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    bucket_duration: i64,
    fields: Fields,
    buckets: Vec<Bucket>,
}

/// `value * part / whole`, computed without overflow.
fn prorate(value: u64, part: i64, whole: i64) -> u64 {
    let (Ok(part), Ok(whole)) = (u128::try_from(part), u128::try_from(whole)) else {
        return 0;
    };
    if whole == 0 {
        return 0;
    }
    u64::try_from(u128::from(value) * part / whole).unwrap_or(u64::MAX)
}

fn prorate_signed(value: i64, part: i64, whole: i64) -> i64 {
    i64::try_from(prorate(u64::try_from(value).unwrap_or(0), part, whole)).unwrap_or(i64::MAX)
}

impl History {
    /// An empty history of `bucket_duration_ms` wide buckets, retaining
    /// every field. A non-positive duration is raised to one millisecond.
    #[must_use]
    pub fn new(bucket_duration_ms: i64) -> Self {
        Self::with_fields(bucket_duration_ms, Fields::ALL)
    }

    /// An empty history retaining only `fields`.
    #[must_use]
    pub fn with_fields(bucket_duration_ms: i64, fields: Fields) -> Self {
        Self {
            bucket_duration: bucket_duration_ms.max(1),
            fields,
            buckets: Vec::new(),
        }
    }

    /// Redistribute every bucket of `other` into a grid of
    /// `bucket_duration_ms` buckets.
    #[must_use]
    pub fn rebucketed(other: &Self, bucket_duration_ms: i64) -> Self {
        let mut history = Self::with_fields(bucket_duration_ms, other.fields);
        history.record_entire_history(other);
        history
    }

    /// Width of each bucket in milliseconds
    #[must_use]
    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    /// Number of buckets
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no bucket exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Iterate buckets, oldest first
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// Start of the oldest bucket, `i64::MAX` when empty
    #[must_use]
    pub fn start(&self) -> i64 {
        self.buckets.first().map_or(i64::MAX, |b| b.start)
    }

    /// End of the newest bucket, `i64::MIN` when empty
    #[must_use]
    pub fn end(&self) -> i64 {
        self.buckets
            .last()
            .map_or(i64::MIN, |b| b.start.saturating_add(self.bucket_duration))
    }

    /// Sum of rx and tx bytes across all buckets
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .fold(0u64, |acc, b| acc.saturating_add(b.counters.total_bytes()))
    }

    fn align_down(&self, t: i64) -> i64 {
        t - t.rem_euclid(self.bucket_duration)
    }

    /// Make sure buckets exist covering `[start, end)`.
    fn ensure_buckets(&mut self, start: i64, end: i64) {
        let first = self.align_down(start);
        let mut t = first;
        loop {
            if let Err(i) = self.buckets.binary_search_by_key(&t, |b| b.start) {
                self.buckets.insert(
                    i,
                    Bucket {
                        start: t,
                        ..Bucket::default()
                    },
                );
            }
            match t.checked_add(self.bucket_duration) {
                Some(next) if next < end => t = next,
                _ => break,
            }
        }
    }

    /// Index one past the last bucket starting before `t`.
    fn index_after(&self, t: i64) -> usize {
        self.buckets.partition_point(|b| b.start <= t)
    }

    /// Apportion `counters` and `active_time` over `[start, end)`.
    fn apportion(&mut self, start: i64, end: i64, counters: &Counters, active_time: i64) {
        let counters = self.fields.mask(counters);
        let mut rest = counters;
        let mut rest_active = active_time;
        let mut duration = end - start;
        let bucket_duration = self.bucket_duration;
        let upto = self.index_after(end);

        for bucket in self.buckets[..upto].iter_mut().rev() {
            let bucket_start = bucket.start;
            let bucket_end = bucket_start.saturating_add(bucket_duration);
            if bucket_end <= start {
                break;
            }
            let overlap = bucket_end.min(end) - bucket_start.max(start);
            if overlap <= 0 {
                continue;
            }
            let frac = Counters {
                rx_bytes: prorate(rest.rx_bytes, overlap, duration),
                rx_packets: prorate(rest.rx_packets, overlap, duration),
                tx_bytes: prorate(rest.tx_bytes, overlap, duration),
                tx_packets: prorate(rest.tx_packets, overlap, duration),
                operations: prorate(rest.operations, overlap, duration),
            };
            let frac_active = prorate_signed(rest_active, overlap, duration);

            bucket.counters.add(&frac);
            bucket.active_time = bucket.active_time.saturating_add(frac_active);
            rest = rest.saturating_delta(&frac);
            rest_active -= frac_active;
            duration -= overlap;
        }
    }

    /// Record `counters` observed over `[start, end)`, spreading them over
    /// the buckets the interval covers in proportion to overlap.
    ///
    /// A zero-length interval records entirely into the bucket containing
    /// `start`. A reversed interval records nothing.
    pub fn record_data(&mut self, start: i64, end: i64, counters: &Counters) {
        if end < start {
            return;
        }
        if start == end {
            let aligned = self.align_down(start);
            self.ensure_buckets(aligned, aligned.saturating_add(1));
            let end = aligned.saturating_add(self.bucket_duration);
            self.apportion(aligned, end, counters, 0);
            return;
        }
        self.ensure_buckets(start, end);
        self.apportion(start, end, counters, end - start);
    }

    /// Add every whole bucket of `other` that lies inside `[start, end)`.
    pub fn record_history(&mut self, other: &Self, start: i64, end: i64) {
        for bucket in &other.buckets {
            let bucket_start = bucket.start;
            let bucket_end = bucket_start.saturating_add(other.bucket_duration);
            if bucket_start < start || bucket_end > end {
                continue;
            }
            self.ensure_buckets(bucket_start, bucket_end);
            self.apportion(
                bucket_start,
                bucket_end,
                &bucket.counters,
                bucket.active_time,
            );
        }
    }

    /// Add every bucket of `other`.
    pub fn record_entire_history(&mut self, other: &Self) {
        self.record_history(other, i64::MIN, i64::MAX);
    }

    /// Totals for `[start, end)`, prorating partially covered buckets.
    ///
    /// The bucket containing `now` is still filling, so it contributes in
    /// full rather than being scaled down by the part of it not yet elapsed.
    #[must_use]
    pub fn get_values(&self, start: i64, end: i64, now: i64) -> Values {
        let mut values = Values::default();
        let duration = self.bucket_duration;
        for bucket in self.buckets[..self.index_after(end)].iter().rev() {
            let bucket_start = bucket.start;
            let bucket_end = bucket_start.saturating_add(duration);
            if bucket_end <= start {
                break;
            }
            if bucket_start >= end {
                continue;
            }
            let active = bucket_start < now && bucket_end > now;
            let overlap = if active {
                duration
            } else {
                bucket_end.min(end) - bucket_start.max(start)
            };
            if overlap <= 0 {
                continue;
            }
            let c = &bucket.counters;
            values.active_time = values
                .active_time
                .saturating_add(prorate_signed(bucket.active_time, overlap, duration));
            values.counters.add(&Counters {
                rx_bytes: prorate(c.rx_bytes, overlap, duration),
                rx_packets: prorate(c.rx_packets, overlap, duration),
                tx_bytes: prorate(c.tx_bytes, overlap, duration),
                tx_packets: prorate(c.tx_packets, overlap, duration),
                operations: prorate(c.operations, overlap, duration),
            });
        }
        values
    }

    /// Append the binary form of this history to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32(VERSION_INIT);
        out.put_i64(self.bucket_duration);
        codec::put_count(out, self.buckets.len());
        for bucket in &self.buckets {
            out.put_i64(bucket.start);
            out.put_i64(bucket.active_time);
            out.put_i64(codec::counter_to_disk(bucket.counters.rx_bytes));
            out.put_i64(codec::counter_to_disk(bucket.counters.rx_packets));
            out.put_i64(codec::counter_to_disk(bucket.counters.tx_bytes));
            out.put_i64(codec::counter_to_disk(bucket.counters.tx_packets));
            out.put_i64(codec::counter_to_disk(bucket.counters.operations));
        }
    }

    /// Decode a history written by [`History::write_to`].
    ///
    /// # Errors
    ///
    /// Fails on truncated input, an unknown version, a non-positive bucket
    /// duration or buckets that are unsorted or misaligned.
    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.i32("history version")?;
        if version != VERSION_INIT {
            return Err(Error::UnknownVersion { version });
        }
        let duration = reader.i64("bucket duration")?;
        if duration <= 0 {
            return Err(Error::InvalidBucketDuration { duration });
        }
        let count = reader.count("bucket count")?;
        let mut buckets = Vec::with_capacity(count.min(reader.remaining() / 56));
        for _ in 0..count {
            let start = reader.i64("bucket start")?;
            let misaligned = start.rem_euclid(duration) != 0;
            let unsorted = buckets.last().is_some_and(|prev: &Bucket| prev.start >= start);
            if misaligned || unsorted {
                return Err(Error::MisalignedBucket { start, duration });
            }
            let active_time = reader.i64("active time")?.max(0);
            let counters = Counters {
                rx_bytes: codec::counter_from_disk(reader.i64("rx bytes")?),
                rx_packets: codec::counter_from_disk(reader.i64("rx packets")?),
                tx_bytes: codec::counter_from_disk(reader.i64("tx bytes")?),
                tx_packets: codec::counter_from_disk(reader.i64("tx packets")?),
                operations: codec::counter_from_disk(reader.i64("operations")?),
            };
            buckets.push(Bucket {
                start,
                active_time,
                counters,
            });
        }
        Ok(Self {
            bucket_duration: duration,
            fields: Fields::ALL,
            buckets,
        })
    }

    /// Human-readable dump. Unless `full`, only the newest 32 buckets are
    /// printed.
    ///
    /// # Errors
    ///
    /// Propagates failures of the underlying writer.
    pub fn dump<W: Write>(&self, out: &mut IndentingWriter<W>, full: bool) -> io::Result<()> {
        writeln!(
            out,
            "NetworkStatsHistory: bucketDuration={}",
            self.bucket_duration / 1000
        )?;
        out.increase_indent();
        let skip = if full {
            0
        } else {
            self.buckets.len().saturating_sub(32)
        };
        if skip > 0 {
            writeln!(out, "(omitting {skip} buckets)")?;
        }
        for bucket in &self.buckets[skip..] {
            let c = &bucket.counters;
            writeln!(
                out,
                "st={} rb={} rp={} tb={} tp={} op={}",
                bucket.start / 1000,
                c.rx_bytes,
                c.rx_packets,
                c.tx_bytes,
                c.tx_packets,
                c.operations
            )?;
        }
        out.decrease_indent();
        Ok(())
    }

    /// Compact comma-separated dump: a `d,<seconds>` header then one
    /// `b,<start>,<rb>,<rp>,<tb>,<tp>,<op>` line per bucket.
    ///
    /// # Errors
    ///
    /// Propagates failures of the underlying writer.
    pub fn dump_checkin<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "d,{}", self.bucket_duration / 1000)?;
        for bucket in &self.buckets {
            let c = &bucket.counters;
            writeln!(
                out,
                "b,{},{},{},{},{},{}",
                bucket.start / 1000,
                c.rx_bytes,
                c.rx_packets,
                c.tx_bytes,
                c.tx_packets,
                c.operations
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: i64 = 60 * 1000;
    const HOUR: i64 = 60 * MINUTE;

    fn rx(bytes: u64) -> Counters {
        Counters::new(bytes, 0, 0, 0, 0)
    }

    #[test]
    fn sample_spanning_buckets_is_apportioned_by_overlap() {
        let mut history = History::new(HOUR);
        history.record_data(0, 30 * MINUTE, &rx(150));
        history.record_data(30 * MINUTE, 90 * MINUTE, &rx(50));

        let buckets: Vec<_> = history.buckets().copied().collect();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].start, 0);
        assert_eq!(buckets[0].counters.rx_bytes, 175);
        assert_eq!(buckets[1].start, HOUR);
        assert_eq!(buckets[1].counters.rx_bytes, 25);
        assert_eq!(history.total_bytes(), 200);
        assert_eq!(buckets[0].active_time, HOUR);
    }

    #[test]
    fn rounding_residue_lands_in_oldest_bucket() {
        let mut history = History::new(HOUR);
        history.record_data(0, 3 * HOUR, &rx(10));
        let split: Vec<u64> = history.buckets().map(|b| b.counters.rx_bytes).collect();
        assert_eq!(split, vec![4, 3, 3]);
    }

    #[test]
    fn zero_length_sample_lands_in_its_bucket() {
        let mut history = History::new(HOUR);
        history.record_data(HOUR + 5, HOUR + 5, &rx(9));
        assert_eq!(history.len(), 1);
        let bucket = history.buckets().next().unwrap();
        assert_eq!(bucket.start, HOUR);
        assert_eq!(bucket.counters.rx_bytes, 9);
    }

    #[test]
    fn active_bucket_is_counted_in_full() {
        let mut history = History::new(HOUR);
        history.record_data(0, HOUR, &rx(100));
        assert_eq!(history.get_values(0, 30 * MINUTE, i64::MAX).counters.rx_bytes, 50);
        assert_eq!(history.get_values(0, 30 * MINUTE, 10 * MINUTE).counters.rx_bytes, 100);
    }

    #[test]
    fn record_history_takes_only_whole_buckets_in_range() {
        let mut source = History::new(HOUR);
        source.record_data(0, 4 * HOUR, &rx(400));
        let mut target = History::new(HOUR);
        target.record_history(&source, HOUR, 3 * HOUR + 1);
        assert_eq!(target.len(), 2);
        assert_eq!(target.total_bytes(), 200);
    }

    #[test]
    fn empty_history_bounds_are_sentinels() {
        let history = History::new(HOUR);
        assert_eq!(history.start(), i64::MAX);
        assert_eq!(history.end(), i64::MIN);
    }

    #[test]
    fn fields_mask_discards_unselected_counters() {
        let mut history = History::with_fields(HOUR, Fields::RX_BYTES | Fields::TX_BYTES);
        history.record_data(0, HOUR, &Counters::new(10, 1, 20, 2, 3));
        let bucket = history.buckets().next().unwrap();
        assert_eq!(bucket.counters, Counters::new(10, 0, 20, 0, 0));
    }

    #[test]
    fn misaligned_bucket_fails_read() {
        let mut out = Vec::new();
        out.put_i32(VERSION_INIT);
        out.put_i64(HOUR);
        out.put_i32(1);
        out.put_i64(5);
        for _ in 0..6 {
            out.put_i64(0);
        }
        assert!(matches!(
            History::read_from(&mut Reader::new(&out)),
            Err(Error::MisalignedBucket { start: 5, .. })
        ));
    }

    #[test]
    fn checkin_dump_lists_buckets() {
        let mut history = History::new(HOUR);
        history.record_data(0, HOUR, &Counters::new(1, 2, 3, 4, 5));
        let mut out = Vec::new();
        history.dump_checkin(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "d,3600\nb,0,1,2,3,4,5\n");
    }

    fn sample() -> impl Strategy<Value = (i64, i64, u64)> {
        (0..48 * HOUR, 0..6 * HOUR, 0..1_000_000u64)
            .prop_map(|(start, len, bytes)| (start, start + len, bytes))
    }

    proptest! {
        #[test]
        fn totals_survive_apportionment(samples in proptest::collection::vec(sample(), 1..16)) {
            let mut history = History::new(HOUR);
            let mut expected = 0u64;
            for (start, end, bytes) in samples {
                history.record_data(start, end, &rx(bytes));
                expected += bytes;
            }
            prop_assert_eq!(history.total_bytes(), expected);
            let all = history.get_values(i64::MIN, i64::MAX, i64::MAX);
            prop_assert_eq!(all.counters.rx_bytes, expected);
        }

        #[test]
        fn disjoint_queries_sum_to_union(
            samples in proptest::collection::vec(sample(), 1..16),
            split in 0..60i64,
        ) {
            let mut history = History::new(HOUR);
            for (start, end, bytes) in samples {
                history.record_data(start, end, &rx(bytes));
            }
            let mid = split * HOUR;
            let end = 60 * HOUR;
            let left = history.get_values(0, mid, i64::MAX).counters.rx_bytes;
            let right = history.get_values(mid, end, i64::MAX).counters.rx_bytes;
            let whole = history.get_values(0, end, i64::MAX).counters.rx_bytes;
            prop_assert_eq!(left + right, whole);
        }

        #[test]
        fn rebucketing_is_idempotent_and_total_preserving(
            samples in proptest::collection::vec(sample(), 1..16),
            factor in 1..6i64,
        ) {
            let mut history = History::new(HOUR);
            for (start, end, bytes) in samples {
                history.record_data(start, end, &rx(bytes));
            }
            let wide = History::rebucketed(&history, factor * HOUR);
            prop_assert_eq!(&History::rebucketed(&wide, factor * HOUR), &wide);
            let back = History::rebucketed(&wide, HOUR);
            prop_assert_eq!(back.total_bytes(), history.total_bytes());
        }

        #[test]
        fn binary_form_round_trips(samples in proptest::collection::vec(sample(), 0..16)) {
            let mut history = History::new(2 * HOUR);
            for (start, end, bytes) in samples {
                history.record_data(start, end, &Counters::new(bytes, bytes / 7, bytes / 3, 1, 2));
            }
            let mut out = Vec::new();
            history.write_to(&mut out);
            let mut reader = Reader::new(&out);
            let decoded = History::read_from(&mut reader).unwrap();
            prop_assert_eq!(reader.remaining(), 0);
            prop_assert_eq!(decoded, history);
        }
    }
}
