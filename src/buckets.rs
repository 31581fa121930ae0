//! Time-bucketed request counts per IP.
//!
//! Requests are coalesced into fixed-width buckets keyed by `(ip, bucket start)`, so memory
//! and eviction cost scale with the number of buckets rather than the number of requests.
//! The table is not synchronized on its own; the monitor keeps it behind one lock together
//! with its maintenance counter.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::RequestRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub ip_address: String,
    pub time_bucket: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RequestBucketTable {
    buckets: HashMap<BucketKey, u64>,
    total: u64,
    granularity_seconds: i64,
}

impl RequestBucketTable {
    /// `granularity_seconds` below 1 is treated as 1.
    pub fn new(granularity_seconds: i64) -> Self {
        Self {
            buckets: HashMap::new(),
            total: 0,
            granularity_seconds: granularity_seconds.max(1),
        }
    }

    /// Round `time` down to the start of its bucket. Sub-second precision is dropped.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let secs = time.timestamp();
        let start = secs - secs.rem_euclid(self.granularity_seconds);
        DateTime::from_timestamp(start, 0).unwrap_or(time)
    }

    /// Count one request; returns the bucket's new count.
    pub fn record(&mut self, ip: &str, time: DateTime<Utc>) -> u64 {
        let key = BucketKey {
            ip_address: ip.to_string(),
            time_bucket: self.bucket_start(time),
        };
        let count = self.buckets.entry(key).or_insert(0);
        *count += 1;
        self.total += 1;
        *count
    }

    /// Drop every bucket that started before `now - window_seconds`.
    /// Returns how many requests were evicted.
    pub fn evict(&mut self, now: DateTime<Utc>, window_seconds: i64) -> u64 {
        let cutoff = Duration::try_seconds(window_seconds).and_then(|w| now.checked_sub_signed(w));
        // An unrepresentable cutoff is either before every bucket (huge window) or
        // after every bucket (huge negative window).
        let evict_all = cutoff.is_none() && window_seconds < 0;
        let mut evicted = 0;
        self.buckets.retain(|key, count| {
            let expired = match cutoff {
                Some(cutoff) => key.time_bucket < cutoff,
                None => evict_all,
            };
            if expired {
                evicted += *count;
                false
            } else {
                true
            }
        });
        debug_assert!(evicted <= self.total, "evicted more requests than were counted");
        self.total = self.total.saturating_sub(evicted);
        evicted
    }

    pub fn totals_by_ip(&self) -> HashMap<String, u64> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for (key, count) in &self.buckets {
            *totals.entry(key.ip_address.clone()).or_insert(0) += count;
        }
        totals
    }

    /// Running total of all bucket counts.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn count_for(&self, ip: &str, time: DateTime<Utc>) -> Option<u64> {
        let key = BucketKey {
            ip_address: ip.to_string(),
            time_bucket: self.bucket_start(time),
        };
        self.buckets.get(&key).copied()
    }

    // Sorted by (ip, bucket) so dumps are stable
    pub fn records(&self) -> Vec<RequestRecord> {
        let mut records: Vec<RequestRecord> = self
            .buckets
            .iter()
            .map(|(key, count)| RequestRecord {
                ip_address: key.ip_address.clone(),
                time_bucket: key.time_bucket,
                count: *count,
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.ip_address, a.time_bucket).cmp(&(&b.ip_address, b.time_bucket))
        });
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, h, m, s).unwrap()
    }

    fn sum_of_buckets(table: &RequestBucketTable) -> u64 {
        table.records().iter().map(|r| r.count).sum()
    }

    #[test]
    fn bucket_start_rounds_down_to_granularity() {
        let table = RequestBucketTable::new(5);
        let base = at(12, 34, 0);
        for second in 0..5 {
            assert_eq!(table.bucket_start(base + Duration::seconds(second)), base);
        }
        assert_eq!(table.bucket_start(at(12, 34, 57)), at(12, 34, 55));
        let with_millis = at(12, 34, 56) + Duration::milliseconds(750);
        assert_eq!(table.bucket_start(with_millis), at(12, 34, 55));
    }

    #[test]
    fn non_positive_granularity_falls_back_to_one_second() {
        let table = RequestBucketTable::new(0);
        assert_eq!(table.bucket_start(at(12, 34, 57)), at(12, 34, 57));
        let table = RequestBucketTable::new(-5);
        assert_eq!(table.bucket_start(at(12, 34, 57)), at(12, 34, 57));
    }

    #[test]
    fn same_bucket_merges_counts() {
        let mut table = RequestBucketTable::new(5);
        let t = at(12, 34, 56);
        table.record("ip1", t);
        table.record("ip1", t);
        table.record("ip2", t);
        table.record("ip1", t - Duration::seconds(1));

        assert_eq!(table.total(), 4);
        assert_eq!(table.len(), 2);
        assert_eq!(table.count_for("ip1", t), Some(3));
        assert_eq!(table.count_for("ip2", t), Some(1));
        assert_eq!(table.total(), sum_of_buckets(&table));
    }

    #[test]
    fn totals_by_ip_sum_across_buckets() {
        let mut table = RequestBucketTable::new(5);
        let early = at(12, 34, 56);
        let late = at(12, 56, 56);
        table.record("ip1", early);
        for _ in 0..2 {
            table.record("ip2", early);
        }
        for _ in 0..3 {
            table.record("ip1", late);
        }
        for _ in 0..4 {
            table.record("ip2", late);
        }

        let totals = table.totals_by_ip();
        assert_eq!(table.total(), 10);
        assert_eq!(totals.get("ip1"), Some(&4));
        assert_eq!(totals.get("ip2"), Some(&6));
        assert!(!totals.contains_key("ip3"));
    }

    #[test]
    fn evict_keeps_only_the_window() {
        let mut table = RequestBucketTable::new(5);
        let now = at(12, 34, 56);
        for second in 0..10 {
            table.record("ip1", now - Duration::seconds(second));
        }
        // :46-:56 spans the :45, :50 and :55 buckets
        assert_eq!(table.total(), 10);
        assert_eq!(table.len(), 3);

        let evicted = table.evict(now, 5);

        assert_eq!(evicted, 8);
        assert_eq!(table.total(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.count_for("ip1", at(12, 34, 55)), Some(2));
        for record in table.records() {
            assert!(record.time_bucket >= now - Duration::seconds(5));
        }
    }

    #[test]
    fn evict_leaves_surviving_buckets_untouched() {
        let mut table = RequestBucketTable::new(5);
        let now = at(12, 0, 30);
        for _ in 0..3 {
            table.record("ip1", at(12, 0, 0));
        }
        for _ in 0..7 {
            table.record("ip2", at(12, 0, 20));
        }
        table.record("ip1", at(12, 0, 25));
        let before: Vec<RequestRecord> = table
            .records()
            .into_iter()
            .filter(|r| r.time_bucket >= now - Duration::seconds(10))
            .collect();

        assert_eq!(table.evict(now, 10), 3);
        assert_eq!(table.records(), before);
        assert_eq!(table.total(), 8);
        assert_eq!(table.total(), sum_of_buckets(&table));
    }

    #[test]
    fn bucket_on_the_cutoff_survives() {
        let mut table = RequestBucketTable::new(5);
        table.record("ip1", at(12, 0, 25));
        assert_eq!(table.evict(at(12, 0, 30), 5), 0);
        assert_eq!(table.evict(at(12, 0, 31), 5), 1);
        assert!(table.is_empty());
        assert_eq!(table.total(), 0);
    }

    #[test]
    fn clock_regression_never_evicts_future_buckets() {
        let mut table = RequestBucketTable::new(5);
        table.record("ip1", at(12, 10, 0));
        assert_eq!(table.evict(at(12, 0, 0), 5), 0);
        assert_eq!(table.total(), 1);
    }

    #[test]
    fn window_past_the_calendar_keeps_everything() {
        let mut table = RequestBucketTable::new(5);
        table.record("ip1", at(12, 0, 0));
        assert_eq!(table.evict(at(12, 0, 0), 10_000_000_000_000), 0);
        assert_eq!(table.evict(at(12, 0, 0), i64::MAX), 0);
        assert_eq!(table.total(), 1);
    }

    #[test]
    fn hugely_negative_window_drops_everything() {
        let mut table = RequestBucketTable::new(5);
        table.record("ip1", at(12, 0, 0));
        table.record("ip2", at(12, 10, 0));
        assert_eq!(table.evict(at(12, 0, 0), i64::MIN), 2);
        assert!(table.is_empty());
        assert_eq!(table.total(), 0);
    }
}
