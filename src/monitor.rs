//! The request-rate IP monitor.
//!
//! Every inbound request goes through [`RateMonitor::admit`]. Banned IPs are refused straight
//! away and their traffic is not counted. Everything else lands in a time bucket, and every
//! `commit_after_number` admitted requests a maintenance pass runs inline: stale buckets are
//! evicted, expired bans purged, and IPs over the limit for the window banned.
//!
//! Bucket table and maintenance counter share one lock. The ban table is a concurrent map of
//! its own, so the deny path never touches the bucket lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ban_store::BanStore;
use crate::bans::{BanTable, PendingBan, Persistence};
use crate::buckets::RequestBucketTable;
use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::metrics::{MAINTENANCE_RUNS, REQUESTS_ADMITTED, REQUESTS_REJECTED, TRACKED_BUCKETS};
use crate::models::MonitorDump;

struct MonitorState {
    buckets: RequestBucketTable,
    // admitted requests since the last maintenance pass
    icount: u64,
}

pub struct RateMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    bans: BanTable,
    clock: Arc<dyn Clock>,
}

impl RateMonitor {
    /// Build a monitor and load the store's active bans into it.
    pub fn new(config: MonitorConfig, store: Arc<dyn BanStore>, clock: Arc<dyn Clock>) -> Self {
        let bans = BanTable::new(store, config.escalation);
        Self::build(config, bans, clock)
    }

    /// Build a monitor whose ban table starts from `seed`; the store is not read.
    pub fn with_bans(
        config: MonitorConfig,
        store: Arc<dyn BanStore>,
        clock: Arc<dyn Clock>,
        seed: impl IntoIterator<Item = (String, DateTime<Utc>)>,
    ) -> Self {
        let bans = BanTable::seeded(store, config.escalation, seed);
        Self::build(config, bans, clock)
    }

    fn build(config: MonitorConfig, bans: BanTable, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        bans.load_from_store(now);
        tracing::info!(
            window_secs = config.monitor_limit_seconds,
            limit = config.monitor_limit_count,
            commit_after = config.commit_after(),
            banned = bans.len(),
            "IP monitor created at {}",
            now.to_rfc3339()
        );
        Self {
            config,
            state: Mutex::new(MonitorState {
                buckets: RequestBucketTable::new(config.bucket_seconds),
                icount: 0,
            }),
            bans,
            clock,
        }
    }

    /// Hand durable ban writes to a background writer instead of writing inline.
    pub fn persist_in_background(mut self, tx: mpsc::UnboundedSender<PendingBan>) -> Self {
        self.bans.set_persistence(Persistence::Queued(tx));
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn bans(&self) -> &BanTable {
        &self.bans
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decide whether a request from `ip` at `now` may proceed.
    ///
    /// A banned IP's own request purges expired bans first, so a ban that has just run out is
    /// lifted on that request rather than at the next maintenance pass. An empty `ip` is
    /// admitted without being counted.
    pub fn admit(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let ip = ip.trim();
        if ip.is_empty() {
            tracing::debug!("request without a client IP admitted uncounted");
            return true;
        }

        if self.bans.contains(ip) {
            // without this a banned IP could never clear itself
            self.bans.purge_expired(now);
            if self.bans.is_banned(ip, now) {
                REQUESTS_REJECTED.inc();
                return false;
            }
        }

        let offenders = {
            let mut state = self.state.lock();
            state.buckets.record(ip, now);
            state.icount += 1;
            let commit_after = self.config.commit_after();
            if state.icount >= commit_after {
                state.icount -= commit_after;
                Some(self.sweep(&mut state, now))
            } else {
                None
            }
        };

        if let Some(offenders) = offenders {
            self.ban_all(&offenders, now);
        }

        REQUESTS_ADMITTED.inc();
        true
    }

    /// [`admit`](Self::admit) at the monitor clock's current time.
    pub fn admit_now(&self, ip: &str) -> bool {
        self.admit(ip, self.clock.now())
    }

    /// Run a maintenance pass outside the request counter.
    pub fn run_maintenance(&self, now: DateTime<Utc>) {
        let offenders = {
            let mut state = self.state.lock();
            self.sweep(&mut state, now)
        };
        self.ban_all(&offenders, now);
    }

    // Evict, purge, total up; returns the IPs over the limit, sorted
    fn sweep(&self, state: &mut MonitorState, now: DateTime<Utc>) -> Vec<String> {
        MAINTENANCE_RUNS.inc();
        let evicted = state.buckets.evict(now, self.config.monitor_limit_seconds);
        let unbanned = self.bans.purge_expired(now);
        TRACKED_BUCKETS.set(state.buckets.len() as f64);

        if !self.config.enforcing() {
            return Vec::new();
        }

        let limit = self.config.monitor_limit_count as u64;
        let mut offenders: Vec<String> = state
            .buckets
            .totals_by_ip()
            .into_iter()
            .filter(|(_, total)| *total > limit)
            .map(|(ip, _)| ip)
            .collect();
        offenders.sort();

        tracing::debug!(
            evicted,
            unbanned,
            remaining = state.buckets.total(),
            offenders = offenders.len(),
            "maintenance pass"
        );
        offenders
    }

    fn ban_all(&self, offenders: &[String], now: DateTime<Utc>) {
        for ip in offenders {
            self.bans.ban(ip, now);
        }
    }

    /// Evict buckets older than the window without running the rest of maintenance.
    pub fn evict(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        let evicted = state.buckets.evict(now, self.config.monitor_limit_seconds);
        TRACKED_BUCKETS.set(state.buckets.len() as f64);
        evicted
    }

    pub fn totals_by_ip(&self) -> HashMap<String, u64> {
        self.state.lock().buckets.totals_by_ip()
    }

    /// Requests currently held across all buckets.
    pub fn count(&self) -> u64 {
        self.state.lock().buckets.total()
    }

    pub fn bucket_count(&self, ip: &str, time: DateTime<Utc>) -> Option<u64> {
        self.state.lock().buckets.count_for(ip, time)
    }

    pub fn bucket_len(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn dump(&self) -> MonitorDump {
        let (requests, count, icount) = {
            let state = self.state.lock();
            let requests: Vec<String> = state
                .buckets
                .records()
                .iter()
                .map(ToString::to_string)
                .collect();
            (requests, state.buckets.total(), state.icount)
        };
        let blocked_ips = self
            .bans
            .snapshot()
            .into_iter()
            .map(|(ip, expires)| format!("{}: {}", ip, expires.to_rfc3339()))
            .collect();
        MonitorDump {
            requests,
            count,
            icount,
            blocked_ips,
        }
    }
}
