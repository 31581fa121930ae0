//! In-memory view of banned IPs, backed by a [`BanStore`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::ban_store::BanStore;
use crate::metrics::{BAN_STORE_ERRORS, BANNED_IPS, BANS_ISSUED};

// Ten years; keeps expiry arithmetic well inside chrono's range
pub const MAX_BAN_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Ban length as a function of how many bans an IP already has on record.
///
/// A first offence gets `first_offence_seconds`; after that it is
/// `base_seconds * multiplier^prior`. With the defaults that is 5s, 60s, 120s, 240s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub first_offence_seconds: u64,
    pub base_seconds: u64,
    pub multiplier: u64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            first_offence_seconds: 5,
            base_seconds: 30,
            multiplier: 2,
        }
    }
}

impl EscalationPolicy {
    pub fn duration_for(&self, prior_bans: u32) -> Duration {
        let seconds = if prior_bans == 0 {
            self.first_offence_seconds
        } else {
            self.base_seconds
                .saturating_mul(self.multiplier.saturating_pow(prior_bans))
        };
        Duration::seconds(seconds.min(MAX_BAN_SECONDS) as i64)
    }
}

// A ban waiting to be written by the background writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBan {
    pub ip_address: String,
    pub expires_at: DateTime<Utc>,
}

/// How `ban` gets its row into the durable store.
#[derive(Debug, Clone)]
pub enum Persistence {
    /// `BanStore::create` runs inline.
    WriteThrough,
    /// Rows go to the writer task; see [`crate::worker::ban_writer`].
    Queued(mpsc::UnboundedSender<PendingBan>),
}

pub struct BanTable {
    active: DashMap<String, DateTime<Utc>>,
    // bans issued per IP while banned, seeded from the store; dropped when the ban expires
    offences: DashMap<String, u32>,
    store: Arc<dyn BanStore>,
    policy: EscalationPolicy,
    persistence: Persistence,
}

impl BanTable {
    pub fn new(store: Arc<dyn BanStore>, policy: EscalationPolicy) -> Self {
        Self {
            active: DashMap::new(),
            offences: DashMap::new(),
            store,
            policy,
            persistence: Persistence::WriteThrough,
        }
    }

    pub fn seeded(
        store: Arc<dyn BanStore>,
        policy: EscalationPolicy,
        seed: impl IntoIterator<Item = (String, DateTime<Utc>)>,
    ) -> Self {
        let table = Self::new(store, policy);
        for (ip, expires_at) in seed {
            table.active.insert(ip, expires_at);
        }
        table
    }

    pub fn set_persistence(&mut self, persistence: Persistence) {
        self.persistence = persistence;
    }

    /// Pull every still-active ban from the store. A table that already holds bans is left
    /// alone, and an unreachable store leaves the table empty.
    pub fn load_from_store(&self, now: DateTime<Utc>) -> usize {
        if !self.active.is_empty() {
            return 0;
        }
        let rows = match self.store.load_active(now) {
            Ok(rows) => rows,
            Err(e) => {
                BAN_STORE_ERRORS.inc();
                tracing::error!("could not load bans, starting with none: {e}");
                return 0;
            }
        };
        let loaded = rows.len();
        for row in rows {
            self.active
                .entry(row.ip_address)
                .and_modify(|expires| {
                    if *expires < row.expires_at {
                        *expires = row.expires_at;
                    }
                })
                .or_insert(row.expires_at);
        }
        BANNED_IPS.set(self.active.len() as f64);
        tracing::info!(loaded, "active bans loaded from store");
        loaded
    }

    pub fn is_banned(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.active
            .get(ip)
            .is_some_and(|expires| *expires > now)
    }

    /// Whether `ip` has an entry at all, expired or not.
    pub fn contains(&self, ip: &str) -> bool {
        self.active.contains_key(ip)
    }

    pub fn expires_at(&self, ip: &str) -> Option<DateTime<Utc>> {
        self.active.get(ip).map(|expires| *expires)
    }

    /// Forget bans that expired before `now`. Store rows are kept.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut purged = Vec::new();
        self.active.retain(|ip, expires| {
            if *expires < now {
                purged.push(ip.clone());
                false
            } else {
                true
            }
        });
        // the store still has the history; the next ban re-reads it
        for ip in &purged {
            self.offences.remove(ip);
        }
        if !purged.is_empty() {
            BANNED_IPS.set(self.active.len() as f64);
        }
        purged.len()
    }

    /// Ban `ip` for the escalated duration and persist the row. The in-memory entry is in
    /// place before this returns, whatever happens to the durable write. Returns the expiry
    /// now in force, which is never shortened by a re-ban.
    pub fn ban(&self, ip: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let prior = self.next_offence(ip);
        let duration = self.policy.duration_for(prior);
        let expires_at = now + duration;

        let effective = *self
            .active
            .entry(ip.to_string())
            .and_modify(|expires| {
                if *expires < expires_at {
                    *expires = expires_at;
                }
            })
            .or_insert(expires_at);

        BANS_ISSUED.inc();
        BANNED_IPS.set(self.active.len() as f64);
        tracing::warn!(
            ip,
            prior_bans = prior,
            duration_secs = duration.num_seconds(),
            "IP ban applied"
        );

        self.persist(ip, expires_at);
        effective
    }

    fn next_offence(&self, ip: &str) -> u32 {
        let mut offences = self.offences.entry(ip.to_string()).or_insert_with(|| {
            match self.store.count_prior_bans(ip) {
                Ok(count) => count,
                Err(e) => {
                    BAN_STORE_ERRORS.inc();
                    tracing::error!(ip, "could not count prior bans, assuming none: {e}");
                    0
                }
            }
        });
        let prior = *offences;
        *offences = prior.saturating_add(1);
        prior
    }

    fn persist(&self, ip: &str, expires_at: DateTime<Utc>) {
        match &self.persistence {
            Persistence::WriteThrough => {
                if let Err(e) = self.store.create(ip, expires_at) {
                    BAN_STORE_ERRORS.inc();
                    tracing::error!(ip, "ban not persisted: {e}");
                }
            }
            Persistence::Queued(tx) => {
                let pending = PendingBan {
                    ip_address: ip.to_string(),
                    expires_at,
                };
                if tx.send(pending).is_err() {
                    BAN_STORE_ERRORS.inc();
                    tracing::error!(ip, "ban writer has stopped, ban not persisted");
                }
            }
        }
    }

    // Sorted by ip
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut bans: Vec<(String, DateTime<Utc>)> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        bans.sort();
        bans
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
