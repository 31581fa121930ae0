//! Durable ban storage.
//!
//! The monitor only needs three things from a store: the bans still active at startup, a way
//! to record a new ban, and how many bans an IP has had before. Rows are never deleted; old
//! ones are the history escalation is computed from.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::BanEntry;

pub trait BanStore: Send + Sync {
    /// Every ban with `expires_at >= now`.
    fn load_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>>;

    fn create(&self, ip: &str, expires_at: DateTime<Utc>) -> Result<BanEntry>;

    fn count_prior_bans(&self, ip: &str) -> Result<u32>;
}

fn active_rows(rows: &[BanEntry], now: DateTime<Utc>) -> Vec<BanEntry> {
    rows.iter()
        .filter(|row| row.expires_at >= now)
        .cloned()
        .collect()
}

fn count_rows(rows: &[BanEntry], ip: &str) -> u32 {
    let count = rows.iter().filter(|row| row.ip_address == ip).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

// Process-local store - tests, and runs without --ban-store
#[derive(Debug, Default)]
pub struct MemoryBanStore {
    rows: Mutex<Vec<BanEntry>>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<BanEntry> {
        self.rows.lock().clone()
    }
}

impl BanStore for MemoryBanStore {
    fn load_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        Ok(active_rows(&self.rows.lock(), now))
    }

    fn create(&self, ip: &str, expires_at: DateTime<Utc>) -> Result<BanEntry> {
        let entry = BanEntry {
            ip_address: ip.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        self.rows.lock().push(entry.clone());
        Ok(entry)
    }

    fn count_prior_bans(&self, ip: &str) -> Result<u32> {
        Ok(count_rows(&self.rows.lock(), ip))
    }
}

/// Append-only JSON-lines file, one `BanEntry` per line.
///
/// The whole history is read once at open and mirrored in memory; `create` appends a line and
/// only updates the mirror once the write succeeded.
#[derive(Debug)]
pub struct JsonFileBanStore {
    path: PathBuf,
    rows: Mutex<Vec<BanEntry>>,
}

impl JsonFileBanStore {
    /// A missing file is an empty store. Lines that fail to parse are skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = Vec::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<BanEntry>(&line) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), line = number + 1, "skipping corrupt ban row: {e}");
                    }
                }
            }
        }

        tracing::info!(path = %path.display(), rows = rows.len(), "ban store opened");
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BanStore for JsonFileBanStore {
    fn load_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        Ok(active_rows(&self.rows.lock(), now))
    }

    fn create(&self, ip: &str, expires_at: DateTime<Utc>) -> Result<BanEntry> {
        let entry = BanEntry {
            ip_address: ip.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        // Holding the lock across the append keeps file order and mirror order identical
        let mut rows = self.rows.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        rows.push(entry.clone());
        Ok(entry)
    }

    fn count_prior_bans(&self, ip: &str) -> Result<u32> {
        Ok(count_rows(&self.rows.lock(), ip))
    }
}
