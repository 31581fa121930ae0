use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// One aggregated bucket - (ip, bucket start) plus how many requests landed in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub ip_address: String,
    pub time_bucket: DateTime<Utc>,
    pub count: u64,
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IP: ({}) @ {} (x{})",
            self.ip_address,
            self.time_bucket.to_rfc3339(),
            self.count
        )
    }
}

// A ban row as the durable store keeps it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub ip_address: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Read-only snapshot of the monitor, served by `/monitor/dump`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDump {
    pub requests: Vec<String>,
    pub count: u64,
    pub icount: u64,
    pub blocked_ips: Vec<String>,
}

// Body of the 403 sent to banned clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ThrottleMessage {
    pub message: String,
}
