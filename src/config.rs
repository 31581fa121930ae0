use std::path::PathBuf;

use clap::Parser;

use crate::bans::EscalationPolicy;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "quotes-gateway")]
#[command(about = "IP-monitoring gateway in front of the quotes application server")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream application server, e.g. "localhost:8000"
    #[arg(short, long, default_value = "localhost:8000")]
    pub upstream: String,

    // Width of a request bucket in seconds
    #[arg(long, default_value_t = 5)]
    pub bucket_seconds: i64,

    // Trailing window requests are summed over, in seconds
    #[arg(long, default_value_t = 30)]
    pub monitor_limit_seconds: i64,

    // More than this many requests inside the window gets an IP banned
    #[arg(long, default_value_t = 30)]
    pub monitor_limit_count: i64,

    // Run maintenance (evict, unban, ban) every N admitted requests
    #[arg(long, default_value_t = 10)]
    pub commit_after_number: u64,

    // Ban length for a first offence
    #[arg(long, default_value_t = 5)]
    pub first_ban_seconds: u64,

    // Repeat offenders get base * multiplier^prior_bans
    #[arg(long, default_value_t = 30)]
    pub base_ban_seconds: u64,

    #[arg(long, default_value_t = 2)]
    pub escalation_multiplier: u64,

    // JSON-lines ban history; bans are kept in memory only when omitted
    #[arg(long)]
    pub ban_store: Option<PathBuf>,

    // Take the client IP from X-Forwarded-For / X-Real-IP (only behind a trusted proxy)
    #[arg(long, default_value_t = false)]
    pub trust_forwarded_for: bool,

    // Fallback log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Tunables for the IP monitor.
///
/// A window or limit of zero (or less) never bans anyone; bans already in force still apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub bucket_seconds: i64,
    pub monitor_limit_seconds: i64,
    pub monitor_limit_count: i64,
    pub commit_after_number: u64,
    pub escalation: EscalationPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 5,
            monitor_limit_seconds: 30,
            monitor_limit_count: 30,
            commit_after_number: 10,
            escalation: EscalationPolicy::default(),
        }
    }
}

impl MonitorConfig {
    pub fn enforcing(&self) -> bool {
        self.monitor_limit_seconds > 0 && self.monitor_limit_count > 0
    }

    // 0 would never trigger maintenance
    pub fn commit_after(&self) -> u64 {
        self.commit_after_number.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub upstream: String,
    pub ban_store: Option<PathBuf>,
    pub trust_forwarded_for: bool,
    pub log_level: String,
    pub monitor: MonitorConfig,
}

impl GatewayConfig {
    // add http:// if not present
    pub fn upstream_url(&self) -> String {
        let upstream = self.upstream.trim().trim_end_matches('/');
        if upstream.starts_with("http") {
            upstream.to_string()
        } else {
            format!("http://{}", upstream)
        }
    }
}

impl From<Args> for GatewayConfig {
    fn from(args: Args) -> Self {
        Self {
            port: args.port,
            upstream: args.upstream,
            ban_store: args.ban_store,
            trust_forwarded_for: args.trust_forwarded_for,
            log_level: args.log_level,
            monitor: MonitorConfig {
                bucket_seconds: args.bucket_seconds,
                monitor_limit_seconds: args.monitor_limit_seconds,
                monitor_limit_count: args.monitor_limit_count,
                commit_after_number: args.commit_after_number,
                escalation: EscalationPolicy {
                    first_offence_seconds: args.first_ban_seconds,
                    base_seconds: args.base_ban_seconds,
                    multiplier: args.escalation_multiplier,
                },
            },
        }
    }
}
