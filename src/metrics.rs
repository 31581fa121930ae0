use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUESTS_ADMITTED: Counter =
        register_counter!("gateway_requests_admitted_total", "Requests let through the IP monitor").unwrap();
    pub static ref REQUESTS_REJECTED: Counter =
        register_counter!("gateway_requests_rejected_total", "Requests refused because the IP is banned").unwrap();
    pub static ref BANS_ISSUED: Counter =
        register_counter!("gateway_bans_issued_total", "IP bans applied").unwrap();
    pub static ref BAN_STORE_ERRORS: Counter =
        register_counter!("gateway_ban_store_errors_total", "Failed reads or writes against the ban store").unwrap();
    pub static ref MAINTENANCE_RUNS: Counter =
        register_counter!("gateway_maintenance_runs_total", "Monitor maintenance passes").unwrap();
    pub static ref TRACKED_BUCKETS: Gauge =
        register_gauge!("gateway_tracked_buckets", "Request buckets currently held").unwrap();
    pub static ref BANNED_IPS: Gauge =
        register_gauge!("gateway_banned_ips", "IPs currently in the ban table").unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gateway_upstream_latency_seconds",
        "Upstream round trip in seconds"
    )
    .unwrap();
}
