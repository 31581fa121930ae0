mod health;
mod metrics;
mod dump;
mod proxy;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use dump::dump_handler;
pub use proxy::proxy_handler;
