use std::sync::Arc;
use crate::monitor::RateMonitor;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub monitor: Arc<RateMonitor>,
    pub upstream: String, // base url admitted requests are forwarded to
    pub trust_forwarded_for: bool,
}
