use axum::{Json, extract::State};
use std::sync::Arc;
use crate::models::MonitorDump;
use crate::state::AppState;

// Read-only view of buckets, counters and bans
pub async fn dump_handler(State(state): State<Arc<AppState>>) -> Json<MonitorDump> {
    Json(state.monitor.dump())
}
