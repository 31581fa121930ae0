use std::sync::Arc;
use tokio::sync::mpsc;
use crate::ban_store::BanStore;
use crate::bans::PendingBan;
use crate::metrics::BAN_STORE_ERRORS;


// Background writer - drains queued bans into the durable store one by one.
// Returns how many rows were written once every sender is gone.
pub async fn ban_writer(
    mut rx: mpsc::UnboundedReceiver<PendingBan>,
    store: Arc<dyn BanStore>,
) -> usize {
    tracing::info!("Ban writer started");
    let mut written = 0;

    // keep receiving bans from the queue
    while let Some(pending) = rx.recv().await {
        let store = Arc::clone(&store);
        let ip = pending.ip_address.clone();

        // store writes are blocking file I/O
        let result = tokio::task::spawn_blocking(move || {
            store.create(&pending.ip_address, pending.expires_at)
        })
        .await;

        match result {
            Ok(Ok(entry)) => {
                written += 1;
                tracing::debug!(ip = %entry.ip_address, expires_at = %entry.expires_at, "ban persisted");
            }
            Ok(Err(e)) => {
                BAN_STORE_ERRORS.inc();
                tracing::error!(ip = %ip, "ban not persisted: {e}");
            }
            Err(e) => {
                BAN_STORE_ERRORS.inc();
                tracing::error!(ip = %ip, "ban writer task failed: {e}");
            }
        }
    }

    tracing::info!(written, "Ban writer stopped");
    written
}
