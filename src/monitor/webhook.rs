//! Forwards live reset alerts to an HTTP webhook as JSON.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::live::ResetAlert;

fn alert_to_json(alert: &ResetAlert) -> serde_json::Value {
    serde_json::json!({
        "type": "counter_reset",
        "group_id": alert.group_id,
        "counter_id": alert.counter_id,
        "old_value": alert.old_value,
        "new_value": alert.new_value,
        "delta": alert.delta,
        "timestamp": alert.observed_at.to_rfc3339(),
    })
}

/// Spawn a task posting every alert received on `alerts` to `url`.
/// Delivery failures are logged and dropped.
pub fn spawn_webhook_forwarder(url: String, mut alerts: broadcast::Receiver<ResetAlert>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        info!(url = %url, "Alert webhook forwarder started");
        loop {
            let alert = match alerts.recv().await {
                Ok(alert) => alert,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Alert webhook lagging, alerts dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let result = client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&alert_to_json(&alert))
                .send()
                .await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), group_id = %alert.group_id, "Alert webhook rejected alert");
                }
                Ok(_) => {}
                Err(e) => warn!(group_id = %alert.group_id, "Alert webhook failed: {}", e),
            }
        }
    })
}
