//! Periodic liveness ping over the legacy HTTP client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::http::HttpClient;
use crate::retry::RetryPolicy;

/// Path the heartbeat is posted to.
pub const HEARTBEAT_PATH: &str = "/heartbeat";

/// Default interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Background task posting a heartbeat every interval.
///
/// Heartbeats are never retried and a failed one is only logged.
#[derive(Debug)]
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn onto the current tokio runtime.
    #[must_use]
    pub fn start(client: &HttpClient, interval: Duration) -> Self {
        let client = Arc::new(client.with_retry(RetryPolicy::no_retry(interval)));
        let task = tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "initialising heartbeat task");
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                debug!("sending heartbeat");
                if let Err(err) = client.post(HEARTBEAT_PATH, &Value::Null).await {
                    error!(error = %err, "heartbeat to server failed");
                }
            }
        });
        Self { task }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(self) {
        self.task.abort();
        // a cancelled task resolves to a JoinError
        let _ = self.task.await;
    }
}
