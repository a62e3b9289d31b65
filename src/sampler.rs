#![forbid(unsafe_code)]

// Latency sampler - times connects and message round trips into the metrics

use crate::client::SimulatedClient;
use crate::error::HarnessError;
use crate::metrics::{PerformanceMetrics, SampleKind};
use crate::registry::ClientRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Records one sample per successful operation and one failure per failed
/// one. Never both for the same operation.
#[derive(Clone)]
pub struct LatencySampler {
    metrics: Arc<PerformanceMetrics>,
    wait_window: Duration,
    poll_interval: Duration,
}

/// Unique correlation id embedded in an outgoing message.
pub fn new_message_id() -> String {
    format!("test_msg_{}", Uuid::new_v4().simple())
}

impl LatencySampler {
    pub fn new(metrics: Arc<PerformanceMetrics>, wait_window: Duration, poll_interval: Duration) -> Self {
        Self {
            metrics,
            wait_window,
            poll_interval,
        }
    }

    pub fn metrics(&self) -> &Arc<PerformanceMetrics> {
        &self.metrics
    }

    pub fn wait_window(&self) -> Duration {
        self.wait_window
    }

    /// Sets up and connects `username`, timing the connect.
    ///
    /// `NotAuthenticated` is a caller error and is returned without touching
    /// the metrics.
    pub async fn measure_connection(
        &self,
        registry: &ClientRegistry,
        username: &str,
    ) -> Result<Arc<SimulatedClient>, HarnessError> {
        let start = Instant::now();
        let client = registry.setup(username).await?;
        let elapsed = start.elapsed();

        if client.is_connected() {
            self.metrics.record(SampleKind::ConnectionTime, elapsed);
            debug!("{}: connected in {:.3}s", username, elapsed.as_secs_f64());
            Ok(client)
        } else {
            self.metrics.record_failure();
            Err(HarnessError::ConnectFailed(username.to_string()))
        }
    }

    /// Sends `"<id>:<message>"` from `sender` and waits for `receiver` to
    /// observe a chat envelope containing the id. Returns the latency.
    pub async fn measure_message_latency(
        &self,
        sender: &SimulatedClient,
        receiver: &SimulatedClient,
        message: &str,
    ) -> Result<Duration, HarnessError> {
        let id = new_message_id();
        let content = format!("{id}:{message}");

        let start = Instant::now();
        if !sender.send(&content).await {
            self.metrics.record_failure();
            return Err(HarnessError::SendFailed(sender.username().to_string()));
        }

        let delivered = receiver
            .inbox()
            .wait_for_chat(&id, self.wait_window, self.poll_interval)
            .await;

        if delivered {
            let elapsed = start.elapsed();
            self.metrics.record(SampleKind::MessageLatency, elapsed);
            Ok(elapsed)
        } else {
            warn!(
                "{}: message {} from {} not received within {:?}",
                receiver.username(),
                id,
                sender.username(),
                self.wait_window
            );
            self.metrics.record_failure();
            Err(HarnessError::DeliveryTimeout {
                id,
                receiver: receiver.username().to_string(),
                window: self.wait_window,
            })
        }
    }
}
