//! Background task that drains fulfilled decryptions into a callback target.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{DecryptionCallback, DeliveryOrder, SharedGateway};

/// Configuration for the relayer.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// Delivery order applied to each polled batch
    pub order: DeliveryOrder,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            order: DeliveryOrder::Fifo,
        }
    }
}

/// Relays oracle results to a single callback target.
pub struct Relayer<C> {
    config: RelayerConfig,
    gateway: SharedGateway,
    target: Arc<Mutex<C>>,
}

impl<C> Relayer<C>
where
    C: DecryptionCallback + Send + 'static,
{
    pub fn new(config: RelayerConfig, gateway: SharedGateway, target: Arc<Mutex<C>>) -> Self {
        Self {
            config,
            gateway,
            target,
        }
    }

    /// Fulfil pending requests and deliver every ready result once.
    ///
    /// A result the target rejects is recorded as failed and not retried.
    ///
    /// # Returns
    /// The number of results the target accepted
    pub fn relay_once(&self) -> usize {
        let (oracle, deliveries) = {
            let mut gateway = self.gateway.lock();
            gateway.fulfill_all();
            (gateway.address(), gateway.ready(self.config.order))
        };

        let mut accepted = 0;
        for delivery in deliveries {
            let outcome = self
                .target
                .lock()
                .on_decryption_result(&oracle, delivery.request_id, delivery.value)
                .map_err(|e| e.to_string());

            if let Err(reason) = &outcome {
                warn!(
                    request_id = hex::encode(delivery.request_id),
                    reason = %reason,
                    "Callback rejected decryption result"
                );
            } else {
                accepted += 1;
            }
            self.gateway.lock().record_delivery(delivery.request_id, outcome);
        }
        accepted
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// # Returns
    /// The total number of results delivered
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        let mut delivered = 0u64;

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Decryption relayer started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let count = self.relay_once();
                    if count > 0 {
                        debug!(count, "Relayed decryption results");
                    }
                    delivered += count as u64;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain whatever became ready between the last tick and shutdown
        delivered += self.relay_once() as u64;
        info!(delivered, "Decryption relayer stopped");
        Ok(delivered)
    }

    /// Spawn [`Relayer::run`] on the current tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<u64>> {
        tokio::spawn(self.run(shutdown))
    }
}
