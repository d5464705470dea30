//! Hands sent notifications to the delivery queue.

use std::sync::Arc;

use crate::error::PublishError;
use crate::metrics::AppMetrics;
use crate::notification::Notification;
use crate::queue::DeliveryQueue;

pub struct Publisher {
    queue: Arc<dyn DeliveryQueue>,
    metrics: Arc<AppMetrics>,
}

impl Publisher {
    pub fn new(queue: Arc<dyn DeliveryQueue>, metrics: Arc<AppMetrics>) -> Self {
        Self { queue, metrics }
    }

    /// Enqueue `notification` as it was when marked sent.
    ///
    /// A failure here does not un-send the notification; it is counted and
    /// returned to the caller.
    pub async fn publish(&self, notification: &Notification) -> Result<(), PublishError> {
        match self.queue.publish(notification).await {
            Ok(()) => {
                tracing::debug!(
                    "Published notification {} ({})",
                    notification.id,
                    notification.channel
                );
                Ok(())
            }
            Err(err) => {
                self.metrics.publish_errors_total.inc();
                tracing::error!(
                    "Notification {} is marked sent but could not be queued: {}",
                    notification.id,
                    err
                );
                Err(err)
            }
        }
    }
}
