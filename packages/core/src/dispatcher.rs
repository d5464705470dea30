//! Send-and-acknowledge protocol.
//!
//! The dispatcher turns due notifications into queued deliveries. For every
//! id it first flips `sent` through the store's conditional write, and only
//! the caller that wins that write publishes. This makes `sent` the guard
//! against double dispatch: it records that dispatch was attempted, not that
//! a channel confirmed delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::NotificationError;
use crate::metrics::AppMetrics;
use crate::notification::Notification;
use crate::publisher::Publisher;
use crate::repository::NotificationStore;

/// Counts for one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids returned by the due-query.
    pub due: usize,
    /// Marked sent by this sweep.
    pub dispatched: usize,
    /// Already sent or deleted by someone else in the meantime.
    pub skipped: usize,
    /// `mark_sent` failed with a storage error; left unsent for the next sweep.
    pub failed: usize,
    /// Marked sent but the queue handoff failed.
    pub publish_failures: usize,
}

pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    publisher: Publisher,
    metrics: Arc<AppMetrics>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        publisher: Publisher,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            metrics,
        }
    }

    /// Manually send one notification.
    ///
    /// Fails with `NotFoundOrAlreadySent` if the id is unknown or was
    /// already sent. A publish failure is returned after the notification
    /// has been marked sent; the flag is not rolled back.
    pub async fn send(&self, id: i64) -> Result<Notification, NotificationError> {
        let notification = self.store.mark_sent(id).await?;
        self.publisher.publish(&notification).await?;
        Ok(notification)
    }

    /// Dispatch every notification due at `now`.
    ///
    /// Only a failing due-query fails the sweep. Per-notification problems
    /// are counted in the report and the sweep moves on to the next id.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, NotificationError> {
        self.metrics.sweeps_total.inc();

        let due = self.store.list_due(now).await.map_err(|err| {
            self.metrics.sweep_errors_total.inc();
            err
        })?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for id in due {
            let notification = match self.store.mark_sent(id).await {
                Ok(n) => n,
                Err(NotificationError::NotFoundOrAlreadySent { .. }) => {
                    tracing::debug!("Notification {} was sent or deleted concurrently", id);
                    self.metrics.dispatch_races_total.inc();
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!("Could not mark notification {} as sent: {}", id, err);
                    self.metrics.dispatch_failures_total.inc();
                    report.failed += 1;
                    continue;
                }
            };

            report.dispatched += 1;
            self.metrics.notifications_dispatched_total.inc();

            // Publisher already logs and counts the failure.
            if self.publisher.publish(&notification).await.is_err() {
                report.publish_failures += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::error::PublishError;
    use crate::mock::{MockNotificationStore, RecordingQueue};
    use crate::notification::{Channel, NotificationParams};

    struct Harness {
        store: Arc<MockNotificationStore>,
        queue: Arc<RecordingQueue>,
        metrics: Arc<AppMetrics>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockNotificationStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let metrics = Arc::new(AppMetrics::new().unwrap());
        let publisher = Publisher::new(queue.clone(), metrics.clone());
        let dispatcher = Dispatcher::new(store.clone(), publisher, metrics.clone());
        Harness {
            store,
            queue,
            metrics,
            dispatcher,
        }
    }

    fn params(send_at: DateTime<Utc>) -> NotificationParams {
        NotificationParams {
            message: "hi".into(),
            channel: Channel::Email,
            recipient: "a@x.com".into(),
            send_at,
        }
    }

    #[tokio::test]
    async fn sweep_sends_past_notification_exactly_once() {
        let h = harness();
        let now = Utc::now();
        let n = h.store.create(&params(now - Duration::seconds(1))).await.unwrap();

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, 1);
        assert!(h.store.get(n.id).await.unwrap().sent);

        let published = h.queue.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, n.id);
        assert!(published[0].sent);
    }

    #[tokio::test]
    async fn second_sweep_does_not_republish() {
        let h = harness();
        let now = Utc::now();
        h.store.create(&params(now - Duration::minutes(1))).await.unwrap();

        h.dispatcher.sweep(now).await.unwrap();
        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(h.queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_sends_all_notifications_sharing_send_at() {
        let h = harness();
        let now = Utc::now();
        let at = now - Duration::seconds(30);
        let a = h.store.create(&params(at)).await.unwrap();
        let b = h.store.create(&params(at)).await.unwrap();

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.dispatched, 2);
        assert!(h.store.list_pending().await.unwrap().is_empty());
        let ids: Vec<i64> = h.queue.published().await.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn future_notification_stays_pending() {
        let h = harness();
        let now = Utc::now();
        let n = h.store.create(&params(now + Duration::hours(1))).await.unwrap();

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.due, 0);
        assert!(!h.store.get(n.id).await.unwrap().sent);
        assert_eq!(h.store.list_pending().await.unwrap(), vec![n]);
        assert!(h.queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_notification_sent_and_continues() {
        let h = harness();
        let now = Utc::now();
        let a = h.store.create(&params(now - Duration::seconds(2))).await.unwrap();
        let b = h.store.create(&params(now - Duration::seconds(1))).await.unwrap();
        h.queue.set_failing(true);

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.publish_failures, 2);
        assert!(h.store.get(a.id).await.unwrap().sent);
        assert!(h.store.get(b.id).await.unwrap().sent);
        assert_eq!(h.metrics.publish_errors_total.get(), 2.0);

        // No re-dispatch once the queue recovers.
        h.queue.set_failing(false);
        let report = h.dispatcher.sweep(now).await.unwrap();
        assert_eq!(report.due, 0);
        assert!(h.queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn mark_sent_storage_failure_does_not_block_other_notifications() {
        let h = harness();
        let now = Utc::now();
        let broken = h.store.create(&params(now - Duration::seconds(2))).await.unwrap();
        let healthy = h.store.create(&params(now - Duration::seconds(1))).await.unwrap();
        h.store.fail_mark_sent_for(broken.id).await;

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.dispatched, 1);
        assert!(!h.store.get(broken.id).await.unwrap().sent);
        assert!(h.store.get(healthy.id).await.unwrap().sent);
        assert_eq!(h.metrics.dispatch_failures_total.get(), 1.0);
    }

    #[tokio::test]
    async fn due_query_failure_fails_the_sweep() {
        let h = harness();
        h.store.create(&params(Utc::now() - Duration::seconds(1))).await.unwrap();
        h.store.set_fail_list_due(true);

        let result = h.dispatcher.sweep(Utc::now()).await;

        assert!(matches!(result, Err(NotificationError::Storage(_))));
        assert_eq!(h.metrics.sweep_errors_total.get(), 1.0);
        assert!(h.queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn manual_send_succeeds_once() {
        let h = harness();
        let n = h.store.create(&params(Utc::now() + Duration::hours(1))).await.unwrap();

        let sent = h.dispatcher.send(n.id).await.unwrap();
        assert!(sent.sent);

        let again = h.dispatcher.send(n.id).await;
        assert!(matches!(
            again,
            Err(NotificationError::NotFoundOrAlreadySent { .. })
        ));
        assert_eq!(h.queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn manual_send_unknown_id_fails() {
        let h = harness();
        let result = h.dispatcher.send(404).await;
        assert!(matches!(
            result,
            Err(NotificationError::NotFoundOrAlreadySent { id: 404 })
        ));
    }

    #[tokio::test]
    async fn manual_send_reports_publish_error_but_stays_sent() {
        let h = harness();
        let n = h.store.create(&params(Utc::now())).await.unwrap();
        h.queue.set_failing(true);

        let result = h.dispatcher.send(n.id).await;

        assert!(matches!(
            result,
            Err(NotificationError::Publish(PublishError::Unavailable { .. }))
        ));
        assert!(h.store.get(n.id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn manual_send_before_sweep_turns_sweep_into_no_op() {
        let h = harness();
        let now = Utc::now();
        let n = h.store.create(&params(now - Duration::seconds(1))).await.unwrap();

        h.dispatcher.send(n.id).await.unwrap();
        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.dispatched, 0);
        assert_eq!(h.queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrently_sent_or_deleted_ids_are_skipped_silently() {
        let h = harness();
        let now = Utc::now();
        let sent = h.store.create(&params(now)).await.unwrap();
        let deleted = h.store.create(&params(now)).await.unwrap();
        h.dispatcher.send(sent.id).await.unwrap();
        h.store.delete(deleted.id).await.unwrap();
        h.store.inject_stale_due_id(sent.id).await;
        h.store.inject_stale_due_id(deleted.id).await;

        let report = h.dispatcher.sweep(now).await.unwrap();

        assert_eq!(report.due, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.dispatched, 0);
        assert_eq!(h.metrics.dispatch_races_total.get(), 2.0);
        assert_eq!(h.queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_of_same_id_have_one_winner() {
        let h = harness();
        let n = h.store.create(&params(Utc::now())).await.unwrap();
        let dispatcher = Arc::new(h.dispatcher);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.send(n.id).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(NotificationError::NotFoundOrAlreadySent { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(h.queue.published().await.len(), 1);
    }
}
