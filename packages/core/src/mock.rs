//! In-process test doubles for the store and queue seams.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{NotificationError, PublishError};
use crate::notification::{Notification, NotificationParams};
use crate::queue::DeliveryQueue;
use crate::repository::NotificationStore;

/// Map-backed store. Each operation holds the lock for its whole body, so
/// `mark_sent` is a compare-and-set just like the SQL version.
#[derive(Default)]
pub struct MockNotificationStore {
    rows: Mutex<BTreeMap<i64, Notification>>,
    next_id: AtomicUsize,
    fail_list_due: AtomicBool,
    fail_mark_sent: Mutex<HashSet<i64>>,
    list_due_delay: Mutex<Option<Duration>>,
    stale_due_ids: Mutex<Vec<i64>>,
    list_due_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockNotificationStore {
    pub fn set_fail_list_due(&self, fail: bool) {
        self.fail_list_due.store(fail, Ordering::SeqCst);
    }

    pub async fn fail_mark_sent_for(&self, id: i64) {
        self.fail_mark_sent.lock().await.insert(id);
    }

    pub async fn set_list_due_delay(&self, delay: Duration) {
        *self.list_due_delay.lock().await = Some(delay);
    }

    /// Make `list_due` also return `id`, as if the row changed after the
    /// due-query ran.
    pub async fn inject_stale_due_id(&self, id: i64) {
        self.stale_due_ids.lock().await.push(id);
    }

    pub fn list_due_calls(&self) -> usize {
        self.list_due_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `list_due` calls observed running at once.
    pub fn max_concurrent_list_due(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationStore for MockNotificationStore {
    async fn create(&self, params: &NotificationParams) -> Result<Notification, NotificationError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let notification = Notification {
            id,
            message: params.message.clone(),
            channel: params.channel,
            recipient: params.recipient.clone(),
            send_at: params.send_at,
            sent: false,
        };
        self.rows.lock().await.insert(id, notification.clone());
        Ok(notification)
    }

    async fn get(&self, id: i64) -> Result<Notification, NotificationError> {
        self.rows
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(NotificationError::NotFound { id })
    }

    async fn list_pending(&self) -> Result<Vec<Notification>, NotificationError> {
        let mut pending: Vec<Notification> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|n| !n.sent)
            .cloned()
            .collect();
        pending.sort_by_key(|n| (n.send_at, n.id));
        Ok(pending)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>, NotificationError> {
        self.list_due_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.list_due_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_list_due.load(Ordering::SeqCst) {
            return Err(NotificationError::Storage(sqlx::Error::PoolTimedOut));
        }

        let mut due: Vec<Notification> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|n| n.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|n| (n.send_at, n.id));

        let mut ids: Vec<i64> = due.into_iter().map(|n| n.id).collect();
        ids.extend(self.stale_due_ids.lock().await.iter().copied());
        Ok(ids)
    }

    async fn update(
        &self,
        id: i64,
        params: &NotificationParams,
    ) -> Result<Notification, NotificationError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(n) if !n.sent => {
                n.message = params.message.clone();
                n.channel = params.channel;
                n.recipient = params.recipient.clone();
                n.send_at = params.send_at;
                Ok(n.clone())
            }
            _ => Err(NotificationError::NotFoundOrAlreadySent { id }),
        }
    }

    async fn delete(&self, id: i64) -> Result<(), NotificationError> {
        self.rows
            .lock()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(NotificationError::NotFound { id })
    }

    async fn mark_sent(&self, id: i64) -> Result<Notification, NotificationError> {
        if self.fail_mark_sent.lock().await.contains(&id) {
            return Err(NotificationError::Storage(sqlx::Error::PoolTimedOut));
        }

        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(n) if !n.sent => {
                n.sent = true;
                Ok(n.clone())
            }
            _ => Err(NotificationError::NotFoundOrAlreadySent { id }),
        }
    }
}

/// Queue that keeps every published notification in memory.
#[derive(Default)]
pub struct RecordingQueue {
    published: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingQueue {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<Notification> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryQueue for RecordingQueue {
    async fn publish(&self, notification: &Notification) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable {
                message: "queue offline".into(),
            });
        }
        self.published.lock().await.push(notification.clone());
        Ok(())
    }
}
