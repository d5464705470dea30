//! Durable at-least-once delivery queue.
//!
//! The producer side is the [`DeliveryQueue`] capability (`publish`), which is
//! all the dispatcher ever sees. [`SqliteDeliveryQueue`] implements it on top
//! of the `queue_messages` table and adds the consumer side: each
//! [`ChannelSender`] passed to [`SqliteDeliveryQueue::subscribe`] gets a named
//! subscription and a background worker.
//!
//! Message lifecycle for one subscription:
//! 1. `publish` inserts one row per registered subscription.
//! 2. The worker claims the oldest visible row, bumping `attempts` and hiding
//!    it for `visibility_timeout`.
//! 3. On success the row is deleted (ack). On failure it becomes visible
//!    again after an exponential backoff with jitter, until `max_attempts`
//!    is reached and the row is dropped.
//!
//! A worker that dies between claim and ack leaves the row hidden only until
//! the visibility timeout passes, so the message is redelivered rather than
//! lost. Duplicates are therefore possible and senders must tolerate them.
//!
//! Registered subscription names are also recorded in `queue_subscriptions`.
//! After startup registration, [`SqliteDeliveryQueue::retire_unregistered`]
//! drops the backlog of any subscription the new process no longer runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::{Row, SqlitePool};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;

use crate::db::format_timestamp;
use crate::error::PublishError;
use crate::metrics::AppMetrics;
use crate::notification::Notification;
use crate::senders::ChannelSender;

/// Producer-side queue capability.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), PublishError>;
}

/// Tuning knobs for subscription workers.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Sleep between polls when a subscription has nothing visible.
    pub poll_interval: Duration,
    /// How long a claimed message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Deliveries attempted before a message is dropped.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(60),
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

/// A claimed, not yet acknowledged message.
#[derive(Debug)]
pub(crate) struct ClaimedMessage {
    pub id: i64,
    pub payload: String,
    pub attempts: u32,
}

/// Outcome of one worker step, also used as the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped,
    Retrying,
    Dropped,
}

impl DeliveryOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Retrying => "retrying",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

pub struct SqliteDeliveryQueue {
    pool: SqlitePool,
    options: QueueOptions,
    subscriptions: RwLock<Vec<String>>,
    metrics: Arc<AppMetrics>,
}

impl SqliteDeliveryQueue {
    pub fn new(pool: SqlitePool, options: QueueOptions, metrics: Arc<AppMetrics>) -> Self {
        Self {
            pool,
            options,
            subscriptions: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Register a subscription for `sender` and start its worker.
    ///
    /// Backlog left for the same name by an earlier process is resumed.
    pub async fn subscribe(
        self: &Arc<Self>,
        sender: Arc<dyn ChannelSender>,
    ) -> Result<Subscription, sqlx::Error> {
        let name = sender.name().to_string();
        self.register(&name).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_subscription(self.clone(), sender, shutdown_rx));

        tracing::info!("Subscription '{}' started", name);
        Ok(Subscription {
            name,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Declare a subscription without starting a worker. Published messages
    /// accumulate for it until something processes them.
    pub async fn register(&self, subscription: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO queue_subscriptions (name, registered_at)
             VALUES (?, ?)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(subscription)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let mut subscriptions = self.subscriptions.write().await;
        if !subscriptions.iter().any(|s| s == subscription) {
            subscriptions.push(subscription.to_string());
        }
        Ok(())
    }

    /// Drop every queued message, and the recorded name, of subscriptions
    /// this process has not registered. Returns the number of messages
    /// dropped.
    ///
    /// Call once, after every subscription of this process is registered.
    pub async fn retire_unregistered(&self) -> Result<u64, sqlx::Error> {
        let active = self.subscriptions.read().await.clone();

        let known = sqlx::query_scalar::<_, String>(
            "SELECT name FROM queue_subscriptions
             UNION
             SELECT DISTINCT subscription FROM queue_messages",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut dropped = 0;
        for name in known.iter().filter(|name| !active.contains(*name)) {
            let mut tx = self.pool.begin().await?;
            let removed = sqlx::query("DELETE FROM queue_messages WHERE subscription = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM queue_subscriptions WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            if removed > 0 {
                tracing::warn!(
                    "Subscription '{}' is no longer registered; dropped {} undelivered messages",
                    name,
                    removed
                );
                self.metrics.orphaned_messages_total.inc_by(removed as f64);
            } else {
                tracing::info!("Retired subscription '{}'", name);
            }
            dropped += removed;
        }

        Ok(dropped)
    }

    /// Messages still waiting for acknowledgement on `subscription`.
    pub async fn pending(&self, subscription: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_messages WHERE subscription = ?")
            .bind(subscription)
            .fetch_one(&self.pool)
            .await
    }

    /// Claim the oldest visible message for `subscription`.
    pub(crate) async fn claim(
        &self,
        subscription: &str,
    ) -> Result<Option<ClaimedMessage>, sqlx::Error> {
        let now = Utc::now();
        let hidden_until = now + chrono_duration(self.options.visibility_timeout);

        let row = sqlx::query(
            "UPDATE queue_messages
             SET attempts = attempts + 1, available_at = ?
             WHERE id = (
                 SELECT id FROM queue_messages
                 WHERE subscription = ? AND available_at <= ?
                 ORDER BY id ASC
                 LIMIT 1
             )
             RETURNING id, payload, attempts",
        )
        .bind(format_timestamp(hidden_until))
        .bind(subscription)
        .bind(format_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempts: i64 = row.try_get("attempts")?;
        Ok(Some(ClaimedMessage {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, message_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_later(&self, message_id: i64, attempts: u32) -> Result<(), sqlx::Error> {
        let retry_at = Utc::now() + chrono_duration(backoff_delay(&self.options, attempts));

        sqlx::query("UPDATE queue_messages SET available_at = ? WHERE id = ?")
            .bind(format_timestamp(retry_at))
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Run one delivery step for `sender`'s subscription.
    ///
    /// Returns `Ok(None)` when nothing is visible.
    pub async fn process_next(
        &self,
        sender: &dyn ChannelSender,
    ) -> Result<Option<DeliveryOutcome>, sqlx::Error> {
        let Some(message) = self.claim(sender.name()).await? else {
            return Ok(None);
        };

        let notification: Notification = match serde_json::from_str(&message.payload) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(
                    "Dropping undecodable queue message {} for '{}': {}",
                    message.id,
                    sender.name(),
                    err
                );
                self.ack(message.id).await?;
                return Ok(Some(self.record(sender, DeliveryOutcome::Dropped)));
            }
        };

        if !sender.supports(notification.channel) {
            self.ack(message.id).await?;
            return Ok(Some(self.record(sender, DeliveryOutcome::Skipped)));
        }

        let outcome = match sender.send(&notification).await {
            Ok(()) => {
                self.ack(message.id).await?;
                DeliveryOutcome::Delivered
            }
            Err(err) if message.attempts >= self.options.max_attempts => {
                tracing::error!(
                    "Giving up on notification {} via '{}' after {} attempts: {}",
                    notification.id,
                    sender.name(),
                    message.attempts,
                    err
                );
                self.ack(message.id).await?;
                DeliveryOutcome::Dropped
            }
            Err(err) => {
                tracing::warn!(
                    "Delivery of notification {} via '{}' failed (attempt {}): {}",
                    notification.id,
                    sender.name(),
                    message.attempts,
                    err
                );
                self.retry_later(message.id, message.attempts).await?;
                DeliveryOutcome::Retrying
            }
        };

        Ok(Some(self.record(sender, outcome)))
    }

    fn record(&self, sender: &dyn ChannelSender, outcome: DeliveryOutcome) -> DeliveryOutcome {
        self.metrics
            .deliveries_total
            .with_label_values(&[sender.name(), outcome.as_str()])
            .inc();
        outcome
    }
}

#[async_trait]
impl DeliveryQueue for SqliteDeliveryQueue {
    async fn publish(&self, notification: &Notification) -> Result<(), PublishError> {
        let subscriptions = self.subscriptions.read().await.clone();
        if subscriptions.is_empty() {
            return Err(PublishError::Unavailable {
                message: format!(
                    "no subscriptions registered for notification {}",
                    notification.id
                ),
            });
        }

        let payload = serde_json::to_string(notification)?;
        let available_at = format_timestamp(Utc::now());

        let mut tx = self.pool.begin().await?;
        for subscription in &subscriptions {
            sqlx::query(
                "INSERT INTO queue_messages (subscription, payload, available_at)
                 VALUES (?, ?, ?)",
            )
            .bind(subscription)
            .bind(&payload)
            .bind(&available_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

/// Handle to a running subscription worker.
pub struct Subscription {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop the worker after its current delivery step.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!("Subscription '{}' worker panicked: {}", self.name, err);
        }
    }
}

async fn run_subscription(
    queue: Arc<SqliteDeliveryQueue>,
    sender: Arc<dyn ChannelSender>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.process_next(sender.as_ref()).await {
            // Drain without sleeping while there is work.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                tracing::error!("Subscription '{}' queue error: {}", sender.name(), err);
            }
        }

        tokio::select! {
            _ = time::sleep(queue.options.poll_interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Subscription '{}' stopped", sender.name());
}

/// Exponential backoff for the retry after `attempts` deliveries, plus up
/// to half the base delay of random jitter.
fn backoff_delay(options: &QueueOptions, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let delay = options
        .retry_base_delay
        .saturating_mul(1u32 << exponent)
        .min(options.retry_max_delay);

    let jitter_ms = (options.retry_base_delay.as_millis() / 2) as u64;
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);

    delay + Duration::from_millis(jitter)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
