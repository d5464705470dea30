//! Notification persistence.
//!
//! All SQLite read/write logic for the `notifications` table lives here.
//! The dispatcher only depends on the [`NotificationStore`] trait; the
//! concrete [`NotificationRepository`] is wired in by `main.rs`.
//!
//! Every mutation that must respect the `sent` flag is a single conditional
//! statement (`... WHERE id = ? AND sent = 0 RETURNING ...`), never a
//! read-then-write pair. That statement is what stops two sweeps, or a sweep
//! and a client edit, from both acting on the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::{format_timestamp, parse_timestamp};
use crate::error::NotificationError;
use crate::notification::{Channel, Notification, NotificationParams};

const COLUMNS: &str = "id, message, channel, recipient, send_at, sent";

/// Storage contract consumed by the dispatcher and the API layer.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new unsent notification and return it with its assigned id.
    async fn create(&self, params: &NotificationParams) -> Result<Notification, NotificationError>;

    /// Fetch one notification regardless of its `sent` state.
    async fn get(&self, id: i64) -> Result<Notification, NotificationError>;

    /// All unsent notifications, oldest `send_at` first.
    async fn list_pending(&self) -> Result<Vec<Notification>, NotificationError>;

    /// Ids of unsent notifications with `send_at <= now`, oldest first.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>, NotificationError>;

    /// Replace the editable fields of an unsent notification.
    async fn update(
        &self,
        id: i64,
        params: &NotificationParams,
    ) -> Result<Notification, NotificationError>;

    /// Remove a notification whether or not it was sent.
    async fn delete(&self, id: i64) -> Result<(), NotificationError>;

    /// Atomically flip `sent` from false to true and return the new record.
    async fn mark_sent(&self, id: i64) -> Result<Notification, NotificationError>;
}

/// SQLite-backed [`NotificationStore`].
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification, sqlx::Error> {
    let channel: String = row.try_get("channel")?;
    let send_at: String = row.try_get("send_at")?;
    let sent: i64 = row.try_get("sent")?;

    Ok(Notification {
        id: row.try_get("id")?,
        message: row.try_get("message")?,
        channel: channel
            .parse::<Channel>()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
        recipient: row.try_get("recipient")?,
        send_at: parse_timestamp(&send_at).map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        sent: sent != 0,
    })
}

#[async_trait]
impl NotificationStore for NotificationRepository {
    async fn create(&self, params: &NotificationParams) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            "INSERT INTO notifications (message, channel, recipient, send_at, sent)
             VALUES (?, ?, ?, ?, 0)
             RETURNING {COLUMNS}"
        ))
        .bind(&params.message)
        .bind(params.channel.as_str())
        .bind(&params.recipient)
        .bind(format_timestamp(params.send_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(notification_from_row(&row)?)
    }

    async fn get(&self, id: i64) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM notifications WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(NotificationError::NotFound { id })?;

        Ok(notification_from_row(&row)?)
    }

    async fn list_pending(&self) -> Result<Vec<Notification>, NotificationError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM notifications
             WHERE sent = 0
             ORDER BY send_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let notifications = rows
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(notifications)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>, NotificationError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM notifications
             WHERE sent = 0 AND send_at <= ?
             ORDER BY send_at ASC, id ASC",
        )
        .bind(format_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn update(
        &self,
        id: i64,
        params: &NotificationParams,
    ) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            "UPDATE notifications
             SET message = ?, channel = ?, recipient = ?, send_at = ?
             WHERE id = ? AND sent = 0
             RETURNING {COLUMNS}"
        ))
        .bind(&params.message)
        .bind(params.channel.as_str())
        .bind(&params.recipient)
        .bind(format_timestamp(params.send_at))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(NotificationError::NotFoundOrAlreadySent { id })?;

        Ok(notification_from_row(&row)?)
    }

    async fn delete(&self, id: i64) -> Result<(), NotificationError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(NotificationError::NotFound { id });
        }
        Ok(())
    }

    async fn mark_sent(&self, id: i64) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            "UPDATE notifications
             SET sent = 1
             WHERE id = ? AND sent = 0
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(NotificationError::NotFoundOrAlreadySent { id })?;

        Ok(notification_from_row(&row)?)
    }
}
