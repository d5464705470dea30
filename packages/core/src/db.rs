//! SQLite pool construction and shared column helpers.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (UTC, microsecond
//! precision, `Z` suffix) so that SQL string comparison and `ORDER BY` agree
//! with chronological order.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Pool size for file-backed databases.
const MAX_CONNECTIONS: u32 = 5;

/// Open a pool for `database_url` and apply all migrations.
///
/// In-memory databases live only as long as their connection, so they are
/// pinned to a single connection that never expires.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = if is_in_memory(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|err| sqlx::Error::Migrate(Box::new(err)))?;

    tracing::debug!("Database ready at {}", database_url);
    Ok(pool)
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Column encoding for timestamps.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let earlier = format_timestamp(base);
        let later = format_timestamp(base + ChronoDuration::milliseconds(1));
        let much_later = format_timestamp(base + ChronoDuration::hours(5));

        assert!(earlier < later);
        assert!(later < much_later);
        assert_eq!(earlier.len(), later.len());
    }

    #[test]
    fn timestamp_roundtrip_keeps_microseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap()
            + ChronoDuration::microseconds(123_456);
        let parsed = parse_timestamp(&format_timestamp(ts)).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn memory_urls_are_detected() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite://file.db?mode=memory"));
        assert!(!is_in_memory("sqlite://notifications.db"));
    }

    #[tokio::test]
    async fn in_memory_pool_has_schema() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
