//! Notification domain types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery channel. Closed set; anything else is rejected at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Email,
    Telegram,
    Slack,
    Discord,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Whatsapp,
        Channel::Email,
        Channel::Telegram,
        Channel::Slack,
        Channel::Discord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Email => "email",
            Channel::Telegram => "telegram",
            Channel::Slack => "slack",
            Channel::Discord => "discord",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Invalid channel '{}'", s))
    }
}

/// A scheduled notification as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    pub channel: Channel,
    pub recipient: String,
    /// Stored with microsecond precision; finer input is truncated.
    pub send_at: DateTime<Utc>,
    pub sent: bool,
}

impl Notification {
    /// `true` once `now` has reached `send_at` and the notification is unsent.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.sent && self.send_at <= now
    }
}

/// Caller-supplied fields, used for both create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationParams {
    pub message: String,
    pub channel: Channel,
    pub recipient: String,
    pub send_at: DateTime<Utc>,
}
