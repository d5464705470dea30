//! Channel senders.
//!
//! A [`ChannelSender`] performs the real transmission for one or more
//! channels. Senders are driven by delivery-queue subscriptions, never by
//! the dispatcher directly, so a slow or failing sender cannot hold up a
//! sweep. Delivery is at-least-once: a sender may see the same notification
//! id more than once and must tolerate it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::SendError;
use crate::notification::{Channel, Notification};

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Subscription name. Must be unique per queue.
    fn name(&self) -> &str;

    /// Whether this sender handles `channel`. Unsupported notifications
    /// are acknowledged without being sent.
    fn supports(&self, channel: Channel) -> bool;

    async fn send(&self, notification: &Notification) -> Result<(), SendError>;
}

/// Writes each notification to the log. Handles every channel.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl ChannelSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    fn supports(&self, _channel: Channel) -> bool {
        true
    }

    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        tracing::info!(
            id = notification.id,
            channel = %notification.channel,
            recipient = %notification.recipient,
            "Sending notification: {}",
            notification.message
        );
        Ok(())
    }
}

/// POSTs the notification as JSON to a fixed URL.
#[derive(Clone)]
pub struct WebhookSender {
    url: String,
    channels: Vec<Channel>,
    http: Client,
}

impl WebhookSender {
    /// Webhook for every channel.
    pub fn new(url: impl Into<String>) -> Self {
        Self::for_channels(url, Channel::ALL.to_vec())
    }

    pub fn for_channels(url: impl Into<String>, channels: Vec<Channel>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            url: url.into(),
            channels,
            http,
        }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    fn supports(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let response = self.http.post(&self.url).json(notification).send().await?;

        if !response.status().is_success() {
            return Err(SendError::Rejected {
                status: response.status().as_u16(),
            });
        }

        tracing::debug!(
            "Webhook accepted notification {} ({})",
            notification.id,
            notification.channel
        );
        Ok(())
    }
}
