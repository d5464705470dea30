use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::cli::Cli;
use crate::queue::QueueOptions;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://notifications.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_DELIVERY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_QUEUE_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub sweep_interval_seconds: u64,
    pub webhook_url: Option<String>,
    pub delivery_max_attempts: u32,
    pub queue_poll_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(env::vars().collect())
    }

    /// Build from an explicit variable map. Unset variables take defaults;
    /// set but malformed ones are errors.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, String> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL")
            .unwrap_or(DEFAULT_DATABASE_URL)
            .to_string();

        let bind_addr = get("BIND_ADDR").unwrap_or(DEFAULT_BIND_ADDR).to_string();

        let sweep_interval_seconds = match get("SWEEP_INTERVAL_SECONDS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| "SWEEP_INTERVAL_SECONDS must be a valid number")?,
            None => DEFAULT_SWEEP_INTERVAL_SECONDS,
        };

        let delivery_max_attempts = match get("DELIVERY_MAX_ATTEMPTS") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| "DELIVERY_MAX_ATTEMPTS must be a valid number")?,
            None => DEFAULT_DELIVERY_MAX_ATTEMPTS,
        };

        let queue_poll_interval_ms = match get("QUEUE_POLL_INTERVAL_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| "QUEUE_POLL_INTERVAL_MS must be a valid number")?,
            None => DEFAULT_QUEUE_POLL_INTERVAL_MS,
        };

        let config = Self {
            database_url,
            bind_addr,
            sweep_interval_seconds,
            webhook_url: get("WEBHOOK_URL").map(str::to_string),
            delivery_max_attempts,
            queue_poll_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides on top of the environment.
    pub fn with_cli(mut self, cli: &Cli) -> Result<Self, String> {
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(addr) = &cli.bind_addr {
            self.bind_addr = addr.clone();
        }
        if let Some(seconds) = cli.sweep_interval {
            self.sweep_interval_seconds = seconds;
        }
        if let Some(url) = &cli.webhook_url {
            self.webhook_url = Some(url.clone());
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), String> {
        if self.sweep_interval_seconds == 0 {
            return Err("SWEEP_INTERVAL_SECONDS must be greater than zero".into());
        }
        if self.delivery_max_attempts == 0 {
            return Err("DELIVERY_MAX_ATTEMPTS must be greater than zero".into());
        }
        if self.queue_poll_interval_ms == 0 {
            return Err("QUEUE_POLL_INTERVAL_MS must be greater than zero".into());
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
            max_attempts: self.delivery_max_attempts,
            ..QueueOptions::default()
        }
    }
}
