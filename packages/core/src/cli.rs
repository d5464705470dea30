use clap::Parser;

/// Notification scheduler CLI arguments. Each flag overrides its
/// environment variable.
#[derive(Debug, Default, Parser)]
#[command(
    name = "notification-scheduler",
    version,
    about = "Schedule messages and dispatch them to delivery channels on time"
)]
pub struct Cli {
    /// SQLite connection string (e.g. sqlite://notifications.db)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Seconds between dispatcher sweeps
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Webhook URL that receives every sent notification
    #[arg(long)]
    pub webhook_url: Option<String>,
}
