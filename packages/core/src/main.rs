use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use notification_scheduler::api::{self, notifications::NotificationsApiState};
use notification_scheduler::cli::Cli;
use notification_scheduler::config::Config;
use notification_scheduler::db;
use notification_scheduler::dispatcher::Dispatcher;
use notification_scheduler::error::AppError;
use notification_scheduler::logging::init_logging;
use notification_scheduler::metrics::AppMetrics;
use notification_scheduler::publisher::Publisher;
use notification_scheduler::queue::SqliteDeliveryQueue;
use notification_scheduler::repository::{NotificationRepository, NotificationStore};
use notification_scheduler::scheduler::Scheduler;
use notification_scheduler::senders::{ChannelSender, LogSender, WebhookSender};

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::from_env()
        .and_then(|config| config.with_cli(&cli))
        .map_err(AppError::Config)?;

    tracing::info!("Service starting with config: {:?}", config);

    let pool = db::create_pool(&config.database_url)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    let metrics = Arc::new(AppMetrics::new().map_err(|err| AppError::Server(err.to_string()))?);

    let store: Arc<dyn NotificationStore> = Arc::new(NotificationRepository::new(pool.clone()));
    let queue = Arc::new(SqliteDeliveryQueue::new(
        pool,
        config.queue_options(),
        metrics.clone(),
    ));

    // Subscriptions must exist before the first publish or messages have no consumer.
    let mut senders: Vec<Arc<dyn ChannelSender>> = vec![Arc::new(LogSender)];
    if let Some(url) = &config.webhook_url {
        senders.push(Arc::new(WebhookSender::new(url.clone())));
    }
    let mut subscriptions = Vec::with_capacity(senders.len());
    for sender in senders {
        let subscription = queue
            .subscribe(sender)
            .await
            .map_err(|err| AppError::Database(err.to_string()))?;
        subscriptions.push(subscription);
    }
    queue
        .retire_unregistered()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    let publisher = Publisher::new(queue.clone(), metrics.clone());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), publisher, metrics.clone()));
    let scheduler = Scheduler::start(dispatcher.clone(), config.sweep_interval());

    let app = api::create_router(
        Arc::new(NotificationsApiState { store, dispatcher }),
        metrics,
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|err| AppError::Server(format!("failed to bind {}: {}", config.bind_addr, err)))?;

    tracing::info!("Listening on {}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    for subscription in subscriptions {
        subscription.stop().await;
    }

    served.map_err(|err| AppError::Server(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received. Draining.");
}
