#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use strongbox_api::ApiState;
use strongbox_queue::{AmqpPublisher, NoopPublisher, QueuePublisher};
use strongbox_storage::{PostgresStorage, ShardRouter};
use tokio::sync::watch;

mod config;

pub use config::{
    AppConfig, BindConfig, ConfigError, CookieConfig, CookieOptions, DatabaseConfig, QueueConfig,
    SessionConfig, SessionStoreConfig, VaultConfig,
};

/// Invitations expired per sweep tick.
const SWEEP_BATCH: usize = 500;

fn connect(config: &AppConfig) -> anyhow::Result<PostgresStorage> {
    let router = ShardRouter::build(&config.router_config())?;
    Ok(PostgresStorage::new(router))
}

/// Applies the schema to every configured shard.
pub async fn migrate(config: &AppConfig) -> anyhow::Result<()> {
    let storage = connect(config)?;
    storage.migrate_all().await?;
    storage.close().await;
    Ok(())
}

fn publisher(config: &AppConfig) -> Arc<dyn QueuePublisher> {
    match &config.queue {
        Some(queue) => Arc::new(AmqpPublisher::new(
            queue.url.clone(),
            Duration::from_secs(queue.timeout_seconds),
        )),
        None => {
            tracing::warn!("no queue configured, outbound messages are dropped");
            Arc::new(NoopPublisher)
        }
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let storage = Arc::new(connect(&config)?);
    storage.migrate_all().await?;

    let state = ApiState::new(storage.clone(), config.session_codec()?)
        .with_publisher(publisher(&config))
        .with_settings(config.settings());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = config.vault.invitation_sweep_seconds.map(|seconds| {
        tokio::spawn(sweep_invitations(
            storage.clone(),
            Duration::from_secs(seconds),
            shutdown_rx,
        ))
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, strongbox_api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send_replace(true);
    if let Some(sweeper) = sweeper {
        if let Err(error) = sweeper.await {
            tracing::warn!(error = %error, "invitation sweeper ended abnormally");
        }
    }
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn sweep_invitations(
    storage: Arc<PostgresStorage>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match strongbox_api::sweep_expired(storage.as_ref(), SystemTime::now(), SWEEP_BATCH).await
        {
            Ok(0) => {}
            Ok(expired) => tracing::info!(expired, "expired overdue invitations"),
            Err(error) => tracing::warn!(error = %error, "invitation sweep failed"),
        }
    }
}
