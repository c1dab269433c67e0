use anyhow::Context;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use seatlock_api::{app, AppState};
use seatlock_engine::{HoldSettings, TimeoutSweeper};
use seatlock_store::{app_config::Config, DbClient, PgSeatStore, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seatlock_api=debug,seatlock_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting seat booking API on port {}", config.server.port);

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    redis.ping().await.context("Redis did not answer PING")?;

    let store = Arc::new(PgSeatStore::new(db.pool.clone(), config.database.lock_timeout()));
    let locks = Arc::new(redis);

    let settings = HoldSettings {
        hold_window: chrono::Duration::from_std(Duration::from_secs(config.booking.hold_seconds))
            .context("booking.hold_seconds is out of range")?,
        lock_ttl: Duration::from_secs(config.booking.lock_ttl_seconds),
        payment_gateway_url: config.booking.payment_gateway_url.clone(),
    };

    let sweeper = TimeoutSweeper::new(store.clone(), locks.clone(), config.sweeper.interval());
    let mut sweeper_task = tokio::spawn(async move { sweeper.run().await });

    let app = app(AppState::new(store, locks, settings));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        served = server.into_future() => served.context("Server error")?,
        joined = &mut sweeper_task => anyhow::bail!("Timeout sweeper stopped: {:?}", joined),
    }

    sweeper_task.abort();
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
