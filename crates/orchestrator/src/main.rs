use anyhow::Context;
use clap::Parser;
use crawlhub_core::bus::RedisBus;
use crawlhub_core::cache::RedisCache;
use crawlhub_core::{database, Config};
use crawlhub_orchestrator::Engine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "crawlhub-orchestrator", about = "Crawl job orchestration engine")]
struct Args {
    /// Apply pending database migrations and exit.
    #[arg(long, env = "MIGRATE_ONLY")]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crawlhub_orchestrator=debug,crawlhub_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;

    let db = database::create_pool(&config.database)
        .await
        .context("connecting to Postgres")?;
    database::run_migrations(&db)
        .await
        .context("applying migrations")?;

    if args.migrate_only {
        info!("migrations applied, exiting");
        return Ok(());
    }

    let cache = Arc::new(
        RedisCache::new(&config.cache)
            .await
            .context("connecting to Redis cache")?,
    );
    let bus = Arc::new(
        RedisBus::new(&config.bus)
            .await
            .context("connecting to Redis bus")?,
    );

    let engine = Engine::new(&config, db, cache, bus).context("wiring engine")?;
    let shutdown = CancellationToken::new();
    let handles = engine.start(shutdown.clone());
    info!("orchestration engine running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining background tasks");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("orchestration engine stopped");

    Ok(())
}
