//! Chatdesk - Blast campaign server entry point

use anyhow::{Context, Result};
use chatdesk_api::AppState;
use chatdesk_common::config::{Config, LoggingConfig};
use chatdesk_core::{
    BlastEngine, BlastMetrics, EngineContext, EngineSettings, HttpChannelAdapter,
    HttpTextGenerator,
};
use chatdesk_storage::{
    CampaignRepository, ContactDirectory, DatabasePool, DbCampaignRepository,
    DbContactDirectory, DbRecipientRepository, MemoryStore, RecipientRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long pacers get to finish an in-flight send on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Repositories behind the engine, plus the pool when running on Postgres
struct Stores {
    campaigns: Arc<dyn CampaignRepository>,
    recipients: Arc<dyn RecipientRepository>,
    contacts: Arc<dyn ContactDirectory>,
    db_pool: Option<DatabasePool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Chatdesk blast server...");

    let stores = open_stores(&config).await?;

    let generator = HttpTextGenerator::new(&config.ai)?;
    let channel = HttpChannelAdapter::new(&config.channel)?;
    let metrics = BlastMetrics::new()?;

    let ctx = EngineContext::new(
        stores.campaigns,
        stores.recipients,
        stores.contacts,
        Arc::new(generator),
        Arc::new(channel),
        metrics,
        EngineSettings::from_config(&config),
    );
    let engine = Arc::new(BlastEngine::new(ctx));

    // Repair anything a previous run left in flight before new work starts
    let report = engine
        .recover()
        .await
        .context("Startup recovery failed")?;
    info!(
        stale_generation_flags = report.stale_generation_flags,
        generating_reset = report.generating_reset,
        sending_reset = report.sending_reset,
        sending_failed = report.sending_failed,
        "Startup recovery complete"
    );

    // Start supervisor
    let supervisor_handle = {
        let supervisor = engine.supervisor();
        tokio::spawn(supervisor.run())
    };

    // Start API server
    let app = chatdesk_api::create_router(
        AppState {
            engine: engine.clone(),
            db_pool: stores.db_pool,
        },
        &config.api.cors_origins,
    );
    let addr = format!("{}:{}", config.server.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;
    info!("Starting API server on {}", addr);

    let api_handle = {
        let shutdown = engine.context().shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Chatdesk server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Cancels the shared token: supervisor, pacers and the API server stop
    engine.shutdown(SHUTDOWN_GRACE).await;

    if tokio::time::timeout(SHUTDOWN_GRACE, supervisor_handle).await.is_err() {
        warn!("Supervisor did not stop in time");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await.is_err() {
        warn!("API server did not stop in time");
    }

    info!("Chatdesk server shutdown complete");

    Ok(())
}

async fn open_stores(config: &Config) -> Result<Stores> {
    let Some(db_pool) = DatabasePool::connect(&config.database).await? else {
        warn!("Using the in-memory store; campaigns are lost on restart");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            campaigns: store.clone(),
            recipients: store.clone(),
            contacts: store,
            db_pool: None,
        });
    };
    info!("Database connection established");

    if config.database.run_migrations {
        db_pool.migrate().await?;
        info!("Database migrations completed");
    }

    Ok(Stores {
        campaigns: Arc::new(DbCampaignRepository::new(db_pool.clone())),
        recipients: Arc::new(DbRecipientRepository::new(db_pool.clone())),
        contacts: Arc::new(DbContactDirectory::new(db_pool.clone())),
        db_pool: Some(db_pool),
    })
}

fn init_logging(config: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},chatdesk=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
