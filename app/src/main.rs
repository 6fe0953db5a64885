use clap::{Parser, Subcommand};
use co_channels::{AdapterSet, EmailAdapter, InAppAdapter, PushAdapter, SmsAdapter};
use co_config::Config;
use co_core::telemetry;
use co_db::{
    Db, DeliveryAttemptRepository, DeviceTokenRepository, InboxItemRepository,
    SuppressionRepository,
};
use co_engine::{DeliveryEngine, EngineSettings};
use co_obs::ObsState;
use co_orchestrator::Orchestrator;
use co_prefs::PreferenceResolver;
use co_realtime::{RealtimeState, SessionRegistry};
use co_template::Renderer;
use co_web::AppState;
use std::{process, sync::Arc, time::Duration};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier multi-channel notification service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Start,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init_tracing("development", "courier");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Initialize database with migrations
    let db = match Db::new(&config.database.path).await {
        Ok(db) => {
            tracing::info!("Database initialized successfully");
            db
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.health_check().await {
        tracing::error!("Database health check failed: {}", e);
        process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            tracing::info!("courier starting");
            if let Err(e) = start_server(config, db).await {
                tracing::error!("Failed to start server: {}", e);
                process::exit(1);
            }
        }
    }
}

async fn start_server(config: Config, db: Db) -> co_core::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        obs_port = %config.server.obs_port,
        db_path = %config.database.path,
        "Application configured and ready"
    );

    // Shared leaves first: resolver, renderer, session registry
    let resolver = Arc::new(PreferenceResolver::new(db.clone()));
    let renderer = Arc::new(Renderer::new(db.clone()));
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(
        config.session.idle_timeout_ms,
    )));

    // Channel adapters; a channel without provider configuration stays
    // unregistered and its jobs surface as internal failures
    let mut adapters = AdapterSet::new();

    match &config.providers.smtp {
        Some(smtp) => {
            let adapter = EmailAdapter::new(smtp, SuppressionRepository::new(db.clone()))?;
            adapters.register(Arc::new(adapter));
        }
        None => tracing::warn!("No SMTP configuration; email channel disabled"),
    }

    match &config.providers.sms {
        Some(sms) => adapters.register(Arc::new(SmsAdapter::new(sms.clone()))),
        None => tracing::warn!("No SMS provider configuration; sms channel disabled"),
    }

    match &config.providers.push {
        Some(push) => adapters.register(Arc::new(PushAdapter::new(
            push.clone(),
            DeviceTokenRepository::new(db.clone()),
        ))),
        None => tracing::warn!("No push provider configuration; push channel disabled"),
    }

    adapters.register(Arc::new(InAppAdapter::new(
        registry.clone(),
        InboxItemRepository::new(db.clone()),
    )));

    // Delivery engine
    let engine = DeliveryEngine::new(
        db.clone(),
        resolver.clone(),
        renderer.clone(),
        adapters,
        EngineSettings::from(&config),
    );
    engine.start();

    // Intake: the orchestrator only holds the engine's wake handle
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        resolver.clone(),
        renderer.clone(),
        engine.handle(),
        config.retry.attempts,
    ));

    // Observability: engine metrics join the scrape registry
    let obs_state = ObsState::new();
    let metrics = engine.metrics();
    obs_state.with_registry(|registry| metrics.register_into(registry))?;

    // Idle session sweep keeps the registry tight
    {
        let registry = registry.clone();
        let period = Duration::from_millis(config.session.idle_timeout_ms / 2).max(
            Duration::from_secs(1),
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let dropped = registry.sweep_idle().await;
                if !dropped.is_empty() {
                    tracing::debug!(count = dropped.len(), "Swept idle sessions");
                }
            }
        });
    }

    let realtime = actix_web::web::Data::new(RealtimeState {
        registry: registry.clone(),
        inbox: InboxItemRepository::new(db.clone()),
        jwt_secret: config.realtime.jwt_secret.clone(),
        heartbeat: Duration::from_millis(config.session.heartbeat_ms),
        backlog_limit: config.inbox.reconnect_backlog as i64,
    });

    let app_state = AppState {
        orchestrator,
        inbox: InboxItemRepository::new(db.clone()),
        tokens: DeviceTokenRepository::new(db.clone()),
        attempts: DeliveryAttemptRepository::new(db.clone()),
        suppressions: SuppressionRepository::new(db.clone()),
        webhooks: config.webhooks.clone(),
        metrics: engine.metrics(),
    };

    let obs_bind_addr = format!("0.0.0.0:{}", config.server.obs_port);
    let web_bind_addr = format!("{}:{}", config.server.host, config.server.port);

    obs_state.readiness.set_ready(true);

    let obs_future = co_obs::start_server(&obs_bind_addr, obs_state.clone());
    let web_future = co_web::start_server(&web_bind_addr, app_state, realtime);

    // Run both servers until one exits or shutdown is requested
    let result = tokio::select! {
        obs_result = obs_future => {
            tracing::error!("Observability server exited");
            obs_result
        }
        web_result = web_future => {
            tracing::error!("Web server exited");
            web_result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    // Drain: stop accepting, flush batches, await in-flight jobs
    obs_state.readiness.set_ready(false);
    engine.shutdown().await;

    if let Err(e) = result {
        tracing::error!("Server error: {}", e);
        return Err(co_core::Error::Internal(format!("Server error: {}", e)));
    }

    tracing::info!("courier stopped");
    Ok(())
}
