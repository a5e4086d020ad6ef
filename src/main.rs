//! Parley server
//!
//! Metered expert sessions: presence, single-slot admission, wait queues and
//! per-interval billing behind a REST + WebSocket API.

use actix_cors::Cors;
use actix_web::{http::header, middleware, web, App, HttpResponse, HttpServer};
use parley_api::{configure_api, ws_handler};
use parley_cache::RedisCache;
use parley_core::config::LogConfig;
use parley_core::traits::{
    AccountStore, NoopMirror, NotificationGateway, SessionRepository, StatusMirror,
};
use parley_core::{AppConfig, AppError};
use parley_db::{
    create_pool, run_migrations, InMemoryAccountStore, InMemorySessionRepository,
    PgAccountStore, PgSessionRepository,
};
use parley_services::{EngineSettings, LogGateway, PresenceRegistry, SessionManager, WebhookGateway};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Stores = (Arc<dyn AccountStore>, Arc<dyn SessionRepository>);

/// Initialize tracing/logging
fn init_tracing(log: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "parley={level},parley_api={level},parley_services={level},parley_db={level},parley_cache={level},actix_web=info,sqlx=warn",
            level = log.level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if log.json {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

fn startup_error(err: AppError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// PostgreSQL when a URL is configured, in-memory otherwise
async fn build_stores(config: &AppConfig) -> Result<Stores, AppError> {
    if let Some(url) = &config.database.url {
        info!("Connecting to database...");
        let pool = create_pool(url, Some(config.database.max_connections)).await?;
        if config.database.run_migrations {
            run_migrations(&pool).await?;
        }
        info!(
            "Database connection established with {} max connections",
            config.database.max_connections
        );
        let accounts: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool.clone()));
        let sessions: Arc<dyn SessionRepository> = Arc::new(PgSessionRepository::new(pool));
        return Ok((accounts, sessions));
    }

    let accounts = match &config.database.seed_file {
        Some(path) => {
            let store = InMemoryAccountStore::from_seed_file(path)?;
            info!("Loaded {} accounts from {}", store.len(), path);
            store
        }
        None => {
            warn!("No database configured and no seed file, starting with an empty account store");
            InMemoryAccountStore::new()
        }
    };
    let sessions: Arc<dyn SessionRepository> = Arc::new(InMemorySessionRepository::new());
    Ok((Arc::new(accounts), sessions))
}

/// Redis status mirror when configured; a failed connection only disables mirroring
async fn build_mirror(config: &AppConfig) -> Arc<dyn StatusMirror> {
    match &config.redis.url {
        Some(url) => match RedisCache::new(url).await {
            Ok(cache) => {
                info!("Expert status mirrored to Redis");
                Arc::new(cache)
            }
            Err(e) => {
                warn!("Redis unavailable, status mirroring disabled: {}", e);
                Arc::new(NoopMirror)
            }
        },
        None => Arc::new(NoopMirror),
    }
}

fn build_gateway(config: &AppConfig) -> Result<Arc<dyn NotificationGateway>, AppError> {
    match &config.notifications.webhook_url {
        Some(url) => {
            let timeout = Duration::from_secs(config.notifications.timeout_secs);
            info!("Push alerts delivered to {}", url);
            Ok(Arc::new(WebhookGateway::new(url.clone(), timeout)?))
        }
        None => Ok(Arc::new(LogGateway)),
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| startup_error(e.into()))?;

    init_tracing(&config.log);

    info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));

    let (accounts, sessions) = build_stores(&config).await.map_err(startup_error)?;
    let mirror = build_mirror(&config).await;
    let gateway = build_gateway(&config).map_err(startup_error)?;

    let settings = EngineSettings::from(&config.billing);
    info!(
        interval_secs = settings.billing_interval.as_secs(),
        low_balance_threshold = settings.low_balance_threshold,
        "Billing configured"
    );

    let manager = SessionManager::new(
        accounts,
        sessions,
        Arc::new(PresenceRegistry::new()),
        gateway,
        mirror,
        settings,
    );

    let report = manager.recover().await.map_err(startup_error)?;
    info!(
        resumed = report.resumed,
        ended = report.ended,
        awaiting_reconnect = report.awaiting_reconnect,
        "Recovered sessions from storage"
    );

    let bind_addr = config.server_addr();
    let workers = config.server.workers;
    let cors_origins = config.server.cors_origins.clone();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, workers
    );

    let data = web::Data::from(Arc::clone(&manager));

    HttpServer::new(move || {
        let cors_origins_inner = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _req_head| {
                let origins: Vec<&str> = cors_origins_inner.split(',').collect();
                if let Ok(origin_str) = origin.to_str() {
                    origins.iter().any(|o| o.trim() == origin_str)
                } else {
                    false
                }
            })
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(64 * 1024))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::Logger::new("%a \"%r\" %s %b %Dms"))
            .wrap(middleware::Compress::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(configure_api)
            .route("/ws", web::get().to(ws_handler))
            .route(
                "/",
                web::get().to(|| async {
                    HttpResponse::Found()
                        .append_header(("Location", "/api/v1/health"))
                        .finish()
                }),
            )
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await?;

    info!("Server stopped, cancelling billing jobs");
    manager.shutdown();
    Ok(())
}
