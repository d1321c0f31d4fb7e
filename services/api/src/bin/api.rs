//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{ConnectivityProbe, FileStorage, HttpProviderApi, PgStore, TracingNotifier},
    config::Config,
    error::ApiError,
    web::{
        build_router,
        rest::ApiDoc,
        state::{AppState, Backends},
    },
};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use axum::Router;
use session_reliability_core::memory::{MemoryCatalog, MemoryConfigSource, MemoryStore};
use session_reliability_core::ports::{CourseCatalog, ProviderConfigSource, SessionStore, UsageStore};
use session_reliability_core::{ConnectivityMonitor, SystemClock};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

type Stores = (
    Arc<dyn SessionStore>,
    Arc<dyn UsageStore>,
    Arc<dyn ProviderConfigSource>,
    Arc<dyn CourseCatalog>,
);

/// Connects to PostgreSQL when configured, otherwise keeps everything in memory.
async fn connect_stores(config: &Config) -> Result<Stores, ApiError> {
    match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = Arc::new(PgStore::new(db_pool));
            info!("Running database migrations...");
            store.run_migrations().await?;
            info!("Database migrations complete.");
            let stores: Stores = (store.clone(), store.clone(), store.clone(), store);
            Ok(stores)
        }
        None => {
            warn!("DATABASE_URL is not set, sessions and usage are kept in memory");
            let store = Arc::new(MemoryStore::new());
            let stores: Stores = (
                store.clone(),
                store,
                Arc::new(MemoryConfigSource::default()),
                Arc::new(MemoryCatalog::default()),
            );
            Ok(stores)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect the Stores ---
    let (sessions, usage, provider_config, catalog) = connect_stores(&config).await?;

    // --- 3. Initialize Service Adapters ---
    let provider = Arc::new(HttpProviderApi::new(config.provider_base_url.clone())?);
    let storage = Arc::new(FileStorage::open(&config.offline_queue_dir).await?);
    let connectivity = Arc::new(ConnectivityMonitor::default());

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(
        AppState::assemble(
            config.clone(),
            Backends {
                sessions,
                usage,
                provider_config,
                catalog,
                provider,
                storage,
                notifier: Arc::new(TracingNotifier),
                clock: Arc::new(SystemClock),
                connectivity: connectivity.clone(),
            },
        )
        .await?,
    );

    // --- 5. Start Background Tasks ---
    let shutdown = CancellationToken::new();
    let queue_task = app_state
        .queue()
        .clone()
        .spawn_background(app_state.practice.clone(), shutdown.child_token());
    let probe_task = ConnectivityProbe::new(
        config.provider_base_url.clone(),
        connectivity,
        Duration::from_secs(5),
    )?
    .spawn(config.connectivity_probe_interval, shutdown.child_token());

    // --- 6. Create the Web Router ---
    let origin = config.callback_origin.origin().ascii_serialization();
    let cors = CorsLayer::new()
        .allow_origin(
            origin
                .parse::<HeaderValue>()
                .map_err(|e| ApiError::Internal(format!("CALLBACK_ORIGIN is not a valid origin: {e}")))?,
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-user-tier"),
        ]);

    let app = Router::new()
        .merge(build_router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for the shutdown signal");
            }
            stop.cancel();
        })
        .await?;

    // --- 8. Drain Background Tasks ---
    shutdown.cancel();
    for task in [queue_task, probe_task] {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("Server stopped.");
    Ok(())
}
