use axum::http::HeaderValue;
use axum::{routing::get, Router};
use std::panic;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use assetgrid_api::config::{self, Config};
use assetgrid_api::db::dbsessions::SqlSessionStore;
use assetgrid_api::docs::ApiDoc;
use assetgrid_api::handlers;
use assetgrid_api::pubsub::RedisPubSub;
use assetgrid_api::routes::api::create_api_routes;
use assetgrid_api::services::session_service::SessionStore;
use assetgrid_api::state::AppState;
use assetgrid_api::ws::hub::{Bridge, Hub, HubConfig};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "assetgrid_api=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let app_config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Initialize global configuration
    if let Err(e) = config::init_config(app_config) {
        error!("Failed to initialize global configuration: {}", e);
        return;
    }
    let config = config::get_config();

    // Session store backing websocket authentication
    let sessions: Arc<dyn SessionStore> = match &config.db_url {
        Some(db_url) => match SqlSessionStore::connect(db_url).await {
            Ok(store) => {
                info!("Database initialized successfully");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                return;
            }
        },
        None => {
            error!("No database URL configured - websocket connections cannot be authenticated");
            return;
        }
    };

    // Cross-instance broadcast bridge
    let bridge = match &config.redis_url {
        Some(redis_url) => match RedisPubSub::connect(redis_url).await {
            Ok(pubsub) => Bridge::Broker(Arc::new(pubsub)),
            Err(e) => {
                error!("Failed to connect to redis: {}", e);
                warn!("Falling back to single-instance broadcast");
                Bridge::Direct
            }
        },
        None => {
            info!("No redis URL configured, using single-instance broadcast");
            Bridge::Direct
        }
    };

    // Start the realtime hub
    let (hub, runner) = Hub::new(bridge, HubConfig::default());
    let hub_task = tokio::spawn(runner.run());
    info!("Websocket hub running");

    let state = AppState::new(Arc::clone(&hub), sessions, config.allowed_origins());

    // Create API routes
    let api_routes = create_api_routes(state);

    // Combine all routes
    let app_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::ready_check))
        // Mount API routes
        .nest("/api", api_routes)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors_layer(config))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("Server running on http://{}", config.server_address());
    info!(
        "Websocket available at ws://{}/api/ws",
        config.server_address()
    );
    info!(
        "Swagger UI available at http://{}/swagger",
        config.server_address()
    );

    axum::serve(listener, app_routes)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed to start");

    // Let the hub drain its cleanup workers before exiting
    hub.shutdown();
    let _ = hub_task.await;
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
