mod config;
mod error;
mod fetcher;
mod handlers;
mod item;
mod pipeline;
mod progress;
mod queue;
mod registry;
mod state;
mod storage;
#[cfg(test)]
mod testing;

use axum::{
    Router,
    routing::{get, post},
};
use local_ip_address::local_ip;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{Level, info};

use crate::config::Settings;
use crate::fetcher::ReqwestFetcher;
use crate::handlers::api;
use crate::registry::SessionRegistry;
use crate::state::AppState;
use crate::storage::LocalStorageProvider;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting drive-relay...");

    for dir in [&settings.work_dir, &settings.storage_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir).expect("Failed to create data directory");
        }
    }

    let local_ip = local_ip().unwrap_or("127.0.0.1".parse().unwrap());
    let host_url = settings
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", local_ip, settings.server_port));

    let fetcher = ReqwestFetcher::new().expect("Failed to build HTTP client");
    let storage = LocalStorageProvider::new(settings.storage_dir.clone(), host_url.clone());
    info!("Storing relayed files under {:?}", storage.root());

    let registry = SessionRegistry::new(
        settings.queue_options(),
        Arc::new(fetcher),
        Arc::new(storage),
    );

    let state = AppState {
        settings: settings.clone(),
        host_url: host_url.clone(),
        registry: registry.clone(),
    };

    // --- Router Setup ---
    let app = create_app(state);

    let port = settings.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    info!("Network address: {}", host_url);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    registry.shutdown();
    info!("drive-relay stopped.");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(api::server_info))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/downloads", get(api::list_downloads))
        .route("/api/downloads/{id}", get(api::list_session_downloads))
        .route("/api/download", post(api::add_download))
        .route("/api/download/stop", get(api::stop_download))
        .route("/api/download/restart", get(api::restart_download))
        .route("/api/download/remove", get(api::remove_download))
        .route("/api/logout", post(api::logout))
        .route("/events", get(api::sse_handler))
        .nest_service("/storage", ServeDir::new(&state.settings.storage_dir))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
