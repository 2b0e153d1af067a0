//! Pollbus Web Server
//!
//! Axum-based HTTP and WebSocket front end for the notification bus.

pub mod routes;
pub mod state;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use pollbus_core::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let longpolling = Router::new()
        .route("/send", post(routes::longpolling::send))
        .route("/poll", post(routes::longpolling::poll))
        .with_state(state.clone());

    Router::new()
        .nest("/longpolling", longpolling)
        .route("/websocket", get(websocket::ws_handler))
        .route("/health", get(routes::health::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the web server until ctrl-c, then shut the bus down so pending polls
/// and sessions are released.
pub async fn run_server(bus: Arc<Dispatcher>, addr: SocketAddr) -> anyhow::Result<()> {
    let maintenance = bus.spawn_maintenance();
    let app = create_router(AppState::new(Arc::clone(&bus)));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Bus server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&bus)))
        .await?;

    bus.shutdown();
    maintenance.abort();
    Ok(())
}

async fn shutdown_signal(bus: Arc<Dispatcher>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    bus.shutdown();
}
