//! Room relay for synchronized playback.
//!
//! Clients connect over a WebSocket, say hello, then create or join rooms. The host of a room
//! publishes its playback state and the relay fans it out to every active follower.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
mod relay;
pub mod state;

pub use config::{RelayConfig, ServerArgs};
pub use error::RelayError;
pub use relay::{PING_PERIOD, PONG_WAIT, WRITE_WAIT};
pub use state::ServerState;

#[derive(Clone)]
struct AppState {
    relay: ServerState,
    shutdown: CancellationToken,
}

/// HTTP surface: the WebSocket endpoint at `config.ws_path` plus `/healthz`.
pub fn router(config: &RelayConfig, relay: ServerState, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route(&config.ws_path, get(ws_endpoint))
        .with_state(AppState { relay, shutdown })
}

/// Serves until `shutdown` is cancelled, running the idle reaper alongside.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let relay = ServerState::new(config.host_idle_timeout);
    let reaper = tokio::spawn(relay.clone().run_idle_reaper(shutdown.child_token()));
    let app = router(&config, relay, shutdown.clone());

    tracing::info!(
        "Tandem relay listening on {}{} (host idle timeout: {:?})",
        listener.local_addr()?,
        config.ws_path,
        config.host_idle_timeout
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    shutdown.cancel();
    reaper.await?;
    tracing::info!("Tandem relay stopped");
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay::handle_connection(socket, app.relay, app.shutdown))
}

async fn health_check() -> &'static str {
    "ok"
}
