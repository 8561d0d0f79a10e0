use axum::{
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    commands::{CommandMessage, CommandOutcome},
    config::Config,
    error::Error,
    forwarder::ForwarderStatus,
    gateway::GatewayHandle,
};

/// The control routes.
///
/// - `POST /command`: run a [`CommandMessage`]
/// - `GET /forwarders`: every live forwarder
/// - `GET /config`: the configuration in use
/// - `GET /version`: the running version
pub fn router(config: Config, gateway: GatewayHandle) -> Router {
    Router::new()
        .route("/command", post(run_command))
        .route("/forwarders", get(list_forwarders))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Handlers forward to the gateway
                .layer(Extension(gateway))
                .layer(Extension(config)),
        )
}

/// Serve the control channel on the configured address until it fails.
pub async fn run(config: Config, gateway: GatewayHandle) -> Result<(), Error> {
    let address = config.control_address;

    let server = axum::Server::try_bind(&address)
        .map_err(|e| Error::Bind {
            port: address.port(),
            problem: e.to_string(),
        })?
        .serve(router(config, gateway).into_make_service());

    info!("Control channel listening on {}", server.local_addr());

    server
        .await
        .map_err(|e| Error::InternalIssue(format!("Control channel stopped: {e}")))
}

async fn run_command(
    Extension(gateway): Extension<GatewayHandle>,
    Json(message): Json<CommandMessage>,
) -> Json<Result<CommandOutcome, Error>> {
    Json(gateway.command(message).await)
}

async fn list_forwarders(Extension(gateway): Extension<GatewayHandle>) -> Json<Vec<ForwarderStatus>> {
    Json(gateway.forwarders().await)
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config.serialize_pretty()
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Dock v{}\n", env!("CARGO_PKG_VERSION"))
}
