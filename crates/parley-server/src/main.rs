mod config;

use std::sync::Arc;

use axum::{Router, http::HeaderValue};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::AppStateInner;
use parley_db::{Database, RoomStore};
use parley_gateway::GatewayState;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::handshake::SessionAuthenticator;
use parley_gateway::ingest::MessageIngestor;
use parley_gateway::presence::PresenceRegistry;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,parley_api=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    let rooms = Arc::new(RoomStore::new(db.clone(), config.role_policy.clone()));

    // Shared state
    let dispatcher = Dispatcher::with_capacity(config.broadcast_capacity);
    let presence = PresenceRegistry::new(dispatcher.clone(), config.presence_mode);

    let gateway = GatewayState {
        authenticator: SessionAuthenticator::new(&config.jwt_secret, db.clone(), config.handshake_timeout),
        dispatcher: dispatcher.clone(),
        presence: presence.clone(),
        ingestor: MessageIngestor::new(rooms.clone(), dispatcher),
    };

    let app_state = Arc::new(AppStateInner {
        db,
        rooms,
        presence,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl: config.token_ttl,
    });

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(parley_gateway::upgrade::router(gateway))
        .layer(cors_layer(config.frontend_url.as_deref())?)
        .layer(TraceLayer::new_for_http());

    info!(
        "Parley server listening on {} (presence: {:?})",
        config.addr, config.presence_mode
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Permissive unless a frontend origin is configured.
fn cors_layer(frontend_url: Option<&str>) -> anyhow::Result<CorsLayer> {
    let Some(url) = frontend_url else {
        return Ok(CorsLayer::permissive());
    };

    let origin: HeaderValue = url.parse()?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any))
}
