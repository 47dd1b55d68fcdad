use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use keel_api::{AppState, AppStateInner};
use keel_chain::{NodeClient, RelayConfig, RelaySigner, TransactionVerifier};
use keel_gateway::{CallSessionManager, Hub, connection};
use keel_types::api::Claims;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("KEEL_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| "keel.db".into());
    let host = std::env::var("KEEL_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("KEEL_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let node_url =
        std::env::var("KEEL_NODE_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".into());
    let node_auth_key = std::env::var("KEEL_NODE_AUTH_KEY").ok().filter(|s| !s.is_empty());
    let anchor_contract = std::env::var("KEEL_ANCHOR_CONTRACT")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase());
    let relay_address = std::env::var("KEEL_RELAY_ADDRESS")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase());

    let rpc_timeout = env_secs("KEEL_RPC_TIMEOUT_SECS", 10);
    let receipt_deadline = env_secs("KEEL_RECEIPT_TIMEOUT_SECS", 60);
    let ring_timeout = env_secs("KEEL_RING_TIMEOUT_SECS", 30);
    let presence_grace = env_secs("KEEL_PRESENCE_GRACE_SECS", 5);

    // Init database
    let db = Arc::new(keel_db::Database::open(&PathBuf::from(&db_path))?);

    // Ledger plumbing. The relay credential is optional; without it every
    // anchored action degrades to the off-chain path.
    let node = NodeClient::new(&node_url, node_auth_key, rpc_timeout)
        .map_err(|e| anyhow::anyhow!("node client init failed: {}", e))?;
    let verifier = TransactionVerifier::new(node.clone(), receipt_deadline, Duration::from_secs(1));

    let relay_config = match (relay_address, anchor_contract.clone()) {
        (Some(relay_address), Some(contract)) => {
            info!("relay signing enabled from {}", relay_address);
            Some(RelayConfig {
                relay_address,
                anchor_contract: contract,
            })
        }
        _ => {
            warn!("relay signing not configured; messages will anchor off-chain only");
            None
        }
    };
    let relay = Arc::new(RelaySigner::new(
        node,
        relay_config,
        receipt_deadline,
        Duration::from_secs(1),
    ));

    // Shared state
    let hub = Hub::new(presence_grace);
    let calls = CallSessionManager::new(db.clone(), hub.clone(), ring_timeout);

    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        hub: hub.clone(),
        verifier,
        relay,
        calls,
        jwt_secret: jwt_secret.clone(),
        anchor_contract,
    });

    let ws_state = WsState {
        hub,
        db,
        jwt_secret,
    };

    // Routes
    let app = Router::new()
        .merge(keel_api::routes(state))
        .merge(
            Router::new()
                .route("/gateway", get(ws_upgrade))
                .with_state(ws_state),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Keel server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

#[derive(Clone)]
struct WsState {
    hub: Hub,
    db: Arc<keel_db::Database>,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

/// Authenticate at the upgrade layer; the socket loop starts pre-authed.
async fn ws_upgrade(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let token_data = decode::<Claims>(
        &query.token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let claims = token_data.claims;
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.hub, state.db, claims.sub, claims.display_name)
    }))
}
