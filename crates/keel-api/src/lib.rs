pub mod anchor;
pub mod auth;
pub mod calls;
pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod receipts;
pub mod status;
pub mod transactions;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::error;

use keel_chain::{RelaySigner, TransactionVerifier};
use keel_db::Database;
use keel_gateway::{CallError, CallSessionManager, Hub};
use keel_types::error::ErrorKind;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub hub: Hub,
    pub verifier: TransactionVerifier,
    pub relay: Arc<RelaySigner>,
    pub calls: CallSessionManager,
    pub jwt_secret: String,
    /// Anchor contract address relayed and client-submitted transactions
    /// must target. None disables the target check.
    pub anchor_contract: Option<String>,
}

impl AppStateInner {
    pub fn anchor_contract(&self) -> Option<&str> {
        self.anchor_contract.as_deref()
    }
}

/// Handler failure: either a taxonomy value with its short user-facing
/// string, or an internal error that is logged and hidden.
#[derive(Debug)]
pub enum ApiError {
    Kind(ErrorKind),
    Status(StatusCode),
    Internal(anyhow::Error),
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::Kind(kind)
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Kind(kind) => Self::Kind(kind),
            CallError::Store(e) => Self::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Kind(kind) => {
                let status = match kind {
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    ErrorKind::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, Json(serde_json::json!({ "error": kind.to_string() }))).into_response()
            }
            Self::Status(status) => status.into_response(),
            Self::Internal(e) => {
                error!("internal error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Run blocking store work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::Internal),
        Err(e) => Err(ApiError::Internal(anyhow::anyhow!(
            "spawn_blocking join error: {}",
            e
        ))),
    }
}

/// The HTTP surface. Everything except session issuance sits behind the JWT
/// middleware.
pub fn routes(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/session", post(auth::create_session))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/reactions",
            post(reactions::toggle_reaction),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/anchor",
            post(messages::anchor_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(receipts::mark_read),
        )
        .route(
            "/conversations/{conversation_id}/calls",
            get(calls::list_calls).post(calls::initiate_call),
        )
        .route("/calls/{call_id}/ring", post(calls::ring_call))
        .route("/calls/{call_id}/accept", post(calls::accept_call))
        .route("/calls/{call_id}/decline", post(calls::decline_call))
        .route("/calls/{call_id}/cancel", post(calls::cancel_call))
        .route("/calls/{call_id}/end", post(calls::end_call))
        .route("/status", post(status::post_status))
        .route(
            "/transactions/{hash}",
            get(transactions::get_transaction),
        )
        .layer(axum::middleware::from_fn(middleware::require_auth))
        .with_state(state);

    Router::new().merge(public).merge(protected)
}
