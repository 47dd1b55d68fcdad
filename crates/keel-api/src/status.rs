use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};

use keel_chain::RelayAction;
use keel_types::api::{Claims, PostStatusRequest, PostStatusResponse};
use keel_types::models::TxPurpose;

use crate::anchor::resolve_anchor;
use crate::{ApiError, AppState};

/// Anchor a status post. Profile storage belongs to the CRUD layer; this
/// endpoint only produces the ledger record and degrades cleanly when the
/// chain is unreachable.
pub async fn post_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    let payload = format!("{}:{}", claims.sub, req.content);
    let outcome = resolve_anchor(
        &state,
        RelayAction::PostStatus,
        TxPurpose::Status,
        &claims.sub,
        payload.as_bytes(),
        None,
    )
    .await?;

    Ok(Json(PostStatusResponse {
        on_chain: outcome.on_chain(),
        tx_ref: outcome.tx_ref().map(|s| s.to_string()),
    }))
}
