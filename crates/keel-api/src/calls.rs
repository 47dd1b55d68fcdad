use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use keel_chain::RelayAction;
use keel_gateway::calls::call_from_row;
use keel_types::api::{Claims, DeclineCallRequest, InitiateCallRequest};
use keel_types::models::{Call, TxPurpose};

use crate::anchor::{AnchorOutcome, resolve_anchor};
use crate::auth::normalize_address;
use crate::conversations::require_participant;
use crate::{ApiError, AppState, run_blocking};

/// Place a call. The call row and events flow through the session manager;
/// this handler only authorizes and (optionally) anchors the initiation.
pub async fn initiate_call(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InitiateCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = claims.sub.clone();
    require_participant(&state, conversation_id, &caller).await?;

    let receiver = normalize_address(&req.receiver).ok_or(StatusCode::BAD_REQUEST)?;
    if receiver == caller {
        return Err(StatusCode::BAD_REQUEST.into());
    }
    require_participant(&state, conversation_id, &receiver).await?;

    let outcome = if req.anchor {
        let payload = format!("{}:{}:{}:{}", conversation_id, caller, receiver, req.kind.as_str());
        resolve_anchor(
            &state,
            RelayAction::InitiateCall,
            TxPurpose::Call,
            &caller,
            payload.as_bytes(),
            None,
        )
        .await?
    } else {
        AnchorOutcome::OffChain
    };

    let call = state
        .calls
        .initiate(
            conversation_id,
            &caller,
            &receiver,
            req.kind,
            outcome.tx_ref().map(|s| s.to_string()),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(call)))
}

pub async fn ring_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.calls.ring(call_id, &claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn accept_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let call = state.calls.accept(call_id, &claims.sub).await?;
    Ok(Json(call))
}

pub async fn decline_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<DeclineCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let call = state
        .calls
        .decline(call_id, &claims.sub, &req.decliner_name)
        .await?;
    Ok(Json(call))
}

pub async fn cancel_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let call = state.calls.cancel(call_id, &claims.sub).await?;
    Ok(Json(call))
}

pub async fn end_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let call = state.calls.end(call_id, &claims.sub).await?;
    Ok(Json(call))
}

pub async fn list_calls(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, &claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let rows = run_blocking(move || db.calls_for_conversation(&cid)).await?;

    let calls: Vec<Call> = rows.iter().map(call_from_row).collect();
    Ok(Json(calls))
}
