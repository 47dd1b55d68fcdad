use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use keel_db::queries::fmt_ts;
use keel_types::api::{Claims, ConversationResponse, CreateConversationRequest};
use keel_types::models::{Conversation, ConversationKind, Participant, ParticipantRole};

use crate::auth::normalize_address;
use crate::{ApiError, AppState, run_blocking};

/// Create (or return) the direct conversation with a peer. Creating the same
/// pair twice returns the existing conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub.clone();
    let peer = normalize_address(&req.peer).ok_or(StatusCode::BAD_REQUEST)?;
    if peer == me {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    let id = Uuid::new_v4();
    let (conversation_id, created) = {
        let db = state.db.clone();
        let me = me.clone();
        let peer = peer.clone();
        run_blocking(move || {
            db.create_direct_conversation(&id.to_string(), &me, &peer, &fmt_ts(Utc::now()))
        })
        .await?
    };

    if created {
        info!("conversation {} created between {} and {}", conversation_id, me, peer);
    }

    let conversation_id: Uuid = conversation_id.parse().map_err(|e| {
        ApiError::Internal(anyhow::anyhow!("corrupt conversation id: {}", e))
    })?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(ConversationResponse {
            id: conversation_id,
            kind: ConversationKind::Direct,
            participants: vec![me, peer],
            created,
        }),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let address = claims.sub.clone();

    let db = state.db.clone();
    let conversations = run_blocking(move || {
        let rows = db.conversations_for(&address)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = db.participants_for(&row.id)?;
            out.push((row, participants))
        }
        Ok(out)
    })
    .await?;

    let conversations: Vec<Conversation> = conversations
        .into_iter()
        .map(|(row, participants)| Conversation {
            id: row.id.parse().unwrap_or_else(|e| {
                warn!("Corrupt conversation id '{}': {}", row.id, e);
                Uuid::default()
            }),
            kind: match row.kind.as_str() {
                "group" => ConversationKind::Group,
                _ => ConversationKind::Direct,
            },
            participants: participants
                .into_iter()
                .map(|p| Participant {
                    address: p.address,
                    role: match p.role.as_str() {
                        "admin" => ParticipantRole::Admin,
                        _ => ParticipantRole::Member,
                    },
                })
                .collect(),
            created_at: parse_ts_or_default(&row.created_at, &row.id),
            updated_at: parse_ts_or_default(&row.updated_at, &row.id),
        })
        .collect();

    Ok(Json(conversations))
}

fn parse_ts_or_default(s: &str, id: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on conversation '{}': {}", s, id, e);
            chrono::DateTime::default()
        })
}

/// Shared participant gate for the conversation-scoped routes.
pub(crate) async fn require_participant(
    state: &AppState,
    conversation_id: Uuid,
    address: &str,
) -> Result<(), ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let addr = address.to_string();
    let is_member = run_blocking(move || db.is_participant(&cid, &addr)).await?;
    if is_member {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN.into())
    }
}
