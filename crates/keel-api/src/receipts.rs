use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use keel_db::queries::fmt_ts;
use keel_gateway::Room;
use keel_types::api::{Claims, MarkReadRequest};
use keel_types::events::ServerEvent;

use crate::conversations::require_participant;
use crate::{ApiError, AppState, run_blocking};

/// Record read receipts for displayed messages. Upsert semantics: marking a
/// message read twice is a no-op, not an error. The room event fires only
/// when at least one new receipt landed.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reader = claims.sub.clone();
    require_participant(&state, conversation_id, &reader).await?;

    let inserted = {
        let db = state.db.clone();
        let cid = conversation_id.to_string();
        let reader = reader.clone();
        let ids: Vec<String> = req.message_ids.iter().map(|id| id.to_string()).collect();
        run_blocking(move || {
            let now = fmt_ts(Utc::now());
            let mut inserted = 0usize;
            for id in &ids {
                // Only messages of this conversation, and never the
                // reader's own.
                let Some(row) = db.get_message(id)? else {
                    continue;
                };
                if row.conversation_id != cid || row.sender == reader {
                    continue;
                }
                if db.mark_read(id, &reader, &now)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
        .await?
    };

    if inserted > 0 {
        state
            .hub
            .publish(
                &Room::Conversation(conversation_id),
                ServerEvent::MessagesRead {
                    conversation_id,
                    reader,
                },
            )
            .await;
    }

    Ok(Json(serde_json::json!({ "marked": inserted })))
}
