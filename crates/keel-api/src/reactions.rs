use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use keel_gateway::Room;
use keel_types::api::{Claims, ToggleReactionRequest};
use keel_types::error::ErrorKind;
use keel_types::events::{ReactionAction, ServerEvent};

use crate::conversations::require_participant;
use crate::{ApiError, AppState, run_blocking};

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = claims.sub.clone();
    require_participant(&state, conversation_id, &address).await?;

    let reaction_id = Uuid::new_v4();

    let added = {
        let db = state.db.clone();
        let cid = conversation_id.to_string();
        let mid = message_id.to_string();
        let addr = address.clone();
        let emoji = req.emoji.clone();
        run_blocking(move || {
            // The message must exist in this conversation.
            let row = db.get_message(&mid)?;
            match row {
                Some(row) if row.conversation_id == cid => {
                    Ok(Some(db.toggle_reaction(&reaction_id.to_string(), &mid, &addr, &emoji)?))
                }
                _ => Ok(None),
            }
        })
        .await?
        .ok_or(ApiError::Kind(ErrorKind::NotFound))?
    };

    let action = if added {
        ReactionAction::Added
    } else {
        ReactionAction::Removed
    };
    state
        .hub
        .publish(
            &Room::Conversation(conversation_id),
            ServerEvent::MessageReaction {
                conversation_id,
                message_id,
                user: address,
                emoji: req.emoji,
                action,
            },
        )
        .await;

    Ok(Json(serde_json::json!({ "added": added })))
}
