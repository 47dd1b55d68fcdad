use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use keel_chain::RelayAction;
use keel_db::models::MessageRow;
use keel_db::queries::fmt_ts;
use keel_types::api::{Claims, MessageResponse, ReactionGroup, SendMessageRequest};
use keel_types::error::ErrorKind;
use keel_types::events::ServerEvent;
use keel_types::models::{Message, MessageKind, TxPurpose};

use keel_gateway::Room;

use crate::anchor::resolve_anchor;
use crate::conversations::require_participant;
use crate::{ApiError, AppState, run_blocking};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// The send pipeline: anchor (or degrade), persist, then fan out. Publish
/// strictly follows persistence so live receivers never see a message that
/// history would not return.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = claims.sub.clone();
    require_participant(&state, conversation_id, &sender).await?;

    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    let outcome = if req.anchor || req.tx_ref.is_some() {
        let payload = format!("{}:{}:{}", conversation_id, sender, req.content);
        resolve_anchor(
            &state,
            RelayAction::SendMessage,
            TxPurpose::Message,
            &sender,
            payload.as_bytes(),
            req.tx_ref.as_deref(),
        )
        .await?
    } else {
        crate::anchor::AnchorOutcome::OffChain
    };

    let message_id = Uuid::new_v4();
    let now = Utc::now();

    {
        let db = state.db.clone();
        let cid = conversation_id.to_string();
        let mid = message_id.to_string();
        let sender = sender.clone();
        let content = req.content.clone();
        let kind = req.kind;
        let tx_ref = outcome.tx_ref().map(|s| s.to_string());
        let on_chain = outcome.on_chain();
        let reply_to = req.reply_to.map(|id| id.to_string());
        let ts = fmt_ts(now);
        run_blocking(move || {
            db.insert_message(
                &mid,
                &cid,
                &sender,
                &content,
                kind.as_str(),
                tx_ref.as_deref(),
                on_chain,
                reply_to.as_deref(),
                &ts,
            )?;
            db.touch_conversation(&cid, &ts)?;
            Ok(())
        })
        .await?;
    }

    let message = Message {
        id: message_id,
        conversation_id,
        sender: sender.clone(),
        content: req.content,
        kind: req.kind,
        tx_ref: outcome.tx_ref().map(|s| s.to_string()),
        on_chain: outcome.on_chain(),
        reply_to: req.reply_to,
        created_at: now,
    };

    state
        .hub
        .publish(
            &Room::Conversation(conversation_id),
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            id: message.id,
            conversation_id,
            sender: message.sender,
            content: message.content,
            kind: message.kind,
            tx_ref: message.tx_ref,
            on_chain: message.on_chain,
            reply_to: message.reply_to,
            created_at: message.created_at,
            reactions: vec![],
            read_by: vec![],
        }),
    ))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, &claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let limit = query.limit.min(200);
    let before = query.before;

    let (rows, reaction_rows, receipt_rows) = run_blocking(move || {
        let rows = db.get_messages(&cid, limit, before.as_deref())?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let reaction_rows = db.get_reactions_for_messages(&message_ids)?;
        let receipt_rows = db.get_receipts_for_messages(&message_ids)?;
        Ok((rows, reaction_rows, receipt_rows))
    })
    .await?;

    // Group reactions by message_id -> emoji -> addresses, receipts by
    // message_id (cheap in-memory work, fine on the async thread).
    let mut reaction_map: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
    for r in &reaction_rows {
        reaction_map
            .entry(r.message_id.clone())
            .or_default()
            .entry(r.emoji.clone())
            .or_default()
            .push(r.address.clone());
    }

    let mut receipt_map: HashMap<String, Vec<String>> = HashMap::new();
    for r in &receipt_rows {
        receipt_map
            .entry(r.message_id.clone())
            .or_default()
            .push(r.reader.clone());
    }

    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .map(|row| {
            let reactions = reaction_map
                .get(&row.id)
                .map(|emoji_map| {
                    emoji_map
                        .iter()
                        .map(|(emoji, users)| ReactionGroup {
                            emoji: emoji.clone(),
                            count: users.len(),
                            users: users.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let read_by = receipt_map.get(&row.id).cloned().unwrap_or_default();

            let message = message_from_row(&row);
            MessageResponse {
                id: message.id,
                conversation_id: message.conversation_id,
                sender: message.sender,
                content: message.content,
                kind: message.kind,
                tx_ref: message.tx_ref,
                on_chain: message.on_chain,
                reply_to: message.reply_to,
                created_at: message.created_at,
                reactions,
                read_by,
            }
        })
        .collect();

    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnchorMessageRequest {
    pub tx_ref: String,
}

/// Attach a later-confirmed client transaction to a message that was
/// persisted off-chain. The reference is verified first and attaches at most
/// once; a transaction anchors exactly one message.
pub async fn anchor_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AnchorMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = claims.sub.clone();
    require_participant(&state, conversation_id, &sender).await?;

    let row = {
        let db = state.db.clone();
        let mid = message_id.to_string();
        run_blocking(move || db.get_message(&mid)).await?
    };
    let row = match row {
        Some(row) if row.conversation_id == conversation_id.to_string() && row.sender == sender => {
            row
        }
        _ => return Err(ErrorKind::NotFound.into()),
    };
    if row.tx_ref.is_some() {
        return Err(ErrorKind::Conflict.into());
    }

    resolve_anchor(
        &state,
        RelayAction::SendMessage,
        TxPurpose::Message,
        &sender,
        &[],
        Some(&req.tx_ref),
    )
    .await?;

    let attached = {
        let db = state.db.clone();
        let mid = message_id.to_string();
        let tx_ref = req.tx_ref.clone();
        run_blocking(move || db.attach_message_tx_ref(&mid, &tx_ref)).await?
    };
    if !attached {
        // A concurrent attach won; the reference on the row is authoritative.
        return Err(ErrorKind::Conflict.into());
    }

    let row = {
        let db = state.db.clone();
        let mid = message_id.to_string();
        run_blocking(move || db.get_message(&mid)).await?
    };
    let row = row.ok_or(ApiError::Kind(ErrorKind::NotFound))?;
    Ok(Json(message_from_row(&row)))
}

pub(crate) fn message_from_row(row: &MessageRow) -> Message {
    Message {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        conversation_id: row.conversation_id.parse().unwrap_or_else(|e| {
            warn!(
                "Corrupt conversation_id '{}' on message '{}': {}",
                row.conversation_id, row.id, e
            );
            Uuid::default()
        }),
        sender: row.sender.clone(),
        content: row.content.clone(),
        kind: parse_kind(&row.kind),
        tx_ref: row.tx_ref.clone(),
        on_chain: row.on_chain,
        reply_to: row.reply_to.as_ref().and_then(|s| s.parse().ok()),
        created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|e| {
                warn!(
                    "Corrupt created_at '{}' on message '{}': {}",
                    row.created_at, row.id, e
                );
                chrono::DateTime::default()
            }),
    }
}

fn parse_kind(s: &str) -> MessageKind {
    match s {
        "image" => MessageKind::Image,
        "video" => MessageKind::Video,
        "audio" => MessageKind::Audio,
        "file" => MessageKind::File,
        _ => MessageKind::Text,
    }
}
