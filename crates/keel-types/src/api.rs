use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CallKind, ConversationKind, MessageKind};

// -- JWT Claims --

/// JWT claims shared across keel-api (REST middleware) and keel-gateway
/// (WebSocket authentication). Canonical definition lives here in keel-types
/// to eliminate duplication. `sub` is the lowercased wallet address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub display_name: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRequest {
    pub address: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub address: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    /// The other participant's wallet address for a direct conversation.
    pub peer: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    /// False when the pair already had a conversation and it was returned
    /// instead of created.
    pub created: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    pub reply_to: Option<Uuid>,
    /// Anchor this message on the ledger. Defaults to true; the server
    /// degrades to off-chain when no path to the chain exists.
    #[serde(default = "default_anchor")]
    pub anchor: bool,
    /// Transaction already submitted by the client's own wallet. When set the
    /// server verifies it instead of relaying.
    pub tx_ref: Option<String>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

fn default_anchor() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub tx_ref: Option<String>,
    pub on_chain: bool,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<ReactionGroup>,
    /// Addresses that have read this message.
    pub read_by: Vec<String>,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

// -- Read receipts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_ids: Vec<Uuid>,
}

// -- Calls --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitiateCallRequest {
    pub receiver: String,
    pub kind: CallKind,
    #[serde(default = "default_anchor")]
    pub anchor: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclineCallRequest {
    pub decliner_name: String,
}

// -- Status posts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostStatusRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct PostStatusResponse {
    pub on_chain: bool,
    pub tx_ref: Option<String>,
}
