/// Database row types — these map directly to SQLite rows.
/// Distinct from keel-types API models to keep the DB layer independent.

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub address: String,
    pub role: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub content: String,
    pub kind: String,
    pub tx_ref: Option<String>,
    pub on_chain: bool,
    pub reply_to: Option<String>,
    pub created_at: String,
}

pub struct ReadReceiptRow {
    pub message_id: String,
    pub reader: String,
    pub read_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub address: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct CallRow {
    pub id: String,
    pub conversation_id: String,
    pub caller: String,
    pub receiver: String,
    pub kind: String,
    pub status: String,
    pub tx_ref: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_secs: Option<i64>,
    pub created_at: String,
}

pub struct TransactionRow {
    pub hash: String,
    pub purpose: String,
    pub sender: String,
    pub verified: bool,
    pub verified_at: Option<String>,
    pub created_at: String,
}
