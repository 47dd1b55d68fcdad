use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Admin,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Wallet address, stored lowercased.
    pub address: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

/// A persisted message. `content` is either plaintext (for `Text`) or an
/// opaque content-id pointing at the external pinning store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    /// Ledger transaction anchoring this message, set once after confirmation.
    pub tx_ref: Option<String>,
    pub on_chain: bool,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Declined,
    Missed,
    Cancelled,
    Completed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "ringing" => Some(Self::Ringing),
            "answered" => Some(Self::Answered),
            "declined" => Some(Self::Declined),
            "missed" => Some(Self::Missed),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Declined | Self::Missed | Self::Cancelled | Self::Completed
        )
    }

    /// Pre-answer statuses from which accept/decline/cancel/timeout are valid.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Initiated | Self::Ringing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub caller: String,
    pub receiver: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub tx_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub reader: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPurpose {
    Message,
    Call,
    Status,
    Payment,
}

impl TxPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Call => "call",
            Self::Status => "status",
            Self::Payment => "payment",
        }
    }
}

/// Ledger transaction bookkeeping. `verified` flips false -> true exactly
/// once and never reverses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub purpose: TxPurpose,
    pub sender: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_round_trips_through_storage_form() {
        let all = [
            CallStatus::Initiated,
            CallStatus::Ringing,
            CallStatus::Answered,
            CallStatus::Declined,
            CallStatus::Missed,
            CallStatus::Cancelled,
            CallStatus::Completed,
        ];
        for status in all {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CallStatus::parse("on-hold"), None);
    }

    #[test]
    fn pending_and_terminal_sets_are_disjoint() {
        assert!(CallStatus::Initiated.is_pending());
        assert!(CallStatus::Ringing.is_pending());
        assert!(!CallStatus::Answered.is_pending());

        for status in [
            CallStatus::Declined,
            CallStatus::Missed,
            CallStatus::Cancelled,
            CallStatus::Completed,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_pending());
        }
        // Answered still transitions to Completed.
        assert!(!CallStatus::Answered.is_terminal());
    }

    #[test]
    fn storage_forms_are_stable() {
        assert_eq!(ConversationKind::Direct.as_str(), "direct");
        assert_eq!(ParticipantRole::Admin.as_str(), "admin");
        assert_eq!(MessageKind::File.as_str(), "file");
        assert_eq!(CallKind::Video.as_str(), "video");
        assert_eq!(TxPurpose::Payment.as_str(), "payment");
    }
}
