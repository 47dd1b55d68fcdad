use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CallKind, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { address: String, display_name: String },

    /// A new message was persisted in a conversation the client has joined
    NewMessage { message: Message },

    /// A reaction was toggled on a message
    MessageReaction {
        conversation_id: Uuid,
        message_id: Uuid,
        user: String,
        emoji: String,
        action: ReactionAction,
    },

    /// A participant marked messages in the conversation as read
    MessagesRead {
        conversation_id: Uuid,
        reader: String,
    },

    /// Incoming call — delivered to the conversation room and to the
    /// receiver's identity room so it lands regardless of the open view
    CallInitiated {
        conversation_id: Uuid,
        call_id: Uuid,
        call_kind: CallKind,
        caller: String,
    },

    CallAnswered {
        conversation_id: Uuid,
        call_id: Uuid,
        user: String,
    },

    CallDeclined {
        conversation_id: Uuid,
        call_id: Uuid,
        decliner_name: String,
    },

    CallEnded {
        conversation_id: Uuid,
        call_id: Uuid,
    },

    /// A user came online or went offline
    UserStatusChange { address: String, is_online: bool },

    /// Opaque media-negotiation payload relayed between call peers. The
    /// server never interprets it.
    CallSignal {
        conversation_id: Uuid,
        from: String,
        payload: serde_json::Value,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Start receiving room-scoped events for a conversation
    JoinConversation { conversation_id: Uuid },

    /// Stop receiving room-scoped events for a conversation
    LeaveConversation { conversation_id: Uuid },

    /// Relay a media-negotiation payload to the conversation room
    CallSignalSend {
        conversation_id: Uuid,
        payload: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_tagged_json() {
        let event = ServerEvent::MessagesRead {
            conversation_id: Uuid::nil(),
            reader: "0xabc".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessagesRead");
        assert_eq!(json["data"]["reader"], "0xabc");

        let back: ServerEvent = serde_json::from_value(json).unwrap();
        match back {
            ServerEvent::MessagesRead { reader, .. } => assert_eq!(reader, "0xabc"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn call_signal_payload_is_opaque() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"CallSignalSend","data":{"conversation_id":"00000000-0000-0000-0000-000000000001","payload":{"sdp":"v=0","whatever":[1,2,3]}}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::CallSignalSend { payload, .. } => {
                assert_eq!(payload["whatever"][2], 3);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
