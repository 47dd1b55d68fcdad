use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use keel_types::api::MessageResponse;
use keel_types::events::ReactionAction;
use keel_types::models::Message;

/// Patches buffered for messages that have not arrived yet. Bounded so
/// events for messages the client will never load (another history page)
/// cannot grow the buffer forever.
const PATCH_BUFFER_CAP: usize = 256;
const PATCH_TTL_SECS: i64 = 60;

/// One message with its client-side delivery state.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineMessage {
    pub message: Message,
    /// Still optimistic; flips off when the server-confirmed or
    /// live-delivered copy with the same id arrives.
    pub pending: bool,
    pub read_by: BTreeSet<String>,
    /// emoji -> addresses that reacted with it
    pub reactions: BTreeMap<String, BTreeSet<String>>,
}

impl TimelineMessage {
    fn optimistic(message: Message) -> Self {
        Self {
            message,
            pending: true,
            read_by: BTreeSet::new(),
            reactions: BTreeMap::new(),
        }
    }

    fn confirmed(message: Message) -> Self {
        Self {
            message,
            pending: false,
            read_by: BTreeSet::new(),
            reactions: BTreeMap::new(),
        }
    }
}

/// Live gateway events in patch form, keyed by message id.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Message(Message),
    Reaction {
        message_id: Uuid,
        user: String,
        emoji: String,
        action: ReactionAction,
    },
    Read {
        message_id: Uuid,
        reader: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Patch {
    Reaction {
        user: String,
        emoji: String,
        action: ReactionAction,
    },
    Read {
        reader: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct BufferedPatch {
    target: Uuid,
    patch: Patch,
    seen_at: DateTime<Utc>,
}

/// An ordered, de-duplicated view over everything the client knows.
///
/// Ordering is by message creation time (id as tie-break), not arrival
/// order: live events and paginated history interleave arbitrarily.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Timeline {
    entries: Vec<TimelineMessage>,
    buffered: Vec<BufferedPatch>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[TimelineMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&TimelineMessage> {
        self.position(id).map(|i| &self.entries[i])
    }

    /// Add a locally-optimistic send. No-op if the id is already present.
    pub fn insert_optimistic(&mut self, message: Message) {
        if self.position(message.id).is_some() {
            return;
        }
        self.insert_entry(TimelineMessage::optimistic(message));
    }

    /// Add or upgrade a server-confirmed row. An optimistic entry with the
    /// same id is replaced in place, never duplicated.
    pub fn insert_confirmed(&mut self, confirmed: MessageResponse) {
        let message = response_message(&confirmed);
        let id = message.id;

        match self.position(id) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.message = message;
                entry.pending = false;
                for reader in confirmed.read_by {
                    entry.read_by.insert(reader);
                }
                for group in confirmed.reactions {
                    entry
                        .reactions
                        .entry(group.emoji)
                        .or_default()
                        .extend(group.users);
                }
                // Confirmed timestamps can differ from the optimistic guess.
                self.resort();
            }
            None => {
                let mut entry = TimelineMessage::confirmed(message);
                entry.read_by.extend(confirmed.read_by);
                for group in confirmed.reactions {
                    entry
                        .reactions
                        .entry(group.emoji)
                        .or_default()
                        .extend(group.users);
                }
                self.insert_entry(entry);
            }
        }

        self.drain_buffered(id);
    }

    /// Apply one live gateway event. Re-applying the same event is a no-op.
    pub fn apply_event(&mut self, event: LiveEvent, now: DateTime<Utc>) {
        self.expire_buffered(now);

        match event {
            LiveEvent::Message(message) => {
                let id = message.id;
                match self.position(id) {
                    Some(i) => {
                        // Live copy confirms an optimistic send.
                        self.entries[i].message = message;
                        self.entries[i].pending = false;
                        self.resort();
                    }
                    None => self.insert_entry(TimelineMessage::confirmed(message)),
                }
                self.drain_buffered(id);
            }
            LiveEvent::Reaction {
                message_id,
                user,
                emoji,
                action,
            } => {
                self.apply_or_buffer(message_id, Patch::Reaction { user, emoji, action }, now);
            }
            LiveEvent::Read { message_id, reader } => {
                self.apply_or_buffer(message_id, Patch::Read { reader }, now);
            }
        }
    }

    /// Conversation-level read event: `reader` has displayed everything
    /// currently loaded that they did not send themselves.
    pub fn apply_conversation_read(&mut self, reader: &str) {
        for entry in &mut self.entries {
            if entry.message.sender != reader {
                entry.read_by.insert(reader.to_string());
            }
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn insert_entry(&mut self, entry: TimelineMessage) {
        self.entries.push(entry);
        self.resort();
    }

    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| {
                (a.message.created_at, a.message.id).cmp(&(b.message.created_at, b.message.id))
            });
    }

    fn apply_or_buffer(&mut self, target: Uuid, patch: Patch, now: DateTime<Utc>) {
        match self.position(target) {
            Some(i) => apply_patch(&mut self.entries[i], patch),
            None => {
                self.buffered.push(BufferedPatch {
                    target,
                    patch,
                    seen_at: now,
                });
                if self.buffered.len() > PATCH_BUFFER_CAP {
                    self.buffered.remove(0);
                }
            }
        }
    }

    fn drain_buffered(&mut self, target: Uuid) {
        let Some(i) = self.position(target) else {
            return;
        };
        let mut kept = Vec::with_capacity(self.buffered.len());
        for buffered in self.buffered.drain(..) {
            if buffered.target == target {
                apply_patch(&mut self.entries[i], buffered.patch);
            } else {
                kept.push(buffered);
            }
        }
        self.buffered = kept;
    }

    fn expire_buffered(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::seconds(PATCH_TTL_SECS);
        self.buffered.retain(|b| now - b.seen_at < ttl);
    }
}

fn apply_patch(entry: &mut TimelineMessage, patch: Patch) {
    match patch {
        Patch::Reaction {
            user,
            emoji,
            action,
        } => match action {
            ReactionAction::Added => {
                entry.reactions.entry(emoji).or_default().insert(user);
            }
            ReactionAction::Removed => {
                if let Some(users) = entry.reactions.get_mut(&emoji) {
                    users.remove(&user);
                    if users.is_empty() {
                        entry.reactions.remove(&emoji);
                    }
                }
            }
        },
        Patch::Read { reader } => {
            entry.read_by.insert(reader);
        }
    }
}

fn response_message(r: &MessageResponse) -> Message {
    Message {
        id: r.id,
        conversation_id: r.conversation_id,
        sender: r.sender.clone(),
        content: r.content.clone(),
        kind: r.kind,
        tx_ref: r.tx_ref.clone(),
        on_chain: r.on_chain,
        reply_to: r.reply_to,
        created_at: r.created_at,
    }
}

/// The reconciliation reducer: fold optimistic sends, confirmed history and
/// live events into one timeline. Deterministic given its inputs and `now`;
/// re-merging a merged timeline with empty inputs changes nothing.
pub fn merge(
    local_optimistic: Vec<Message>,
    server_confirmed: Vec<MessageResponse>,
    live_events: Vec<LiveEvent>,
    now: DateTime<Utc>,
) -> Timeline {
    let mut timeline = Timeline::new();
    timeline.extend(local_optimistic, server_confirmed, live_events, now);
    timeline
}

impl Timeline {
    /// Incremental form of [`merge`] over an existing timeline.
    pub fn extend(
        &mut self,
        local_optimistic: Vec<Message>,
        server_confirmed: Vec<MessageResponse>,
        live_events: Vec<LiveEvent>,
        now: DateTime<Utc>,
    ) {
        for message in local_optimistic {
            self.insert_optimistic(message);
        }
        for confirmed in server_confirmed {
            self.insert_confirmed(confirmed);
        }
        for event in live_events {
            self.apply_event(event, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keel_types::api::ReactionGroup;
    use keel_types::models::MessageKind;

    const ALICE: &str = "0xaaa";
    const BOB: &str = "0xbbb";

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn msg_id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn msg(n: u128, sender: &str, secs: i64) -> Message {
        Message {
            id: msg_id(n),
            conversation_id: Uuid::from_u128(1000),
            sender: sender.to_string(),
            content: format!("message {}", n),
            kind: MessageKind::Text,
            tx_ref: None,
            on_chain: false,
            reply_to: None,
            created_at: ts(secs),
        }
    }

    fn confirmed(n: u128, sender: &str, secs: i64) -> MessageResponse {
        let m = msg(n, sender, secs);
        MessageResponse {
            id: m.id,
            conversation_id: m.conversation_id,
            sender: m.sender,
            content: m.content,
            kind: m.kind,
            tx_ref: m.tx_ref,
            on_chain: m.on_chain,
            reply_to: m.reply_to,
            created_at: m.created_at,
            reactions: vec![],
            read_by: vec![],
        }
    }

    #[test]
    fn orders_by_creation_time_not_arrival() {
        let timeline = merge(
            vec![msg(3, ALICE, 30)],
            vec![confirmed(1, BOB, 10)],
            vec![LiveEvent::Message(msg(2, BOB, 20))],
            ts(100),
        );

        let ids: Vec<Uuid> = timeline.messages().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![msg_id(1), msg_id(2), msg_id(3)]);
    }

    #[test]
    fn optimistic_entry_replaced_in_place() {
        let mut timeline = Timeline::new();
        timeline.insert_optimistic(msg(1, ALICE, 10));
        assert!(timeline.messages()[0].pending);

        // Confirmed copy of the same id: replaced, not duplicated.
        let mut c = confirmed(1, ALICE, 10);
        c.on_chain = true;
        c.tx_ref = Some("0xanchor".into());
        timeline.insert_confirmed(c);

        assert_eq!(timeline.len(), 1);
        let entry = &timeline.messages()[0];
        assert!(!entry.pending);
        assert!(entry.message.on_chain);
        assert_eq!(entry.message.tx_ref.as_deref(), Some("0xanchor"));
    }

    #[test]
    fn live_copy_confirms_optimistic_send() {
        let mut timeline = Timeline::new();
        timeline.insert_optimistic(msg(1, ALICE, 10));
        timeline.apply_event(LiveEvent::Message(msg(1, ALICE, 10)), ts(20));

        assert_eq!(timeline.len(), 1);
        assert!(!timeline.messages()[0].pending);
    }

    #[test]
    fn early_patch_buffers_until_message_arrives() {
        let mut timeline = Timeline::new();

        timeline.apply_event(
            LiveEvent::Reaction {
                message_id: msg_id(1),
                user: BOB.into(),
                emoji: "👍".into(),
                action: ReactionAction::Added,
            },
            ts(0),
        );
        timeline.apply_event(
            LiveEvent::Read {
                message_id: msg_id(1),
                reader: BOB.into(),
            },
            ts(1),
        );
        assert!(timeline.is_empty());

        timeline.insert_confirmed(confirmed(1, ALICE, 10));

        let entry = timeline.get(msg_id(1)).unwrap();
        assert!(entry.reactions["👍"].contains(BOB));
        assert!(entry.read_by.contains(BOB));
    }

    #[test]
    fn buffered_patches_expire_after_ttl() {
        let mut timeline = Timeline::new();

        timeline.apply_event(
            LiveEvent::Reaction {
                message_id: msg_id(1),
                user: BOB.into(),
                emoji: "👍".into(),
                action: ReactionAction::Added,
            },
            ts(0),
        );

        // A later event past the TTL evicts the stale patch.
        timeline.apply_event(LiveEvent::Message(msg(2, BOB, 5)), ts(PATCH_TTL_SECS + 1));
        timeline.insert_confirmed(confirmed(1, ALICE, 10));

        assert!(timeline.get(msg_id(1)).unwrap().reactions.is_empty());
    }

    #[test]
    fn patch_buffer_is_bounded() {
        let mut timeline = Timeline::new();

        for n in 0..(PATCH_BUFFER_CAP + 10) {
            timeline.apply_event(
                LiveEvent::Read {
                    message_id: msg_id(10_000 + n as u128),
                    reader: BOB.into(),
                },
                ts(0),
            );
        }
        assert_eq!(timeline.buffered.len(), PATCH_BUFFER_CAP);

        // The oldest targets were evicted.
        timeline.insert_confirmed(confirmed(10_000, ALICE, 10));
        assert!(timeline.get(msg_id(10_000)).unwrap().read_by.is_empty());
    }

    #[test]
    fn reaction_toggle_round_trips() {
        let mut timeline = Timeline::new();
        timeline.insert_confirmed(confirmed(1, ALICE, 10));

        let added = LiveEvent::Reaction {
            message_id: msg_id(1),
            user: BOB.into(),
            emoji: "🔥".into(),
            action: ReactionAction::Added,
        };
        timeline.apply_event(added.clone(), ts(20));
        // Re-applying the same patch is a no-op.
        timeline.apply_event(added, ts(21));
        assert_eq!(timeline.get(msg_id(1)).unwrap().reactions["🔥"].len(), 1);

        timeline.apply_event(
            LiveEvent::Reaction {
                message_id: msg_id(1),
                user: BOB.into(),
                emoji: "🔥".into(),
                action: ReactionAction::Removed,
            },
            ts(22),
        );
        assert!(timeline.get(msg_id(1)).unwrap().reactions.is_empty());
    }

    #[test]
    fn remerge_of_merged_timeline_is_identity() {
        let mut c = confirmed(2, BOB, 20);
        c.reactions = vec![ReactionGroup {
            emoji: "👍".into(),
            count: 1,
            users: vec![ALICE.into()],
        }];
        c.read_by = vec![ALICE.into()];

        let merged = merge(
            vec![msg(1, ALICE, 10)],
            vec![c],
            vec![LiveEvent::Read {
                message_id: msg_id(1),
                reader: BOB.into(),
            }],
            ts(100),
        );

        let mut again = merged.clone();
        again.extend(vec![], vec![], vec![], ts(100));
        assert_eq!(again, merged);
    }

    #[test]
    fn conversation_read_skips_own_messages() {
        let mut timeline = Timeline::new();
        timeline.insert_confirmed(confirmed(1, ALICE, 10));
        timeline.insert_confirmed(confirmed(2, BOB, 20));

        timeline.apply_conversation_read(BOB);

        assert!(timeline.get(msg_id(1)).unwrap().read_by.contains(BOB));
        assert!(timeline.get(msg_id(2)).unwrap().read_by.is_empty());
    }
}
