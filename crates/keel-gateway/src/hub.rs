use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use keel_types::events::ServerEvent;

/// A broadcast group. One room per conversation (scoped to participants who
/// joined it) and one per user identity, for events that must reach a user
/// regardless of which conversation view is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Conversation(Uuid),
    User(String),
}

struct Session {
    address: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// The realtime hub: an explicit session registry keyed by connection id,
/// with room membership as a separate index. Delivery is at-least-once;
/// ordering holds only within one room as seen by one subscriber.
///
/// The hub never persists. Persistence must already have happened before
/// `publish` is invoked, so a reconnecting client that re-fetches history
/// never sees a live event the store does not know.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sessions: RwLock<HashMap<Uuid, Session>>,
    rooms: RwLock<HashMap<Room, HashSet<Uuid>>>,
    /// address -> live connection count
    online: RwLock<HashMap<String, usize>>,
    presence_grace: Duration,
}

impl Hub {
    /// `presence_grace` delays the offline broadcast after the last
    /// connection drops, absorbing transient reconnects.
    pub fn new(presence_grace: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                online: RwLock::new(HashMap::new()),
                presence_grace,
            }),
        }
    }

    /// Register an authenticated connection. The connection implicitly joins
    /// its identity room. Returns (conn_id, event receiver).
    pub async fn connect(&self, address: &str) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.sessions.write().await.insert(
            conn_id,
            Session {
                address: address.to_string(),
                tx,
            },
        );
        self.join(conn_id, Room::User(address.to_string())).await;

        let went_online = {
            let mut online = self.inner.online.write().await;
            let count = online.entry(address.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if went_online {
            self.broadcast(ServerEvent::UserStatusChange {
                address: address.to_string(),
                is_online: true,
            })
            .await;
        }

        (conn_id, rx)
    }

    /// Drop a connection and its room memberships. If this was the user's
    /// last connection, the offline broadcast fires after the grace delay —
    /// unless a new connection shows up in the meantime.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let Some(session) = self.inner.sessions.write().await.remove(&conn_id) else {
            return;
        };

        {
            let mut rooms = self.inner.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(&conn_id);
                !members.is_empty()
            });
        }

        let went_offline = {
            let mut online = self.inner.online.write().await;
            match online.get_mut(&session.address) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    online.remove(&session.address);
                    true
                }
                None => false,
            }
        };

        if went_offline {
            let hub = self.clone();
            let address = session.address;
            tokio::spawn(async move {
                tokio::time::sleep(hub.inner.presence_grace).await;
                if !hub.is_online(&address).await {
                    hub.broadcast(ServerEvent::UserStatusChange {
                        address,
                        is_online: false,
                    })
                    .await;
                }
            });
        }
    }

    pub async fn join(&self, conn_id: Uuid, room: Room) {
        if !self.inner.sessions.read().await.contains_key(&conn_id) {
            return;
        }
        debug!("conn {} joins {:?}", conn_id, room);
        self.inner
            .rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(conn_id);
    }

    pub async fn leave(&self, conn_id: Uuid, room: &Room) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub async fn is_member(&self, conn_id: Uuid, room: &Room) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Fan an event out to the room's current members.
    pub async fn publish(&self, room: &Room, event: ServerEvent) {
        let members = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(room) {
                Some(members) => members.clone(),
                None => return,
            }
        };

        let sessions = self.inner.sessions.read().await;
        for conn_id in members {
            if let Some(session) = sessions.get(&conn_id) {
                let _ = session.tx.send(event.clone());
            }
        }
    }

    /// Deliver to every connection of one user, whatever rooms it joined.
    pub async fn publish_to_user(&self, address: &str, event: ServerEvent) {
        self.publish(&Room::User(address.to_string()), event).await;
    }

    /// Deliver to every connected client.
    pub async fn broadcast(&self, event: ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        for session in sessions.values() {
            let _ = session.tx.send(event.clone());
        }
    }

    pub async fn is_online(&self, address: &str) -> bool {
        self.inner.online.read().await.contains_key(address)
    }

    /// Addresses currently online, for the snapshot a fresh connection gets.
    pub async fn online_snapshot(&self) -> Vec<String> {
        self.inner.online.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn publish_is_scoped_to_room_members() {
        let hub = Hub::new(Duration::from_millis(10));
        let conversation = Room::Conversation(Uuid::new_v4());

        let (a_conn, mut a_rx) = hub.connect("0xaaa").await;
        let (_b_conn, mut b_rx) = hub.connect("0xbbb").await;

        hub.join(a_conn, conversation.clone()).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.publish(
            &conversation,
            ServerEvent::MessagesRead {
                conversation_id: Uuid::nil(),
                reader: "0xaaa".into(),
            },
        )
        .await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn identity_room_reaches_user_without_conversation_join() {
        let hub = Hub::new(Duration::from_millis(10));
        let (_conn, mut rx) = hub.connect("0xbbb").await;
        drain(&mut rx);

        hub.publish_to_user(
            "0xbbb",
            ServerEvent::CallInitiated {
                conversation_id: Uuid::new_v4(),
                call_id: Uuid::new_v4(),
                call_kind: keel_types::models::CallKind::Audio,
                caller: "0xaaa".into(),
            },
        )
        .await;

        let events = drain(&mut rx);
        assert!(matches!(events[..], [ServerEvent::CallInitiated { .. }]));
    }

    #[tokio::test]
    async fn offline_broadcast_waits_for_grace_delay() {
        let hub = Hub::new(Duration::from_millis(20));
        let (_a_conn, mut a_rx) = hub.connect("0xaaa").await;
        let (b_conn, _b_rx) = hub.connect("0xbbb").await;
        drain(&mut a_rx);

        hub.disconnect(b_conn).await;
        // Not yet: the grace window is still open.
        assert!(drain(&mut a_rx).is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let events = drain(&mut a_rx);
        assert!(matches!(
            events[..],
            [ServerEvent::UserStatusChange {
                is_online: false,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn reconnect_within_grace_suppresses_offline() {
        let hub = Hub::new(Duration::from_millis(40));
        let (_a_conn, mut a_rx) = hub.connect("0xaaa").await;
        let (b_conn, _b_rx) = hub.connect("0xbbb").await;
        drain(&mut a_rx);

        hub.disconnect(b_conn).await;
        let (_b2_conn, _b2_rx) = hub.connect("0xbbb").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The reconnect produced a fresh online event but no offline one.
        let offline_seen = drain(&mut a_rx).iter().any(|e| {
            matches!(
                e,
                ServerEvent::UserStatusChange {
                    is_online: false,
                    ..
                }
            )
        });
        assert!(!offline_seen);
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let hub = Hub::new(Duration::from_millis(10));
        let conversation = Room::Conversation(Uuid::new_v4());

        let (conn, mut rx) = hub.connect("0xaaa").await;
        hub.join(conn, conversation.clone()).await;
        hub.leave(conn, &conversation).await;
        drain(&mut rx);

        hub.publish(
            &conversation,
            ServerEvent::MessagesRead {
                conversation_id: Uuid::nil(),
                reader: "0xbbb".into(),
            },
        )
        .await;

        assert!(drain(&mut rx).is_empty());
    }
}
