use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use keel_db::Database;
use keel_db::models::CallRow;
use keel_db::queries::fmt_ts;
use keel_types::error::ErrorKind;
use keel_types::events::ServerEvent;
use keel_types::models::{Call, CallKind, CallStatus};

use crate::hub::{Hub, Room};

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Kind(#[from] ErrorKind),

    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Per-call state machine shared between two independently-connected peers.
///
/// Every transition is a compare-and-swap on the row's current status, so
/// two racing peers never need a cross-process lock: the losing writer sees
/// zero affected rows, re-reads, and either treats the outcome as already
/// achieved or reports the call as ended.
///
/// This component owns only call *status*; the media negotiation payload is
/// relayed opaquely through the conversation room (see `connection`).
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<CallsInner>,
}

struct CallsInner {
    db: Arc<Database>,
    hub: Hub,
    ring_timeout: Duration,
    ring_timers: tokio::sync::Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl CallSessionManager {
    pub fn new(db: Arc<Database>, hub: Hub, ring_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CallsInner {
                db,
                hub,
                ring_timeout,
                ring_timers: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the call row, notify the conversation room and the receiver's
    /// identity room, and arm the ring timeout.
    pub async fn initiate(
        &self,
        conversation_id: Uuid,
        caller: &str,
        receiver: &str,
        kind: CallKind,
        tx_ref: Option<String>,
    ) -> Result<Call, CallError> {
        let call_id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());

        {
            let db = self.inner.db.clone();
            let cid = conversation_id.to_string();
            let id = call_id.to_string();
            let caller = caller.to_string();
            let receiver = receiver.to_string();
            let tx_ref = tx_ref.clone();
            run_blocking(move || {
                db.insert_call(
                    &id,
                    &cid,
                    &caller,
                    &receiver,
                    kind.as_str(),
                    tx_ref.as_deref(),
                    &now,
                )
            })
            .await?;
        }

        let event = ServerEvent::CallInitiated {
            conversation_id,
            call_id,
            call_kind: kind,
            caller: caller.to_string(),
        };
        self.inner
            .hub
            .publish(&Room::Conversation(conversation_id), event.clone())
            .await;
        // Identity-scoped too, so the receiver is reached even with no
        // conversation view open.
        self.inner.hub.publish_to_user(receiver, event).await;

        self.arm_ring_timer(call_id).await;

        info!("{} calling {} in {} ({})", caller, receiver, conversation_id, call_id);
        self.load(call_id).await
    }

    /// Receiver's device acknowledged the incoming call. Losing this CAS is
    /// harmless; accept/decline/timeout are valid from either pre-answer
    /// state.
    pub async fn ring(&self, call_id: Uuid, user: &str) -> Result<(), CallError> {
        let row = self.load(call_id).await?;
        if row.receiver != user {
            return Err(ErrorKind::NotFound.into());
        }

        let db = self.inner.db.clone();
        let id = call_id.to_string();
        run_blocking(move || db.mark_call_ringing(&id)).await?;
        Ok(())
    }

    /// Receiver accepts: pre-answer -> answered, stamps started_at.
    pub async fn accept(&self, call_id: Uuid, user: &str) -> Result<Call, CallError> {
        let row = self.load(call_id).await?;
        if row.receiver != user {
            return Err(ErrorKind::NotFound.into());
        }

        let won = {
            let db = self.inner.db.clone();
            let id = call_id.to_string();
            let now = fmt_ts(Utc::now());
            run_blocking(move || db.answer_call(&id, &now)).await?
        };

        if !won {
            return self.resolve_lost_cas(call_id, CallStatus::Answered).await;
        }

        self.cancel_ring_timer(call_id).await;

        let call = self.load(call_id).await?;
        self.inner
            .hub
            .publish(
                &Room::Conversation(call.conversation_id),
                ServerEvent::CallAnswered {
                    conversation_id: call.conversation_id,
                    call_id,
                    user: user.to_string(),
                },
            )
            .await;

        Ok(call)
    }

    /// Receiver declines: pre-answer -> declined. The decliner's display
    /// label rides along so the caller's client can show why the call ended.
    pub async fn decline(
        &self,
        call_id: Uuid,
        user: &str,
        decliner_name: &str,
    ) -> Result<Call, CallError> {
        let row = self.load(call_id).await?;
        if row.receiver != user {
            return Err(ErrorKind::NotFound.into());
        }

        let won = {
            let db = self.inner.db.clone();
            let id = call_id.to_string();
            let now = fmt_ts(Utc::now());
            run_blocking(move || {
                db.terminate_pending_call(&id, CallStatus::Declined.as_str(), &now)
            })
            .await?
        };

        if !won {
            return self.resolve_lost_cas(call_id, CallStatus::Declined).await;
        }

        self.cancel_ring_timer(call_id).await;

        let call = self.load(call_id).await?;
        self.inner
            .hub
            .publish(
                &Room::Conversation(call.conversation_id),
                ServerEvent::CallDeclined {
                    conversation_id: call.conversation_id,
                    call_id,
                    decliner_name: decliner_name.to_string(),
                },
            )
            .await;

        Ok(call)
    }

    /// Caller hangs up before an answer: pre-answer -> cancelled.
    pub async fn cancel(&self, call_id: Uuid, user: &str) -> Result<Call, CallError> {
        let row = self.load(call_id).await?;
        if row.caller != user {
            return Err(ErrorKind::NotFound.into());
        }

        let won = {
            let db = self.inner.db.clone();
            let id = call_id.to_string();
            let now = fmt_ts(Utc::now());
            run_blocking(move || {
                db.terminate_pending_call(&id, CallStatus::Cancelled.as_str(), &now)
            })
            .await?
        };

        if !won {
            return self.resolve_lost_cas(call_id, CallStatus::Cancelled).await;
        }

        self.cancel_ring_timer(call_id).await;
        self.publish_ended(call_id).await
    }

    /// Either party ends an answered call: answered -> completed, stamps
    /// ended_at and duration.
    pub async fn end(&self, call_id: Uuid, user: &str) -> Result<Call, CallError> {
        let row = self.load(call_id).await?;
        if row.caller != user && row.receiver != user {
            return Err(ErrorKind::NotFound.into());
        }

        let won = {
            let db = self.inner.db.clone();
            let id = call_id.to_string();
            let now = fmt_ts(Utc::now());
            run_blocking(move || db.complete_call(&id, &now)).await?
        };

        if !won {
            return self.resolve_lost_cas(call_id, CallStatus::Completed).await;
        }

        self.publish_ended(call_id).await
    }

    /// Ring timer fired with no peer action: pre-answer -> missed.
    async fn timeout(&self, call_id: Uuid) {
        let won = {
            let db = self.inner.db.clone();
            let id = call_id.to_string();
            let now = fmt_ts(Utc::now());
            match run_blocking(move || {
                db.terminate_pending_call(&id, CallStatus::Missed.as_str(), &now)
            })
            .await
            {
                Ok(won) => won,
                Err(e) => {
                    warn!("ring timeout for {} failed: {}", call_id, e);
                    return;
                }
            }
        };

        self.inner.ring_timers.lock().await.remove(&call_id);

        if won {
            info!("call {} missed (ring timeout)", call_id);
            if let Ok(call) = self.load(call_id).await {
                self.inner
                    .hub
                    .publish(
                        &Room::Conversation(call.conversation_id),
                        ServerEvent::CallEnded {
                            conversation_id: call.conversation_id,
                            call_id,
                        },
                    )
                    .await;
            }
        }
    }

    /// Lost CAS: re-read and treat as a no-op when the row already reflects
    /// the desired outcome, otherwise report the call as ended.
    async fn resolve_lost_cas(
        &self,
        call_id: Uuid,
        desired: CallStatus,
    ) -> Result<Call, CallError> {
        let call = self.load(call_id).await?;
        if call.status == desired {
            Ok(call)
        } else {
            Err(ErrorKind::Conflict.into())
        }
    }

    async fn publish_ended(&self, call_id: Uuid) -> Result<Call, CallError> {
        let call = self.load(call_id).await?;
        self.inner
            .hub
            .publish(
                &Room::Conversation(call.conversation_id),
                ServerEvent::CallEnded {
                    conversation_id: call.conversation_id,
                    call_id,
                },
            )
            .await;
        Ok(call)
    }

    async fn arm_ring_timer(&self, call_id: Uuid) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(manager.inner.ring_timeout).await;
            manager.timeout(call_id).await;
        });
        self.inner.ring_timers.lock().await.insert(call_id, handle);
    }

    /// Any terminal transition cancels the pending ring timeout.
    async fn cancel_ring_timer(&self, call_id: Uuid) {
        if let Some(handle) = self.inner.ring_timers.lock().await.remove(&call_id) {
            handle.abort();
        }
    }

    async fn load(&self, call_id: Uuid) -> Result<Call, CallError> {
        let db = self.inner.db.clone();
        let id = call_id.to_string();
        let row = run_blocking(move || db.get_call(&id)).await?;
        match row {
            Some(row) => Ok(call_from_row(&row)),
            None => Err(ErrorKind::NotFound.into()),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, CallError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(CallError::Store),
        Err(e) => Err(CallError::Store(anyhow::anyhow!(
            "spawn_blocking join error: {}",
            e
        ))),
    }
}

pub fn call_from_row(row: &CallRow) -> Call {
    Call {
        id: parse_uuid(&row.id, "call id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation id"),
        caller: row.caller.clone(),
        receiver: row.receiver.clone(),
        kind: match row.kind.as_str() {
            "video" => CallKind::Video,
            _ => CallKind::Audio,
        },
        status: CallStatus::parse(&row.status).unwrap_or_else(|| {
            warn!("Corrupt call status '{}' on call '{}'", row.status, row.id);
            CallStatus::Completed
        }),
        tx_ref: row.tx_ref.clone(),
        started_at: row.started_at.as_deref().and_then(parse_ts),
        ended_at: row.ended_at.as_deref().and_then(parse_ts),
        duration_secs: row.duration_secs,
        created_at: parse_ts(&row.created_at).unwrap_or_default(),
    }
}

fn parse_uuid(s: &str, what: &str) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, s, e);
        Uuid::default()
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "0xaaa1111111111111111111111111111111111111";
    const BOB: &str = "0xbbb2222222222222222222222222222222222222";

    fn setup(ring_timeout: Duration) -> (CallSessionManager, Hub, Arc<Database>, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (cid, _) = db
            .create_direct_conversation(
                &Uuid::new_v4().to_string(),
                ALICE,
                BOB,
                &fmt_ts(Utc::now()),
            )
            .unwrap();
        let hub = Hub::new(Duration::from_millis(10));
        let manager = CallSessionManager::new(db.clone(), hub.clone(), ring_timeout);
        (manager, hub, db, cid.parse().unwrap())
    }

    #[tokio::test]
    async fn answered_call_runs_to_completion() {
        let (manager, _hub, _db, conversation) = setup(Duration::from_secs(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Initiated);

        manager.ring(call.id, BOB).await.unwrap();

        let answered = manager.accept(call.id, BOB).await.unwrap();
        assert_eq!(answered.status, CallStatus::Answered);
        assert!(answered.started_at.is_some());

        let completed = manager.end(call.id, ALICE).await.unwrap();
        assert_eq!(completed.status, CallStatus::Completed);
        assert!(completed.ended_at.is_some());
        assert!(completed.duration_secs.is_some());
    }

    #[tokio::test]
    async fn receiver_is_notified_on_identity_room() {
        let (manager, hub, _db, conversation) = setup(Duration::from_secs(30));

        // Receiver is connected but has not joined the conversation room.
        let (_conn, mut rx) = hub.connect(BOB).await;
        while rx.try_recv().is_ok() {}

        manager
            .initiate(conversation, ALICE, BOB, CallKind::Video, None)
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        match event {
            ServerEvent::CallInitiated {
                call_kind, caller, ..
            } => {
                assert_eq!(call_kind, CallKind::Video);
                assert_eq!(caller, ALICE);
            }
            other => panic!("expected CallInitiated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_and_decline_race_has_one_winner() {
        let (manager, _hub, db, conversation) = setup(Duration::from_secs(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();

        let m1 = manager.clone();
        let m2 = manager.clone();
        let id = call.id;
        let (accepted, declined) = tokio::join!(
            tokio::spawn(async move { m1.accept(id, BOB).await }),
            tokio::spawn(async move { m2.decline(id, BOB, "Bob").await }),
        );
        let accepted = accepted.unwrap();
        let declined = declined.unwrap();

        // Exactly one transition wins; the row never holds both outcomes.
        assert!(accepted.is_ok() ^ declined.is_ok());
        let row = db.get_call(&id.to_string()).unwrap().unwrap();
        if accepted.is_ok() {
            assert_eq!(row.status, "answered");
        } else {
            assert_eq!(row.status, "declined");
        }

        // The loser surfaced as a conflict, not a silent success.
        let lost = if accepted.is_ok() { declined } else { accepted };
        match lost {
            Err(CallError::Kind(kind)) => assert_eq!(kind, ErrorKind::Conflict),
            other => panic!("expected conflict, got {:?}", other.map(|c| c.status)),
        }
    }

    #[tokio::test]
    async fn repeated_accept_is_a_noop() {
        let (manager, _hub, _db, conversation) = setup(Duration::from_secs(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();

        manager.accept(call.id, BOB).await.unwrap();
        // Second accept lost the CAS but the desired outcome already holds.
        let again = manager.accept(call.id, BOB).await.unwrap();
        assert_eq!(again.status, CallStatus::Answered);
    }

    #[tokio::test]
    async fn unanswered_call_goes_missed_on_ring_timeout() {
        let (manager, hub, db, conversation) = setup(Duration::from_millis(30));

        let (caller_conn, mut rx) = hub.connect(ALICE).await;
        hub.join(caller_conn, Room::Conversation(conversation)).await;
        while rx.try_recv().is_ok() {}

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let row = db.get_call(&call.id.to_string()).unwrap().unwrap();
        assert_eq!(row.status, "missed");
        assert!(row.ended_at.is_some());

        let mut saw_ended = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::CallEnded { .. }) {
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn accept_cancels_ring_timeout() {
        let (manager, _hub, db, conversation) = setup(Duration::from_millis(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();
        manager.accept(call.id, BOB).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let row = db.get_call(&call.id.to_string()).unwrap().unwrap();
        assert_eq!(row.status, "answered");
    }

    #[tokio::test]
    async fn cancelled_call_cannot_be_accepted() {
        let (manager, _hub, _db, conversation) = setup(Duration::from_secs(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();
        manager.cancel(call.id, ALICE).await.unwrap();

        match manager.accept(call.id, BOB).await {
            Err(CallError::Kind(ErrorKind::Conflict)) => {}
            other => panic!("expected conflict, got {:?}", other.map(|c| c.status)),
        }
    }

    #[tokio::test]
    async fn only_the_receiver_may_accept() {
        let (manager, _hub, _db, conversation) = setup(Duration::from_secs(30));

        let call = manager
            .initiate(conversation, ALICE, BOB, CallKind::Audio, None)
            .await
            .unwrap();

        match manager.accept(call.id, ALICE).await {
            Err(CallError::Kind(ErrorKind::NotFound)) => {}
            other => panic!("expected not-found, got {:?}", other.map(|c| c.status)),
        }
    }
}
