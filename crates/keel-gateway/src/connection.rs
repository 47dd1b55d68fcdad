use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use keel_db::Database;
use keel_types::events::{ClientCommand, ServerEvent};

use crate::hub::{Hub, Room};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The JWT was validated at
/// the HTTP upgrade layer, so we go straight to Ready and the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    hub: Hub,
    db: Arc<Database>,
    address: String,
    display_name: String,
) {
    let (mut sender, receiver) = socket.split();

    info!("{} connected to gateway", address);

    let ready = ServerEvent::Ready {
        address: address.clone(),
        display_name: display_name.clone(),
    };
    let Ok(text) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(Message::Text(text.into())).await.is_err() {
        return;
    }

    // Presence snapshot: who is already here, before our own online
    // broadcast goes out.
    for online_addr in hub.online_snapshot().await {
        let event = ServerEvent::UserStatusChange {
            address: online_addr,
            is_online: true,
        };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let (conn_id, mut user_rx) = hub.connect(&address).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward hub events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client.
    let hub_recv = hub.clone();
    let db_recv = db.clone();
    let address_recv = address.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut receiver = receiver;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&hub_recv, &db_recv, conn_id, &address_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            address_recv,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(conn_id).await;
    info!("{} disconnected from gateway", address);
}

async fn handle_command(
    hub: &Hub,
    db: &Arc<Database>,
    conn_id: Uuid,
    address: &str,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::JoinConversation { conversation_id } => {
            // Conversation rooms are scoped to participants.
            if !check_participant(db, conversation_id, address).await {
                warn!(
                    "{} tried to join conversation {} without membership",
                    address, conversation_id
                );
                return;
            }
            info!("{} joins conversation {}", address, conversation_id);
            hub.join(conn_id, Room::Conversation(conversation_id)).await;
        }

        ClientCommand::LeaveConversation { conversation_id } => {
            hub.leave(conn_id, &Room::Conversation(conversation_id))
                .await;
        }

        ClientCommand::CallSignalSend {
            conversation_id,
            payload,
        } => {
            // Opaque relay of the media negotiation payload: never
            // interpreted, only fanned out to the conversation room.
            let room = Room::Conversation(conversation_id);
            if !hub.is_member(conn_id, &room).await {
                warn!(
                    "{} sent call signal for conversation {} without joining",
                    address, conversation_id
                );
                return;
            }
            hub.publish(
                &room,
                ServerEvent::CallSignal {
                    conversation_id,
                    from: address.to_string(),
                    payload,
                },
            )
            .await;
        }
    }
}

async fn check_participant(db: &Arc<Database>, conversation_id: Uuid, address: &str) -> bool {
    let db = db.clone();
    let cid = conversation_id.to_string();
    let addr = address.to_string();
    match tokio::task::spawn_blocking(move || db.is_participant(&cid, &addr)).await {
        Ok(Ok(is_member)) => is_member,
        Ok(Err(e)) => {
            warn!("participant lookup failed: {}", e);
            false
        }
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            false
        }
    }
}
