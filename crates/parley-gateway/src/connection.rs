use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::GatewayState;
use crate::dispatcher::Dispatch;
use crate::handshake::Session;
use crate::ingest::SubmitMessage;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Subscriptions = Arc<RwLock<HashSet<String>>>;

/// Drive one authenticated session until either side goes away.
///
/// The session subscribes to the bus before it is added to presence, so the
/// first presence broadcast it receives already contains itself.
pub async fn handle_session(socket: WebSocket, state: GatewayState, session: Session) {
    let (mut sender, receiver) = socket.split();

    info!("{} connected to gateway (session {})", session.identity, session.id);

    let broadcast_rx = state.dispatcher.subscribe();

    let ready = GatewayEvent::Ready {
        session_id: session.id,
        identity: session.identity.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    state.presence.add_identity(&session.identity);

    run_session_loop(sender, receiver, broadcast_rx, &state, &session).await;

    state.presence.remove_identity(&session.identity);
    info!("{} disconnected from gateway (session {})", session.identity, session.id);
}

async fn run_session_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut broadcast_rx: tokio::sync::broadcast::Receiver<Arc<Dispatch>>,
    state: &GatewayState,
    session: &Session,
) {
    // Rooms this session receives messages for (shared between send and recv tasks).
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let send_identity = session.identity.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let dispatch = match result {
                        Ok(dispatch) => dispatch,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} lagged behind the bus, skipped {} events", send_identity, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    let wanted = {
                        let subs = send_subscriptions.read().unwrap_or_else(PoisonError::into_inner);
                        is_subscribed(&dispatch, &subs)
                    };
                    if !wanted {
                        continue;
                    }

                    if sender.send(Message::Text(dispatch.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout for {} (missed {} pongs), dropping connection", send_identity, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_state, &recv_session, cmd, &subscriptions).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_session.identity,
                            e,
                            text.chars().take(200).collect::<String>()
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
}

async fn handle_command(state: &GatewayState, session: &Session, cmd: GatewayCommand, subscriptions: &Subscriptions) {
    match cmd {
        GatewayCommand::Subscribe { room_ids } => {
            info!("{} subscribing to {} rooms", session.identity, room_ids.len());
            let mut subs = subscriptions.write().unwrap_or_else(PoisonError::into_inner);
            *subs = room_ids.into_iter().collect();
        }

        GatewayCommand::SendMessage { room_id, sender, content } => {
            let submission = SubmitMessage {
                room_id: room_id.clone(),
                sender,
                content,
            };
            // The broadcast is the only delivery path, the sender included.
            match state.ingestor.submit(&room_id, &session.identity, submission).await {
                Ok(message) => debug!("{} posted to {} at {}", session.identity, room_id, message.timestamp),
                Err(e) => warn!("{} message to {} dropped: {}", session.identity, room_id, e),
            }
        }
    }
}

/// Presence goes to every session; room messages only to sessions
/// subscribed to that room.
fn is_subscribed(dispatch: &Dispatch, subscriptions: &HashSet<String>) -> bool {
    match &dispatch.topic {
        Topic::Presence => true,
        Topic::Room(room_id) => subscriptions.contains(room_id),
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| error!("Failed to serialize event: {}", e))?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parley_types::models::{Identity, Message as ChatMessage};

    use super::*;

    fn dispatch(event: GatewayEvent) -> Dispatch {
        Dispatch {
            topic: event.topic().unwrap(),
            json: serde_json::to_string(&event).unwrap().into(),
            event,
        }
    }

    fn room_message(room_id: &str) -> Dispatch {
        dispatch(GatewayEvent::MessageCreate {
            room_id: room_id.to_string(),
            message: ChatMessage {
                sender: Identity::from("bob"),
                content: "hi".into(),
                timestamp: Utc::now(),
            },
        })
    }

    #[test]
    fn room_messages_need_a_subscription() {
        let subs: HashSet<String> = ["r1".to_string()].into_iter().collect();
        assert!(is_subscribed(&room_message("r1"), &subs));
        assert!(!is_subscribed(&room_message("r2"), &subs));
        assert!(!is_subscribed(&room_message("r1"), &HashSet::new()));
    }

    #[test]
    fn presence_reaches_everyone() {
        let presence = dispatch(GatewayEvent::PresenceUpdate { users: vec![] });
        assert!(is_subscribed(&presence, &HashSet::new()));
    }
}
