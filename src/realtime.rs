//! WebSocket fan-out to connected console users.

use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc},
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    ledger::visible_to,
    types::{AppState, Chat, ChatSummary, Message, User, WsQuery},
};

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    /// Console user behind each connection, as resolved at join.
    pub viewers: HashMap<usize, User>,
}

impl RealtimeState {
    pub fn join(&mut self, client_id: usize, user: User, tx: mpsc::UnboundedSender<String>) {
        self.clients.insert(client_id, tx);
        self.viewers.insert(client_id, user);
    }

    pub fn leave(&mut self, client_id: usize) {
        self.clients.remove(&client_id);
        self.viewers.remove(&client_id);
    }

    pub fn all_clients(&self) -> Vec<usize> {
        self.viewers.keys().copied().collect()
    }

    /// Connections whose user may see `message`.
    pub fn recipients_for(&self, message: &Message, chat: &Chat) -> Vec<usize> {
        self.viewers
            .iter()
            .filter(|(_, viewer)| visible_to(message, viewer, chat))
            .map(|(client_id, _)| *client_id)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        if sender.send(payload).is_err() {
            tracing::warn!(client_id, "dropped event for closed client");
        }
    }
}

pub async fn emit_to_clients<T: Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).map(|tx| (*id, tx.clone())))
            .collect::<Vec<_>>()
    };

    for (client_id, sender) in senders {
        if sender.send(payload.clone()).is_err() {
            tracing::warn!(client_id, event, "dropped event for closed client");
        }
    }
}

pub async fn emit_chat_updated(state: &Arc<AppState>, chat: &Chat) {
    let clients = state.realtime.lock().await.all_clients();
    emit_to_clients(state, &clients, "chat:updated", ChatSummary::from(chat)).await;
}

/// Sends a new message only to the connections allowed to see it.
pub async fn emit_message(state: &Arc<AppState>, message: &Message, chat: &Chat) {
    let clients = state.realtime.lock().await.recipients_for(message, chat);
    emit_to_clients(state, &clients, "message:new", message).await;
}

/// Upgrades `GET /ws?userId=...`. Unknown users are refused before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    let user = state.store.user(&query.user_id).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user))
        .into_response())
}

async fn send_chat_list(state: &Arc<AppState>, client_id: usize, user_id: &str) {
    match state.store.list_chats(user_id).await {
        Ok(chats) => emit_to_client(state, client_id, "chats:list", chats).await,
        Err(err) => {
            emit_to_client(state, client_id, "error", json!({ "message": err.to_string() })).await
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: User) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let user_id = user.id.clone();

    state.realtime.lock().await.join(client_id, user, tx);
    tracing::debug!(client_id, user_id = %user_id, "console client joined");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    send_chat_list(&state, client_id, &user_id).await;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "chats:refresh" => send_chat_list(&state, client_id, &user_id).await,
            "ping" => emit_to_client(&state, client_id, "pong", json!({})).await,
            other => tracing::debug!(client_id, event = other, "ignoring client event"),
        }
    }

    state.realtime.lock().await.leave(client_id);
    tracing::debug!(client_id, "console client left");
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::types::{ChatPriority, ChatStatus, MessageType, SenderKind, UserType};

    fn user(id: &str, user_type: UserType) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            email: format!("{id}@example.com"),
            user_type,
            avatar_url: None,
            role_id: None,
            queue_ids: Vec::new(),
            system_prompt: None,
            model_name: None,
        }
    }

    fn chat_assigned_to(agent: &str) -> Chat {
        let now = Utc::now();
        Chat {
            id: "c1".to_string(),
            whatsapp_id: "whatsapp:1".to_string(),
            customer_name: "Carla".to_string(),
            customer_phone: "1".to_string(),
            queue_id: "q1".to_string(),
            assigned_to: Some(agent.to_string()),
            status: ChatStatus::InProgress,
            priority: ChatPriority::Medium,
            created_at: now,
            updated_at: now,
            last_activity: now,
            unread_count: 0,
            last_message_preview: String::new(),
            ai_analysis: None,
            messages: Vec::new(),
        }
    }

    fn whisper_from(sender: &str) -> Message {
        Message {
            id: "m1".to_string(),
            chat_id: "c1".to_string(),
            content: "heads up".to_string(),
            message_type: MessageType::Whisper,
            sender: SenderKind::Agent,
            sender_id: Some(sender.to_string()),
            sender_name: None,
            timestamp: Utc::now(),
            is_from_customer: false,
            whatsapp_message_id: None,
            sentiment_score: None,
            target_agent_id: None,
        }
    }

    #[test]
    fn whispers_reach_only_permitted_connections() {
        let mut rt = RealtimeState::default();
        let people = [
            ("owner", UserType::AgentHuman),
            ("author", UserType::AgentHuman),
            ("stranger", UserType::AgentHuman),
            ("sup", UserType::Supervisor),
        ];
        for (i, (id, user_type)) in people.iter().enumerate() {
            let (tx, _rx) = mpsc::unbounded_channel();
            rt.join(i + 1, user(id, *user_type), tx);
        }
        let mut recipients = rt.recipients_for(&whisper_from("author"), &chat_assigned_to("owner"));
        recipients.sort_unstable();
        assert_eq!(recipients, vec![1, 2, 4]);

        rt.leave(4);
        assert_eq!(rt.all_clients().len(), 3);
    }

    #[tokio::test]
    async fn closed_client_does_not_stop_fan_out() {
        let state = crate::app::build_state(crate::config::AppConfig::default(), None);
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        drop(gone_rx);
        {
            let mut rt = state.realtime.lock().await;
            rt.join(1, user("gone", UserType::AgentHuman), gone_tx);
            rt.join(2, user("live", UserType::AgentHuman), live_tx);
        }
        emit_to_clients(&state, &[1, 2], "pong", json!({})).await;
        let payload = live_rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["event"], "pong");
    }

    #[test]
    fn event_payload_wraps_event_and_data() {
        let payload = event_payload("pong", json!({ "ok": true })).unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["event"], "pong");
        assert_eq!(parsed["data"]["ok"], true);
    }
}
