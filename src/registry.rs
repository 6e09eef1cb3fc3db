//! Chat registry: the single source of truth for chat existence and state.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{ConsoleError, Result},
    ledger::MessageDraft,
    types::{
        Chat, ChatPatch, ChatPriority, ChatStatus, ChatSummary, Message, MessageType, SenderKind,
        User,
    },
};

pub const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Default)]
pub struct ChatRegistry {
    pub(crate) chats: HashMap<String, Chat>,
    /// Message id to owning chat id.
    pub(crate) message_index: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewChat {
    pub customer_name: String,
    pub customer_phone: String,
    pub queue_id: String,
    pub initial_message: String,
    pub priority: Option<ChatPriority>,
    pub message_type: MessageType,
    pub whatsapp_message_id: Option<String>,
}

impl NewChat {
    pub fn new(
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        queue_id: impl Into<String>,
        initial_message: impl Into<String>,
    ) -> Self {
        Self {
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            queue_id: queue_id.into(),
            initial_message: initial_message.into(),
            priority: None,
            message_type: MessageType::Text,
            whatsapp_message_id: None,
        }
    }
}

/// Digits-only form of a phone number, used as the inbound de-dup key.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn message_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let head = content.chars().take(PREVIEW_CHARS).collect::<String>();
    format!("{head}...")
}

fn counts_as_unread(chat: &Chat, message: &Message) -> bool {
    if message.message_type == MessageType::Whisper {
        return false;
    }
    match message.sender {
        SenderKind::Customer => true,
        SenderKind::Agent | SenderKind::Supervisor => {
            message.sender_id.as_deref() != chat.assigned_to.as_deref()
        }
        SenderKind::Ai | SenderKind::System => false,
    }
}

/// The one place where a new message changes its chat. The preview is shared
/// by every viewer, so whispers leave it alone.
pub(crate) fn apply_message_effects(chat: &mut Chat, message: &Message) {
    if message.message_type != MessageType::Whisper {
        chat.last_message_preview = message_preview(&message.content);
    }
    chat.last_activity = message.timestamp;
    chat.updated_at = message.timestamp;
    if counts_as_unread(chat, message) {
        chat.unread_count = chat.unread_count.saturating_add(1);
    }
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.get(id)
    }

    pub(crate) fn chat_mut(&mut self, id: &str) -> Result<&mut Chat> {
        self.chats
            .get_mut(id)
            .ok_or_else(|| ConsoleError::not_found("chat", id))
    }

    /// The chat with its full message sequence.
    pub fn get_chat(&self, id: &str) -> Result<Chat> {
        self.chat(id)
            .cloned()
            .ok_or_else(|| ConsoleError::not_found("chat", id))
    }

    pub fn summary(&self, id: &str) -> Result<ChatSummary> {
        self.chat(id)
            .map(ChatSummary::from)
            .ok_or_else(|| ConsoleError::not_found("chat", id))
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        let mut list = self.chats.values().map(ChatSummary::from).collect::<Vec<_>>();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    /// Chats the viewer should see in list views, most recent activity first.
    pub fn list_chats(&self, viewer: &User) -> Vec<ChatSummary> {
        let sees_everything = viewer.is_supervisor_or_admin();
        let mut list = self
            .chats
            .values()
            .filter(|chat| {
                if sees_everything {
                    return matches!(
                        chat.status,
                        ChatStatus::InProgress | ChatStatus::Waiting | ChatStatus::Transferred
                    );
                }
                if chat.assigned_to.as_deref() == Some(viewer.id.as_str()) {
                    return true;
                }
                chat.assigned_to.is_none()
                    && chat.status == ChatStatus::Waiting
                    && viewer.works_queue(&chat.queue_id)
            })
            .map(ChatSummary::from)
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    pub fn queue_summaries(&self, queue_id: &str) -> Vec<ChatSummary> {
        let mut list = self
            .chats
            .values()
            .filter(|chat| chat.queue_id == queue_id)
            .map(ChatSummary::from)
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    /// Most recently updated WAITING/IN_PROGRESS chat for this phone.
    pub fn find_live_by_phone(&self, phone: &str) -> Option<&Chat> {
        let wanted = normalize_phone(phone)?;
        self.chats
            .values()
            .filter(|chat| chat.status.is_live())
            .filter(|chat| normalize_phone(&chat.customer_phone).as_deref() == Some(wanted.as_str()))
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at))
    }

    pub fn create_chat(&mut self, new_chat: NewChat) -> Result<Chat> {
        let Some(phone_key) = normalize_phone(&new_chat.customer_phone) else {
            return Err(ConsoleError::validation("customerPhone is required"));
        };
        let initial = new_chat.initial_message.trim();
        if initial.is_empty() {
            return Err(ConsoleError::validation("initialMessage is required"));
        }
        let customer_name = match new_chat.customer_name.trim() {
            "" => new_chat.customer_phone.trim().to_string(),
            name => name.to_string(),
        };

        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            whatsapp_id: format!("whatsapp:{phone_key}"),
            customer_name: customer_name.clone(),
            customer_phone: new_chat.customer_phone.trim().to_string(),
            queue_id: new_chat.queue_id,
            assigned_to: None,
            status: ChatStatus::Waiting,
            priority: new_chat.priority.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            last_activity: now,
            unread_count: 0,
            last_message_preview: String::new(),
            ai_analysis: None,
            messages: Vec::new(),
        };
        let chat_id = chat.id.clone();
        self.chats.insert(chat_id.clone(), chat);

        let mut draft = MessageDraft::customer(initial, customer_name);
        draft.message_type = new_chat.message_type;
        draft.whatsapp_message_id = new_chat.whatsapp_message_id;
        self.append(&chat_id, draft)?;

        tracing::info!(chat_id = %chat_id, queue_id = %self.chats[&chat_id].queue_id, "chat created");
        self.get_chat(&chat_id)
    }

    /// Applies an explicit patch. `viewer_id` is the acting user, if any.
    pub fn update_chat_fields(
        &mut self,
        id: &str,
        patch: ChatPatch,
        viewer_id: Option<&str>,
    ) -> Result<Chat> {
        if let Some(name) = patch.customer_name.as_deref() {
            if name.trim().is_empty() {
                return Err(ConsoleError::validation("customerName cannot be empty"));
            }
        }
        if let Some(queue_id) = patch.queue_id.as_deref() {
            if queue_id.trim().is_empty() {
                return Err(ConsoleError::validation("queueId cannot be empty"));
            }
        }

        let chat = self.chat_mut(id)?;
        let status_before = chat.status;

        if let Some(status) = patch.status {
            chat.status = status;
            if !status.is_live() {
                chat.unread_count = 0;
            }
        }
        if let Some(priority) = patch.priority {
            chat.priority = priority;
        }
        if let Some(assigned_to) = patch.assigned_to {
            if let Some(assignee) = assigned_to.as_deref() {
                let self_claim =
                    viewer_id == Some(assignee) && status_before == ChatStatus::Waiting;
                if !self_claim {
                    chat.unread_count = 0;
                }
            }
            chat.assigned_to = assigned_to;
        }
        if let Some(queue_id) = patch.queue_id {
            chat.queue_id = queue_id.trim().to_string();
        }
        if let Some(name) = patch.customer_name {
            chat.customer_name = name.trim().to_string();
        }
        if let Some(analysis) = patch.ai_analysis {
            chat.ai_analysis = Some(analysis);
        }
        chat.updated_at = Utc::now();

        Ok(chat.clone())
    }

    /// Sets or clears the assignee, moving the status along with it.
    /// `viewer_id` is the acting user, so a self-claim keeps the unread count.
    pub fn assign(
        &mut self,
        id: &str,
        agent_id: Option<String>,
        viewer_id: Option<&str>,
    ) -> Result<Chat> {
        let current = self
            .chat(id)
            .ok_or_else(|| ConsoleError::not_found("chat", id))?
            .status;
        let status = match (&agent_id, current) {
            (Some(_), ChatStatus::Waiting | ChatStatus::Transferred) => Some(ChatStatus::InProgress),
            (None, ChatStatus::InProgress) => Some(ChatStatus::Waiting),
            _ => None,
        };
        let patch = ChatPatch {
            status,
            assigned_to: Some(agent_id),
            ..Default::default()
        };
        self.update_chat_fields(id, patch, viewer_id)
    }

    /// Zeroes the unread counter, but only for the assignee.
    pub fn mark_read(&mut self, id: &str, viewer_id: &str) -> Result<Chat> {
        let chat = self.chat_mut(id)?;
        if chat.assigned_to.as_deref() == Some(viewer_id) {
            chat.unread_count = 0;
        }
        Ok(chat.clone())
    }

    pub fn transfer(&mut self, id: &str, queue_id: &str) -> Result<Chat> {
        let patch = ChatPatch {
            status: Some(ChatStatus::Transferred),
            assigned_to: Some(None),
            queue_id: Some(queue_id.to_string()),
            ..Default::default()
        };
        self.update_chat_fields(id, patch, None)
    }
}
