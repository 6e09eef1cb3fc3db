//! Message ledger: append-only history per chat, plus the in-place
//! sentiment patch and the whisper visibility rule.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{ConsoleError, Result},
    registry::{apply_message_effects, ChatRegistry},
    types::{Chat, Message, MessageType, SenderKind, User, UserType},
};

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub content: String,
    pub message_type: MessageType,
    pub sender: SenderKind,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub target_agent_id: Option<String>,
}

impl MessageDraft {
    pub fn new(sender: SenderKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            sender,
            sender_id: None,
            sender_name: None,
            whatsapp_message_id: None,
            target_agent_id: None,
        }
    }

    pub fn customer(content: impl Into<String>, customer_name: impl Into<String>) -> Self {
        let mut draft = Self::new(SenderKind::Customer, content);
        draft.sender_name = Some(customer_name.into());
        draft
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SenderKind::System, content)
    }

    /// A console user's message; the sender kind follows the user type.
    pub fn from_user(user: &User, content: impl Into<String>) -> Self {
        let sender = match user.user_type {
            UserType::Admin | UserType::Supervisor => SenderKind::Supervisor,
            UserType::AgentAi => SenderKind::Ai,
            UserType::AgentHuman | UserType::Viewer => SenderKind::Agent,
        };
        let mut draft = Self::new(sender, content);
        draft.sender_id = Some(user.id.clone());
        draft.sender_name = Some(user.name.clone());
        draft
    }

    pub fn whisper(mut self, target_agent_id: Option<String>) -> Self {
        self.message_type = MessageType::Whisper;
        self.target_agent_id = target_agent_id;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(ConsoleError::validation("message content is required"));
        }
        if self.message_type == MessageType::Whisper && self.sender == SenderKind::Customer {
            return Err(ConsoleError::validation("customers cannot send whispers"));
        }
        if self.message_type != MessageType::Whisper && self.target_agent_id.is_some() {
            return Err(ConsoleError::validation(
                "targetAgentId is only valid on whispers",
            ));
        }
        Ok(())
    }
}

impl ChatRegistry {
    /// Appends a message and applies its effects to the owning chat.
    ///
    /// A draft carrying a WhatsApp message id the chat has already seen is a
    /// redelivery: the stored message is returned and nothing changes.
    pub fn append(&mut self, chat_id: &str, draft: MessageDraft) -> Result<Message> {
        draft.validate()?;
        let chat = self.chat_mut(chat_id)?;

        if let Some(external_id) = draft.whatsapp_message_id.as_deref() {
            if let Some(existing) = chat
                .messages
                .iter()
                .find(|m| m.whatsapp_message_id.as_deref() == Some(external_id))
            {
                tracing::debug!(chat_id, external_id, "duplicate inbound delivery ignored");
                return Ok(existing.clone());
            }
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            content: draft.content.trim().to_string(),
            message_type: draft.message_type,
            sender: draft.sender,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            timestamp: Utc::now(),
            is_from_customer: draft.sender == SenderKind::Customer,
            whatsapp_message_id: draft.whatsapp_message_id,
            sentiment_score: None,
            target_agent_id: draft.target_agent_id,
        };

        apply_message_effects(chat, &message);
        chat.messages.push(message.clone());
        self.message_index
            .insert(message.id.clone(), chat_id.to_string());
        Ok(message)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        let chat_id = self.message_index.get(message_id)?;
        self.chats
            .get(chat_id)?
            .messages
            .iter()
            .find(|m| m.id == message_id)
    }

    /// Fills in the sentiment of a message once scoring completes.
    pub fn patch_sentiment(&mut self, message_id: &str, score: f64) -> Result<Message> {
        if !(-1.0..=1.0).contains(&score) {
            return Err(ConsoleError::validation(
                "sentiment score must lie within [-1, 1]",
            ));
        }
        let not_found = || ConsoleError::not_found("message", message_id);
        let chat_id = self.message_index.get(message_id).ok_or_else(not_found)?;
        let message = self
            .chats
            .get_mut(chat_id)
            .and_then(|chat| chat.messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(not_found)?;
        message.sentiment_score = Some(score);
        Ok(message.clone())
    }
}

/// Whether `viewer` may see `message` inside `chat` in the console.
pub fn visible_to(message: &Message, viewer: &User, chat: &Chat) -> bool {
    if message.message_type != MessageType::Whisper {
        return true;
    }
    if viewer.is_supervisor_or_admin() {
        return true;
    }
    let viewer_id = Some(viewer.id.as_str());
    message.sender_id.as_deref() == viewer_id
        || message.target_agent_id.as_deref() == viewer_id
        || chat.assigned_to.as_deref() == viewer_id
}

/// Whether `message` may ever reach the customer channel.
pub fn customer_visible(message: &Message) -> bool {
    message.message_type != MessageType::Whisper
        && matches!(
            message.sender,
            SenderKind::Customer | SenderKind::Agent | SenderKind::Supervisor | SenderKind::Ai
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewChat;

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

    fn registry_with_chat() -> (ChatRegistry, String) {
        let mut registry = ChatRegistry::new();
        let chat = registry
            .create_chat(NewChat::new("Ana", "+1555", "q1", "hi"))
            .unwrap();
        (registry, chat.id)
    }

    #[test]
    fn preview_and_activity_follow_the_latest_message() {
        let (mut registry, id) = registry_with_chat();
        let contents = [
            "second".to_string(),
            "x".repeat(80),
            "a reply that is exactly fifty characters long....!".to_string(),
        ];
        for content in &contents {
            let message = registry
                .append(&id, MessageDraft::customer(content.clone(), "Ana"))
                .unwrap();
            let chat = registry.chat(&id).unwrap();
            assert_eq!(chat.last_activity, message.timestamp);
            let preview = chat.last_message_preview.trim_end_matches("...");
            assert!(content.starts_with(preview));
            assert!(preview.chars().count() <= 50);
        }
    }

    #[test]
    fn unread_counts_customer_and_foreign_agent_messages() {
        let (mut registry, id) = registry_with_chat();
        registry.assign(&id, Some("ana".to_string()), None).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 0);

        let ana = user("ana", UserType::AgentHuman);
        let bob = user("bob", UserType::AgentHuman);
        let sup = user("sup", UserType::Supervisor);

        registry.append(&id, MessageDraft::from_user(&ana, "on it")).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 0);

        registry.append(&id, MessageDraft::from_user(&bob, "jumping in")).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 1);

        registry.append(&id, MessageDraft::from_user(&sup, "escalating")).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 2);

        registry
            .append(&id, MessageDraft::from_user(&bob, "psst").whisper(None))
            .unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 2);

        registry.append(&id, MessageDraft::system("note")).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 2);

        registry.append(&id, MessageDraft::customer("hello?", "Ana")).unwrap();
        assert_eq!(registry.chat(&id).unwrap().unread_count, 3);

        assert_eq!(registry.mark_read(&id, "ana").unwrap().unread_count, 0);
    }

    #[test]
    fn append_validates_drafts_and_chat() {
        let (mut registry, id) = registry_with_chat();
        assert!(matches!(
            registry.append(&id, MessageDraft::customer("  ", "Ana")),
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            registry.append(&id, MessageDraft::customer("hey", "Ana").whisper(None)),
            Err(ConsoleError::Validation(_))
        ));
        let mut targeted = MessageDraft::from_user(&user("ana", UserType::AgentHuman), "x");
        targeted.target_agent_id = Some("bob".to_string());
        assert!(matches!(
            registry.append(&id, targeted),
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            registry.append("missing", MessageDraft::customer("hey", "Ana")),
            Err(ConsoleError::NotFound { entity: "chat", .. })
        ));
    }

    #[test]
    fn redelivered_whatsapp_message_is_ignored() {
        let (mut registry, id) = registry_with_chat();
        let mut draft = MessageDraft::customer("hello", "Ana");
        draft.whatsapp_message_id = Some("wamid.1".to_string());
        let first = registry.append(&id, draft.clone()).unwrap();
        let second = registry.append(&id, draft).unwrap();
        assert_eq!(first.id, second.id);
        let chat = registry.chat(&id).unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.unread_count, 2);
    }

    #[test]
    fn sentiment_patch_checks_range_and_existence() {
        let (mut registry, id) = registry_with_chat();
        let message_id = registry.chat(&id).unwrap().messages[0].id.clone();
        let patched = registry.patch_sentiment(&message_id, -0.4).unwrap();
        assert_eq!(patched.sentiment_score, Some(-0.4));
        assert_eq!(
            registry.message(&message_id).unwrap().sentiment_score,
            Some(-0.4)
        );
        assert!(matches!(
            registry.patch_sentiment(&message_id, 1.5),
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            registry.patch_sentiment("nope", 0.1),
            Err(ConsoleError::NotFound { entity: "message", .. })
        ));
    }

    #[test]
    fn whisper_visibility_rule() {
        let (mut registry, id) = registry_with_chat();
        registry.assign(&id, Some("owner".to_string()), None).unwrap();
        let author = user("author", UserType::AgentHuman);
        let whisper = registry
            .append(
                &id,
                MessageDraft::from_user(&author, "careful").whisper(Some("target".to_string())),
            )
            .unwrap();
        let chat = registry.get_chat(&id).unwrap();

        assert!(visible_to(&whisper, &user("target", UserType::AgentHuman), &chat));
        assert!(visible_to(&whisper, &author, &chat));
        assert!(visible_to(&whisper, &user("owner", UserType::AgentHuman), &chat));
        assert!(visible_to(&whisper, &user("sup", UserType::Supervisor), &chat));
        assert!(visible_to(&whisper, &user("root", UserType::Admin), &chat));
        assert!(!visible_to(&whisper, &user("other", UserType::AgentHuman), &chat));
        assert!(!visible_to(&whisper, &user("bot", UserType::AgentAi), &chat));
        assert!(!customer_visible(&whisper));

        let plain = &chat.messages[0];
        assert!(visible_to(plain, &user("other", UserType::AgentHuman), &chat));
        assert!(customer_visible(plain));
    }
}
