//! The console store: one object owning the directory and the chat registry,
//! built at start-up and shared by reference with every handler.
//!
//! Each registry sits behind its own lock. Operations that need both read the
//! directory first, release it, and only then take the chat lock.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    directory::Directory,
    error::{ConsoleError, Result},
    kanban::{self, KanbanLane},
    ledger::{customer_visible, visible_to, MessageDraft},
    registry::{ChatRegistry, NewChat},
    types::{
        AiAnalysis, Chat, ChatPatch, ChatSummary, Message, MessageType, Permission,
        SendMessageBody, User, UserType,
    },
};

#[derive(Debug, Default)]
pub struct ConsoleStore {
    directory: RwLock<Directory>,
    chats: RwLock<ChatRegistry>,
}

impl ConsoleStore {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory: RwLock::new(directory),
            chats: RwLock::new(ChatRegistry::new()),
        }
    }

    pub fn seeded(pre_service_queue_name: &str) -> Self {
        Self::new(Directory::seeded(pre_service_queue_name))
    }

    pub async fn directory(&self) -> RwLockReadGuard<'_, Directory> {
        self.directory.read().await
    }

    pub async fn directory_mut(&self) -> RwLockWriteGuard<'_, Directory> {
        self.directory.write().await
    }

    pub async fn chats(&self) -> RwLockReadGuard<'_, ChatRegistry> {
        self.chats.read().await
    }

    pub async fn chats_mut(&self) -> RwLockWriteGuard<'_, ChatRegistry> {
        self.chats.write().await
    }

    pub async fn user(&self, id: &str) -> Result<User> {
        self.directory.read().await.require_user(id).cloned()
    }

    pub async fn has_permission(&self, user: &User, permission: Permission) -> bool {
        self.directory.read().await.has_permission(user, permission)
    }

    pub async fn list_chats(&self, viewer_id: &str) -> Result<Vec<ChatSummary>> {
        let viewer = self.user(viewer_id).await?;
        Ok(self.chats.read().await.list_chats(&viewer))
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        self.chats.read().await.get_chat(chat_id)
    }

    pub async fn summary(&self, chat_id: &str) -> Result<ChatSummary> {
        self.chats.read().await.summary(chat_id)
    }

    /// The chat with only the messages `viewer` is allowed to see.
    pub async fn chat_for_viewer(&self, chat_id: &str, viewer: &User) -> Result<Chat> {
        let mut chat = self.get_chat(chat_id).await?;
        let visible = chat
            .messages
            .iter()
            .filter(|m| visible_to(m, viewer, &chat))
            .cloned()
            .collect::<Vec<_>>();
        chat.messages = visible;
        Ok(chat)
    }

    /// What the customer channel would show for this chat.
    pub async fn customer_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let chats = self.chats.read().await;
        let chat = chats
            .chat(chat_id)
            .ok_or_else(|| ConsoleError::not_found("chat", chat_id))?;
        Ok(chat
            .messages
            .iter()
            .filter(|m| customer_visible(m))
            .cloned()
            .collect())
    }

    /// Console-initiated chat. The queue must exist and the phone must not
    /// already have a live chat.
    pub async fn create_chat(&self, new_chat: NewChat) -> Result<Chat> {
        self.directory
            .read()
            .await
            .require_queue(&new_chat.queue_id)?;
        let mut chats = self.chats.write().await;
        if let Some(live) = chats.find_live_by_phone(&new_chat.customer_phone) {
            return Err(ConsoleError::Validation(format!(
                "customer already has an open chat: {}",
                live.id
            )));
        }
        chats.create_chat(new_chat)
    }

    pub async fn update_chat_fields(
        &self,
        chat_id: &str,
        patch: ChatPatch,
        viewer_id: Option<&str>,
    ) -> Result<Chat> {
        {
            let directory = self.directory.read().await;
            if let Some(queue_id) = patch.queue_id.as_deref() {
                directory.require_queue(queue_id.trim())?;
            }
            if let Some(Some(assignee)) = patch.assigned_to.as_ref() {
                directory.require_user(assignee)?;
            }
        }
        self.chats
            .write()
            .await
            .update_chat_fields(chat_id, patch, viewer_id)
    }

    /// Assigns or unassigns, leaving a system note when the assignee changes.
    pub async fn assign(
        &self,
        chat_id: &str,
        agent_id: Option<String>,
        actor: Option<&User>,
    ) -> Result<Chat> {
        let target_label = match agent_id.as_deref() {
            Some(id) => self.user(id).await?.name,
            None => "Unassigned".to_string(),
        };
        let actor_label = actor.map(|a| a.name.as_str()).unwrap_or("System");

        let mut chats = self.chats.write().await;
        let previous = chats
            .chat(chat_id)
            .ok_or_else(|| ConsoleError::not_found("chat", chat_id))?
            .assigned_to
            .clone();
        let changed = previous != agent_id;
        chats.assign(chat_id, agent_id, actor.map(|a| a.id.as_str()))?;
        if changed {
            chats.append(
                chat_id,
                MessageDraft::system(format!(
                    "{actor_label} assigned conversation to {target_label}"
                )),
            )?;
            tracing::info!(chat_id, assignee = %target_label, "chat assignment changed");
        }
        chats.get_chat(chat_id)
    }

    pub async fn mark_read(&self, chat_id: &str, viewer_id: &str) -> Result<Chat> {
        self.chats.write().await.mark_read(chat_id, viewer_id)
    }

    pub async fn transfer(&self, chat_id: &str, queue_id: &str, actor: Option<&User>) -> Result<Chat> {
        let queue_name = self.directory.read().await.require_queue(queue_id)?.name.clone();
        let actor_label = actor.map(|a| a.name.as_str()).unwrap_or("System");

        let mut chats = self.chats.write().await;
        chats.transfer(chat_id, queue_id)?;
        chats.append(
            chat_id,
            MessageDraft::system(format!(
                "{actor_label} transferred conversation to {queue_name}"
            )),
        )?;
        tracing::info!(chat_id, queue_id, "chat transferred");
        chats.get_chat(chat_id)
    }

    /// A console user writes into a chat. Whispers without an explicit target
    /// are aimed at the first `@mention` that resolves to a user.
    pub async fn send_message(
        &self,
        viewer: &User,
        chat_id: &str,
        body: SendMessageBody,
    ) -> Result<(Message, Chat)> {
        if viewer.user_type == UserType::Viewer {
            return Err(ConsoleError::Forbidden(
                "viewers cannot send messages".to_string(),
            ));
        }
        let message_type = body.message_type.unwrap_or_default();
        let mut draft = MessageDraft::from_user(viewer, body.content);
        draft.message_type = message_type;

        if message_type == MessageType::Whisper {
            let directory = self.directory.read().await;
            let target = match body.target_agent_id {
                Some(target_id) => Some(directory.require_user(&target_id)?.id.clone()),
                None => directory
                    .resolve_mention(&draft.content)
                    .map(|user| user.id.clone()),
            };
            draft.target_agent_id = target;
        } else {
            draft.target_agent_id = body.target_agent_id;
        }

        let mut chats = self.chats.write().await;
        let message = chats.append(chat_id, draft)?;
        let chat = chats.get_chat(chat_id)?;
        Ok((message, chat))
    }

    pub async fn patch_sentiment(&self, message_id: &str, score: f64) -> Result<Message> {
        self.chats.write().await.patch_sentiment(message_id, score)
    }

    pub async fn record_analysis(&self, chat_id: &str, analysis: AiAnalysis) -> Result<Chat> {
        let patch = ChatPatch {
            ai_analysis: Some(analysis),
            ..Default::default()
        };
        self.chats
            .write()
            .await
            .update_chat_fields(chat_id, patch, None)
    }

    pub async fn board(&self, queue_id: &str) -> Result<Vec<KanbanLane<ChatSummary>>> {
        let queue = self.directory.read().await.require_queue(queue_id)?.clone();
        let chats = self.chats.read().await.queue_summaries(queue_id);
        Ok(kanban::project(&queue, &chats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatStatus, CreateQueueBody, CreateUserBody, SenderKind};

    async fn store_with_people() -> (ConsoleStore, User, User, String) {
        let store = ConsoleStore::seeded("pré-atendimento");
        let (ana, bob) = {
            let mut directory = store.directory_mut().await;
            let body = |name: &str, email: &str| CreateUserBody {
                id: None,
                name: name.to_string(),
                email: email.to_string(),
                user_type: UserType::AgentHuman,
                avatar_url: None,
                role_id: Some("role-agent".to_string()),
                queue_ids: Vec::new(),
                system_prompt: None,
                model_name: None,
            };
            let ana = directory.create_user(body("Ana Souza", "ana@example.com")).unwrap();
            let bob = directory.create_user(body("Bob", "bob@example.com")).unwrap();
            (ana, bob)
        };
        let chat = store
            .create_chat(NewChat::new("Carla", "+55 11 90000-0001", "queue-pre-service", "oi"))
            .await
            .unwrap();
        (store, ana, bob, chat.id)
    }

    #[tokio::test]
    async fn list_chats_requires_a_known_viewer() {
        let (store, ana, _, chat_id) = store_with_people().await;
        let listed = store.list_chats(&ana.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, chat_id);
        assert!(matches!(
            store.list_chats("ghost").await,
            Err(ConsoleError::NotFound { entity: "user", .. })
        ));
    }

    #[tokio::test]
    async fn create_chat_rejects_unknown_queue() {
        let store = ConsoleStore::seeded("pré-atendimento");
        let result = store
            .create_chat(NewChat::new("Carla", "1234", "nowhere", "oi"))
            .await;
        assert!(matches!(result, Err(ConsoleError::NotFound { entity: "queue", .. })));
    }

    #[tokio::test]
    async fn assignment_leaves_a_system_note_once() {
        let (store, ana, bob, chat_id) = store_with_people().await;
        let chat = store
            .assign(&chat_id, Some(bob.id.clone()), Some(&ana))
            .await
            .unwrap();
        assert_eq!(chat.status, ChatStatus::InProgress);
        let note = chat.messages.last().unwrap();
        assert_eq!(note.sender, SenderKind::System);
        assert_eq!(note.content, "Ana Souza assigned conversation to Bob");

        let again = store
            .assign(&chat_id, Some(bob.id.clone()), Some(&ana))
            .await
            .unwrap();
        assert_eq!(again.messages.len(), chat.messages.len());

        assert!(matches!(
            store.assign(&chat_id, Some("ghost".to_string()), None).await,
            Err(ConsoleError::NotFound { entity: "user", .. })
        ));
    }

    #[tokio::test]
    async fn self_claim_keeps_unread_until_marked_read() {
        let (store, ana, _, chat_id) = store_with_people().await;
        let chat = store
            .assign(&chat_id, Some(ana.id.clone()), Some(&ana))
            .await
            .unwrap();
        assert_eq!(chat.unread_count, 1);
        let chat = store.mark_read(&chat_id, &ana.id).await.unwrap();
        assert_eq!(chat.unread_count, 0);
    }

    #[tokio::test]
    async fn transfer_checks_queue_and_notes_it() {
        let (store, ana, _, chat_id) = store_with_people().await;
        let sales = store
            .directory_mut()
            .await
            .create_queue(CreateQueueBody {
                name: "Sales".to_string(),
                description: String::new(),
                is_active: true,
                kanban_columns: Vec::new(),
                default_ai_agent_id: None,
            })
            .unwrap();
        let chat = store.transfer(&chat_id, &sales.id, Some(&ana)).await.unwrap();
        assert_eq!(chat.status, ChatStatus::Transferred);
        assert_eq!(chat.queue_id, sales.id);
        assert!(chat.messages.last().unwrap().content.ends_with("to Sales"));
        assert!(store.transfer(&chat_id, "nowhere", None).await.is_err());
    }

    #[tokio::test]
    async fn whisper_targets_first_resolvable_mention() {
        let (store, ana, bob, chat_id) = store_with_people().await;
        let (whisper, chat) = store
            .send_message(
                &bob,
                &chat_id,
                SendMessageBody {
                    content: "@nobody @ana can you take this one?".to_string(),
                    message_type: Some(MessageType::Whisper),
                    target_agent_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(whisper.target_agent_id.as_deref(), Some(ana.id.as_str()));
        assert_eq!(chat.unread_count, 1);

        let ana_view = store.chat_for_viewer(&chat_id, &ana).await.unwrap();
        assert_eq!(ana_view.messages.len(), 2);
        let customer = store.customer_messages(&chat_id).await.unwrap();
        assert_eq!(customer.len(), 1);
    }

    #[tokio::test]
    async fn whisper_text_stays_out_of_the_shared_preview() {
        let (store, ana, bob, chat_id) = store_with_people().await;
        let cleo = store
            .directory_mut()
            .await
            .create_user(CreateUserBody {
                id: None,
                name: "Cleo".to_string(),
                email: "cleo@example.com".to_string(),
                user_type: UserType::AgentHuman,
                avatar_url: None,
                role_id: Some("role-agent".to_string()),
                queue_ids: Vec::new(),
                system_prompt: None,
                model_name: None,
            })
            .unwrap();
        store
            .send_message(
                &bob,
                &chat_id,
                SendMessageBody {
                    content: "SECRET internal note".to_string(),
                    message_type: Some(MessageType::Whisper),
                    target_agent_id: Some(ana.id.clone()),
                },
            )
            .await
            .unwrap();

        let listed = store.list_chats(&cleo.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_message_preview, "oi");

        let cleo_view = store.chat_for_viewer(&chat_id, &cleo).await.unwrap();
        assert_eq!(cleo_view.last_message_preview, "oi");
        assert!(cleo_view
            .messages
            .iter()
            .all(|m| m.message_type != MessageType::Whisper));

        store
            .send_message(
                &ana,
                &chat_id,
                SendMessageBody {
                    content: "Olá Carla, vou verificar".to_string(),
                    message_type: None,
                    target_agent_id: None,
                },
            )
            .await
            .unwrap();
        let listed = store.list_chats(&ana.id).await.unwrap();
        assert_eq!(listed[0].last_message_preview, "Olá Carla, vou verificar");
    }

    #[tokio::test]
    async fn console_create_refuses_a_phone_with_a_live_chat() {
        let (store, ana, _, chat_id) = store_with_people().await;
        let duplicate = store
            .create_chat(NewChat::new(
                "Carla",
                "+55 (11) 90000-0001",
                "queue-pre-service",
                "again",
            ))
            .await;
        assert!(matches!(duplicate, Err(ConsoleError::Validation(_))));
        assert_eq!(store.chats().await.len(), 1);

        store
            .update_chat_fields(
                &chat_id,
                ChatPatch {
                    status: Some(ChatStatus::Resolved),
                    ..ChatPatch::default()
                },
                Some(&ana.id),
            )
            .await
            .unwrap();
        let fresh = store
            .create_chat(NewChat::new("Carla", "+55 11 90000-0001", "queue-pre-service", "new issue"))
            .await
            .unwrap();
        assert_ne!(fresh.id, chat_id);
    }

    #[tokio::test]
    async fn viewers_cannot_write() {
        let (store, mut ana, _, chat_id) = store_with_people().await;
        ana.user_type = UserType::Viewer;
        let result = store
            .send_message(
                &ana,
                &chat_id,
                SendMessageBody {
                    content: "hello".to_string(),
                    message_type: None,
                    target_agent_id: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ConsoleError::Forbidden(_))));
    }

    #[tokio::test]
    async fn analysis_and_sentiment_are_recorded() {
        let (store, _, _, chat_id) = store_with_people().await;
        let message_id = store.get_chat(&chat_id).await.unwrap().messages[0].id.clone();
        store.patch_sentiment(&message_id, 0.5).await.unwrap();
        let chat = store
            .record_analysis(&chat_id, AiAnalysis::clamped(0.5, 2.0))
            .await
            .unwrap();
        assert_eq!(chat.messages[0].sentiment_score, Some(0.5));
        assert_eq!(chat.ai_analysis.map(|a| a.confidence_index), Some(1.0));
    }

    #[tokio::test]
    async fn board_projects_queue_chats() {
        let (store, _, _, chat_id) = store_with_people().await;
        let lanes = store.board("queue-pre-service").await.unwrap();
        assert_eq!(lanes[0].chats[0].id, chat_id);
        assert!(store.board("missing").await.is_err());
    }
}
