//! Inbound dispatch: every customer message lands either in a live chat for
//! that phone or in a freshly created one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{
    ai::{score_sentiment_soft, AiFlows},
    error::{ConsoleError, Result},
    ledger::MessageDraft,
    registry::{normalize_phone, NewChat},
    store::ConsoleStore,
    types::{Chat, Message, MessageType},
};

/// Queue id used when the directory has no queue at all.
pub const UNDEFINED_QUEUE_ID: &str = "undefined-queue";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default)]
    pub customer_name: String,
    pub customer_phone: String,
    pub content: String,
    #[serde(default)]
    pub external_message_id: Option<String>,
    #[serde(default)]
    pub known_chat_id: Option<String>,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
}

/// Outcome of one ingest.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub chat: Chat,
    pub message: Message,
    pub created: bool,
}

pub struct Dispatcher {
    pre_service_queue_name: String,
    ai_timeout: Duration,
    ai: Option<Arc<dyn AiFlows>>,
    phone_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        pre_service_queue_name: impl Into<String>,
        ai_timeout: Duration,
        ai: Option<Arc<dyn AiFlows>>,
    ) -> Self {
        Self {
            pre_service_queue_name: pre_service_queue_name.into(),
            ai_timeout,
            ai,
            phone_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ingest(&self, store: &Arc<ConsoleStore>, event: InboundEvent) -> Result<Ingested> {
        if event.content.trim().is_empty() {
            return Err(ConsoleError::validation("content is required"));
        }

        if let Some(chat_id) = event.known_chat_id.as_deref() {
            let known_name = store
                .chats()
                .await
                .chat(chat_id)
                .map(|chat| chat.customer_name.clone());
            if let Some(customer_name) = known_name {
                let draft = customer_draft(&event, &customer_name);
                let ingested = append_and_load(store, chat_id, draft, false).await?;
                tracing::debug!(chat_id, "inbound appended to known chat");
                self.spawn_sentiment(store, &ingested.message);
                return Ok(ingested);
            }
            tracing::debug!(chat_id, "known chat id did not resolve; routing by phone");
        }

        let phone_key = normalize_phone(&event.customer_phone)
            .ok_or_else(|| ConsoleError::validation("customerPhone is required"))?;

        let lock = self.phone_lock(&phone_key).await;
        let ingested = {
            let _guard = lock.lock().await;
            self.route_by_phone(store, &event).await
        };
        drop(lock);
        self.prune_phone_locks().await;

        let ingested = ingested?;
        self.spawn_sentiment(store, &ingested.message);
        Ok(ingested)
    }

    /// The live-chat lookup and the create share one write guard, so console
    /// creation cannot slip a second live chat in between.
    async fn route_by_phone(&self, store: &Arc<ConsoleStore>, event: &InboundEvent) -> Result<Ingested> {
        let queue_id = match event.queue_id.as_deref().map(str::trim) {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => self.fallback_queue_id(store).await,
        };

        let mut chats = store.chats_mut().await;
        let live = chats
            .find_live_by_phone(&event.customer_phone)
            .map(|chat| (chat.id.clone(), chat.customer_name.clone()));
        if let Some((chat_id, customer_name)) = live {
            let message = chats.append(&chat_id, customer_draft(event, &customer_name))?;
            let chat = chats.get_chat(&chat_id)?;
            tracing::debug!(chat_id = %chat_id, "inbound appended to live chat");
            return Ok(Ingested {
                chat,
                message,
                created: false,
            });
        }

        let mut new_chat = NewChat::new(
            event.customer_name.as_str(),
            event.customer_phone.as_str(),
            queue_id,
            event.content.as_str(),
        );
        new_chat.message_type = event.message_type.unwrap_or_default();
        new_chat.whatsapp_message_id = event.external_message_id.clone();

        let chat = chats.create_chat(new_chat)?;
        let message = chat
            .messages
            .first()
            .cloned()
            .ok_or_else(|| ConsoleError::not_found("message", chat.id.as_str()))?;
        Ok(Ingested {
            chat,
            message,
            created: true,
        })
    }

    /// Pre-service queue by name, then the first registered queue, then the
    /// sentinel id.
    async fn fallback_queue_id(&self, store: &ConsoleStore) -> String {
        let directory = store.directory().await;
        if let Some(queue) = directory.queue_named(&self.pre_service_queue_name) {
            return queue.id.clone();
        }
        if let Some(queue) = directory.first_queue() {
            tracing::debug!(queue_id = %queue.id, "pre-service queue missing; using first queue");
            return queue.id.clone();
        }
        tracing::warn!("no queues registered; routing inbound chat to {UNDEFINED_QUEUE_ID}");
        UNDEFINED_QUEUE_ID.to_string()
    }

    async fn phone_lock(&self, phone_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.phone_locks.lock().await;
        locks.entry(phone_key.to_string()).or_default().clone()
    }

    async fn prune_phone_locks(&self) {
        let mut locks = self.phone_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Best-effort scoring of a customer message, detached from the request.
    fn spawn_sentiment(&self, store: &Arc<ConsoleStore>, message: &Message) {
        let Some(ai) = self.ai.clone() else {
            return;
        };
        if !message.is_from_customer || message.sentiment_score.is_some() {
            return;
        }
        let store = store.clone();
        let timeout = self.ai_timeout;
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        let content = message.content.clone();
        tokio::spawn(async move {
            let Some(analysis) = score_sentiment_soft(ai.as_ref(), &content, timeout).await else {
                return;
            };
            if let Err(err) = store
                .patch_sentiment(&message_id, analysis.sentiment_score)
                .await
            {
                tracing::warn!(error = %err, "could not store message sentiment");
                return;
            }
            if let Err(err) = store.record_analysis(&chat_id, analysis).await {
                tracing::warn!(error = %err, "could not store chat analysis");
            }
        });
    }
}

fn customer_draft(event: &InboundEvent, fallback_name: &str) -> MessageDraft {
    let name = match event.customer_name.trim() {
        "" => fallback_name,
        name => name,
    };
    let mut draft = MessageDraft::customer(event.content.as_str(), name);
    draft.message_type = event.message_type.unwrap_or_default();
    draft.whatsapp_message_id = event.external_message_id.clone();
    draft
}

async fn append_and_load(
    store: &ConsoleStore,
    chat_id: &str,
    draft: MessageDraft,
    created: bool,
) -> Result<Ingested> {
    let mut chats = store.chats_mut().await;
    let message = chats.append(chat_id, draft)?;
    let chat = chats.get_chat(chat_id)?;
    Ok(Ingested {
        chat,
        message,
        created,
    })
}
