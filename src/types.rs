use std::{
    collections::BTreeSet,
    fmt,
    sync::{atomic::AtomicUsize, Arc},
};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    ai::AiFlows, config::AppConfig, dispatcher::Dispatcher, realtime::RealtimeState,
    store::ConsoleStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Admin,
    Supervisor,
    AgentHuman,
    AgentAi,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    Waiting,
    InProgress,
    Transferred,
    Resolved,
    Closed,
}

impl ChatStatus {
    /// Statuses in which a chat still expects work from the console.
    pub fn is_live(self) -> bool {
        matches!(self, ChatStatus::Waiting | ChatStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChatStatus::Resolved | ChatStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    Document,
    Whisper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Customer,
    Agent,
    Supervisor,
    Ai,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "chats:view_all")]
    ViewAllChats,
    #[serde(rename = "chats:assign")]
    AssignChats,
    #[serde(rename = "chats:transfer")]
    TransferChats,
    #[serde(rename = "chats:whisper")]
    SendWhisper,
    #[serde(rename = "chats:reopen")]
    ReopenChats,
    #[serde(rename = "oracle:use")]
    UseOracle,
    #[serde(rename = "admin:users")]
    ManageUsers,
    #[serde(rename = "admin:roles")]
    ManageRoles,
    #[serde(rename = "admin:queues")]
    ManageQueues,
    #[serde(rename = "admin:ai_models")]
    ManageAiModels,
    #[serde(rename = "admin:articles")]
    ManageArticles,
}

/// The wire name, as it appears in role permission lists.
impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub user_type: UserType,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub queue_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

impl User {
    pub fn is_supervisor_or_admin(&self) -> bool {
        matches!(self.user_type, UserType::Admin | UserType::Supervisor)
    }

    /// Drops the AI-only fields from users that are not AI agents.
    pub fn sanitize(&mut self) {
        if self.user_type != UserType::AgentAi {
            self.system_prompt = None;
            self.model_name = None;
        }
    }

    pub fn works_queue(&self, queue_id: &str) -> bool {
        self.queue_ids.is_empty() || self.queue_ids.iter().any(|id| id == queue_id)
    }

    /// Lowercased handles the user answers to in `@mentions`: the display name
    /// without spaces and the email local part.
    pub fn mention_handles(&self) -> Vec<String> {
        let mut handles = Vec::new();
        let compact = self
            .name
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>();
        if !compact.is_empty() {
            handles.push(compact);
        }
        if let Some(local) = self.email.split('@').next() {
            let local = local.trim().to_lowercase();
            if !local.is_empty() && !handles.contains(&local) {
                handles.push(local);
            }
        }
        handles
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanColumnConfig {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mapped_statuses: BTreeSet<ChatStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub is_active: bool,
    #[serde(default)]
    pub kanban_columns: Vec<KanbanColumnConfig>,
    #[serde(default)]
    pub default_ai_agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub sentiment_score: f64,
    pub confidence_index: f64,
}

impl AiAnalysis {
    pub fn clamped(sentiment_score: f64, confidence_index: f64) -> Self {
        Self {
            sentiment_score: sentiment_score.clamp(-1.0, 1.0),
            confidence_index: confidence_index.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: SenderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_from_customer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whatsapp_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub whatsapp_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub queue_id: String,
    pub assigned_to: Option<String>,
    pub status: ChatStatus,
    pub priority: ChatPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub last_message_preview: String,
    #[serde(default)]
    pub ai_analysis: Option<AiAnalysis>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub whatsapp_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub queue_id: String,
    pub assigned_to: Option<String>,
    pub status: ChatStatus,
    pub priority: ChatPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub last_message_preview: String,
    pub ai_analysis: Option<AiAnalysis>,
    pub message_count: usize,
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            whatsapp_id: chat.whatsapp_id.clone(),
            customer_name: chat.customer_name.clone(),
            customer_phone: chat.customer_phone.clone(),
            queue_id: chat.queue_id.clone(),
            assigned_to: chat.assigned_to.clone(),
            status: chat.status,
            priority: chat.priority,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            last_activity: chat.last_activity,
            unread_count: chat.unread_count,
            last_message_preview: chat.last_message_preview.clone(),
            ai_analysis: chat.ai_analysis,
            message_count: chat.messages.len(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(
        serialize_with = "serialize_masked_token",
        deserialize_with = "deserialize_secret_token"
    )]
    pub api_token: SecretString,
    #[serde(default)]
    pub description: Option<String>,
}

impl Clone for AiModel {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            provider: self.provider.clone(),
            api_token: SecretString::from(self.api_token.expose_secret().to_owned()),
            description: self.description.clone(),
        }
    }
}

/// Short, stable identifier of a secret that is safe to display.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

/// Renders a secret as its last four characters plus a fingerprint.
pub fn mask_token(token: &str) -> String {
    let chars = token.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return format!("****#{}", token_fingerprint(token));
    }
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("****{tail}#{}", token_fingerprint(token))
}

fn serialize_masked_token<S: Serializer>(
    token: &SecretString,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&mask_token(token.expose_secret()))
}

fn deserialize_secret_token<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSuggestion {
    pub id: String,
    pub relevance_score: f64,
}

pub struct AppState {
    pub store: Arc<ConsoleStore>,
    pub dispatcher: Dispatcher,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub ai: Option<Arc<dyn AiFlows>>,
    pub config: AppConfig,
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatPatch {
    pub status: Option<ChatStatus>,
    pub priority: Option<ChatPriority>,
    #[serde(default, deserialize_with = "double_option")]
    pub assigned_to: Option<Option<String>>,
    pub queue_id: Option<String>,
    pub customer_name: Option<String>,
    pub ai_analysis: Option<AiAnalysis>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateChatBody {
    pub customer_name: String,
    pub customer_phone: String,
    pub queue_id: String,
    pub initial_message: String,
    #[serde(default)]
    pub priority: Option<ChatPriority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AssigneeBody {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferBody {
    pub queue_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageBody {
    pub content: String,
    #[serde(default, rename = "type")]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub target_agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SentimentBody {
    pub score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OracleBody {
    pub question: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateUserBody {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub user_type: UserType,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub queue_ids: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub user_type: Option<UserType>,
    #[serde(default, deserialize_with = "double_option")]
    pub avatar_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub role_id: Option<Option<String>>,
    pub queue_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub system_prompt: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub model_name: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateRoleBody {
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RolePatch {
    pub name: Option<String>,
    pub permissions: Option<BTreeSet<Permission>>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateQueueBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub kanban_columns: Vec<KanbanColumnConfig>,
    #[serde(default)]
    pub default_ai_agent_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueuePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub kanban_columns: Option<Vec<KanbanColumnConfig>>,
    #[serde(default, deserialize_with = "double_option")]
    pub default_ai_agent_id: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateAiModelBody {
    pub name: String,
    pub provider: String,
    pub api_token: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateArticleBody {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub user_id: String,
}
