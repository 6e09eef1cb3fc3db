//! Read-mostly lookup tables: users, roles, queues, AI models and articles.
//!
//! Every table keeps registration order, which the inbound routing fallback
//! depends on for queues. Lookups of ids that no longer resolve return `None`
//! so that orphaned references held by chats and messages stay harmless.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use secrecy::SecretString;
use uuid::Uuid;

use crate::{
    error::{ConsoleError, Result},
    types::{
        AiModel, Article, ChatStatus, CreateAiModelBody, CreateArticleBody, CreateQueueBody,
        CreateRoleBody, CreateUserBody, KanbanColumnConfig, Permission, Queue, QueuePatch, Role,
        RolePatch, User, UserPatch, UserType,
    },
};

#[derive(Debug, Default)]
pub struct Directory {
    users: Vec<User>,
    roles: Vec<Role>,
    queues: Vec<Queue>,
    ai_models: Vec<AiModel>,
    articles: Vec<Article>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn required_text(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConsoleError::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

pub fn mention_handles_from_text(text: &str) -> Vec<String> {
    let Ok(regex) = Regex::new(r"@([\p{L}\p{N}._-]{1,64})") else {
        return Vec::new();
    };
    let mut handles = Vec::new();
    let mut seen = HashSet::new();
    for caps in regex.captures_iter(text) {
        let Some(matched) = caps.get(1) else {
            continue;
        };
        let handle = matched.as_str().trim().to_lowercase();
        if handle.is_empty() || !seen.insert(handle.clone()) {
            continue;
        }
        handles.push(handle);
    }
    handles
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard roles, one admin and the pre-service queue.
    pub fn seeded(pre_service_queue_name: &str) -> Self {
        let mut directory = Self::new();
        directory.roles = vec![
            Role {
                id: "role-admin".to_string(),
                name: "Admin".to_string(),
                permissions: all_permissions(),
                description: Some("Full access".to_string()),
            },
            Role {
                id: "role-supervisor".to_string(),
                name: "Supervisor".to_string(),
                permissions: BTreeSet::from([
                    Permission::ViewAllChats,
                    Permission::AssignChats,
                    Permission::TransferChats,
                    Permission::SendWhisper,
                    Permission::ReopenChats,
                    Permission::UseOracle,
                ]),
                description: Some("Oversees queues and agents".to_string()),
            },
            Role {
                id: "role-agent".to_string(),
                name: "Agent".to_string(),
                permissions: BTreeSet::from([
                    Permission::AssignChats,
                    Permission::TransferChats,
                    Permission::SendWhisper,
                    Permission::UseOracle,
                ]),
                description: Some("Handles customer chats".to_string()),
            },
        ];
        directory.users.push(User {
            id: "admin".to_string(),
            name: "Administrator".to_string(),
            email: "admin@localhost".to_string(),
            user_type: UserType::Admin,
            avatar_url: None,
            role_id: Some("role-admin".to_string()),
            queue_ids: Vec::new(),
            system_prompt: None,
            model_name: None,
        });
        directory.queues.push(Queue {
            id: "queue-pre-service".to_string(),
            name: pre_service_queue_name.to_string(),
            description: "First contact triage".to_string(),
            is_active: true,
            kanban_columns: default_kanban_columns(),
            default_ai_agent_id: None,
        });
        directory
    }

    // users

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn require_user(&self, id: &str) -> Result<&User> {
        self.user(id)
            .ok_or_else(|| ConsoleError::not_found("user", id))
    }

    pub fn create_user(&mut self, body: CreateUserBody) -> Result<User> {
        let id = match body.id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => new_id(),
        };
        if self.user(&id).is_some() {
            return Err(ConsoleError::validation(format!("user id {id} already exists")));
        }
        if let Some(role_id) = body.role_id.as_deref() {
            self.require_role(role_id)?;
        }
        let mut user = User {
            id,
            name: required_text(&body.name, "name")?,
            email: required_text(&body.email, "email")?.to_lowercase(),
            user_type: body.user_type,
            avatar_url: body.avatar_url,
            role_id: body.role_id,
            queue_ids: body.queue_ids,
            system_prompt: body.system_prompt,
            model_name: body.model_name,
        };
        user.sanitize();
        tracing::info!(user_id = %user.id, user_type = ?user.user_type, "user created");
        self.users.push(user.clone());
        Ok(user)
    }

    pub fn update_user(&mut self, id: &str, patch: UserPatch) -> Result<User> {
        if let Some(Some(role_id)) = patch.role_id.as_ref() {
            self.require_role(role_id)?;
        }
        let user = self
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| ConsoleError::not_found("user", id))?;
        if let Some(name) = patch.name {
            user.name = required_text(&name, "name")?;
        }
        if let Some(email) = patch.email {
            user.email = required_text(&email, "email")?.to_lowercase();
        }
        if let Some(user_type) = patch.user_type {
            user.user_type = user_type;
        }
        if let Some(avatar_url) = patch.avatar_url {
            user.avatar_url = avatar_url;
        }
        if let Some(role_id) = patch.role_id {
            user.role_id = role_id;
        }
        if let Some(queue_ids) = patch.queue_ids {
            user.queue_ids = queue_ids;
        }
        if let Some(system_prompt) = patch.system_prompt {
            user.system_prompt = system_prompt;
        }
        if let Some(model_name) = patch.model_name {
            user.model_name = model_name;
        }
        user.sanitize();
        Ok(user.clone())
    }

    /// Removes the user; chats and messages keep their now-orphaned references.
    pub fn remove_user(&mut self, id: &str) -> Result<User> {
        let index = self
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| ConsoleError::not_found("user", id))?;
        Ok(self.users.remove(index))
    }

    /// First user answering to any `@handle` in the text.
    pub fn resolve_mention(&self, text: &str) -> Option<&User> {
        let handles = mention_handles_from_text(text);
        if handles.is_empty() {
            return None;
        }
        handles.iter().find_map(|handle| {
            self.users
                .iter()
                .find(|user| user.mention_handles().iter().any(|h| h == handle))
        })
    }

    // roles

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role(&self, id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    fn require_role(&self, id: &str) -> Result<&Role> {
        self.role(id)
            .ok_or_else(|| ConsoleError::not_found("role", id))
    }

    pub fn create_role(&mut self, body: CreateRoleBody) -> Result<Role> {
        let role = Role {
            id: new_id(),
            name: required_text(&body.name, "name")?,
            permissions: body.permissions,
            description: body.description,
        };
        self.roles.push(role.clone());
        Ok(role)
    }

    pub fn update_role(&mut self, id: &str, patch: RolePatch) -> Result<Role> {
        let role = self
            .roles
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ConsoleError::not_found("role", id))?;
        if let Some(name) = patch.name {
            role.name = required_text(&name, "name")?;
        }
        if let Some(permissions) = patch.permissions {
            role.permissions = permissions;
        }
        if let Some(description) = patch.description {
            role.description = description;
        }
        Ok(role.clone())
    }

    pub fn remove_role(&mut self, id: &str) -> Result<Role> {
        let index = self
            .roles
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| ConsoleError::not_found("role", id))?;
        Ok(self.roles.remove(index))
    }

    /// Capability check. Admins hold everything; a dangling role grants nothing.
    pub fn has_permission(&self, user: &User, permission: Permission) -> bool {
        if user.user_type == UserType::Admin {
            return true;
        }
        user.role_id
            .as_deref()
            .and_then(|role_id| self.role(role_id))
            .map(|role| role.permissions.contains(&permission))
            .unwrap_or(false)
    }

    // queues

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn queue(&self, id: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.id == id)
    }

    pub fn require_queue(&self, id: &str) -> Result<&Queue> {
        self.queue(id)
            .ok_or_else(|| ConsoleError::not_found("queue", id))
    }

    /// Queue whose name matches `label`, ignoring case and surrounding space.
    pub fn queue_named(&self, label: &str) -> Option<&Queue> {
        let wanted = label.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.queues
            .iter()
            .find(|q| q.name.trim().to_lowercase() == wanted)
    }

    pub fn first_queue(&self) -> Option<&Queue> {
        self.queues.first()
    }

    fn check_default_ai_agent(&self, agent_id: Option<&str>) -> Result<()> {
        let Some(agent_id) = agent_id else {
            return Ok(());
        };
        let agent = self.require_user(agent_id)?;
        if agent.user_type != UserType::AgentAi {
            return Err(ConsoleError::validation(format!(
                "defaultAiAgentId {agent_id} is not an AI agent"
            )));
        }
        Ok(())
    }

    pub fn create_queue(&mut self, body: CreateQueueBody) -> Result<Queue> {
        self.check_default_ai_agent(body.default_ai_agent_id.as_deref())?;
        let queue = Queue {
            id: new_id(),
            name: required_text(&body.name, "name")?,
            description: body.description,
            is_active: body.is_active,
            kanban_columns: with_column_ids(body.kanban_columns),
            default_ai_agent_id: body.default_ai_agent_id,
        };
        tracing::info!(queue_id = %queue.id, name = %queue.name, "queue created");
        self.queues.push(queue.clone());
        Ok(queue)
    }

    pub fn update_queue(&mut self, id: &str, patch: QueuePatch) -> Result<Queue> {
        if let Some(agent_id) = patch.default_ai_agent_id.as_ref() {
            self.check_default_ai_agent(agent_id.as_deref())?;
        }
        let queue = self
            .queues
            .iter_mut()
            .find(|q| q.id == id)
            .ok_or_else(|| ConsoleError::not_found("queue", id))?;
        if let Some(name) = patch.name {
            queue.name = required_text(&name, "name")?;
        }
        if let Some(description) = patch.description {
            queue.description = description;
        }
        if let Some(is_active) = patch.is_active {
            queue.is_active = is_active;
        }
        if let Some(columns) = patch.kanban_columns {
            queue.kanban_columns = with_column_ids(columns);
        }
        if let Some(agent_id) = patch.default_ai_agent_id {
            queue.default_ai_agent_id = agent_id;
        }
        Ok(queue.clone())
    }

    pub fn remove_queue(&mut self, id: &str) -> Result<Queue> {
        let index = self
            .queues
            .iter()
            .position(|q| q.id == id)
            .ok_or_else(|| ConsoleError::not_found("queue", id))?;
        Ok(self.queues.remove(index))
    }

    // ai models

    pub fn ai_models(&self) -> &[AiModel] {
        &self.ai_models
    }

    pub fn create_ai_model(&mut self, body: CreateAiModelBody) -> Result<AiModel> {
        let token = required_text(&body.api_token, "apiToken")?;
        let model = AiModel {
            id: new_id(),
            name: required_text(&body.name, "name")?,
            provider: required_text(&body.provider, "provider")?,
            api_token: SecretString::from(token),
            description: body.description,
        };
        tracing::info!(model_id = %model.id, provider = %model.provider, "ai model registered");
        self.ai_models.push(model.clone());
        Ok(model)
    }

    pub fn remove_ai_model(&mut self, id: &str) -> Result<AiModel> {
        let index = self
            .ai_models
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| ConsoleError::not_found("ai model", id))?;
        Ok(self.ai_models.remove(index))
    }

    // articles

    pub fn articles(&self) -> &[Article] {
        &self.articles
    }

    pub fn create_article(&mut self, body: CreateArticleBody) -> Result<Article> {
        let article = Article {
            id: new_id(),
            title: required_text(&body.title, "title")?,
            content: required_text(&body.content, "content")?,
            tags: body.tags,
        };
        self.articles.push(article.clone());
        Ok(article)
    }

    pub fn remove_article(&mut self, id: &str) -> Result<Article> {
        let index = self
            .articles
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| ConsoleError::not_found("article", id))?;
        Ok(self.articles.remove(index))
    }

    /// Articles joined into the plain-text corpus handed to the Oracle.
    pub fn knowledge_corpus(&self) -> String {
        self.articles
            .iter()
            .map(|a| format!("# {}\n{}", a.title, a.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn all_permissions() -> BTreeSet<Permission> {
    BTreeSet::from([
        Permission::ViewAllChats,
        Permission::AssignChats,
        Permission::TransferChats,
        Permission::SendWhisper,
        Permission::ReopenChats,
        Permission::UseOracle,
        Permission::ManageUsers,
        Permission::ManageRoles,
        Permission::ManageQueues,
        Permission::ManageAiModels,
        Permission::ManageArticles,
    ])
}

/// Board used by queues that configure no columns of their own.
pub fn default_kanban_columns() -> Vec<KanbanColumnConfig> {
    [
        ("waiting", "Waiting", ChatStatus::Waiting),
        ("in-progress", "In progress", ChatStatus::InProgress),
        ("transferred", "Transferred", ChatStatus::Transferred),
    ]
    .into_iter()
    .map(|(id, title, status)| KanbanColumnConfig {
        id: id.to_string(),
        title: title.to_string(),
        mapped_statuses: BTreeSet::from([status]),
    })
    .collect()
}

fn with_column_ids(columns: Vec<KanbanColumnConfig>) -> Vec<KanbanColumnConfig> {
    columns
        .into_iter()
        .map(|mut column| {
            if column.id.trim().is_empty() {
                column.id = new_id();
            }
            column
        })
        .collect()
}
