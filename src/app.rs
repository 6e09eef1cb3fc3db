use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Arc},
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    ai::{answer_soft, suggest_articles_soft, AiFlows, OpenAiFlows, ORACLE_FALLBACK_ANSWER},
    config::AppConfig,
    dispatcher::{Dispatcher, InboundEvent, Ingested},
    error::{ConsoleError, Result},
    ledger::customer_visible,
    logging,
    realtime::{emit_chat_updated, emit_message, ws_handler, RealtimeState},
    registry::NewChat,
    store::ConsoleStore,
    types::{
        AppState, AssigneeBody, Chat, ChatPatch, ChatSummary, CreateAiModelBody,
        CreateArticleBody, CreateChatBody, CreateQueueBody, CreateRoleBody, CreateUserBody,
        MessageType, OracleBody, Permission, QueuePatch, RolePatch, SendMessageBody, SenderKind,
        SentimentBody, TransferBody, User, UserPatch,
    },
    whatsapp,
};

/// Header naming the acting console user.
pub const USER_HEADER: &str = "x-user-id";

const TRANSCRIPT_MESSAGES: usize = 14;

pub fn build_state(config: AppConfig, ai: Option<Arc<dyn AiFlows>>) -> Arc<AppState> {
    let store = if config.seed_directory {
        ConsoleStore::seeded(&config.pre_service_queue_name)
    } else {
        ConsoleStore::default()
    };
    let dispatcher = Dispatcher::new(
        config.pre_service_queue_name.clone(),
        config.ai_timeout,
        ai.clone(),
    );
    Arc::new(AppState {
        store: Arc::new(store),
        dispatcher,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        ai,
        config,
    })
}

async fn viewer_from_headers(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConsoleError::validation("x-user-id header is required"))?;
    state.store.user(user_id).await
}

async fn require_permission(state: &AppState, user: &User, permission: Permission) -> Result<()> {
    if state.store.has_permission(user, permission).await {
        return Ok(());
    }
    Err(ConsoleError::Forbidden(format!(
        "user {} lacks {permission}",
        user.id
    )))
}

async fn publish_chat(state: &Arc<AppState>, chat: &Chat) {
    emit_chat_updated(state, chat).await;
}

async fn publish_ingested(state: &Arc<AppState>, ingested: &Ingested) {
    emit_message(state, &ingested.message, &ingested.chat).await;
    emit_chat_updated(state, &ingested.chat).await;
}

fn sender_label(sender: SenderKind) -> &'static str {
    match sender {
        SenderKind::Customer => "customer",
        SenderKind::Agent => "agent",
        SenderKind::Supervisor => "supervisor",
        SenderKind::Ai => "ai",
        SenderKind::System => "system",
    }
}

/// Recent customer-facing lines of a chat, oldest first.
fn conversation_transcript(chat: &Chat, limit: usize) -> String {
    let visible = chat
        .messages
        .iter()
        .filter(|m| customer_visible(m))
        .collect::<Vec<_>>();
    let start = visible.len().saturating_sub(limit);
    visible[start..]
        .iter()
        .map(|m| format!("{}: {}", sender_label(m.sender), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now() }))
}

// chats

async fn get_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    let chats = state.store.list_chats(&viewer.id).await?;
    Ok(Json(json!({ "chats": chats })))
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateChatBody>,
) -> Result<(StatusCode, Json<Value>)> {
    viewer_from_headers(&state, &headers).await?;
    let mut new_chat = NewChat::new(
        body.customer_name,
        body.customer_phone,
        body.queue_id,
        body.initial_message,
    );
    new_chat.priority = body.priority;
    let chat = state.store.create_chat(new_chat).await?;
    if let Some(first) = chat.messages.first() {
        emit_message(&state, first, &chat).await;
    }
    publish_chat(&state, &chat).await;
    Ok((StatusCode::CREATED, Json(json!({ "chat": chat }))))
}

async fn get_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    let chat = state.store.chat_for_viewer(&chat_id, &viewer).await?;
    Ok(Json(json!({ "chat": chat })))
}

async fn patch_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<ChatPatch>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    let current = state.store.summary(&chat_id).await?;
    let reopening = current.status.is_terminal()
        && patch.status.is_some_and(|status| !status.is_terminal());
    if reopening {
        require_permission(&state, &viewer, Permission::ReopenChats).await?;
    }
    if let Some(Some(assignee)) = patch.assigned_to.as_ref() {
        if assignee != &viewer.id {
            require_permission(&state, &viewer, Permission::AssignChats).await?;
        }
    }
    let chat = state
        .store
        .update_chat_fields(&chat_id, patch, Some(&viewer.id))
        .await?;
    publish_chat(&state, &chat).await;
    Ok(Json(json!({ "chat": ChatSummary::from(&chat) })))
}

async fn patch_assignee(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssigneeBody>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    let agent_id = body
        .agent_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    if agent_id.as_deref() != Some(viewer.id.as_str()) {
        require_permission(&state, &viewer, Permission::AssignChats).await?;
    }
    let chat = state.store.assign(&chat_id, agent_id, Some(&viewer)).await?;
    publish_chat(&state, &chat).await;
    Ok(Json(json!({ "chat": ChatSummary::from(&chat) })))
}

async fn post_read(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    let chat = state.store.mark_read(&chat_id, &viewer.id).await?;
    publish_chat(&state, &chat).await;
    Ok(Json(json!({ "ok": true, "unreadCount": chat.unread_count })))
}

async fn post_transfer(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::TransferChats).await?;
    let chat = state
        .store
        .transfer(&chat_id, body.queue_id.trim(), Some(&viewer))
        .await?;
    publish_chat(&state, &chat).await;
    Ok(Json(json!({ "chat": ChatSummary::from(&chat) })))
}

async fn post_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    if body.message_type == Some(MessageType::Whisper) {
        require_permission(&state, &viewer, Permission::SendWhisper).await?;
    }
    let (message, chat) = state.store.send_message(&viewer, &chat_id, body).await?;
    emit_message(&state, &message, &chat).await;
    publish_chat(&state, &chat).await;
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

async fn get_customer_messages(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let messages = state.store.customer_messages(&chat_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn get_suggestions(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let chat = state.store.get_chat(&chat_id).await?;
    let Some(ai) = state.ai.clone() else {
        return Ok(Json(json!({ "suggestions": [] })));
    };
    let articles = state.store.directory().await.articles().to_vec();
    let transcript = conversation_transcript(&chat, TRANSCRIPT_MESSAGES);
    let suggestions =
        suggest_articles_soft(ai.as_ref(), &transcript, &articles, state.config.ai_timeout).await;
    Ok(Json(json!({ "suggestions": suggestions })))
}

async fn patch_message_sentiment(
    Path(message_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SentimentBody>,
) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let message = state.store.patch_sentiment(&message_id, body.score).await?;
    Ok(Json(json!({ "message": message })))
}

async fn get_board(
    Path(queue_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let lanes = state.store.board(&queue_id).await?;
    Ok(Json(json!({ "queueId": queue_id, "lanes": lanes })))
}

async fn post_oracle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OracleBody>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::UseOracle).await?;
    let question = body.question.trim();
    if question.is_empty() {
        return Err(ConsoleError::validation("question is required"));
    }
    let answer = match state.ai.clone() {
        Some(ai) => {
            let corpus = state.store.directory().await.knowledge_corpus();
            answer_soft(ai.as_ref(), question, &corpus, state.config.ai_timeout).await
        }
        None => ORACLE_FALLBACK_ANSWER.to_string(),
    };
    Ok(Json(json!({ "answer": answer })))
}

// directory administration

async fn get_users(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let users = state.store.directory().await.users().to_vec();
    Ok(Json(json!({ "users": users })))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageUsers).await?;
    let user = state.store.directory_mut().await.create_user(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

async fn patch_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<UserPatch>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageUsers).await?;
    let user = state.store.directory_mut().await.update_user(&user_id, patch)?;
    Ok(Json(json!({ "user": user })))
}

async fn delete_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageUsers).await?;
    if viewer.id == user_id {
        return Err(ConsoleError::validation("users cannot remove themselves"));
    }
    state.store.directory_mut().await.remove_user(&user_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_roles(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let roles = state.store.directory().await.roles().to_vec();
    Ok(Json(json!({ "roles": roles })))
}

async fn create_role(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRoleBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageRoles).await?;
    let role = state.store.directory_mut().await.create_role(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "role": role }))))
}

async fn patch_role(
    Path(role_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<RolePatch>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageRoles).await?;
    let role = state.store.directory_mut().await.update_role(&role_id, patch)?;
    Ok(Json(json!({ "role": role })))
}

async fn delete_role(
    Path(role_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageRoles).await?;
    state.store.directory_mut().await.remove_role(&role_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_queues(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let queues = state.store.directory().await.queues().to_vec();
    Ok(Json(json!({ "queues": queues })))
}

async fn create_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateQueueBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageQueues).await?;
    let queue = state.store.directory_mut().await.create_queue(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "queue": queue }))))
}

async fn patch_queue(
    Path(queue_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<QueuePatch>,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageQueues).await?;
    let queue = state
        .store
        .directory_mut()
        .await
        .update_queue(&queue_id, patch)?;
    Ok(Json(json!({ "queue": queue })))
}

async fn delete_queue(
    Path(queue_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageQueues).await?;
    state.store.directory_mut().await.remove_queue(&queue_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_ai_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageAiModels).await?;
    let models = state.store.directory().await.ai_models().to_vec();
    Ok(Json(json!({ "aiModels": models })))
}

async fn create_ai_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAiModelBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageAiModels).await?;
    let model = state.store.directory_mut().await.create_ai_model(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "aiModel": model }))))
}

async fn delete_ai_model(
    Path(model_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageAiModels).await?;
    state.store.directory_mut().await.remove_ai_model(&model_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_articles(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    viewer_from_headers(&state, &headers).await?;
    let articles = state.store.directory().await.articles().to_vec();
    Ok(Json(json!({ "articles": articles })))
}

async fn create_article(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateArticleBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageArticles).await?;
    let article = state.store.directory_mut().await.create_article(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "article": article }))))
}

async fn delete_article(
    Path(article_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let viewer = viewer_from_headers(&state, &headers).await?;
    require_permission(&state, &viewer, Permission::ManageArticles).await?;
    state
        .store
        .directory_mut()
        .await
        .remove_article(&article_id)?;
    Ok(Json(json!({ "ok": true })))
}

// inbound

async fn post_inbound(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<Value>> {
    let ingested = state.dispatcher.ingest(&state.store, event).await?;
    publish_ingested(&state, &ingested).await;
    Ok(Json(json!({
        "chat": ChatSummary::from(&ingested.chat),
        "message": ingested.message,
        "created": ingested.created,
    })))
}

async fn whatsapp_webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match whatsapp::verify_subscription(&params, state.config.whatsapp_verify_token.as_deref()) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification token" })),
        )
            .into_response(),
    }
}

async fn whatsapp_webhook_event(State(state): State<Arc<AppState>>, body: Bytes) -> Json<Value> {
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let mut processed = 0usize;
    for event in whatsapp::inbound_events(&payload) {
        match state.dispatcher.ingest(&state.store, event).await {
            Ok(ingested) => {
                processed += 1;
                publish_ingested(&state, &ingested).await;
            }
            Err(err) => tracing::warn!(error = %err, "whatsapp message not ingested"),
        }
    }
    Json(json!({ "ok": true, "processed": processed }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chats", get(get_chats).post(post_chat))
        .route("/api/chats/{chat_id}", get(get_chat).patch(patch_chat))
        .route("/api/chats/{chat_id}/assignee", patch(patch_assignee))
        .route("/api/chats/{chat_id}/read", post(post_read))
        .route("/api/chats/{chat_id}/transfer", post(post_transfer))
        .route("/api/chats/{chat_id}/messages", post(post_message))
        .route(
            "/api/chats/{chat_id}/customer-messages",
            get(get_customer_messages),
        )
        .route("/api/chats/{chat_id}/suggestions", get(get_suggestions))
        .route(
            "/api/messages/{message_id}/sentiment",
            patch(patch_message_sentiment),
        )
        .route("/api/queues/{queue_id}/board", get(get_board))
        .route("/api/oracle", post(post_oracle))
        .route("/api/users", get(get_users).post(create_user))
        .route(
            "/api/users/{user_id}",
            patch(patch_user).delete(delete_user),
        )
        .route("/api/roles", get(get_roles).post(create_role))
        .route(
            "/api/roles/{role_id}",
            patch(patch_role).delete(delete_role),
        )
        .route("/api/queues", get(get_queues).post(create_queue))
        .route(
            "/api/queues/{queue_id}",
            patch(patch_queue).delete(delete_queue),
        )
        .route("/api/ai-models", get(get_ai_models).post(create_ai_model))
        .route(
            "/api/ai-models/{model_id}",
            axum::routing::delete(delete_ai_model),
        )
        .route("/api/articles", get(get_articles).post(create_article))
        .route(
            "/api/articles/{article_id}",
            axum::routing::delete(delete_article),
        )
        .route("/api/inbound", post(post_inbound))
        .route(
            "/api/webhooks/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> std::io::Result<()> {
    let config = AppConfig::from_env();
    logging::init();

    let ai = OpenAiFlows::from_config(&config).map(|flows| Arc::new(flows) as Arc<dyn AiFlows>);
    if ai.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; AI flows answer with fallbacks");
    }

    let port = config.port;
    let state = build_state(config, ai);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("chat console server running at http://localhost:{port}");
    axum::serve(listener, app).await
}
