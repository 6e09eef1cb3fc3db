use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use chat_console::ai::ORACLE_FALLBACK_ANSWER;
use chat_console::app::{build_router, build_state, USER_HEADER};
use chat_console::config::AppConfig;

fn build_app(config: AppConfig) -> Router {
    build_router(build_state(config, None))
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn add_user(app: &Router, id: &str, name: &str, user_type: &str, role_id: &str) {
    let (status, _) = call(
        app,
        "POST",
        "/api/users",
        Some("admin"),
        Some(json!({
            "id": id,
            "name": name,
            "email": format!("{id}@example.com"),
            "userType": user_type,
            "roleId": role_id
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn team_app() -> Router {
    let app = build_app(AppConfig::default());
    add_user(&app, "ana", "Ana Lima", "AGENT_HUMAN", "role-agent").await;
    add_user(&app, "bob", "Bob Reis", "AGENT_HUMAN", "role-agent").await;
    add_user(&app, "cleo", "Cleo Mota", "AGENT_HUMAN", "role-agent").await;
    add_user(&app, "sup", "Sara Prado", "SUPERVISOR", "role-supervisor").await;
    app
}

#[tokio::test]
async fn health_reports_ok() {
    let app = build_app(AppConfig::default());
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn acting_user_must_be_named_and_known() {
    let app = build_app(AppConfig::default());
    let (status, body) = call(&app, "GET", "/api/chats", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("x-user-id"));

    let (status, _) = call(&app, "GET", "/api/chats", Some("ghost"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_lifecycle_through_the_api() {
    let app = team_app().await;

    let (status, ingested) = call(
        &app,
        "POST",
        "/api/inbound",
        None,
        Some(json!({
            "customerName": "Carla",
            "customerPhone": "+55 11 90000-0001",
            "content": "Olá, meu pedido atrasou"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ingested["created"], true);
    assert_eq!(ingested["chat"]["queueId"], "queue-pre-service");
    assert_eq!(ingested["chat"]["unreadCount"], 1);
    let chat_id = ingested["chat"]["id"].as_str().unwrap().to_string();

    let (_, listed) = call(&app, "GET", "/api/chats", Some("ana"), None).await;
    assert_eq!(listed["chats"].as_array().unwrap().len(), 1);

    let (status, claimed) = call(
        &app,
        "PATCH",
        &format!("/api/chats/{chat_id}/assignee"),
        Some("ana"),
        Some(json!({ "agentId": "ana" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["chat"]["status"], "IN_PROGRESS");
    assert_eq!(claimed["chat"]["assignedTo"], "ana");

    let (_, listed) = call(&app, "GET", "/api/chats", Some("cleo"), None).await;
    assert!(listed["chats"].as_array().unwrap().is_empty());

    let (status, sent) = call(
        &app,
        "POST",
        &format!("/api/chats/{chat_id}/messages"),
        Some("bob"),
        Some(json!({ "content": "@ana offer the refund", "type": "whisper" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["message"]["targetAgentId"], "ana");

    let (_, for_ana) = call(&app, "GET", &format!("/api/chats/{chat_id}"), Some("ana"), None).await;
    let (_, for_cleo) =
        call(&app, "GET", &format!("/api/chats/{chat_id}"), Some("cleo"), None).await;
    let whispers = |chat: &Value| {
        chat["chat"]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["type"] == "whisper")
            .count()
    };
    assert_eq!(whispers(&for_ana), 1);
    assert_eq!(whispers(&for_cleo), 0);

    let (_, customer) = call(
        &app,
        "GET",
        &format!("/api/chats/{chat_id}/customer-messages"),
        Some("ana"),
        None,
    )
    .await;
    let customer = customer["messages"].as_array().unwrap();
    assert!(customer.iter().all(|m| m["type"] != "whisper" && m["sender"] != "system"));

    let (_, board) = call(
        &app,
        "GET",
        "/api/queues/queue-pre-service/board",
        Some("ana"),
        None,
    )
    .await;
    assert_eq!(board["lanes"][1]["column"]["id"], "in-progress");
    assert_eq!(board["lanes"][1]["chats"][0]["id"], chat_id.as_str());

    let (status, resolved) = call(
        &app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some("ana"),
        Some(json!({ "status": "RESOLVED" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["chat"]["unreadCount"], 0);

    let reopen = json!({ "status": "WAITING" });
    let (status, _) = call(
        &app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some("ana"),
        Some(reopen.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, reopened) = call(
        &app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some("sup"),
        Some(reopen),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reopened["chat"]["status"], "WAITING");
}

#[tokio::test]
async fn console_cannot_open_a_second_live_chat_for_a_phone() {
    let app = team_app().await;
    let (_, ingested) = call(
        &app,
        "POST",
        "/api/inbound",
        None,
        Some(json!({ "customerPhone": "+1 555 0100", "content": "hello?" })),
    )
    .await;
    assert_eq!(ingested["created"], true);

    let (status, body) = call(
        &app,
        "POST",
        "/api/chats",
        Some("ana"),
        Some(json!({
            "customerName": "Carla",
            "customerPhone": "15550100",
            "queueId": "queue-pre-service",
            "initialMessage": "following up"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("open chat"));

    let (_, listed) = call(&app, "GET", "/api/chats", Some("admin"), None).await;
    assert_eq!(listed["chats"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn whisper_text_never_reaches_other_agents_previews() {
    let app = team_app().await;
    let (_, ingested) = call(
        &app,
        "POST",
        "/api/inbound",
        None,
        Some(json!({ "customerPhone": "+1 555 0101", "content": "where is my order" })),
    )
    .await;
    let chat_id = ingested["chat"]["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        "POST",
        &format!("/api/chats/{chat_id}/messages"),
        Some("bob"),
        Some(json!({ "content": "SECRET internal note", "type": "whisper", "targetAgentId": "ana" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, listed) = call(&app, "GET", "/api/chats", Some("cleo"), None).await;
    assert_eq!(listed["chats"][0]["lastMessagePreview"], "where is my order");
    let (_, chat) = call(&app, "GET", &format!("/api/chats/{chat_id}"), Some("cleo"), None).await;
    assert!(!chat.to_string().contains("SECRET"));
}

#[tokio::test]
async fn chat_patch_rejects_fields_outside_the_patch_type() {
    let app = team_app().await;
    let (_, ingested) = call(
        &app,
        "POST",
        "/api/inbound",
        None,
        Some(json!({ "customerPhone": "123", "content": "hi" })),
    )
    .await;
    let chat_id = ingested["chat"]["id"].as_str().unwrap().to_string();
    let (status, _) = call(
        &app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some("sup"),
        Some(json!({ "unreadCount": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn agents_need_permission_for_admin_and_foreign_assignment() {
    let app = team_app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/queues",
        Some("ana"),
        Some(json!({ "name": "Sales" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().ends_with("lacks admin:queues"));

    let (status, queue) = call(
        &app,
        "POST",
        "/api/queues",
        Some("admin"),
        Some(json!({ "name": "Sales" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(queue["queue"]["isActive"], true);
}

#[tokio::test]
async fn ai_model_tokens_never_leave_unmasked() {
    let app = build_app(AppConfig::default());
    let (status, created) = call(
        &app,
        "POST",
        "/api/ai-models",
        Some("admin"),
        Some(json!({
            "name": "Support model",
            "provider": "openai",
            "apiToken": "sk-live-abcdefghijklmnop"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = created["aiModel"]["apiToken"].as_str().unwrap();
    assert!(token.starts_with("****mnop#"));

    let (_, listed) = call(&app, "GET", "/api/ai-models", Some("admin"), None).await;
    assert!(!listed.to_string().contains("sk-live"));
}

#[tokio::test]
async fn oracle_falls_back_without_a_model() {
    let app = build_app(AppConfig::default());
    let (status, body) = call(
        &app,
        "POST",
        "/api/oracle",
        Some("admin"),
        Some(json!({ "question": "What is the refund window?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], ORACLE_FALLBACK_ANSWER);
}

#[tokio::test]
async fn whatsapp_webhook_handshake_and_delivery() {
    let app = build_app(AppConfig {
        whatsapp_verify_token: Some("verify-me".to_string()),
        ..AppConfig::default()
    });

    let request = Request::builder()
        .uri("/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=4242")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"4242");

    let (status, _) = call(
        &app,
        "GET",
        "/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let delivery = json!({
        "entry": [{
            "changes": [{
                "value": {
                    "contacts": [{ "wa_id": "5511977776666", "profile": { "name": "Davi" } }],
                    "messages": [
                        { "from": "5511977776666", "id": "wamid.X", "type": "text", "text": { "body": "bom dia" } },
                        { "from": "5511977776666", "id": "wamid.X", "type": "text", "text": { "body": "bom dia" } }
                    ]
                }
            }]
        }]
    });
    let (status, body) = call(
        &app,
        "POST",
        "/api/webhooks/whatsapp",
        None,
        Some(delivery),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 2);

    let (_, listed) = call(&app, "GET", "/api/chats", Some("admin"), None).await;
    let chats = listed["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["customerName"], "Davi");
    assert_eq!(chats[0]["messageCount"], 1);
}
