//! WhatsApp Cloud API webhook translation.

use std::collections::HashMap;

use serde_json::Value;

use crate::{dispatcher::InboundEvent, registry::normalize_phone, types::MessageType};

/// Answers the subscription handshake: the challenge when the mode and token
/// match the configured verify token, otherwise `None`.
pub fn verify_subscription(
    params: &HashMap<String, String>,
    expected_token: Option<&str>,
) -> Option<String> {
    let expected = expected_token.map(str::trim).filter(|t| !t.is_empty())?;
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");
    if mode == "subscribe" && !challenge.is_empty() && token == expected {
        Some(challenge.to_string())
    } else {
        None
    }
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        map.insert(digits, name);
    }
    map
}

fn text_at(message: &Value, object: &str, field: &str) -> String {
    message
        .get(object)
        .and_then(|v| v.get(field))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Content and console type of one inbound message; `None` for kinds the
/// console does not show (reactions, status receipts, unknown types).
fn inbound_content(message: &Value) -> Option<(String, MessageType)> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    let (content, kind) = match msg_type.as_str() {
        "text" => (text_at(message, "text", "body"), MessageType::Text),
        "button" => (text_at(message, "button", "text"), MessageType::Text),
        "interactive" => {
            let title = message
                .get("interactive")
                .and_then(|v| {
                    v.get("button_reply")
                        .and_then(|r| r.get("title"))
                        .and_then(Value::as_str)
                        .or_else(|| {
                            v.get("list_reply")
                                .and_then(|r| r.get("title"))
                                .and_then(Value::as_str)
                        })
                })
                .unwrap_or("")
                .trim()
                .to_string();
            (title, MessageType::Text)
        }
        "image" | "sticker" => media_content(message, &msg_type, MessageType::Image),
        "audio" | "voice" => media_content(message, &msg_type, MessageType::Audio),
        "document" | "video" => media_content(message, &msg_type, MessageType::Document),
        "location" => {
            let location = message.get("location")?;
            let lat = location.get("latitude").and_then(Value::as_f64)?;
            let lng = location.get("longitude").and_then(Value::as_f64)?;
            let name = text_at(message, "location", "name");
            let label = if name.is_empty() {
                format!("Location: {lat}, {lng}")
            } else {
                format!("Location: {name} ({lat}, {lng})")
            };
            (label, MessageType::Text)
        }
        _ => return None,
    };

    if content.is_empty() {
        None
    } else {
        Some((content, kind))
    }
}

fn media_content(message: &Value, msg_type: &str, kind: MessageType) -> (String, MessageType) {
    let caption = text_at(message, msg_type, "caption");
    if !caption.is_empty() {
        return (caption, kind);
    }
    let filename = text_at(message, msg_type, "filename");
    if !filename.is_empty() {
        return (filename, kind);
    }
    (format!("[{msg_type}]"), kind)
}

/// Flattens a webhook payload into inbound events, in delivery order.
pub fn inbound_events(payload: &Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let names = contact_profile_names(value);
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let Some(digits) = normalize_phone(from) else {
                    continue;
                };
                let Some((content, message_type)) = inbound_content(&message) else {
                    tracing::debug!(from = %digits, "skipping unsupported whatsapp message");
                    continue;
                };
                let external_message_id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .filter(|id| !id.is_empty());
                events.push(InboundEvent {
                    customer_name: names.get(&digits).cloned().unwrap_or_default(),
                    customer_phone: format!("+{digits}"),
                    content,
                    external_message_id,
                    known_chat_id: None,
                    queue_id: None,
                    message_type: Some(message_type),
                });
            }
        }
    }
    events
}
