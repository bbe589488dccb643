//! Telegram Bot API client.
//!
//! Collects the messages forwarded to the bot and sends run notifications back
//! to the same chat. Only the handful of methods the service needs are covered.

use crate::error::ApiError;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use telegram2anki_types::{IncomingMessage, MessageSource};

const SERVICE: &str = "telegram";

/// `getUpdates` keeps at most this many pending updates around
const MAX_UPDATES: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
    chat_id: i64,
}

impl TelegramClient {
    pub fn new(base_url: &str, token: &str, chat_id: i64) -> Self {
        Self {
            client: crate::http::shared_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id,
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Raw `getUpdates`. A negative offset returns the last `-offset` updates.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        limit: u32,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, ApiError> {
        let mut params = json!({
            "limit": limit.min(MAX_UPDATES),
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }

        // The HTTP request has to outlive the long-poll window
        let request_timeout = Duration::from_secs(timeout_secs + 15);
        self.call("getUpdates", &params, Some(request_timeout)).await
    }

    /// Text messages currently held by Telegram for the configured chat.
    ///
    /// Commands and non-text messages are skipped. Telegram only keeps
    /// unconfirmed updates for about 24 hours, which is why the listener and
    /// the pending-messages file exist as well.
    pub async fn fetch_recent_messages(&self) -> Result<Vec<IncomingMessage>, ApiError> {
        let updates = self
            .get_updates(Some(-(MAX_UPDATES as i64)), MAX_UPDATES, 0)
            .await?;

        let messages: Vec<IncomingMessage> = updates
            .iter()
            .filter_map(|u| incoming_from_update(u, self.chat_id, MessageSource::Telegram))
            .collect();

        log::info!(
            "[TELEGRAM] {} updates pending, {} usable messages for chat {}",
            updates.len(),
            messages.len(),
            self.chat_id
        );
        Ok(messages)
    }

    /// Confirms every update up to and including `last_update_id` so Telegram
    /// stops returning them.
    pub async fn acknowledge_updates(&self, last_update_id: i64) -> Result<(), ApiError> {
        let _: Vec<Update> = self.get_updates(Some(last_update_id + 1), 1, 0).await?;
        log::debug!("[TELEGRAM] Acknowledged updates up to {}", last_update_id);
        Ok(())
    }

    /// Sends an HTML-formatted message to the configured chat.
    pub async fn send_message(&self, text: &str) -> Result<(), ApiError> {
        let params = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let _: Value = self.call("sendMessage", &params, None).await?;
        Ok(())
    }

    /// Deletes a message from the chat. Returns false instead of failing; bots
    /// cannot delete messages older than 48 hours and that is not worth
    /// aborting a run for.
    pub async fn delete_message(&self, message_id: i64) -> bool {
        let params = json!({
            "chat_id": self.chat_id,
            "message_id": message_id,
        });
        match self.call::<Value>("deleteMessage", &params, None).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[TELEGRAM] Could not delete message {}: {}", message_id, e);
                false
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, ApiError> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);

        let mut request = self.client.post(&url).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("{} request failed: {}", method, redact(&e.to_string(), &self.token))))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Failed to read {} response: {}", method, e)))?;

        parse_envelope(method, status.as_u16(), &body)
    }
}

/// Unwraps Telegram's `{"ok": .., "result": ..}` envelope.
fn parse_envelope<T: DeserializeOwned>(method: &str, status: u16, body: &str) -> Result<T, ApiError> {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(_) => {
            return Err(ApiError::with_status(
                SERVICE,
                format!("{} returned a non-JSON body: {}", method, truncate(body, 200)),
                status,
            ));
        }
    };

    if !envelope.ok || !(200..300).contains(&status) {
        let description = envelope.description.unwrap_or_else(|| "Unknown error".to_string());
        return Err(ApiError::with_status(
            SERVICE,
            format!("{}: {}", method, description),
            envelope.error_code.unwrap_or(status),
        ));
    }

    let result = envelope
        .result
        .ok_or_else(|| ApiError::new(SERVICE, format!("{} returned ok but no result", method)))?;

    serde_json::from_value(result)
        .map_err(|e| ApiError::new(SERVICE, format!("Unexpected {} result: {}", method, e)))
}

/// Turns an update into an inbox candidate if it is a plain text message from
/// `chat_id`.
pub fn incoming_from_update(
    update: &Update,
    chat_id: i64,
    source: MessageSource,
) -> Option<IncomingMessage> {
    let message = update.message.as_ref()?;
    if message.chat.id != chat_id {
        return None;
    }
    let text = message.text.as_deref()?.trim();
    if text.is_empty() || text.starts_with('/') {
        return None;
    }

    Some(IncomingMessage {
        source,
        chat_id,
        telegram_message_id: Some(message.message_id),
        update_id: Some(update.update_id),
        text: text.to_string(),
        sent_at: Utc
            .timestamp_opt(message.date, 0)
            .single()
            .map(|t| t.to_rfc3339()),
    })
}

/// Escapes text for messages sent with `parse_mode = HTML`.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn redact(message: &str, token: &str) -> String {
    if token.is_empty() {
        message.to_string()
    } else {
        message.replace(token, "<token>")
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_text_message_from_configured_chat() {
        let u = update(
            r#"{"update_id": 10, "message": {"message_id": 5, "date": 1700000000,
                "chat": {"id": 42, "type": "private"}, "text": "  Octopuses have three hearts  "}}"#,
        );
        let msg = incoming_from_update(&u, 42, MessageSource::Telegram).unwrap();
        assert_eq!(msg.text, "Octopuses have three hearts");
        assert_eq!(msg.telegram_message_id, Some(5));
        assert_eq!(msg.update_id, Some(10));
        assert!(msg.sent_at.unwrap().starts_with("2023-11-14"));
    }

    #[test]
    fn test_commands_other_chats_and_media_skipped() {
        let command = update(
            r#"{"update_id": 1, "message": {"message_id": 1, "date": 0, "chat": {"id": 42}, "text": "/start"}}"#,
        );
        let other_chat = update(
            r#"{"update_id": 2, "message": {"message_id": 2, "date": 0, "chat": {"id": 7}, "text": "hi"}}"#,
        );
        let photo = update(r#"{"update_id": 3, "message": {"message_id": 3, "date": 0, "chat": {"id": 42}}}"#);
        let edited = update(r#"{"update_id": 4, "edited_message": {}}"#);

        for u in [command, other_chat, photo, edited] {
            assert!(incoming_from_update(&u, 42, MessageSource::Telegram).is_none());
        }
    }

    #[test]
    fn test_envelope_error_uses_telegram_code() {
        let body = r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#;
        let err = parse_envelope::<Value>("getUpdates", 401, body).unwrap_err();
        assert_eq!(err.status_code, Some(401));
        assert!(err.message.contains("Unauthorized"));
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_envelope_result_deserialized() {
        let body = r#"{"ok": true, "result": [{"update_id": 3}]}"#;
        let updates: Vec<Update> = parse_envelope("getUpdates", 200, body).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].message.is_none());
    }

    #[test]
    fn test_non_json_body() {
        let err = parse_envelope::<Value>("sendMessage", 502, "<html>Bad Gateway</html>").unwrap_err();
        assert_eq!(err.status_code, Some(502));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_token_redacted() {
        assert_eq!(
            redact("error sending request for url (https://x/bot123:abc/getUpdates)", "123:abc"),
            "error sending request for url (https://x/bot<token>/getUpdates)"
        );
    }
}
