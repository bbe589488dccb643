//! Long-polling bot that stores messages in the inbox as they arrive.
//!
//! Telegram forgets unconfirmed updates after about a day, so running the
//! listener keeps facts sent early in the week from being lost before the
//! weekly run.

use crate::cards::preview;
use crate::error::Result;
use crate::inbox::Inbox;
use crate::telegram_api::{TelegramClient, Update, escape_html, incoming_from_update};
use std::sync::Arc;
use std::time::Duration;
use telegram2anki_types::MessageSource;

/// `bot_state` key holding the next `getUpdates` offset
pub const OFFSET_KEY: &str = "listener_next_offset";

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_LIMIT: u32 = 100;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

const PENDING_PREVIEW_COUNT: usize = 10;
const PENDING_PREVIEW_CHARS: usize = 50;

pub const START_TEXT: &str = "👋 ¡Hola! Soy tu bot de Telegram2Anki.\n\n\
📝 Mándame cualquier dato que quieras recordar.\n\
Cada semana lo convertiré en tarjetas de Anki.\n\n\
Comandos:\n\
/start - Muestra este mensaje\n\
/pending - Lista los mensajes pendientes\n\
/clear - Descarta los mensajes pendientes";

pub const SAVED_TEXT: &str = "✅ Guardado para Anki";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Pending,
    Clear,
}

impl Command {
    /// Accepts `/pending` as well as `/pending@my_bot`.
    fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name {
            "start" | "help" => Some(Command::Start),
            "pending" => Some(Command::Pending),
            "clear" => Some(Command::Clear),
            _ => None,
        }
    }
}

/// Handles one update and returns the reply to send, if any.
pub fn handle_update(inbox: &Inbox, chat_id: i64, update: &Update) -> Result<Option<String>> {
    let Some(message) = update.message.as_ref() else {
        return Ok(None);
    };
    if message.chat.id != chat_id {
        log::debug!("[LISTENER] Ignoring message from chat {}", message.chat.id);
        return Ok(None);
    }
    let Some(text) = message.text.as_deref() else {
        return Ok(None);
    };

    if text.trim_start().starts_with('/') {
        return match Command::parse(text.trim_start()) {
            Some(Command::Start) => Ok(Some(START_TEXT.to_string())),
            Some(Command::Pending) => Ok(Some(pending_reply(inbox, chat_id)?)),
            Some(Command::Clear) => {
                let cleared = inbox.clear_unprocessed(chat_id)?;
                log::info!("[LISTENER] Cleared {} pending messages", cleared);
                Ok(Some(format!("🧹 Descartados {} mensajes pendientes.", cleared)))
            }
            None => Ok(None),
        };
    }

    let Some(incoming) = incoming_from_update(update, chat_id, MessageSource::Listener) else {
        return Ok(None);
    };
    match inbox.insert_message(&incoming)? {
        Some(id) => {
            log::info!("[LISTENER] Stored message {}: {}", id, preview(&incoming.text, 50));
            Ok(Some(SAVED_TEXT.to_string()))
        }
        None => Ok(None),
    }
}

/// `/pending` answer: the count plus previews of the most recent messages.
fn pending_reply(inbox: &Inbox, chat_id: i64) -> Result<String> {
    let pending = inbox.list_unprocessed(chat_id)?;
    if pending.is_empty() {
        return Ok("📭 No hay mensajes pendientes.".to_string());
    }

    let mut text = format!("📬 <b>Mensajes pendientes: {}</b>\n\n", pending.len());
    let skip = pending.len().saturating_sub(PENDING_PREVIEW_COUNT);
    for (i, message) in pending.iter().skip(skip).enumerate() {
        text.push_str(&format!(
            "{}. {}\n",
            i + 1,
            escape_html(&preview(&message.text, PENDING_PREVIEW_CHARS))
        ));
    }
    if skip > 0 {
        text.push_str(&format!("\n<i>...y {} más</i>", skip));
    }
    Ok(text)
}

fn load_offset(inbox: &Inbox) -> Option<i64> {
    inbox
        .get_state(OFFSET_KEY)
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
}

/// Polls forever. Only returns on errors that retrying can't fix (bad token,
/// unusable database).
pub async fn run_listener(telegram: TelegramClient, inbox: Arc<Inbox>) -> Result<()> {
    let chat_id = telegram.chat_id();
    let mut offset = load_offset(&inbox);
    log::info!(
        "[LISTENER] Listening for messages from chat {} (offset: {:?})",
        chat_id,
        offset
    );

    loop {
        let updates = match telegram.get_updates(offset, POLL_LIMIT, POLL_TIMEOUT_SECS).await {
            Ok(updates) => updates,
            Err(e) if e.is_auth_error() => return Err(e.into()),
            Err(e) => {
                log::warn!("[LISTENER] Poll failed: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        for update in &updates {
            if let Some(reply) = handle_update(&inbox, chat_id, update)? {
                if let Err(e) = telegram.send_message(&reply).await {
                    log::warn!("[LISTENER] Could not reply: {}", e);
                }
            }

            let next = update.update_id + 1;
            offset = Some(next);
            inbox.set_state(OFFSET_KEY, &next.to_string())?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_update(update_id: i64, chat_id: i64, message_id: i64, text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "date": 1760000000,
                "chat": {"id": chat_id, "type": "private"},
                "text": text,
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/pending@telegram2anki_bot"), Some(Command::Pending));
        assert_eq!(Command::parse("/clear now"), Some(Command::Clear));
        assert_eq!(Command::parse("/unknown"), None);
        assert_eq!(Command::parse("plain text"), None);
    }

    #[test]
    fn test_text_is_saved_once() {
        let inbox = Inbox::open(":memory:").unwrap();
        let update = text_update(1, 42, 7, "Bananas are berries");

        let reply = handle_update(&inbox, 42, &update).unwrap();
        assert_eq!(reply.as_deref(), Some(SAVED_TEXT));
        // Redelivered update is not stored or acknowledged twice
        assert!(handle_update(&inbox, 42, &update).unwrap().is_none());

        let pending = inbox.list_unprocessed(42).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source, MessageSource::Listener);
        assert_eq!(pending[0].telegram_message_id, Some(7));
    }

    #[test]
    fn test_other_chats_ignored() {
        let inbox = Inbox::open(":memory:").unwrap();
        let update = text_update(1, 99, 1, "not for us");
        assert!(handle_update(&inbox, 42, &update).unwrap().is_none());
        assert_eq!(inbox.count_unprocessed(99).unwrap(), 0);
    }

    #[test]
    fn test_start_and_unknown_commands() {
        let inbox = Inbox::open(":memory:").unwrap();
        let reply = handle_update(&inbox, 42, &text_update(1, 42, 1, "/start")).unwrap();
        assert!(reply.unwrap().contains("/pending"));
        assert!(handle_update(&inbox, 42, &text_update(2, 42, 2, "/foo")).unwrap().is_none());
        assert_eq!(inbox.count_unprocessed(42).unwrap(), 0);
    }

    #[test]
    fn test_pending_lists_last_ten() {
        let inbox = Inbox::open(":memory:").unwrap();
        let empty = handle_update(&inbox, 42, &text_update(1, 42, 1, "/pending")).unwrap();
        assert!(empty.unwrap().contains("No hay mensajes pendientes"));

        for i in 0..12 {
            handle_update(&inbox, 42, &text_update(10 + i, 42, 10 + i, &format!("fact <{}>", i))).unwrap();
        }
        let long = "x".repeat(80);
        handle_update(&inbox, 42, &text_update(50, 42, 50, &long)).unwrap();

        let reply = handle_update(&inbox, 42, &text_update(51, 42, 51, "/pending"))
            .unwrap()
            .unwrap();
        assert!(reply.contains("Mensajes pendientes: 13"));
        assert!(!reply.contains("fact &lt;2&gt;"));
        assert!(reply.contains("1. fact &lt;3&gt;"));
        assert!(reply.contains(&format!("10. {}...", "x".repeat(50))));
        assert!(reply.contains("...y 3 más"));
    }

    #[test]
    fn test_clear_drops_pending() {
        let inbox = Inbox::open(":memory:").unwrap();
        handle_update(&inbox, 42, &text_update(1, 42, 1, "one")).unwrap();
        handle_update(&inbox, 42, &text_update(2, 42, 2, "two")).unwrap();

        let reply = handle_update(&inbox, 42, &text_update(3, 42, 3, "/clear")).unwrap();
        assert_eq!(reply.as_deref(), Some("🧹 Descartados 2 mensajes pendientes."));
        assert_eq!(inbox.count_unprocessed(42).unwrap(), 0);
    }

    #[test]
    fn test_offset_roundtrip_through_state() {
        let inbox = Inbox::open(":memory:").unwrap();
        assert_eq!(load_offset(&inbox), None);
        inbox.set_state(OFFSET_KEY, "1234").unwrap();
        assert_eq!(load_offset(&inbox), Some(1234));
    }
}
