//! One end-to-end run: collect messages, generate cards, package the deck,
//! upload it and clean up.

use crate::cards::{CardGenerator, GeneratedCards};
use crate::config::Config;
use crate::deck::{self, DeckBuilder};
use crate::drive_api::{DriveClient, ServiceAccountKey};
use crate::error::Result;
use crate::gemini_api::{GeminiClient, TextGenerator};
use crate::inbox::Inbox;
use crate::telegram_api::{TelegramClient, escape_html};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telegram2anki_types::{InboxMessage, MessageSource, RunStatus, RunSummary};

/// Where the deck goes once it is written
#[derive(Clone, Debug)]
pub struct DriveSettings {
    pub api_base: String,
    pub credentials: String,
    pub folder_id: Option<String>,
}

/// Everything a run needs, built once per process
pub struct RunContext<G> {
    pub telegram: TelegramClient,
    pub cards: CardGenerator<G>,
    pub inbox: Arc<Inbox>,
    pub drive: DriveSettings,
    pub deck_name: String,
    pub pending_file: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Write the deck but skip upload and cleanup
    pub dry_run: bool,
    pub output_dir: Option<PathBuf>,
}

impl RunContext<GeminiClient> {
    pub fn from_config(config: &Config, inbox: Arc<Inbox>) -> Result<Self> {
        let telegram = TelegramClient::new(
            &config.telegram.api_base,
            &config.telegram.bot_token,
            config.telegram.chat_id,
        );
        let gemini = GeminiClient::new(
            &config.gemini_api_base,
            &config.gemini_api_key,
            &config.gemini_model,
        )?;
        log::info!("[PIPELINE] Using Gemini model {}", gemini.model());

        Ok(Self {
            telegram,
            cards: CardGenerator::new(gemini),
            inbox,
            drive: DriveSettings {
                api_base: config.drive_api_base.clone(),
                credentials: config.gdrive_credentials.clone(),
                folder_id: config.gdrive_folder_id.clone(),
            },
            deck_name: config.deck_name.clone(),
            pending_file: config.pending_file.clone(),
            output_dir: config.output_dir.clone(),
        })
    }
}

/// Runs the pipeline once and records the outcome in the run history.
///
/// A failed run is stored with its error text and announced in the chat on a
/// best-effort basis before the error is returned.
pub async fn run_once<G: TextGenerator>(ctx: &RunContext<G>, options: &RunOptions) -> Result<RunSummary> {
    let run_id = ctx.inbox.start_run()?;
    log::info!("[PIPELINE] Run {} started{}", run_id, if options.dry_run { " (dry run)" } else { "" });

    match execute(ctx, options, run_id).await {
        Ok(summary) => {
            ctx.inbox.finish_run(&summary, None)?;
            log::info!(
                "[PIPELINE] Run {} finished: {} ({} messages, {} cards)",
                run_id,
                summary.status,
                summary.messages_processed,
                summary.cards_added
            );
            Ok(summary)
        }
        Err(e) => {
            log::error!("[PIPELINE] Run {} failed: {}", run_id, e);
            let error_text = e.to_string();
            if let Err(db_err) = ctx
                .inbox
                .finish_run(&RunSummary::new(run_id, RunStatus::Failed), Some(&error_text))
            {
                log::error!("[PIPELINE] Could not record failed run: {}", db_err);
            }

            let notice = format!(
                "❌ <b>Telegram2Anki</b>\n\nLa ejecución semanal falló:\n<code>{}</code>",
                escape_html(&error_text)
            );
            if let Err(notify_err) = ctx.telegram.send_message(&notice).await {
                log::warn!("[PIPELINE] Could not send failure notice: {}", notify_err);
            }
            Err(e)
        }
    }
}

async fn execute<G: TextGenerator>(
    ctx: &RunContext<G>,
    options: &RunOptions,
    run_id: i64,
) -> Result<RunSummary> {
    let chat_id = ctx.telegram.chat_id();

    // 1. Collect
    let fetched = match ctx.telegram.fetch_recent_messages().await {
        Ok(messages) => messages,
        // 409 while the listener polls, 5xx and the like: the inbox and the
        // pending file still hold this week's messages. A rejected token aborts.
        Err(e) if e.status_code.is_some() && !e.is_auth_error() => {
            log::warn!("[PIPELINE] {}; continuing with the inbox and pending file", e);
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    let new_from_telegram = ctx.inbox.insert_messages(&fetched)?;
    log::info!(
        "[PIPELINE] {} messages from Telegram ({} new)",
        fetched.len(),
        new_from_telegram
    );

    let imported = ctx.inbox.import_pending_file(&ctx.pending_file, chat_id)?;
    if imported > 0 {
        log::info!(
            "[PIPELINE] Imported {} messages from {}",
            imported,
            ctx.pending_file.display()
        );
        // The inbox owns these lines now; keeping the file would import them again
        remove_pending_file(&ctx.pending_file);
    }

    let messages = ctx.inbox.list_unprocessed(chat_id)?;
    let mut summary = RunSummary::new(run_id, RunStatus::Running);
    summary.messages_processed = messages.len();

    if messages.is_empty() {
        log::info!("[PIPELINE] No new messages");
        notify(ctx, "ℹ️ <b>Telegram2Anki</b>\n\nNo hay mensajes nuevos esta semana.").await;
        summary.status = RunStatus::Empty;
        return Ok(summary);
    }

    // 2. Generate
    log::info!("[PIPELINE] Generating cards for {} messages", messages.len());
    let generated = ctx.cards.generate_for_messages(&messages).await;
    summary.cards_generated = generated.iter().map(|g| g.cards.len()).sum();

    if summary.cards_generated == 0 {
        log::warn!("[PIPELINE] No cards were generated; messages stay pending");
        notify(ctx, "⚠️ <b>Telegram2Anki</b>\n\nNo se pudieron generar tarjetas esta semana.").await;
        summary.status = RunStatus::NoCards;
        return Ok(summary);
    }

    // 3. Package
    let output_dir = options.output_dir.as_deref().unwrap_or(&ctx.output_dir);
    let (deck_file, deck_path, cards_added) = write_deck(&ctx.deck_name, &generated, output_dir)?;
    log::info!("[PIPELINE] Deck saved: {} ({} cards)", deck_path.display(), cards_added);
    summary.cards_added = cards_added;
    summary.deck_file = Some(deck_file.clone());
    summary.deck_path = Some(deck_path.display().to_string());

    if options.dry_run {
        log::info!("[PIPELINE] Dry run: skipping upload and cleanup");
        summary.status = RunStatus::DryRun;
        return Ok(summary);
    }

    // 4. Upload
    let key = ServiceAccountKey::from_json(&ctx.drive.credentials)?;
    let drive = DriveClient::connect(&ctx.drive.api_base, &key, ctx.drive.folder_id.clone()).await?;
    let file_id = drive.upload_file(&deck_path, &deck_file).await?;
    log::info!("[PIPELINE] Uploaded to Drive (ID: {})", file_id);
    summary.drive_file_id = Some(file_id);

    // 5. Cleanup
    summary.telegram_messages_deleted = cleanup(ctx, &messages).await?;

    let confirmation = format!(
        "✅ <b>Telegram2Anki</b>\n\n\
         Se generaron <b>{}</b> tarjetas nuevas a partir de {} mensajes.\n\
         Archivo: <code>{}</code>\n\n\
         Sincroniza la carpeta de Drive para importarlo.",
        summary.cards_added,
        summary.messages_processed,
        escape_html(&deck_file)
    );
    notify(ctx, &confirmation).await;

    summary.status = RunStatus::Completed;
    Ok(summary)
}

fn write_deck(
    deck_name: &str,
    generated: &[GeneratedCards],
    output_dir: &Path,
) -> Result<(String, PathBuf, usize)> {
    let mut builder = DeckBuilder::new(deck_name).with_description("Datos recogidos desde Telegram");
    let mut added = 0;
    for batch in generated {
        added += builder.add_cards(&batch.cards);
    }

    log::info!(
        "[PIPELINE] Deck '{}': {} notes, {} cards",
        builder.name(),
        builder.note_count(),
        builder.card_count()
    );

    std::fs::create_dir_all(output_dir)?;
    let deck_file = deck::deck_file_name(deck_name, chrono::Utc::now().date_naive());
    let deck_path = output_dir.join(&deck_file);
    builder.write_package(&deck_path)?;

    Ok((deck_file, deck_path, added))
}

/// Marks the run's messages processed and removes them from Telegram.
/// Returns how many chat messages were deleted.
async fn cleanup<G>(ctx: &RunContext<G>, messages: &[InboxMessage]) -> Result<usize> {
    let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
    let marked = ctx.inbox.mark_processed(&ids)?;
    log::info!("[PIPELINE] Marked {} inbox messages processed", marked);

    let mut deleted = 0;
    for message in messages {
        if message.source == MessageSource::File {
            continue;
        }
        if let Some(message_id) = message.telegram_message_id {
            if ctx.telegram.delete_message(message_id).await {
                deleted += 1;
            }
        }
    }
    log::info!("[PIPELINE] Deleted {} messages from Telegram", deleted);

    if let Some(last_update_id) = messages.iter().filter_map(|m| m.update_id).max() {
        if let Err(e) = ctx.telegram.acknowledge_updates(last_update_id).await {
            log::warn!("[PIPELINE] Could not acknowledge updates: {}", e);
        }
    }

    Ok(deleted)
}

fn remove_pending_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("[PIPELINE] Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[PIPELINE] Could not remove {}: {}", path.display(), e),
    }
}

async fn notify<G>(ctx: &RunContext<G>, text: &str) {
    if let Err(e) = ctx.telegram.send_message(text).await {
        log::warn!("[PIPELINE] Could not send notification: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telegram2anki_types::Flashcard;

    #[test]
    fn test_write_deck_counts_only_packaged_cards() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("out");
        let generated = vec![
            GeneratedCards {
                message_id: 1,
                cards: vec![Flashcard::basic("Q1", "A1"), Flashcard::cloze("{{c1::x}} y")],
            },
            GeneratedCards {
                message_id: 2,
                cards: vec![Flashcard::basic("Q2", "")],
            },
        ];

        let (file, path, added) = write_deck("Datos", &generated, &out).unwrap();
        assert_eq!(added, 2);
        assert!(file.starts_with("datos_"));
        assert_eq!(path, out.join(&file));
        assert!(path.exists());
    }

    #[test]
    fn test_remove_pending_file_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_messages.txt");
        remove_pending_file(&path);

        std::fs::write(&path, "fact\n").unwrap();
        remove_pending_file(&path);
        assert!(!path.exists());
    }
}
