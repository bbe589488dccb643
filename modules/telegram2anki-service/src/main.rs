//! telegram2anki: weekly Telegram → Anki deck automation.
//!
//! `run` (default) performs one collection/generation/upload cycle, `listen`
//! keeps a long-polling bot storing messages as they arrive, `schedule` repeats
//! `run` on a cron schedule and `pending` shows what the next run will process.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use telegram2anki::cards::preview;
use telegram2anki::config::{self, Config, TelegramConfig};
use telegram2anki::error::Result;
use telegram2anki::inbox::Inbox;
use telegram2anki::listener;
use telegram2anki::pipeline::{self, RunContext, RunOptions};
use telegram2anki::scheduler;
use telegram2anki::telegram_api::TelegramClient;

#[derive(Parser)]
#[command(name = "telegram2anki", version, about = "Turn Telegram messages into Anki decks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Collect messages, generate cards, upload the deck and clean up
    Run {
        /// Write the deck locally without uploading or cleaning up
        #[arg(long)]
        dry_run: bool,
        /// Directory for the generated deck
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Run the bot that stores messages as they arrive
    Listen,
    /// Run on a cron schedule (six fields, seconds first)
    Schedule {
        #[arg(long, value_name = "EXPR", env = "SCHEDULE_CRON")]
        cron: Option<String>,
    },
    /// Show pending inbox messages and recent runs
    Pending,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        dry_run: false,
        output_dir: None,
    });

    match execute(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run { dry_run, output_dir } => {
            let config = Config::from_env()?;
            let ctx = build_context(&config)?;
            let summary = pipeline::run_once(&ctx, &RunOptions { dry_run, output_dir }).await?;

            println!(
                "Run {}: {} ({} messages, {} cards)",
                summary.run_id, summary.status, summary.messages_processed, summary.cards_added
            );
            if let Some(path) = &summary.deck_path {
                println!("Deck: {}", path);
            }
            if let Some(file_id) = &summary.drive_file_id {
                println!("Drive file: {}", file_id);
            }
            Ok(())
        }
        Command::Listen => {
            let telegram = TelegramConfig::from_env()?;
            let inbox = open_inbox(&config::database_path_from_env())?;
            let client = TelegramClient::new(&telegram.api_base, &telegram.bot_token, telegram.chat_id);
            listener::run_listener(client, inbox).await
        }
        Command::Schedule { cron } => {
            let config = Config::from_env()?;
            let schedule = scheduler::parse_schedule(cron.as_deref().unwrap_or(&config.schedule))?;
            let ctx = build_context(&config)?;
            log::info!("[SCHEDULER] Started");
            scheduler::run_scheduler(&ctx, schedule).await
        }
        Command::Pending => {
            let telegram = TelegramConfig::from_env()?;
            let inbox = open_inbox(&config::database_path_from_env())?;
            print_pending(&inbox, telegram.chat_id)
        }
    }
}

fn build_context(config: &Config) -> Result<RunContext<telegram2anki::gemini_api::GeminiClient>> {
    let inbox = open_inbox(&config.database_path)?;
    RunContext::from_config(config, inbox)
}

fn open_inbox(path: &str) -> Result<Arc<Inbox>> {
    log::info!("Opening database at: {}", path);
    Ok(Arc::new(Inbox::open(path)?))
}

fn print_pending(inbox: &Inbox, chat_id: i64) -> Result<()> {
    let pending = inbox.list_unprocessed(chat_id)?;
    println!("Pending messages: {}", pending.len());
    for message in &pending {
        println!(
            "  #{:<5} [{}] {}",
            message.id,
            message.source,
            preview(&message.text, 70)
        );
    }

    let runs = inbox.recent_runs(5)?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for run in &runs {
            println!(
                "  #{:<5} {} {:<10} {} messages, {} cards{}",
                run.id,
                run.started_at,
                run.status.as_str(),
                run.message_count,
                run.card_count,
                run.error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}
