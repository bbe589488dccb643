//! Shared types for the telegram2anki service: flashcards, collected messages
//! and run bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

// =====================================================
// Flashcards
// =====================================================

/// A flashcard as produced by the language model.
///
/// Missing fields default to empty; call [`Flashcard::is_valid`] before
/// using a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Flashcard {
    /// Question on the front, answer on the back
    Basic {
        #[serde(default)]
        front: String,
        #[serde(default)]
        back: String,
    },
    /// Text with `{{c1::...}}` deletions
    Cloze {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    /// Any card type we don't know how to package
    #[serde(other)]
    Unknown,
}

impl Flashcard {
    pub fn basic(front: impl Into<String>, back: impl Into<String>) -> Self {
        Flashcard::Basic {
            front: front.into(),
            back: back.into(),
        }
    }

    pub fn cloze(text: impl Into<String>) -> Self {
        Flashcard::Cloze {
            text: text.into(),
            extra: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Flashcard::Basic { .. } => "basic",
            Flashcard::Cloze { .. } => "cloze",
            Flashcard::Unknown => "unknown",
        }
    }

    /// A basic card needs both sides; a cloze card needs a `{{c1::` deletion.
    pub fn is_valid(&self) -> bool {
        match self {
            Flashcard::Basic { front, back } => {
                !front.trim().is_empty() && !back.trim().is_empty()
            }
            Flashcard::Cloze { text, .. } => !text.trim().is_empty() && text.contains("{{c1::"),
            Flashcard::Unknown => false,
        }
    }

    /// Distinct cloze numbers referenced by the card text, ascending.
    /// Empty for non-cloze cards.
    pub fn cloze_ordinals(&self) -> Vec<u32> {
        let text = match self {
            Flashcard::Cloze { text, .. } => text,
            _ => return Vec::new(),
        };

        let mut ordinals = Vec::new();
        let mut rest = text.as_str();
        while let Some(pos) = rest.find("{{c") {
            rest = &rest[pos + 3..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() || !rest[digits.len()..].starts_with("::") {
                continue;
            }
            if let Ok(n) = digits.parse::<u32>() {
                if n > 0 && !ordinals.contains(&n) {
                    ordinals.push(n);
                }
            }
        }
        ordinals.sort_unstable();
        ordinals
    }
}

/// The JSON document the model is asked to answer with.
///
/// Entries stay raw until [`CardBatch::into_valid_cards`] so a single
/// malformed card cannot reject the rest of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardBatch {
    #[serde(default)]
    pub cards: Vec<serde_json::Value>,
}

impl CardBatch {
    /// Decodes each entry on its own, dropping entries that don't decode and
    /// cards that fail [`Flashcard::is_valid`].
    pub fn into_valid_cards(self) -> Vec<Flashcard> {
        self.cards
            .into_iter()
            .filter_map(|value| serde_json::from_value::<Flashcard>(value).ok())
            .filter(Flashcard::is_valid)
            .collect()
    }
}

// =====================================================
// Collected messages
// =====================================================

/// Where an inbox message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    /// Pulled from the bot's pending updates at run time
    Telegram,
    /// Recorded by the long-polling listener
    Listener,
    /// Read from the local pending-messages text file
    File,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Telegram => "telegram",
            MessageSource::Listener => "listener",
            MessageSource::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(MessageSource::Telegram),
            "listener" => Some(MessageSource::Listener),
            "file" => Some(MessageSource::File),
            _ => None,
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message waiting to be turned into flashcards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: i64,
    pub source: MessageSource,
    pub chat_id: i64,
    pub telegram_message_id: Option<i64>,
    pub update_id: Option<i64>,
    pub text: String,
    pub received_at: String,
    pub processed: bool,
    pub processed_at: Option<String>,
}

/// A message as read from an external source, before it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub source: MessageSource,
    pub chat_id: i64,
    pub telegram_message_id: Option<i64>,
    pub update_id: Option<i64>,
    pub text: String,
    /// RFC 3339 timestamp of the original message, if known
    pub sent_at: Option<String>,
}

// =====================================================
// Runs
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Nothing to process
    Empty,
    /// Messages were found but the model produced no usable card
    NoCards,
    /// Deck written locally, nothing uploaded or cleaned up
    DryRun,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Empty => "empty",
            RunStatus::NoCards => "no_cards",
            RunStatus::DryRun => "dry_run",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "empty" => Some(RunStatus::Empty),
            "no_cards" => Some(RunStatus::NoCards),
            "dry_run" => Some(RunStatus::DryRun),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted run history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub message_count: i64,
    pub card_count: i64,
    pub deck_file: Option<String>,
    pub drive_file_id: Option<String>,
    pub error: Option<String>,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub messages_processed: usize,
    pub cards_generated: usize,
    pub cards_added: usize,
    pub deck_file: Option<String>,
    pub deck_path: Option<String>,
    pub drive_file_id: Option<String>,
    pub telegram_messages_deleted: usize,
}

impl RunSummary {
    pub fn new(run_id: i64, status: RunStatus) -> Self {
        Self {
            run_id,
            status,
            messages_processed: 0,
            cards_generated: 0,
            cards_added: 0,
            deck_file: None,
            deck_path: None,
            drive_file_id: None,
            telegram_messages_deleted: 0,
        }
    }
}
