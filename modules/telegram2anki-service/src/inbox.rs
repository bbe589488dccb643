//! SQLite store for collected messages, run history and listener state.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use telegram2anki_types::*;

pub struct Inbox {
    conn: Mutex<Connection>,
}

impl Inbox {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let inbox = Self {
            conn: Mutex::new(conn),
        };
        inbox.create_tables()?;
        Ok(inbox)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock can't leave SQLite half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS inbox_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                telegram_message_id INTEGER,
                update_id INTEGER,
                text TEXT NOT NULL,
                sent_at TEXT,
                received_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT,
                UNIQUE(chat_id, telegram_message_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_inbox_pending ON inbox_messages(chat_id, processed, id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                message_count INTEGER NOT NULL DEFAULT 0,
                card_count INTEGER NOT NULL DEFAULT 0,
                deck_file TEXT,
                drive_file_id TEXT,
                error TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Messages
    // =====================================================

    /// Stores a message. Returns `None` if the same Telegram message was
    /// already stored (messages without a Telegram id are always stored).
    pub fn insert_message(&self, message: &IncomingMessage) -> SqliteResult<Option<i64>> {
        let conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();

        let rows = conn.execute(
            "INSERT OR IGNORE INTO inbox_messages
                (source, chat_id, telegram_message_id, update_id, text, sent_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.source.as_str(),
                message.chat_id,
                message.telegram_message_id,
                message.update_id,
                message.text,
                message.sent_at,
                now,
            ],
        )?;

        if rows == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// Stores a batch, returning how many were new.
    pub fn insert_messages(&self, messages: &[IncomingMessage]) -> SqliteResult<usize> {
        let mut inserted = 0;
        for message in messages {
            if self.insert_message(message)?.is_some() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Unprocessed messages for a chat, oldest first.
    pub fn list_unprocessed(&self, chat_id: i64) -> SqliteResult<Vec<InboxMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, source, chat_id, telegram_message_id, update_id, text,
                    received_at, processed, processed_at
             FROM inbox_messages
             WHERE chat_id = ?1 AND processed = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([chat_id], row_to_message)?;
        rows.collect()
    }

    pub fn count_unprocessed(&self, chat_id: i64) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM inbox_messages WHERE chat_id = ?1 AND processed = 0",
            [chat_id],
            |row| row.get(0),
        )
    }

    pub fn mark_processed(&self, ids: &[i64]) -> SqliteResult<usize> {
        let mut conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE inbox_messages SET processed = 1, processed_at = ?1
                 WHERE id = ?2 AND processed = 0",
            )?;
            for id in ids {
                updated += stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Drops every unprocessed message of a chat, returning how many.
    pub fn clear_unprocessed(&self, chat_id: i64) -> SqliteResult<usize> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM inbox_messages WHERE chat_id = ?1 AND processed = 0",
            [chat_id],
        )
    }

    /// Imports a plain-text file with one message per line. Blank lines are
    /// skipped. Returns how many messages were stored.
    pub fn import_pending_file(&self, path: &Path, chat_id: i64) -> std::io::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let messages: Vec<IncomingMessage> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| IncomingMessage {
                source: MessageSource::File,
                chat_id,
                telegram_message_id: None,
                update_id: None,
                text: line.to_string(),
                sent_at: None,
            })
            .collect();

        self.insert_messages(&messages)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    // =====================================================
    // Runs
    // =====================================================

    pub fn start_run(&self) -> SqliteResult<i64> {
        let conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (started_at, status) VALUES (?1, 'running')",
            [now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, summary: &RunSummary, error: Option<&str>) -> SqliteResult<()> {
        let conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE runs SET finished_at = ?1, status = ?2, message_count = ?3, card_count = ?4,
                    deck_file = ?5, drive_file_id = ?6, error = ?7
             WHERE id = ?8",
            params![
                now,
                summary.status.as_str(),
                summary.messages_processed as i64,
                summary.cards_added as i64,
                summary.deck_file,
                summary.drive_file_id,
                error,
                summary.run_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: i64) -> SqliteResult<Option<RunRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, started_at, finished_at, status, message_count, card_count,
                    deck_file, drive_file_id, error
             FROM runs WHERE id = ?1",
            [id],
            row_to_run,
        )
        .optional()
    }

    pub fn recent_runs(&self, limit: usize) -> SqliteResult<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, status, message_count, card_count,
                    deck_file, drive_file_id, error
             FROM runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_run)?;
        rows.collect()
    }

    // =====================================================
    // Listener state
    // =====================================================

    pub fn get_state(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn();
        conn.query_row("SELECT value FROM bot_state WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
    }

    pub fn set_state(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO bot_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }
}

fn row_to_message(row: &Row) -> SqliteResult<InboxMessage> {
    let source: String = row.get(1)?;
    Ok(InboxMessage {
        id: row.get(0)?,
        source: MessageSource::parse(&source).unwrap_or(MessageSource::Telegram),
        chat_id: row.get(2)?,
        telegram_message_id: row.get(3)?,
        update_id: row.get(4)?,
        text: row.get(5)?,
        received_at: row.get(6)?,
        processed: row.get::<_, i32>(7)? != 0,
        processed_at: row.get(8)?,
    })
}

fn row_to_run(row: &Row) -> SqliteResult<RunRecord> {
    let status: String = row.get(3)?;
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        message_count: row.get(4)?,
        card_count: row.get(5)?,
        deck_file: row.get(6)?,
        drive_file_id: row.get(7)?,
        error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram_message(chat_id: i64, message_id: i64, text: &str) -> IncomingMessage {
        IncomingMessage {
            source: MessageSource::Telegram,
            chat_id,
            telegram_message_id: Some(message_id),
            update_id: Some(1000 + message_id),
            text: text.to_string(),
            sent_at: None,
        }
    }

    #[test]
    fn test_duplicate_telegram_messages_ignored() {
        let inbox = Inbox::open(":memory:").expect("Failed to create test db");

        assert!(inbox.insert_message(&telegram_message(1, 10, "a")).unwrap().is_some());
        assert!(inbox.insert_message(&telegram_message(1, 10, "a")).unwrap().is_none());
        // Same message id in another chat is a different message
        assert!(inbox.insert_message(&telegram_message(2, 10, "a")).unwrap().is_some());

        assert_eq!(inbox.count_unprocessed(1).unwrap(), 1);
        assert_eq!(inbox.count_unprocessed(2).unwrap(), 1);
    }

    #[test]
    fn test_mark_processed_hides_messages() {
        let inbox = Inbox::open(":memory:").unwrap();
        let inserted = inbox
            .insert_messages(&[
                telegram_message(1, 1, "first"),
                telegram_message(1, 2, "second"),
                telegram_message(1, 3, "third"),
            ])
            .unwrap();
        assert_eq!(inserted, 3);

        let pending = inbox.list_unprocessed(1).unwrap();
        assert_eq!(
            pending.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );

        assert_eq!(inbox.mark_processed(&[pending[0].id, pending[2].id]).unwrap(), 2);
        // Already processed rows are not counted twice
        assert_eq!(inbox.mark_processed(&[pending[0].id]).unwrap(), 0);

        let pending = inbox.list_unprocessed(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "second");

        // A processed message re-fetched from Telegram stays processed
        assert!(inbox.insert_message(&telegram_message(1, 1, "first")).unwrap().is_none());
        assert_eq!(inbox.count_unprocessed(1).unwrap(), 1);
    }

    #[test]
    fn test_import_pending_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_messages.txt");
        std::fs::write(&path, "Fact one\n\n   \nFact two  \n").unwrap();

        let inbox = Inbox::open(":memory:").unwrap();
        assert_eq!(inbox.import_pending_file(&path, 7).unwrap(), 2);

        let pending = inbox.list_unprocessed(7).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].text, "Fact two");
        assert_eq!(pending[1].source, MessageSource::File);
        assert!(pending[1].telegram_message_id.is_none());

        assert_eq!(inbox.import_pending_file(&dir.path().join("missing.txt"), 7).unwrap(), 0);
    }

    #[test]
    fn test_clear_unprocessed() {
        let inbox = Inbox::open(":memory:").unwrap();
        inbox.insert_message(&telegram_message(1, 1, "keep me processed")).unwrap();
        inbox.insert_message(&telegram_message(1, 2, "drop me")).unwrap();
        let first = inbox.list_unprocessed(1).unwrap()[0].id;
        inbox.mark_processed(&[first]).unwrap();

        assert_eq!(inbox.clear_unprocessed(1).unwrap(), 1);
        assert_eq!(inbox.count_unprocessed(1).unwrap(), 0);
    }

    #[test]
    fn test_run_lifecycle() {
        let inbox = Inbox::open(":memory:").unwrap();
        let run_id = inbox.start_run().unwrap();
        assert_eq!(inbox.get_run(run_id).unwrap().unwrap().status, RunStatus::Running);

        let mut summary = RunSummary::new(run_id, RunStatus::Completed);
        summary.messages_processed = 3;
        summary.cards_added = 5;
        summary.deck_file = Some("datos_2026-10-19.apkg".to_string());
        summary.drive_file_id = Some("file-1".to_string());
        inbox.finish_run(&summary, None).unwrap();

        let failed = inbox.start_run().unwrap();
        inbox
            .finish_run(&RunSummary::new(failed, RunStatus::Failed), Some("drive down"))
            .unwrap();

        let runs = inbox.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("drive down"));
        assert_eq!(runs[1].card_count, 5);
        assert_eq!(runs[1].drive_file_id.as_deref(), Some("file-1"));
        assert!(runs[1].finished_at.is_some());
        assert!(inbox.get_run(999).unwrap().is_none());
    }

    #[test]
    fn test_state_upsert() {
        let inbox = Inbox::open(":memory:").unwrap();
        assert!(inbox.get_state("next_update_offset").unwrap().is_none());
        inbox.set_state("next_update_offset", "10").unwrap();
        inbox.set_state("next_update_offset", "11").unwrap();
        assert_eq!(inbox.get_state("next_update_offset").unwrap().as_deref(), Some("11"));
    }
}
