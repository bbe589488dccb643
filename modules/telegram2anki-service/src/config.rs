use crate::error::PipelineError;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_DECK_NAME: &str = "Datos";
pub const DEFAULT_DATABASE_PATH: &str = "./telegram2anki.db";
/// Six-field cron (seconds first): every Sunday at 09:00 UTC
pub const DEFAULT_SCHEDULE: &str = "0 0 9 * * Sun";

/// Telegram settings, enough for the listener on its own
#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub api_base: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_api_base: String,
    /// Service-account JSON, as stored in the secret store
    pub gdrive_credentials: String,
    pub gdrive_folder_id: Option<String>,
    pub drive_api_base: String,
    pub deck_name: String,
    pub database_path: String,
    pub pending_file: PathBuf,
    pub output_dir: PathBuf,
    pub schedule: String,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &str| {
            let value = get(key);
            if value.is_none() {
                missing.push(key.to_string());
            }
            value.unwrap_or_default()
        };

        let bot_token = required("TELEGRAM_BOT_TOKEN");
        let chat_id = required("TELEGRAM_CHAT_ID");
        let gemini_api_key = required("GEMINI_API_KEY");
        let gdrive_credentials = required("GDRIVE_CREDENTIALS");

        if !missing.is_empty() {
            return Err(PipelineError::MissingConfig(missing));
        }

        Ok(Self {
            telegram: TelegramConfig {
                bot_token,
                chat_id: parse_chat_id(&chat_id)?,
                api_base: get("TELEGRAM_API_BASE")
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            },
            gemini_api_key,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_api_base: get("GEMINI_API_BASE")
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            gdrive_credentials,
            gdrive_folder_id: get("GDRIVE_FOLDER_ID"),
            drive_api_base: get("GDRIVE_API_BASE")
                .unwrap_or_else(|| DEFAULT_DRIVE_API_BASE.to_string()),
            deck_name: get("DECK_NAME").unwrap_or_else(|| DEFAULT_DECK_NAME.to_string()),
            database_path: database_path_from_lookup(&lookup),
            pending_file: get("PENDING_MESSAGES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pending_messages.txt")),
            output_dir: get("DECK_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            schedule: get("SCHEDULE_CRON").unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
        })
    }
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bot_token = get("TELEGRAM_BOT_TOKEN");
        let chat_id = get("TELEGRAM_CHAT_ID");
        let (bot_token, chat_id) = match (bot_token, chat_id) {
            (Some(token), Some(chat)) => (token, chat),
            (token, chat) => {
                let mut missing = Vec::new();
                if token.is_none() {
                    missing.push("TELEGRAM_BOT_TOKEN".to_string());
                }
                if chat.is_none() {
                    missing.push("TELEGRAM_CHAT_ID".to_string());
                }
                return Err(PipelineError::MissingConfig(missing));
            }
        };

        Ok(Self {
            bot_token,
            chat_id: parse_chat_id(&chat_id)?,
            api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
        })
    }
}

fn parse_chat_id(raw: &str) -> Result<i64, PipelineError> {
    raw.trim().parse().map_err(|_| {
        PipelineError::InvalidConfig(format!("TELEGRAM_CHAT_ID must be an integer, got '{}'", raw))
    })
}

/// Database path used by commands that don't need the full config
pub fn database_path_from_env() -> String {
    database_path_from_lookup(|key| env::var(key).ok())
}

/// `TELEGRAM2ANKI_DB_PATH`, falling back to the default when unset or blank.
pub fn database_path_from_lookup<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("TELEGRAM2ANKI_DB_PATH")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn full_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-1001234"),
            ("GEMINI_API_KEY", "gem-key"),
            ("GDRIVE_CREDENTIALS", "{}"),
        ]
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup(&full_env())).unwrap();
        assert_eq!(config.telegram.chat_id, -1001234);
        assert_eq!(config.telegram.api_base, DEFAULT_TELEGRAM_API_BASE);
        assert_eq!(config.gemini_model, DEFAULT_GEMINI_MODEL);
        assert_eq!(config.deck_name, "Datos");
        assert_eq!(config.schedule, DEFAULT_SCHEDULE);
        assert!(config.gdrive_folder_id.is_none());
        assert_eq!(config.pending_file, PathBuf::from("pending_messages.txt"));
    }

    #[test]
    fn test_all_missing_variables_reported() {
        let err = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "k"), ("TELEGRAM_CHAT_ID", " ")]))
            .unwrap_err();
        match err {
            PipelineError::MissingConfig(missing) => assert_eq!(
                missing,
                vec!["TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID", "GDRIVE_CREDENTIALS"]
            ),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_non_numeric_chat_id_rejected() {
        let mut env = full_env();
        env[1] = ("TELEGRAM_CHAT_ID", "@my_channel");
        let err = Config::from_lookup(lookup(&env)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_overrides() {
        let mut env = full_env();
        env.push(("GDRIVE_FOLDER_ID", "folder-1"));
        env.push(("DECK_NAME", "Trivia"));
        env.push(("TELEGRAM_API_BASE", "http://127.0.0.1:9000"));
        let config = Config::from_lookup(lookup(&env)).unwrap();
        assert_eq!(config.gdrive_folder_id.as_deref(), Some("folder-1"));
        assert_eq!(config.deck_name, "Trivia");
        assert_eq!(config.telegram.api_base, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_telegram_only_config() {
        let config =
            TelegramConfig::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "t"), ("TELEGRAM_CHAT_ID", "42")]))
                .unwrap();
        assert_eq!(config.chat_id, 42);

        let err = TelegramConfig::from_lookup(lookup(&[("TELEGRAM_CHAT_ID", "42")])).unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfig(ref m) if m == &vec!["TELEGRAM_BOT_TOKEN".to_string()]));
    }

    #[test]
    fn test_blank_database_path_uses_default() {
        assert_eq!(database_path_from_lookup(lookup(&[])), DEFAULT_DATABASE_PATH);
        assert_eq!(
            database_path_from_lookup(lookup(&[("TELEGRAM2ANKI_DB_PATH", "   ")])),
            DEFAULT_DATABASE_PATH
        );
        assert_eq!(
            database_path_from_lookup(lookup(&[("TELEGRAM2ANKI_DB_PATH", "/data/inbox.db")])),
            "/data/inbox.db"
        );

        // `run` and `listen` resolve the same file
        let mut env = full_env();
        env.push(("TELEGRAM2ANKI_DB_PATH", ""));
        let config = Config::from_lookup(lookup(&env)).unwrap();
        assert_eq!(config.database_path, database_path_from_lookup(lookup(&env)));
    }
}
