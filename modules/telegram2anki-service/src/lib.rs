//! Collects facts sent to a Telegram bot, turns them into Anki flashcards with
//! Gemini and ships the packaged deck to Google Drive.

pub mod cards;
pub mod config;
pub mod deck;
pub mod drive_api;
pub mod error;
pub mod gemini_api;
pub mod http;
pub mod inbox;
pub mod listener;
pub mod pipeline;
pub mod scheduler;
pub mod telegram_api;
