//! Telegram transport for the herald outbox.
//!
//! Sends pre-sized MarkdownV2 payloads with teloxide, waits out `retry_after`
//! responses a bounded number of times and falls back to plain text when
//! Telegram cannot parse the entities.

pub mod error;
pub mod transport;

pub use {
    error::{Error, Result},
    transport::TelegramTransport,
};
