use std::{future::Future, time::Duration};

use {
    async_trait::async_trait,
    herald_common::ChatTarget,
    herald_config::TelegramConfig,
    herald_outbox::{SendReceipt, Transport, TransportError},
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        payloads::SendMessageSetters,
        prelude::*,
        types::{MessageId, ParseMode, Recipient, ThreadId},
    },
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, telegram as telegram_metrics};

use crate::error::{Error, Result};

/// [`Transport`] that posts to Telegram chats through the Bot API.
pub struct TelegramTransport {
    bot: Bot,
    retry_after_max_retries: usize,
    plain_text_fallback: bool,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config.token.expose_secret();
        if token.trim().is_empty() {
            return Err(Error::MissingToken);
        }
        let client = teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            bot: Bot::with_client(token, client),
            retry_after_max_retries: config.retry_after_max_retries,
            plain_text_fallback: config.plain_text_fallback,
        })
    }

    /// Check the token with `getMe`. Returns the bot username.
    pub async fn verify(&self) -> Result<String> {
        let me = self.bot.get_me().await?;
        let username = me.username.clone().unwrap_or_default();
        info!(bot_username = %username, "telegram bot verified");
        Ok(username)
    }

    async fn send_message(
        &self,
        recipient: &Recipient,
        thread: Option<ThreadId>,
        text: &str,
        parse_mode: Option<ParseMode>,
        operation: &'static str,
    ) -> std::result::Result<Message, RequestError> {
        run_with_retry(self.retry_after_max_retries, operation, || {
            let mut req = self.bot.send_message(recipient.clone(), text);
            if let Some(mode) = parse_mode {
                req = req.parse_mode(mode);
            }
            if let Some(thread) = thread {
                req = req.message_thread_id(thread);
            }
            async move { req.await }
        })
        .await
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(
        &self,
        target: &ChatTarget,
        text: &str,
    ) -> std::result::Result<SendReceipt, TransportError> {
        let recipient = parse_recipient(&target.destination)
            .ok_or_else(|| TransportError::invalid_target(target.to_string(), "empty chat id"))?;
        let thread = match target.thread() {
            Some(raw) => Some(parse_thread(raw).ok_or_else(|| {
                TransportError::invalid_target(target.to_string(), "thread id is not numeric")
            })?),
            None => None,
        };

        let sent = match self
            .send_message(
                &recipient,
                thread,
                text,
                Some(ParseMode::MarkdownV2),
                "send message (markdown)",
            )
            .await
        {
            Err(e) if self.plain_text_fallback && is_entity_parse_error(&e) => {
                warn!(
                    destination = %target.destination,
                    thread = target.thread(),
                    error = %e,
                    "telegram rejected MarkdownV2, retrying as plain text"
                );
                #[cfg(feature = "metrics")]
                counter!(telegram_metrics::PLAIN_FALLBACK_TOTAL).increment(1);
                self.send_message(&recipient, thread, text, None, "send message (plain)")
                    .await
            },
            other => other,
        };

        sent.map(|message| SendReceipt {
            message_id: Some(i64::from(message.id.0)),
        })
        .map_err(to_transport_error)
    }
}

/// Numeric ids are chat ids; anything else is a public `@username`.
fn parse_recipient(destination: &str) -> Option<Recipient> {
    let destination = destination.trim();
    if destination.is_empty() {
        return None;
    }
    if let Ok(id) = destination.parse::<i64>() {
        return Some(Recipient::Id(ChatId(id)));
    }
    let name = destination.trim_start_matches('@');
    Some(Recipient::ChannelUsername(format!("@{name}")))
}

fn parse_thread(raw: &str) -> Option<ThreadId> {
    raw.trim().parse::<i32>().ok().map(|id| ThreadId(MessageId(id)))
}

fn is_entity_parse_error(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::CantParseEntities(_)))
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

fn to_transport_error(error: RequestError) -> TransportError {
    if let Some(retry_after) = retry_after_duration(&error) {
        return TransportError::RateLimited { retry_after };
    }
    match error {
        // Unrecognised API answers include server-side hiccups; keep the entry.
        RequestError::Api(api @ ApiError::Unknown(_)) => {
            TransportError::external("telegram api error", api)
        },
        RequestError::Api(api) => TransportError::rejected(api.to_string()),
        other => TransportError::external("telegram request failed", other),
    }
}

/// Run `request`, sleeping through up to `max_retries` `retry_after` answers.
async fn run_with_retry<T, F, Fut>(
    max_retries: usize,
    operation: &'static str,
    mut request: F,
) -> std::result::Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RequestError>>,
{
    let mut retries = 0usize;

    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(wait) = retry_after_duration(&err) else {
                    return Err(err);
                };

                if retries >= max_retries {
                    warn!(
                        operation,
                        retries,
                        max_retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limit persisted after retries"
                    );
                    return Err(err);
                }

                retries += 1;
                #[cfg(feature = "metrics")]
                counter!(telegram_metrics::RETRY_AFTER_TOTAL).increment(1);
                warn!(
                    operation,
                    retries,
                    max_retries,
                    retry_after_secs = wait.as_secs(),
                    "telegram rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
            },
        }
    }
}
