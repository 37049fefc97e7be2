//! Telegram Bot API adapter implementing [`ResponseChannel`].
//!
//! One background task long-polls `getUpdates` and feeds inbound texts
//! from the configured chat into an mpsc channel; `await_reply` drains
//! that channel, discarding anything sent before the prompt it is
//! correlating against (conversation ids are the prompt's message id,
//! and Telegram message ids are monotonic per chat).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::channel::{ConversationId, ResponseChannel};
use crate::config::TelegramConfig;
use crate::error::{Result, SeekerError};

const LONG_POLL_SECS: u64 = 25;
const PUMP_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug)]
struct Inbound {
    message_id: i64,
    text: String,
}

/// Operator channel over the Telegram Bot API.
pub struct TelegramChannel {
    http: reqwest::Client,
    api_base: String,
    chat_id: String,
    inbox: Mutex<mpsc::Receiver<Inbound>>,
}

impl TelegramChannel {
    /// Build the channel and start the update pump.
    pub fn connect(config: &TelegramConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()?;
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_update_pump(
            http.clone(),
            api_base.clone(),
            config.chat_id.clone(),
            tx,
        ));

        Ok(Self {
            http,
            api_base,
            chat_id: config.chat_id.clone(),
            inbox: Mutex::new(rx),
        })
    }

    async fn send_message(&self, text: &str) -> Result<Message> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
        };
        let response: ApiResponse<Message> = self
            .http
            .post(format!("{}/sendMessage", self.api_base))
            .json(&payload)
            .send()
            .await
            .map_err(notification_error)?
            .json()
            .await
            .map_err(notification_error)?;

        if !response.ok {
            return Err(SeekerError::Notification {
                message: response
                    .description
                    .unwrap_or_else(|| "sendMessage rejected".to_string()),
            });
        }
        response.result.ok_or_else(|| SeekerError::Notification {
            message: "sendMessage returned no message".to_string(),
        })
    }
}

fn notification_error(error: reqwest::Error) -> SeekerError {
    SeekerError::Notification {
        message: error.to_string(),
    }
}

#[async_trait]
impl ResponseChannel for TelegramChannel {
    async fn notify(&self, message: &str) -> Result<()> {
        self.send_message(message).await?;
        Ok(())
    }

    async fn ask(&self, prompt: &str, choices: &[String]) -> Result<ConversationId> {
        let mut text = prompt.to_string();
        if !choices.is_empty() {
            text.push_str("\n");
            for (i, choice) in choices.iter().enumerate() {
                text.push_str(&format!("\n{}. {}", i + 1, choice));
            }
            text.push_str("\n\nReply with a number, a name, or a page URL.");
        }
        let sent = self.send_message(&text).await?;
        Ok(ConversationId(sent.message_id.to_string()))
    }

    async fn await_reply(
        &self,
        conversation: &ConversationId,
        timeout: Duration,
    ) -> Result<String> {
        let prompt_id: i64 = conversation.0.parse().map_err(|_| {
            SeekerError::parse(format!("malformed conversation id '{}'", conversation))
        })?;
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock().await;

        loop {
            match timeout_at(deadline, inbox.recv()).await {
                Ok(Some(inbound)) => {
                    if inbound.message_id <= prompt_id {
                        debug!("discarding reply {} from an earlier prompt", inbound.message_id);
                        continue;
                    }
                    return Ok(inbound.text);
                }
                Ok(None) => {
                    return Err(SeekerError::Notification {
                        message: "update pump stopped".to_string(),
                    });
                }
                Err(_) => {
                    return Err(SeekerError::ReplyTimeout {
                        waited_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }
}

impl fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Long-poll `getUpdates` and forward texts from the configured chat.
/// Stops when the receiving side is dropped.
async fn run_update_pump(
    http: reqwest::Client,
    api_base: String,
    chat_id: String,
    tx: mpsc::Sender<Inbound>,
) {
    info!("telegram update pump started");
    let mut offset: i64 = 0;

    loop {
        let request = http
            .get(format!("{}/getUpdates", api_base))
            .query(&[("offset", offset), ("timeout", LONG_POLL_SECS as i64)]);

        let updates: ApiResponse<Vec<Update>> = match request.send().await {
            Ok(response) => match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("getUpdates returned malformed payload: {}", e);
                    tokio::time::sleep(PUMP_RETRY_DELAY).await;
                    continue;
                }
            },
            Err(e) => {
                warn!("getUpdates failed: {}", e);
                tokio::time::sleep(PUMP_RETRY_DELAY).await;
                continue;
            }
        };

        if !updates.ok {
            warn!(
                "getUpdates rejected: {}",
                updates.description.unwrap_or_default()
            );
            tokio::time::sleep(PUMP_RETRY_DELAY).await;
            continue;
        }

        for update in updates.result.unwrap_or_default() {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            if message.chat.id.to_string() != chat_id {
                continue;
            }
            let Some(text) = message.text else {
                continue;
            };
            let inbound = Inbound {
                message_id: message.message_id,
                text,
            };
            if tx.send(inbound).await.is_err() {
                info!("telegram update pump stopping, channel closed");
                return;
            }
        }
    }
}
