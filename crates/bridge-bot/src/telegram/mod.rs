use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;

mod types;

pub use types::{Audio, Chat, Message, TelegramFile, Update, User, Voice};

/// Resolved Telegram transport settings: bot token, the single allowed chat,
/// and the user allowlist. Grounded on `TelegramSettings::from_config` in
/// the teacher, simplified from a chat-id allowlist to the spec's single
/// gate chat id.
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: i64,
    pub allowlist_user_ids: HashSet<i64>,
}

impl TelegramSettings {
    /// # Errors
    /// Returns an error if the bot token, chat id, or user allowlist are
    /// missing. `config::load`'s `validate` already enforces this for the
    /// telegram transport, so this is a defensive second check for callers
    /// that construct a `Config` directly.
    pub fn from_config(config: &Config) -> Result<Self> {
        let telegram = &config.transports.telegram;
        let token = telegram
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .unwrap_or_default();
        if token.is_empty() {
            bail!("transports.telegram.bot_token is required");
        }

        let chat_id = telegram
            .chat_id
            .ok_or_else(|| anyhow::anyhow!("transports.telegram.chat_id is required"))?;

        let allowlist_user_ids: HashSet<i64> = telegram.allowlist_user_ids.iter().copied().collect();
        if allowlist_user_ids.is_empty() {
            bail!("transports.telegram.allowlist_user_ids must contain at least one user id");
        }

        Ok(Self {
            bot_token: token,
            chat_id,
            allowlist_user_ids,
        })
    }
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

const TELEGRAM_CONNECT_TIMEOUT_SECS: u64 = 2;
const TELEGRAM_HTTP_TIMEOUT_SECS: u64 = 35;

impl TelegramClient {
    pub fn new(token: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(TELEGRAM_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(TELEGRAM_HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: "https://api.telegram.org".to_string(),
            token,
        }
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn get_updates(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: Some(vec!["message"]),
        };
        self.post("getUpdates", &request).await
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn set_my_commands(
        &self,
        command_specs: &[crate::commands::TelegramCommandSpec],
    ) -> Result<()> {
        let commands = command_specs
            .iter()
            .map(|spec| TelegramBotCommand {
                command: spec.command,
                description: spec.description,
            })
            .collect();
        let request = SetMyCommandsRequest { commands };
        let _: bool = self.post("setMyCommands", &request).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn get_file(&self, file_id: &str) -> Result<TelegramFile> {
        let request = GetFileRequest { file_id };
        self.post("getFile", &request).await
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, file_path);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("Telegram file download")?;

        if !response.status().is_success() {
            bail!("Telegram file download failed with status {}", response.status());
        }

        let bytes = response.bytes().await.context("read Telegram file bytes")?;
        Ok(bytes.to_vec())
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<Message> {
        let request = SendMessageRequest { chat_id, text };
        self.post("sendMessage", &request).await
    }

    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let request = EditMessageTextRequest { chat_id, message_id, text };
        let _: Value = self.post("editMessageText", &request).await?;
        Ok(())
    }

    /// Delete a message. The bot can delete its own messages anytime, and
    /// other users' messages only with the `can_delete_messages` admin
    /// right.
    ///
    /// # Errors
    /// Returns an error if the operation fails.
    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let request = DeleteMessageRequest { chat_id, message_id };
        let _: bool = self.post("deleteMessage", &request).await?;
        Ok(())
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, method: &str, body: &B) -> Result<T> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .context("Telegram request")?;

        let bytes = response.bytes().await.context("read Telegram response")?;
        Self::parse_telegram_response(&bytes)
    }

    fn parse_telegram_response<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let envelope: TelegramEnvelope =
            serde_json::from_slice(bytes).context("parse Telegram response envelope")?;

        if !envelope.ok {
            let error: TelegramError = serde_json::from_slice(bytes).context("decode Telegram error")?;
            let description = error.description.unwrap_or_else(|| "Telegram API error".to_string());
            bail!("{description}");
        }

        let success: TelegramSuccess<T> =
            serde_json::from_slice(bytes).context("decode Telegram result")?;

        Ok(success.result)
    }
}

/// Telegram API success response (ok: true, result present)
#[derive(Debug, Deserialize)]
struct TelegramSuccess<T> {
    result: T,
}

/// Telegram API error response (ok: false, no result)
#[derive(Debug, Deserialize)]
struct TelegramError {
    #[serde(default)]
    description: Option<String>,
}

/// Raw envelope to check the `ok` field first
#[derive(Debug, Deserialize)]
struct TelegramEnvelope {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_updates: Option<Vec<&'static str>>,
}

#[derive(Debug, Serialize)]
struct SetMyCommandsRequest<'a> {
    commands: Vec<TelegramBotCommand<'a>>,
}

#[derive(Debug, Serialize)]
struct TelegramBotCommand<'a> {
    command: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetFileRequest<'a> {
    file_id: &'a str,
}

#[derive(Debug, Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteMessageRequest {
    chat_id: i64,
    message_id: i64,
}

/// The concrete [`crate::orchestrator::ChatTransport`] for Telegram.
pub struct TelegramTransport {
    client: TelegramClient,
}

impl TelegramTransport {
    pub fn new(client: TelegramClient) -> Self {
        Self { client }
    }
}

impl crate::orchestrator::ChatTransport for TelegramTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        let message = self.client.send_message(chat_id, text).await?;
        Ok(message.message_id)
    }

    async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        self.client.edit_message_text(chat_id, message_id, text).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.client.delete_message(chat_id, message_id).await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = self.client.get_file(file_id).await?;
        let path = file
            .file_path
            .ok_or_else(|| anyhow::anyhow!("Telegram file {file_id} has no file_path"))?;
        self.client.download_file(&path).await
    }
}
