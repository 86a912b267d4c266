//! Inbound-message handling: builds an [`crate::types::IncomingMessage`] off
//! a raw Telegram message, short-circuits into command dispatch (C12) or
//! voice transcription (C13), and otherwise hands the prompt to the engine
//! orchestrator (C8). Grounded on `zdx-bot/src/main.rs`'s `handle_message`
//! and `original_source/src/takopi/telegram/commands/sessions.py` for the
//! session-command replies.

use anyhow::Result;

use crate::bot::context::BotContext;
use crate::commands::{self, BotCommand, PrefixMatch};
use crate::model::{ChatKey, SessionInfo};
use crate::telegram::{Message, TelegramTransport};
use crate::transcribe;
use crate::types::{IncomingAudio, IncomingMessage};

const MAX_AUDIO_BYTES: u64 = 25 * 1024 * 1024;

pub(crate) async fn handle_message(context: &BotContext, message: Message) -> Result<()> {
    let Some(incoming) = parse_incoming_message(context, message).await? else {
        return Ok(());
    };

    let key = ChatKey::new(incoming.chat_id, Some(incoming.user_id));

    if let Some(text) = incoming.text.as_deref()
        && let Some(command) = commands::parse_command(text)
    {
        return handle_command(context, &incoming, key, command).await;
    }

    let Some(prompt) = build_prompt(&incoming) else {
        return Ok(());
    };

    let transport = TelegramTransport::new(context.client().clone());
    context.orchestrator().run_turn(&transport, key, prompt, context.turn_cancellation()).await
}

async fn parse_incoming_message(context: &BotContext, message: Message) -> Result<Option<IncomingMessage>> {
    let chat_id = message.chat.id;
    let message_id = message.message_id;

    let Some(user) = message.from.as_ref() else {
        return Ok(None);
    };
    let user_id = user.id;

    let mut text = extract_text(&message);
    let mut audios = Vec::new();
    let mut had_attachment = false;

    if let Some(voice) = message.voice.as_ref() {
        had_attachment = true;
        match load_audio(context, voice.file_size, voice.mime_type.as_deref(), "voice.ogg", &voice.file_id).await {
            Ok(Some(audio)) => audios.push(audio),
            Ok(None) => {}
            Err(err) => tracing::warn!(chat_id, error = %err, "failed to load voice attachment"),
        }
    }

    if let Some(audio) = message.audio.as_ref() {
        had_attachment = true;
        let filename = audio.file_name.as_deref().unwrap_or("audio.bin");
        match load_audio(context, audio.file_size, audio.mime_type.as_deref(), filename, &audio.file_id).await {
            Ok(Some(loaded)) => audios.push(loaded),
            Ok(None) => {}
            Err(err) => tracing::warn!(chat_id, error = %err, "failed to load audio attachment"),
        }
    }

    if text.is_none() && audios.is_empty() {
        if had_attachment {
            let _ = context.client().send_message(chat_id, "sorry, I couldn't read that attachment.").await;
        }
        return Ok(None);
    }

    if let Some(value) = text.as_deref()
        && value.trim().is_empty()
    {
        text = None;
    }

    if text.is_none() && audios.iter().all(|a| a.transcript.is_none()) {
        let _ = context.client().send_message(chat_id, "sorry, I couldn't transcribe that audio.").await;
        return Ok(None);
    }

    Ok(Some(IncomingMessage { chat_id, message_id, user_id, text, audios }))
}

fn extract_text(message: &Message) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(text) = message.text.as_deref() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref() {
        let trimmed = caption.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

async fn load_audio(
    context: &BotContext,
    file_size: Option<u64>,
    mime_type: Option<&str>,
    filename: &str,
    file_id: &str,
) -> Result<Option<IncomingAudio>> {
    if file_size.unwrap_or(0) > MAX_AUDIO_BYTES {
        return Ok(None);
    }

    let file = context.client().get_file(file_id).await?;
    let Some(file_path) = file.file_path else {
        return Ok(None);
    };
    let bytes = context.client().download_file(&file_path).await?;
    if bytes.len() as u64 > MAX_AUDIO_BYTES {
        return Ok(None);
    }

    let transcript =
        match transcribe::transcribe_audio_if_configured(context.config(), bytes, filename, mime_type).await {
            Ok(transcript) => transcript,
            Err(err) => {
                tracing::warn!(error = %err, "audio transcription failed");
                None
            }
        };

    Ok(Some(IncomingAudio { local_path: std::path::PathBuf::from(filename), transcript }))
}

fn build_prompt(incoming: &IncomingMessage) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(text) = incoming.text.as_deref() {
        parts.push(text.to_string());
    }
    for audio in &incoming.audios {
        if let Some(transcript) = &audio.transcript {
            parts.push(transcript.clone());
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

async fn handle_command(
    context: &BotContext,
    incoming: &IncomingMessage,
    key: ChatKey,
    command: BotCommand,
) -> Result<()> {
    let engine = context.orchestrator().engine_id().clone();
    let reply = match command {
        BotCommand::Sessions { engine: filter } => cmd_sessions(context, key, filter.as_deref()).await?,
        BotCommand::Switch { prefix } => cmd_switch(context, key, &prefix).await?,
        BotCommand::Name { title } => cmd_name(context, key, &engine, &title).await?,
        BotCommand::Delete { prefix } => cmd_delete(context, key, &prefix).await?,
        BotCommand::New => {
            context.store().new_session(key, &engine).await?;
            "started a new conversation.".to_string()
        }
        BotCommand::Clear => {
            context.store().clear_sessions(key).await?;
            "cleared all active sessions. history retained.".to_string()
        }
    };
    context.client().send_message(incoming.chat_id, &reply).await?;
    Ok(())
}

async fn cmd_sessions(context: &BotContext, key: ChatKey, filter: Option<&str>) -> Result<String> {
    let filter = filter.map(ToString::to_string);
    let sessions = context.store().list_sessions(key, filter.as_ref()).await?;
    if sessions.is_empty() {
        return Ok("no sessions found. start chatting to create one!".to_string());
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_engine: std::collections::HashMap<String, Vec<SessionInfo>> = std::collections::HashMap::new();
    for session in sessions {
        if !by_engine.contains_key(&session.engine) {
            order.push(session.engine.clone());
        }
        by_engine.entry(session.engine.clone()).or_default().push(session);
    }

    let mut lines = vec!["your sessions:".to_string(), String::new()];
    for engine in &order {
        let active_id = context.store().get_active_session_id(key, engine).await?;
        lines.push(format!("{engine}:"));
        for (i, session) in by_engine[engine].iter().take(10).enumerate() {
            let is_active = active_id.as_deref() == Some(session.resume.as_str());
            lines.push(format_session(session, is_active, i + 1));
        }
        if by_engine[engine].len() > 10 {
            lines.push(format!("  ... and {} more", by_engine[engine].len() - 10));
        }
        lines.push(String::new());
    }
    lines.push("commands: /switch <id>, /name <title>, /new".to_string());

    Ok(lines.join("\n"))
}

fn format_session(session: &SessionInfo, is_active: bool, index: usize) -> String {
    let marker = if is_active { "> " } else { "  " };
    let mut title = session.title.clone().or_else(|| session.first_message.clone()).unwrap_or_else(|| "untitled".to_string());
    if title.len() > 30 {
        title.truncate(27);
        title.push_str("...");
    }
    let short_id = &session.resume[..session.resume.len().min(8)];
    format!("{index}. {marker}{short_id} {title} ({})", format_time_ago(session.updated_at))
}

fn format_time_ago(updated_at: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let diff = (now - updated_at).max(0);
    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{}m ago", diff / 60)
    } else if diff < 86_400 {
        format!("{}h ago", diff / 3600)
    } else {
        format!("{}d ago", diff / 86_400)
    }
}

async fn cmd_switch(context: &BotContext, key: ChatKey, prefix: &str) -> Result<String> {
    let sessions = context.store().list_sessions(key, None).await?;
    match resolve_session_prefix(&sessions, prefix) {
        PrefixMatch::None => Ok(format!("no session found matching `{prefix}`")),
        PrefixMatch::Ambiguous(n) => Ok(format!("{n} sessions match `{prefix}`. be more specific.")),
        PrefixMatch::Unique(session) => {
            let Some(switched) = context.store().switch_session(key, &session.resume).await? else {
                return Ok("failed to switch session.".to_string());
            };
            let title = switched.title.or(switched.first_message).unwrap_or_else(|| switched.resume.clone());
            Ok(format!("switched to: {title}"))
        }
    }
}

async fn cmd_delete(context: &BotContext, key: ChatKey, prefix: &str) -> Result<String> {
    let sessions = context.store().list_sessions(key, None).await?;
    match resolve_session_prefix(&sessions, prefix) {
        PrefixMatch::None => Ok(format!("no session found matching `{prefix}`")),
        PrefixMatch::Ambiguous(n) => Ok(format!("{n} sessions match `{prefix}`. be more specific.")),
        PrefixMatch::Unique(session) => {
            let title = session.title.clone().or_else(|| session.first_message.clone()).unwrap_or_else(|| session.resume.clone());
            if context.store().delete_session(key, &session.resume).await? {
                Ok(format!("deleted session: {title}"))
            } else {
                Ok("failed to delete session.".to_string())
            }
        }
    }
}

fn resolve_session_prefix(sessions: &[SessionInfo], prefix: &str) -> PrefixMatch<SessionInfo> {
    commands::resolve_prefix(sessions.iter().map(|s| (s.resume.as_str(), s.clone())), prefix)
}

async fn cmd_name(context: &BotContext, key: ChatKey, engine: &str, title: &str) -> Result<String> {
    if title.is_empty() {
        return Ok("usage: /name <title>".to_string());
    }
    if context.store().name_session(key, &engine.to_string(), title).await? {
        Ok(format!("session named: {title}"))
    } else {
        Ok("no active session to name. start a conversation first.".to_string())
    }
}
