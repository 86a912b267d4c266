//! Entry point (C1/C9/C10/C11 wiring): loads config, starts logging, builds
//! the session store and engine orchestrator, then runs the Telegram
//! long-poll loop alongside the injection watcher until shutdown.
//! Ported from `zdx-bot/src/main.rs`'s `run`/`run_bot`, trimmed of the
//! forum-topic, rebuild-signal, and callback-query machinery that has no
//! counterpart here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::bot::context::{AnyOrchestrator, BotContext};
use crate::bot::queue::{dispatch_message, new_chat_queues};
use crate::store::SessionStore;
use crate::telegram::{TelegramClient, TelegramSettings};

mod bot;
mod commands;
mod config;
mod handlers;
mod inject;
mod logging;
mod model;
mod orchestrator;
mod render;
mod runner;
mod store;
mod telegram;
mod transcribe;
mod types;

/// # Errors
/// Returns an error if config loading, store setup, or the Telegram
/// long-poll loop fails.
pub async fn run() -> Result<()> {
    logging::init();
    let config = config::load(None).context("load takopi config")?;
    let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    run_with(config, root).await
}

async fn run_with(config: config::Config, root: PathBuf) -> Result<()> {
    let settings = TelegramSettings::from_config(&config)?;
    let client = TelegramClient::new(settings.bot_token.clone());

    let command_specs = commands::telegram_command_specs();
    match client.set_my_commands(&command_specs).await {
        Ok(()) => tracing::info!(count = command_specs.len(), "registered Telegram command menu"),
        Err(err) => tracing::warn!(error = %err, "failed to register Telegram command menu"),
    }

    let sessions_path = store::resolve_sessions_path(&config::paths::config_dir());
    let store = Arc::new(SessionStore::new(sessions_path).context("open session store")?);
    store
        .sync_startup_cwd(&root.to_string_lossy())
        .context("sync session store cwd")?;

    let (command, extra_args) = config.engine_command(&config.engine);
    let orchestrator = AnyOrchestrator::new(Arc::clone(&store), &config.engine, &command, extra_args, &root)
        .context("build engine orchestrator")?;

    let shutdown = CancellationToken::new();
    let context = Arc::new(BotContext::new(
        client.clone(),
        config.clone(),
        settings.chat_id,
        settings.allowlist_user_ids,
        root,
        store,
        orchestrator,
        shutdown.clone(),
    ));

    if let Some(inject_dir) = config.inject_dir.clone() {
        spawn_injection_watcher(Arc::clone(&context), inject_dir, config.inject_poll_interval_secs, shutdown.clone());
    }

    run_poll_loop(context, client, shutdown).await
}

fn spawn_injection_watcher(
    context: Arc<BotContext>,
    dir: PathBuf,
    poll_interval_secs: u64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let poll_interval = Duration::from_secs(poll_interval_secs.max(1));
        inject::watch_inject_dir(dir, poll_interval, cancel, move |injection| {
            let context = Arc::clone(&context);
            async move {
                let key = model::ChatKey::new(context.chat_id(), None);
                if injection.new_session {
                    let engine = context.orchestrator().engine_id().clone();
                    if let Err(err) = context.store().new_session(key, &engine).await {
                        tracing::warn!(error = %err, "injection: failed to start new session");
                    }
                }
                let transport = telegram::TelegramTransport::new(context.client().clone());
                if let Err(err) = context
                    .orchestrator()
                    .run_turn(&transport, key, injection.text, context.turn_cancellation())
                    .await
                {
                    tracing::warn!(error = %err, "injection: turn failed");
                }
            }
        })
        .await;
    });
}

async fn run_poll_loop(context: Arc<BotContext>, client: TelegramClient, shutdown: CancellationToken) -> Result<()> {
    let chat_queues = new_chat_queues();
    let mut offset: Option<i64> = None;
    let poll_timeout = Duration::from_secs(30);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!(chat_id = context.chat_id(), "bridge started, polling Telegram for updates");

    loop {
        let current_offset = offset;
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
                break;
            }
            updates = client.get_updates(current_offset, poll_timeout) => {
                let updates = match updates {
                    Ok(updates) => updates,
                    Err(err) => {
                        tracing::warn!(error = %err, "Telegram polling error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = Some(update.update_id + 1);
                    if let Some(message) = update.message {
                        dispatch_message(&chat_queues, &context, message).await;
                    }
                }
            }
        }
    }

    Ok(())
}
