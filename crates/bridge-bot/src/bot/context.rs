use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::model::{ChatKey, EngineId};
use crate::orchestrator::{ChatTransport, Orchestrator};
use crate::runner::claude::ClaudeEngine;
use crate::runner::codex::CodexEngine;
use crate::runner::{JsonlSubprocessRunner, LockRegistry};
use crate::store::SessionStore;
use crate::telegram::TelegramClient;

/// Enum dispatch over the two built-in engines (§4.3's extensibility seam
/// is the `Engine` trait itself; this just picks one concrete runner at
/// startup based on `config.engine` without paying for a trait-object
/// `Engine`, which `JsonlSubprocessRunner<E>` isn't generic enough to hold
/// without one).
pub(crate) enum AnyOrchestrator {
    Codex(Orchestrator<CodexEngine>),
    Claude(Orchestrator<ClaudeEngine>),
}

impl AnyOrchestrator {
    pub(crate) fn new(
        store: Arc<SessionStore>,
        engine_name: &str,
        command: &str,
        extra_args: Vec<String>,
        cwd: &Path,
    ) -> Result<Self> {
        let locks = Arc::new(LockRegistry::new());
        match engine_name {
            "codex" => {
                let engine = Arc::new(CodexEngine::new(command).with_args(extra_args));
                let runner = Arc::new(JsonlSubprocessRunner::new(engine, locks));
                let orchestrator = Orchestrator::new(store, runner, "codex".to_string())
                    .with_cwd(cwd.to_string_lossy().into_owned());
                Ok(Self::Codex(orchestrator))
            }
            "claude" => {
                let engine = Arc::new(ClaudeEngine::new(command).with_args(extra_args));
                let runner = Arc::new(JsonlSubprocessRunner::new(engine, locks));
                let orchestrator = Orchestrator::new(store, runner, "claude".to_string())
                    .with_cwd(cwd.to_string_lossy().into_owned());
                Ok(Self::Claude(orchestrator))
            }
            other => anyhow::bail!("unknown engine \"{other}\" (expected \"codex\" or \"claude\")"),
        }
    }

    pub(crate) async fn run_turn<T: ChatTransport>(
        &self,
        transport: &T,
        key: ChatKey,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<()> {
        match self {
            Self::Codex(orchestrator) => orchestrator.run_turn(transport, key, prompt, cancel).await,
            Self::Claude(orchestrator) => orchestrator.run_turn(transport, key, prompt, cancel).await,
        }
    }

    pub(crate) fn engine_id(&self) -> &EngineId {
        match self {
            Self::Codex(orchestrator) => &orchestrator.engine,
            Self::Claude(orchestrator) => &orchestrator.engine,
        }
    }
}

/// Shared, immutable-after-startup bot state: the Telegram client, the gate
/// chat id and user allowlist, the session store, and the engine
/// orchestrator. Grounded on `zdx-bot/src/bot/context.rs`'s `BotContext`,
/// trimmed of the rebuild-signal/forum machinery that has no spec
/// counterpart.
pub(crate) struct BotContext {
    client: TelegramClient,
    config: Config,
    chat_id: i64,
    allowlist_user_ids: HashSet<i64>,
    root: PathBuf,
    store: Arc<SessionStore>,
    orchestrator: AnyOrchestrator,
    shutdown: CancellationToken,
}

impl BotContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: TelegramClient,
        config: Config,
        chat_id: i64,
        allowlist_user_ids: HashSet<i64>,
        root: PathBuf,
        store: Arc<SessionStore>,
        orchestrator: AnyOrchestrator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            chat_id,
            allowlist_user_ids,
            root,
            store,
            orchestrator,
            shutdown,
        }
    }

    pub(crate) fn client(&self) -> &TelegramClient {
        &self.client
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub(crate) fn allowlist_user_ids(&self) -> &HashSet<i64> {
        &self.allowlist_user_ids
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub(crate) fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub(crate) fn orchestrator(&self) -> &AnyOrchestrator {
        &self.orchestrator
    }

    /// A turn's cancellation token, child to the process-wide shutdown
    /// signal. There is no per-turn `/cancel` command in the surface, so the
    /// only thing that ever trips this is process shutdown.
    pub(crate) fn turn_cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
