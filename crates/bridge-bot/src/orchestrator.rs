//! Turn orchestration (C8): wires one inbound chat message through store
//! resolution, runner invocation, throttled progressive edits, and the
//! final store update. Grounded on `zdx-bot/src/handlers/message.rs`'s
//! `run_agent_turn`/`stream_turn_events`/`update_status` (its 3s
//! `STATUS_DEBOUNCE` debounce-edit pattern is the direct model for this
//! module's 800ms edit throttle).

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::model::{ChatKey, EngineId, ResumeToken, TakopiEvent};
use crate::render::ProgressRenderer;
use crate::runner::{Engine, JsonlSubprocessRunner};
use crate::store::SessionStore;

/// Minimum gap between progress edits. Forced flushes (session start,
/// completion) bypass it.
const EDIT_THROTTLE: Duration = Duration::from_millis(800);

/// The chat-surface seam the orchestrator drives. A concrete transport
/// (Telegram today) implements this; the orchestrator never depends on it
/// directly.
pub trait ChatTransport: Send + Sync + 'static {
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn download_file(&self, file_id: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
}

/// Runs one turn: resolves the resume token, streams the engine's events
/// into throttled chat edits, and persists the resulting session state.
/// Returns the final answer text (for callers that want to log or inspect
/// it) once the turn completes, whether or not it was cancelled.
pub async fn run_turn<T, E>(
    transport: &T,
    store: &SessionStore,
    runner: &JsonlSubprocessRunner<E>,
    key: ChatKey,
    engine: &EngineId,
    prompt: String,
    cancel: CancellationToken,
    cwd: Option<&str>,
) -> Result<()>
where
    T: ChatTransport,
    E: Engine,
{
    let resume = store.get_session_resume(key, engine)?;

    let message_id = transport.send_message(key.chat_id, "working \u{00b7} 0s \u{00b7} step 0").await?;

    let mut renderer = match cwd {
        Some(cwd) => ProgressRenderer::with_cwd(cwd),
        None => ProgressRenderer::new(),
    };
    let started_at = Instant::now();
    let mut last_flush = Instant::now();
    let mut dirty = false;

    // The runner watches the same token and kills the child on cancellation,
    // surfacing it as an ordinary (unsuccessful) `Completed` event below.
    let mut handle = runner.run(prompt.clone(), resume, cancel);

    while let Some(event) = handle.events.recv().await {
        let force_flush = matches!(
            event,
            TakopiEvent::SessionStarted { .. } | TakopiEvent::Completed { .. }
        );

        if let TakopiEvent::SessionStarted { resume, .. } = &event {
            store.set_session_resume(key, resume, Some(&prompt))?;
        }

        if renderer.note_event(&event) {
            dirty = true;
        }

        if let TakopiEvent::Completed { ok, answer, error, .. } = &event {
            let elapsed = started_at.elapsed().as_secs();
            let body = if *ok {
                answer.as_str()
            } else {
                error.as_deref().unwrap_or("the run failed")
            };
            let text = renderer.render_final(elapsed, body, *ok);
            let _ = transport.edit_message_text(key.chat_id, message_id, &text).await;
            dirty = false;
            continue;
        }

        if dirty && (force_flush || last_flush.elapsed() >= EDIT_THROTTLE) {
            let elapsed = started_at.elapsed().as_secs();
            let text = renderer.render_progress(elapsed);
            let _ = transport.edit_message_text(key.chat_id, message_id, &text).await;
            last_flush = Instant::now();
            dirty = false;
        }
    }

    if let Err(err) = handle.task.await? {
        let elapsed = started_at.elapsed().as_secs();
        let text = renderer.render_final(elapsed, &format!("run failed: {err}"), false);
        let _ = transport.edit_message_text(key.chat_id, message_id, &text).await;
        return Err(err);
    }

    Ok(())
}

/// Shared orchestrator state: everything a transport's update loop needs to
/// dispatch one inbound message, behind an `Arc` so worker tasks can clone
/// it cheaply per chat.
pub struct Orchestrator<E: Engine> {
    pub store: Arc<SessionStore>,
    pub runner: Arc<JsonlSubprocessRunner<E>>,
    pub engine: EngineId,
    pub cwd: Option<String>,
}

impl<E: Engine> Orchestrator<E> {
    pub fn new(store: Arc<SessionStore>, runner: Arc<JsonlSubprocessRunner<E>>, engine: EngineId) -> Self {
        Self { store, runner, engine, cwd: None }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub async fn run_turn<T: ChatTransport>(
        &self,
        transport: &T,
        key: ChatKey,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<()> {
        run_turn(
            transport,
            &self.store,
            &self.runner,
            key,
            &self.engine,
            prompt,
            cancel,
            self.cwd.as_deref(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::runner::{LockRegistry, TranslationError};
    use crate::model::RunState;

    struct RecordingTransport {
        edits: Mutex<Vec<String>>,
    }

    impl ChatTransport for RecordingTransport {
        async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<i64> {
            Ok(1)
        }

        async fn edit_message_text(&self, _chat_id: i64, _message_id: i64, text: &str) -> Result<()> {
            self.edits.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn delete_message(&self, _chat_id: i64, _message_id: i64) -> Result<()> {
            Ok(())
        }

        async fn download_file(&self, _file_id: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct OneShotEngine {
        id: EngineId,
    }

    impl Engine for OneShotEngine {
        fn id(&self) -> &EngineId {
            &self.id
        }

        fn command(&self) -> &str {
            "cat"
        }

        fn build_args(&self, _prompt: &str, _resume: Option<&ResumeToken>) -> Vec<String> {
            Vec::new()
        }

        fn stdin_payload(&self, prompt: &str, _resume: Option<&ResumeToken>) -> String {
            prompt.to_string()
        }

        fn translate(
            &self,
            data: &serde_json::Value,
            _state: &mut RunState,
            _resume: Option<&ResumeToken>,
            _found_session: Option<&ResumeToken>,
        ) -> std::result::Result<Vec<TakopiEvent>, TranslationError> {
            if data.get("type").and_then(|v| v.as_str()) == Some("turn.completed") {
                return Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok: true,
                    answer: "done thinking".to_string(),
                    resume: None,
                    error: None,
                }]);
            }
            Err(TranslationError::new("unrecognized"))
        }
    }

    #[tokio::test]
    async fn run_turn_sends_a_final_edit_with_the_answer() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json")).unwrap();
        let engine = Arc::new(OneShotEngine { id: "echo".to_string() });
        let runner = JsonlSubprocessRunner::new(engine, Arc::new(LockRegistry::new()));
        let transport = RecordingTransport { edits: Mutex::new(Vec::new()) };

        let key = ChatKey::new(1, None);
        run_turn(
            &transport,
            &store,
            &runner,
            key,
            &"echo".to_string(),
            "{\"type\":\"turn.completed\"}\n".to_string(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        let edits = transport.edits.lock().unwrap();
        assert!(edits.last().unwrap().contains("done thinking"));
        assert!(edits.last().unwrap().starts_with("done"));
    }

    #[tokio::test]
    async fn cancellation_produces_a_cancelled_final_edit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json")).unwrap();
        let engine = Arc::new(OneShotEngine { id: "echo".to_string() });
        let runner = JsonlSubprocessRunner::new(engine, Arc::new(LockRegistry::new()));
        let transport = RecordingTransport { edits: Mutex::new(Vec::new()) };

        let cancel = CancellationToken::new();
        cancel.cancel();

        let key = ChatKey::new(2, None);
        run_turn(
            &transport,
            &store,
            &runner,
            key,
            &"echo".to_string(),
            "{\"type\":\"turn.completed\"}\n".to_string(),
            cancel,
            None,
        )
        .await
        .unwrap();

        let edits = transport.edits.lock().unwrap();
        assert!(edits.last().unwrap().contains("cancelled"));
    }
}
