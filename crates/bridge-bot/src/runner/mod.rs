//! Line-framed stdout reading (C1) and the JSONL subprocess runner (C3),
//! generic over an [`Engine`] that supplies the child's command line, stdin
//! payload, and wire-event translation.

mod locks;

pub mod claude;
pub mod codex;

pub use locks::LockRegistry;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{Action, ActionKind, ActionLevel, EngineId, ResumeToken, RunState, TakopiEvent};

/// A translation failure: the line parsed as JSON but didn't match any
/// known event shape, or matched with an unexpected field type. Never
/// fatal — surfaced as a synthetic warning action.
pub struct TranslationError {
    pub message: String,
    pub type_name: Option<String>,
    pub item_type: Option<String>,
}

impl TranslationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            type_name: None,
            item_type: None,
        }
    }
}

/// The extensibility seam (§4.3): a concrete engine supplies the command
/// line, stdin payload, and wire-shape translation; everything else
/// (framing, locking, error synthesis, completion guarantee) is shared by
/// [`JsonlSubprocessRunner`].
pub trait Engine: Send + Sync + 'static {
    fn id(&self) -> &EngineId;

    /// Short tag used in synthetic action ids (`"{tag}.note.{n}"`).
    fn tag(&self) -> &str {
        self.id()
    }

    fn command(&self) -> &str;

    fn build_args(&self, prompt: &str, resume: Option<&ResumeToken>) -> Vec<String>;

    /// Non-empty payload is written to stdin and stdin is then closed;
    /// empty payload closes stdin immediately without writing.
    fn stdin_payload(&self, prompt: &str, resume: Option<&ResumeToken>) -> String;

    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn translate(
        &self,
        data: &serde_json::Value,
        state: &mut RunState,
        resume: Option<&ResumeToken>,
        found_session: Option<&ResumeToken>,
    ) -> Result<Vec<TakopiEvent>, TranslationError>;
}

/// Reads one newline-terminated record from `reader`. Returns `Ok(None)` on
/// clean EOF, and also on EOF mid-line (the partial record is discarded,
/// never emitted — matching the spec's "stops cleanly" requirement).
async fn read_line_framed<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Ok(None);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Drains a stderr pipe line by line, routing each line to debug logging.
/// Never propagates read errors — diagnostic only.
async fn drain_stderr<R>(mut reader: R, tag: &str)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        match read_line_framed(&mut reader).await {
            Ok(Some(line)) => {
                tracing::debug!(engine = tag, "{}", String::from_utf8_lossy(&line));
            }
            Ok(None) | Err(_) => break,
        }
    }
}

pub struct RunHandle {
    pub events: mpsc::UnboundedReceiver<TakopiEvent>,
    pub task: JoinHandle<Result<()>>,
}

pub struct JsonlSubprocessRunner<E: Engine> {
    engine: Arc<E>,
    locks: Arc<LockRegistry>,
}

impl<E: Engine> JsonlSubprocessRunner<E> {
    pub fn new(engine: Arc<E>, locks: Arc<LockRegistry>) -> Self {
        Self { engine, locks }
    }

    /// Spawns the child and starts streaming translated events into the
    /// returned channel. `task` resolves once the invocation is fully done;
    /// `Err` from `task` indicates a fatal (non-event) failure such as a
    /// session-identity mismatch. Cancelling `cancel` terminates the child
    /// process and ends the stream with a synthetic, unsuccessful
    /// `Completed`.
    pub fn run(&self, prompt: String, resume: Option<ResumeToken>, cancel: CancellationToken) -> RunHandle {
        let engine = Arc::clone(&self.engine);
        let locks = Arc::clone(&self.locks);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move { run_impl(engine, locks, prompt, resume, cancel, tx).await });

        RunHandle { events: rx, task }
    }
}

async fn run_impl<E: Engine>(
    engine: Arc<E>,
    locks: Arc<LockRegistry>,
    prompt: String,
    resume: Option<ResumeToken>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TakopiEvent>,
) -> Result<()> {
    let mut guard = match &resume {
        Some(token) => Some(locks.lock_for(&token.lock_key()).await),
        None => None,
    };

    let args = engine.build_args(&prompt, resume.as_ref());
    let mut command = Command::new(engine.command());
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in engine.env() {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            send_synthetic_completion(&tx, engine.id().clone(), resume.clone(), false, "", &format!("failed to spawn child: {err}"));
            return Ok(());
        }
    };

    let payload = engine.stdin_payload(&prompt, resume.as_ref());
    if let Some(mut stdin) = child.stdin.take() {
        if payload.is_empty() {
            drop(stdin);
        } else {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    let stderr = child.stderr.take().expect("stderr piped");
    let stderr_tag = engine.tag().to_string();
    let stderr_task = tokio::spawn(async move {
        drain_stderr(BufReader::new(stderr), &stderr_tag).await;
    });

    let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped"));
    let mut state = RunState::default();
    let mut found_session: Option<ResumeToken> = None;
    let mut completed_emitted = false;
    let mut fatal: Option<String> = None;

    let mut cancelled = false;

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            line = read_line_framed(&mut stdout) => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            },
        };
        if completed_emitted {
            continue;
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::debug!(engine = engine.tag(), "{}", trimmed);

        let parsed: Result<serde_json::Value, _> = serde_json::from_str(trimmed);
        let data = match parsed {
            Ok(data) => data,
            Err(_) => {
                let id = state.next_note_id(engine.tag());
                let mut detail = HashMap::new();
                detail.insert("line".to_string(), serde_json::Value::String(trimmed.to_string()));
                let _ = tx.send(warning_action(engine.id().clone(), id, detail));
                continue;
            }
        };

        let mut events = match engine.translate(&data, &mut state, resume.as_ref(), found_session.as_ref()) {
            Ok(events) => events,
            Err(translation_err) => {
                let id = state.next_note_id(engine.tag());
                let mut detail = HashMap::new();
                detail.insert(
                    "error".to_string(),
                    serde_json::Value::String(translation_err.message),
                );
                if let Some(type_name) = translation_err.type_name {
                    detail.insert("type".to_string(), serde_json::Value::String(type_name));
                }
                if let Some(item_type) = translation_err.item_type {
                    detail.insert("item_type".to_string(), serde_json::Value::String(item_type));
                }
                let _ = tx.send(warning_action(engine.id().clone(), id, detail));
                continue;
            }
        };

        // The engine's own wire-event translation never knows about the
        // session found earlier in this same invocation; backfill it here,
        // the same `found_session or resume` precedence the runner already
        // applies to its own synthetic completions below.
        for event in &mut events {
            if let TakopiEvent::Completed { resume: completed_resume, .. } = event {
                *completed_resume = found_session.clone().or_else(|| resume.clone());
            }
        }

        for event in events {
            if let TakopiEvent::SessionStarted { engine: ev_engine, resume: ev_resume, .. } = &event {
                if ev_engine != engine.id() {
                    fatal = Some(format!(
                        "session engine mismatch: expected {}, got {ev_engine}",
                        engine.id()
                    ));
                    break;
                }
                if let Some(expected) = &resume {
                    if ev_resume != expected {
                        fatal = Some(format!(
                            "session resume mismatch: expected {}, got {}",
                            expected.value, ev_resume.value
                        ));
                        break;
                    }
                }
                match &found_session {
                    None => {
                        found_session = Some(ev_resume.clone());
                        if guard.is_none() {
                            guard = Some(locks.lock_for(&ev_resume.lock_key()).await);
                        }
                    }
                    Some(existing) if existing == ev_resume => {
                        // de-dupe: swallow the repeated SessionStarted
                        continue;
                    }
                    Some(_) => {
                        fatal = Some(format!(
                            "session resume changed mid-invocation: {} -> {}",
                            found_session.as_ref().unwrap().value,
                            ev_resume.value
                        ));
                        break;
                    }
                }
            }
            if event.is_completed() {
                completed_emitted = true;
            }
            let _ = tx.send(event);
        }

        if fatal.is_some() {
            break;
        }
    }

    if cancelled {
        let _ = child.kill().await;
        stderr_task.abort();
        let _ = child.wait().await;
        if !completed_emitted {
            send_synthetic_completion(
                &tx,
                engine.id().clone(),
                found_session.or(resume),
                false,
                "",
                "cancelled",
            );
        }
        return Ok(());
    }

    let _ = stderr_task.await;

    if let Some(message) = fatal {
        bail!(message);
    }

    let status = child.wait().await;

    if completed_emitted {
        return Ok(());
    }

    match status {
        Ok(exit_status) if exit_status.success() => {
            send_synthetic_completion(
                &tx,
                engine.id().clone(),
                found_session.or(resume),
                false,
                "",
                "finished without a result event",
            );
        }
        Ok(exit_status) => {
            let code = exit_status.code().unwrap_or(-1);
            let id = state.next_note_id(engine.tag());
            let mut detail = HashMap::new();
            detail.insert("exit_code".to_string(), serde_json::Value::from(code));
            let _ = tx.send(warning_action(engine.id().clone(), id, detail));
            send_synthetic_completion(
                &tx,
                engine.id().clone(),
                found_session.or(resume),
                false,
                "",
                &format!("child exited abnormally (rc={code})"),
            );
        }
        Err(err) => {
            send_synthetic_completion(
                &tx,
                engine.id().clone(),
                found_session.or(resume),
                false,
                "",
                &format!("failed to wait for child: {err}"),
            );
        }
    }

    Ok(())
}

fn warning_action(
    engine: EngineId,
    id: String,
    detail: HashMap<String, serde_json::Value>,
) -> TakopiEvent {
    TakopiEvent::ActionCompleted {
        engine,
        action: Action {
            id,
            kind: ActionKind::Warning,
            title: "warning".to_string(),
            detail: detail.clone(),
        },
        ok: false,
        message: None,
        level: ActionLevel::Warning,
        detail,
    }
}

fn send_synthetic_completion(
    tx: &mpsc::UnboundedSender<TakopiEvent>,
    engine: EngineId,
    resume: Option<ResumeToken>,
    ok: bool,
    answer: &str,
    error: &str,
) {
    let _ = tx.send(TakopiEvent::Completed {
        engine,
        ok,
        answer: answer.to_string(),
        resume,
        error: Some(error.to_string()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEngine {
        id: EngineId,
    }

    impl Engine for EchoEngine {
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
        ) -> Result<Vec<TakopiEvent>, TranslationError> {
            if data.get("type").and_then(|v| v.as_str()) == Some("turn.completed") {
                let answer = data
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok: true,
                    answer,
                    resume: None,
                    error: None,
                }]);
            }
            Err(TranslationError::new("unrecognized event"))
        }
    }

    #[tokio::test]
    async fn run_ends_with_exactly_one_completed() {
        let runner = JsonlSubprocessRunner::new(
            Arc::new(EchoEngine { id: "echo".to_string() }),
            Arc::new(LockRegistry::new()),
        );
        let mut handle = runner.run(
            "{\"type\":\"turn.completed\",\"text\":\"hi\"}\n".to_string(),
            None,
            CancellationToken::new(),
        );

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        handle.task.await.unwrap().unwrap();

        let completed_count = events.iter().filter(|e| e.is_completed()).count();
        assert_eq!(completed_count, 1);
        assert!(events.last().unwrap().is_completed());
    }

    struct SleepEngine {
        id: EngineId,
    }

    impl Engine for SleepEngine {
        fn id(&self) -> &EngineId {
            &self.id
        }

        fn command(&self) -> &str {
            "sleep"
        }

        fn build_args(&self, _prompt: &str, _resume: Option<&ResumeToken>) -> Vec<String> {
            vec!["5".to_string()]
        }

        fn stdin_payload(&self, _prompt: &str, _resume: Option<&ResumeToken>) -> String {
            String::new()
        }

        fn translate(
            &self,
            _data: &serde_json::Value,
            _state: &mut RunState,
            _resume: Option<&ResumeToken>,
            _found_session: Option<&ResumeToken>,
        ) -> Result<Vec<TakopiEvent>, TranslationError> {
            Err(TranslationError::new("sleep never writes stdout"))
        }
    }

    #[tokio::test]
    async fn cancelling_kills_the_child_and_synthesizes_a_failed_completion() {
        let runner = JsonlSubprocessRunner::new(
            Arc::new(SleepEngine { id: "sleep".to_string() }),
            Arc::new(LockRegistry::new()),
        );
        let cancel = CancellationToken::new();
        let mut handle = runner.run(String::new(), None, cancel.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        handle.task.await.unwrap().unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            TakopiEvent::Completed { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error.as_deref(), Some("cancelled"));
            }
            _ => panic!("expected a synthetic Completed event"),
        }
    }
}
