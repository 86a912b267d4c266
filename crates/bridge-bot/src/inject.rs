//! Injection watcher (C7): polls a directory for `*.json` prompt files and
//! dispatches them through the same orchestrator path as a user message.
//! Ported from `original_source/src/takopi/telegram/inject.py`'s
//! `watch_inject_dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const SYSTEM_PREFIX: &str = "[SYSTEM] ";

#[derive(Debug, Deserialize)]
struct InjectFile {
    #[serde(default)]
    text: String,
    #[serde(default)]
    new_session: bool,
}

/// One parsed injection, ready to be handed to the orchestrator as if it
/// were an inbound chat message.
pub struct Injection {
    pub text: String,
    pub new_session: bool,
}

/// Polls `dir` every `poll_interval` for `*.json` files and invokes
/// `on_injection` for each one, in sorted name order. Runs until
/// `cancel` is triggered. Errors within the loop are logged and do not stop
/// polling.
pub async fn watch_inject_dir<F, Fut>(
    dir: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
    mut on_injection: F,
) where
    F: FnMut(Injection) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(poll_interval) => {}
        }

        let mut entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>(),
            Err(err) => {
                tracing::warn!(error = %err, "inject.watcher.error reading directory");
                continue;
            }
        };
        entries.sort();

        for path in entries {
            match process_one(&path) {
                Ok(Some(injection)) => on_injection(injection).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, file = %path.display(), "inject.watcher.error malformed file");
                    mark_bad(&path);
                }
            }
        }
    }
}

fn process_one(path: &Path) -> anyhow::Result<Option<Injection>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: InjectFile = serde_json::from_str(&raw)?;
    let _ = std::fs::remove_file(path);

    let text = parsed.text.trim();
    if text.is_empty() {
        tracing::warn!(file = %path.display(), "inject.watcher.empty_text");
        return Ok(None);
    }

    Ok(Some(Injection {
        text: format!("{SYSTEM_PREFIX}{text}"),
        new_session: parsed.new_session,
    }))
}

fn mark_bad(path: &Path) {
    let bad_path = path.with_extension("bad");
    let _ = std::fs::rename(path, bad_path);
}
