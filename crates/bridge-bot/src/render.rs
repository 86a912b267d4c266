//! Progress renderer (C6): a stateful fold over [`TakopiEvent`] producing a
//! bounded, deduplicated, paint-efficient chat body. Ported from
//! `original_source/codex_telegram_bridge/.../exec_render.py`'s
//! `ExecRenderState`/`ExecProgressRenderer`, generalized from the codex wire
//! shape to the engine-agnostic [`TakopiEvent`] union.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::model::{Action, ActionKind, ResumeToken, TakopiEvent};

const DEFAULT_MAX_ACTIONS: usize = 5;

#[derive(Default)]
pub struct ProgressRenderer {
    action_count: u64,
    recent_actions: VecDeque<(String, String)>, // (action id, rendered line)
    seen_action_ids: HashMap<String, usize>,
    max_actions: usize,
    last_resume: Option<ResumeToken>,
    last_title: Option<String>,
    cwd: Option<String>,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self {
            max_actions: DEFAULT_MAX_ACTIONS,
            ..Self::default()
        }
    }

    pub fn with_cwd(cwd: impl Into<String>) -> Self {
        Self {
            max_actions: DEFAULT_MAX_ACTIONS,
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    /// Folds one event into renderer state. Returns whether the state
    /// changed (the orchestrator uses this to decide whether a throttled
    /// edit is worth sending).
    pub fn note_event(&mut self, event: &TakopiEvent) -> bool {
        match event {
            TakopiEvent::SessionStarted { resume, title, .. } => {
                self.last_resume = Some(resume.clone());
                self.last_title = title.clone();
                true
            }
            TakopiEvent::ActionStarted { action, .. } => {
                let line = render_line(action, true, None, self.cwd.as_deref());
                self.upsert(&action.id, line, true)
            }
            TakopiEvent::ActionCompleted { action, ok, .. } => {
                let line = render_line(action, false, Some(*ok), self.cwd.as_deref());
                self.upsert(&action.id, line, !self.seen_action_ids.contains_key(&action.id))
            }
            TakopiEvent::Completed { .. } => false,
        }
    }

    fn upsert(&mut self, id: &str, line: String, count_if_new: bool) -> bool {
        if let Some(&slot) = self.seen_action_ids.get(id) {
            if slot < self.recent_actions.len() && self.recent_actions[slot].0 == id {
                self.recent_actions[slot].1 = line;
                return true;
            }
        }

        if self.recent_actions.len() >= self.max_actions {
            if let Some((evicted_id, _)) = self.recent_actions.pop_front() {
                self.seen_action_ids.remove(&evicted_id);
                for value in self.seen_action_ids.values_mut() {
                    *value = value.saturating_sub(1);
                }
            }
        }
        let slot = self.recent_actions.len();
        self.recent_actions.push_back((id.to_string(), line));
        self.seen_action_ids.insert(id.to_string(), slot);
        if count_if_new {
            self.action_count += 1;
        }
        true
    }

    pub fn render_progress(&self, elapsed_s: u64) -> String {
        let mut lines = vec![format!("working · {elapsed_s}s · step {}", self.action_count)];
        lines.extend(self.recent_actions.iter().map(|(_, line)| line.clone()));
        if let Some(hint) = self.resume_hint() {
            lines.push(hint);
        }
        lines.join("\n")
    }

    pub fn render_final(&self, elapsed_s: u64, answer: &str, ok: bool) -> String {
        let status = if ok { "done" } else { "error" };
        let mut parts = vec![format!("{status} · {elapsed_s}s · step {}", self.action_count)];
        parts.push(String::new());
        parts.push(answer.to_string());
        if let Some(hint) = self.resume_hint() {
            parts.push(String::new());
            parts.push(hint);
        }
        parts.join("\n")
    }

    fn resume_hint(&self) -> Option<String> {
        self.last_resume
            .as_ref()
            .map(|token| format!("resume: {} {}", token.engine, token.value))
    }
}

fn render_line(action: &Action, started: bool, ok: Option<bool>, cwd: Option<&str>) -> String {
    match action.kind {
        ActionKind::Command => {
            let command = action.title.as_str();
            if started {
                format!("▸ `{command}`")
            } else {
                match ok {
                    Some(true) => format!("✓ `{command}`"),
                    _ => {
                        let code = action
                            .detail
                            .get("exit_code")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(-1);
                        format!("✗ `{command}` (exit {code})")
                    }
                }
            }
        }
        ActionKind::Tool => format!("tool: {}", action.title),
        ActionKind::WebSearch => format!("searched: {}", action.title),
        ActionKind::FileChange => render_file_change(action, cwd),
        ActionKind::Note | ActionKind::Warning => match ok {
            Some(false) | None => format!("✗ {}", action.title),
            Some(true) => format!("✓ {}", action.title),
        },
    }
}

fn render_file_change(action: &Action, cwd: Option<&str>) -> String {
    let Some(changes) = action.detail.get("changes").and_then(|v| v.as_array()) else {
        return "files: (no changes)".to_string();
    };
    let rendered: Vec<String> = changes
        .iter()
        .map(|change| {
            let kind = change.get("kind").and_then(|v| v.as_str()).unwrap_or("change");
            let path = change.get("path").and_then(|v| v.as_str()).unwrap_or("");
            format!("{kind} `{}`", relativize(path, cwd))
        })
        .collect();
    format!("files: {}", rendered.join(", "))
}

/// Renders an absolute path relative to `cwd` when it syntactically resolves
/// inside it; otherwise leaves it verbatim.
fn relativize(path: &str, cwd: Option<&str>) -> String {
    let (Some(cwd), true) = (cwd, Path::new(path).is_absolute()) else {
        return path.to_string();
    };
    Path::new(path)
        .strip_prefix(cwd)
        .ok()
        .map(|rel| rel.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_action(id: &str, command: &str) -> Action {
        let mut detail = HashMap::new();
        detail.insert("command".to_string(), serde_json::Value::String(command.to_string()));
        Action {
            id: id.to_string(),
            kind: ActionKind::Command,
            title: command.to_string(),
            detail,
        }
    }

    #[test]
    fn session_started_does_not_bump_action_count() {
        let mut renderer = ProgressRenderer::new();
        let changed = renderer.note_event(&TakopiEvent::SessionStarted {
            engine: "codex".to_string(),
            resume: ResumeToken::new("codex", "sess-1"),
            title: None,
        });
        assert!(changed);
        assert!(renderer.render_progress(1).contains("step 0"));
    }

    #[test]
    fn started_then_completed_replaces_the_same_slot() {
        let mut renderer = ProgressRenderer::new();
        renderer.note_event(&TakopiEvent::ActionStarted {
            engine: "codex".to_string(),
            action: command_action("i1", "ls"),
        });
        assert!(renderer.render_progress(0).contains("▸ `ls`"));
        assert_eq!(renderer.action_count, 1);

        renderer.note_event(&TakopiEvent::ActionCompleted {
            engine: "codex".to_string(),
            action: command_action("i1", "ls"),
            ok: true,
            message: None,
            level: crate::model::ActionLevel::Info,
            detail: HashMap::new(),
        });
        assert!(renderer.render_progress(0).contains("✓ `ls`"));
        assert!(!renderer.render_progress(0).contains("▸"));
        assert_eq!(renderer.action_count, 1, "completing a started action must not double-count");
    }

    #[test]
    fn orphan_completion_is_tolerated_and_counted() {
        let mut renderer = ProgressRenderer::new();
        renderer.note_event(&TakopiEvent::ActionCompleted {
            engine: "codex".to_string(),
            action: command_action("i1", "ls"),
            ok: true,
            message: None,
            level: crate::model::ActionLevel::Info,
            detail: HashMap::new(),
        });
        assert_eq!(renderer.action_count, 1);
    }

    #[test]
    fn deque_eviction_forgets_the_evicted_id() {
        let mut renderer = ProgressRenderer::new();
        for i in 0..DEFAULT_MAX_ACTIONS + 1 {
            renderer.note_event(&TakopiEvent::ActionStarted {
                engine: "codex".to_string(),
                action: command_action(&format!("i{i}"), &format!("cmd{i}")),
            });
        }
        assert_eq!(renderer.recent_actions.len(), DEFAULT_MAX_ACTIONS);
        assert!(!renderer.seen_action_ids.contains_key("i0"));
    }

    #[test]
    fn rendering_is_deterministic_for_equal_inputs() {
        let mut a = ProgressRenderer::new();
        let mut b = ProgressRenderer::new();
        let action = command_action("i1", "ls");
        a.note_event(&TakopiEvent::ActionStarted { engine: "codex".to_string(), action: action.clone() });
        b.note_event(&TakopiEvent::ActionStarted { engine: "codex".to_string(), action });
        assert_eq!(a.render_progress(5), b.render_progress(5));
    }

    #[test]
    fn file_change_path_inside_cwd_is_relativized() {
        let mut renderer = ProgressRenderer::with_cwd("/home/user/project");
        let mut detail = HashMap::new();
        detail.insert(
            "changes".to_string(),
            serde_json::json!([{"kind": "update", "path": "/home/user/project/src/lib.rs"}]),
        );
        renderer.note_event(&TakopiEvent::ActionCompleted {
            engine: "codex".to_string(),
            action: Action {
                id: "i1".to_string(),
                kind: ActionKind::FileChange,
                title: "file changes".to_string(),
                detail,
            },
            ok: true,
            message: None,
            level: crate::model::ActionLevel::Info,
            detail: HashMap::new(),
        });
        assert!(renderer.render_progress(0).contains("update `src/lib.rs`"));
    }
}
