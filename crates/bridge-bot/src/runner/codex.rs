//! Translation for the `codex exec` JSONL wire protocol: `session.started`,
//! `item.started`/`item.updated`/`item.completed`, `turn.completed`,
//! `turn.failed`, `error`. Grounded on the event-shape handling in
//! `exec_render.py` (`render_event_cli`/`render_event_progress`), which
//! observes the same wire protocol this translator consumes.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{Action, ActionKind, ActionLevel, EngineId, ResumeToken, RunState, TakopiEvent};
use crate::runner::{Engine, TranslationError};

pub struct CodexEngine {
    id: EngineId,
    command: String,
    extra_args: Vec<String>,
}

impl CodexEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: "codex".to_string(),
            command: command.into(),
            extra_args: Vec::new(),
        }
    }

    /// Static args from `config.engines.codex.args`, prepended before the
    /// engine's own `exec --json [resume …]` flags.
    pub fn with_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }
}

impl Engine for CodexEngine {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn build_args(&self, _prompt: &str, resume: Option<&ResumeToken>) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push("exec".to_string());
        args.push("--json".to_string());
        if let Some(token) = resume {
            args.push("resume".to_string());
            args.push(token.value.clone());
        }
        args
    }

    fn stdin_payload(&self, prompt: &str, _resume: Option<&ResumeToken>) -> String {
        prompt.to_string()
    }

    fn translate(
        &self,
        data: &Value,
        _state: &mut RunState,
        _resume: Option<&ResumeToken>,
        _found_session: Option<&ResumeToken>,
    ) -> Result<Vec<TakopiEvent>, TranslationError> {
        let etype = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TranslationError::new("event missing \"type\""))?;

        match etype {
            "session.started" => {
                let thread_id = data
                    .get("thread_id")
                    .or_else(|| data.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| TranslationError::new("session.started missing thread id"))?;
                Ok(vec![TakopiEvent::SessionStarted {
                    engine: self.id.clone(),
                    resume: ResumeToken::new(self.id.clone(), thread_id),
                    title: None,
                }])
            }
            "turn.started" => Ok(Vec::new()),
            "turn.completed" => {
                let answer = data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok: true,
                    answer,
                    resume: None,
                    error: None,
                }])
            }
            "turn.failed" => {
                let error = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("turn failed")
                    .to_string();
                Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok: false,
                    answer: String::new(),
                    resume: None,
                    error: Some(error),
                }])
            }
            "error" => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok: false,
                    answer: String::new(),
                    resume: None,
                    error: Some(message),
                }])
            }
            "item.started" | "item.updated" | "item.completed" => {
                translate_item(&self.id, etype, data)
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn translate_item(engine: &EngineId, etype: &str, data: &Value) -> Result<Vec<TakopiEvent>, TranslationError> {
    let item = data.get("item").ok_or_else(|| TranslationError::new("item event missing item"))?;
    let item_id = item
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("item")
        .to_string();
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let status = item.get("status").and_then(Value::as_str);
    let started = etype == "item.started";

    let event = match item_type {
        "command_execution" => {
            let command = item.get("command").and_then(Value::as_str).unwrap_or_default();
            let mut detail = HashMap::new();
            detail.insert("command".to_string(), Value::String(command.to_string()));
            if started {
                TakopiEvent::ActionStarted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::Command,
                        title: command.to_string(),
                        detail,
                    },
                }
            } else {
                let exit_code = item.get("exit_code").and_then(Value::as_i64);
                let ok = status == Some("completed") && exit_code == Some(0);
                if let Some(code) = exit_code {
                    detail.insert("exit_code".to_string(), Value::from(code));
                }
                TakopiEvent::ActionCompleted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::Command,
                        title: command.to_string(),
                        detail: detail.clone(),
                    },
                    ok,
                    message: None,
                    level: if ok { ActionLevel::Info } else { ActionLevel::Warning },
                    detail,
                }
            }
        }
        "file_change" => {
            let changes = item.get("changes").cloned().unwrap_or(Value::Array(Vec::new()));
            let mut detail = HashMap::new();
            detail.insert("changes".to_string(), changes);
            if started {
                TakopiEvent::ActionStarted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::FileChange,
                        title: "file changes".to_string(),
                        detail,
                    },
                }
            } else {
                TakopiEvent::ActionCompleted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::FileChange,
                        title: "file changes".to_string(),
                        detail: detail.clone(),
                    },
                    ok: true,
                    message: None,
                    level: ActionLevel::Info,
                    detail,
                }
            }
        }
        "mcp_tool_call" => {
            let server = item.get("server").and_then(Value::as_str).unwrap_or_default();
            let tool = item.get("tool").and_then(Value::as_str).unwrap_or_default();
            let title = format!("{server}.{tool}");
            let mut detail = HashMap::new();
            detail.insert("server".to_string(), Value::String(server.to_string()));
            detail.insert("tool".to_string(), Value::String(tool.to_string()));
            if started {
                TakopiEvent::ActionStarted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::Tool,
                        title,
                        detail,
                    },
                }
            } else {
                let ok = item.get("error").is_none();
                TakopiEvent::ActionCompleted {
                    engine: engine.clone(),
                    action: Action {
                        id: item_id,
                        kind: ActionKind::Tool,
                        title,
                        detail: detail.clone(),
                    },
                    ok,
                    message: None,
                    level: if ok { ActionLevel::Info } else { ActionLevel::Warning },
                    detail,
                }
            }
        }
        "web_search" => {
            let query = item.get("query").and_then(Value::as_str).unwrap_or_default();
            let mut detail = HashMap::new();
            detail.insert("query".to_string(), Value::String(query.to_string()));
            TakopiEvent::ActionCompleted {
                engine: engine.clone(),
                action: Action {
                    id: item_id,
                    kind: ActionKind::WebSearch,
                    title: query.to_string(),
                    detail: detail.clone(),
                },
                ok: true,
                message: None,
                level: ActionLevel::Info,
                detail,
            }
        }
        "agent_message" => return Ok(Vec::new()),
        _ => return Ok(Vec::new()),
    };

    Ok(vec![event])
}
