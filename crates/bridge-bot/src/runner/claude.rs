//! Translation for the `claude --output-format stream-json` wire protocol:
//! `system`/`init` (session identity), `assistant` (tool uses), and
//! `result` (turn completion). A second concrete [`Engine`], demonstrating
//! the extensibility seam alongside [`crate::runner::codex::CodexEngine`].

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{Action, ActionKind, ActionLevel, EngineId, ResumeToken, RunState, TakopiEvent};
use crate::runner::{Engine, TranslationError};

pub struct ClaudeEngine {
    id: EngineId,
    command: String,
    extra_args: Vec<String>,
}

impl ClaudeEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: "claude".to_string(),
            command: command.into(),
            extra_args: Vec::new(),
        }
    }

    /// Static args from `config.engines.claude.args`, prepended before the
    /// engine's own `--print --output-format stream-json […]` flags.
    pub fn with_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }
}

impl Engine for ClaudeEngine {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn build_args(&self, _prompt: &str, resume: Option<&ResumeToken>) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push("--print".to_string());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        if let Some(token) = resume {
            args.push("--resume".to_string());
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
            "system" if data.get("subtype").and_then(Value::as_str) == Some("init") => {
                let session_id = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TranslationError::new("system/init missing session_id"))?;
                Ok(vec![TakopiEvent::SessionStarted {
                    engine: self.id.clone(),
                    resume: ResumeToken::new(self.id.clone(), session_id),
                    title: None,
                }])
            }
            "system" => Ok(Vec::new()),
            "assistant" => translate_assistant(&self.id, data),
            "result" => {
                let ok = data.get("is_error").and_then(Value::as_bool) != Some(true);
                let answer = data
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let error = if ok {
                    None
                } else {
                    Some(
                        data.get("result")
                            .and_then(Value::as_str)
                            .unwrap_or("turn failed")
                            .to_string(),
                    )
                };
                Ok(vec![TakopiEvent::Completed {
                    engine: self.id.clone(),
                    ok,
                    answer,
                    resume: None,
                    error,
                }])
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn translate_assistant(engine: &EngineId, data: &Value) -> Result<Vec<TakopiEvent>, TranslationError> {
    let content = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);
    let Some(content) = content else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    for block in content {
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            continue;
        }
        let id = block
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("tool")
            .to_string();
        let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
        let mut detail = HashMap::new();
        if let Some(input) = block.get("input") {
            detail.insert("input".to_string(), input.clone());
        }
        events.push(TakopiEvent::ActionStarted {
            engine: engine.clone(),
            action: Action {
                id,
                kind: ActionKind::Tool,
                title: name.to_string(),
                detail,
            },
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_init_to_session_started() {
        let engine = ClaudeEngine::new("claude");
        let mut state = RunState::default();
        let data: Value =
            serde_json::from_str(r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#).unwrap();
        let events = engine.translate(&data, &mut state, None, None).unwrap();
        match &events[0] {
            TakopiEvent::SessionStarted { resume, .. } => assert_eq!(resume.value, "abc-123"),
            _ => panic!("expected SessionStarted"),
        }
    }

    #[test]
    fn translates_result_to_completed() {
        let engine = ClaudeEngine::new("claude");
        let mut state = RunState::default();
        let data: Value =
            serde_json::from_str(r#"{"type":"result","is_error":false,"result":"done"}"#).unwrap();
        let events = engine.translate(&data, &mut state, None, None).unwrap();
        match &events[0] {
            TakopiEvent::Completed { ok, answer, .. } => {
                assert!(ok);
                assert_eq!(answer, "done");
            }
            _ => panic!("expected Completed"),
        }
    }

    #[test]
    fn unknown_event_type_is_a_translation_error() {
        let engine = ClaudeEngine::new("claude");
        let mut state = RunState::default();
        let data: Value = serde_json::from_str(r#"{"no_type_field": true}"#).unwrap();
        assert!(engine.translate(&data, &mut state, None, None).is_err());
    }
}
