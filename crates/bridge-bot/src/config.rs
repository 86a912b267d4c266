//! Configuration (C9): TOML discovery, legacy-key migration, and the typed
//! [`Config`] the rest of the bridge consumes. Ported from
//! `original_source/src/takopi/config.py` (candidate-path discovery,
//! `ConfigError`) and `original_source/src/takopi/config_migrations.py`
//! (`_migrate_legacy_telegram`, `_migrate_topics_scope`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::model::EngineId;

const CONFIG_FILE_NAME: &str = "takopi.toml";

pub mod paths {
    use std::path::PathBuf;

    /// `TAKOPI_HOME` env var if set, else the platform config dir joined
    /// with `takopi` (mirrors the teacher's `ZDX_HOME` resolution order).
    pub fn config_dir() -> PathBuf {
        if let Ok(home) = std::env::var("TAKOPI_HOME") {
            return PathBuf::from(home);
        }
        dirs::config_dir()
            .map(|dir| dir.join("takopi"))
            .unwrap_or_else(|| PathBuf::from(".takopi"))
    }

    pub fn config_path() -> PathBuf {
        config_dir().join(super::CONFIG_FILE_NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub transports: Transports,
    #[serde(default)]
    pub inject_dir: Option<PathBuf>,
    #[serde(default = "default_inject_poll_interval")]
    pub inject_poll_interval_secs: u64,
    #[serde(default = "default_engine")]
    pub engine: EngineId,
    #[serde(default)]
    pub engines: HashMap<EngineId, EngineConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Resolves the command and extra static args for `engine`, falling
    /// back to the engine's own name as the command when unconfigured
    /// (e.g. `engine = "codex"` runs the `codex` binary on PATH).
    pub fn engine_command(&self, engine: &str) -> (String, Vec<String>) {
        match self.engines.get(engine) {
            Some(cfg) => (cfg.command.clone().unwrap_or_else(|| engine.to_string()), cfg.args.clone()),
            None => (engine.to_string(), Vec::new()),
        }
    }
}

fn default_transport() -> String {
    "telegram".to_string()
}

fn default_inject_poll_interval() -> u64 {
    2
}

fn default_engine() -> String {
    "codex".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transports {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub allowlist_user_ids: Vec<i64>,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub voice_transcription: bool,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let cwd_candidate = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(CONFIG_FILE_NAME);
    let home_candidate = paths::config_path();
    if cwd_candidate == home_candidate {
        vec![cwd_candidate]
    } else {
        vec![cwd_candidate, home_candidate]
    }
}

/// Loads config from an explicit path, or from the default candidate
/// locations (current directory, then the platform config dir).
pub fn load(explicit_path: Option<&Path>) -> Result<Config> {
    let (raw, loaded_from) = match explicit_path {
        Some(path) => (read_config_file(path)?, path.to_path_buf()),
        None => {
            let candidates = candidate_paths();
            let found = candidates.iter().find(|path| path.is_file());
            match found {
                Some(path) => (read_config_file(path)?, path.clone()),
                None => bail!(missing_config_message(&candidates)),
            }
        }
    };

    let mut value: Value = raw
        .parse()
        .with_context(|| format!("malformed TOML in {}", loaded_from.display()))?;
    let migrated = migrate_config(&mut value);
    let config: Config = value.clone().try_into().context("config does not match the expected shape")?;

    validate(&config)?;

    if migrated {
        let rewritten = toml::to_string_pretty(&value).context("serialize migrated config")?;
        std::fs::write(&loaded_from, rewritten)
            .with_context(|| format!("failed to write migrated config to {}", loaded_from.display()))?;
        tracing::info!(path = %loaded_from.display(), "config migrated to the current schema");
    }

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))
}

fn missing_config_message(candidates: &[PathBuf]) -> String {
    if candidates.len() == 1 {
        format!("missing config file `{}`", candidates[0].display())
    } else {
        format!(
            "missing takopi config. Create one of these files:\n  {}\n  {}",
            candidates[0].display(),
            candidates[1].display()
        )
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.transport == "telegram" {
        let telegram = &config.transports.telegram;
        if telegram.bot_token.as_deref().unwrap_or_default().trim().is_empty() {
            bail!("transports.telegram.bot_token is required when transport = \"telegram\"");
        }
        if telegram.chat_id.is_none() {
            bail!("transports.telegram.chat_id is required when transport = \"telegram\"");
        }
        if telegram.allowlist_user_ids.is_empty() {
            bail!("transports.telegram.allowlist_user_ids must contain at least one user id");
        }
    }
    Ok(())
}

/// Runs every migration in sequence over an untyped TOML tree and returns
/// whether any of them fired. Each migration is a pure, idempotent
/// tree-to-tree transform.
fn migrate_config(value: &mut Value) -> bool {
    let mut migrated = false;
    migrated |= migrate_legacy_telegram(value);
    migrated |= migrate_topics_scope(value);
    migrated
}

fn ensure_table<'a>(value: &'a mut Value, key: &str) -> &'a mut toml::value::Table {
    let table = value.as_table_mut().expect("config root must be a table");
    table
        .entry(key)
        .or_insert_with(|| Value::Table(toml::value::Table::new()))
        .as_table_mut()
        .expect("expected a table")
}

fn migrate_legacy_telegram(value: &mut Value) -> bool {
    let Some(table) = value.as_table_mut() else {
        return false;
    };
    let bot_token = table.remove("bot_token");
    let chat_id = table.remove("chat_id");
    if bot_token.is_none() && chat_id.is_none() {
        return false;
    }

    {
        let transports = ensure_table(value, "transports");
        transports
            .entry("telegram")
            .or_insert_with(|| Value::Table(toml::value::Table::new()));
    }
    let transports = value.get_mut("transports").unwrap().as_table_mut().unwrap();
    let telegram = transports.get_mut("telegram").unwrap().as_table_mut().unwrap();
    if let Some(token) = bot_token {
        telegram.entry("bot_token").or_insert(token);
    }
    if let Some(chat_id) = chat_id {
        telegram.entry("chat_id").or_insert(chat_id);
    }

    let table = value.as_table_mut().unwrap();
    table
        .entry("transport")
        .or_insert_with(|| Value::String("telegram".to_string()));

    true
}

fn migrate_topics_scope(value: &mut Value) -> bool {
    let mode = value
        .get("transports")
        .and_then(|t| t.get("telegram"))
        .and_then(|t| t.get("topics"))
        .and_then(|t| t.get("mode"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let Some(mode) = mode else {
        return false;
    };

    let scope = match mode.as_str() {
        "multi_project_chat" => "main",
        "per_project_chat" => "projects",
        other => other,
    };

    let transports = ensure_table(value, "transports");
    let telegram = transports
        .entry("telegram")
        .or_insert_with(|| Value::Table(toml::value::Table::new()))
        .as_table_mut()
        .unwrap();
    let topics = telegram
        .entry("topics")
        .or_insert_with(|| Value::Table(toml::value::Table::new()))
        .as_table_mut()
        .unwrap();
    topics.remove("mode");
    topics.insert("scope".to_string(), Value::String(scope.to_string()));

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_command_falls_back_to_the_engine_name() {
        let config = Config {
            transport: default_transport(),
            transports: Transports::default(),
            inject_dir: None,
            inject_poll_interval_secs: default_inject_poll_interval(),
            engine: default_engine(),
            engines: HashMap::new(),
        };
        assert_eq!(config.engine_command("codex"), ("codex".to_string(), Vec::new()));
    }

    #[test]
    fn engine_command_uses_the_configured_override() {
        let mut engines = HashMap::new();
        engines.insert(
            "codex".to_string(),
            EngineConfig { command: Some("/opt/codex/bin/codex".to_string()), args: vec!["--danger".to_string()] },
        );
        let config = Config {
            transport: default_transport(),
            transports: Transports::default(),
            inject_dir: None,
            inject_poll_interval_secs: default_inject_poll_interval(),
            engine: default_engine(),
            engines,
        };
        assert_eq!(
            config.engine_command("codex"),
            ("/opt/codex/bin/codex".to_string(), vec!["--danger".to_string()])
        );
    }

    #[test]
    fn legacy_telegram_keys_migrate_and_idempotent() {
        let toml_src = r#"
            bot_token = "T"
            chat_id = 42

            [transports.telegram.topics]
            mode = "per_project_chat"
        "#;
        let mut value: Value = toml_src.parse().unwrap();
        let fired_first = migrate_config(&mut value);
        assert!(fired_first);

        assert_eq!(
            value["transports"]["telegram"]["bot_token"].as_str(),
            Some("T")
        );
        assert_eq!(value["transports"]["telegram"]["chat_id"].as_integer(), Some(42));
        assert_eq!(value["transport"].as_str(), Some("telegram"));
        assert_eq!(
            value["transports"]["telegram"]["topics"]["scope"].as_str(),
            Some("projects")
        );
        assert!(value.get("bot_token").is_none());
        assert!(value.get("chat_id").is_none());
        assert!(value["transports"]["telegram"]["topics"].get("mode").is_none());

        let fired_second = migrate_config(&mut value);
        assert!(!fired_second, "re-running migration must be a no-op");
    }

    #[test]
    fn multi_project_chat_maps_to_main() {
        let mut value: Value = r#"
            [transports.telegram.topics]
            mode = "multi_project_chat"
        "#
        .parse()
        .unwrap();
        migrate_config(&mut value);
        assert_eq!(
            value["transports"]["telegram"]["topics"]["scope"].as_str(),
            Some("main")
        );
    }

    #[test]
    fn modern_config_is_untouched() {
        let mut value: Value = r#"
            transport = "telegram"
            [transports.telegram]
            bot_token = "T"
            chat_id = 42
        "#
        .parse()
        .unwrap();
        let fired = migrate_config(&mut value);
        assert!(!fired);
    }
}
