//! Persistent session store (C5): JSON-on-disk, schema-versioned,
//! mtime-reloaded, atomically-written per-chat session history with a
//! per-engine active pointer and LRU pruning. Ported closely from
//! `original_source/src/takopi/telegram/chat_sessions.py`'s
//! `ChatSessionStore`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::Mutex;

use crate::model::{ChatKey, ChatState, EngineId, ResumeToken, SessionInfo, StoreState};

pub const MAX_SESSIONS_PER_CHAT: usize = 20;
const STATE_FILENAME: &str = "telegram_chat_sessions_state.json";

pub fn resolve_sessions_path(config_dir: &Path) -> PathBuf {
    config_dir.join(STATE_FILENAME)
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct Loaded {
    state: StoreState,
    mtime: Option<SystemTime>,
}

pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<Loaded>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> io::Result<Self> {
        let (state, mtime) = load_from_disk(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Loaded { state, mtime }),
        })
    }

    async fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> io::Result<R> {
        let mut loaded = self.inner.lock().await;
        self.reload_if_stale(&mut loaded)?;
        let result = f(&mut loaded.state);
        write_atomic(&self.path, &loaded.state)?;
        loaded.mtime = file_mtime(&self.path)?;
        Ok(result)
    }

    async fn with_state_readonly<R>(&self, f: impl FnOnce(&StoreState) -> R) -> io::Result<R> {
        let mut loaded = self.inner.lock().await;
        self.reload_if_stale(&mut loaded)?;
        Ok(f(&loaded.state))
    }

    fn reload_if_stale(&self, loaded: &mut Loaded) -> io::Result<()> {
        let current_mtime = file_mtime(&self.path)?;
        if current_mtime != loaded.mtime {
            let (state, mtime) = load_from_disk(&self.path)?;
            loaded.state = state;
            loaded.mtime = mtime;
        }
        Ok(())
    }

    pub async fn get_session_resume(&self, key: ChatKey, engine: &EngineId) -> io::Result<Option<ResumeToken>> {
        self.with_state_readonly(|state| {
            let chat = state.chats.get(&key.as_string())?;
            let resume_value = chat.active.get(engine)?;
            chat.history
                .get(resume_value)
                .map(|_| ResumeToken::new(engine.clone(), resume_value.clone()))
        })
        .await
    }

    pub async fn set_session_resume(
        &self,
        key: ChatKey,
        token: &ResumeToken,
        first_message: Option<&str>,
    ) -> io::Result<()> {
        self.with_state(|state| {
            let chat = state.chats.entry(key.as_string()).or_default();
            let ts = now();
            match chat.history.get_mut(&token.value) {
                Some(existing) => {
                    existing.updated_at = ts;
                    if existing.first_message.is_none() {
                        existing.first_message = first_message.map(|m| truncate_bytes(m, 100));
                    }
                }
                None => {
                    chat.history.insert(
                        token.value.clone(),
                        SessionInfo {
                            resume: token.value.clone(),
                            engine: token.engine.clone(),
                            title: None,
                            first_message: first_message.map(|m| truncate_bytes(m, 100)),
                            created_at: ts,
                            updated_at: ts,
                        },
                    );
                }
            }
            chat.active.insert(token.engine.clone(), token.value.clone());
            prune_engine(chat, &token.engine);
        })
        .await
    }

    pub async fn clear_sessions(&self, key: ChatKey) -> io::Result<()> {
        self.with_state(|state| {
            if let Some(chat) = state.chats.get_mut(&key.as_string()) {
                chat.active.clear();
            }
        })
        .await
    }

    pub async fn new_session(&self, key: ChatKey, engine: &EngineId) -> io::Result<()> {
        self.with_state(|state| {
            if let Some(chat) = state.chats.get_mut(&key.as_string()) {
                chat.active.remove(engine);
            }
        })
        .await
    }

    pub async fn list_sessions(&self, key: ChatKey, engine: Option<&EngineId>) -> io::Result<Vec<SessionInfo>> {
        self.with_state_readonly(|state| {
            let mut sessions: Vec<SessionInfo> = state
                .chats
                .get(&key.as_string())
                .map(|chat| {
                    chat.history
                        .values()
                        .filter(|s| engine.is_none_or(|e| &s.engine == e))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            sessions
        })
        .await
    }

    pub async fn get_active_session_id(&self, key: ChatKey, engine: &EngineId) -> io::Result<Option<String>> {
        self.with_state_readonly(|state| {
            state
                .chats
                .get(&key.as_string())
                .and_then(|chat| chat.active.get(engine))
                .cloned()
        })
        .await
    }

    pub async fn switch_session(&self, key: ChatKey, resume: &str) -> io::Result<Option<SessionInfo>> {
        self.with_state(|state| {
            let chat = state.chats.get_mut(&key.as_string())?;
            let session = chat.history.get_mut(resume)?;
            session.updated_at = now();
            let result = session.clone();
            chat.active.insert(result.engine.clone(), resume.to_string());
            Some(result)
        })
        .await
    }

    pub async fn name_session(&self, key: ChatKey, engine: &EngineId, title: &str) -> io::Result<bool> {
        self.with_state(|state| {
            let Some(chat) = state.chats.get_mut(&key.as_string()) else {
                return false;
            };
            let Some(resume) = chat.active.get(engine).cloned() else {
                return false;
            };
            let Some(session) = chat.history.get_mut(&resume) else {
                return false;
            };
            session.title = Some(truncate_bytes(title, 50));
            true
        })
        .await
    }

    pub async fn delete_session(&self, key: ChatKey, resume: &str) -> io::Result<bool> {
        self.with_state(|state| {
            let Some(chat) = state.chats.get_mut(&key.as_string()) else {
                return false;
            };
            let Some(removed) = chat.history.remove(resume) else {
                return false;
            };
            if chat.active.get(&removed.engine) == Some(&resume.to_string()) {
                chat.active.remove(&removed.engine);
            }
            true
        })
        .await
    }

    pub async fn sync_startup_cwd(&self, cwd: &str) -> io::Result<bool> {
        let normalized = normalize_cwd(cwd);
        self.with_state(|state| match &state.cwd {
            Some(existing) if existing != &normalized => {
                state.chats.clear();
                state.cwd = Some(normalized);
                true
            }
            Some(_) => false,
            None => {
                state.cwd = Some(normalized);
                false
            }
        })
        .await
    }
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn normalize_cwd(cwd: &str) -> String {
    let expanded = if let Some(stripped) = cwd.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(stripped))
            .unwrap_or_else(|| PathBuf::from(cwd))
    } else {
        PathBuf::from(cwd)
    };
    fs::canonicalize(&expanded)
        .unwrap_or(expanded)
        .to_string_lossy()
        .to_string()
}

/// After `set_session_resume` on `engine`, evict the oldest non-active
/// sessions for that engine until the per-engine count is within
/// `MAX_SESSIONS_PER_CHAT`.
fn prune_engine(chat: &mut ChatState, engine: &EngineId) {
    let active_resume = chat.active.get(engine).cloned();
    let mut engine_sessions: Vec<(String, i64)> = chat
        .history
        .values()
        .filter(|s| &s.engine == engine)
        .map(|s| (s.resume.clone(), s.updated_at))
        .collect();

    if engine_sessions.len() <= MAX_SESSIONS_PER_CHAT {
        return;
    }

    engine_sessions.sort_by_key(|(_, updated_at)| *updated_at);
    let mut excess = engine_sessions.len() - MAX_SESSIONS_PER_CHAT;
    for (resume, _) in engine_sessions {
        if excess == 0 {
            break;
        }
        if Some(&resume) == active_resume.as_ref() {
            continue;
        }
        chat.history.remove(&resume);
        excess -= 1;
    }
}

fn file_mtime(path: &Path) -> io::Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn load_from_disk(path: &Path) -> io::Result<(StoreState, Option<SystemTime>)> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let mut state: StoreState = serde_json::from_str(&raw).unwrap_or_default();
            migrate_legacy_sessions(&mut state);
            Ok((state, file_mtime(path)?))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok((StoreState::default(), None)),
        Err(err) => Err(err),
    }
}

/// Converts any chat's legacy `{engine: {resume: ...}}` mapping (schema < 2)
/// into `history`/`active` entries. Mutation is written back on the next
/// save, not here.
fn migrate_legacy_sessions(state: &mut StoreState) {
    if state.version >= crate::model::STORE_SCHEMA_VERSION {
        return;
    }
    let ts = now();
    for chat in state.chats.values_mut() {
        let Some(legacy) = chat.sessions.take() else {
            continue;
        };
        let Some(legacy_map) = legacy.as_object() else {
            continue;
        };
        for (engine, value) in legacy_map {
            let Some(resume) = value.get("resume").and_then(|v| v.as_str()) else {
                continue;
            };
            chat.history.entry(resume.to_string()).or_insert(SessionInfo {
                resume: resume.to_string(),
                engine: engine.clone(),
                title: None,
                first_message: None,
                created_at: ts,
                updated_at: ts,
            });
            chat.active.insert(engine.clone(), resume.to_string());
        }
    }
    state.version = crate::model::STORE_SCHEMA_VERSION;
}

fn write_atomic(path: &Path, state: &StoreState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(state)?;
    fs::write(&tmp_path, json)?;
    let file = fs::File::open(&tmp_path)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(resolve_sessions_path(dir)).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_resume_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = ChatKey::new(1, None);
        let token = ResumeToken::new("codex", "sess-1");
        store.set_session_resume(key, &token, Some("hi")).await.unwrap();

        let got = store.get_session_resume(key, &"codex".to_string()).await.unwrap();
        assert_eq!(got, Some(token));
    }

    #[tokio::test]
    async fn switch_session_updates_active_pointer() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = ChatKey::new(1, None);
        let a = ResumeToken::new("codex", "sess-a");
        let b = ResumeToken::new("codex", "sess-b");
        store.set_session_resume(key, &a, None).await.unwrap();
        store.set_session_resume(key, &b, None).await.unwrap();

        let session = store.switch_session(key, "sess-a").await.unwrap().unwrap();
        assert_eq!(session.resume, "sess-a");
        let active = store
            .get_active_session_id(key, &"codex".to_string())
            .await
            .unwrap();
        assert_eq!(active.as_deref(), Some("sess-a"));
    }

    #[tokio::test]
    async fn prune_keeps_at_most_max_sessions_excluding_active() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = ChatKey::new(1, None);

        for i in 0..21 {
            let token = ResumeToken::new("codex", format!("sess-{i}"));
            store.set_session_resume(key, &token, None).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        // Switch active back to the oldest, which must then be spared.
        store.switch_session(key, "sess-0").await.unwrap();
        let newest = ResumeToken::new("codex", "sess-extra");
        store.set_session_resume(key, &newest, None).await.unwrap();

        let sessions = store.list_sessions(key, Some(&"codex".to_string())).await.unwrap();
        assert_eq!(sessions.len(), MAX_SESSIONS_PER_CHAT);
        assert!(sessions.iter().any(|s| s.resume == "sess-0"));
    }

    #[tokio::test]
    async fn delete_session_clears_active_pointer() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = ChatKey::new(1, None);
        let token = ResumeToken::new("codex", "sess-1");
        store.set_session_resume(key, &token, None).await.unwrap();

        let deleted = store.delete_session(key, "sess-1").await.unwrap();
        assert!(deleted);
        let active = store
            .get_active_session_id(key, &"codex".to_string())
            .await
            .unwrap();
        assert_eq!(active, None);
    }

    #[tokio::test]
    async fn sync_startup_cwd_erases_chats_on_change() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = ChatKey::new(1, None);
        let token = ResumeToken::new("codex", "sess-1");
        store.set_session_resume(key, &token, None).await.unwrap();

        let changed_first = store.sync_startup_cwd("/tmp/project-a").await.unwrap();
        assert!(!changed_first);

        let changed_second = store.sync_startup_cwd("/tmp/project-b").await.unwrap();
        assert!(changed_second);
        let active = store
            .get_active_session_id(key, &"codex".to_string())
            .await
            .unwrap();
        assert_eq!(active, None);
    }

    #[tokio::test]
    async fn store_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = resolve_sessions_path(dir.path());
        {
            let store = SessionStore::new(path.clone()).unwrap();
            let key = ChatKey::new(5, Some(9));
            let token = ResumeToken::new("codex", "sess-1");
            store.set_session_resume(key, &token, Some("hello")).await.unwrap();
        }
        let reopened = SessionStore::new(path).unwrap();
        let key = ChatKey::new(5, Some(9));
        let got = reopened
            .get_session_resume(key, &"codex".to_string())
            .await
            .unwrap();
        assert_eq!(got.map(|t| t.value), Some("sess-1".to_string()));
    }
}
