use std::path::PathBuf;

/// A chat message that survived the allowlist/empty-content checks, ready
/// for command dispatch or the orchestrator.
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
    pub audios: Vec<IncomingAudio>,
}

pub struct IncomingAudio {
    pub local_path: PathBuf,
    pub transcript: Option<String>,
}
