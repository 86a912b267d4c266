//! Voice transcription (C13, ambient): posts audio bytes to an
//! OpenAI/Mistral-compatible `/audio/transcriptions` endpoint. Ported from
//! `zdx-bot/src/transcribe.rs`, generalized off `zdx_core::providers` onto
//! this crate's own config, since there is no shared provider registry here.

use anyhow::{Result, anyhow};

use crate::config::Config;

const DEFAULT_OPENAI_MODEL: &str = "whisper-1";
const DEFAULT_MISTRAL_MODEL: &str = "voxtral-mini-latest";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    Mistral,
}

const KNOWN_PROVIDERS: &[Provider] = &[Provider::OpenAi, Provider::Mistral];

impl Provider {
    fn label(self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Mistral => "Mistral",
        }
    }

    fn api_key_env_var(self) -> &'static str {
        match self {
            Provider::OpenAi => "TAKOPI_OPENAI_API_KEY",
            Provider::Mistral => "TAKOPI_MISTRAL_API_KEY",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => DEFAULT_OPENAI_BASE_URL,
            Provider::Mistral => DEFAULT_MISTRAL_BASE_URL,
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => DEFAULT_OPENAI_MODEL,
            Provider::Mistral => DEFAULT_MISTRAL_MODEL,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "mistral" => Some(Provider::Mistral),
            _ => None,
        }
    }

    fn api_key(self) -> Result<String> {
        std::env::var(self.api_key_env_var())
            .map_err(|_| anyhow!("{} API key not set (expected {})", self.label(), self.api_key_env_var()))
    }
}

/// Transcribes audio if `transports.telegram.voice_transcription` is on and a
/// provider key is available. Returns `Ok(None)` when transcription isn't
/// configured at all, so callers can fall back to treating the message as
/// text-less.
pub async fn transcribe_audio_if_configured(
    config: &Config,
    bytes: Vec<u8>,
    filename: &str,
    mime_type: Option<&str>,
) -> Result<Option<String>> {
    if !config.transports.telegram.voice_transcription {
        return Ok(None);
    }
    let Some(provider) = detect_provider(config) else {
        return Ok(None);
    };

    let api_key = provider.api_key()?;
    let base_url = provider.default_base_url().to_string();
    let model = resolve_model(config, provider);
    let language = config
        .transports
        .telegram
        .transcription
        .language
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let transcript =
        transcribe_audio(provider.label(), &base_url, &api_key, &model, bytes, filename, mime_type, language).await?;

    let trimmed = transcript.trim();
    if trimmed.is_empty() { Ok(None) } else { Ok(Some(trimmed.to_string())) }
}

/// Priority: env var > config > auto-detect (first provider with a key set).
fn detect_provider(config: &Config) -> Option<Provider> {
    if let Some(provider) =
        std::env::var("TAKOPI_TRANSCRIPTION_PROVIDER").ok().as_deref().and_then(Provider::parse)
    {
        return Some(provider);
    }

    if let Some(provider) = config.transports.telegram.transcription.provider.as_deref().and_then(Provider::parse) {
        return Some(provider);
    }

    KNOWN_PROVIDERS.iter().copied().find(|provider| provider.api_key().is_ok())
}

fn resolve_model(config: &Config, provider: Provider) -> String {
    std::env::var("TAKOPI_TRANSCRIPTION_MODEL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            config
                .transports
                .telegram
                .transcription
                .model
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| provider.default_model().to_string())
}

#[allow(clippy::too_many_arguments)]
async fn transcribe_audio(
    provider_name: &str,
    base_url: &str,
    api_key: &str,
    model: &str,
    bytes: Vec<u8>,
    filename: &str,
    mime_type: Option<&str>,
    language: Option<&str>,
) -> Result<String> {
    let client = reqwest::Client::new();
    let mut part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
    if let Some(mime) = mime_type
        && !mime.trim().is_empty()
    {
        part = part.mime_str(mime)?;
    }

    let mut form = reqwest::multipart::Form::new().text("model", model.to_string()).part("file", part);
    if let Some(lang) = language {
        form = form.text("language", lang.to_string());
    }

    let url = format!("{}/audio/transcriptions", base_url.trim_end_matches('/'));
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await
        .map_err(|_| anyhow!("{provider_name} transcription request failed"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("{provider_name} transcription failed: {status} {body}"));
    }

    #[derive(serde::Deserialize)]
    struct TranscriptionResponse {
        text: String,
    }

    let payload: TranscriptionResponse =
        response.json().await.map_err(|_| anyhow!("failed to decode transcription response"))?;
    Ok(payload.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive_and_rejects_unknown() {
        assert_eq!(Provider::parse("OpenAI"), Some(Provider::OpenAi));
        assert_eq!(Provider::parse("mistral"), Some(Provider::Mistral));
        assert_eq!(Provider::parse("anthropic"), None);
    }

    #[test]
    fn resolve_model_falls_back_through_config_then_default() {
        let mut config = Config {
            transport: "telegram".to_string(),
            transports: crate::config::Transports::default(),
            inject_dir: None,
            inject_poll_interval_secs: 2,
            engine: "codex".to_string(),
            engines: std::collections::HashMap::new(),
        };
        assert_eq!(resolve_model(&config, Provider::OpenAi), "whisper-1");

        config.transports.telegram.transcription.model = Some("gpt-4o-transcribe".to_string());
        assert_eq!(resolve_model(&config, Provider::OpenAi), "gpt-4o-transcribe");
    }
}
