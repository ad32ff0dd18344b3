//! Script writing and speech synthesis for the AI studio panel.
//!
//! One `generateContent` request per call; no retry and no streaming. In mock
//! mode responses are faked locally after a short delay.

use crate::config::StudioConfig;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const MOCK_DELAY: Duration = Duration::from_millis(1200);

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("Missing API key: set GEMINI_API_KEY or studio.api_key")]
    MissingCredential,
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Response too large")]
    TooLarge,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, StudioError>;

#[derive(Debug, Clone)]
pub struct StudioClient {
    http: reqwest::Client,
    config: StudioConfig,
    api_key: Option<String>,
}

impl StudioClient {
    pub fn new(config: StudioConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("EdRadio/0.1"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;
        let api_key = config.resolved_api_key();
        Ok(Self { http, config, api_key })
    }

    /// Writes a short radio script for `prompt`.
    pub async fn generate_script(&self, prompt: &str) -> Result<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(StudioError::EmptyPrompt);
        }
        if self.config.mock {
            tokio::time::sleep(MOCK_DELAY).await;
            return Ok(mock_script(prompt));
        }

        let body = GenerateRequest {
            contents: vec![Content::text(&script_prompt(prompt))],
            generation_config: None,
        };
        let resp = self.generate(&self.config.text_model, &body).await?;
        let text = resp.text();
        if text.trim().is_empty() {
            return Err(StudioError::InvalidResponse("no text in response".into()));
        }
        info!(chars = text.len(), "script generated");
        Ok(text)
    }

    /// Synthesises `text`; returns the base64 PCM chunks in playback order.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<String>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StudioError::EmptyPrompt);
        }
        if self.config.mock {
            tokio::time::sleep(MOCK_DELAY).await;
            return Ok(mock_speech(text, self.config.sample_rate));
        }

        let body = GenerateRequest {
            contents: vec![Content::text(text)],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: self.config.voice.clone(),
                        },
                    },
                },
            }),
        };
        let resp = self.generate(&self.config.speech_model, &body).await?;
        let chunks = resp.audio_chunks();
        if chunks.is_empty() {
            return Err(StudioError::InvalidResponse("no audio in response".into()));
        }
        info!(chunks = chunks.len(), "speech synthesised");
        Ok(chunks)
    }

    async fn generate(&self, model: &str, body: &GenerateRequest) -> Result<GenerateResponse> {
        let key = self.api_key.as_deref().ok_or(StudioError::MissingCredential)?;
        let url = endpoint(&self.config.base_url, model)?;
        debug!(%url, "POST generateContent");
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let bytes = read_limited(resp, MAX_BODY_BYTES).await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&bytes)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(StudioError::Api { status: status.as_u16(), message });
        }
        serde_json::from_slice(&bytes).map_err(|e| StudioError::InvalidResponse(e.to_string()))
    }
}

fn endpoint(base: &str, model: &str) -> Result<Url> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&format!("v1beta/models/{model}:generateContent"))?)
}

fn script_prompt(topic: &str) -> String {
    format!(
        "Escribe un guion breve para un locutor de radio sobre: {topic}. \
         Tono enérgico, menos de 120 palabras, sin acotaciones."
    )
}

fn mock_script(topic: &str) -> String {
    format!(
        "¡Bienvenidos a EdRadio Global! Hoy hablamos de {topic}. \
         Quédate con nosotros, la mejor música sigue sonando."
    )
}

/// A soft tone, one chunk per 100 ms, one 100 ms block per word.
fn mock_speech(text: &str, sample_rate: u32) -> Vec<String> {
    let frames = (sample_rate / 10) as usize;
    text.split_whitespace()
        .enumerate()
        .map(|(i, _)| {
            let freq = 220.0 + 20.0 * (i % 5) as f32;
            let bytes: Vec<u8> = (0..frames)
                .flat_map(|n| {
                    let t = n as f32 / sample_rate as f32;
                    let s = (t * freq * std::f32::consts::TAU).sin() * 0.2;
                    ((s * 32767.0) as i16).to_le_bytes()
                })
                .collect();
            base64::engine::general_purpose::STANDARD.encode(bytes)
        })
        .collect()
}

async fn read_limited(resp: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    if let Some(len) = resp.content_length() {
        if len as usize > limit {
            return Err(StudioError::TooLarge);
        }
    }

    let mut data: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if data.len().saturating_add(chunk.len()) > limit {
            return Err(StudioError::TooLarge);
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(text: &str) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates.iter().take(1).flat_map(|c| c.content.parts.iter())
    }

    fn text(&self) -> String {
        self.parts()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    fn audio_chunks(&self) -> Vec<String> {
        self.parts()
            .filter_map(|p| p.inline_data.as_ref())
            .map(|d| d.data.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
