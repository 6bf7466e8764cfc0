//! One-shot calls against the model's REST surface: text translation and
//! speech synthesis.
//!
//! These are independent of any live session. Failures surface inline to the
//! caller and never tear a session down.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::gemini::{Content, GenerationConfig};

pub const REST_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

pub struct RestClient {
    http: Client,
    base: String,
    api_key: String,
}

impl RestClient {
    pub fn new(api_key: &str) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: REST_API_BASE.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// One-shot text generation; returns the first candidate's text.
    pub async fn generate_text(&self, model: &str, prompt: &str) -> Result<String, RequestError> {
        let request = GenerateRequest {
            contents: vec![Content::text(prompt)],
            generation_config: Some(GenerationConfig {
                response_modalities: vec![],
                speech_config: None,
                // Low temperature keeps translations faithful.
                temperature: Some(0.2),
            }),
        };
        let response = self.generate(model, &request).await?;
        text_from_response(&response)
            .map(str::to_string)
            .ok_or(RequestError::Malformed("no text part in candidates"))
    }

    /// One-shot speech synthesis; returns base64 PCM audio.
    pub async fn synthesize_speech(
        &self,
        model: &str,
        text: &str,
        voice: &str,
    ) -> Result<String, RequestError> {
        let request = GenerateRequest {
            contents: vec![Content::text(text)],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(json!({
                    "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
                })),
                temperature: None,
            }),
        };
        let response = self.generate(model, &request).await?;
        audio_from_response(&response)
            .map(str::to_string)
            .ok_or(RequestError::Malformed("no audio part in candidates"))
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<Value, RequestError> {
        let url = format!("{}/{}:generateContent?key={}", self.base, model, self.api_key);
        debug!("one-shot request to {}", model);

        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(response.json().await?)
    }
}

/// True when the text contains Arabic-script characters (U+0600..U+06FF).
pub fn contains_arabic_script(text: &str) -> bool {
    text.chars().any(|c| ('\u{0600}'..='\u{06FF}').contains(&c))
}

/// Translation prompt with the direction chosen by script detection:
/// Arabic-script input goes to English, anything else to the target language.
pub fn translation_prompt(text: &str, target_language: &str) -> String {
    let direction = if contains_arabic_script(text) {
        "English"
    } else {
        target_language
    };
    format!(
        "Translate the following to {}. Reply with only the translation, nothing else: \"{}\"",
        direction, text
    )
}

fn text_from_response(response: &Value) -> Option<&str> {
    response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
}

fn audio_from_response(response: &Value) -> Option<&str> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    parts
        .iter()
        .find_map(|part| part.get("inlineData")?.get("data")?.as_str())
}
