//! Wire protocol for the Gemini Live API.
//!
//! Outbound frames (setup, realtime audio) are typed serde structs wrapped in
//! their envelope key. Inbound frames are read as `serde_json::Value`:
//! the session only cares about a handful of fields, and unknown message
//! kinds must be skippable without faulting a live stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::events::SessionEvent;
use crate::pcm::EncodedChunk;


/// WebSocket endpoint for bidirectional streaming, sans API key.
pub const LIVE_API_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long to wait for the server's setup confirmation.
pub const SETUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Error type for live transport operations.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed before setup completed")]
    SetupIncomplete,

    #[error("timed out waiting for setup confirmation")]
    SetupTimeout,
}

/// Connection parameters for one live session.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub temperature: Option<f32>,
}

impl LiveConfig {
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_API_URL, api_key),
            model: String::new(),
            voice: String::new(),
            system_instruction: String::new(),
            temperature: None,
        }
    }
}

/// Generation configuration inside the setup frame.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Value>,
}

/// A chunk of realtime input; audio-only in this pipeline.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<RealtimeAudio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

/// Model content: a role plus text parts. Shared with the one-shot REST calls.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

/// The fixed streaming configuration: audio responses, both transcription
/// directions enabled, the configured prebuilt voice.
pub fn build_setup(config: &LiveConfig) -> LiveSetup {
    LiveSetup {
        model: config.model.clone(),
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(json!({
                "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": config.voice}}
            })),
            temperature: config.temperature,
        }),
        system_instruction: Some(Content::text(&config.system_instruction)),
        input_audio_transcription: Some(json!({})),
        output_audio_transcription: Some(json!({})),
    }
}

pub fn setup_frame(config: &LiveConfig) -> Result<String, serde_json::Error> {
    Ok(json!({"setup": serde_json::to_value(build_setup(config))?}).to_string())
}

pub fn audio_frame(chunk: &EncodedChunk) -> Result<String, serde_json::Error> {
    let input = RealtimeInput {
        audio: Some(RealtimeAudio {
            data: chunk.data.clone(),
            mime_type: chunk.mime_type.clone(),
        }),
        audio_stream_end: None,
    };
    Ok(json!({"realtimeInput": serde_json::to_value(&input)?}).to_string())
}

pub fn audio_stream_end_frame() -> String {
    json!({"realtimeInput": {"audioStreamEnd": true}}).to_string()
}

/// One parsed server frame, reduced to what the session loop consumes.
#[derive(Debug)]
pub enum Inbound {
    SetupComplete,
    Events(Vec<SessionEvent>),
    GoAway,
    /// Recognized JSON, unrecognized kind; carries the envelope key.
    Unknown(String),
}

pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let v: Value = serde_json::from_str(text)?;
    if v.get("setupComplete").is_some() {
        return Ok(Inbound::SetupComplete);
    }
    if let Some(content) = v.get("serverContent") {
        return Ok(Inbound::Events(events_from_server_content(content)));
    }
    if v.get("goAway").is_some() {
        return Ok(Inbound::GoAway);
    }
    let kind = v
        .as_object()
        .and_then(|o| o.keys().next().cloned())
        .unwrap_or_default();
    Ok(Inbound::Unknown(kind))
}

/// Extract session events from a `serverContent` payload, in the order the
/// pipeline consumes them: model audio, input transcription, output
/// transcription, turn completion.
fn events_from_server_content(content: &Value) -> Vec<SessionEvent> {
    let mut events = Vec::new();

    if let Some(parts) = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(|parts| parts.as_array())
    {
        for part in parts {
            if let Some(inline) = part.get("inlineData") {
                if let Some(data) = inline.get("data").and_then(|d| d.as_str()) {
                    let mime_type = inline
                        .get("mimeType")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default()
                        .to_string();
                    events.push(SessionEvent::Audio(EncodedChunk {
                        data: data.to_string(),
                        mime_type,
                    }));
                }
            }
        }
    }

    if let Some(text) = content
        .get("inputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        events.push(SessionEvent::InputTranscript(text.to_string()));
    }

    if let Some(text) = content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        events.push(SessionEvent::OutputTranscript(text.to_string()));
    }

    if content
        .get("turnComplete")
        .and_then(|t| t.as_bool())
        .unwrap_or(false)
    {
        events.push(SessionEvent::TurnComplete);
    }

    events
}
