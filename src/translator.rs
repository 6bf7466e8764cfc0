//! Session lifecycle controller.
//!
//! A single `SessionContext` owns every piece of per-session state: status,
//! the conversation log, the transcript accumulator, the playback scheduler,
//! and the mic level signal. Transport events are applied synchronously to
//! the context; all I/O stays in the session loop. Teardown is idempotent
//! and callable from any state.

use std::sync::Arc;

use anyhow::Context as _;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capture::MicStream;
use crate::events::SessionEvent;
use crate::gemini::LiveConfig;
use crate::pcm;
use crate::playback::{
    AudioSink, PlaybackBuffer, PlaybackScheduler, PulseSink, PLAYBACK_CHANNELS,
    PLAYBACK_SAMPLE_RATE,
};
use crate::rest::{translation_prompt, RequestError, RestClient};
use crate::session::LiveSession;
use crate::transcript::{ConversationLog, Speaker, TranscriptAccumulator, Turn};

pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_LIVE_VOICE: &str = "Puck";
pub const DEFAULT_TTS_VOICE: &str = "Kore";
pub const DEFAULT_TARGET_LANGUAGE: &str = "Egyptian Arabic";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly travel interpreter. \
    Translate simply and naturally between English and Egyptian Arabic. \
    Keep replies short and conversational.";

const APP_NAME: &str = "lingolive";

const MSG_MIC_UNAVAILABLE: &str = "Microphone unavailable. Check input permissions.";
const MSG_SPEAKER_UNAVAILABLE: &str = "Audio output unavailable. Check your sound device.";
const MSG_CONNECT_FAILED: &str = "Could not reach the translation service.";
const MSG_CONNECTION_LOST: &str = "Connection lost.";
const MSG_TRANSLATE_FAILED: &str = "Translation failed. Try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Thinking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Voice,
    Text,
}

/// Session start failures, worded for direct display.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    Connection(String),
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub api_key: String,
    pub live_model: String,
    pub voice: String,
    pub system_instruction: String,
    pub text_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub target_language: String,
}

impl TranslatorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_LIVE_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            tts_voice: DEFAULT_TTS_VOICE.to_string(),
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
        }
    }

    fn live_config(&self) -> LiveConfig {
        let mut config = LiveConfig::from_api_key(&self.api_key);
        config.model = self.live_model.clone();
        config.voice = self.voice.clone();
        config.system_instruction = self.system_instruction.clone();
        config
    }
}

/// Verdict of applying one transport event.
#[derive(Debug)]
enum Flow {
    Continue,
    Stop { message: Option<&'static str> },
}

/// All mutable session state, exclusively owned by the controller.
struct SessionContext {
    state: SessionState,
    log: ConversationLog,
    accumulator: TranscriptAccumulator,
    playback: Option<PlaybackScheduler>,
    level_tx: watch::Sender<f32>,
    level_rx: watch::Receiver<f32>,
    last_error: Option<String>,
}

impl SessionContext {
    fn new() -> Self {
        let (level_tx, level_rx) = watch::channel(0.0);
        Self {
            state: SessionState::Idle,
            log: ConversationLog::default(),
            accumulator: TranscriptAccumulator::default(),
            playback: None,
            level_tx,
            level_rx,
            last_error: None,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Apply one transport event. Pure state manipulation; the caller owns
    /// all I/O and acts on the verdict.
    fn apply(&mut self, event: SessionEvent) -> Flow {
        if self.state == SessionState::Idle {
            // Stale event from a session already torn down.
            debug!("discarding event with no active session");
            return Flow::Continue;
        }
        match event {
            SessionEvent::Audio(chunk) => {
                match self.playback.as_mut() {
                    Some(playback) => match playback.schedule(&chunk) {
                        Ok(_) => self.set_state(SessionState::Thinking),
                        Err(e) => warn!("skipping undecodable audio chunk: {}", e),
                    },
                    None => debug!("audio chunk with no scheduler, discarded"),
                }
                Flow::Continue
            }
            SessionEvent::InputTranscript(fragment) => {
                self.accumulator.push_input(&fragment);
                Flow::Continue
            }
            SessionEvent::OutputTranscript(fragment) => {
                self.accumulator.push_output(&fragment);
                Flow::Continue
            }
            SessionEvent::TurnComplete => {
                let appended = self.accumulator.finish_turn(&mut self.log);
                if appended > 0 {
                    info!("turn complete, {} turns logged", self.log.len());
                }
                self.set_state(SessionState::Listening);
                Flow::Continue
            }
            SessionEvent::Error(reason) => {
                warn!("transport error: {}", reason);
                Flow::Stop {
                    message: Some(MSG_CONNECTION_LOST),
                }
            }
            SessionEvent::Closed => {
                info!("session closed");
                Flow::Stop { message: None }
            }
        }
    }
}

struct ActiveSession {
    mic: MicStream,
    session: LiveSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

enum Step {
    Frame(Option<Vec<f32>>),
    Event(Option<SessionEvent>),
}

/// The travel-companion voice translator: live voice sessions plus one-shot
/// text translation and read-aloud.
pub struct LiveTranslator {
    config: TranslatorConfig,
    rest: RestClient,
    mode: InputMode,
    ctx: SessionContext,
    active: Option<ActiveSession>,
}

impl LiveTranslator {
    pub fn new(config: TranslatorConfig) -> Self {
        let rest = RestClient::new(&config.api_key);
        Self {
            config,
            rest,
            mode: InputMode::Voice,
            ctx: SessionContext::new(),
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.ctx.state
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn conversation(&self) -> &ConversationLog {
        &self.ctx.log
    }

    pub fn last_error(&self) -> Option<&str> {
        self.ctx.last_error.as_deref()
    }

    /// Live RMS level of the microphone, for meter display.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.ctx.level_rx.clone()
    }

    /// Acquire microphone, speakers, and transport, in that order.
    /// A no-op unless Idle, so two sessions can never overlap.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.ctx.state != SessionState::Idle {
            debug!("start ignored, session already {:?}", self.ctx.state);
            return Ok(());
        }
        self.ctx.last_error = None;
        self.ctx.accumulator.reset();
        self.ctx.set_state(SessionState::Connecting);

        let mic = match MicStream::open(APP_NAME) {
            Ok(mic) => mic,
            Err(e) => {
                warn!("microphone acquisition failed: {}", e);
                self.fail_start(MSG_MIC_UNAVAILABLE);
                return Err(SessionError::Permission(MSG_MIC_UNAVAILABLE.to_string()));
            }
        };

        let sink = match PulseSink::open(APP_NAME, PLAYBACK_SAMPLE_RATE, PLAYBACK_CHANNELS) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("audio output acquisition failed: {}", e);
                mic.stop();
                self.fail_start(MSG_SPEAKER_UNAVAILABLE);
                return Err(SessionError::Permission(MSG_SPEAKER_UNAVAILABLE.to_string()));
            }
        };

        let (session, events) = match LiveSession::connect(&self.config.live_config()).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("transport connect failed: {}", e);
                mic.stop();
                self.fail_start(MSG_CONNECT_FAILED);
                return Err(SessionError::Connection(MSG_CONNECT_FAILED.to_string()));
            }
        };

        // Fresh scheduler per session: the playback cursor starts at the present.
        self.ctx.playback = Some(PlaybackScheduler::new(
            Arc::new(sink),
            PLAYBACK_SAMPLE_RATE,
            PLAYBACK_CHANNELS,
        ));
        self.active = Some(ActiveSession {
            mic,
            session,
            events,
        });
        self.ctx.set_state(SessionState::Listening);
        info!("🎤 live session started");
        Ok(())
    }

    /// Drive the active session until it ends: server close, transport
    /// error, or capture failure. Returns immediately when nothing is active.
    pub async fn run(&mut self) {
        loop {
            let step = {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                tokio::select! {
                    frame = active.mic.next_frame() => Step::Frame(frame),
                    event = active.events.recv() => Step::Event(event),
                }
            };

            match step {
                Step::Frame(Some(frame)) => self.forward_frame(frame),
                Step::Frame(None) => {
                    warn!("capture stream ended unexpectedly");
                    self.teardown(Some(MSG_MIC_UNAVAILABLE));
                    return;
                }
                Step::Event(Some(event)) => {
                    if let Flow::Stop { message } = self.ctx.apply(event) {
                        self.teardown(message);
                        return;
                    }
                }
                Step::Event(None) => {
                    self.teardown(None);
                    return;
                }
            }
        }
    }

    /// Stop the session and release every device. Safe to call twice, or
    /// without a session at all. The conversation log survives.
    pub fn stop(&mut self) {
        self.teardown(None);
    }

    /// Change the input mode. Switching away while a session is active stops
    /// it first; there is never more than one active session.
    pub fn set_mode(&mut self, mode: InputMode) {
        if mode != self.mode && self.active.is_some() {
            info!("input mode changed, stopping active session");
            self.stop();
        }
        self.mode = mode;
    }

    /// One-shot text translation. Appends the user's line and the model's
    /// reply to the conversation; failures surface inline. Empty input is
    /// a no-op.
    pub async fn translate_text(&mut self, input: &str) -> Result<String, RequestError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(String::new());
        }
        if self.active.is_some() {
            self.stop();
        }

        self.ctx.log.append(Turn {
            speaker: Speaker::User,
            text: trimmed.to_string(),
        });
        self.ctx.set_state(SessionState::Thinking);

        let prompt = translation_prompt(trimmed, &self.config.target_language);
        let result = self.rest.generate_text(&self.config.text_model, &prompt).await;
        self.ctx.set_state(SessionState::Idle);

        match result {
            Ok(translation) => {
                let translation = translation.trim().to_string();
                self.ctx.log.append(Turn {
                    speaker: Speaker::Model,
                    text: translation.clone(),
                });
                Ok(translation)
            }
            Err(e) => {
                warn!("text translation failed: {}", e);
                self.ctx.last_error = Some(MSG_TRANSLATE_FAILED.to_string());
                Err(e)
            }
        }
    }

    /// Synthesize the given text and play it as a single buffer, starting
    /// immediately. Independent of any live session.
    pub async fn read_aloud(&self, text: &str) -> anyhow::Result<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let data = self
            .rest
            .synthesize_speech(&self.config.tts_model, trimmed, &self.config.tts_voice)
            .await?;
        let buffer = PlaybackBuffer::from_base64(&data, PLAYBACK_SAMPLE_RATE, PLAYBACK_CHANNELS)
            .context("speech synthesis returned unplayable audio")?;
        let sink = PulseSink::open(APP_NAME, PLAYBACK_SAMPLE_RATE, PLAYBACK_CHANNELS)?;
        sink.play(buffer).await
    }

    fn forward_frame(&mut self, frame: Vec<f32>) {
        let _ = self.ctx.level_tx.send(pcm::rms_level(&frame));
        let chunk = pcm::encode_frame(&frame);
        if let Some(active) = &self.active {
            active.session.send_audio(&chunk);
        }
    }

    fn fail_start(&mut self, message: &str) {
        self.ctx.last_error = Some(message.to_string());
        self.ctx.set_state(SessionState::Idle);
    }

    /// Full teardown: capture stopped, transport closed, playback cancelled,
    /// partial transcripts discarded, level zeroed. Idempotent.
    fn teardown(&mut self, message: Option<&str>) {
        let had_session = self.active.is_some();
        if let Some(mut active) = self.active.take() {
            active.mic.stop();
            active.session.close();
        }
        if let Some(mut playback) = self.ctx.playback.take() {
            playback.cancel_all();
        }
        self.ctx.accumulator.reset();
        let _ = self.ctx.level_tx.send(0.0);
        if let Some(message) = message {
            self.ctx.last_error = Some(message.to_string());
        }
        self.ctx.set_state(SessionState::Idle);
        if had_session {
            info!("session stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn play(&self, _buffer: PlaybackBuffer) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn translator() -> LiveTranslator {
        LiveTranslator::new(TranslatorConfig::new("test-key"))
    }

    fn attach_fake_session(
        t: &mut LiveTranslator,
    ) -> (
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::Sender<Vec<f32>>,
    ) {
        let (session, outbound_rx, events_tx, events_rx) = LiveSession::detached();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let mic = MicStream::from_channel(frames_rx);
        t.ctx.playback = Some(PlaybackScheduler::new(
            Arc::new(NullSink),
            PLAYBACK_SAMPLE_RATE,
            PLAYBACK_CHANNELS,
        ));
        t.active = Some(ActiveSession {
            mic,
            session,
            events: events_rx,
        });
        t.ctx.set_state(SessionState::Listening);
        (outbound_rx, events_tx, frames_tx)
    }

    #[test]
    fn test_stop_without_session_is_harmless() {
        let mut t = translator();
        t.stop();
        t.stop();
        assert_eq!(t.state(), SessionState::Idle);
        assert!(t.last_error().is_none());
    }

    #[tokio::test]
    async fn test_voice_exchange_produces_ordered_turns() {
        let mut t = translator();
        let (_outbound_rx, events_tx, _frames_tx) = attach_fake_session(&mut t);

        events_tx
            .send(SessionEvent::InputTranscript("Hel".to_string()))
            .unwrap();
        events_tx
            .send(SessionEvent::InputTranscript("lo".to_string()))
            .unwrap();
        events_tx
            .send(SessionEvent::OutputTranscript("Hi".to_string()))
            .unwrap();
        events_tx
            .send(SessionEvent::OutputTranscript(" there".to_string()))
            .unwrap();
        events_tx.send(SessionEvent::TurnComplete).unwrap();
        events_tx.send(SessionEvent::Closed).unwrap();

        t.run().await;

        assert_eq!(t.state(), SessionState::Idle);
        assert!(t.last_error().is_none());
        assert_eq!(
            t.conversation().turns(),
            &[
                Turn {
                    speaker: Speaker::User,
                    text: "Hello".to_string()
                },
                Turn {
                    speaker: Speaker::Model,
                    text: "Hi there".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_audio_marks_thinking_until_turn_completes() {
        let mut t = translator();
        let _channels = attach_fake_session(&mut t);

        let chunk = pcm::encode_frame(&[0.1_f32; 240]);
        assert!(matches!(
            t.ctx.apply(SessionEvent::Audio(chunk)),
            Flow::Continue
        ));
        assert_eq!(t.state(), SessionState::Thinking);

        assert!(matches!(t.ctx.apply(SessionEvent::TurnComplete), Flow::Continue));
        assert_eq!(t.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_undecodable_chunk_does_not_disturb_the_session() {
        let mut t = translator();
        let _channels = attach_fake_session(&mut t);

        let bad = pcm::EncodedChunk {
            data: "*** not base64 ***".to_string(),
            mime_type: String::new(),
        };
        assert!(matches!(t.ctx.apply(SessionEvent::Audio(bad)), Flow::Continue));
        assert_eq!(t.state(), SessionState::Listening);

        let good = pcm::encode_frame(&[0.1_f32; 240]);
        assert!(matches!(t.ctx.apply(SessionEvent::Audio(good)), Flow::Continue));
        assert_eq!(t.state(), SessionState::Thinking);
    }

    #[tokio::test]
    async fn test_transport_error_tears_down_with_message() {
        let mut t = translator();
        let (_outbound_rx, events_tx, _frames_tx) = attach_fake_session(&mut t);

        events_tx
            .send(SessionEvent::Error("tls handshake blew up".to_string()))
            .unwrap();
        t.run().await;

        assert_eq!(t.state(), SessionState::Idle);
        assert_eq!(t.last_error(), Some("Connection lost."));
        assert!(t.active.is_none());
        assert_eq!(*t.level().borrow(), 0.0);
    }

    #[test]
    fn test_events_without_session_are_discarded() {
        let mut t = translator();
        assert!(matches!(
            t.ctx.apply(SessionEvent::InputTranscript("ghost".to_string())),
            Flow::Continue
        ));
        assert!(matches!(t.ctx.apply(SessionEvent::TurnComplete), Flow::Continue));
        assert!(t.conversation().is_empty());
        assert_eq!(t.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_mode_switch_stops_active_session() {
        let mut t = translator();
        let (mut outbound_rx, _events_tx, _frames_tx) = attach_fake_session(&mut t);
        assert_eq!(t.state(), SessionState::Listening);

        t.set_mode(InputMode::Text);

        assert!(t.active.is_none());
        assert_eq!(t.state(), SessionState::Idle);
        assert_eq!(t.mode(), InputMode::Text);
        assert!(matches!(outbound_rx.try_recv(), Ok(Outbound::Close)));
    }

    #[tokio::test]
    async fn test_same_mode_keeps_session_running() {
        let mut t = translator();
        let _channels = attach_fake_session(&mut t);

        t.set_mode(InputMode::Voice);

        assert!(t.active.is_some());
        assert_eq!(t.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_start_is_guarded_when_active() {
        let mut t = translator();
        let _channels = attach_fake_session(&mut t);

        assert!(t.start().await.is_ok());

        assert!(t.active.is_some());
        assert_eq!(t.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_frames_are_encoded_and_forwarded() {
        let mut t = translator();
        let (mut outbound_rx, _events_tx, _frames_tx) = attach_fake_session(&mut t);
        let level = t.level();

        t.forward_frame(vec![0.5_f32; 16]);

        assert!((*level.borrow() - 0.5).abs() < 1e-6);
        match outbound_rx.try_recv() {
            Ok(Outbound::Frame(frame)) => assert!(frame.contains("audio/pcm;rate=16000")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
