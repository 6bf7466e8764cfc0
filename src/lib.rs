//! Live speech translation over the Gemini Live API.
//!
//! Capture mono 16 kHz microphone audio, stream it to a bidirectional
//! generative session, and play the model's spoken replies gaplessly while
//! accumulating a turn-by-turn transcript. One-shot text translation and
//! read-aloud run over the REST surface of the same API.

#![forbid(unsafe_code)]

pub mod capture;
pub mod events;
pub mod gemini;
pub mod pcm;
pub mod playback;
pub mod rest;
pub mod session;
pub mod transcript;
pub mod translator;

pub use events::SessionEvent;
pub use translator::{InputMode, LiveTranslator, SessionState, TranslatorConfig};
