//! Gapless playback of streamed model audio.
//!
//! Chunks arrive faster than realtime, so a monotonic cursor assigns each
//! decoded buffer a start instant: the end of the previous buffer, or the
//! present if playback has fallen behind. Every scheduled chunk is a spawned
//! task registered in a live set so teardown can cancel the whole tail at
//! once. A chunk that fails to decode is skipped without moving the cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::pcm::{self, CodecError, EncodedChunk};

/// Sample rate of model audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Mono playback.
pub const PLAYBACK_CHANNELS: u8 = 1;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audio output unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio output did not become ready in time")]
    StartTimeout,
}

/// A decoded audio buffer ready for a sink.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u8,
}

impl PlaybackBuffer {
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32, channels: u8) -> Result<Self, CodecError> {
        Ok(Self {
            samples: pcm::samples_from_pcm16(bytes)?,
            sample_rate,
            channels,
        })
    }

    pub fn from_base64(data: &str, sample_rate: u32, channels: u8) -> Result<Self, CodecError> {
        Self::from_pcm16(&pcm::decode_base64(data)?, sample_rate, channels)
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Where decoded audio goes. `play` resolves once the buffer has been
/// delivered to the device.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, buffer: PlaybackBuffer) -> anyhow::Result<()>;
}

/// PulseAudio playback sink on a dedicated OS thread.
pub struct PulseSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

struct SinkCommand {
    buffer: PlaybackBuffer,
    done: oneshot::Sender<Result<(), String>>,
}

impl PulseSink {
    pub fn open(app_name: &str, sample_rate: u32, channels: u8) -> Result<Self, SinkError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let app_name = app_name.to_string();

        std::thread::spawn(move || {
            run_playback(app_name, sample_rate, channels, ready_tx, rx);
        });

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => Ok(Self { tx }),
            Ok(Err(msg)) => Err(SinkError::DeviceUnavailable(msg)),
            Err(_) => Err(SinkError::StartTimeout),
        }
    }
}

#[async_trait]
impl AudioSink for PulseSink {
    async fn play(&self, buffer: PlaybackBuffer) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand {
                buffer,
                done: done_tx,
            })
            .map_err(|_| anyhow!("playback thread is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("playback thread is gone"))?
            .map_err(|e| anyhow!(e))
    }
}

fn run_playback(
    app_name: String,
    sample_rate: u32,
    channels: u8,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
) {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels,
        rate: sample_rate,
    };

    let sink = match psimple::Simple::new(
        None,
        &app_name,
        pulse::stream::Direction::Playback,
        None,
        "playback",
        &spec,
        None,
        None,
    ) {
        Ok(sink) => {
            let _ = ready_tx.send(Ok(()));
            sink
        }
        Err(e) => {
            let _ = ready_tx.send(Err(ToString::to_string(&e)));
            return;
        }
    };

    info!("audio output connected: {} Hz, {} ch", sample_rate, channels);

    // Exits when every sender (sink handle plus in-flight tasks) is gone.
    while let Some(SinkCommand { buffer, done }) = rx.blocking_recv() {
        let mut bytes = Vec::with_capacity(buffer.samples().len() * 4);
        for &s in buffer.samples() {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let result = sink.write(&bytes).map_err(|e| ToString::to_string(&e));
        let _ = done.send(result);
    }

    debug!("playback thread exiting");
}

/// What `schedule` decided for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub start: Instant,
    pub duration: Duration,
}

/// Owns the playback cursor and the set of in-flight chunk tasks.
pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    sample_rate: u32,
    channels: u8,
    next_start: Instant,
    next_id: u64,
    live: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl PlaybackScheduler {
    /// Cursor starts at the present; the first chunk plays immediately.
    pub fn new(sink: Arc<dyn AudioSink>, sample_rate: u32, channels: u8) -> Self {
        Self {
            sink,
            sample_rate,
            channels,
            next_start: Instant::now(),
            next_id: 0,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decode one chunk and queue it at the cursor.
    ///
    /// On decode failure the cursor is untouched and no task is spawned;
    /// the caller logs and moves on.
    pub fn schedule(&mut self, chunk: &EncodedChunk) -> Result<Scheduled, CodecError> {
        let buffer = PlaybackBuffer::from_base64(&chunk.data, self.sample_rate, self.channels)?;
        let duration = buffer.duration();

        self.next_start = self.next_start.max(Instant::now());
        let start = self.next_start;
        self.next_start += duration;

        let id = self.next_id;
        self.next_id += 1;
        let sink = self.sink.clone();
        let live = self.live.clone();
        let handle = tokio::spawn(async move {
            sleep_until(start).await;
            if let Err(e) = sink.play(buffer).await {
                warn!("playback of chunk {} failed: {}", id, e);
            }
            live.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle.abort_handle());

        debug!("chunk {} scheduled for {:?} of audio", id, duration);
        Ok(Scheduled { start, duration })
    }

    /// Abort every chunk that has not finished playing. Synchronous.
    pub fn cancel_all(&mut self) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = live.len();
        for (_, handle) in live.drain() {
            handle.abort();
        }
        if cancelled > 0 {
            debug!("cancelled {} in-flight chunks", cancelled);
        }
    }

    /// Number of chunks scheduled but not yet finished.
    pub fn in_flight(&self) -> usize {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        // A task that completed before its handle was registered can leave a
        // finished entry behind; sweep those here.
        live.retain(|_, handle| !handle.is_finished());
        live.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
