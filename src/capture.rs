//! Microphone capture pipeline.
//!
//! A dedicated OS thread owns the PulseAudio record stream and forwards
//! fixed-size frames over a bounded channel. The forwarding is
//! fire-and-forget: when the consumer falls behind, frames are dropped
//! rather than stalling the device thread, and frames are never reordered.

use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Input sample rate expected by the streaming API.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Mono capture.
pub const CAPTURE_CHANNELS: u8 = 1;
/// Fixed frame size forwarded to the transport (128 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 2048;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("microphone did not become ready in time")]
    StartTimeout,
}

/// Handle to a live microphone stream.
///
/// The device is acquired before `open` returns and released exactly once,
/// when the capture thread exits after `stop` (or drop).
pub struct MicStream {
    rx: mpsc::Receiver<Vec<f32>>,
    shutdown: Arc<AtomicBool>,
    _handle: Option<std::thread::JoinHandle<()>>,
}

impl MicStream {
    /// Acquire the default input device and start capturing.
    ///
    /// The capture thread reports device acquisition through a handshake, so
    /// permission and device failures surface here instead of being logged
    /// away on the thread.
    pub fn open(app_name: &str) -> Result<Self, CaptureError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (tx, rx) = mpsc::channel::<Vec<f32>>(32);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let app_name = app_name.to_string();

        // A real OS thread, not a tokio task: the Simple API blocks.
        let handle = std::thread::spawn(move || {
            run_capture(app_name, ready_tx, tx, shutdown_flag);
        });

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                rx,
                shutdown,
                _handle: Some(handle),
            }),
            Ok(Err(msg)) => Err(CaptureError::DeviceUnavailable(msg)),
            Err(_) => {
                shutdown.store(true, Ordering::Relaxed);
                Err(CaptureError::StartTimeout)
            }
        }
    }

    /// Receive the next capture frame; `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.rx.recv().await
    }

    /// Signal the capture thread to release the device. Idempotent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Test stream fed from a plain channel, no device behind it.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            _handle: None,
        }
    }
}

impl Drop for MicStream {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // The thread exits when it sees the flag or the channel closes.
    }
}

fn run_capture(
    app_name: String,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
    tx: mpsc::Sender<Vec<f32>>,
    shutdown: Arc<AtomicBool>,
) {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: CAPTURE_CHANNELS,
        rate: CAPTURE_SAMPLE_RATE,
    };

    let capture = match psimple::Simple::new(
        None, // default server
        &app_name,
        pulse::stream::Direction::Record,
        None, // default device
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(capture) => {
            let _ = ready_tx.send(Ok(()));
            capture
        }
        Err(e) => {
            let _ = ready_tx.send(Err(ToString::to_string(&e)));
            return;
        }
    };

    info!(
        "microphone connected: {} Hz mono, {}-sample frames",
        CAPTURE_SAMPLE_RATE, FRAME_SAMPLES
    );

    let mut bytes = vec![0u8; FRAME_SAMPLES * 4];
    let mut dropped: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = capture.read(&mut bytes) {
            error!("microphone read failed: {}", e);
            break;
        }

        let frame: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Consumer is behind; shed the frame rather than stall the device.
                dropped += 1;
                if dropped % 64 == 1 {
                    warn!("capture backlog, {} frames dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!("microphone capture thread exiting ({} frames dropped)", dropped);
}
