//! Microphone smoke test: prints a live level meter for ten seconds.

use lingolive::capture::{MicStream, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use lingolive::pcm;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!(
        "Opening microphone ({} Hz mono, {}-sample frames)...",
        CAPTURE_SAMPLE_RATE, FRAME_SAMPLES
    );
    let mut mic = MicStream::open("lingolive-mic-test")?;
    println!("✅ Microphone open. Speak for ten seconds.");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let frame = tokio::select! {
            frame = mic.next_frame() => frame,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let Some(frame) = frame else {
            println!("❌ Capture stream ended early");
            break;
        };
        let level = pcm::rms_level(&frame);
        let bar = "#".repeat((level * 200.0).min(50.0) as usize);
        println!("{:>6.4} |{:<50}|", level, bar);
    }

    mic.stop();
    println!("Mic level test complete!");
    Ok(())
}
