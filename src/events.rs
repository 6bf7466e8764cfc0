use crate::pcm::EncodedChunk;

/// Everything the transport surfaces to the session loop, in arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Model audio, still base64 as received; decoding happens at the
    /// playback boundary so one bad chunk never faults the transport.
    Audio(EncodedChunk),
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
    Error(String),
    Closed,
}
