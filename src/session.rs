//! Live WebSocket session against the streaming API.
//!
//! `connect` performs the setup handshake before returning, then hands the
//! socket halves to two tasks: a writer draining an unbounded command channel
//! (so sends never block the session loop) and a reader translating server
//! frames into `SessionEvent`s, delivered strictly in arrival order.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::gemini::{
    audio_frame, audio_stream_end_frame, parse_inbound, setup_frame, Inbound, LiveConfig,
    LiveError, SETUP_TIMEOUT,
};
use crate::pcm::EncodedChunk;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(String),
    Close,
}

/// Handle to one open bidirectional stream.
///
/// Dropping the handle closes the session; `close` is idempotent and safe to
/// call from teardown paths that may run more than once.
pub struct LiveSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl LiveSession {
    /// Open the socket, send the setup frame, and wait for the server's
    /// confirmation. Returns the session plus its ordered event stream.
    pub async fn connect(
        config: &LiveConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), LiveError> {
        let (ws, _) = connect_async(&config.url).await?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(setup_frame(config)?.into())).await?;

        match tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(LiveError::SetupTimeout),
        }
        info!("live session established (model {})", config.model);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // The writer needs no handle: it exits on its own after draining the
        // close command, or when the link dies.
        tokio::spawn(run_writer(sink, outbound_rx));
        let reader = tokio::spawn(run_reader(stream, events_tx));

        let session = Self {
            outbound: outbound_tx,
            reader: Some(reader),
            closed: false,
        };
        Ok((session, events_rx))
    }

    /// Queue one audio chunk for sending. Fire-and-forget: never blocks,
    /// and is a silent no-op once the session is closed.
    pub fn send_audio(&self, chunk: &EncodedChunk) {
        if self.closed {
            return;
        }
        match audio_frame(chunk) {
            Ok(frame) => {
                let _ = self.outbound.send(Outbound::Frame(frame));
            }
            Err(e) => warn!("failed to build audio frame: {}", e),
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Session wired to bare channels, no socket behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            outbound: outbound_tx,
            reader: None,
            closed: false,
        };
        (session, outbound_rx, events_tx, events_rx)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
        // The writer drains the queued close command and finishes the polite
        // shutdown on its own. The reader may be parked on a socket the
        // server never closes, so it gets aborted.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn await_setup_complete(stream: &mut WsSource) -> Result<(), LiveError> {
    while let Some(message) = stream.next().await {
        let message = message?;
        if matches!(message, Message::Close(_)) {
            return Err(LiveError::SetupIncomplete);
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        match parse_inbound(&text) {
            Ok(Inbound::SetupComplete) => return Ok(()),
            Ok(other) => debug!("pre-setup message ignored: {:?}", other),
            Err(e) => warn!("unparseable pre-setup frame: {}", e),
        }
    }
    Err(LiveError::SetupIncomplete)
}

async fn run_writer(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(command) = rx.recv().await {
        match command {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!("websocket send failed: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                // Polite shutdown: mark the audio stream finished, then close.
                let _ = sink
                    .send(Message::Text(audio_stream_end_frame().into()))
                    .await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!("session writer exiting");
}

async fn run_reader(mut stream: WsSource, events: mpsc::UnboundedSender<SessionEvent>) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                let _ = events.send(SessionEvent::Error(e.to_string()));
                return;
            }
        };
        if matches!(message, Message::Close(_)) {
            break;
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        match parse_inbound(&text) {
            Ok(Inbound::Events(batch)) => {
                for event in batch {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(Inbound::GoAway) => {
                info!("server signalled imminent disconnect");
                break;
            }
            Ok(Inbound::SetupComplete) => debug!("duplicate setupComplete ignored"),
            Ok(Inbound::Unknown(kind)) => debug!("ignoring server message kind {:?}", kind),
            Err(e) => warn!("unparseable server frame: {}", e),
        }
    }
    let _ = events.send(SessionEvent::Closed);
}

/// The server interleaves text and binary frames; binary frames carry the
/// same JSON payloads.
fn frame_text(message: &Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                warn!("binary frame is not UTF-8 ({} bytes)", data.len());
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let (mut session, mut outbound_rx, _events_tx, _events_rx) = LiveSession::detached();
        session.close();
        session.close();
        session.close();

        assert!(matches!(outbound_rx.try_recv(), Ok(Outbound::Close)));
        assert!(outbound_rx.try_recv().is_err(), "close must be sent once");
    }

    #[test]
    fn test_send_after_close_is_a_noop() {
        let (mut session, mut outbound_rx, _events_tx, _events_rx) = LiveSession::detached();
        session.close();
        let _ = outbound_rx.try_recv();

        session.send_audio(&EncodedChunk {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        assert!(outbound_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_audio_queues_a_frame() {
        let (session, mut outbound_rx, _events_tx, _events_rx) = LiveSession::detached();
        session.send_audio(&EncodedChunk {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        match outbound_rx.try_recv() {
            Ok(Outbound::Frame(frame)) => assert!(frame.contains("realtimeInput")),
            other => panic!("unexpected: {:?}", other),
        }
        drop(session);
    }

    #[test]
    fn test_frame_text_accepts_binary_json() {
        let msg = Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        assert_eq!(frame_text(&msg).as_deref(), Some(r#"{"setupComplete":{}}"#));

        let msg = Message::Binary(vec![0xff, 0xfe].into());
        assert!(frame_text(&msg).is_none());

        assert!(frame_text(&Message::Ping(vec![].into())).is_none());
    }

    #[tokio::test]
    async fn test_drop_lets_the_writer_drain_the_close_command() {
        let (session, mut outbound_rx, _events_tx, _events_rx) = LiveSession::detached();

        // Drains the command channel the way the writer task does.
        let writer = tokio::spawn(async move {
            loop {
                match outbound_rx.recv().await {
                    Some(Outbound::Close) => return true,
                    Some(Outbound::Frame(_)) => continue,
                    None => return false,
                }
            }
        });

        drop(session);

        let drained = tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .expect("writer never finished")
            .expect("writer task panicked");
        assert!(
            drained,
            "drop must leave the close command deliverable to the writer"
        );
    }
}
