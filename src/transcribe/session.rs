//! # Relay Session State Machine
//!
//! One `SessionBridge` exists per client connection. It owns at most one
//! upstream connection at a time and moves through a small cycle:
//!
//! ```text
//! Idle ──start──▶ Starting ──opened──▶ Streaming ──stop/close/error──▶ Idle
//! ```
//!
//! The started flag and the connection reference are one enum, so they can
//! only change together — there is no way to be "started" without holding
//! the connection, or to keep a connection after a reset.
//!
//! All transitions happen on the owning actor's single logical thread of
//! control; the async work (signing, connecting, socket I/O) lives in
//! spawned tasks that report back through channels.

use crate::error::RelayError;
use crate::transcribe::eventstream::{self, Frame};
use crate::transcribe::signer::{self, Credentials};
use crate::transcribe::transcript::{self, TranscriptSegment};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events surfaced by the upstream connection's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Transcript segments from one `TranscriptEvent` frame, in order
    Transcript(Vec<TranscriptSegment>),

    /// An exception frame; the session stays open
    Exception {
        event_type: String,
        message: String,
    },

    /// The upstream closed the connection
    Closed {
        code: Option<u16>,
        reason: String,
    },

    /// The transport failed underneath the connection
    TransportError(String),
}

/// Classify one decoded inbound frame.
///
/// Only `event`/`TranscriptEvent` and `exception` frames are meaningful;
/// everything else is protocol noise and maps to `None`, which the reader
/// drops without comment.
pub fn classify(frame: &Frame) -> Option<UpstreamEvent> {
    match (frame.message_type(), frame.event_type()) {
        ("event", "TranscriptEvent") => {
            Some(UpstreamEvent::Transcript(transcript::extract(&frame.payload)))
        }
        ("exception", event_type) => Some(UpstreamEvent::Exception {
            event_type: event_type.to_string(),
            message: String::from_utf8_lossy(&frame.payload).to_string(),
        }),
        _ => None,
    }
}

/// Handle to an open upstream connection.
///
/// Sends are fire-and-forget through an unbounded channel into the writer
/// task — there is no local buffering policy or backpressure; a slow
/// upstream behaves however the transport behaves.
#[derive(Debug)]
pub struct UpstreamConnection {
    outbound: mpsc::UnboundedSender<Message>,
}

impl UpstreamConnection {
    /// Wrap raw PCM bytes in an AudioEvent frame and queue it for sending.
    pub fn send_audio(&self, pcm: Vec<u8>) {
        let bytes = eventstream::encode(&eventstream::audio_event(pcm));
        if self.outbound.send(Message::Binary(bytes)).is_err() {
            // Writer task is gone; the close/error event is already on its way
            debug!("Dropped audio frame: upstream writer has stopped");
        }
    }

    /// Queue a close frame. Does not wait for the close handshake.
    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if self.outbound.send(Message::Close(Some(frame))).is_err() {
            debug!("Upstream already closed before close request");
        }
    }
}

/// Open the upstream WebSocket and split it into writer and reader tasks.
///
/// Returns the send handle and the event stream produced by the reader.
/// Both tasks end on their own when the socket or the channels close.
pub async fn connect(
    url: &str,
) -> Result<(UpstreamConnection, mpsc::UnboundedReceiver<UpstreamEvent>), RelayError> {
    let (socket, _response) = connect_async(url)
        .await
        .map_err(|e| RelayError::Connection(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<UpstreamEvent>();

    // Writer: drain queued frames into the socket until it closes
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                debug!("Upstream sink closed while writing");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader: decode, classify and forward inbound frames
    tokio::spawn(async move {
        let mut ended = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Binary(data)) => match eventstream::decode(&data) {
                    Ok(frame) => {
                        if let Some(event) = classify(&frame) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    // Malformed frames must not kill a live session
                    Err(err) => debug!("Ignoring undecodable upstream frame: {}", err),
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = event_tx.send(UpstreamEvent::Closed { code, reason });
                    ended = true;
                    break;
                }
                Ok(_) => {} // text/ping/pong frames carry nothing for us
                Err(err) => {
                    warn!("Upstream transport error: {}", err);
                    let _ = event_tx.send(UpstreamEvent::TransportError(err.to_string()));
                    ended = true;
                    break;
                }
            }
        }
        if !ended {
            let _ = event_tx.send(UpstreamEvent::Closed {
                code: None,
                reason: "connection closed".to_string(),
            });
        }
    });

    Ok((
        UpstreamConnection {
            outbound: outbound_tx,
        },
        event_rx,
    ))
}

/// Sign a fresh URL and open the upstream connection for one session start.
///
/// Credentials are read from the environment here, at start time, so a
/// missing credential is a per-start failure the client can observe and
/// retry after fixing the environment.
pub async fn open_upstream(
    region: &str,
    language_code: &str,
    sample_rate_hertz: u32,
    expiry_seconds: u64,
) -> Result<(UpstreamConnection, mpsc::UnboundedReceiver<UpstreamEvent>), RelayError> {
    let credentials = Credentials::from_env()?;
    let params = request_params(language_code, sample_rate_hertz);
    let host = format!("transcribestreaming.{}.amazonaws.com:8443", region);
    let url = signer::presign(
        &host,
        "/stream-transcription-websocket",
        &params,
        &credentials,
        region,
        "transcribe",
        expiry_seconds,
    )?;
    connect(&url).await
}

/// The request parameters every session start signs into its URL.
pub fn request_params(language_code: &str, sample_rate_hertz: u32) -> Vec<(String, String)> {
    vec![
        ("language-code".to_string(), language_code.to_string()),
        ("media-encoding".to_string(), "pcm".to_string()),
        ("sample-rate".to_string(), sample_rate_hertz.to_string()),
    ]
}

/// Lifecycle state of one relay session.
#[derive(Debug)]
enum BridgeState {
    /// No upstream activity; a start is valid
    Idle,
    /// A start is in flight (signing or connecting)
    Starting,
    /// The upstream connection is open and owned by this session
    Streaming(UpstreamConnection),
}

/// Per-client relay session.
pub struct SessionBridge {
    /// Unique identifier for this session, used in logs and status events
    pub session_id: String,

    state: BridgeState,
}

impl SessionBridge {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            state: BridgeState::Idle,
        }
    }

    /// Claim the right to start.
    ///
    /// Returns `true` and moves to Starting only from Idle. A duplicate
    /// start while Starting or Streaming returns `false` — callers treat
    /// that as a silent no-op and must not sign or connect again.
    pub fn begin_start(&mut self) -> bool {
        match self.state {
            BridgeState::Idle => {
                self.state = BridgeState::Starting;
                true
            }
            _ => false,
        }
    }

    /// Adopt a freshly opened connection.
    ///
    /// Succeeds only while Starting. When the session was reset while the
    /// connect was in flight the connection is handed back so the caller
    /// can close it instead of leaking it.
    pub fn adopt(&mut self, connection: UpstreamConnection) -> Result<(), UpstreamConnection> {
        match self.state {
            BridgeState::Starting => {
                self.state = BridgeState::Streaming(connection);
                Ok(())
            }
            _ => Err(connection),
        }
    }

    /// Return to Idle on any exit path, handing back the connection (if
    /// one is owned) for the caller to close.
    pub fn reset(&mut self) -> Option<UpstreamConnection> {
        match std::mem::replace(&mut self.state, BridgeState::Idle) {
            BridgeState::Streaming(connection) => Some(connection),
            _ => None,
        }
    }

    /// The owned connection while Streaming.
    pub fn connection(&self) -> Option<&UpstreamConnection> {
        match &self.state {
            BridgeState::Streaming(connection) => Some(connection),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, BridgeState::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, BridgeState::Streaming(_))
    }
}

impl Default for SessionBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::eventstream::{audio_event, decode, encode};

    fn test_connection() -> (UpstreamConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UpstreamConnection { outbound: tx }, rx)
    }

    #[test]
    fn test_duplicate_start_is_a_no_op() {
        let mut bridge = SessionBridge::new();

        assert!(bridge.begin_start());
        // Second start while the first is in flight: nothing gets signed
        assert!(!bridge.begin_start());

        let (conn, _rx) = test_connection();
        bridge.adopt(conn).unwrap();
        // Still a no-op while streaming
        assert!(!bridge.begin_start());
    }

    #[test]
    fn test_adopt_is_rejected_after_reset() {
        let mut bridge = SessionBridge::new();
        assert!(bridge.begin_start());

        // Client stopped while the connect was in flight
        assert!(bridge.reset().is_none());

        let (conn, _rx) = test_connection();
        // The late connection is handed back instead of adopted
        assert!(bridge.adopt(conn).is_err());
        assert!(bridge.is_idle());
    }

    #[test]
    fn test_reset_hands_back_the_owned_connection() {
        let mut bridge = SessionBridge::new();
        assert!(bridge.begin_start());
        let (conn, _rx) = test_connection();
        bridge.adopt(conn).unwrap();
        assert!(bridge.is_streaming());

        assert!(bridge.reset().is_some());
        assert!(bridge.is_idle());
        // Idle again: the cycle can restart
        assert!(bridge.begin_start());
    }

    #[test]
    fn test_send_audio_produces_one_audio_event_frame() {
        let (conn, mut rx) = test_connection();

        conn.send_audio(vec![0, 0, 0]);

        let message = rx.try_recv().unwrap();
        let bytes = match message {
            Message::Binary(bytes) => bytes,
            other => panic!("expected binary frame, got {:?}", other),
        };
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame, audio_event(vec![0, 0, 0]));
        // Exactly one frame per chunk
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_queues_a_close_frame() {
        let (conn, mut rx) = test_connection();

        conn.close(CloseCode::Normal, "client stop");

        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason, "client stop");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_transcript_event() {
        let frame = Frame {
            headers: vec![
                (":message-type".to_string(), "event".to_string()),
                (":event-type".to_string(), "TranscriptEvent".to_string()),
            ],
            payload: br#"{
                "Transcript": {"Results": [
                    {"IsPartial": true, "Alternatives": [{"Transcript": "hi"}]}
                ]}
            }"#
            .to_vec(),
        };

        match classify(&frame) {
            Some(UpstreamEvent::Transcript(segments)) => {
                assert_eq!(segments.len(), 1);
                assert_eq!(segments[0].text, "hi");
                assert!(segments[0].is_partial);
            }
            other => panic!("expected transcript event, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_exception_keeps_type_and_body() {
        let frame = Frame {
            headers: vec![
                (":message-type".to_string(), "exception".to_string()),
                (
                    ":event-type".to_string(),
                    "BadRequestException".to_string(),
                ),
            ],
            payload: b"invalid sample rate".to_vec(),
        };

        assert_eq!(
            classify(&frame),
            Some(UpstreamEvent::Exception {
                event_type: "BadRequestException".to_string(),
                message: "invalid sample rate".to_string(),
            })
        );
    }

    #[test]
    fn test_classify_ignores_protocol_noise() {
        let ack = Frame {
            headers: vec![
                (":message-type".to_string(), "event".to_string()),
                (":event-type".to_string(), "SomeOtherEvent".to_string()),
            ],
            payload: Vec::new(),
        };
        assert_eq!(classify(&ack), None);

        let bare = Frame {
            headers: Vec::new(),
            payload: b"noise".to_vec(),
        };
        assert_eq!(classify(&bare), None);
    }

    #[test]
    fn test_request_params_cover_the_required_set() {
        let params = request_params("en-US", 16000);

        assert_eq!(
            params,
            vec![
                ("language-code".to_string(), "en-US".to_string()),
                ("media-encoding".to_string(), "pcm".to_string()),
                ("sample-rate".to_string(), "16000".to_string()),
            ]
        );
    }
}
