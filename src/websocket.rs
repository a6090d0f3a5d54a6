//! # WebSocket Relay Handler
//!
//! Bridges a browser WebSocket connection to the upstream streaming
//! transcription endpoint. Clients connect to `/ws/transcribe` and drive a
//! relay session with JSON commands; transcription results stream back on
//! the same connection.
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: `start` (language/sample-rate, both optional),
//!   `audio` (base64 PCM chunk), `stop`
//! - **Server → Client**: `status` (starting/streaming/stopping/ended),
//!   `transcript` (one segment per message, in upstream order), `error`
//!
//! ## Actor Model:
//! Each connection is one Actix actor. Client frames arrive through the
//! WebSocket stream; upstream events are attached to the same actor with
//! `ctx.add_stream`, so every state transition for a session runs on one
//! logical thread of control and the session needs no locks.
//!
//! A generation counter tags each start attempt. Events from a connection
//! that was since stopped or replaced carry a stale generation and are
//! discarded, so a rapid stop-then-start sequence cannot let the old
//! connection's teardown reset the new session.

use crate::config::{AppConfig, TranscribeConfig};
use crate::error::RelayError;
use crate::state::AppState;
use crate::transcribe::session::{self, SessionBridge, UpstreamConnection, UpstreamEvent};
use crate::transcribe::TranscriptSegment;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// How often the server pings an idle client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any client traffic before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages exchanged with the client, tagged by `type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// Start a relay session; omitted fields fall back to configuration
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "languageCode", default, skip_serializing_if = "Option::is_none")]
        language_code: Option<String>,
        #[serde(rename = "sampleRateHertz", default, skip_serializing_if = "Option::is_none")]
        sample_rate_hertz: Option<u32>,
    },

    /// One chunk of base64-encoded raw PCM audio
    #[serde(rename = "audio")]
    Audio {
        #[serde(rename = "chunkBase64", default)]
        chunk_base64: Option<String>,
    },

    /// Stop the relay session
    #[serde(rename = "stop")]
    Stop {},

    /// Session lifecycle updates from the server
    #[serde(rename = "status")]
    Status {
        state: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "languageCode", default, skip_serializing_if = "Option::is_none")]
        language_code: Option<String>,
        #[serde(rename = "sampleRateHertz", default, skip_serializing_if = "Option::is_none")]
        sample_rate_hertz: Option<u32>,
        #[serde(rename = "closeCode", default, skip_serializing_if = "Option::is_none")]
        close_code: Option<u16>,
        #[serde(rename = "closeReason", default, skip_serializing_if = "Option::is_none")]
        close_reason: Option<String>,
    },

    /// One transcript segment, forwarded in upstream order
    #[serde(rename = "transcript")]
    Transcript {
        text: String,
        #[serde(rename = "isPartial")]
        is_partial: bool,
        /// Null until the upstream supplies a time
        #[serde(rename = "startTime")]
        start_time: Option<f64>,
        #[serde(rename = "endTime")]
        end_time: Option<f64>,
    },

    /// Error report; the session state depends on the failure class
    #[serde(rename = "error")]
    Error { message: String },
}

/// Resolve the effective start parameters against configured defaults.
fn resolve_start_params(
    config: &TranscribeConfig,
    language_code: Option<String>,
    sample_rate_hertz: Option<u32>,
) -> (String, u32) {
    (
        language_code.unwrap_or_else(|| config.default_language_code.clone()),
        sample_rate_hertz.unwrap_or(config.default_sample_rate_hertz),
    )
}

/// Decode one transport-encoded audio chunk into raw PCM bytes.
pub(crate) fn decode_audio_chunk(chunk: &str) -> Result<Vec<u8>, RelayError> {
    BASE64
        .decode(chunk.as_bytes())
        .map_err(|e| RelayError::BadInput(format!("Bad audio chunk: {}", e)))
}

/// Result of a successful presign-and-connect, delivered to the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamReady {
    generation: u64,
    connection: UpstreamConnection,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    language_code: String,
    sample_rate_hertz: u32,
}

/// A start attempt that failed before the connection opened.
#[derive(Message)]
#[rtype(result = "()")]
struct StartFailed {
    generation: u64,
    message: String,
}

/// An upstream event tagged with the start attempt it belongs to.
struct TaggedUpstreamEvent {
    generation: u64,
    event: UpstreamEvent,
}

/// WebSocket actor owning one relay session.
pub struct RelayWebSocket {
    /// Per-connection session state machine
    bridge: SessionBridge,

    /// Counter distinguishing start attempts; stale events are dropped
    generation: u64,

    /// Shared application state (metrics)
    app_state: web::Data<AppState>,

    /// Configuration snapshot taken when the connection was accepted
    config: AppConfig,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let config = app_state.get_config();
        Self {
            bridge: SessionBridge::new(),
            generation: 0,
            app_state,
            config,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &RelayMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }

    fn send_status(&self, ctx: &mut ws::WebsocketContext<Self>, state: &str) {
        self.send_message(
            ctx,
            &RelayMessage::Status {
                state: state.to_string(),
                session_id: self.bridge.session_id.clone(),
                language_code: None,
                sample_rate_hertz: None,
                close_code: None,
                close_reason: None,
            },
        );
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        warn!(session_id = %self.bridge.session_id, error = %message, "Relay error");
        self.send_message(ctx, &RelayMessage::Error { message });
    }

    /// Handle a `start` command: claim the state machine, then sign and
    /// connect off the actor thread.
    fn handle_start(
        &mut self,
        language_code: Option<String>,
        sample_rate_hertz: Option<u32>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if !self.bridge.begin_start() {
            // Duplicate start while starting or streaming: nothing is
            // signed and no error is reported
            debug!(session_id = %self.bridge.session_id, "Duplicate start ignored");
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        let (language_code, sample_rate_hertz) =
            resolve_start_params(&self.config.transcribe, language_code, sample_rate_hertz);

        self.send_message(
            ctx,
            &RelayMessage::Status {
                state: "starting".to_string(),
                session_id: self.bridge.session_id.clone(),
                language_code: Some(language_code.clone()),
                sample_rate_hertz: Some(sample_rate_hertz),
                close_code: None,
                close_reason: None,
            },
        );

        let region = self.config.transcribe.region.clone();
        let expiry = self.config.transcribe.presign_expiry_seconds;
        let addr = ctx.address();

        tokio::spawn(async move {
            match session::open_upstream(&region, &language_code, sample_rate_hertz, expiry).await
            {
                Ok((connection, events)) => addr.do_send(UpstreamReady {
                    generation,
                    connection,
                    events,
                    language_code,
                    sample_rate_hertz,
                }),
                Err(err) => addr.do_send(StartFailed {
                    generation,
                    message: err.to_string(),
                }),
            }
        });
    }

    /// Handle an `audio` command. Dropped silently unless the session is
    /// streaming; an undecodable chunk is reported without ending the
    /// session.
    fn handle_audio(&mut self, chunk: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.bridge.connection().is_none() {
            return;
        }
        let chunk = match chunk {
            Some(chunk) if !chunk.is_empty() => chunk,
            _ => return,
        };

        match decode_audio_chunk(&chunk) {
            Ok(pcm) => {
                if let Some(connection) = self.bridge.connection() {
                    connection.send_audio(pcm);
                    self.app_state.record_audio_chunk();
                }
            }
            Err(_) => self.send_error(ctx, "Bad audio chunk".to_string()),
        }
    }

    /// Handle a `stop` command: request the upstream close without
    /// awaiting it and reset immediately.
    fn handle_stop(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let was_streaming = self.bridge.is_streaming();
        if let Some(connection) = self.bridge.reset() {
            connection.close(CloseCode::Normal, "client stop");
        }
        if was_streaming {
            self.app_state.decrement_active_sessions();
        }
        self.send_status(ctx, "stopping");
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.bridge.session_id, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.bridge.session_id, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// The client channel is gone: release the upstream connection with a
    /// going-away close. There is no channel left to notify.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let was_streaming = self.bridge.is_streaming();
        if let Some(connection) = self.bridge.reset() {
            connection.close(CloseCode::Away, "client disconnect");
        }
        if was_streaming {
            self.app_state.decrement_active_sessions();
        }
        info!(session_id = %self.bridge.session_id, "WebSocket connection stopped");
    }
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                Ok(RelayMessage::Start {
                    language_code,
                    sample_rate_hertz,
                }) => {
                    self.handle_start(language_code, sample_rate_hertz, ctx);
                }
                Ok(RelayMessage::Audio { chunk_base64 }) => {
                    self.handle_audio(chunk_base64, ctx);
                }
                Ok(RelayMessage::Stop {}) => {
                    self.handle_stop(ctx);
                }
                Ok(_) => {
                    warn!("Received server-only message type from client");
                }
                Err(err) => {
                    self.send_error(ctx, format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                // The protocol carries audio as base64 text frames
                warn!("Ignoring unexpected binary frame from client");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upstream events for this session, delivered through the actor mailbox.
impl StreamHandler<TaggedUpstreamEvent> for RelayWebSocket {
    fn handle(&mut self, msg: TaggedUpstreamEvent, ctx: &mut Self::Context) {
        if msg.generation != self.generation {
            debug!("Dropping event from a superseded upstream connection");
            return;
        }

        match msg.event {
            UpstreamEvent::Transcript(segments) => {
                if !segments.is_empty() {
                    self.app_state.record_transcript_segments(segments.len() as u64);
                }
                for TranscriptSegment {
                    text,
                    is_partial,
                    start_time,
                    end_time,
                } in segments
                {
                    self.send_message(
                        ctx,
                        &RelayMessage::Transcript {
                            text,
                            is_partial,
                            start_time,
                            end_time,
                        },
                    );
                }
            }
            UpstreamEvent::Exception {
                event_type,
                message,
            } => {
                // The session stays open; only the transport ends it
                self.app_state.record_upstream_error();
                let combined = RelayError::UpstreamException {
                    event_type,
                    message,
                }
                .to_string();
                self.send_error(ctx, combined);
            }
            UpstreamEvent::Closed { code, reason } => {
                let was_streaming = self.bridge.is_streaming();
                // The socket is already gone; just drop our reference
                self.bridge.reset();
                if was_streaming {
                    self.app_state.decrement_active_sessions();
                }
                self.send_message(
                    ctx,
                    &RelayMessage::Status {
                        state: "ended".to_string(),
                        session_id: self.bridge.session_id.clone(),
                        language_code: None,
                        sample_rate_hertz: None,
                        close_code: code,
                        close_reason: if reason.is_empty() { None } else { Some(reason) },
                    },
                );
            }
            UpstreamEvent::TransportError(message) => {
                let was_streaming = self.bridge.is_streaming();
                self.bridge.reset();
                if was_streaming {
                    self.app_state.decrement_active_sessions();
                }
                self.app_state.record_upstream_error();
                self.send_error(ctx, message);
            }
        }
    }

    /// The upstream event stream drained. The client channel stays open —
    /// the session already returned to idle, and the client may start
    /// again.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<UpstreamReady> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamReady, ctx: &mut Self::Context) {
        if msg.generation != self.generation {
            // A newer start owns the session now
            msg.connection.close(CloseCode::Away, "superseded");
            return;
        }

        match self.bridge.adopt(msg.connection) {
            Ok(()) => {
                let generation = msg.generation;
                ctx.add_stream(
                    UnboundedReceiverStream::new(msg.events)
                        .map(move |event| TaggedUpstreamEvent { generation, event }),
                );
                self.app_state.increment_active_sessions();
                info!(
                    session_id = %self.bridge.session_id,
                    language_code = %msg.language_code,
                    sample_rate_hertz = msg.sample_rate_hertz,
                    "Upstream connection established"
                );
                self.send_message(
                    ctx,
                    &RelayMessage::Status {
                        state: "streaming".to_string(),
                        session_id: self.bridge.session_id.clone(),
                        language_code: Some(msg.language_code),
                        sample_rate_hertz: Some(msg.sample_rate_hertz),
                        close_code: None,
                        close_reason: None,
                    },
                );
            }
            Err(connection) => {
                // The session was stopped while the connect was in flight
                debug!(session_id = %self.bridge.session_id, "Discarding connection for a reset session");
                connection.close(CloseCode::Away, "session reset");
            }
        }
    }
}

impl Handler<StartFailed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: StartFailed, ctx: &mut Self::Context) {
        if msg.generation != self.generation {
            return;
        }

        // One error per failed attempt, then back to idle for a retry
        self.bridge.reset();
        self.send_error(ctx, msg.message);
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh `RelayWebSocket` actor.
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    ws::start(RelayWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_start_message_fields_are_optional() {
        let msg: RelayMessage = serde_json::from_str(r#"{"type": "start"}"#).unwrap();

        match msg {
            RelayMessage::Start {
                language_code,
                sample_rate_hertz,
            } => {
                assert_eq!(language_code, None);
                assert_eq!(sample_rate_hertz, None);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_start_defaults_come_from_configuration() {
        let config = AppConfig::default();

        let (language, rate) = resolve_start_params(&config.transcribe, None, None);
        assert_eq!(language, "en-US");
        assert_eq!(rate, 16000);

        let (language, rate) =
            resolve_start_params(&config.transcribe, Some("de-DE".to_string()), Some(8000));
        assert_eq!(language, "de-DE");
        assert_eq!(rate, 8000);
    }

    #[test]
    fn test_audio_chunk_decodes_to_raw_bytes() {
        // Four base64 characters of zeros are three zero bytes of PCM
        assert_eq!(decode_audio_chunk("AAAA").unwrap(), vec![0, 0, 0]);
        assert!(matches!(
            decode_audio_chunk("not base64!"),
            Err(RelayError::BadInput(_))
        ));
    }

    #[test]
    fn test_transcript_message_serializes_missing_times_as_null() {
        let msg = RelayMessage::Transcript {
            text: "hello".to_string(),
            is_partial: true,
            start_time: None,
            end_time: None,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["isPartial"], true);
        assert!(json["startTime"].is_null());
        assert!(json["endTime"].is_null());
    }

    #[test]
    fn test_status_message_omits_absent_context_fields() {
        let msg = RelayMessage::Status {
            state: "stopping".to_string(),
            session_id: "abc".to_string(),
            language_code: None,
            sample_rate_hertz: None,
            close_code: None,
            close_reason: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""state":"stopping""#));
        assert!(json.contains(r#""sessionId":"abc""#));
        assert!(!json.contains("languageCode"));
        assert!(!json.contains("closeCode"));
    }

    #[test]
    fn test_client_command_round_trip() {
        let audio: RelayMessage =
            serde_json::from_str(r#"{"type": "audio", "chunkBase64": "AAAA"}"#).unwrap();
        match audio {
            RelayMessage::Audio { chunk_base64 } => {
                assert_eq!(chunk_base64.as_deref(), Some("AAAA"));
            }
            _ => panic!("Wrong message type"),
        }

        let stop: RelayMessage = serde_json::from_str(r#"{"type": "stop"}"#).unwrap();
        assert!(matches!(stop, RelayMessage::Stop {}));
    }
}
