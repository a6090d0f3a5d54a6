//! # Upstream Transcription Relay
//!
//! Everything needed to talk to the cloud streaming transcription
//! endpoint lives here:
//!
//! - **signer**: presigned connection URLs (canonical query-string
//!   signature, time-limited)
//! - **eventstream**: the binary frame codec used on the upstream socket
//! - **transcript**: the JSON payload model and segment extraction
//! - **session**: the per-client state machine that owns the upstream
//!   connection and classifies inbound frames
//!
//! The HTTP/WebSocket layer in `crate::websocket` drives these pieces; no
//! code here knows about actix or the client-facing protocol.

pub mod eventstream;
pub mod session;
pub mod signer;
pub mod transcript;

pub use session::{SessionBridge, UpstreamEvent};
pub use transcript::TranscriptSegment;
