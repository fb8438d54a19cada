//! Doubao realtime dialogue SDK.
//!
//! This crate speaks the realtime dialogue service's length-prefixed binary
//! framing and owns the per-session WebSocket connection:
//!
//! - [`protocol`] — the frame codec (header bit packing, gzip, JSON bodies).
//! - [`RealtimeClient`] — connection handshake, audio streaming,
//!   interruption and teardown.
//!
//! # Example
//!
//! ```ignore
//! use voicebox_doubao::{RealtimeClient, SessionParams, UpstreamConfig, UpstreamEvent};
//!
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(256);
//! let client = RealtimeClient::connect(
//!     UpstreamConfig::default(),
//!     "session-id".to_string(),
//!     SessionParams::default(),
//!     events_tx,
//! ).await?;
//!
//! client.send_audio_chunk(&pcm).await?;
//!
//! while let Some(event) = events_rx.recv().await {
//!     match event {
//!         UpstreamEvent::Message(frame) => { /* relay */ }
//!         UpstreamEvent::Closed { .. } | UpstreamEvent::Error(_) => break,
//!     }
//! }
//! ```

mod error;
pub mod protocol;
mod realtime;

pub use error::{Error, Result};
pub use realtime::{
    RealtimeClient, SessionParams, UpstreamConfig, UpstreamEvent, DEFAULT_BASE_URL,
    HANDSHAKE_TIMEOUT,
};
