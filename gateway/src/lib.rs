//! Realtime voice-assistant gateway.
//!
//! A browser streams push-to-talk PCM over a WebSocket; the gateway relays
//! it to the Doubao realtime dialogue service and streams synthesized audio
//! and incremental transcripts back, journaling every session to disk.
//!
//! Modules map onto the moving parts:
//! - [`config`] — operator configuration, loaded once from the environment.
//! - [`journal`] — append-only per-session event log plus summaries.
//! - [`registry`] — process-wide id → session map.
//! - [`session`] — the per-session record and its serialization lane.
//! - [`relay`] — browser ⇄ upstream translation and lifecycle coupling.
//! - [`server`] — the axum router and HTTP endpoints.

pub mod config;
pub mod journal;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::{router, serve, AppState};
