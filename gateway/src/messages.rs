//! Browser-facing WebSocket message schema.
//!
//! JSON text frames with a `type` discriminator, `client.*` inbound and
//! `server.*` outbound.

use serde::{Deserialize, Serialize};

/// Message from the browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    /// The user pressed the talk button.
    #[serde(rename = "client.start")]
    Start {
        #[serde(default)]
        hello: Option<String>,
    },
    /// One chunk of PCM16-LE input audio, standard base64.
    #[serde(rename = "client.audio.append")]
    AudioAppend { audio: String },
    /// End of the current utterance.
    #[serde(rename = "client.audio.commit")]
    AudioCommit,
    /// Typed text instead of audio.
    #[serde(rename = "client.chat.text")]
    ChatText { content: String },
    /// Preempt the response in progress.
    #[serde(rename = "client.interrupt")]
    Interrupt,
    /// Orderly session close.
    #[serde(rename = "client.stop")]
    Stop,
}

/// Message to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "server.ready")]
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "outputAudioFormat")]
        output_audio_format: String,
    },
    #[serde(rename = "server.tts.audio")]
    TtsAudio {
        audio: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<i32>,
    },
    #[serde(rename = "server.text")]
    Text { role: &'static str, text: String },
    #[serde(rename = "server.event")]
    Event {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "server.error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "server.closed")]
    Closed { code: u16, reason: String },
}

impl ServerMsg {
    /// A bare error with no code or payload.
    pub fn error(kind: impl Into<String>) -> ServerMsg {
        ServerMsg::Error {
            error: kind.into(),
            code: None,
            message: None,
            payload: None,
        }
    }
}
