//! Realtime speech-to-speech dialogue client.
//!
//! One `RealtimeClient` owns one WebSocket to the dialogue service. The
//! connect protocol runs start-connection / start-session handshakes, then a
//! background read loop parses incoming frames and forwards them as
//! [`UpstreamEvent`]s to the channel supplied by the owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{self, events, Frame, MessageType};

/// Default timeout for the connection-started and session-started waits.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Default realtime dialogue endpoint.
pub const DEFAULT_BASE_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection parameters for the dialogue service.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL of the realtime dialogue endpoint.
    pub base_url: String,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    /// Timeout for each handshake wait (events 50 and 150).
    pub handshake_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: String::new(),
            app_key: String::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Resolved per-session parameters carried in the start-session body.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// TTS speaker voice.
    pub speaker: String,
    /// Bot display name.
    pub bot_name: String,
    /// System role prompt.
    pub system_role: String,
    /// Speaking style.
    pub speaking_style: String,
    /// Location hint.
    pub city: Option<String>,
    /// Upstream receive timeout in seconds (10-120).
    pub recv_timeout: u32,
    /// Input modality: "audio", "text" or "audio_file".
    pub input_mod: String,
    /// Output audio format announced to the service.
    pub output_format: String,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            speaker: String::new(),
            bot_name: String::new(),
            system_role: String::new(),
            speaking_style: String::new(),
            city: None,
            recv_timeout: 60,
            input_mod: "audio".to_string(),
            output_format: "pcm".to_string(),
            output_sample_rate: 24000,
        }
    }
}

/// Observable signal from the upstream connection.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// One parsed frame.
    Message(Frame),
    /// The socket closed.
    Closed { code: u16, reason: String },
    /// Failure while reading the socket.
    Error(Error),
}

struct Conn {
    write: WsWriter,
    _read_task: tokio::task::JoinHandle<()>,
}

/// Client for one realtime dialogue session.
pub struct RealtimeClient {
    cfg: UpstreamConfig,
    session_id: String,
    params: SessionParams,
    events_tx: mpsc::Sender<UpstreamEvent>,
    conn: Mutex<Option<Conn>>,
    /// Pending waiter fired by the read loop on session-started (event 150).
    session_started: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    closed: AtomicBool,
}

impl RealtimeClient {
    /// Dials the dialogue service and runs the full connect protocol:
    /// start-connection, wait for event 50, start-session, wait for event
    /// 150. Parsed frames are forwarded to `events_tx` afterwards.
    pub async fn connect(
        cfg: UpstreamConfig,
        session_id: String,
        params: SessionParams,
        events_tx: mpsc::Sender<UpstreamEvent>,
    ) -> Result<Self> {
        let client = Self {
            cfg,
            session_id,
            params,
            events_tx,
            conn: Mutex::new(None),
            session_started: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        };

        let conn = client.dial().await?;
        *client.conn.lock().await = Some(conn);
        Ok(client)
    }

    /// Returns the session ID.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sends one chunk of input audio (event 200). No-op on empty input.
    pub async fn send_audio_chunk(&self, audio: &[u8]) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        self.send_frame(Frame::audio_chunk(&self.session_id, audio.to_vec()))
            .await
    }

    /// Marks end-of-input-audio with the tail frame.
    pub async fn send_audio_commit(&self) -> Result<()> {
        self.send_frame(Frame::audio_tail()).await
    }

    /// Sends a text query (event 501).
    pub async fn send_chat_text(&self, content: &str) -> Result<()> {
        self.send_frame(Frame::client_event(
            events::CHAT_TEXT_QUERY,
            Some(&self.session_id),
            json!({ "content": content }),
        ))
        .await
    }

    /// Asks the bot to speak a greeting (event 300).
    pub async fn send_hello(&self, content: &str) -> Result<()> {
        self.send_frame(Frame::client_event(
            events::SAY_HELLO,
            Some(&self.session_id),
            json!({ "content": content }),
        ))
        .await
    }

    /// Interrupts the current response: finish-session followed by a fresh
    /// start-session handshake, waiting for event 150.
    pub async fn restart_session(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *self.session_started.lock().await = Some(tx);

        self.send_frame(Frame::client_event(
            events::FINISH_SESSION,
            Some(&self.session_id),
            json!({}),
        ))
        .await?;
        self.send_frame(Frame::client_event(
            events::START_SESSION,
            Some(&self.session_id),
            start_session_payload(&self.params),
        ))
        .await?;

        match tokio::time::timeout(self.cfg.handshake_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::HandshakeTimeout(events::SESSION_STARTED)),
        }
    }

    /// Closes the connection: best-effort finish-session and
    /// finish-connection, then the socket. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut conn = self.conn.lock().await;
        if let Some(mut c) = conn.take() {
            let goodbye = [
                Frame::client_event(events::FINISH_SESSION, Some(&self.session_id), json!({})),
                Frame::client_event(events::FINISH_CONNECTION, None, json!({})),
            ];
            for frame in goodbye {
                if let Ok(data) = protocol::encode(&frame) {
                    let _ = c.write.send(WsMessage::Binary(data.into())).await;
                }
            }
            let _ = c.write.close().await;
        }
    }

    /// Encodes and writes one frame. A send with no live socket transparently
    /// re-dials once; a second failure propagates.
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let data = protocol::encode(&frame)?;
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.dial().await?);
        }
        let Some(c) = conn.as_mut() else {
            return Err(Error::Closed);
        };
        if let Err(e) = c.write.send(WsMessage::Binary(data.into())).await {
            warn!(error = %e, "upstream send failed, dropping connection");
            conn.take();
            return Err(e.into());
        }
        Ok(())
    }

    async fn dial(&self) -> Result<Conn> {
        let uri: http::Uri = self
            .cfg
            .base_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid upstream url: {}", e)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::Config("upstream url missing host".to_string()))?
            .to_string();

        // Fresh connect id per connection.
        let connect_id = Uuid::new_v4().to_string();

        let request = http::Request::builder()
            .uri(self.cfg.base_url.as_str())
            .header("Host", host)
            .header("X-Api-App-ID", &self.cfg.app_id)
            .header("X-Api-Access-Key", &self.cfg.access_key)
            .header("X-Api-Resource-Id", &self.cfg.resource_id)
            .header("X-Api-App-Key", &self.cfg.app_key)
            .header("X-Api-Connect-Id", &connect_id)
            .body(())
            .map_err(|e| Error::Config(format!("build request: {}", e)))?;

        debug!(connect_id = %connect_id, session_id = %self.session_id, "dialing upstream");
        let (ws, _response) = connect_async(request).await?;
        let (mut write, mut read) = ws.split();

        send_on(&mut write, Frame::client_event(events::START_CONNECTION, None, json!({}))).await?;
        wait_for_event(&mut read, events::CONNECTION_STARTED, self.cfg.handshake_timeout).await?;

        send_on(
            &mut write,
            Frame::client_event(
                events::START_SESSION,
                Some(&self.session_id),
                start_session_payload(&self.params),
            ),
        )
        .await?;
        wait_for_event(&mut read, events::SESSION_STARTED, self.cfg.handshake_timeout).await?;

        // A completed handshake satisfies any pending restart waiter.
        if let Some(tx) = self.session_started.lock().await.take() {
            let _ = tx.send(());
        }

        let read_task = tokio::spawn(read_loop(
            read,
            self.events_tx.clone(),
            self.session_started.clone(),
        ));

        Ok(Conn {
            write,
            _read_task: read_task,
        })
    }
}

/// Builds the start-session body. Fields the browser omitted have already
/// been filled from operator defaults by the caller.
fn start_session_payload(p: &SessionParams) -> serde_json::Value {
    let mut dialog = json!({
        "bot_name": p.bot_name,
        "system_role": p.system_role,
        "speaking_style": p.speaking_style,
        "extra": {
            "strict_audit": false,
            "recv_timeout": p.recv_timeout,
            "input_mod": p.input_mod,
        },
    });
    if let Some(city) = &p.city {
        dialog["location"] = json!({ "city": city });
    }

    json!({
        "asr": {
            "extra": { "end_smooth_window_ms": 1500 },
        },
        "tts": {
            "speaker": p.speaker,
            "audio_config": {
                "channel": 1,
                "format": p.output_format,
                "sample_rate": p.output_sample_rate,
            },
        },
        "dialog": dialog,
    })
}

async fn send_on(write: &mut WsWriter, frame: Frame) -> Result<()> {
    let data = protocol::encode(&frame)?;
    write.send(WsMessage::Binary(data.into())).await?;
    Ok(())
}

/// Reads frames until the wanted event arrives or the deadline passes.
async fn wait_for_event(read: &mut WsReader, event: i32, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let next = tokio::time::timeout(remaining, read.next())
            .await
            .map_err(|_| Error::HandshakeTimeout(event))?;

        match next {
            Some(Ok(WsMessage::Binary(data))) => {
                let Some(frame) = protocol::decode(&data) else {
                    continue;
                };
                if frame.msg_type == MessageType::Error {
                    return Err(Error::Upstream {
                        code: frame.error_code.unwrap_or(0),
                        message: frame.payload.display_text(),
                    });
                }
                match frame.event {
                    Some(e) if e == event => return Ok(()),
                    Some(events::CONNECTION_FAILED | events::SESSION_FAILED) => {
                        return Err(Error::Upstream {
                            code: 0,
                            message: frame.payload.display_text(),
                        });
                    }
                    _ => continue,
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(Error::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn read_loop(
    mut read: WsReader,
    events_tx: mpsc::Sender<UpstreamEvent>,
    session_started: Arc<Mutex<Option<oneshot::Sender<()>>>>,
) {
    while let Some(next) = read.next().await {
        match next {
            Ok(WsMessage::Binary(data)) => {
                // Unusable frames are skipped, not fatal.
                let Some(frame) = protocol::decode(&data) else {
                    continue;
                };
                if frame.event == Some(events::SESSION_STARTED) {
                    if let Some(tx) = session_started.lock().await.take() {
                        let _ = tx.send(());
                    }
                }
                if events_tx.send(UpstreamEvent::Message(frame)).await.is_err() {
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(f) => (u16::from(f.code), f.reason.as_str().to_string()),
                    None => (1005, String::new()),
                };
                let _ = events_tx.send(UpstreamEvent::Closed { code, reason }).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events_tx.send(UpstreamEvent::Error(e.into())).await;
                return;
            }
        }
    }
    let _ = events_tx
        .send(UpstreamEvent::Closed {
            code: 1006,
            reason: String::new(),
        })
        .await;
}
