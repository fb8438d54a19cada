//! Bidirectional relay between one browser WebSocket and one upstream
//! dialogue connection.
//!
//! Per session there are four tasks: the browser reader (the upgrade
//! handler itself), a writer task owning the browser sink, the upstream
//! read loop inside the client, and the upstream event pump. Everything
//! that mutates the session goes through its lane, which also keeps the
//! journal single-writer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use voicebox_doubao::protocol::{events, Frame, MessageType, Payload};
use voicebox_doubao::{RealtimeClient, UpstreamEvent};

use crate::config::SessionConfig;
use crate::messages::{ClientMsg, ServerMsg};
use crate::server::AppState;
use crate::session::{
    Outbound, Session, SessionInner, SessionState, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION, CLOSE_REPLACED,
};

/// Number of silent chunks sent by `client.audio.commit`. A heuristic the
/// upstream treats as trailing silence, not a protocol contract.
pub const TAIL_CHUNK_COUNT: usize = 12;
/// Size of each silent commit chunk: 100 ms of 16 kHz PCM16-LE.
pub const TAIL_CHUNK_BYTES: usize = 3200;

/// `GET /ws?sessionId=...` upgrade endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let session_id = query.get("sessionId").filter(|s| !s.is_empty()).cloned();

    ws.on_upgrade(move |socket| async move {
        match session_id {
            Some(id) => handle_socket(socket, id, state).await,
            None => {
                let mut socket = socket;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "missing sessionId".into(),
                    })))
                    .await;
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let (session, created) = state
        .registry
        .get_or_create(&session_id, state.config.session_params(&SessionConfig::default()));
    if created {
        journal(&state, &session_id, "session_opened", json!({"source": "ws"})).await;
    }

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(64);
    let writer = tokio::spawn(browser_writer(sink, rx));

    let Some(generation) = attach(&state, &session, tx).await else {
        let _ = writer.await;
        return;
    };
    info!(session_id = %session_id, generation, "browser attached");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if !process_text(&state, &session, generation, text.as_str()).await {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // A displaced reader must not tear the session down; only the socket
    // that still owns the record runs the close path.
    let still_current = { session.lock().await.is_current(generation) };
    if still_current {
        close_session(&state, &session).await;
    }
    let _ = writer.await;
}

/// Writer task: owns the browser sink, serializes messages, terminates on
/// the first close command or send failure.
async fn browser_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Msg(msg) => {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

/// WS-open handshake: register the socket (displacing any previous one with
/// code 4001), bring up the upstream if needed, emit `server.ready`.
/// Returns the attach generation, or `None` when the session is unusable.
async fn attach(
    state: &AppState,
    session: &Arc<Session>,
    tx: mpsc::Sender<Outbound>,
) -> Option<u64> {
    let _guard = session.attach_guard().await;

    let generation = {
        let mut inner = session.lock().await;
        if inner.closed {
            let _ = tx
                .send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "session closed",
                })
                .await;
            return None;
        }
        let (generation, previous) = inner.attach_browser(tx.clone());
        if let Some(previous) = previous {
            debug!(session_id = %session.id(), "displacing previous browser socket");
            let _ = previous
                .tx
                .send(Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "replaced by newer connection",
                })
                .await;
        }
        if inner.upstream.is_none() {
            inner.state = SessionState::UpstreamConnecting;
        }
        generation
    };

    let need_upstream = session.lock().await.upstream.is_none();
    if need_upstream {
        let (events_tx, events_rx) = mpsc::channel(256);
        match RealtimeClient::connect(
            state.config.upstream.clone(),
            session.id().to_string(),
            session.params().clone(),
            events_tx,
        )
        .await
        {
            Ok(client) => {
                let client = Arc::new(client);
                {
                    let mut inner = session.lock().await;
                    if inner.closed {
                        drop(inner);
                        client.close().await;
                        return None;
                    }
                    inner.upstream = Some(client.clone());
                    inner.started = true;
                    inner.state = SessionState::Ready;
                }
                journal(state, session.id(), "upstream_connected", json!({})).await;
                tokio::spawn(pump_upstream(state.clone(), session.clone(), events_rx));
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "upstream connect failed");
                let _ = tx
                    .send(Outbound::Msg(ServerMsg::error("upstream_connect_failed")))
                    .await;
                let _ = tx
                    .send(Outbound::Close {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "upstream connect failed",
                    })
                    .await;
                close_session(state, session).await;
                return None;
            }
        }
    } else {
        let mut inner = session.lock().await;
        if !inner.closed {
            inner.state = SessionState::Ready;
        }
    }

    let inner = session.lock().await;
    if !inner.is_current(generation) {
        return None;
    }
    inner
        .send_browser(ServerMsg::Ready {
            session_id: session.id().to_string(),
            output_audio_format: state.config.defaults.output_audio_format.clone(),
        })
        .await;
    Some(generation)
}

/// Parses one browser text frame and dispatches it. Returns false when the
/// reader should stop.
async fn process_text(
    state: &AppState,
    session: &Arc<Session>,
    generation: u64,
    text: &str,
) -> bool {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            send_to_current(session, generation, ServerMsg::error("invalid_json")).await;
            return true;
        }
    };
    let msg: ClientMsg = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(_) => {
            send_to_current(session, generation, ServerMsg::error("invalid_message")).await;
            return true;
        }
    };
    handle_client_msg(state, session, generation, msg).await
}

async fn send_to_current(session: &Session, generation: u64, msg: ServerMsg) {
    let inner = session.lock().await;
    if inner.is_current(generation) {
        inner.send_browser(msg).await;
    }
}

async fn handle_client_msg(
    state: &AppState,
    session: &Arc<Session>,
    generation: u64,
    msg: ClientMsg,
) -> bool {
    let mut inner = session.lock().await;
    if inner.closed || !inner.is_current(generation) {
        return false;
    }

    match msg {
        ClientMsg::Start { hello } => {
            journal(state, session.id(), "client_started", json!({})).await;
            if let Some(hello) = hello {
                if let Some(client) = inner.upstream.clone() {
                    if let Err(e) = client.send_hello(&hello).await {
                        drop(inner);
                        return fail_upstream(state, session, e).await;
                    }
                }
            }
        }
        ClientMsg::AudioAppend { audio } => {
            let Ok(bytes) = BASE64.decode(audio.as_bytes()) else {
                inner.send_browser(ServerMsg::error("invalid_message")).await;
                return true;
            };
            journal(
                state,
                session.id(),
                "input_audio_chunk",
                json!({"bytes": bytes.len()}),
            )
            .await;
            if let Some(client) = inner.upstream.clone() {
                if let Err(e) = client.send_audio_chunk(&bytes).await {
                    drop(inner);
                    return fail_upstream(state, session, e).await;
                }
            }
        }
        ClientMsg::AudioCommit => {
            if let Some(client) = inner.upstream.clone() {
                if let Err(e) = send_commit_tail(&client, TAIL_CHUNK_COUNT, TAIL_CHUNK_BYTES).await
                {
                    drop(inner);
                    return fail_upstream(state, session, e).await;
                }
            }
            journal(state, session.id(), "input_audio_committed", json!({})).await;
        }
        ClientMsg::ChatText { content } => {
            if let Some(client) = inner.upstream.clone() {
                if let Err(e) = client.send_chat_text(&content).await {
                    drop(inner);
                    return fail_upstream(state, session, e).await;
                }
            }
            journal(state, session.id(), "input_text", json!({"content": content})).await;
        }
        ClientMsg::Interrupt => {
            if let Err(e) = do_interrupt(state, session, &mut inner, InterruptSource::Client).await
            {
                drop(inner);
                return fail_upstream(state, session, e).await;
            }
        }
        ClientMsg::Stop => {
            drop(inner);
            close_session(state, session).await;
            return false;
        }
    }
    true
}

/// Sends the trailing-silence tail that marks end of input audio. The
/// chunk count and size are passed in so tests can shrink them.
pub(crate) async fn send_commit_tail(
    client: &RealtimeClient,
    chunks: usize,
    chunk_bytes: usize,
) -> Result<(), voicebox_doubao::Error> {
    let silence = vec![0u8; chunk_bytes];
    for _ in 0..chunks {
        client.send_audio_chunk(&silence).await?;
    }
    Ok(())
}

/// Where an interrupt came from; controls the journal and event payloads.
#[derive(Debug, Clone, Copy)]
pub enum InterruptSource {
    Client,
    Api,
}

impl InterruptSource {
    fn journal_source(&self) -> &'static str {
        match self {
            InterruptSource::Client => "client",
            InterruptSource::Api => "api",
        }
    }

    fn payload_source(&self) -> &'static str {
        match self {
            InterruptSource::Client => "client_interrupt",
            InterruptSource::Api => "interrupt_api",
        }
    }
}

/// Interrupts a session from outside the reader task (the HTTP endpoint).
/// Returns false when there is no upstream to interrupt.
pub async fn interrupt_session(
    state: &AppState,
    session: &Arc<Session>,
    source: InterruptSource,
) -> Result<bool, voicebox_doubao::Error> {
    let mut inner = session.lock().await;
    if inner.closed {
        return Ok(false);
    }
    do_interrupt(state, session, &mut inner, source).await
}

/// Restarts the upstream session and tells the browser. Runs under the lane
/// so the 450 event reaches the browser before any new-turn audio, which
/// the pump cannot forward until the lane is released.
async fn do_interrupt(
    state: &AppState,
    session: &Session,
    inner: &mut SessionInner,
    source: InterruptSource,
) -> Result<bool, voicebox_doubao::Error> {
    let Some(client) = inner.upstream.clone() else {
        return Ok(false);
    };

    inner.state = SessionState::Interrupting;
    client.restart_session().await?;

    journal(
        state,
        session.id(),
        "session_interrupted",
        json!({"source": source.journal_source()}),
    )
    .await;
    inner
        .send_browser(ServerMsg::Event {
            event: Some(events::SESSION_INTERRUPTED),
            payload: Some(json!({"source": source.payload_source()})),
        })
        .await;
    inner.state = SessionState::Ready;
    Ok(true)
}

/// Consumes upstream events for one connection and translates them for the
/// browser. Ends when the client is dropped or the connection dies.
async fn pump_upstream(
    state: AppState,
    session: Arc<Session>,
    mut events: mpsc::Receiver<UpstreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            UpstreamEvent::Message(frame) => {
                handle_upstream_frame(&state, &session, frame).await;
            }
            UpstreamEvent::Closed { code, reason } => {
                debug!(session_id = %session.id(), code, "upstream closed");
                {
                    let inner = session.lock().await;
                    if !inner.closed {
                        inner.send_browser(ServerMsg::Closed { code, reason }).await;
                    }
                }
                close_session(&state, &session).await;
                return;
            }
            UpstreamEvent::Error(e) => {
                warn!(session_id = %session.id(), error = %e, "upstream transport error");
                {
                    let inner = session.lock().await;
                    if !inner.closed {
                        inner
                            .send_browser(ServerMsg::Error {
                                error: "upstream_error".to_string(),
                                code: None,
                                message: Some(e.to_string()),
                                payload: None,
                            })
                            .await;
                    }
                }
                close_session(&state, &session).await;
                return;
            }
        }
    }
}

async fn handle_upstream_frame(state: &AppState, session: &Arc<Session>, frame: Frame) {
    let inner = session.lock().await;
    if inner.closed {
        return;
    }

    match frame.msg_type {
        MessageType::ServerAck => {
            if let Some(audio) = frame.payload.as_bytes() {
                inner
                    .send_browser(ServerMsg::TtsAudio {
                        audio: BASE64.encode(audio),
                        event: frame.event,
                    })
                    .await;
                journal(
                    state,
                    session.id(),
                    "assistant_audio_chunk",
                    json!({"bytes": audio.len(), "event": frame.event}),
                )
                .await;
            }
        }
        MessageType::Error => {
            let raw = frame.payload.display_text();
            inner
                .send_browser(ServerMsg::Error {
                    error: "upstream_server_error".to_string(),
                    code: frame.error_code,
                    message: Some(map_upstream_error(frame.error_code, &raw)),
                    payload: payload_value(&frame.payload),
                })
                .await;
            journal(
                state,
                session.id(),
                "error",
                json!({"code": frame.error_code, "payload": raw}),
            )
            .await;
        }
        _ => {
            inner
                .send_browser(ServerMsg::Event {
                    event: frame.event,
                    payload: payload_value(&frame.payload),
                })
                .await;
            if let Some(payload) = frame.payload.as_json() {
                if let Some(text) = extract_text(payload) {
                    inner
                        .send_browser(ServerMsg::Text {
                            role: infer_role(frame.event, payload),
                            text,
                        })
                        .await;
                }
            }
        }
    }
}

/// Orderly close. Idempotent: the first caller flips the terminal flag and
/// everything else is a no-op.
pub async fn close_session(state: &AppState, session: &Arc<Session>) {
    let (browser, upstream) = {
        let mut inner = session.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.state = SessionState::Closed;
        (inner.browser.take(), inner.upstream.take())
    };

    if let Some(browser) = browser {
        let _ = browser
            .tx
            .send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "",
            })
            .await;
    }
    if let Some(upstream) = upstream {
        upstream.close().await;
    }

    state.registry.remove(session.id());
    journal(state, session.id(), "session_closed", json!({})).await;
    info!(session_id = %session.id(), "session closed");
}

/// An upstream operation failed after the client's own retry: surface it
/// and tear the session down.
async fn fail_upstream(
    state: &AppState,
    session: &Arc<Session>,
    error: voicebox_doubao::Error,
) -> bool {
    warn!(session_id = %session.id(), error = %error, "upstream operation failed");
    {
        let inner = session.lock().await;
        if !inner.closed {
            inner
                .send_browser(ServerMsg::Error {
                    error: "upstream_error".to_string(),
                    code: None,
                    message: Some(error.to_string()),
                    payload: None,
                })
                .await;
        }
    }
    close_session(state, session).await;
    false
}

/// Journal append that never fails the relay.
pub(crate) async fn journal(
    state: &AppState,
    session_id: &str,
    event_type: &str,
    payload: serde_json::Value,
) {
    if let Err(e) = state.journal.append(session_id, event_type, payload).await {
        warn!(session_id = %session_id, event = %event_type, error = %e, "journal append failed");
    }
}

// ================== Translation rules ==================

const TEXT_KEYS: [&str; 7] = [
    "content",
    "text",
    "sentence",
    "result",
    "display_text",
    "answer",
    "output_text",
];

/// Pulls displayable text out of an upstream payload, if any.
fn extract_text(payload: &serde_json::Value) -> Option<String> {
    let obj = payload.as_object()?;
    for key in TEXT_KEYS {
        if let Some(s) = obj.get(key).and_then(serde_json::Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Infers the speaker role for a `server.text` message.
fn infer_role(event: Option<i32>, payload: &serde_json::Value) -> &'static str {
    match event {
        Some(550 | 559 | 350 | 351 | 352 | 359) => "assistant",
        Some(451 | 459) => "user",
        Some(e) if e >= 450 => "system",
        _ => {
            if payload.get("tts_type").is_some() {
                return "assistant";
            }
            for key in ["from", "role"] {
                match payload.get(key).and_then(serde_json::Value::as_str) {
                    Some("user") => return "user",
                    Some("system") => return "system",
                    _ => {}
                }
            }
            "assistant"
        }
    }
}

/// Maps an upstream error string to a user-facing message.
fn map_upstream_error(code: Option<u32>, raw: &str) -> String {
    if raw.contains("session number limit exceeded") {
        return "The assistant is at capacity right now, please try again in a moment."
            .to_string();
    }
    if raw.contains("DialogAudioIdleTimeoutError") || raw.contains("AudioASRIdleTimeoutError") {
        return "I didn't hear anything for a while. Press the button and talk to me again."
            .to_string();
    }
    match code {
        Some(code) => format!("Upstream error {}: {}", code, raw),
        None => raw.to_string(),
    }
}

fn payload_value(payload: &Payload) -> Option<serde_json::Value> {
    match payload {
        Payload::Json(v) => Some(v.clone()),
        Payload::Text(s) if !s.is_empty() => Some(serde_json::Value::String(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_role_enumerated_events() {
        let empty = json!({});
        for event in [550, 559, 350, 351, 352, 359] {
            assert_eq!(infer_role(Some(event), &empty), "assistant");
        }
        for event in [451, 459] {
            assert_eq!(infer_role(Some(event), &empty), "user");
        }
        // Other codes at or above 450 are system, including 450 itself.
        assert_eq!(infer_role(Some(450), &empty), "system");
        assert_eq!(infer_role(Some(700), &empty), "system");
    }

    #[test]
    fn test_infer_role_payload_fallbacks() {
        assert_eq!(infer_role(None, &json!({"tts_type": "chat"})), "assistant");
        assert_eq!(infer_role(Some(100), &json!({"from": "user"})), "user");
        assert_eq!(infer_role(None, &json!({"role": "system"})), "system");
        assert_eq!(infer_role(None, &json!({"role": "bot"})), "assistant");
        assert_eq!(infer_role(None, &json!({})), "assistant");
    }

    #[test]
    fn test_extract_text_key_priority_and_trim() {
        assert_eq!(
            extract_text(&json!({"text": "  hi  ", "content": ""})),
            Some("hi".to_string())
        );
        assert_eq!(
            extract_text(&json!({"content": "first", "text": "second"})),
            Some("first".to_string())
        );
        assert_eq!(extract_text(&json!({"output_text": "tail key"})), Some("tail key".to_string()));
        assert_eq!(extract_text(&json!({"content": 42})), None);
        assert_eq!(extract_text(&json!({"content": "   "})), None);
        assert_eq!(extract_text(&json!("bare string")), None);
    }

    #[test]
    fn test_map_upstream_error() {
        let quota = map_upstream_error(Some(1), "quota: session number limit exceeded");
        assert!(quota.contains("capacity"));

        let idle = map_upstream_error(None, "DialogAudioIdleTimeoutError: idle");
        assert!(idle.contains("Press the button"));
        let idle = map_upstream_error(None, "AudioASRIdleTimeoutError");
        assert!(idle.contains("Press the button"));

        assert_eq!(
            map_upstream_error(Some(55002001), "boom"),
            "Upstream error 55002001: boom"
        );
        assert_eq!(map_upstream_error(None, "boom"), "boom");
    }

    #[test]
    fn test_payload_value_shapes() {
        assert_eq!(
            payload_value(&Payload::Json(json!({"k": 1}))),
            Some(json!({"k": 1}))
        );
        assert_eq!(
            payload_value(&Payload::Text("hey".to_string())),
            Some(json!("hey"))
        );
        assert_eq!(payload_value(&Payload::Text(String::new())), None);
        assert_eq!(payload_value(&Payload::Bytes(vec![1, 2])), None);
    }
}
