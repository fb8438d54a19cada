//! End-to-end relay tests: a real gateway bound to an ephemeral port, a
//! browser-side WebSocket client, and a scripted upstream that speaks just
//! enough of the dialogue handshake.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};

use voicebox_doubao::protocol::{encode, Flags, Frame, MessageType, Payload, Serialization};
use voicebox_gateway::config::Config;
use voicebox_gateway::{router, AppState};

/// Mock dialogue service. Answers start-connection with event 50 and
/// start-session with event 150; everything else is swallowed. With
/// `respond` off it accepts the socket and stays silent, which is how the
/// handshake-timeout scenario is staged.
async fn spawn_upstream(respond: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if !respond {
                        continue;
                    }
                    let WsMessage::Binary(data) = msg else { continue };
                    let Some(reply) = handshake_reply(&data) else {
                        continue;
                    };
                    if ws.send(WsMessage::Binary(reply.into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}

fn handshake_reply(data: &[u8]) -> Option<Vec<u8>> {
    // Client frames carry the event code right after the 4-byte header.
    if data.len() < 8 || data[1] & 0b0100 == 0 {
        return None;
    }
    let event = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let reply = match event {
        1 => 50,
        100 => 150,
        _ => return None,
    };

    let frame = Frame {
        msg_type: MessageType::FullServer,
        flags: Flags::WITH_EVENT,
        serialization: Serialization::Json,
        event: Some(reply),
        payload: Payload::Json(json!({})),
        ..Default::default()
    };
    Some(encode(&frame).unwrap())
}

/// Binds the gateway on an ephemeral port and returns its authority.
async fn spawn_gateway(state: AppState) -> String {
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn test_state(upstream_url: String) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.history_dir = dir.path().to_path_buf();
    config.upstream.base_url = upstream_url;
    config.upstream.handshake_timeout = Duration::from_secs(2);
    (dir, AppState::new(config))
}

/// Mints a session over the real HTTP path and returns its id.
async fn mint_session(state: &AppState) -> String {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let response = router(state.clone())
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/session")
                .body(axum::body::Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    body["sessionId"].as_str().unwrap().to_string()
}

type BrowserWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn attach_browser(gateway: &str, session_id: &str) -> BrowserWs {
    let url = format!("ws://{}/ws?sessionId={}", gateway, session_id);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn next_json(ws: &mut BrowserWs) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_close_code(ws: &mut BrowserWs) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(WsMessage::Close(frame))) => {
                return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection ended without close frame"),
        }
    }
}

async fn send_json(ws: &mut BrowserWs, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_ready_handshake_and_single_utterance() {
    let upstream = spawn_upstream(true).await;
    let (_dir, state) = test_state(upstream).await;
    let gateway = spawn_gateway(state.clone()).await;
    let session_id = mint_session(&state).await;

    let mut ws = attach_browser(&gateway, &session_id).await;

    // The first server frame announces readiness.
    let ready = next_json(&mut ws).await;
    assert_eq!(ready["type"], "server.ready");
    assert_eq!(ready["sessionId"], session_id.as_str());
    assert_eq!(ready["outputAudioFormat"], "pcm");

    send_json(&mut ws, json!({"type": "client.start"})).await;
    let chunk = BASE64.encode(vec![0u8; 640]);
    for _ in 0..3 {
        send_json(&mut ws, json!({"type": "client.audio.append", "audio": chunk})).await;
    }
    send_json(&mut ws, json!({"type": "client.audio.commit"})).await;
    send_json(&mut ws, json!({"type": "client.stop"})).await;

    assert_eq!(next_close_code(&mut ws).await, 1000);
    let registry = state.registry.clone();
    let sid = session_id.clone();
    wait_until(move || !registry.contains(&sid)).await;

    // The close path journals last; poll until the final event lands.
    let mut events = Vec::new();
    for _ in 0..200 {
        events = state.journal.events(&session_id).await;
        if events.iter().any(|e| e.event_type == "session_closed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "session_opened",
            "upstream_connected",
            "client_started",
            "input_audio_chunk",
            "input_audio_chunk",
            "input_audio_chunk",
            "input_audio_committed",
            "session_closed",
        ]
    );
    for event in events.iter().filter(|e| e.event_type == "input_audio_chunk") {
        assert_eq!(event.payload["bytes"], 640);
    }
}

#[tokio::test]
async fn test_missing_session_id_closes_1008() {
    let upstream = spawn_upstream(true).await;
    let (_dir, state) = test_state(upstream).await;
    let gateway = spawn_gateway(state).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws", gateway)).await.unwrap();
    assert_eq!(next_close_code(&mut ws).await, 1008);
}

#[tokio::test]
async fn test_second_attach_displaces_first_with_4001() {
    let upstream = spawn_upstream(true).await;
    let (_dir, state) = test_state(upstream).await;
    let gateway = spawn_gateway(state.clone()).await;
    let session_id = mint_session(&state).await;

    let mut first = attach_browser(&gateway, &session_id).await;
    assert_eq!(next_json(&mut first).await["type"], "server.ready");

    let mut second = attach_browser(&gateway, &session_id).await;
    assert_eq!(next_json(&mut second).await["type"], "server.ready");

    // The displaced socket gets exactly one 4001 close.
    assert_eq!(next_close_code(&mut first).await, 4001);

    // The second socket keeps working.
    send_json(&mut second, json!({"type": "client.start"})).await;
    send_json(&mut second, json!({"type": "not json at all"})).await;
    let err = next_json(&mut second).await;
    assert_eq!(err["type"], "server.error");
    assert_eq!(err["error"], "invalid_message");
}

#[tokio::test]
async fn test_interrupt_emits_450() {
    let upstream = spawn_upstream(true).await;
    let (_dir, state) = test_state(upstream).await;
    let gateway = spawn_gateway(state.clone()).await;
    let session_id = mint_session(&state).await;

    let mut ws = attach_browser(&gateway, &session_id).await;
    assert_eq!(next_json(&mut ws).await["type"], "server.ready");

    send_json(&mut ws, json!({"type": "client.interrupt"})).await;

    // The interrupt marker precedes anything from the restarted session.
    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "server.event");
    assert_eq!(event["event"], 450);
    assert_eq!(event["payload"]["source"], "client_interrupt");

    let mut seen = false;
    for _ in 0..200 {
        let events = state.journal.events(&session_id).await;
        if events.iter().any(|e| e.event_type == "session_interrupted") {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "session_interrupted never journaled");

    let events = state.journal.events(&session_id).await;
    let interrupted: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "session_interrupted")
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].payload["source"], "client");
}

#[tokio::test]
async fn test_upstream_handshake_timeout_tears_down() {
    let upstream = spawn_upstream(false).await;
    let (_dir, state) = test_state(upstream).await;
    {
        // Short timeout keeps the scenario fast.
        let mut config = (*state.config).clone();
        config.upstream.handshake_timeout = Duration::from_millis(300);
        let state = AppState {
            config: std::sync::Arc::new(config),
            registry: state.registry.clone(),
            journal: state.journal.clone(),
        };
        let gateway = spawn_gateway(state.clone()).await;
        let session_id = mint_session(&state).await;

        let mut ws = attach_browser(&gateway, &session_id).await;
        let err = next_json(&mut ws).await;
        assert_eq!(err["type"], "server.error");
        assert_eq!(err["error"], "upstream_connect_failed");
        assert_eq!(next_close_code(&mut ws).await, 1011);

        let registry = state.registry.clone();
        wait_until(move || !registry.contains(&session_id)).await;
    }
}
