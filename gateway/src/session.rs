//! Per-session record and its serialization lane.
//!
//! All mutations of one session go through the single `tokio::sync::Mutex`
//! lane, which also makes the journal a single-writer per session. A second
//! mutex serializes the WS-attach handshake so concurrent attaches cannot
//! bring up two upstream connections.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use voicebox_doubao::{RealtimeClient, SessionParams};

use crate::messages::ServerMsg;

/// Close code sent to a browser socket displaced by a newer attach.
pub const CLOSE_REPLACED: u16 = 4001;
/// Close code for a WS attach without a session id.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code when the upstream cannot be brought up.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Normal close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    New,
    UpstreamConnecting,
    Ready,
    Interrupting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::UpstreamConnecting => "upstream_connecting",
            SessionState::Ready => "ready",
            SessionState::Interrupting => "interrupting",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Command for the browser writer task.
#[derive(Debug)]
pub enum Outbound {
    Msg(ServerMsg),
    Close { code: u16, reason: &'static str },
}

/// Handle to the browser socket currently attached to a session.
#[derive(Debug, Clone)]
pub struct BrowserHandle {
    pub tx: mpsc::Sender<Outbound>,
    /// Attach generation; a stale reader stops when it no longer matches.
    pub generation: u64,
}

/// Mutable session state, guarded by the lane.
#[derive(Default)]
pub struct SessionInner {
    pub upstream: Option<Arc<RealtimeClient>>,
    pub browser: Option<BrowserHandle>,
    pub state: SessionState,
    /// Whether the upstream completed its session-start exchange.
    pub started: bool,
    /// Terminal flag; once set every further operation is a no-op.
    pub closed: bool,
    next_generation: u64,
}

impl SessionInner {
    /// Registers a browser handle, returning the displaced one if any.
    pub fn attach_browser(&mut self, tx: mpsc::Sender<Outbound>) -> (u64, Option<BrowserHandle>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let previous = self.browser.replace(BrowserHandle { tx, generation });
        (generation, previous)
    }

    /// True while `generation` names the currently attached socket.
    pub fn is_current(&self, generation: u64) -> bool {
        self.browser
            .as_ref()
            .is_some_and(|b| b.generation == generation)
    }

    /// Sends to the attached browser, if any. Failures mean the writer task
    /// is gone; the reader side notices on its own.
    pub async fn send_browser(&self, msg: ServerMsg) {
        if let Some(browser) = &self.browser {
            let _ = browser.tx.send(Outbound::Msg(msg)).await;
        }
    }
}

/// One voice conversation: one browser connection, one upstream connection,
/// one id, one journal.
pub struct Session {
    id: String,
    params: SessionParams,
    attach_lock: Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: impl Into<String>, params: SessionParams) -> Arc<Session> {
        Arc::new(Session {
            id: id.into(),
            params,
            attach_lock: Mutex::new(()),
            inner: Mutex::new(SessionInner::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Acquires the session lane.
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// Serializes the WS-attach handshake.
    pub async fn attach_guard(&self) -> MutexGuard<'_, ()> {
        self.attach_lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_displaces_previous_browser() {
        let session = Session::new("s1", SessionParams::default());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let mut inner = session.lock().await;
        let (gen1, previous) = inner.attach_browser(tx1);
        assert!(previous.is_none());

        let (gen2, previous) = inner.attach_browser(tx2);
        let previous = previous.unwrap();
        assert_eq!(previous.generation, gen1);
        assert_ne!(gen1, gen2);
        assert!(inner.is_current(gen2));
        assert!(!inner.is_current(gen1));
        drop(inner);

        // The displaced handle is still usable for the 4001 close.
        previous
            .tx
            .send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced",
            })
            .await
            .unwrap();
        assert!(matches!(
            rx1.recv().await,
            Some(Outbound::Close { code: CLOSE_REPLACED, .. })
        ));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::New.as_str(), "new");
        assert_eq!(SessionState::UpstreamConnecting.as_str(), "upstream_connecting");
        assert_eq!(SessionState::Interrupting.to_string(), "interrupting");
    }
}
