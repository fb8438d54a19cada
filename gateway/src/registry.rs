//! Process-wide mapping of session id to live session record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use voicebox_doubao::SessionParams;

use crate::session::Session;

/// Registry of live sessions. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Inserts a freshly minted session.
    pub fn insert(&self, session: Arc<Session>) {
        let mut map = self.inner.lock().expect("lock poisoned");
        map.insert(session.id().to_string(), session);
    }

    /// Looks up a session, creating one for ids minted out-of-band or
    /// unknown. Returns whether the record was created.
    pub fn get_or_create(&self, id: &str, params: SessionParams) -> (Arc<Session>, bool) {
        let mut map = self.inner.lock().expect("lock poisoned");
        if let Some(session) = map.get(id) {
            return (session.clone(), false);
        }
        let session = Session::new(id, params);
        map.insert(id.to_string(), session.clone());
        debug!(session_id = %id, "created session on demand");
        (session, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().expect("lock poisoned").get(id).cloned()
    }

    /// Removes a record. Called only from the serialized close path, so
    /// removal happens at most once per session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().expect("lock poisoned").remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().expect("lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
