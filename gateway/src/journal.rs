//! Append-only per-session event journal.
//!
//! Two files per session under the configured base directory:
//! - `<id>.jsonl` — newline-delimited events, append-only.
//! - `<id>.meta.json` — overwrite-in-place summary.
//!
//! Writes are best-effort for callers: the relay logs failures and carries
//! on. Readers tolerate partial or malformed lines by skipping them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Number of recent turns the derived history keeps.
pub const HISTORY_TURNS: usize = 12;

const TURN_COMPLETED: &str = "turn_completed";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One journaled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Sidecar summary for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: u64,
    pub errors: u64,
}

/// Role of a derived conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of the derived conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
}

/// Per-session event journal rooted at one base directory.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
    enabled: bool,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Appends one event and refreshes the sidecar meta. No-op when the
    /// journal is disabled.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), JournalError> {
        if !self.enabled || !safe_id(session_id) {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).await?;

        let event = JournalEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;

        self.update_meta(session_id, &event).await
    }

    async fn update_meta(
        &self,
        session_id: &str,
        event: &JournalEvent,
    ) -> Result<(), JournalError> {
        let path = self.meta_path(session_id);

        let mut meta = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| SessionMeta {
                session_id: session_id.to_string(),
                created_at: event.timestamp,
                updated_at: event.timestamp,
                turns: 0,
                errors: 0,
            }),
            Err(_) => SessionMeta {
                session_id: session_id.to_string(),
                created_at: event.timestamp,
                updated_at: event.timestamp,
                turns: 0,
                errors: 0,
            },
        };

        meta.updated_at = event.timestamp;
        if event.event_type == TURN_COMPLETED {
            meta.turns += 1;
        }
        if event.event_type.contains("error") {
            meta.errors += 1;
        }

        fs::write(&path, serde_json::to_vec_pretty(&meta)?).await?;
        Ok(())
    }

    /// Lists session summaries, newest `updatedAt` first. Unreadable or
    /// unparsable sidecars are skipped.
    pub async fn list(&self) -> Vec<SessionMeta> {
        if !self.enabled {
            return Vec::new();
        }

        let mut out = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".meta.json") {
                continue;
            }
            if let Ok(bytes) = fs::read(entry.path()).await {
                if let Ok(meta) = serde_json::from_slice::<SessionMeta>(&bytes) {
                    out.push(meta);
                }
            }
        }

        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Reads all events for one session. Blank and malformed lines are
    /// skipped; a missing file yields an empty list.
    pub async fn events(&self, session_id: &str) -> Vec<JournalEvent> {
        if !self.enabled || !safe_id(session_id) {
            return Vec::new();
        }

        let Ok(text) = fs::read_to_string(self.events_path(session_id)).await else {
            return Vec::new();
        };

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Derives recent conversation history from `turn_completed` events.
    /// The realtime relay never appends that type; this feeds the legacy
    /// single-turn pipeline only.
    pub async fn history(&self, session_id: &str, limit: usize) -> Vec<ConversationMessage> {
        let events = self.events(session_id).await;
        let turns: Vec<&JournalEvent> = events
            .iter()
            .filter(|e| e.event_type == TURN_COMPLETED)
            .collect();

        let start = turns.len().saturating_sub(limit);
        let mut out = Vec::new();
        for event in &turns[start..] {
            if let Some(text) = non_empty_str(&event.payload, "userText") {
                out.push(ConversationMessage {
                    role: Role::User,
                    text: text.to_string(),
                });
            }
            if let Some(text) = non_empty_str(&event.payload, "assistantText") {
                out.push(ConversationMessage {
                    role: Role::Assistant,
                    text: text.to_string(),
                });
            }
        }
        out
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", session_id))
    }
}

/// Session ids come straight from URLs; anything that could escape the
/// journal directory is treated as unknown.
fn safe_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}

fn non_empty_str<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), true);
        (dir, journal)
    }

    #[tokio::test]
    async fn test_fresh_session_has_no_events() {
        let (_dir, journal) = temp_journal();
        assert!(journal.events("nope").await.is_empty());
        assert!(journal.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_meta_counts_turns_and_errors() {
        let (_dir, journal) = temp_journal();

        for i in 0..3 {
            journal
                .append("s1", "turn_completed", json!({"userText": format!("q{}", i)}))
                .await
                .unwrap();
        }
        journal.append("s1", "upstream_error", json!({})).await.unwrap();
        journal.append("s1", "error", json!({})).await.unwrap();
        journal.append("s1", "session_closed", json!({})).await.unwrap();

        let metas = journal.list().await;
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].session_id, "s1");
        assert_eq!(metas[0].turns, 3);
        assert_eq!(metas[0].errors, 2);
        assert!(metas[0].updated_at >= metas[0].created_at);

        assert_eq!(journal.events("s1").await.len(), 6);
    }

    #[tokio::test]
    async fn test_list_sorted_by_updated_at_desc() {
        let (_dir, journal) = temp_journal();

        journal.append("older", "session_opened", json!({})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        journal.append("newer", "session_opened", json!({})).await.unwrap();

        let metas = journal.list().await;
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].session_id, "newer");
        assert_eq!(metas[1].session_id, "older");
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (dir, journal) = temp_journal();

        journal.append("s1", "session_opened", json!({})).await.unwrap();

        // Simulate a torn write: the readers must skip it.
        let path = dir.path().join("s1.jsonl");
        let mut existing = std::fs::read_to_string(&path).unwrap();
        existing.push_str("{\"truncated\": ");
        std::fs::write(&path, existing).unwrap();

        journal.append("s1", "session_closed", json!({})).await.unwrap();

        let events = journal.events("s1").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "session_opened");
        assert_eq!(events[1].event_type, "session_closed");
    }

    #[tokio::test]
    async fn test_history_skips_empty_entries() {
        let (_dir, journal) = temp_journal();

        journal
            .append("s1", "turn_completed", json!({"userText": "hi", "assistantText": "hello"}))
            .await
            .unwrap();
        journal
            .append("s1", "turn_completed", json!({"userText": "", "assistantText": "only me"}))
            .await
            .unwrap();
        journal
            .append("s1", "input_text", json!({"userText": "not a turn"}))
            .await
            .unwrap();

        let history = journal.history("s1", HISTORY_TURNS).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[2].text, "only me");
        assert!(history.iter().all(|m| !m.text.is_empty()));
    }

    #[tokio::test]
    async fn test_history_limit_keeps_last_n() {
        let (_dir, journal) = temp_journal();

        for i in 0..5 {
            journal
                .append("s1", "turn_completed", json!({"userText": format!("q{}", i)}))
                .await
                .unwrap();
        }

        let history = journal.history("s1", 2).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "q3");
        assert_eq!(history[1].text, "q4");
    }

    #[tokio::test]
    async fn test_disabled_journal_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), false);

        journal.append("s1", "session_opened", json!({})).await.unwrap();
        journal.append("s1", "turn_completed", json!({})).await.unwrap();

        assert!(journal.list().await.is_empty());
        assert!(journal.events("s1").await.is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_path_escaping_ids_are_ignored() {
        let (_dir, journal) = temp_journal();
        journal.append("../evil", "session_opened", json!({})).await.unwrap();
        assert!(journal.events("../evil").await.is_empty());
        assert!(journal.list().await.is_empty());
    }
}
