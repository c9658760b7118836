//! Terminal sessions and their command history.
//!
//! Sessions are keyed by id and hold the most recent commands and results, newest last.
//! Used by the gateway so a reconnecting client can redraw its terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::gatekeeper::ExecutionResult;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// One executed line and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    pub result: ExecutionResult,
    pub timestamp: DateTime<Utc>,
}

/// A session: id, creation time and bounded history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub history: VecDeque<HistoryEntry>,
}

/// In-memory store for terminal sessions (create, get, record, clear, close).
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
    history_limit: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl SessionStore {
    /// Store keeping at most `history_limit` entries per session (minimum 1).
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            history_limit: history_limit.max(1),
        }
    }

    /// Create a new session with a generated id; returns the session id.
    pub async fn create(&self) -> SessionId {
        let id = format!("term-{}", uuid::Uuid::new_v4());
        let session = Session {
            id: id.clone(),
            created_at: Utc::now(),
            history: VecDeque::new(),
        };
        self.inner.write().await.insert(id.clone(), session);
        log::debug!("session {} opened", id);
        id
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Append an entry, dropping the oldest beyond the limit. Errors if the session is gone.
    pub async fn record(
        &self,
        id: &str,
        command: impl Into<String>,
        result: ExecutionResult,
    ) -> Result<(), String> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(id).ok_or_else(|| "session not found".to_string())?;
        session.history.push_back(HistoryEntry {
            command: command.into(),
            result,
            timestamp: Utc::now(),
        });
        while session.history.len() > self.history_limit {
            session.history.pop_front();
        }
        Ok(())
    }

    /// Forget a session's history (the `clear` pseudo-command).
    pub async fn clear(&self, id: &str) -> Result<(), String> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(id).ok_or_else(|| "session not found".to_string())?;
        session.history.clear();
        Ok(())
    }

    /// Remove a session; returns whether it existed.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.inner.write().await.remove(id).is_some();
        if removed {
            log::debug!("session {} closed", id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_record_and_get() {
        let store = SessionStore::default();
        let id = store.create().await;
        assert!(id.starts_with("term-"));
        store
            .record(&id, "whoami", ExecutionResult::success("me"))
            .await
            .expect("record");
        let session = store.get(&id).await.expect("session");
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].command, "whoami");
        assert_eq!(session.history[0].result.output, "me");
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let store = SessionStore::new(3);
        let id = store.create().await;
        for i in 0..5 {
            store
                .record(&id, format!("echo {}", i), ExecutionResult::success(i.to_string()))
                .await
                .expect("record");
        }
        let commands: Vec<String> = store
            .get(&id)
            .await
            .expect("session")
            .history
            .into_iter()
            .map(|e| e.command)
            .collect();
        assert_eq!(commands, vec!["echo 2", "echo 3", "echo 4"]);
    }

    #[tokio::test]
    async fn clear_and_close() {
        let store = SessionStore::default();
        let id = store.create().await;
        store
            .record(&id, "pwd", ExecutionResult::success("/"))
            .await
            .expect("record");
        store.clear(&id).await.expect("clear");
        assert!(store.get(&id).await.expect("session").history.is_empty());
        assert!(store.close(&id).await);
        assert!(!store.close(&id).await);
        assert!(store.record(&id, "pwd", ExecutionResult::success("/")).await.is_err());
        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn entry_serializes_timestamp_as_rfc3339() {
        let entry = HistoryEntry {
            command: "date".into(),
            result: ExecutionResult::success("now"),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&entry).expect("json");
        let ts = json["timestamp"].as_str().expect("string");
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert_eq!(json["result"]["succeeded"], true);
    }
}
