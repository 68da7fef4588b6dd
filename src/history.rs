use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Comments,
    Conversation,
}

impl HistoryKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            HistoryKind::Comments => "comments",
            HistoryKind::Conversation => "conversation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedComment {
    pub id: String,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub page: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HistoryCache {
    connection: Arc<Mutex<Connection>>,
    max_entries: usize,
}

impl HistoryCache {
    pub fn new(connection: Arc<Mutex<Connection>>, max_entries: usize) -> Self {
        Self {
            connection,
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn save<T: Serialize>(
        &self,
        kind: HistoryKind,
        document_id: &str,
        entries: &[T],
    ) -> AppResult<usize> {
        let document_id = normalize_document_id(document_id)?;
        let start = entries.len().saturating_sub(self.max_entries);
        let kept = &entries[start..];
        let payload = serde_json::to_string(kept)?;
        self.connection.lock().execute(
            "INSERT INTO history_cache (kind, document_id, payload, entry_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(kind, document_id) DO UPDATE SET
                payload = excluded.payload,
                entry_count = excluded.entry_count,
                updated_at = excluded.updated_at",
            params![
                kind.as_tag(),
                document_id,
                payload,
                kept.len() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        if start > 0 {
            debug!(
                target: "history_cache",
                kind = kind.as_tag(),
                dropped = start,
                "truncated history to most recent entries"
            );
        }
        Ok(kept.len())
    }

    pub fn load<T: DeserializeOwned>(
        &self,
        kind: HistoryKind,
        document_id: &str,
    ) -> AppResult<Vec<T>> {
        let document_id = normalize_document_id(document_id)?;
        let payload: Option<String> = self
            .connection
            .lock()
            .query_row(
                "SELECT payload FROM history_cache WHERE kind = ?1 AND document_id = ?2",
                params![kind.as_tag(), document_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(payload) => match serde_json::from_str::<Vec<T>>(&payload) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    warn!(
                        target: "history_cache",
                        kind = kind.as_tag(),
                        error = ?err,
                        "discarding unreadable cache entry"
                    );
                    self.remove(kind, document_id)?;
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    pub fn remove(&self, kind: HistoryKind, document_id: &str) -> AppResult<bool> {
        let document_id = normalize_document_id(document_id)?;
        let removed = self.connection.lock().execute(
            "DELETE FROM history_cache WHERE kind = ?1 AND document_id = ?2",
            params![kind.as_tag(), document_id],
        )?;
        Ok(removed > 0)
    }

    pub fn documents(&self, kind: HistoryKind) -> AppResult<Vec<String>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(
            "SELECT document_id FROM history_cache WHERE kind = ?1
            ORDER BY updated_at DESC, document_id ASC",
        )?;
        let rows = stmt
            .query_map([kind.as_tag()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn normalize_document_id(document_id: &str) -> AppResult<&str> {
    let trimmed = document_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::Config("document id cannot be empty".into()));
    }
    Ok(trimmed)
}
