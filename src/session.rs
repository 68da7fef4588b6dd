use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::errors::AppResult;
use crate::provider::Provider;

const STATE_TOKEN_BYTES: usize = 32;

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<Option<String>>;
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

#[derive(Clone)]
struct SessionEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                debug!(target: "session_store", key, "dropped expired session entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> AppResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), SessionEntry { value, expires_at });
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<Option<String>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value))
    }
}

#[derive(Debug, Clone)]
pub struct PendingState {
    pub provider: Provider,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub state: Option<String>,
    pub provider: Option<String>,
}

#[derive(Clone)]
pub struct OAuthStateStore {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new(store: Arc<dyn SessionStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64),
        }
    }

    pub fn issue(&self, provider: Provider) -> AppResult<PendingState> {
        let state = random_state_token();
        let expires_at = Utc::now() + self.ttl;
        self.store
            .set(&provider.state_key(), state.clone(), expires_at)?;
        self.store.set(
            &provider.provider_key(),
            provider.as_slug().to_string(),
            expires_at,
        )?;
        debug!(
            target: "oauth_state",
            provider = provider.as_slug(),
            %expires_at,
            "issued oauth state token"
        );
        Ok(PendingState {
            provider,
            state,
            expires_at,
        })
    }

    pub fn read(&self, provider: Provider) -> AppResult<StoredState> {
        Ok(StoredState {
            state: self.store.get(&provider.state_key())?,
            provider: self.store.get(&provider.provider_key())?,
        })
    }

    // Removal is the only way to obtain the stored values for a callback, so
    // concurrent callbacks for one provider see the token at most once.
    pub fn consume(&self, provider: Provider) -> AppResult<StoredState> {
        let state = self.store.remove(&provider.state_key())?;
        let stored_provider = self.store.remove(&provider.provider_key())?;
        Ok(StoredState {
            state,
            provider: stored_provider,
        })
    }
}

fn random_state_token() -> String {
    let mut bytes = [0_u8; STATE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
