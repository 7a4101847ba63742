//! Ephemeral per-user interaction state.
//!
//! Two single-slot stores keyed by user id:
//! - [`SessionStateStore`]: which multi-step interaction (if any) a user is in.
//! - [`DownloadSessions`]: URL + quality picked between the "fetch metadata"
//!   and "confirm format" steps of one download.
//!
//! Writes replace, never merge. There is no expiry: a session lives until it
//! is cleared or overwritten, so an abandoned flow stays pending until the
//! user cancels or starts another one.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::domain::UserId;

/// Kinds of pending multi-step interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionTag {
    AwaitingUrl,
    AwaitingBroadcast,
    AwaitingScheduledBroadcast,
    AwaitingBanUserId,
    AwaitingBanReason,
    AwaitingUnbanUserId,
    AwaitingRoleUserId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserSession {
    pub tag: SessionTag,
    pub payload: Map<String, Value>,
}

impl UserSession {
    pub fn new(tag: SessionTag) -> Self {
        Self {
            tag,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Default)]
pub struct SessionStateStore {
    sessions: Mutex<HashMap<UserId, UserSession>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever session the user had.
    pub async fn set(&self, user_id: UserId, tag: SessionTag, payload: Map<String, Value>) {
        self.put(user_id, UserSession { tag, payload }).await;
    }

    pub async fn put(&self, user_id: UserId, session: UserSession) {
        self.sessions.lock().await.insert(user_id, session);
    }

    pub async fn get(&self, user_id: UserId) -> Option<UserSession> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    /// Returns whether a session was removed.
    pub async fn clear(&self, user_id: UserId) -> bool {
        self.sessions.lock().await.remove(&user_id).is_some()
    }

    /// Remove and return the session in one step.
    pub async fn take(&self, user_id: UserId) -> Option<UserSession> {
        self.sessions.lock().await.remove(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadSession {
    pub url: String,
    pub platform: String,
    pub title: String,
    pub direct_url: Option<String>,
    pub selected_quality: Option<String>,
}

#[derive(Default)]
pub struct DownloadSessions {
    sessions: Mutex<HashMap<UserId, DownloadSession>>,
}

impl DownloadSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user_id: UserId, session: DownloadSession) {
        self.sessions.lock().await.insert(user_id, session);
    }

    pub async fn get(&self, user_id: UserId) -> Option<DownloadSession> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    /// Record the chosen quality. Returns the updated session, or `None` when
    /// the user has no download in progress.
    pub async fn select_quality(&self, user_id: UserId, quality: &str) -> Option<DownloadSession> {
        let mut map = self.sessions.lock().await;
        let session = map.get_mut(&user_id)?;
        session.selected_quality = Some(quality.to_string());
        Some(session.clone())
    }

    pub async fn clear(&self, user_id: UserId) -> bool {
        self.sessions.lock().await.remove(&user_id).is_some()
    }
}
