//! Signed-in session and its persistence contract
//!
//! Token issuance is the backend's business; this module only describes what
//! a session looks like and where it is kept between restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{PersistedState, PersistenceConfig, PersistenceError};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::UserSummary;
use crate::types::UserId;

/// Errors from session persistence
#[derive(Debug, Error)]
pub enum SessionError {
    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result type for session persistence
pub type Result<T> = std::result::Result<T, SessionError>;

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// The signed-in user
    pub user: UserSummary,
    /// Bearer token for REST calls
    pub access_token: String,
    /// When the token was issued
    pub issued_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session issued now
    pub fn new(user: UserSummary, access_token: impl Into<String>) -> Self {
        Self {
            user,
            access_token: access_token.into(),
            issued_at: Utc::now(),
        }
    }

    /// Id of the signed-in user
    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

/// On-disk shape of the persisted session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// The stored session, if any
    pub session: Option<Session>,
}

/// Where the current session is kept between restarts
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the stored session, if any
    async fn load(&self) -> Result<Option<Session>>;

    /// Store a session, replacing any previous one
    async fn save(&self, session: &Session) -> Result<()>;

    /// Forget the stored session
    async fn clear(&self) -> Result<()>;
}

/// Session store backed by a checksummed JSON snapshot
pub struct FileSessionStore {
    state: PersistedState<SessionSnapshot>,
}

impl FileSessionStore {
    /// Create a store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(PersistenceConfig::new(path))
    }

    /// Create a store from a full persistence configuration
    pub fn with_config(config: PersistenceConfig) -> Self {
        Self { state: PersistedState::new(config) }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        match self.state.init().await {
            Ok(()) => Ok(self.state.get().await?.session),
            Err(e) if e.is_unreadable_snapshot() => {
                tracing::warn!(path = %self.state.path().display(), "discarding unreadable session snapshot: {}", e);
                self.state.clear().await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.state
            .set(SessionSnapshot { session: Some(session.clone()) })
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.state.clear().await?;
        Ok(())
    }
}

/// Session store that lives only as long as the process
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    session: Arc<RwLock<Option<Session>>>,
}

impl MemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a session
    pub fn with_session(session: Session) -> Self {
        Self { session: Arc::new(RwLock::new(Some(session))) }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.read().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.write().await = None;
        Ok(())
    }
}
