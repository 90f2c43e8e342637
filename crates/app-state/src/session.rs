//! Session context
//!
//! The [`SessionContext`] is the explicit, injectable owner of "who is signed
//! in". Stores and services receive it at construction, register themselves
//! as [`SessionScoped`] dependents, and are cleared when the session ends.

use market_client::session::{Session, SessionError, SessionStore};
use market_client::UserId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Session-related errors
#[derive(Debug, thiserror::Error)]
pub enum SessionStateError {
    /// Session persistence failed
    #[error("Session store error: {0}")]
    Store(#[from] SessionError),

    /// No user is signed in
    #[error("No active session")]
    NoActiveSession,
}

/// Result type for session state operations
pub type Result<T> = std::result::Result<T, SessionStateError>;

/// State that belongs to one signed-in user and must not outlive the session
pub trait SessionScoped: Send + Sync {
    /// Drop everything cached for the ending session
    fn on_session_end(&self);
}

struct Inner {
    store: Arc<dyn SessionStore>,
    current: watch::Sender<Option<Session>>,
    dependents: Mutex<Vec<Weak<dyn SessionScoped>>>,
}

/// Shared handle on the current session
///
/// # Example
///
/// ```no_run
/// use app_state::session::SessionContext;
/// use market_client::session::MemorySessionStore;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let context = SessionContext::new(Arc::new(MemorySessionStore::new()));
///     let restored = context.init().await.unwrap();
///     assert!(restored.is_none());
/// }
/// ```
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    /// Create a context over a session store; nothing is loaded yet
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                store,
                current,
                dependents: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Restore the persisted session, if any (app start)
    pub async fn init(&self) -> Result<Option<Session>> {
        let restored = self.inner.store.load().await?;
        if let Some(session) = &restored {
            tracing::info!(user_id = %session.user_id(), "restored persisted session");
        }
        self.inner.current.send_replace(restored.clone());
        Ok(restored)
    }

    /// Start a session (sign-in)
    ///
    /// Signing in as a different user first ends the previous session so no
    /// state leaks between accounts.
    pub async fn begin(&self, session: Session) -> Result<()> {
        let previous = self.current().map(|s| s.user_id());
        if previous.is_some_and(|id| id != session.user_id()) {
            self.end_dependents();
        }

        self.inner.store.save(&session).await?;
        tracing::info!(user_id = %session.user_id(), "session started");
        self.inner.current.send_replace(Some(session));
        Ok(())
    }

    /// End the session (sign-out): clears persistence and every dependent
    pub async fn teardown(&self) -> Result<()> {
        let ended = self.inner.current.send_replace(None);
        self.end_dependents();

        if let Some(session) = ended {
            tracing::info!(user_id = %session.user_id(), "session ended");
        }

        self.inner.store.clear().await?;
        Ok(())
    }

    /// The current session, if any
    pub fn current(&self) -> Option<Session> {
        self.inner.current.borrow().clone()
    }

    /// The current session, or [`SessionStateError::NoActiveSession`]
    pub fn require(&self) -> Result<Session> {
        self.current().ok_or(SessionStateError::NoActiveSession)
    }

    /// Id of the signed-in user
    pub fn user_id(&self) -> Result<UserId> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|s| s.user_id())
            .ok_or(SessionStateError::NoActiveSession)
    }

    /// Whether a user is signed in
    pub fn is_active(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.current.subscribe()
    }

    /// Register state to be cleared when the session ends
    ///
    /// Only a weak reference is kept; dropped dependents are pruned.
    pub fn register<S: SessionScoped + 'static>(&self, dependent: &Arc<S>) {
        let weak: Weak<S> = Arc::downgrade(dependent);
        self.inner.dependents.lock().push(weak);
    }

    fn end_dependents(&self) {
        let live: Vec<Arc<dyn SessionScoped>> = {
            let mut dependents = self.inner.dependents.lock();
            dependents.retain(|d| d.strong_count() > 0);
            dependents.iter().filter_map(Weak::upgrade).collect()
        };

        for dependent in live {
            dependent.on_session_end();
        }
    }
}
