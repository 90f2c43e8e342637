//! Direct message sending and fetching
//!
//! [`MessageService`] validates content before any network call and writes
//! confirmed messages into the conversation store. The push echo of a sent
//! message carries the same id, so the store keeps one copy whichever path
//! delivers it first.

use app_state::mutation::ViewError;
use app_state::session::{SessionContext, SessionStateError};
use app_state::ConversationStore;
use market_client::{ApiError, ConversationSummary, MarketplaceApi, Message, UserId};
use std::sync::Arc;
use thiserror::Error;

/// Maximum message length in characters
pub const MAX_MESSAGE_LENGTH: usize = 2_000;

/// Errors that can occur during messaging operations
#[derive(Debug, Error)]
pub enum MessageError {
    /// Message has no visible content
    #[error("Message cannot be empty")]
    Empty,

    /// Message too long
    #[error("Message too long: {length} exceeds maximum {max}")]
    TooLong {
        /// Actual message length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Sending to yourself
    #[error("Cannot send a message to yourself")]
    SelfRecipient,

    /// Collaborator failure
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// No active session
    #[error(transparent)]
    Session(#[from] SessionStateError),
}

/// Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessageError>;

impl From<MessageError> for ViewError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Api(e) => ViewError::from(e),
            MessageError::Session(e) => {
                ViewError::new(app_state::FailureKind::Permission, e.to_string())
            }
            other => ViewError::validation(other.to_string()),
        }
    }
}

/// Check message content against the length limits
pub fn validate_content(content: &str, max: usize) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MessageError::Empty);
    }

    let length = content.chars().count();
    if length > max {
        return Err(MessageError::TooLong { length, max });
    }

    Ok(())
}

/// Message operations against the REST collaborator
pub struct MessageService {
    api: Arc<dyn MarketplaceApi>,
    session: SessionContext,
    store: Arc<ConversationStore>,
    max_length: usize,
}

impl MessageService {
    /// Create a new message service
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        session: SessionContext,
        store: Arc<ConversationStore>,
    ) -> Self {
        Self {
            api,
            session,
            store,
            max_length: MAX_MESSAGE_LENGTH,
        }
    }

    /// Override the maximum message length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Send `content` to `receiver` and store the confirmed message
    ///
    /// Nothing is sent, and nothing stored, when validation fails.
    pub async fn send(&self, receiver: UserId, content: impl Into<String>) -> Result<Message> {
        let content = content.into();
        validate_content(&content, self.max_length)?;

        let me = self.session.user_id()?;
        if receiver == me {
            return Err(MessageError::SelfRecipient);
        }

        let message = self.api.send_message(receiver, content).await?;
        tracing::debug!(message_id = %message.id, %receiver, request = message.is_message_request, "message sent");

        self.store.append_message(message.clone());
        Ok(message)
    }

    /// Fetch every message exchanged with `counterpart`
    ///
    /// The result is returned, not stored, so the caller can drop a stale
    /// response.
    pub async fn fetch_messages(&self, counterpart: UserId) -> Result<Vec<Message>> {
        self.session.require()?;
        Ok(self.api.get_messages(counterpart).await?)
    }

    /// Fetch conversation summaries
    pub async fn fetch_summaries(&self) -> Result<Vec<ConversationSummary>> {
        self.session.require()?;
        Ok(self.api.list_conversations().await?)
    }
}
