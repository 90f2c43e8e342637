//! Application state management for Carmarket messaging
//!
//! This crate holds the client-side state the views render: the session
//! context, the per-counterpart conversation store, read-state
//! reconciliation, unread badges, the in-process event bus and the hook
//! boundary that turns collaborator failures into view outcomes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conversation_store;
pub mod events;
pub mod guard;
pub mod mutation;
pub mod read_state;
pub mod session;
pub mod unread;

pub use conversation_store::{
    Conversation, ConversationStore, LoadingGuard, ReadChange, StoreStatus,
};
pub use events::{AppEvent, EventBus};
pub use guard::{ViewGuard, ViewToken};
pub use mutation::{FailureKind, MutationState, MutationTracker, Outcome, ViewError};
pub use read_state::{ReadStateReconciler, ReconcileState, ReconcileTicket};
pub use session::{SessionContext, SessionScoped, SessionStateError};
pub use unread::{UnreadBadges, UnreadDisplay};
