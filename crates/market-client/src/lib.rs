//! Marketplace client library
//!
//! This crate provides the REST collaborator contract consumed by the
//! conversation and invitation sync core, its HTTP binding, the wire models
//! shared with the push channel, and session persistence.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod models;
pub mod rest;
pub mod session;
pub mod types;

pub use api::{ApiResult, HttpMarketplaceApi, MarketplaceApi};
pub use models::{
    ConversationSummary, DealershipWorker, FriendRequest, MarkReadReceipt, Message,
    MessageRequest, RequestStatus, UserSummary, WorkerRole, WorkerStatus,
};
pub use rest::{ApiError, ErrorKind, RestClient, RestClientConfig};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionStore};
pub use types::{DealershipId, MessageId, RequestId, UserId};

#[cfg(any(test, feature = "test-utils"))]
pub use api::MockMarketplaceApi;
