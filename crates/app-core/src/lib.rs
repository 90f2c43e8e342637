//! Core application logic for Carmarket messaging
//!
//! This crate wires the REST collaborator and the push channel into the
//! client-side state: sending and fetching messages, routing realtime
//! events, and the shared lifecycle of friend requests, message requests
//! and dealership worker invitations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dealership;
pub mod friends;
pub mod invitations;
pub mod media;
pub mod message_requests;
pub mod messages;
pub mod messenger;
pub mod realtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use dealership::WorkerService;
pub use friends::FriendService;
pub use invitations::{
    Actor, Invitation, InvitationAction, InvitationBook, InvitationError, InvitationState,
};
pub use media::{validate_upload, MediaError, SupportedFormat, UploadLimits};
pub use message_requests::MessageRequestService;
pub use messages::{MessageError, MessageService, MAX_MESSAGE_LENGTH};
pub use messenger::{Messenger, MessengerConfig};
pub use realtime::{
    ConnectionHandle, EventFilter, PushConnection, PushEvent, PushEventKind, PushTransport,
    RealtimeConfig, RealtimeError, RealtimeRouter, RouterEvent, Subscription, TransportError,
    TransportSignal,
};
