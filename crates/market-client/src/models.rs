//! Wire models exchanged with the marketplace backend and the push channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DealershipId, MessageId, RequestId, UserId};

/// Denormalized profile snapshot of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    /// User id
    pub id: UserId,
    /// Login name
    pub username: String,
    /// Display name, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserSummary {
    /// Create a summary with only the required fields
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            display_name: None,
            avatar_url: None,
        }
    }

    /// Name to show in lists: display name when present, username otherwise
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// A direct message between two users
///
/// Everything except `is_read` is immutable once the backend created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Author
    pub sender_id: UserId,
    /// Recipient
    pub receiver_id: UserId,
    /// Text content
    pub content: String,
    /// When the backend accepted the message
    pub sent_at: DateTime<Utc>,
    /// Whether the recipient has read it
    #[serde(default)]
    pub is_read: bool,
    /// When the recipient read it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Sent to a non-friend and awaiting acceptance
    #[serde(default)]
    pub is_message_request: bool,
}

impl Message {
    /// The other participant from `me`'s point of view
    pub fn counterpart(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// Whether `me` is the recipient
    pub fn is_incoming(&self, me: UserId) -> bool {
        self.receiver_id == me
    }

    /// Whether the message counts towards `me`'s unread total
    pub fn is_unread_for(&self, me: UserId) -> bool {
        self.is_incoming(me) && !self.is_read
    }
}

/// Conversation row as returned by the "list conversations" endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The counterpart
    pub user: UserSummary,
    /// Most recent message exchanged with the counterpart
    pub last_message: Message,
    /// Server-side unread count
    #[serde(default)]
    pub unread_count: u32,
    /// Whether the counterpart is a friend
    #[serde(default)]
    pub is_friend: bool,
}

/// Receipt returned after marking a sender's messages as read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadReceipt {
    /// Messages the backend flipped to read
    #[serde(default)]
    pub marked: Vec<MessageId>,
    /// Server timestamp of the read
    pub read_at: DateTime<Utc>,
}

/// Status of a friend request or message request
///
/// Encoded numerically on the wire (`Pending = 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestStatus {
    /// Awaiting a decision
    #[default]
    Pending,
    /// Accepted by the addressee
    Accepted,
    /// Rejected by the addressee
    Rejected,
    /// Withdrawn by the requester
    Cancelled,
}

impl RequestStatus {
    /// Whether the record can still be mutated
    pub fn is_pending(self) -> bool {
        self == RequestStatus::Pending
    }
}

impl From<RequestStatus> for u8 {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => 0,
            RequestStatus::Accepted => 1,
            RequestStatus::Rejected => 2,
            RequestStatus::Cancelled => 3,
        }
    }
}

impl TryFrom<u8> for RequestStatus {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(RequestStatus::Pending),
            1 => Ok(RequestStatus::Accepted),
            2 => Ok(RequestStatus::Rejected),
            3 => Ok(RequestStatus::Cancelled),
            other => Err(format!("unknown request status {}", other)),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A friend request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    /// Record id
    pub id: RequestId,
    /// User who sent the request
    pub requester: UserSummary,
    /// User who received it
    pub addressee: UserSummary,
    /// Current status
    #[serde(default)]
    pub status: RequestStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A request to open a conversation with a non-friend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    /// Record id
    pub id: RequestId,
    /// User who wrote first
    pub requester: UserSummary,
    /// User who has to accept
    pub addressee: UserSummary,
    /// Current status
    #[serde(default)]
    pub status: RequestStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// The message that opened the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<Message>,
}

/// Role granted to a dealership worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerRole {
    /// Regular staff
    Worker,
    /// Dealership administrator
    Admin,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Worker => f.write_str("Worker"),
            WorkerRole::Admin => f.write_str("Admin"),
        }
    }
}

/// Membership status of a dealership worker record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Invitation sent, not answered yet
    #[default]
    Pending,
    /// Invitation accepted; the user works for the dealership
    Active,
    /// Invitation declined or cancelled, or membership revoked
    Removed,
}

/// Dealership membership record; starts life as an invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealershipWorker {
    /// Record id
    pub id: RequestId,
    /// Dealership the membership belongs to
    pub dealership_id: DealershipId,
    /// Admin who sent the invitation
    pub inviter_id: UserId,
    /// Invited user
    pub user: UserSummary,
    /// Role granted on acceptance; absent while the backend has not applied it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<WorkerRole>,
    /// Current status
    #[serde(default)]
    pub status: WorkerStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
