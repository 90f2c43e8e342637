//! Unread badge tracking
//!
//! Badges outside the chat view (sidebar, navigation) read their counts from
//! [`UnreadBadges`] instead of opening their own push subscription. The
//! message badge is fed from the conversation store; the request badges are
//! fed from the invitation services after each list fetch.

use tokio::sync::watch;

use crate::session::SessionScoped;

/// Maximum unread count to show (displays as "99+")
pub const MAX_DISPLAY_COUNT: u32 = 99;

/// Unread count display value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnreadDisplay {
    /// No unread items
    #[default]
    None,
    /// Specific count (1-98)
    Count(u32),
    /// 99 or more unread items
    Many,
}

impl UnreadDisplay {
    /// Create from a numeric count
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            UnreadDisplay::None
        } else if count >= MAX_DISPLAY_COUNT {
            UnreadDisplay::Many
        } else {
            UnreadDisplay::Count(count)
        }
    }

    /// Convert to display string
    pub fn as_display_string(&self) -> String {
        match self {
            UnreadDisplay::None => String::new(),
            UnreadDisplay::Count(n) => n.to_string(),
            UnreadDisplay::Many => format!("{}+", MAX_DISPLAY_COUNT),
        }
    }

    /// Check if there are any unread items
    pub fn has_unread(&self) -> bool {
        !matches!(self, UnreadDisplay::None)
    }

    /// Get the numeric count (0 for None, 99 for Many)
    pub fn count(&self) -> u32 {
        match self {
            UnreadDisplay::None => 0,
            UnreadDisplay::Count(n) => *n,
            UnreadDisplay::Many => MAX_DISPLAY_COUNT,
        }
    }
}

impl std::fmt::Display for UnreadDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_display_string())
    }
}

/// Badge counts shared by every component that shows one
///
/// # Example
///
/// ```
/// use app_state::unread::{UnreadBadges, UnreadDisplay};
///
/// let badges = UnreadBadges::new();
/// let rx = badges.subscribe_messages();
///
/// badges.set_messages(3);
/// assert_eq!(*rx.borrow(), UnreadDisplay::Count(3));
/// ```
pub struct UnreadBadges {
    messages: watch::Sender<UnreadDisplay>,
    friend_requests: watch::Sender<UnreadDisplay>,
    message_requests: watch::Sender<UnreadDisplay>,
}

fn publish(tx: &watch::Sender<UnreadDisplay>, count: u32) {
    let display = UnreadDisplay::from_count(count);
    tx.send_if_modified(|current| {
        if *current == display {
            false
        } else {
            *current = display;
            true
        }
    });
}

impl UnreadBadges {
    /// Create badges with every count at zero
    pub fn new() -> Self {
        let (messages, _) = watch::channel(UnreadDisplay::None);
        let (friend_requests, _) = watch::channel(UnreadDisplay::None);
        let (message_requests, _) = watch::channel(UnreadDisplay::None);
        Self {
            messages,
            friend_requests,
            message_requests,
        }
    }

    /// Set the total unread message count
    pub fn set_messages(&self, count: u32) {
        publish(&self.messages, count);
    }

    /// Set the number of pending incoming friend requests
    pub fn set_friend_requests(&self, count: u32) {
        publish(&self.friend_requests, count);
    }

    /// Set the number of pending message requests
    pub fn set_message_requests(&self, count: u32) {
        publish(&self.message_requests, count);
    }

    /// Current message badge
    pub fn messages(&self) -> UnreadDisplay {
        *self.messages.borrow()
    }

    /// Current friend request badge
    pub fn friend_requests(&self) -> UnreadDisplay {
        *self.friend_requests.borrow()
    }

    /// Current message request badge
    pub fn message_requests(&self) -> UnreadDisplay {
        *self.message_requests.borrow()
    }

    /// Watch the message badge
    pub fn subscribe_messages(&self) -> watch::Receiver<UnreadDisplay> {
        self.messages.subscribe()
    }

    /// Watch the friend request badge
    pub fn subscribe_friend_requests(&self) -> watch::Receiver<UnreadDisplay> {
        self.friend_requests.subscribe()
    }

    /// Watch the message request badge
    pub fn subscribe_message_requests(&self) -> watch::Receiver<UnreadDisplay> {
        self.message_requests.subscribe()
    }

    /// Reset every badge to zero
    pub fn reset(&self) {
        self.set_messages(0);
        self.set_friend_requests(0);
        self.set_message_requests(0);
    }
}

impl Default for UnreadBadges {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionScoped for UnreadBadges {
    fn on_session_end(&self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_display_from_count() {
        assert_eq!(UnreadDisplay::from_count(0), UnreadDisplay::None);
        assert_eq!(UnreadDisplay::from_count(1), UnreadDisplay::Count(1));
        assert_eq!(UnreadDisplay::from_count(98), UnreadDisplay::Count(98));
        assert_eq!(UnreadDisplay::from_count(99), UnreadDisplay::Many);
        assert_eq!(UnreadDisplay::from_count(500), UnreadDisplay::Many);
    }

    #[test]
    fn test_unread_display_string() {
        assert_eq!(UnreadDisplay::None.as_display_string(), "");
        assert_eq!(UnreadDisplay::Count(5).to_string(), "5");
        assert_eq!(UnreadDisplay::Many.to_string(), "99+");
        assert_eq!(UnreadDisplay::Many.count(), 99);
        assert!(!UnreadDisplay::None.has_unread());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let badges = UnreadBadges::new();
        let mut rx = badges.subscribe_friend_requests();

        badges.set_friend_requests(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), UnreadDisplay::Count(2));
    }

    #[test]
    fn test_unchanged_count_does_not_notify() {
        let badges = UnreadBadges::new();
        badges.set_messages(4);

        let rx = badges.subscribe_messages();
        badges.set_messages(4);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_session_end_resets() {
        let badges = UnreadBadges::new();
        badges.set_messages(7);
        badges.set_message_requests(1);

        badges.on_session_end();

        assert_eq!(badges.messages(), UnreadDisplay::None);
        assert_eq!(badges.message_requests(), UnreadDisplay::None);
    }
}
