//! Stale-response guard
//!
//! A view takes a [`ViewToken`] before it suspends on a network call and
//! checks it when the response arrives. Any newer token (the user switched
//! conversations, the view closed) makes the older one stale, and the
//! response is dropped instead of being applied to view state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generation marker for one in-flight view request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewToken(u64);

impl ViewToken {
    /// The generation this token was issued for
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// Issues and validates [`ViewToken`]s for one view
#[derive(Debug, Default)]
pub struct ViewGuard {
    generation: AtomicU64,
}

impl ViewGuard {
    /// Create a guard at generation zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new view state; every earlier token becomes stale
    pub fn issue(&self) -> ViewToken {
        ViewToken(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Make every outstanding token stale without issuing a new one
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether `token` still matches the current view state
    pub fn is_current(&self, token: ViewToken) -> bool {
        self.generation.load(Ordering::Acquire) == token.0
    }

    /// Hand back `value` only when `token` is still current
    pub fn accept<T>(&self, token: ViewToken, value: T) -> Option<T> {
        if self.is_current(token) {
            Some(value)
        } else {
            tracing::debug!(generation = token.0, "dropping stale response");
            None
        }
    }
}
