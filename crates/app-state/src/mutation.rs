//! Hook boundary: outcomes, view errors and mutation state
//!
//! Collaborator failures stop here. Every operation a view triggers comes
//! back as an [`Outcome`], a nullable value plus an optional [`ViewError`],
//! so nothing propagates into the render path and prior state stays on
//! screen. [`MutationTracker`] records which mutations are suspended so the
//! view can render a pending state.

use market_client::{ApiError, ErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

/// Guidance shown alongside permission failures
pub const REAUTHENTICATE_GUIDANCE: &str = "Sign in again or refresh your session to continue.";

/// How a failure should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or server hiccup; the user may retry
    Transient,
    /// The target changed underneath us; refetch the affected list
    Conflict,
    /// Not allowed; re-authenticate rather than retry
    Permission,
    /// Rejected locally before any network call
    Validation,
    /// The backend answered with something we cannot use
    Unavailable,
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transient => FailureKind::Transient,
            ErrorKind::Conflict | ErrorKind::NotFound => FailureKind::Conflict,
            ErrorKind::Permission | ErrorKind::Unauthenticated => FailureKind::Permission,
            ErrorKind::Validation => FailureKind::Validation,
            ErrorKind::Unexpected => FailureKind::Unavailable,
        }
    }
}

/// An error as a view displays it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewError {
    /// Presentation class
    pub kind: FailureKind,
    /// Message for the user
    pub message: String,
    /// What the user should do next, when there is something specific
    pub guidance: Option<String>,
}

impl ViewError {
    /// Create an error of `kind`
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let guidance = match kind {
            FailureKind::Permission => Some(REAUTHENTICATE_GUIDANCE.to_string()),
            _ => None,
        };
        Self {
            kind,
            message: message.into(),
            guidance,
        }
    }

    /// Local validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Stale-state failure
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Conflict, message)
    }

    /// Whether the view should refetch the affected list
    pub fn needs_refetch(&self) -> bool {
        self.kind == FailureKind::Conflict
    }

    /// Whether the user may simply try again
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.guidance {
            Some(guidance) => write!(f, "{} {}", self.message, guidance),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<ApiError> for ViewError {
    fn from(err: ApiError) -> Self {
        Self::from(&err)
    }
}

impl From<&ApiError> for ViewError {
    fn from(err: &ApiError) -> Self {
        let kind = FailureKind::from(err.kind());
        let message = match kind {
            FailureKind::Transient => "Could not reach the server. Please try again.".to_string(),
            FailureKind::Unavailable => "The server sent an unexpected response.".to_string(),
            _ => err.message().to_string(),
        };
        Self::new(kind, message)
    }
}

/// Result of an operation at the hook boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    /// The value, when the operation succeeded
    pub value: Option<T>,
    /// The error, when it failed
    pub error: Option<ViewError>,
}

impl<T> Outcome<T> {
    /// Successful outcome
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    /// Failed outcome
    pub fn err(error: impl Into<ViewError>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
        }
    }

    /// Neither value nor error; the response was stale and dropped
    pub fn dropped() -> Self {
        Self {
            value: None,
            error: None,
        }
    }

    /// Convert a collaborator result
    pub fn from_result<E: Into<ViewError>>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::err(e),
        }
    }

    /// Whether the operation succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Presentation class of the failure, if any
    pub fn failure(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Map the successful value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: self.value.map(f),
            error: self.error,
        }
    }
}

/// Mutation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationState {
    /// Mutation is idle
    #[default]
    Idle,

    /// Mutation is suspended on the network
    Pending,

    /// Mutation succeeded
    Success,

    /// Mutation failed
    Error,
}

/// Per-key mutation state for views
#[derive(Debug, Default)]
pub struct MutationTracker {
    states: Mutex<HashMap<String, MutationState>>,
}

impl MutationTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the mutation under `key`
    pub fn state(&self, key: &str) -> MutationState {
        self.states.lock().get(key).copied().unwrap_or_default()
    }

    /// Whether the mutation under `key` is suspended
    pub fn is_pending(&self, key: &str) -> bool {
        self.state(key) == MutationState::Pending
    }

    /// Forget the state under `key`
    pub fn reset(&self, key: &str) {
        self.states.lock().remove(key);
    }

    fn set(&self, key: &str, state: MutationState) {
        self.states.lock().insert(key.to_string(), state);
    }

    /// Run `fut` as the mutation under `key` and convert its result
    ///
    /// A failure is logged and returned as the outcome's error.
    pub async fn run<T, E, F>(&self, key: &str, fut: F) -> Outcome<T>
    where
        E: Into<ViewError> + std::fmt::Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.set(key, MutationState::Pending);
        match fut.await {
            Ok(value) => {
                self.set(key, MutationState::Success);
                Outcome::ok(value)
            }
            Err(e) => {
                tracing::warn!(mutation = key, "mutation failed: {}", e);
                self.set(key, MutationState::Error);
                Outcome::err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(FailureKind::from(ErrorKind::Transient), FailureKind::Transient);
        assert_eq!(FailureKind::from(ErrorKind::Conflict), FailureKind::Conflict);
        assert_eq!(FailureKind::from(ErrorKind::NotFound), FailureKind::Conflict);
        assert_eq!(FailureKind::from(ErrorKind::Unauthenticated), FailureKind::Permission);
        assert_eq!(FailureKind::from(ErrorKind::Unexpected), FailureKind::Unavailable);
    }

    #[test]
    fn test_permission_error_carries_guidance() {
        let err = ViewError::from(ApiError::new(403, "Forbidden", "Admin rights revoked"));
        assert_eq!(err.kind, FailureKind::Permission);
        assert_eq!(err.guidance.as_deref(), Some(REAUTHENTICATE_GUIDANCE));
        assert!(err.to_string().starts_with("Admin rights revoked"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_needs_refetch() {
        let err = ViewError::from(ApiError::new(409, "NotPending", "no longer pending"));
        assert!(err.needs_refetch());
        assert!(err.guidance.is_none());
    }

    #[test]
    fn test_transient_message_is_generic() {
        let err = ViewError::from(ApiError::network("connection reset by peer"));
        assert!(err.is_retryable());
        assert_eq!(err.message, "Could not reach the server. Please try again.");
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Outcome<u32> = Outcome::from_result(Ok::<_, ApiError>(3));
        assert!(ok.is_ok());
        assert_eq!(ok.map(|v| v * 2).value, Some(6));

        let failed: Outcome<u32> = Outcome::from_result(Err(ApiError::new(409, "Conflict", "x")));
        assert!(failed.value.is_none());
        assert_eq!(failed.failure(), Some(FailureKind::Conflict));
    }

    #[tokio::test]
    async fn test_tracker_records_states() {
        let tracker = MutationTracker::new();
        assert_eq!(tracker.state("accept:1"), MutationState::Idle);

        let outcome = tracker
            .run("accept:1", async { Ok::<_, ApiError>("done") })
            .await;
        assert_eq!(outcome.value, Some("done"));
        assert_eq!(tracker.state("accept:1"), MutationState::Success);

        let outcome: Outcome<()> = tracker
            .run("accept:2", async { Err(ApiError::new(503, "Unavailable", "down")) })
            .await;
        assert!(!outcome.is_ok());
        assert_eq!(tracker.state("accept:2"), MutationState::Error);

        tracker.reset("accept:2");
        assert_eq!(tracker.state("accept:2"), MutationState::Idle);
    }
}
