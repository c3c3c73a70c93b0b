//! Typed error hierarchy for ActivityPro.
//!
//! Store and command code returns `anyhow::Result`; domain failures are
//! raised as a [`TrackerError`] inside the `anyhow::Error` so the HTTP layer
//! can recover the variant with [`TrackerError::find`] and pick a status.

use thiserror::Error;

use crate::tracker::lifecycle::TimerAction;
use crate::tracker::models::ActivityStatus;

/// Domain errors from the tracker store and API.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Cannot {action} an activity that is {from}")]
    InvalidTransition {
        from: ActivityStatus,
        action: TimerAction,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Another timer is already running on activity {activity_id}")]
    TimerConflict { activity_id: i64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl TrackerError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Find the first `TrackerError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&TrackerError> {
        err.chain().find_map(|cause| cause.downcast_ref::<TrackerError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn not_found_message_names_entity_and_id() {
        let err = TrackerError::not_found("Activity", 7);
        assert_eq!(err.to_string(), "Activity 7 not found");
    }

    #[test]
    fn invalid_transition_message_uses_wire_names() {
        let err = TrackerError::InvalidTransition {
            from: ActivityStatus::Completed,
            action: TimerAction::Pause,
        };
        assert_eq!(err.to_string(), "Cannot pause an activity that is completed");
    }

    #[test]
    fn find_sees_through_context_layers() {
        let result: anyhow::Result<()> = Err(TrackerError::TimerConflict { activity_id: 3 }.into());
        let err = result
            .context("Failed to start timer")
            .context("Request failed")
            .unwrap_err();
        match TrackerError::find(&err) {
            Some(TrackerError::TimerConflict { activity_id }) => assert_eq!(*activity_id, 3),
            other => panic!("Expected TimerConflict, got {:?}", other),
        }
    }

    #[test]
    fn find_returns_none_for_foreign_errors() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(TrackerError::find(&err).is_none());
    }
}
