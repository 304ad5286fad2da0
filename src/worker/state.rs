//! Task State Definitions
//!
//! ```text
//! SCHEDULED ──(not_before reached)──▶ PENDING ──▶ ACTIVE ──▶ COMPLETED
//!                                        ▲           │
//!                                        │           ├──▶ RETRY ──(backoff elapsed)──┐
//!                                        └───────────┼───────────────────────────────┘
//!                                                    └──▶ ARCHIVED
//! ```
//!
//! Terminal states: COMPLETED, ARCHIVED.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enqueued with a future `not_before`; invisible to processors
    Scheduled,

    /// Ready for delivery
    Pending,

    /// Leased by a processor
    Active,

    /// Failed with a retryable error; waiting out its backoff
    Retry,

    /// Terminal: handler succeeded
    Completed,

    /// Terminal: permanent failure or retries exhausted
    Archived,
}

impl TaskState {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Archived)
    }

    /// Waiting for delivery, either now or once its time comes
    #[inline]
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            TaskState::Scheduled | TaskState::Pending | TaskState::Retry
        )
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Pending => "PENDING",
            TaskState::Active => "ACTIVE",
            TaskState::Retry => "RETRY",
            TaskState::Completed => "COMPLETED",
            TaskState::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Archived.is_terminal());

        assert!(!TaskState::Scheduled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Active.is_terminal());
        assert!(!TaskState::Retry.is_terminal());
    }

    #[test]
    fn test_waiting_states() {
        assert!(TaskState::Scheduled.is_waiting());
        assert!(TaskState::Pending.is_waiting());
        assert!(TaskState::Retry.is_waiting());
        assert!(!TaskState::Active.is_waiting());
        assert!(!TaskState::Archived.is_waiting());
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskState::Pending.to_string(), "PENDING");
        assert_eq!(TaskState::Archived.to_string(), "ARCHIVED");
    }
}
