//! Task status derivation.
//!
//! A task's status is never stored. It is computed from the task flags, its
//! tokens and its notifications, in this precedence order:
//!
//! 1. `cancelled`
//! 2. `failed`: at least one unacknowledged error notification
//! 3. `expired`: an open (unconsumed, not superseded) token is past its expiry
//! 4. `completed`
//! 5. `processing`: actions are being submitted right now
//! 6. `unconfirmed`: waiting on an open, unexpired token
//! 7. `pending`: waiting on administrator approval

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{NotificationRecord, TokenRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Cancelled,
    Failed,
    Expired,
    Completed,
    Processing,
    Unconfirmed,
    Pending,
}

impl TaskStatus {
    /// Label used in project user listings.
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Failed => "Failed",
            TaskStatus::Expired => "Expired",
            TaskStatus::Completed => "Active",
            TaskStatus::Processing => "Processing",
            TaskStatus::Unconfirmed => "Unconfirmed",
            TaskStatus::Pending => "Pending",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFlags {
    pub completed: bool,
    pub cancelled: bool,
    pub executing: bool,
}

pub fn derive_status(
    flags: TaskFlags,
    tokens: &[TokenRecord],
    notifications: &[NotificationRecord],
    now: DateTime<Utc>,
) -> TaskStatus {
    if flags.cancelled {
        return TaskStatus::Cancelled;
    }
    if notifications.iter().any(|n| n.error && !n.acknowledged) {
        return TaskStatus::Failed;
    }
    let open_tokens = || tokens.iter().filter(|t| t.is_open());
    if open_tokens().any(|t| t.is_expired(now)) {
        return TaskStatus::Expired;
    }
    if flags.completed {
        return TaskStatus::Completed;
    }
    if flags.executing {
        return TaskStatus::Processing;
    }
    if open_tokens().next().is_some() {
        return TaskStatus::Unconfirmed;
    }
    TaskStatus::Pending
}
