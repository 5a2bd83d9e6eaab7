use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::AppError, status::TaskStatus};

/// The authenticated principal behind a request, as asserted by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub username: String,
    pub project_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Unprocessed,
    Validated,
    Prepared,
    Submitted,
    Succeeded,
    Skipped,
    Failed,
}

impl ActionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionState::Unprocessed => "unprocessed",
            ActionState::Validated => "validated",
            ActionState::Prepared => "prepared",
            ActionState::Submitted => "submitted",
            ActionState::Succeeded => "succeeded",
            ActionState::Skipped => "skipped",
            ActionState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "unprocessed" => Ok(ActionState::Unprocessed),
            "validated" => Ok(ActionState::Validated),
            "prepared" => Ok(ActionState::Prepared),
            "submitted" => Ok(ActionState::Submitted),
            "succeeded" => Ok(ActionState::Succeeded),
            "skipped" => Ok(ActionState::Skipped),
            "failed" => Ok(ActionState::Failed),
            _ => Err(AppError::Internal(format!("invalid action state: {value}"))),
        }
    }

    /// Terminal for ordering purposes: later actions may run.
    pub fn is_done(self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNote {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub project_id: Option<String>,
    #[serde(skip_serializing)]
    pub fingerprint: String,
    pub requested_by: Option<Caller>,
    pub approved: bool,
    pub executing: bool,
    pub completed: bool,
    pub cancelled: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: String,
    pub task_id: String,
    pub position: i64,
    pub action_type: String,
    pub data: Map<String, Value>,
    pub state: ActionState,
    pub notes: Vec<ActionNote>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenRecord {
    pub id: String,
    pub task_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Neither consumed nor superseded.
    pub fn is_open(&self) -> bool {
        self.consumed_at.is_none() && self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub task_id: String,
    pub error: bool,
    pub message: String,
    pub details: Value,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub status: TaskStatus,
    pub actions: Vec<ActionRecord>,
    pub tokens: Vec<TokenRecord>,
    pub notifications: Vec<NotificationRecord>,
}

impl TaskView {
    /// Merged action payloads, later actions overriding earlier keys.
    pub fn task_data(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for action in &self.actions {
            for (k, v) in &action.data {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub reissued_token: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    /// `pending` (default), `completed`, `cancelled` or `all`.
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_type: String,
    pub project_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDetailsResponse {
    pub task_type: String,
    pub required_fields: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedTokenResponse {
    pub task_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub acknowledged: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectUserEntry {
    pub id: String,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectUsersResponse {
    pub users: Vec<ProjectUserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDetailResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesResponse {
    pub roles: Vec<RoleItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRolesRequest {
    pub roles: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailEnvelope {
    pub message_id: String,
    pub recipient: String,
    pub template: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
}
