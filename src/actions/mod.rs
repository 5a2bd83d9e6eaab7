//! Actions: the units of work a task is made of.
//!
//! Each action type pairs a declared input schema (see [`crate::catalog`]) with
//! a statically typed handler. Handlers run in three steps:
//!
//! * `validate` checks the payload against the requester's authority and may
//!   read from the identity provider.
//! * `prepare` repeats the read-only checks right before execution. It must be
//!   idempotent and free of side effects.
//! * `submit` performs the mutation. It must tolerate being retried, which in
//!   practice means checking current provider state first and treating
//!   "already done" as success.

mod default_network;
mod edit_roles;
mod invite_user;
mod reset_password;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    catalog::{ActionSchema, action_schema},
    config::EngineSettings,
    error::{AppError, FieldError},
    identity::{GatewayError, IdentityGateway},
    models::Caller,
    policy::AuthorizationPolicy,
};

pub use default_network::{AddDefaultUsersToProject, NewDefaultNetwork, NewProjectDefaultNetwork};
pub use edit_roles::EditUserRoles;
pub use invite_user::InviteUser;
pub use reset_password::{ForcePassword, ResetPassword};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("invalid data")]
    Validation(Vec<FieldError>),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Gateway(#[from] GatewayError),
}

impl ActionError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        ActionError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Gateway(err) if err.is_transient())
    }
}

impl From<ActionError> for AppError {
    fn from(value: ActionError) -> Self {
        match value {
            ActionError::Validation(errors) => AppError::Validation(errors),
            ActionError::Forbidden(msg) => AppError::Forbidden(msg),
            ActionError::Gateway(err) => err.into(),
        }
    }
}

/// What a successful submit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded(Vec<String>),
    /// Nothing to do; the action is done without touching the provider.
    Skipped(String),
}

/// Everything a handler may look at. Borrowed for the duration of one step.
pub struct ActionContext<'a> {
    pub task_id: &'a str,
    pub task_type: &'a str,
    pub project_id: Option<&'a str>,
    pub data: &'a Map<String, Value>,
    /// Data supplied by the token holder. Never persisted.
    pub confirmation: &'a Map<String, Value>,
    pub requested_by: Option<&'a Caller>,
    pub gateway: &'a dyn IdentityGateway,
    pub policy: &'a AuthorizationPolicy,
    pub settings: &'a EngineSettings,
}

impl ActionContext<'_> {
    pub fn str_field(&self, name: &str) -> Result<&str, ActionError> {
        self.data
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::field(name, "This field is required."))
    }

    pub fn bool_field(&self, name: &str) -> bool {
        self.data.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn roles_field(&self, name: &str) -> Vec<String> {
        self.data
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn confirmation_str(&self, name: &str) -> Option<&str> {
        self.confirmation
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn requester(&self) -> Result<&Caller, ActionError> {
        self.requested_by
            .ok_or_else(|| ActionError::Forbidden("action requires an authenticated requester".to_string()))
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError>;

    async fn prepare(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        self.validate(ctx).await
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError>;
}

/// An action built from a payload that passed its schema.
#[derive(Debug, Clone)]
pub struct BuiltAction {
    pub action_type: String,
    pub data: Map<String, Value>,
}

#[derive(Clone)]
struct Registration {
    schema: ActionSchema,
    handler: Arc<dyn ActionHandler>,
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    entries: HashMap<String, Registration>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action and its catalog schema.
    pub fn with_defaults() -> Result<Self, AppError> {
        let mut registry = Self::new();
        let handlers: Vec<(&str, Arc<dyn ActionHandler>)> = vec![
            ("InviteUser", Arc::new(InviteUser)),
            ("EditUserRoles", Arc::new(EditUserRoles)),
            ("ResetPassword", Arc::new(ResetPassword)),
            ("ForcePassword", Arc::new(ForcePassword)),
            ("NewDefaultNetwork", Arc::new(NewDefaultNetwork)),
            ("NewProjectDefaultNetwork", Arc::new(NewProjectDefaultNetwork)),
            ("AddDefaultUsersToProject", Arc::new(AddDefaultUsersToProject)),
        ];
        for (action_type, handler) in handlers {
            let schema = action_schema(action_type)
                .ok_or_else(|| AppError::UnknownActionType(action_type.to_string()))?;
            registry.register(action_type, schema, handler);
        }
        Ok(registry)
    }

    pub fn register(&mut self, action_type: &str, schema: ActionSchema, handler: Arc<dyn ActionHandler>) {
        self.entries
            .insert(action_type.to_string(), Registration { schema, handler });
    }

    pub fn schema(&self, action_type: &str) -> Result<&ActionSchema, AppError> {
        self.entries
            .get(action_type)
            .map(|r| &r.schema)
            .ok_or_else(|| AppError::UnknownActionType(action_type.to_string()))
    }

    pub fn handler(&self, action_type: &str) -> Result<Arc<dyn ActionHandler>, AppError> {
        self.entries
            .get(action_type)
            .map(|r| r.handler.clone())
            .ok_or_else(|| AppError::UnknownActionType(action_type.to_string()))
    }

    pub fn build(&self, action_type: &str, payload: &Value) -> Result<BuiltAction, AppError> {
        let schema = self.schema(action_type)?;
        let data = schema.normalize(payload).map_err(AppError::Validation)?;
        Ok(BuiltAction {
            action_type: action_type.to_string(),
            data,
        })
    }
}

/// Roles a requester asked to manage that fall outside its ceiling.
pub(crate) fn check_manageable(ctx: &ActionContext<'_>, roles: &[String]) -> Result<(), ActionError> {
    let requester = ctx.requester()?;
    let allowed = ctx.policy.can_manage(&requester.roles, roles, ctx.task_type);
    let denied: Vec<&str> = roles
        .iter()
        .filter(|r| !allowed.contains(*r))
        .map(String::as_str)
        .collect();
    if denied.is_empty() {
        Ok(())
    } else {
        Err(ActionError::field(
            "roles",
            format!("You are not allowed to manage these roles: {}", denied.join(", ")),
        ))
    }
}

/// Every requested role must exist in the provider.
pub(crate) async fn check_roles_exist(ctx: &ActionContext<'_>, roles: &[String]) -> Result<(), ActionError> {
    let mut missing = Vec::new();
    for role in roles {
        if ctx.gateway.find_role(role).await?.is_none() {
            missing.push(role.as_str());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ActionError::field(
            "roles",
            format!("Unknown roles: {}", missing.join(", ")),
        ))
    }
}
