//! Project user management on top of the task engine.
//!
//! Reads go straight to the identity provider; every mutation becomes a task.
//! Users holding a role blacklisted for role management are invisible here.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    engine::TaskEngine,
    error::AppError,
    identity::IdentityUser,
    models::{
        Caller, CreateTaskRequest, CreateTaskResponse, EditRolesRequest, ProjectUserEntry,
        ProjectUsersResponse, RoleItem, RolesResponse, UserDetailResponse,
    },
};

/// Task type whose blacklist governs who may be seen and managed.
const MANAGE_TASK_TYPE: &str = "edit_roles";
const INVITE_TASK_TYPE: &str = "invite_user";

#[derive(Debug, Clone, Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

fn target_project(caller: &Caller, requested: Option<String>) -> String {
    requested
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| caller.project_id.clone())
}

async fn role_names(
    engine: &TaskEngine,
    user_id: &str,
    project_id: &str,
) -> Result<Vec<String>, AppError> {
    let mut names: Vec<String> = engine
        .gateway()
        .get_roles(user_id, project_id)
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    Ok(names)
}

/// Members of the project plus not yet materialized invitees.
pub async fn list_project_users(
    engine: &TaskEngine,
    caller: &Caller,
    project_id: Option<String>,
) -> Result<ProjectUsersResponse, AppError> {
    let project_id = target_project(caller, project_id);
    engine.policy().ensure_mod_or_owner(caller, &project_id)?;

    let mut users = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for user in engine.gateway().list_users(&project_id).await? {
        let roles = role_names(engine, &user.id, &project_id).await?;
        seen.insert(user.name.clone());
        seen.insert(user.email.clone());
        if engine.policy().is_blacklisted(MANAGE_TASK_TYPE, &roles) {
            continue;
        }
        users.push(ProjectUserEntry {
            id: user.id,
            name: user.name,
            email: user.email,
            roles,
            status: "Active".to_string(),
        });
    }

    for view in engine.open_tasks(&project_id, INVITE_TASK_TYPE).await? {
        let data = view.task_data();
        let Some(email) = data.get("email").and_then(Value::as_str) else {
            continue;
        };
        if seen.contains(email) {
            continue;
        }
        let roles: Vec<String> = data
            .get("roles")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if engine.policy().is_blacklisted(MANAGE_TASK_TYPE, &roles) {
            continue;
        }
        seen.insert(email.to_string());
        users.push(ProjectUserEntry {
            id: view.task.id.clone(),
            name: email.to_string(),
            email: email.to_string(),
            roles,
            status: view.status.label().to_string(),
        });
    }

    Ok(ProjectUsersResponse { users })
}

/// A user visible to the caller in the project, or a generic not found.
async fn visible_user(
    engine: &TaskEngine,
    caller: &Caller,
    user_id: &str,
    project_id: &str,
) -> Result<(IdentityUser, Vec<String>), AppError> {
    engine.policy().ensure_mod_or_owner(caller, project_id)?;
    let user = engine.gateway().get_user(user_id).await?;
    let roles = role_names(engine, user_id, project_id).await?;
    if roles.is_empty() || engine.policy().is_blacklisted(MANAGE_TASK_TYPE, &roles) {
        return Err(AppError::NotFound("no such resource".to_string()));
    }
    Ok((user, roles))
}

pub async fn get_project_user(
    engine: &TaskEngine,
    caller: &Caller,
    user_id: &str,
    project_id: Option<String>,
) -> Result<UserDetailResponse, AppError> {
    let project_id = target_project(caller, project_id);
    let (user, roles) = visible_user(engine, caller, user_id, &project_id).await?;
    Ok(UserDetailResponse {
        id: user.id,
        username: user.name,
        email: user.email,
        roles,
    })
}

/// Only pending invites can be deleted; real accounts lose access by having
/// their roles revoked. Ids matching neither are not found.
pub async fn delete_project_user(
    engine: &TaskEngine,
    caller: &Caller,
    user_id: &str,
    project_id: Option<String>,
) -> Result<Value, AppError> {
    let project_id = target_project(caller, project_id);
    engine.policy().ensure_mod_or_owner(caller, &project_id)?;

    let invite = engine
        .open_tasks(&project_id, INVITE_TASK_TYPE)
        .await?
        .into_iter()
        .find(|view| view.task.id == user_id);

    match invite {
        Some(view) => {
            engine
                .cancel(caller, &view.task.id, Some("invite revoked".to_string()))
                .await?;
            info!(task_id = %view.task.id, project_id, "pending invite revoked");
            Ok(json!({"notes": ["invite cancelled"]}))
        }
        None => {
            engine.gateway().get_user(user_id).await?;
            Err(AppError::NotImplemented(
                "removing users is not supported; revoke their roles instead".to_string(),
            ))
        }
    }
}

pub async fn get_user_roles(
    engine: &TaskEngine,
    caller: &Caller,
    user_id: &str,
    project_id: Option<String>,
) -> Result<RolesResponse, AppError> {
    let project_id = target_project(caller, project_id);
    visible_user(engine, caller, user_id, &project_id).await?;

    let mut roles = Vec::new();
    for role in engine.gateway().get_roles(user_id, &project_id).await? {
        roles.push(RoleItem {
            id: role.id,
            name: role.name,
        });
    }
    roles.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(RolesResponse { roles })
}

pub async fn edit_user_roles(
    engine: &TaskEngine,
    caller: &Caller,
    user_id: &str,
    request: EditRolesRequest,
    remove: bool,
) -> Result<CreateTaskResponse, AppError> {
    let project_id = target_project(caller, request.project_id);
    engine
        .submit_request(
            Some(caller),
            CreateTaskRequest {
                task_type: MANAGE_TASK_TYPE.to_string(),
                project_id: Some(project_id),
                data: json!({"user_id": user_id, "roles": request.roles, "remove": remove}),
            },
        )
        .await
}

/// Roles the caller may hand out, resolved against the identity provider.
pub async fn manageable_roles(engine: &TaskEngine, caller: &Caller) -> Result<RolesResponse, AppError> {
    let names = engine
        .policy()
        .manageable_roles(&caller.roles, MANAGE_TASK_TYPE);

    let mut roles = Vec::with_capacity(names.len());
    for name in names {
        if let Some(role) = engine.gateway().find_role(&name).await? {
            roles.push(RoleItem {
                id: role.id,
                name: role.name,
            });
        }
    }
    Ok(RolesResponse { roles })
}

pub async fn invite_user(
    engine: &TaskEngine,
    caller: &Caller,
    request: InviteRequest,
) -> Result<CreateTaskResponse, AppError> {
    let project_id = target_project(caller, request.project_id);
    engine
        .submit_request(
            Some(caller),
            CreateTaskRequest {
                task_type: INVITE_TASK_TYPE.to_string(),
                project_id: Some(project_id),
                data: json!({"email": request.email, "roles": request.roles}),
            },
        )
        .await
}

pub const PASSWORD_RESET_MESSAGE: &str =
    "If the user exists, an email has been sent with instructions to reset the password.";

/// Answers the same way whether or not the address belongs to anyone.
pub async fn request_password_reset(engine: &TaskEngine, request: EmailRequest) -> Value {
    let result = engine
        .submit_request(
            None,
            CreateTaskRequest {
                task_type: "reset_password".to_string(),
                project_id: None,
                data: json!({"email": request.email}),
            },
        )
        .await;
    if let Err(err) = result {
        info!(error = %err, "password reset request not actioned");
    }
    json!({"notes": [PASSWORD_RESET_MESSAGE]})
}

/// Administrator forced reset: current credentials stop working once confirmed.
pub async fn force_password_reset(
    engine: &TaskEngine,
    caller: &Caller,
    request: EmailRequest,
) -> Result<CreateTaskResponse, AppError> {
    engine
        .submit_request(
            Some(caller),
            CreateTaskRequest {
                task_type: "force_password".to_string(),
                project_id: None,
                data: json!({"email": request.email}),
            },
        )
        .await
}
