use async_trait::async_trait;

use super::{
    ActionContext, ActionError, ActionHandler, ActionOutcome, check_manageable,
    check_roles_exist,
};
use crate::identity::GatewayError;

/// Brings a person into a project by email, creating the account on first
/// confirmation and granting whichever requested roles are missing.
pub struct InviteUser;

#[async_trait]
impl ActionHandler for InviteUser {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let email = ctx.str_field("email")?;
        let project_id = ctx.str_field("project_id")?;
        let roles = ctx.roles_field("roles");

        check_manageable(ctx, &roles)?;
        check_roles_exist(ctx, &roles).await?;

        match ctx.gateway.get_project(project_id).await {
            Ok(_) => {}
            Err(GatewayError::NotFound(_)) => {
                return Err(ActionError::field("project_id", "Project does not exist."));
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(user) = ctx.gateway.find_user(email).await? {
            let current: Vec<String> = ctx
                .gateway
                .get_roles(&user.id, project_id)
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect();
            if ctx.policy.is_blacklisted(ctx.task_type, &current) {
                return Err(ActionError::Forbidden(
                    "user holds a role that cannot be managed here".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let email = ctx.str_field("email")?;
        let project_id = ctx.str_field("project_id")?;
        let roles = ctx.roles_field("roles");
        let mut notes = Vec::new();

        let user = match ctx.gateway.find_user(email).await? {
            Some(user) => user,
            None => {
                let password = ctx
                    .confirmation_str("password")
                    .ok_or_else(|| ActionError::field("password", "This field is required."))?;
                let user = ctx
                    .gateway
                    .create_user(email, email, password, project_id)
                    .await?;
                notes.push(format!("created user {}", user.id));
                user
            }
        };

        let current: Vec<String> = ctx
            .gateway
            .get_roles(&user.id, project_id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let missing: Vec<&String> = roles.iter().filter(|r| !current.contains(r)).collect();
        if missing.is_empty() && notes.is_empty() {
            return Ok(ActionOutcome::Skipped(format!(
                "user {} already holds every requested role",
                user.id
            )));
        }
        for role in missing {
            ctx.gateway.grant_role(&user.id, project_id, role).await?;
            notes.push(format!("granted {role} on {project_id}"));
        }
        Ok(ActionOutcome::Succeeded(notes))
    }
}
