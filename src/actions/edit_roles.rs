use async_trait::async_trait;

use super::{
    ActionContext, ActionError, ActionHandler, ActionOutcome, check_manageable,
    check_roles_exist,
};

/// Grants (`remove = false`) or revokes (`remove = true`) roles for one user on
/// one project. Already being in the requested state is a success.
pub struct EditUserRoles;

impl EditUserRoles {
    async fn current_roles(
        ctx: &ActionContext<'_>,
        user_id: &str,
        project_id: &str,
    ) -> Result<Vec<String>, ActionError> {
        Ok(ctx
            .gateway
            .get_roles(user_id, project_id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }
}

#[async_trait]
impl ActionHandler for EditUserRoles {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let user_id = ctx.str_field("user_id")?;
        let project_id = ctx.str_field("project_id")?;
        let roles = ctx.roles_field("roles");

        ctx.gateway.get_user(user_id).await?;
        check_manageable(ctx, &roles)?;
        check_roles_exist(ctx, &roles).await?;

        let current = Self::current_roles(ctx, user_id, project_id).await?;
        if ctx.policy.is_blacklisted(ctx.task_type, &current) {
            return Err(ActionError::Forbidden(
                "user holds a role that cannot be managed here".to_string(),
            ));
        }
        Ok(())
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let user_id = ctx.str_field("user_id")?;
        let project_id = ctx.str_field("project_id")?;
        let roles = ctx.roles_field("roles");
        let remove = ctx.bool_field("remove");

        let current = Self::current_roles(ctx, user_id, project_id).await?;
        let pending: Vec<&String> = roles
            .iter()
            .filter(|r| current.contains(r) == remove)
            .collect();

        if pending.is_empty() {
            return Ok(ActionOutcome::Skipped(
                "roles already in the requested state".to_string(),
            ));
        }

        let mut notes = Vec::with_capacity(pending.len());
        for role in pending {
            if remove {
                ctx.gateway.revoke_role(user_id, project_id, role).await?;
                notes.push(format!("revoked {role} on {project_id}"));
            } else {
                ctx.gateway.grant_role(user_id, project_id, role).await?;
                notes.push(format!("granted {role} on {project_id}"));
            }
        }
        Ok(ActionOutcome::Succeeded(notes))
    }
}
