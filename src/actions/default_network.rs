use async_trait::async_trait;

use super::{ActionContext, ActionError, ActionHandler, ActionOutcome};
use crate::identity::GatewayError;

async fn ensure_project(ctx: &ActionContext<'_>, project_id: &str) -> Result<(), ActionError> {
    match ctx.gateway.get_project(project_id).await {
        Ok(_) => Ok(()),
        Err(GatewayError::NotFound(_)) => {
            Err(ActionError::field("project_id", "Project does not exist."))
        }
        Err(err) => Err(err.into()),
    }
}

fn task_project<'a>(ctx: &ActionContext<'a>) -> Result<&'a str, ActionError> {
    ctx.project_id
        .ok_or_else(|| ActionError::field("project_id", "This field is required."))
}

async fn setup_network(
    ctx: &ActionContext<'_>,
    project_id: &str,
) -> Result<ActionOutcome, ActionError> {
    if !ctx.bool_field("setup_network") {
        return Ok(ActionOutcome::Skipped("network setup not requested".to_string()));
    }
    let region = ctx.str_field("region")?;
    if let Some(existing) = ctx.gateway.get_default_network(project_id, region).await? {
        return Ok(ActionOutcome::Skipped(format!(
            "default network {existing} already present in {region}"
        )));
    }
    let network_id = ctx.gateway.create_default_network(project_id, region).await?;
    Ok(ActionOutcome::Succeeded(vec![format!(
        "created default network {network_id} in {region}"
    )]))
}

/// Default network for a newly signed up project named in the action data.
pub struct NewDefaultNetwork;

#[async_trait]
impl ActionHandler for NewDefaultNetwork {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let project_id = ctx.str_field("project_id")?;
        ctx.str_field("region")?;
        ensure_project(ctx, project_id).await
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project_id = ctx.str_field("project_id")?;
        setup_network(ctx, project_id).await
    }
}

/// Default network for the task's own, already existing project.
pub struct NewProjectDefaultNetwork;

#[async_trait]
impl ActionHandler for NewProjectDefaultNetwork {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let project_id = task_project(ctx)?;
        ctx.str_field("region")?;
        ensure_project(ctx, project_id).await
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project_id = task_project(ctx)?;
        setup_network(ctx, project_id).await
    }
}

/// Gives the configured default users their roles on the task's project.
pub struct AddDefaultUsersToProject;

#[async_trait]
impl ActionHandler for AddDefaultUsersToProject {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let project_id = task_project(ctx)?;
        ensure_project(ctx, project_id).await?;
        for default_user in &ctx.settings.default_users {
            if ctx.gateway.find_user(&default_user.name).await?.is_none() {
                return Err(ActionError::field(
                    "default_users",
                    format!("Default user {} does not exist.", default_user.name),
                ));
            }
            super::check_roles_exist(ctx, &default_user.roles).await?;
        }
        Ok(())
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project_id = task_project(ctx)?;
        let mut notes = Vec::new();
        for default_user in &ctx.settings.default_users {
            let user = ctx
                .gateway
                .find_user(&default_user.name)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("user {}", default_user.name)))?;
            let current: Vec<String> = ctx
                .gateway
                .get_roles(&user.id, project_id)
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect();
            for role in default_user.roles.iter().filter(|r| !current.contains(r)) {
                ctx.gateway.grant_role(&user.id, project_id, role).await?;
                notes.push(format!("granted {role} to {} on {project_id}", default_user.name));
            }
        }
        if notes.is_empty() {
            return Ok(ActionOutcome::Skipped(
                "default users already hold their roles".to_string(),
            ));
        }
        Ok(ActionOutcome::Succeeded(notes))
    }
}
