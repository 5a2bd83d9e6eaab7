use std::{collections::BTreeSet, sync::Arc};

use crate::{
    catalog::Access,
    config::EngineSettings,
    error::AppError,
    models::Caller,
};

/// Role based authorization decisions, driven entirely by the immutable
/// engine settings it was built with.
#[derive(Clone, Debug)]
pub struct AuthorizationPolicy {
    settings: Arc<EngineSettings>,
}

impl AuthorizationPolicy {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        Self { settings }
    }

    pub fn is_admin(&self, caller: &Caller) -> bool {
        caller.roles.iter().any(|r| *r == self.settings.admin_role)
    }

    /// Admins anywhere, or a moderator/owner of `project_id` itself.
    pub fn is_mod_or_owner(&self, caller: &Caller, project_id: &str) -> bool {
        if self.is_admin(caller) {
            return true;
        }
        caller.project_id == project_id
            && caller
                .roles
                .iter()
                .any(|r| self.settings.mod_or_owner_roles.contains(r))
    }

    pub fn ensure_admin(&self, caller: &Caller) -> Result<(), AppError> {
        if self.is_admin(caller) {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin role required".to_string()))
        }
    }

    pub fn ensure_mod_or_owner(&self, caller: &Caller, project_id: &str) -> Result<(), AppError> {
        if self.is_mod_or_owner(caller, project_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "project moderator or owner role required".to_string(),
            ))
        }
    }

    /// Checks the access level a task type demands of whoever creates it.
    pub fn ensure_access(
        &self,
        access: Access,
        caller: Option<&Caller>,
        project_id: Option<&str>,
    ) -> Result<(), AppError> {
        match access {
            Access::Public => Ok(()),
            Access::Admin => {
                let caller = require_caller(caller)?;
                self.ensure_admin(caller)
            }
            Access::ModOrOwner => {
                let caller = require_caller(caller)?;
                let project_id = project_id
                    .ok_or_else(|| AppError::field("project_id", "This field is required."))?;
                self.ensure_mod_or_owner(caller, project_id)
            }
        }
    }

    /// Every role the caller's own roles allow it to hand out, minus the
    /// task type's blacklist.
    pub fn manageable_roles(&self, caller_roles: &[String], task_type: &str) -> BTreeSet<String> {
        let blacklist = self.settings.role_blacklist(task_type);
        caller_roles
            .iter()
            .filter_map(|role| self.settings.role_mapping.get(role))
            .flatten()
            .filter(|role| !blacklist.contains(role))
            .cloned()
            .collect()
    }

    /// The subset of `target_roles` the caller may grant or revoke.
    pub fn can_manage(
        &self,
        caller_roles: &[String],
        target_roles: &[String],
        task_type: &str,
    ) -> BTreeSet<String> {
        let manageable = self.manageable_roles(caller_roles, task_type);
        target_roles
            .iter()
            .filter(|role| manageable.contains(*role))
            .cloned()
            .collect()
    }

    pub fn is_blacklisted(&self, task_type: &str, roles: &[String]) -> bool {
        let blacklist = self.settings.role_blacklist(task_type);
        roles.iter().any(|r| blacklist.contains(r))
    }
}

pub fn require_caller(caller: Option<&Caller>) -> Result<&Caller, AppError> {
    caller.ok_or_else(|| AppError::Unauthorized("authentication required".to_string()))
}
