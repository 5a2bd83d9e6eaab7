use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    sync::Mutex,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::new_id;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transient: {0}")]
    Transient(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProject {
    pub id: String,
    pub name: String,
    #[serde(default = "default_domain")]
    pub domain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRole {
    pub id: String,
    pub name: String,
}

fn default_enabled() -> bool {
    true
}

fn default_domain() -> String {
    "default".to_string()
}

/// Capabilities the engine needs from the identity provider.
///
/// Every call goes to the system of record; implementations must not answer
/// role queries from a cache that outlives a single request.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn get_user(&self, user_id: &str) -> GatewayResult<IdentityUser>;

    async fn find_user(&self, name: &str) -> GatewayResult<Option<IdentityUser>>;

    async fn get_project(&self, project_id: &str) -> GatewayResult<IdentityProject>;

    async fn list_users(&self, project_id: &str) -> GatewayResult<Vec<IdentityUser>>;

    async fn get_roles(&self, user_id: &str, project_id: &str) -> GatewayResult<Vec<IdentityRole>>;

    async fn find_role(&self, name: &str) -> GatewayResult<Option<IdentityRole>>;

    async fn grant_role(&self, user_id: &str, project_id: &str, role_name: &str) -> GatewayResult<()>;

    async fn revoke_role(&self, user_id: &str, project_id: &str, role_name: &str) -> GatewayResult<()>;

    async fn create_user(
        &self,
        name: &str,
        email: &str,
        password: &str,
        default_project_id: &str,
    ) -> GatewayResult<IdentityUser>;

    async fn reset_credential(&self, user_id: &str, password: &str) -> GatewayResult<()>;

    /// Invalidates every current credential of the user.
    async fn force_reset_credential(&self, user_id: &str) -> GatewayResult<()>;

    async fn get_default_network(&self, project_id: &str, region: &str) -> GatewayResult<Option<String>>;

    async fn create_default_network(&self, project_id: &str, region: &str) -> GatewayResult<String>;
}

/// Seed data for [`InMemoryIdentity`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFixture {
    #[serde(default)]
    pub users: Vec<IdentityUser>,
    #[serde(default)]
    pub projects: Vec<IdentityProject>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// (user id, project id, role name)
    #[serde(default)]
    pub grants: Vec<(String, String, String)>,
}

#[derive(Debug, Default)]
struct Directory {
    users: HashMap<String, IdentityUser>,
    projects: HashMap<String, IdentityProject>,
    roles: HashMap<String, IdentityRole>,
    grants: BTreeSet<(String, String, String)>,
    passwords: HashMap<String, String>,
    networks: HashMap<(String, String), String>,
    failures: HashMap<String, GatewayError>,
    calls: Vec<String>,
}

/// Process-local identity provider used when no remote backend is wired in,
/// and by the test suite. Records every mutating call for inspection.
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    inner: Mutex<Directory>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: IdentityFixture) -> Self {
        let identity = Self::new();
        for project in fixture.projects {
            identity.add_project(&project.id, &project.name);
        }
        for role in fixture.roles {
            identity.add_role(&role);
        }
        for user in fixture.users {
            identity.lock().users.insert(user.id.clone(), user);
        }
        for (user_id, project_id, role) in fixture.grants {
            identity.add_grant(&user_id, &project_id, &role);
        }
        identity
    }

    pub fn from_fixture_file(path: &str) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read identity fixture {path}"))?;
        let fixture: IdentityFixture =
            serde_json::from_str(&raw).with_context(|| format!("invalid identity fixture {path}"))?;
        Ok(Self::from_fixture(fixture))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Directory> {
        // A poisoned directory is still consistent: every mutation is a single insert/remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_project(&self, id: &str, name: &str) {
        self.lock().projects.insert(
            id.to_string(),
            IdentityProject {
                id: id.to_string(),
                name: name.to_string(),
                domain_id: default_domain(),
            },
        );
    }

    pub fn add_role(&self, name: &str) {
        self.lock().roles.insert(
            name.to_string(),
            IdentityRole {
                id: format!("role-{name}"),
                name: name.to_string(),
            },
        );
    }

    pub fn add_user(&self, id: &str, name: &str, email: &str) {
        self.lock().users.insert(
            id.to_string(),
            IdentityUser {
                id: id.to_string(),
                name: name.to_string(),
                email: email.to_string(),
                enabled: true,
            },
        );
    }

    pub fn add_grant(&self, user_id: &str, project_id: &str, role: &str) {
        self.lock()
            .grants
            .insert((user_id.to_string(), project_id.to_string(), role.to_string()));
    }

    pub fn has_grant(&self, user_id: &str, project_id: &str, role: &str) -> bool {
        self.lock()
            .grants
            .contains(&(user_id.to_string(), project_id.to_string(), role.to_string()))
    }

    pub fn password_of(&self, user_id: &str) -> Option<String> {
        self.lock().passwords.get(user_id).cloned()
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &str, error: GatewayError) {
        self.lock().failures.insert(operation.to_string(), error);
    }

    /// Mutating calls made so far, formatted as `operation:arg,arg`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn check(dir: &mut Directory, operation: &str) -> GatewayResult<()> {
        match dir.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IdentityGateway for InMemoryIdentity {
    async fn get_user(&self, user_id: &str) -> GatewayResult<IdentityUser> {
        let mut dir = self.lock();
        Self::check(&mut dir, "get_user")?;
        dir.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("user {user_id}")))
    }

    async fn find_user(&self, name: &str) -> GatewayResult<Option<IdentityUser>> {
        let mut dir = self.lock();
        Self::check(&mut dir, "find_user")?;
        Ok(dir.users.values().find(|u| u.name == name).cloned())
    }

    async fn get_project(&self, project_id: &str) -> GatewayResult<IdentityProject> {
        let mut dir = self.lock();
        Self::check(&mut dir, "get_project")?;
        dir.projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("project {project_id}")))
    }

    async fn list_users(&self, project_id: &str) -> GatewayResult<Vec<IdentityUser>> {
        let mut dir = self.lock();
        Self::check(&mut dir, "list_users")?;
        if !dir.projects.contains_key(project_id) {
            return Err(GatewayError::NotFound(format!("project {project_id}")));
        }
        let member_ids: HashSet<&String> = dir
            .grants
            .iter()
            .filter(|(_, project, _)| project == project_id)
            .map(|(user, _, _)| user)
            .collect();
        let mut users: Vec<IdentityUser> = member_ids
            .into_iter()
            .filter_map(|id| dir.users.get(id).cloned())
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    async fn get_roles(&self, user_id: &str, project_id: &str) -> GatewayResult<Vec<IdentityRole>> {
        let mut dir = self.lock();
        Self::check(&mut dir, "get_roles")?;
        Ok(dir
            .grants
            .iter()
            .filter(|(user, project, _)| user == user_id && project == project_id)
            .map(|(_, _, role)| {
                dir.roles.get(role).cloned().unwrap_or_else(|| IdentityRole {
                    id: format!("role-{role}"),
                    name: role.clone(),
                })
            })
            .collect())
    }

    async fn find_role(&self, name: &str) -> GatewayResult<Option<IdentityRole>> {
        let mut dir = self.lock();
        Self::check(&mut dir, "find_role")?;
        Ok(dir.roles.get(name).cloned())
    }

    async fn grant_role(&self, user_id: &str, project_id: &str, role_name: &str) -> GatewayResult<()> {
        let mut dir = self.lock();
        Self::check(&mut dir, "grant_role")?;
        if !dir.roles.contains_key(role_name) {
            return Err(GatewayError::NotFound(format!("role {role_name}")));
        }
        dir.calls.push(format!("grant_role:{user_id},{project_id},{role_name}"));
        dir.grants
            .insert((user_id.to_string(), project_id.to_string(), role_name.to_string()));
        Ok(())
    }

    async fn revoke_role(&self, user_id: &str, project_id: &str, role_name: &str) -> GatewayResult<()> {
        let mut dir = self.lock();
        Self::check(&mut dir, "revoke_role")?;
        dir.calls.push(format!("revoke_role:{user_id},{project_id},{role_name}"));
        dir.grants
            .remove(&(user_id.to_string(), project_id.to_string(), role_name.to_string()));
        Ok(())
    }

    async fn create_user(
        &self,
        name: &str,
        email: &str,
        password: &str,
        default_project_id: &str,
    ) -> GatewayResult<IdentityUser> {
        let mut dir = self.lock();
        Self::check(&mut dir, "create_user")?;
        if let Some(existing) = dir.users.values().find(|u| u.name == name) {
            return Ok(existing.clone());
        }
        dir.calls.push(format!("create_user:{name},{default_project_id}"));
        let user = IdentityUser {
            id: new_id("user"),
            name: name.to_string(),
            email: email.to_string(),
            enabled: true,
        };
        dir.passwords.insert(user.id.clone(), password.to_string());
        dir.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn reset_credential(&self, user_id: &str, password: &str) -> GatewayResult<()> {
        let mut dir = self.lock();
        Self::check(&mut dir, "reset_credential")?;
        if !dir.users.contains_key(user_id) {
            return Err(GatewayError::NotFound(format!("user {user_id}")));
        }
        dir.calls.push(format!("reset_credential:{user_id}"));
        dir.passwords.insert(user_id.to_string(), password.to_string());
        Ok(())
    }

    async fn force_reset_credential(&self, user_id: &str) -> GatewayResult<()> {
        let mut dir = self.lock();
        Self::check(&mut dir, "force_reset_credential")?;
        if !dir.users.contains_key(user_id) {
            return Err(GatewayError::NotFound(format!("user {user_id}")));
        }
        dir.calls.push(format!("force_reset_credential:{user_id}"));
        dir.passwords.remove(user_id);
        Ok(())
    }

    async fn get_default_network(&self, project_id: &str, region: &str) -> GatewayResult<Option<String>> {
        let mut dir = self.lock();
        Self::check(&mut dir, "get_default_network")?;
        Ok(dir
            .networks
            .get(&(project_id.to_string(), region.to_string()))
            .cloned())
    }

    async fn create_default_network(&self, project_id: &str, region: &str) -> GatewayResult<String> {
        let mut dir = self.lock();
        Self::check(&mut dir, "create_default_network")?;
        dir.calls.push(format!("create_default_network:{project_id},{region}"));
        let network_id = new_id("net");
        dir.networks
            .insert((project_id.to_string(), region.to_string()), network_id.clone());
        Ok(network_id)
    }
}
