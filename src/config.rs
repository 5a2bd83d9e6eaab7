use std::{collections::HashMap, env, fs, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub base_url: String,
    pub token_ttl_seconds: i64,
    pub stale_execution_seconds: i64,
    pub mail_relay_url: Option<String>,
    pub mail_relay_secret: String,
    pub delivery_max_retries: u32,
    pub delivery_batch_size: u32,
    pub delivery_worker_interval_secs: u64,
    pub identity_fixture_path: Option<String>,
    pub engine: Arc<EngineSettings>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let engine = match env::var("ENGINE_SETTINGS_PATH").ok() {
            Some(path) => EngineSettings::from_file(&path)?,
            None => EngineSettings::default(),
        };

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/stacktask.db".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-change-me".to_string()),
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "identity".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "stacktask".to_string()),
            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            token_ttl_seconds: env::var("TOKEN_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24 * 3600),
            stale_execution_seconds: env::var("STALE_EXECUTION_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            mail_relay_url: env::var("MAIL_RELAY_URL").ok().filter(|v| !v.trim().is_empty()),
            mail_relay_secret: env::var("MAIL_RELAY_SECRET")
                .unwrap_or_else(|_| "dev-change-me".to_string()),
            delivery_max_retries: env::var("DELIVERY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            delivery_batch_size: env::var("DELIVERY_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            delivery_worker_interval_secs: env::var("DELIVERY_WORKER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            identity_fixture_path: env::var("IDENTITY_FIXTURE_PATH").ok(),
            engine: Arc::new(engine),
        })
    }

    /// Local defaults pointed at `database_url`. Used by tooling and tests.
    pub fn for_database(database_url: String) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            database_url,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "identity".to_string(),
            jwt_audience: "stacktask".to_string(),
            base_url: "http://localhost:8080".to_string(),
            token_ttl_seconds: 24 * 3600,
            stale_execution_seconds: 900,
            mail_relay_url: None,
            mail_relay_secret: "test-relay-secret".to_string(),
            delivery_max_retries: 5,
            delivery_batch_size: 50,
            delivery_worker_interval_secs: 1,
            identity_fixture_path: None,
            engine: Arc::new(EngineSettings::default()),
        }
    }

    /// Token lifetime for a task type, falling back to the global default.
    pub fn token_ttl_for(&self, task_type: &str) -> i64 {
        self.engine
            .task_settings(task_type)
            .token_ttl_seconds
            .unwrap_or(self.token_ttl_seconds)
    }
}

/// Per task type overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default)]
    pub role_blacklist: Vec<String>,
    #[serde(default)]
    pub auto_approve: Option<bool>,
    #[serde(default)]
    pub token_ttl_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultUser {
    pub name: String,
    pub roles: Vec<String>,
}

/// Immutable engine policy. Loaded once at startup and shared read-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub task_settings: HashMap<String, TaskSettings>,
    /// Caller role -> roles that caller may grant or revoke.
    #[serde(default = "default_role_mapping")]
    pub role_mapping: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub default_users: Vec<DefaultUser>,
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    #[serde(default = "default_mod_or_owner_roles")]
    pub mod_or_owner_roles: Vec<String>,
}

impl EngineSettings {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine settings from {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid engine settings in {path}"))
    }

    pub fn task_settings(&self, task_type: &str) -> TaskSettings {
        self.task_settings.get(task_type).cloned().unwrap_or_default()
    }

    pub fn role_blacklist(&self, task_type: &str) -> &[String] {
        self.task_settings
            .get(task_type)
            .map(|s| s.role_blacklist.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let mut task_settings = HashMap::new();
        for task_type in ["edit_roles", "invite_user"] {
            task_settings.insert(
                task_type.to_string(),
                TaskSettings {
                    role_blacklist: vec!["admin".to_string()],
                    ..TaskSettings::default()
                },
            );
        }

        Self {
            task_settings,
            role_mapping: default_role_mapping(),
            default_users: Vec::new(),
            admin_role: default_admin_role(),
            mod_or_owner_roles: default_mod_or_owner_roles(),
        }
    }
}

fn default_role_mapping() -> HashMap<String, Vec<String>> {
    let member_roles = ["project_admin", "project_mod", "_member_", "heat_stack_owner"];
    let mut mapping = HashMap::new();
    mapping.insert(
        "admin".to_string(),
        member_roles.iter().map(|r| r.to_string()).collect(),
    );
    mapping.insert(
        "project_admin".to_string(),
        member_roles.iter().map(|r| r.to_string()).collect(),
    );
    mapping.insert(
        "project_mod".to_string(),
        ["project_mod", "_member_", "heat_stack_owner"]
            .iter()
            .map(|r| r.to_string())
            .collect(),
    );
    mapping
}

fn default_admin_role() -> String {
    "admin".to_string()
}

fn default_mod_or_owner_roles() -> Vec<String> {
    vec!["project_admin".to_string(), "project_mod".to_string()]
}
