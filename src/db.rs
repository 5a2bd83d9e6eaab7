use std::{collections::BTreeMap, str::FromStr, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{SqlitePool, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions}};
use uuid::Uuid;

use crate::{config::Config, error::AppError};

pub async fn connect_and_bootstrap(config: &Config) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(AppError::internal)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    bootstrap_schema(&pool).await?;

    Ok(pool)
}

const SCHEMA_BOOTSTRAP_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
      id TEXT PRIMARY KEY,
      task_type TEXT NOT NULL,
      project_id TEXT,
      fingerprint TEXT NOT NULL,
      requested_by_json TEXT,
      approved INTEGER NOT NULL DEFAULT 0,
      executing INTEGER NOT NULL DEFAULT 0,
      executing_since DATETIME,
      completed INTEGER NOT NULL DEFAULT 0,
      cancelled INTEGER NOT NULL DEFAULT 0,
      approved_by TEXT,
      approved_at DATETIME,
      completed_at DATETIME,
      cancelled_at DATETIME,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL,
      CHECK (NOT (completed = 1 AND cancelled = 1))
    );",

    "CREATE TABLE IF NOT EXISTS task_actions (
      id TEXT PRIMARY KEY,
      task_id TEXT NOT NULL,
      position INTEGER NOT NULL,
      action_type TEXT NOT NULL,
      data_json TEXT NOT NULL,
      state TEXT NOT NULL,
      notes_json TEXT NOT NULL,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL,
      UNIQUE(task_id, position),
      FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    );",

    "CREATE TABLE IF NOT EXISTS task_tokens (
      id TEXT PRIMARY KEY,
      task_id TEXT NOT NULL,
      token_hash TEXT NOT NULL UNIQUE,
      expires_at DATETIME NOT NULL,
      consumed_at DATETIME,
      revoked_at DATETIME,
      created_at DATETIME NOT NULL,
      FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    );",

    "CREATE TABLE IF NOT EXISTS task_notifications (
      id TEXT PRIMARY KEY,
      task_id TEXT NOT NULL,
      error INTEGER NOT NULL,
      message TEXT NOT NULL,
      details_json TEXT NOT NULL,
      acknowledged INTEGER NOT NULL DEFAULT 0,
      created_at DATETIME NOT NULL,
      FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    );",

    "CREATE TABLE IF NOT EXISTS email_outbox (
      id TEXT PRIMARY KEY,
      task_id TEXT NOT NULL,
      recipient TEXT NOT NULL,
      template TEXT NOT NULL,
      payload_json TEXT NOT NULL,
      attempt_count INTEGER NOT NULL,
      next_attempt_at DATETIME,
      last_status INTEGER,
      last_error TEXT,
      delivered_at DATETIME,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL,
      FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    );",

    "CREATE INDEX IF NOT EXISTS idx_tasks_pending
      ON tasks(project_id, task_type, completed, cancelled);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_open_fingerprint
      ON tasks(fingerprint) WHERE completed = 0 AND cancelled = 0;",
    "CREATE INDEX IF NOT EXISTS idx_task_actions_task
      ON task_actions(task_id, position);",
    "CREATE INDEX IF NOT EXISTS idx_task_tokens_task
      ON task_tokens(task_id, consumed_at, revoked_at);",
    "CREATE INDEX IF NOT EXISTS idx_task_notifications_task
      ON task_notifications(task_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_email_outbox_due
      ON email_outbox(next_attempt_at, delivered_at);",
];

async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), AppError> {
    for statement in SCHEMA_BOOTSTRAP_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sha256_hex_bytes(value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value);
    hex::encode(hasher.finalize())
}

pub fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0_u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn utc_now() -> chrono::DateTime<Utc> {
    Utc::now()
}

/// Hash of a JSON value that ignores object key order.
pub fn canonical_fingerprint(value: &Value) -> Result<String, AppError> {
    let canonical = canonicalize_json(value);
    let bytes = serde_json::to_vec(&canonical).map_err(AppError::internal)?;
    Ok(sha256_hex_bytes(&bytes))
}

fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> = map
                .iter()
                .map(|(k, v)| (k, canonicalize_json(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}
