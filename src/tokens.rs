use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::info;

use crate::{
    db::{new_id, random_token, sha256_hex},
    error::AppError,
    models::TokenRecord,
};

/// A freshly issued token. The secret exists only here; storage keeps its hash.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub secret: String,
    pub record: TokenRecord,
}

#[derive(Clone, Debug)]
pub struct TokenManager {
    db: SqlitePool,
}

impl TokenManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Supersedes any open token of the task, then creates the new one.
    pub async fn issue(&self, task_id: &str, ttl_seconds: i64) -> Result<IssuedToken, AppError> {
        let now = Utc::now();
        let secret = random_token(32);
        let record = TokenRecord {
            id: new_id("tok"),
            task_id: task_id.to_string(),
            expires_at: now + Duration::seconds(ttl_seconds.max(0)),
            consumed_at: None,
            revoked_at: None,
            created_at: now,
        };

        let mut tx = self.db.begin().await?;

        let superseded = sqlx::query(
            r#"
            UPDATE task_tokens
            SET revoked_at = ?1
            WHERE task_id = ?2
              AND consumed_at IS NULL
              AND revoked_at IS NULL
            "#,
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO task_tokens (
              id,
              task_id,
              token_hash,
              expires_at,
              consumed_at,
              revoked_at,
              created_at
            ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)
            "#,
        )
        .bind(&record.id)
        .bind(task_id)
        .bind(sha256_hex(&secret))
        .bind(record.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(task_id, token_id = %record.id, superseded, "issued task token");
        Ok(IssuedToken { secret, record })
    }

    /// Resolves a presented secret without changing anything.
    pub async fn lookup(&self, secret: &str) -> Result<TokenRecord, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, expires_at, consumed_at, revoked_at, created_at
            FROM task_tokens
            WHERE token_hash = ?1
            "#,
        )
        .bind(sha256_hex(secret))
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::TokenNotFound)?;

        token_from_row(&row)
    }

    /// Checks the token is still usable right now.
    pub fn ensure_usable(record: &TokenRecord, now: DateTime<Utc>) -> Result<(), AppError> {
        if record.consumed_at.is_some() {
            return Err(AppError::TokenAlreadyUsed);
        }
        if record.revoked_at.is_some() {
            return Err(AppError::TokenNotFound);
        }
        if now >= record.expires_at {
            return Err(AppError::TokenExpired);
        }
        Ok(())
    }

    /// Marks the token consumed. Of any number of concurrent claims on one
    /// secret exactly one succeeds.
    pub async fn claim(&self, secret: &str) -> Result<TokenRecord, AppError> {
        let now = Utc::now();
        let token_hash = sha256_hex(secret);

        let claimed = sqlx::query(
            r#"
            UPDATE task_tokens
            SET consumed_at = ?1
            WHERE token_hash = ?2
              AND consumed_at IS NULL
              AND revoked_at IS NULL
              AND expires_at > ?1
            "#,
        )
        .bind(now)
        .bind(&token_hash)
        .execute(&self.db)
        .await?
        .rows_affected();

        let record = self.lookup(secret).await?;
        if claimed == 1 {
            info!(task_id = %record.task_id, token_id = %record.id, "token consumed");
            return Ok(record);
        }

        Self::ensure_usable(&record, now)?;
        // Guard failed yet the row looks usable: only a concurrent claim explains it.
        Err(AppError::TokenAlreadyUsed)
    }

    pub async fn tokens_for(&self, task_id: &str) -> Result<Vec<TokenRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, expires_at, consumed_at, revoked_at, created_at
            FROM task_tokens
            WHERE task_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(token_from_row).collect()
    }
}

fn token_from_row(row: &SqliteRow) -> Result<TokenRecord, AppError> {
    Ok(TokenRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
        revoked_at: row.try_get("revoked_at")?,
        created_at: row.try_get("created_at")?,
    })
}
