use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{info, warn};

use crate::{db::new_id, error::AppError, models::NotificationRecord};

/// Append-only audit trail of events and errors per task.
#[derive(Clone, Debug)]
pub struct NotificationSink {
    db: SqlitePool,
}

impl NotificationSink {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        task_id: &str,
        message: &str,
        error: bool,
        details: Value,
    ) -> Result<NotificationRecord, AppError> {
        let record = NotificationRecord {
            id: new_id("ntf"),
            task_id: task_id.to_string(),
            error,
            message: message.to_string(),
            details,
            acknowledged: false,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO task_notifications (
              id,
              task_id,
              error,
              message,
              details_json,
              acknowledged,
              created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            "#,
        )
        .bind(&record.id)
        .bind(task_id)
        .bind(error)
        .bind(message)
        .bind(record.details.to_string())
        .bind(record.created_at)
        .execute(&self.db)
        .await?;

        if error {
            warn!(task_id, notification_id = %record.id, message, "task error recorded");
        } else {
            info!(task_id, notification_id = %record.id, message, "task event recorded");
        }
        Ok(record)
    }

    pub async fn list_for(&self, task_id: &str) -> Result<Vec<NotificationRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, error, message, details_json, acknowledged, created_at
            FROM task_notifications
            WHERE task_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(notification_from_row).collect()
    }

    pub async fn errors_for(&self, task_id: &str) -> Result<Vec<NotificationRecord>, AppError> {
        Ok(self
            .list_for(task_id)
            .await?
            .into_iter()
            .filter(|n| n.error)
            .collect())
    }

    /// All notifications, newest first, optionally filtered by acknowledgement.
    pub async fn list(&self, acknowledged: Option<bool>) -> Result<Vec<NotificationRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, error, message, details_json, acknowledged, created_at
            FROM task_notifications
            WHERE ?1 IS NULL OR acknowledged = ?1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(acknowledged)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(notification_from_row).collect()
    }

    pub async fn acknowledge(&self, notification_id: &str) -> Result<NotificationRecord, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE task_notifications
            SET acknowledged = 1
            WHERE id = ?1
            "#,
        )
        .bind(notification_id)
        .execute(&self.db)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::NotFound("notification not found".to_string()));
        }

        let row = sqlx::query(
            r#"
            SELECT id, task_id, error, message, details_json, acknowledged, created_at
            FROM task_notifications
            WHERE id = ?1
            "#,
        )
        .bind(notification_id)
        .fetch_one(&self.db)
        .await?;
        notification_from_row(&row)
    }

    /// Clears the failed status of a task ahead of a retry.
    pub async fn acknowledge_errors_for_task(&self, task_id: &str) -> Result<u64, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE task_notifications
            SET acknowledged = 1
            WHERE task_id = ?1
              AND error = 1
              AND acknowledged = 0
            "#,
        )
        .bind(task_id)
        .execute(&self.db)
        .await?
        .rows_affected();
        Ok(updated)
    }
}

fn notification_from_row(row: &SqliteRow) -> Result<NotificationRecord, AppError> {
    let details_json: String = row.try_get("details_json")?;
    Ok(NotificationRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        error: row.try_get("error")?,
        message: row.try_get("message")?,
        details: serde_json::from_str(&details_json).unwrap_or(Value::Null),
        acknowledged: row.try_get("acknowledged")?,
        created_at: row.try_get("created_at")?,
    })
}
