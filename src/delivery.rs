use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{db::new_id, error::AppError, models::EmailEnvelope, state::AppState};

type HmacSha256 = Hmac<Sha256>;

/// Queues an email for the delivery worker. Never contacts the relay itself.
pub async fn enqueue_token_email(
    db: &SqlitePool,
    task_id: &str,
    recipient: &str,
    template: &str,
    context: Value,
) -> Result<String, AppError> {
    let envelope = EmailEnvelope {
        message_id: new_id("msg"),
        recipient: recipient.to_string(),
        template: template.to_string(),
        task_id: task_id.to_string(),
        timestamp: Utc::now(),
        context,
    };
    let payload_json = serde_json::to_string(&envelope).map_err(AppError::internal)?;
    let outbox_id = new_id("mail");

    sqlx::query(
        r#"
        INSERT INTO email_outbox (
          id,
          task_id,
          recipient,
          template,
          payload_json,
          attempt_count,
          next_attempt_at,
          last_status,
          last_error,
          delivered_at,
          created_at,
          updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL, NULL, NULL, ?6, ?6)
        "#,
    )
    .bind(&outbox_id)
    .bind(task_id)
    .bind(recipient)
    .bind(template)
    .bind(payload_json)
    .bind(envelope.timestamp)
    .execute(db)
    .await?;

    info!(task_id, message_id = %envelope.message_id, template, "email queued");
    Ok(outbox_id)
}

pub fn start_delivery_worker(state: AppState) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = process_due_deliveries(&state).await {
                error!(error = %err, "email delivery iteration failed");
            }

            sleep(Duration::from_secs(
                state.config.delivery_worker_interval_secs,
            ))
            .await;
        }
    });
}

pub async fn process_due_deliveries(state: &AppState) -> Result<usize, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT id, task_id, payload_json, attempt_count
        FROM email_outbox
        WHERE delivered_at IS NULL
          AND next_attempt_at IS NOT NULL
          AND next_attempt_at <= ?1
        ORDER BY next_attempt_at ASC
        LIMIT ?2
        "#,
    )
    .bind(Utc::now())
    .bind(state.config.delivery_batch_size as i64)
    .fetch_all(&state.db)
    .await?;

    let mut delivered = 0;
    for row in rows {
        let outbox_id: String = row.try_get("id")?;
        let task_id: String = row.try_get("task_id")?;
        let payload_json: String = row.try_get("payload_json")?;
        let attempt_count: i64 = row.try_get("attempt_count")?;

        let Some(relay_url) = state.config.mail_relay_url.as_deref() else {
            info!(outbox_id, task_id, "mail relay not configured; delivery simulated");
            mark_delivered(&state.db, &outbox_id, None).await?;
            delivered += 1;
            continue;
        };

        let signature = sign_payload(&state.config.mail_relay_secret, &payload_json)?;
        let response = state
            .http_client
            .post(relay_url)
            .header("content-type", "application/json")
            .header("x-stacktask-message", outbox_id.clone())
            .header("x-stacktask-signature", signature)
            .body(payload_json.clone())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                mark_delivered(&state.db, &outbox_id, Some(resp.status().as_u16() as i64)).await?;
                delivered += 1;
            }
            Ok(resp) => {
                handle_delivery_retry(
                    state,
                    &outbox_id,
                    attempt_count,
                    format!("http status {}", resp.status()),
                )
                .await?;
            }
            Err(err) => {
                handle_delivery_retry(state, &outbox_id, attempt_count, err.to_string()).await?;
            }
        }
    }

    Ok(delivered)
}

async fn mark_delivered(
    db: &SqlitePool,
    outbox_id: &str,
    status: Option<i64>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE email_outbox
        SET delivered_at = ?1,
            last_status = ?2,
            last_error = NULL,
            next_attempt_at = NULL,
            updated_at = ?1
        WHERE id = ?3
        "#,
    )
    .bind(Utc::now())
    .bind(status)
    .bind(outbox_id)
    .execute(db)
    .await?;
    Ok(())
}

async fn handle_delivery_retry(
    state: &AppState,
    outbox_id: &str,
    attempt_count: i64,
    error_message: String,
) -> Result<(), AppError> {
    let next_attempt = attempt_count + 1;

    if next_attempt >= state.config.delivery_max_retries as i64 {
        warn!(outbox_id, error = %error_message, "email delivery exhausted retries");
        sqlx::query(
            r#"
            UPDATE email_outbox
            SET attempt_count = ?1,
                last_error = ?2,
                updated_at = ?3,
                next_attempt_at = NULL
            WHERE id = ?4
            "#,
        )
        .bind(next_attempt)
        .bind(error_message)
        .bind(Utc::now())
        .bind(outbox_id)
        .execute(&state.db)
        .await?;
        return Ok(());
    }

    let backoff_seconds = 2_i64.pow(next_attempt as u32);
    let next_attempt_at = Utc::now() + ChronoDuration::seconds(backoff_seconds);

    sqlx::query(
        r#"
        UPDATE email_outbox
        SET attempt_count = ?1,
            next_attempt_at = ?2,
            last_error = ?3,
            updated_at = ?4
        WHERE id = ?5
        "#,
    )
    .bind(next_attempt)
    .bind(next_attempt_at)
    .bind(error_message)
    .bind(Utc::now())
    .bind(outbox_id)
    .execute(&state.db)
    .await?;

    Ok(())
}

pub fn sign_payload(secret: &str, payload: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::internal(format!("hmac init failed: {e}")))?;
    mac.update(payload.as_bytes());
    let signature = mac.finalize().into_bytes();
    Ok(format!("v1={}", hex::encode(signature)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use sqlx::Row;
    use tempfile::TempDir;

    use super::{enqueue_token_email, handle_delivery_retry, process_due_deliveries, sign_payload};
    use crate::{
        config::Config, db::connect_and_bootstrap, identity::InMemoryIdentity, state::AppState,
    };

    async fn build_state(mut config: Config) -> (AppState, TempDir) {
        let temp = TempDir::new().expect("tempdir should be created");
        let db_path = temp.path().join("delivery-test.db");
        config.database_url = format!("sqlite://{}", db_path.display());
        config.delivery_max_retries = 2;
        let db = connect_and_bootstrap(&config)
            .await
            .expect("db bootstrap should succeed");
        sqlx::query(
            "INSERT INTO tasks (id, task_type, project_id, fingerprint, created_at, updated_at) VALUES ('task_mail', 'invite_user', 'p1', 'fp', ?1, ?1)",
        )
        .bind(Utc::now())
        .execute(&db)
        .await
        .expect("task insert should succeed");
        let state = AppState::new(config, db, Arc::new(InMemoryIdentity::new()))
            .expect("state should build");
        (state, temp)
    }

    #[tokio::test]
    async fn without_relay_delivery_is_simulated() {
        let (state, _temp) = build_state(Config::for_database(String::new())).await;
        enqueue_token_email(
            &state.db,
            "task_mail",
            "a@example.com",
            "invite_user",
            json!({"link": "http://localhost/v1/tokens/abc"}),
        )
        .await
        .expect("enqueue should succeed");

        let delivered = process_due_deliveries(&state).await.expect("worker pass");
        assert_eq!(delivered, 1);

        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM email_outbox WHERE delivered_at IS NULL")
                .fetch_one(&state.db)
                .await
                .expect("count query should succeed");
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let (state, _temp) = build_state(Config::for_database(String::new())).await;
        let outbox_id = enqueue_token_email(&state.db, "task_mail", "a@example.com", "invite_user", json!({}))
            .await
            .expect("enqueue should succeed");

        handle_delivery_retry(&state, &outbox_id, 1, "relay down".to_string())
            .await
            .expect("retry handler should succeed");

        let row = sqlx::query("SELECT attempt_count, next_attempt_at, last_error FROM email_outbox WHERE id = ?1")
            .bind(&outbox_id)
            .fetch_one(&state.db)
            .await
            .expect("outbox row should exist");
        let attempt_count: i64 = row.try_get("attempt_count").expect("attempt_count");
        let next_attempt_at: Option<chrono::DateTime<Utc>> =
            row.try_get("next_attempt_at").expect("next_attempt_at");
        let last_error: String = row.try_get("last_error").expect("last_error");

        assert_eq!(attempt_count, 2);
        assert!(next_attempt_at.is_none());
        assert_eq!(last_error, "relay down");
    }

    #[test]
    fn signature_is_versioned_hex() {
        let signature = sign_payload("secret", "{}").expect("signature");
        assert!(signature.starts_with("v1="));
        assert_eq!(signature.len(), 3 + 64);
        assert_ne!(signature, sign_payload("other", "{}").expect("signature"));
    }
}
