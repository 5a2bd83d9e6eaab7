//! Task lifecycle: creation, approval, confirmation and cancellation.
//!
//! Every state transition is a single guarded `UPDATE` checked through
//! `rows_affected`, so concurrent requests race on the database row rather
//! than on an in-process lock. Identity provider calls never run inside a
//! transaction.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{info, warn};

use crate::{
    actions::{ActionContext, ActionError, ActionOutcome, ActionRegistry, BuiltAction},
    catalog::{Access, TaskTypeDefinition, task_type_definition},
    config::Config,
    db::{canonical_fingerprint, new_id},
    delivery::enqueue_token_email,
    error::{AppError, FieldError},
    identity::IdentityGateway,
    models::{
        ActionNote, ActionRecord, ActionState, Caller, CreateTaskRequest, CreateTaskResponse,
        IssuedTokenResponse, TaskListQuery, TaskRecord, TaskSummary, TaskView,
        TokenDetailsResponse,
    },
    notifications::NotificationSink,
    policy::AuthorizationPolicy,
    status::{TaskFlags, TaskStatus, derive_status},
    tokens::{IssuedToken, TokenManager},
};

pub struct TaskEngine {
    db: SqlitePool,
    config: Config,
    registry: ActionRegistry,
    tokens: TokenManager,
    notifications: NotificationSink,
    policy: AuthorizationPolicy,
    gateway: Arc<dyn IdentityGateway>,
}

impl TaskEngine {
    pub fn new(
        db: SqlitePool,
        config: Config,
        gateway: Arc<dyn IdentityGateway>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            tokens: TokenManager::new(db.clone()),
            notifications: NotificationSink::new(db.clone()),
            policy: AuthorizationPolicy::new(config.engine.clone()),
            registry: ActionRegistry::with_defaults()?,
            db,
            config,
            gateway,
        })
    }

    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    pub fn notifications(&self) -> &NotificationSink {
        &self.notifications
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn gateway(&self) -> &dyn IdentityGateway {
        self.gateway.as_ref()
    }

    /// Decomposes a caller request into the task type's actions and creates the task.
    pub async fn submit_request(
        &self,
        caller: Option<&Caller>,
        request: CreateTaskRequest,
    ) -> Result<CreateTaskResponse, AppError> {
        let definition = task_type_definition(&request.task_type)
            .ok_or_else(|| AppError::field("task_type", "Unknown task type."))?;

        let project_id = match definition.access {
            Access::Public => None,
            _ => request
                .project_id
                .clone()
                .filter(|p| !p.trim().is_empty())
                .or_else(|| caller.map(|c| c.project_id.clone())),
        };
        self.policy
            .ensure_access(definition.access, caller, project_id.as_deref())?;

        let mut built = Vec::with_capacity(definition.action_types.len());
        let mut errors = Vec::new();
        for action_type in definition.action_types {
            let payload = match self.payload_for(action_type, &request.data, project_id.as_deref()) {
                Ok(payload) => payload,
                Err(AppError::Validation(field_errors)) => {
                    merge_errors(&mut errors, field_errors);
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.registry.build(action_type, &payload) {
                Ok(action) => built.push(action),
                Err(AppError::Validation(field_errors)) => merge_errors(&mut errors, field_errors),
                Err(err) => return Err(err),
            }
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        self.create(&definition, project_id, caller, built).await
    }

    fn payload_for(
        &self,
        action_type: &str,
        data: &Value,
        project_id: Option<&str>,
    ) -> Result<Value, AppError> {
        let schema = self.registry.schema(action_type)?;
        let mut payload = match data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => return Ok(other.clone()),
        };
        if let (Some(project_id), true) = (project_id, schema.has_field("project_id")) {
            match payload.get("project_id").and_then(Value::as_str) {
                None => {
                    payload.insert("project_id".to_string(), json!(project_id));
                }
                Some(given) if given != project_id => {
                    return Err(AppError::field(
                        "project_id",
                        "Must match the project the task is created for.",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(Value::Object(payload))
    }

    pub async fn create(
        &self,
        definition: &TaskTypeDefinition,
        project_id: Option<String>,
        caller: Option<&Caller>,
        actions: Vec<BuiltAction>,
    ) -> Result<CreateTaskResponse, AppError> {
        let fingerprint = canonical_fingerprint(&json!({
            "task_type": definition.task_type,
            "project_id": project_id,
            "actions": actions
                .iter()
                .map(|a| json!({"action_type": a.action_type, "data": a.data}))
                .collect::<Vec<_>>(),
        }))?;

        if let Some(existing) = self.find_open_duplicate(&fingerprint).await? {
            return self.handle_duplicate(definition, existing).await;
        }

        self.validate_actions(definition.task_type, project_id.as_deref(), caller, &actions)
            .await?;

        let task_id = new_id("task");
        let now = Utc::now();
        let requested_by_json = caller.map(serde_json::to_string).transpose()?;

        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (
              id,
              task_type,
              project_id,
              fingerprint,
              requested_by_json,
              approved,
              executing,
              completed,
              cancelled,
              created_at,
              updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, 0, ?6, ?6)
            "#,
        )
        .bind(&task_id)
        .bind(definition.task_type)
        .bind(project_id.as_deref())
        .bind(&fingerprint)
        .bind(requested_by_json)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(AppError::Conflict(
                    "an equivalent task is already open".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        for (position, action) in actions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO task_actions (
                  id,
                  task_id,
                  position,
                  action_type,
                  data_json,
                  state,
                  notes_json,
                  created_at,
                  updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7, ?7)
                "#,
            )
            .bind(new_id("act"))
            .bind(&task_id)
            .bind(position as i64)
            .bind(&action.action_type)
            .bind(Value::Object(action.data.clone()).to_string())
            .bind(ActionState::Validated.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            task_id,
            task_type = definition.task_type,
            project_id = project_id.as_deref().unwrap_or_default(),
            "task created"
        );
        self.notifications
            .record(
                &task_id,
                "task created",
                false,
                json!({
                    "task_type": definition.task_type,
                    "requested_by": caller.map(|c| c.username.clone()),
                }),
            )
            .await?;

        if definition.confirmation.is_some() {
            let data = merged_data(actions.iter().map(|a| &a.data));
            self.issue_and_send(&task_id, definition, &data).await?;
        } else if self.auto_approve_allowed(definition, caller, project_id.as_deref()) {
            let approver = caller.map(|c| c.user_id.clone()).unwrap_or_default();
            self.run_approval(&task_id, &approver, &Map::new()).await?;
        }

        let view = self.view(&task_id).await?;
        Ok(CreateTaskResponse {
            task_id,
            status: view.status,
            reissued_token: false,
        })
    }

    async fn find_open_duplicate(&self, fingerprint: &str) -> Result<Option<TaskRecord>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM tasks
            WHERE fingerprint = ?1
              AND completed = 0
              AND cancelled = 0
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// A repeated request for a task still waiting on its confirmation, or whose
    /// confirmed attempt failed, gets a fresh token; anything else is a conflict.
    async fn handle_duplicate(
        &self,
        definition: &TaskTypeDefinition,
        existing: TaskRecord,
    ) -> Result<CreateTaskResponse, AppError> {
        let view = self.view(&existing.id).await?;
        if definition.confirmation.is_none() || !awaiting_confirmation(&view) {
            return Err(AppError::Conflict(
                "an equivalent task is already open".to_string(),
            ));
        }

        self.issue_and_send(&existing.id, definition, &view.task_data())
            .await?;
        self.notifications
            .record(&existing.id, "token reissued for repeated request", false, json!({}))
            .await?;
        info!(task_id = %existing.id, "repeated request reactivated pending task");

        let view = self.view(&existing.id).await?;
        Ok(CreateTaskResponse {
            task_id: existing.id,
            status: view.status,
            reissued_token: true,
        })
    }

    async fn validate_actions(
        &self,
        task_type: &str,
        project_id: Option<&str>,
        caller: Option<&Caller>,
        actions: &[BuiltAction],
    ) -> Result<(), AppError> {
        let confirmation = Map::new();
        let mut errors = Vec::new();
        for action in actions {
            let handler = self.registry.handler(&action.action_type)?;
            let ctx = self.context("", task_type, project_id, &action.data, &confirmation, caller);
            match handler.validate(&ctx).await {
                Ok(()) => {}
                Err(ActionError::Validation(field_errors)) => merge_errors(&mut errors, field_errors),
                Err(err) => return Err(err.into()),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors))
        }
    }

    fn auto_approve_allowed(
        &self,
        definition: &TaskTypeDefinition,
        caller: Option<&Caller>,
        project_id: Option<&str>,
    ) -> bool {
        let enabled = self
            .config
            .engine
            .task_settings(definition.task_type)
            .auto_approve
            .unwrap_or(definition.auto_approve);
        enabled
            && caller.is_some_and(|c| match project_id {
                Some(project_id) => self.policy.is_mod_or_owner(c, project_id),
                None => self.policy.is_admin(c),
            })
    }

    fn context<'a>(
        &'a self,
        task_id: &'a str,
        task_type: &'a str,
        project_id: Option<&'a str>,
        data: &'a Map<String, Value>,
        confirmation: &'a Map<String, Value>,
        requested_by: Option<&'a Caller>,
    ) -> ActionContext<'a> {
        ActionContext {
            task_id,
            task_type,
            project_id,
            data,
            confirmation,
            requested_by,
            gateway: self.gateway.as_ref(),
            policy: &self.policy,
            settings: &self.config.engine,
        }
    }

    async fn issue_and_send(
        &self,
        task_id: &str,
        definition: &TaskTypeDefinition,
        data: &Map<String, Value>,
    ) -> Result<IssuedToken, AppError> {
        let confirmation = definition.confirmation.as_ref().ok_or_else(|| {
            AppError::InvalidState("task type does not use confirmation tokens".to_string())
        })?;

        let ttl = self.config.token_ttl_for(definition.task_type);
        let issued = self.tokens.issue(task_id, ttl).await?;

        match data.get(confirmation.recipient_field).and_then(Value::as_str) {
            Some(recipient) => {
                let link = format!(
                    "{}/v1/tokens/{}",
                    self.config.base_url.trim_end_matches('/'),
                    issued.secret
                );
                enqueue_token_email(
                    &self.db,
                    task_id,
                    recipient,
                    confirmation.template,
                    json!({
                        "task_type": definition.task_type,
                        "link": link,
                        "expires_at": issued.record.expires_at,
                    }),
                )
                .await?;
            }
            None => warn!(task_id, "task data has no recipient for the token email"),
        }
        Ok(issued)
    }

    /// Administrator approval.
    ///
    /// Task types confirmed by token are approved by consuming the token; an
    /// administrator may only retry them after that has happened.
    pub async fn approve(&self, caller: &Caller, task_id: &str) -> Result<TaskView, AppError> {
        self.policy.ensure_admin(caller)?;
        let task = self.load_task(task_id).await?;
        ensure_open(&task)?;
        let needs_token = task_type_definition(&task.task_type)
            .is_some_and(|d| d.confirmation.is_some());
        if needs_token && !task.approved {
            return Err(AppError::InvalidState(
                "task is waiting on its confirmation token".to_string(),
            ));
        }
        self.run_approval(task_id, &caller.user_id, &Map::new()).await
    }

    /// Claims the task for execution, then runs the prepare pass over every
    /// unfinished action followed by the submit pass. Succeeded or skipped
    /// actions from earlier attempts are not run again. A failure stops the
    /// task where it is; nothing already submitted is undone.
    async fn run_approval(
        &self,
        task_id: &str,
        approved_by: &str,
        confirmation: &Map<String, Value>,
    ) -> Result<TaskView, AppError> {
        let task = self.load_task(task_id).await?;
        ensure_open(&task)?;
        self.claim_execution(task_id, approved_by).await?;
        info!(task_id, approved_by, "task approved, executing");

        match self.execute_actions(&task, confirmation).await {
            Ok(()) => {}
            Err(err) => {
                self.release_execution(task_id).await?;
                return Err(err);
            }
        }
        self.view(task_id).await
    }

    async fn execute_actions(
        &self,
        task: &TaskRecord,
        confirmation: &Map<String, Value>,
    ) -> Result<(), AppError> {
        let acknowledged = self.notifications.acknowledge_errors_for_task(&task.id).await?;
        if acknowledged > 0 {
            info!(task_id = %task.id, acknowledged, "retrying previously failed task");
        }

        let mut actions = self.load_actions(&task.id).await?;
        let requested_by = task.requested_by.as_ref();
        let project_id = task.project_id.as_deref();

        for action in actions.iter_mut().filter(|a| !a.state.is_done()) {
            let handler = self.registry.handler(&action.action_type)?;
            let result = {
                let ctx = self.context(
                    &task.id,
                    &task.task_type,
                    project_id,
                    &action.data,
                    confirmation,
                    requested_by,
                );
                handler.prepare(&ctx).await
            };
            match result {
                Ok(()) => self.update_action(action, ActionState::Prepared, Vec::new()).await?,
                Err(err) => return self.fail_action(&task.id, action, "prepare", &err).await,
            }
        }

        for action in actions.iter_mut().filter(|a| !a.state.is_done()) {
            let handler = self.registry.handler(&action.action_type)?;
            self.update_action(action, ActionState::Submitted, Vec::new())
                .await?;
            let result = {
                let ctx = self.context(
                    &task.id,
                    &task.task_type,
                    project_id,
                    &action.data,
                    confirmation,
                    requested_by,
                );
                handler.submit(&ctx).await
            };
            match result {
                Ok(ActionOutcome::Succeeded(notes)) => {
                    self.update_action(action, ActionState::Succeeded, notes).await?;
                }
                Ok(ActionOutcome::Skipped(reason)) => {
                    self.update_action(action, ActionState::Skipped, vec![reason]).await?;
                }
                Err(err) => return self.fail_action(&task.id, action, "submit", &err).await,
            }
        }

        let now = Utc::now();
        let completed = sqlx::query(
            r#"
            UPDATE tasks
            SET completed = 1,
                executing = 0,
                executing_since = NULL,
                completed_at = ?1,
                updated_at = ?1
            WHERE id = ?2
              AND cancelled = 0
            "#,
        )
        .bind(now)
        .bind(&task.id)
        .execute(&self.db)
        .await?
        .rows_affected();

        if completed == 0 {
            return Err(AppError::InvalidState("task was cancelled".to_string()));
        }

        info!(task_id = %task.id, task_type = %task.task_type, "task completed");
        self.notifications
            .record(&task.id, "task completed", false, json!({}))
            .await?;
        Ok(())
    }

    async fn claim_execution(&self, task_id: &str, approved_by: &str) -> Result<(), AppError> {
        let now = Utc::now();
        let stale_before = now - Duration::seconds(self.config.stale_execution_seconds);

        let claimed = sqlx::query(
            r#"
            UPDATE tasks
            SET approved = 1,
                executing = 1,
                executing_since = ?1,
                approved_by = COALESCE(approved_by, ?2),
                approved_at = COALESCE(approved_at, ?1),
                updated_at = ?1
            WHERE id = ?3
              AND completed = 0
              AND cancelled = 0
              AND (executing = 0 OR executing_since IS NULL OR executing_since < ?4)
            "#,
        )
        .bind(now)
        .bind(approved_by)
        .bind(task_id)
        .bind(stale_before)
        .execute(&self.db)
        .await?
        .rows_affected();

        if claimed == 1 {
            return Ok(());
        }

        let task = self.load_task(task_id).await?;
        ensure_open(&task)?;
        Err(AppError::InvalidState(
            "task is already being processed".to_string(),
        ))
    }

    async fn release_execution(&self, task_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET executing = 0,
                executing_since = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_action(
        &self,
        action: &mut ActionRecord,
        state: ActionState,
        notes: Vec<String>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        action.state = state;
        action
            .notes
            .extend(notes.into_iter().map(|message| ActionNote { at: now, message }));

        sqlx::query(
            r#"
            UPDATE task_actions
            SET state = ?1,
                notes_json = ?2,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(state.as_str())
        .bind(serde_json::to_string(&action.notes)?)
        .bind(now)
        .bind(&action.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn fail_action(
        &self,
        task_id: &str,
        action: &mut ActionRecord,
        phase: &str,
        err: &ActionError,
    ) -> Result<(), AppError> {
        let reason = describe_action_error(err);
        let retryable = err.is_transient();
        self.update_action(action, ActionState::Failed, vec![format!("{phase} failed: {reason}")])
            .await?;

        let message = format!(
            "{} at position {} failed during {phase}: {reason}",
            action.action_type, action.position
        );
        self.notifications
            .record(
                task_id,
                &message,
                true,
                json!({
                    "action_id": action.id,
                    "action_type": action.action_type,
                    "position": action.position,
                    "phase": phase,
                    "reason": reason,
                    "retryable": retryable,
                }),
            )
            .await?;
        self.release_execution(task_id).await?;

        warn!(
            task_id,
            action_type = %action.action_type,
            position = action.position,
            phase,
            retryable,
            error = %reason,
            "task action failed"
        );
        Ok(())
    }

    /// Cancels a task that is neither finished nor executing.
    pub async fn cancel(
        &self,
        caller: &Caller,
        task_id: &str,
        reason: Option<String>,
    ) -> Result<TaskView, AppError> {
        let task = self.load_task(task_id).await?;
        self.ensure_can_manage(caller, &task)?;
        ensure_open(&task)?;

        let now = Utc::now();
        let cancelled = sqlx::query(
            r#"
            UPDATE tasks
            SET cancelled = 1,
                cancelled_at = ?1,
                updated_at = ?1
            WHERE id = ?2
              AND completed = 0
              AND cancelled = 0
              AND executing = 0
            "#,
        )
        .bind(now)
        .bind(task_id)
        .execute(&self.db)
        .await?
        .rows_affected();

        if cancelled == 0 {
            let task = self.load_task(task_id).await?;
            ensure_open(&task)?;
            return Err(AppError::InvalidState(
                "task is being processed and cannot be cancelled".to_string(),
            ));
        }

        self.notifications
            .record(
                task_id,
                "task cancelled",
                false,
                json!({"cancelled_by": caller.user_id, "reason": reason}),
            )
            .await?;
        info!(task_id, cancelled_by = %caller.user_id, "task cancelled");
        self.view(task_id).await
    }

    /// Public entry point for the holder of an emailed link.
    ///
    /// Cancelled or finished tasks refuse the token before the token itself is
    /// looked at further; tokens are left in place on cancellation.
    pub async fn consume_token(&self, secret: &str, confirmation: Value) -> Result<TaskView, AppError> {
        let record = self.tokens.lookup(secret).await?;
        let task = self.load_task(&record.task_id).await?;
        // Read after the task: a concurrent consumer that already finished the
        // task is guaranteed to show up as a consumed token here.
        let record = self.tokens.lookup(secret).await?;
        if record.consumed_at.is_some() {
            return Err(AppError::TokenAlreadyUsed);
        }
        ensure_open(&task)?;
        TokenManager::ensure_usable(&record, Utc::now())?;

        let definition = task_type_definition(&task.task_type)
            .ok_or_else(|| AppError::internal(format!("unknown task type {}", task.task_type)))?;
        let confirmation = confirmation_fields(&definition, confirmation)?;

        let claimed = self.tokens.claim(secret).await?;
        self.notifications
            .record(&task.id, "confirmation token consumed", false, json!({"token_id": claimed.id}))
            .await?;

        self.run_approval(&task.id, &format!("token:{}", claimed.id), &confirmation)
            .await
    }

    /// What a token confirms, without revealing task data.
    pub async fn token_details(&self, secret: &str) -> Result<TokenDetailsResponse, AppError> {
        let record = self.tokens.lookup(secret).await?;
        let task = self.load_task(&record.task_id).await?;
        ensure_open(&task)?;
        TokenManager::ensure_usable(&record, Utc::now())?;

        let required_fields = task_type_definition(&task.task_type)
            .and_then(|d| d.confirmation)
            .map(|c| c.fields.iter().map(|f| f.to_string()).collect())
            .unwrap_or_default();

        Ok(TokenDetailsResponse {
            task_type: task.task_type,
            required_fields,
            expires_at: record.expires_at,
        })
    }

    pub async fn reissue_token(&self, caller: &Caller, task_id: &str) -> Result<IssuedTokenResponse, AppError> {
        self.policy.ensure_admin(caller)?;
        let view = self.view(task_id).await?;
        ensure_open(&view.task)?;
        if !awaiting_confirmation(&view) {
            return Err(AppError::InvalidState(
                "task has already been confirmed".to_string(),
            ));
        }
        let definition = task_type_definition(&view.task.task_type).ok_or_else(|| {
            AppError::internal(format!("unknown task type {}", view.task.task_type))
        })?;

        let issued = self
            .issue_and_send(task_id, &definition, &view.task_data())
            .await?;
        self.notifications
            .record(task_id, "token reissued", false, json!({"reissued_by": caller.user_id}))
            .await?;

        Ok(IssuedTokenResponse {
            task_id: task_id.to_string(),
            expires_at: issued.record.expires_at,
        })
    }

    pub async fn get(&self, caller: &Caller, task_id: &str) -> Result<TaskView, AppError> {
        let view = self.view(task_id).await?;
        self.ensure_can_view(caller, &view.task)?;
        Ok(view)
    }

    pub async fn view(&self, task_id: &str) -> Result<TaskView, AppError> {
        let task = self.load_task(task_id).await?;
        let actions = self.load_actions(task_id).await?;
        let tokens = self.tokens.tokens_for(task_id).await?;
        let notifications = self.notifications.list_for(task_id).await?;
        let status = derive_status(
            TaskFlags {
                completed: task.completed,
                cancelled: task.cancelled,
                executing: task.executing,
            },
            &tokens,
            &notifications,
            Utc::now(),
        );

        Ok(TaskView {
            task,
            status,
            actions,
            tokens,
            notifications,
        })
    }

    pub async fn list(&self, caller: &Caller, query: TaskListQuery) -> Result<Vec<TaskSummary>, AppError> {
        let project_id = if self.policy.is_admin(caller) {
            query.project_id
        } else {
            let project_id = query
                .project_id
                .unwrap_or_else(|| caller.project_id.clone());
            self.policy.ensure_mod_or_owner(caller, &project_id)?;
            Some(project_id)
        };

        let state_clause = match query.state.as_deref().unwrap_or("pending") {
            "pending" => "completed = 0 AND cancelled = 0",
            "completed" => "completed = 1",
            "cancelled" => "cancelled = 1",
            "all" => "1 = 1",
            other => {
                return Err(AppError::field(
                    "state",
                    &format!("\"{other}\" is not a valid choice."),
                ));
            }
        };

        let sql = format!(
            r#"
            SELECT id
            FROM tasks
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR task_type = ?2)
              AND {state_clause}
            ORDER BY created_at DESC, id DESC
            "#
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(project_id)
            .bind(query.task_type)
            .fetch_all(&self.db)
            .await?;

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let view = self.view(&id).await?;
            summaries.push(TaskSummary {
                task_id: view.task.id,
                task_type: view.task.task_type,
                project_id: view.task.project_id,
                status: view.status,
                created_at: view.task.created_at,
            });
        }
        Ok(summaries)
    }

    /// Open tasks of one type for a project, as full views.
    pub async fn open_tasks(&self, project_id: &str, task_type: &str) -> Result<Vec<TaskView>, AppError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM tasks
            WHERE project_id = ?1
              AND task_type = ?2
              AND completed = 0
              AND cancelled = 0
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .bind(task_type)
        .fetch_all(&self.db)
        .await?;

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            views.push(self.view(&id).await?);
        }
        Ok(views)
    }

    fn ensure_can_view(&self, caller: &Caller, task: &TaskRecord) -> Result<(), AppError> {
        let is_requester = task
            .requested_by
            .as_ref()
            .is_some_and(|r| r.user_id == caller.user_id);
        if is_requester {
            return Ok(());
        }
        self.ensure_can_manage(caller, task)
    }

    fn ensure_can_manage(&self, caller: &Caller, task: &TaskRecord) -> Result<(), AppError> {
        match task.project_id.as_deref() {
            Some(project_id) => self.policy.ensure_mod_or_owner(caller, project_id),
            None => self.policy.ensure_admin(caller),
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<TaskRecord, AppError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("task not found".to_string()))?;
        task_from_row(&row)
    }

    async fn load_actions(&self, task_id: &str) -> Result<Vec<ActionRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, position, action_type, data_json, state, notes_json
            FROM task_actions
            WHERE task_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(action_from_row).collect()
    }
}

fn ensure_open(task: &TaskRecord) -> Result<(), AppError> {
    if task.cancelled {
        return Err(AppError::InvalidState("task has been cancelled".to_string()));
    }
    if task.completed {
        return Err(AppError::InvalidState("task is already completed".to_string()));
    }
    Ok(())
}

/// Nothing is running and the task was either never confirmed or its
/// confirmed attempt failed. Confirmation data is not stored, so a failed
/// attempt can only be resumed through a new token.
fn awaiting_confirmation(view: &TaskView) -> bool {
    !view.task.executing && (!view.task.approved || view.status == TaskStatus::Failed)
}

/// Extracts the confirmation fields the task type requires, all or nothing.
fn confirmation_fields(
    definition: &TaskTypeDefinition,
    supplied: Value,
) -> Result<Map<String, Value>, AppError> {
    let supplied = match supplied {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut confirmation = Map::new();
    let mut errors = Vec::new();
    let fields = definition
        .confirmation
        .as_ref()
        .map(|c| c.fields)
        .unwrap_or_default();
    for field in fields {
        match supplied
            .get(*field)
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
        {
            Some(value) => {
                confirmation.insert(field.to_string(), json!(value));
            }
            None => errors.push(FieldError::new(*field, "This field is required.")),
        }
    }
    if errors.is_empty() {
        Ok(confirmation)
    } else {
        Err(AppError::Validation(errors))
    }
}

fn describe_action_error(err: &ActionError) -> String {
    match err {
        ActionError::Validation(errors) => errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

fn merge_errors(into: &mut Vec<FieldError>, errors: Vec<FieldError>) {
    for error in errors {
        if !into.contains(&error) {
            into.push(error);
        }
    }
}

fn merged_data<'a>(maps: impl Iterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
    let mut merged = Map::new();
    for map in maps {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, AppError> {
    let requested_by_json: Option<String> = row.try_get("requested_by_json")?;
    let requested_by = requested_by_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(TaskRecord {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        project_id: row.try_get("project_id")?,
        fingerprint: row.try_get("fingerprint")?,
        requested_by,
        approved: row.try_get("approved")?,
        executing: row.try_get("executing")?,
        completed: row.try_get("completed")?,
        cancelled: row.try_get("cancelled")?,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<ActionRecord, AppError> {
    let data_json: String = row.try_get("data_json")?;
    let notes_json: String = row.try_get("notes_json")?;
    let state: String = row.try_get("state")?;
    let data = match serde_json::from_str(&data_json)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    Ok(ActionRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        position: row.try_get("position")?,
        action_type: row.try_get("action_type")?,
        data,
        state: ActionState::parse(&state)?,
        notes: serde_json::from_str(&notes_json)?,
    })
}
