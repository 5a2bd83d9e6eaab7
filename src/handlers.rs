use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    auth::{AuthContext, caller_auth_middleware, optional_caller},
    error::AppError,
    models::{
        CancelTaskRequest, CreateTaskRequest, CreateTaskResponse, EditRolesRequest,
        IssuedTokenResponse, NotificationQuery, NotificationRecord, ProjectUsersResponse,
        RolesResponse, TaskListQuery, TaskSummary, TaskView, TokenDetailsResponse,
        UserDetailResponse,
    },
    policy::require_caller,
    state::AppState,
    users::{self, EmailRequest, InviteRequest},
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/approve", post(approve_task))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route("/v1/tasks/:task_id/token", post(reissue_token))
        .route("/v1/tasks/:task_id/notifications", get(task_notifications))
        .route("/v1/notifications", get(list_notifications))
        .route(
            "/v1/notifications/:notification_id/acknowledge",
            post(acknowledge_notification),
        )
        .route("/v1/openstack/users", get(list_users).post(invite_user))
        .route("/v1/openstack/users/password-set", post(password_set))
        .route(
            "/v1/openstack/users/:user_id",
            get(get_user).delete(delete_user),
        )
        .route(
            "/v1/openstack/users/:user_id/roles",
            get(get_user_roles).put(grant_user_roles).delete(revoke_user_roles),
        )
        .route("/v1/openstack/roles", get(list_roles))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            caller_auth_middleware,
        ));

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/readyz", get(readyz))
        .route("/v1/tasks", get(list_tasks).post(create_task))
        .route("/v1/tokens/:token", get(token_details).post(consume_token))
        .route("/v1/openstack/users/password-reset", post(password_reset))
        .merge(protected)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ProjectQuery {
    #[serde(default)]
    project_id: Option<String>,
}

async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({"ready": true})))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), AppError> {
    if payload.task_type.trim().is_empty() {
        return Err(AppError::field("task_type", "This field is required."));
    }
    let caller = optional_caller(&headers, &state.config)?;
    let response = state.engine.submit_request(caller.as_ref(), payload).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskSummary>>, AppError> {
    let caller = optional_caller(&headers, &state.config)?;
    let caller = require_caller(caller.as_ref())?;
    Ok(Json(state.engine.list(caller, query).await?))
}

async fn get_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(state.engine.get(&auth.caller(), &task_id).await?))
}

async fn approve_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(state.engine.approve(&auth.caller(), &task_id).await?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
    payload: Option<Json<CancelTaskRequest>>,
) -> Result<Json<TaskView>, AppError> {
    let reason = payload.and_then(|Json(p)| p.reason);
    Ok(Json(
        state.engine.cancel(&auth.caller(), &task_id, reason).await?,
    ))
}

async fn reissue_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<IssuedTokenResponse>), AppError> {
    let issued = state.engine.reissue_token(&auth.caller(), &task_id).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn task_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<NotificationRecord>>, AppError> {
    let view = state.engine.get(&auth.caller(), &task_id).await?;
    Ok(Json(view.notifications))
}

async fn list_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<NotificationRecord>>, AppError> {
    state.engine.policy().ensure_admin(&auth.caller())?;
    Ok(Json(
        state.engine.notifications().list(query.acknowledged).await?,
    ))
}

async fn acknowledge_notification(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(notification_id): Path<String>,
) -> Result<Json<NotificationRecord>, AppError> {
    state.engine.policy().ensure_admin(&auth.caller())?;
    Ok(Json(
        state
            .engine
            .notifications()
            .acknowledge(&notification_id)
            .await?,
    ))
}

async fn token_details(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<TokenDetailsResponse>, AppError> {
    Ok(Json(state.engine.token_details(&token).await?))
}

async fn consume_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(state.engine.consume_token(&token, payload).await?))
}

async fn list_users(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ProjectUsersResponse>, AppError> {
    Ok(Json(
        users::list_project_users(&state.engine, &auth.caller(), query.project_id).await?,
    ))
}

async fn invite_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<InviteRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), AppError> {
    let response = users::invite_user(&state.engine, &auth.caller(), payload).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn get_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<UserDetailResponse>, AppError> {
    Ok(Json(
        users::get_project_user(&state.engine, &auth.caller(), &user_id, query.project_id)
            .await?,
    ))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(
        users::delete_project_user(&state.engine, &auth.caller(), &user_id, query.project_id)
            .await?,
    ))
}

async fn get_user_roles(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<RolesResponse>, AppError> {
    Ok(Json(
        users::get_user_roles(&state.engine, &auth.caller(), &user_id, query.project_id).await?,
    ))
}

async fn grant_user_roles(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(payload): Json<EditRolesRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), AppError> {
    let response =
        users::edit_user_roles(&state.engine, &auth.caller(), &user_id, payload, false).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn revoke_user_roles(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(payload): Json<EditRolesRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), AppError> {
    let response =
        users::edit_user_roles(&state.engine, &auth.caller(), &user_id, payload, true).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn list_roles(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<RolesResponse>, AppError> {
    Ok(Json(
        users::manageable_roles(&state.engine, &auth.caller()).await?,
    ))
}

async fn password_reset(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Json<Value> {
    Json(users::request_password_reset(&state.engine, payload).await)
}

async fn password_set(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<EmailRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), AppError> {
    let response = users::force_password_reset(&state.engine, &auth.caller(), payload).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
