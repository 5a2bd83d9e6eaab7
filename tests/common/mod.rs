#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::Value;
use stacktask::{
    auth::{issue_caller_token, make_caller_claims},
    config::Config,
    db::connect_and_bootstrap,
    handlers::router,
    identity::{IdentityGateway, InMemoryIdentity},
    models::Caller,
    state::AppState,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PROJECT: &str = "p1";

pub struct TestApp {
    pub app: Router,
    pub config: Config,
    pub state: AppState,
    pub identity: Arc<InMemoryIdentity>,
    _temp_dir: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request should execute");
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("response body should be readable");
        let parsed = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    pub fn token_for(&self, caller: &Caller) -> String {
        let claims = make_caller_claims(
            &self.config.jwt_issuer,
            &self.config.jwt_audience,
            caller,
            3600,
        );
        issue_caller_token(&claims, &self.config.jwt_secret).expect("caller token should sign")
    }

    /// Secret from the link in the most recent email queued for the task.
    pub async fn latest_token_secret(&self, task_id: &str) -> String {
        let payload: String = sqlx::query_scalar(
            "SELECT payload_json FROM email_outbox WHERE task_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_one(&self.state.db)
        .await
        .expect("an email should have been queued");
        let payload: Value = serde_json::from_str(&payload).expect("payload should be json");
        payload["context"]["link"]
            .as_str()
            .and_then(|link| link.rsplit('/').next())
            .expect("email should carry a token link")
            .to_string()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(&self.state.db)
            .await
            .expect("count query should succeed")
    }
}

pub fn caller(user_id: &str, username: &str, roles: &[&str]) -> Caller {
    Caller {
        user_id: user_id.to_string(),
        username: username.to_string(),
        project_id: PROJECT.to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

pub fn admin() -> Caller {
    caller("u-admin", "admin@example.com", &["admin"])
}

pub fn moderator() -> Caller {
    caller("u-mod", "mod@example.com", &["project_mod", "_member_"])
}

pub fn member() -> Caller {
    caller("u-bob", "bob@example.com", &["_member_"])
}

fn seeded_identity() -> InMemoryIdentity {
    let identity = InMemoryIdentity::new();
    identity.add_project(PROJECT, "demo");
    for role in ["admin", "project_admin", "project_mod", "_member_", "heat_stack_owner"] {
        identity.add_role(role);
    }
    identity.add_user("u-admin", "admin@example.com", "admin@example.com");
    identity.add_user("u-mod", "mod@example.com", "mod@example.com");
    identity.add_user("u-bob", "bob@example.com", "bob@example.com");
    identity.add_user("u-root", "root@example.com", "root@example.com");
    identity.add_user("u-support", "support", "support@example.com");
    identity.add_grant("u-admin", PROJECT, "admin");
    identity.add_grant("u-mod", PROJECT, "project_mod");
    identity.add_grant("u-mod", PROJECT, "_member_");
    identity.add_grant("u-bob", PROJECT, "_member_");
    identity.add_grant("u-root", PROJECT, "admin");
    identity
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(|_| {}).await
}

pub async fn build_test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let temp_dir = TempDir::new().expect("temp directory should be created");
    let db_path = temp_dir.path().join("test-stacktask.db");
    let mut config = Config::for_database(format!("sqlite://{}", db_path.display()));
    configure(&mut config);

    let db = connect_and_bootstrap(&config)
        .await
        .expect("db bootstrap should succeed");
    let identity = Arc::new(seeded_identity());
    let gateway: Arc<dyn IdentityGateway> = identity.clone();
    let state = AppState::new(config.clone(), db, gateway).expect("state should build");
    let app = router(state.clone());

    TestApp {
        app,
        config,
        state,
        identity,
        _temp_dir: temp_dir,
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn json_auth_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn auth_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request should build")
}
