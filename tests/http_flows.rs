mod common;

use axum::http::StatusCode;
use common::{
    PROJECT, TestApp, admin, auth_request, build_test_app, build_test_app_with, json_auth_request,
    json_request, member, moderator,
};
use serde_json::{Value, json};
use stacktask::{
    config::{DefaultUser, TaskSettings},
    identity::GatewayError,
};

async fn invite(app: &TestApp, email: &str, roles: Value) -> (StatusCode, Value) {
    let token = app.token_for(&moderator());
    app.send(json_auth_request(
        "POST",
        "/v1/openstack/users",
        &token,
        json!({"email": email, "roles": roles}),
    ))
    .await
}

async fn consume(app: &TestApp, secret: &str, body: Value) -> (StatusCode, Value) {
    app.send(json_request("POST", &format!("/v1/tokens/{secret}"), body))
        .await
}

async fn get_task(app: &TestApp, task_id: &str) -> Value {
    let token = app.token_for(&admin());
    let (status, body) = app
        .send(auth_request("GET", &format!("/v1/tasks/{task_id}"), &token))
        .await;
    assert_eq!(status, StatusCode::OK, "task lookup failed: {body}");
    body
}

fn task_id(body: &Value) -> String {
    body["task_id"]
        .as_str()
        .expect("response should carry a task id")
        .to_string()
}

#[tokio::test]
async fn health_and_ready_endpoints_return_ok() {
    let app = build_test_app().await;

    let (status, body) = app.send(json_request("GET", "/v1/healthz", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = app.send(json_request("GET", "/v1/readyz", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn protected_routes_require_a_caller_token() {
    let app = build_test_app().await;

    let (status, body) = app
        .send(json_request("GET", "/v1/openstack/users", json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = app
        .send(auth_request("GET", "/v1/openstack/roles", "not-a-jwt"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invite_is_confirmed_through_the_emailed_token() {
    let app = build_test_app().await;

    let (status, body) = invite(&app, "new@example.com", json!(["_member_"])).await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
    assert_eq!(body["status"], "unconfirmed");
    let task_id = task_id(&body);

    let secret = app.latest_token_secret(&task_id).await;
    let (status, details) = app
        .send(json_request("GET", &format!("/v1/tokens/{secret}"), json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["task_type"], "invite_user");
    assert_eq!(details["required_fields"], json!(["password"]));
    assert!(details.get("actions").is_none());

    let (status, body) = consume(&app, &secret, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["field"], "password");

    let (status, body) = consume(&app, &secret, json!({"password": "s3cret-pass"})).await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["completed"], true);
    assert_eq!(body["approved"], true);
    assert_eq!(body["actions"][0]["state"], "succeeded");

    let calls = app.identity.calls();
    assert!(calls.contains(&format!("create_user:new@example.com,{PROJECT}")));
    assert_eq!(calls.iter().filter(|c| c.starts_with("grant_role:")).count(), 1);

    let (status, body) = consume(&app, &secret, json!({"password": "again"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "token_already_used");
}

#[tokio::test]
async fn concurrent_consumption_runs_the_task_once() {
    let app = build_test_app().await;

    let (_, body) = invite(&app, "race@example.com", json!(["_member_"])).await;
    let task_id = task_id(&body);
    let secret = app.latest_token_secret(&task_id).await;

    let (first, second) = tokio::join!(
        consume(&app, &secret, json!({"password": "one"})),
        consume(&app, &secret, json!({"password": "two"})),
    );

    let mut statuses = vec![first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    let loser = if first.0 == StatusCode::CONFLICT { &first.1 } else { &second.1 };
    assert_eq!(loser["code"], "token_already_used");

    let creations = app
        .identity
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_user:race@example.com"))
        .count();
    assert_eq!(creations, 1);

    let view = get_task(&app, &task_id).await;
    assert_eq!(view["status"], "completed");
}

#[tokio::test]
async fn expired_token_is_refused_and_task_stays_open() {
    let app = build_test_app_with(|config| {
        let mut engine = (*config.engine).clone();
        engine
            .task_settings
            .entry("invite_user".to_string())
            .or_insert_with(TaskSettings::default)
            .token_ttl_seconds = Some(0);
        config.engine = std::sync::Arc::new(engine);
    })
    .await;

    let (status, body) = invite(&app, "late@example.com", json!(["_member_"])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = task_id(&body);
    let secret = app.latest_token_secret(&task_id).await;

    let (status, body) = consume(&app, &secret, json!({"password": "too-late"})).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "token_expired");

    let view = get_task(&app, &task_id).await;
    assert_eq!(view["status"], "expired");
    assert_eq!(view["completed"], false);
    assert_eq!(view["cancelled"], false);
    assert_eq!(view["approved"], false);
    assert!(app.identity.calls().is_empty());
}

#[tokio::test]
async fn cancelled_task_refuses_its_token() {
    let app = build_test_app().await;
    let mod_token = app.token_for(&moderator());

    let (_, body) = invite(&app, "gone@example.com", json!(["_member_"])).await;
    let task_id = task_id(&body);
    let secret = app.latest_token_secret(&task_id).await;

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/cancel"),
            &mod_token,
            json!({"reason": "typo in address"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "cancelled");

    let (status, body) = consume(&app, &secret, json!({"password": "whatever"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");

    let (status, _) = app
        .send(json_auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/cancel"),
            &mod_token,
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(
        app.count("SELECT COUNT(*) FROM tasks WHERE completed = 1 AND cancelled = 1")
            .await,
        0
    );
    assert!(app.identity.calls().is_empty());
}

#[tokio::test]
async fn completed_task_cannot_be_cancelled() {
    let app = build_test_app().await;
    let mod_token = app.token_for(&moderator());

    let (status, body) = app
        .send(json_auth_request(
            "PUT",
            "/v1/openstack/users/u-bob/roles",
            &mod_token,
            json!({"roles": ["heat_stack_owner"]}),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
    assert!(app.identity.has_grant("u-bob", PROJECT, "heat_stack_owner"));

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            &format!("/v1/tasks/{}/cancel", task_id(&body)),
            &mod_token,
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
}

#[tokio::test]
async fn validation_errors_are_aggregated_and_nothing_is_stored() {
    let app = build_test_app().await;
    let mod_token = app.token_for(&moderator());

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/v1/tasks",
            &mod_token,
            json!({"task_type": "invite_user", "data": {"email": "not-an-email", "roles": []}}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .expect("errors should be a list")
        .iter()
        .filter_map(|e| e["field"].as_str())
        .collect();
    assert!(fields.contains(&"email"));
    assert!(fields.contains(&"roles"));

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/v1/tasks",
            &mod_token,
            json!({"task_type": "no_such_type", "data": {}}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["field"], "task_type");

    assert_eq!(app.count("SELECT COUNT(*) FROM tasks").await, 0);
}

#[tokio::test]
async fn repeated_invite_reissues_the_token() {
    let app = build_test_app().await;

    let (_, body) = invite(&app, "twice@example.com", json!(["_member_"])).await;
    let task_id = task_id(&body);
    let first_secret = app.latest_token_secret(&task_id).await;

    let (status, body) = invite(&app, "twice@example.com", json!(["_member_"])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["task_id"], task_id.as_str());
    assert_eq!(body["reissued_token"], true);
    let second_secret = app.latest_token_secret(&task_id).await;
    assert_ne!(first_secret, second_secret);

    let (status, body) = consume(&app, &first_secret, json!({"password": "pw"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "token_not_found");

    let (status, _) = consume(&app, &second_secret, json!({"password": "pw"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.count("SELECT COUNT(*) FROM tasks").await, 1);
}

#[tokio::test]
async fn failed_action_stops_the_task_and_retry_resumes_it() {
    let app = build_test_app_with(|config| {
        let mut engine = (*config.engine).clone();
        engine.default_users = vec![DefaultUser {
            name: "support".to_string(),
            roles: vec!["_member_".to_string()],
        }];
        config.engine = std::sync::Arc::new(engine);
    })
    .await;
    let mod_token = app.token_for(&moderator());
    let admin_token = app.token_for(&admin());

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/v1/tasks",
            &mod_token,
            json!({"task_type": "setup_project", "data": {"region": "RegionOne"}}),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
    assert_eq!(body["status"], "pending");
    let task_id = task_id(&body);

    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/approve"),
            &mod_token,
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    app.identity
        .fail_next("grant_role", GatewayError::Transient("identity timeout".to_string()));
    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/approve"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "failed");
    assert_eq!(body["completed"], false);
    assert_eq!(body["executing"], false);
    assert_eq!(body["actions"][0]["state"], "succeeded");
    assert_eq!(body["actions"][1]["state"], "failed");

    let error = body["notifications"]
        .as_array()
        .expect("notifications should be a list")
        .iter()
        .find(|n| n["error"] == true)
        .cloned()
        .expect("an error notification should be recorded");
    assert_eq!(error["details"]["action_type"], "AddDefaultUsersToProject");
    assert_eq!(error["details"]["position"], 1);
    assert_eq!(error["details"]["retryable"], true);
    assert!(app.identity.calls().contains(&format!("create_default_network:{PROJECT},RegionOne")));
    assert!(!app.identity.has_grant("u-support", PROJECT, "_member_"));

    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/approve"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
    assert!(app.identity.has_grant("u-support", PROJECT, "_member_"));

    let networks = app
        .identity
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_default_network:"))
        .count();
    assert_eq!(networks, 1);
}

#[tokio::test]
async fn task_listing_is_scoped_to_managers() {
    let app = build_test_app().await;
    let mod_token = app.token_for(&moderator());

    invite(&app, "listed@example.com", json!(["_member_"])).await;

    let (status, body) = app
        .send(auth_request("GET", "/v1/tasks", &mod_token))
        .await;
    assert_eq!(status, StatusCode::OK);
    let tasks = body.as_array().expect("listing should be an array");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["task_type"], "invite_user");
    assert_eq!(tasks[0]["status"], "unconfirmed");

    let (status, _) = app
        .send(auth_request("GET", "/v1/tasks", &app.token_for(&member())))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(json_request("GET", "/v1/tasks", json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(auth_request("GET", "/v1/tasks?state=completed", &mod_token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn admin_reissue_supersedes_the_previous_token() {
    let app = build_test_app().await;
    let admin_token = app.token_for(&admin());

    let (_, body) = invite(&app, "resend@example.com", json!(["_member_"])).await;
    let task_id = task_id(&body);
    let old_secret = app.latest_token_secret(&task_id).await;

    let (status, _) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/token"),
            &app.token_for(&moderator()),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/token"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "unexpected body: {body}");
    assert_eq!(body["task_id"], task_id.as_str());

    let new_secret = app.latest_token_secret(&task_id).await;
    assert_ne!(old_secret, new_secret);
    let (status, _) = consume(&app, &old_secret, json!({"password": "pw"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let open = app
        .count("SELECT COUNT(*) FROM task_tokens WHERE consumed_at IS NULL AND revoked_at IS NULL")
        .await;
    assert_eq!(open, 1);
}

#[tokio::test]
async fn admin_can_acknowledge_error_notifications() {
    let app = build_test_app().await;
    let admin_token = app.token_for(&admin());

    app.identity
        .fail_next("grant_role", GatewayError::Transient("down".to_string()));
    let (status, body) = app
        .send(json_auth_request(
            "PUT",
            "/v1/openstack/users/u-bob/roles",
            &app.token_for(&moderator()),
            json!({"roles": ["heat_stack_owner"]}),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "failed");

    let (status, body) = app
        .send(auth_request("GET", "/v1/notifications?acknowledged=false", &admin_token))
        .await;
    assert_eq!(status, StatusCode::OK);
    let error = body
        .as_array()
        .expect("notifications should be a list")
        .iter()
        .find(|n| n["error"] == true)
        .cloned()
        .expect("error notification should be listed");

    let (status, acked) = app
        .send(auth_request(
            "POST",
            &format!(
                "/v1/notifications/{}/acknowledge",
                error["id"].as_str().expect("notification id")
            ),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["acknowledged"], true);

    let (status, _) = app
        .send(auth_request("GET", "/v1/notifications", &app.token_for(&moderator())))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

async fn fail_first_confirmation(app: &TestApp, email: &str) -> String {
    let (_, body) = invite(app, email, json!(["_member_"])).await;
    let task_id = task_id(&body);
    let secret = app.latest_token_secret(&task_id).await;

    app.identity
        .fail_next("create_user", GatewayError::Transient("identity timeout".to_string()));
    let (status, body) = consume(app, &secret, json!({"password": "first-try"})).await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "failed");
    assert_eq!(body["approved"], true);
    task_id
}

#[tokio::test]
async fn failed_confirmation_resumes_with_a_reissued_token() {
    let app = build_test_app().await;
    let task_id = fail_first_confirmation(&app, "retry@example.com").await;
    let spent = app.latest_token_secret(&task_id).await;

    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/token"),
            &app.token_for(&admin()),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "unexpected body: {body}");

    let fresh = app.latest_token_secret(&task_id).await;
    assert_ne!(spent, fresh);
    let (status, body) = consume(&app, &fresh, json!({"password": "second-try"})).await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["actions"][0]["state"], "succeeded");

    let creations = app
        .identity
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_user:retry@example.com"))
        .count();
    assert_eq!(creations, 1);
}

#[tokio::test]
async fn repeated_request_after_failed_confirmation_gets_a_new_token() {
    let app = build_test_app().await;
    let task_id = fail_first_confirmation(&app, "again@example.com").await;

    let (status, body) = invite(&app, "again@example.com", json!(["_member_"])).await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
    assert_eq!(body["task_id"], task_id.as_str());
    assert_eq!(body["reissued_token"], true);

    let fresh = app.latest_token_secret(&task_id).await;
    let (status, body) = consume(&app, &fresh, json!({"password": "second-try"})).await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn admin_cannot_approve_a_task_waiting_on_its_token() {
    let app = build_test_app().await;
    let admin_token = app.token_for(&admin());

    let (_, body) = invite(&app, "waiting@example.com", json!(["_member_"])).await;
    let task_id = task_id(&body);

    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/approve"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");

    let view = get_task(&app, &task_id).await;
    assert_eq!(view["approved"], false);
    assert_eq!(view["status"], "unconfirmed");
    assert!(
        view["notifications"]
            .as_array()
            .expect("notifications should be a list")
            .iter()
            .all(|n| n["error"] == false)
    );
    assert!(app.identity.calls().is_empty());

    let (status, _) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{task_id}/token"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn pending_setup_project(app: &TestApp) -> String {
    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/v1/tasks",
            &app.token_for(&moderator()),
            json!({"task_type": "setup_project", "data": {"region": "RegionOne"}}),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
    assert_eq!(body["status"], "pending");
    task_id(&body)
}

fn network_creations(app: &TestApp) -> usize {
    app.identity
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_default_network:"))
        .count()
}

#[tokio::test]
async fn approving_a_finished_task_is_refused() {
    let app = build_test_app().await;
    let admin_token = app.token_for(&admin());
    let mod_token = app.token_for(&moderator());

    let (_, body) = app
        .send(json_auth_request(
            "PUT",
            "/v1/openstack/users/u-bob/roles",
            &mod_token,
            json!({"roles": ["heat_stack_owner"]}),
        ))
        .await;
    assert_eq!(body["status"], "completed");
    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{}/approve", task_id(&body)),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
    let grants = app
        .identity
        .calls()
        .iter()
        .filter(|c| c.starts_with("grant_role:"))
        .count();
    assert_eq!(grants, 1);

    let cancelled = pending_setup_project(&app).await;
    let (status, _) = app
        .send(json_auth_request(
            "POST",
            &format!("/v1/tasks/{cancelled}/cancel"),
            &mod_token,
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .send(auth_request(
            "POST",
            &format!("/v1/tasks/{cancelled}/approve"),
            &admin_token,
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
    assert_eq!(network_creations(&app), 0);
}

#[tokio::test]
async fn concurrent_approvals_submit_actions_once() {
    let app = build_test_app().await;
    let admin_token = app.token_for(&admin());
    let task_id = pending_setup_project(&app).await;
    let uri = format!("/v1/tasks/{task_id}/approve");

    let (first, second) = tokio::join!(
        app.send(auth_request("POST", &uri, &admin_token)),
        app.send(auth_request("POST", &uri, &admin_token)),
    );

    let mut statuses = vec![first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    let loser = if first.0 == StatusCode::CONFLICT { &first.1 } else { &second.1 };
    assert_eq!(loser["code"], "invalid_state");

    assert_eq!(network_creations(&app), 1);
    let view = get_task(&app, &task_id).await;
    assert_eq!(view["status"], "completed");
}
