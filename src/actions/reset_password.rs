use async_trait::async_trait;

use super::{ActionContext, ActionError, ActionHandler, ActionOutcome};
use crate::identity::IdentityUser;

async fn target_user(ctx: &ActionContext<'_>) -> Result<IdentityUser, ActionError> {
    let email = ctx.str_field("email")?;
    ctx.gateway
        .find_user(email)
        .await?
        .ok_or_else(|| ActionError::field("email", "No user with this email address."))
}

fn new_password<'a>(ctx: &'a ActionContext<'_>) -> Result<&'a str, ActionError> {
    ctx.confirmation_str("password")
        .ok_or_else(|| ActionError::field("password", "This field is required."))
}

/// Sets a new password chosen by the holder of the emailed link.
pub struct ResetPassword;

#[async_trait]
impl ActionHandler for ResetPassword {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        target_user(ctx).await.map(|_| ())
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let user = target_user(ctx).await?;
        let password = new_password(ctx)?;
        ctx.gateway.reset_credential(&user.id, password).await?;
        Ok(ActionOutcome::Succeeded(vec![format!(
            "password reset for user {}",
            user.id
        )]))
    }
}

/// Administrator initiated reset. Once the link holder confirms, existing
/// credentials are invalidated and the chosen password is set.
pub struct ForcePassword;

#[async_trait]
impl ActionHandler for ForcePassword {
    async fn validate(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        target_user(ctx).await.map(|_| ())
    }

    async fn submit(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let user = target_user(ctx).await?;
        let password = new_password(ctx)?;
        ctx.gateway.force_reset_credential(&user.id).await?;
        ctx.gateway.reset_credential(&user.id, password).await?;
        Ok(ActionOutcome::Succeeded(vec![
            format!("credentials invalidated for user {}", user.id),
            format!("password set for user {}", user.id),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ForcePassword, ResetPassword};
    use crate::actions::{
        ActionError, ActionHandler,
        test_support::{Fixture, data},
    };

    #[tokio::test]
    async fn unknown_email_fails_validation() {
        let fixture = Fixture::new();
        let payload = data(json!({"email": "ghost@example.com"}));
        let ctx = fixture.ctx("reset_password", &payload);

        let err = ResetPassword.validate(&ctx).await.expect_err("no such user");
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[tokio::test]
    async fn force_variant_invalidates_before_setting() {
        let mut fixture = Fixture::new();
        fixture.identity.add_user("u1", "a@example.com", "a@example.com");
        fixture
            .confirmation
            .insert("password".to_string(), json!("fresh-pass"));
        let payload = data(json!({"email": "a@example.com"}));
        let ctx = fixture.ctx("force_password", &payload);

        ForcePassword.submit(&ctx).await.expect("force reset should succeed");
        assert_eq!(
            fixture.identity.calls(),
            vec![
                "force_reset_credential:u1".to_string(),
                "reset_credential:u1".to_string()
            ]
        );
        assert_eq!(fixture.identity.password_of("u1").as_deref(), Some("fresh-pass"));
    }
}
