use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{Map, Value, json};

use crate::error::FieldError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    ModOrOwner,
    Admin,
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    /// Fields the token holder must supply when consuming the token.
    pub fields: &'static [&'static str],
    /// Action data field holding the address the token link is mailed to.
    pub recipient_field: &'static str,
    pub template: &'static str,
}

#[derive(Debug, Clone)]
pub struct TaskTypeDefinition {
    pub task_type: &'static str,
    pub action_types: &'static [&'static str],
    pub access: Access,
    pub confirmation: Option<Confirmation>,
    /// Ignored when a confirmation is required: consuming the token approves.
    pub auto_approve: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text { max_len: usize },
    Email,
    Bool,
    RoleList,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    fn with_default(name: &'static str, kind: FieldKind, default: Value) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionSchema {
    pub action_type: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl ActionSchema {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Checks `payload` and returns only the declared fields, defaults filled in.
    pub fn normalize(&self, payload: &Value) -> Result<Map<String, Value>, Vec<FieldError>> {
        let empty = Map::new();
        let input = match payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(vec![FieldError::new(
                    "non_field_errors",
                    "Invalid data. Expected an object.",
                )]);
            }
        };

        let mut out = Map::new();
        let mut errors = Vec::new();

        for field in &self.fields {
            match input.get(field.name).filter(|v| !v.is_null()) {
                Some(value) => match check_field(field, value) {
                    Ok(value) => {
                        out.insert(field.name.to_string(), value);
                    }
                    Err(message) => errors.push(FieldError::new(field.name, message)),
                },
                None => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        errors.push(FieldError::new(field.name, "This field is required."));
                    }
                }
            }
        }

        if errors.is_empty() { Ok(out) } else { Err(errors) }
    }
}

fn check_field(field: &FieldSpec, value: &Value) -> Result<Value, String> {
    match &field.kind {
        FieldKind::Text { max_len } => {
            let text = value.as_str().ok_or("Not a valid string.")?.trim();
            if text.is_empty() {
                return Err("This field may not be blank.".to_string());
            }
            if text.chars().count() > *max_len {
                return Err(format!("Ensure this field has no more than {max_len} characters."));
            }
            Ok(Value::String(text.to_string()))
        }
        FieldKind::Email => {
            let text = value.as_str().ok_or("Not a valid string.")?.trim();
            if !is_email(text) {
                return Err("Enter a valid email address.".to_string());
            }
            Ok(Value::String(text.to_string()))
        }
        FieldKind::Bool => value
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| "Must be a valid boolean.".to_string()),
        FieldKind::RoleList => {
            let items = value.as_array().ok_or("Expected a list of items.")?;
            if items.is_empty() {
                return Err("This list may not be empty.".to_string());
            }
            let mut roles = Vec::with_capacity(items.len());
            for item in items {
                let role = item
                    .as_str()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or("Role names must be non-empty strings.")?;
                if !roles.iter().any(|r: &String| r == role) {
                    roles.push(role.to_string());
                }
            }
            Ok(json!(roles))
        }
    }
}

fn is_email(value: &str) -> bool {
    if value.len() > 254 || value.chars().any(char::is_whitespace) {
        return false;
    }
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

static TASK_TYPES: Lazy<HashMap<&'static str, TaskTypeDefinition>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert(
        "invite_user",
        TaskTypeDefinition {
            task_type: "invite_user",
            action_types: &["InviteUser"],
            access: Access::ModOrOwner,
            confirmation: Some(Confirmation {
                fields: &["password"],
                recipient_field: "email",
                template: "invite_user",
            }),
            auto_approve: true,
        },
    );
    map.insert(
        "edit_roles",
        TaskTypeDefinition {
            task_type: "edit_roles",
            action_types: &["EditUserRoles"],
            access: Access::ModOrOwner,
            confirmation: None,
            auto_approve: true,
        },
    );
    map.insert(
        "reset_password",
        TaskTypeDefinition {
            task_type: "reset_password",
            action_types: &["ResetPassword"],
            access: Access::Public,
            confirmation: Some(Confirmation {
                fields: &["password"],
                recipient_field: "email",
                template: "reset_password",
            }),
            auto_approve: true,
        },
    );
    map.insert(
        "force_password",
        TaskTypeDefinition {
            task_type: "force_password",
            action_types: &["ForcePassword"],
            access: Access::Admin,
            confirmation: Some(Confirmation {
                fields: &["password"],
                recipient_field: "email",
                template: "force_password",
            }),
            auto_approve: true,
        },
    );
    map.insert(
        "setup_project",
        TaskTypeDefinition {
            task_type: "setup_project",
            action_types: &["NewDefaultNetwork", "AddDefaultUsersToProject"],
            access: Access::ModOrOwner,
            confirmation: None,
            auto_approve: false,
        },
    );
    map.insert(
        "project_default_network",
        TaskTypeDefinition {
            task_type: "project_default_network",
            action_types: &["NewProjectDefaultNetwork"],
            access: Access::ModOrOwner,
            confirmation: None,
            auto_approve: false,
        },
    );

    map
});

static ACTION_SCHEMAS: Lazy<HashMap<&'static str, ActionSchema>> = Lazy::new(|| {
    let schemas = vec![
        ActionSchema {
            action_type: "InviteUser",
            fields: vec![
                FieldSpec::required("email", FieldKind::Email),
                FieldSpec::required("project_id", FieldKind::Text { max_len: 64 }),
                FieldSpec::required("roles", FieldKind::RoleList),
            ],
        },
        ActionSchema {
            action_type: "EditUserRoles",
            fields: vec![
                FieldSpec::required("user_id", FieldKind::Text { max_len: 64 }),
                FieldSpec::required("project_id", FieldKind::Text { max_len: 64 }),
                FieldSpec::required("roles", FieldKind::RoleList),
                FieldSpec::with_default("remove", FieldKind::Bool, json!(false)),
            ],
        },
        ActionSchema {
            action_type: "ResetPassword",
            fields: vec![FieldSpec::required("email", FieldKind::Email)],
        },
        ActionSchema {
            action_type: "ForcePassword",
            fields: vec![FieldSpec::required("email", FieldKind::Email)],
        },
        ActionSchema {
            action_type: "NewDefaultNetwork",
            fields: vec![
                FieldSpec::with_default("setup_network", FieldKind::Bool, json!(true)),
                FieldSpec::required("project_id", FieldKind::Text { max_len: 64 }),
                FieldSpec::required("region", FieldKind::Text { max_len: 100 }),
            ],
        },
        ActionSchema {
            action_type: "NewProjectDefaultNetwork",
            fields: vec![
                FieldSpec::with_default("setup_network", FieldKind::Bool, json!(false)),
                FieldSpec::required("region", FieldKind::Text { max_len: 100 }),
            ],
        },
        ActionSchema {
            action_type: "AddDefaultUsersToProject",
            fields: vec![FieldSpec::with_default(
                "domain_id",
                FieldKind::Text { max_len: 64 },
                json!("default"),
            )],
        },
    ];

    schemas.into_iter().map(|s| (s.action_type, s)).collect()
});

pub fn task_type_definition(task_type: &str) -> Option<TaskTypeDefinition> {
    TASK_TYPES.get(task_type).cloned()
}

pub fn action_schema(action_type: &str) -> Option<ActionSchema> {
    ACTION_SCHEMAS.get(action_type).cloned()
}

pub fn all_task_types() -> Vec<&'static str> {
    TASK_TYPES.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{action_schema, all_task_types, task_type_definition};

    #[test]
    fn every_task_type_references_known_schemas() {
        for task_type in all_task_types() {
            let definition = task_type_definition(task_type).expect("definition");
            for action_type in definition.action_types {
                assert!(action_schema(action_type).is_some(), "{action_type} has no schema");
            }
        }
    }

    #[test]
    fn network_defaults_follow_declared_schema() {
        let schema = action_schema("NewDefaultNetwork").expect("schema");
        let data = schema
            .normalize(&json!({"project_id": "p1", "region": "RegionOne", "extra": 1}))
            .expect("valid payload");
        assert_eq!(data["setup_network"], json!(true));
        assert!(!data.contains_key("extra"));

        let schema = action_schema("NewProjectDefaultNetwork").expect("schema");
        let data = schema.normalize(&json!({"region": "RegionOne"})).expect("valid payload");
        assert_eq!(data["setup_network"], json!(false));
    }

    #[test]
    fn normalize_collects_every_field_error() {
        let schema = action_schema("NewDefaultNetwork").expect("schema");
        let errors = schema
            .normalize(&json!({"project_id": "x".repeat(65), "setup_network": "yes"}))
            .expect_err("payload should be rejected");
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["setup_network", "project_id", "region"]);
    }

    #[test]
    fn email_and_role_list_checks() {
        let schema = action_schema("InviteUser").expect("schema");
        let errors = schema
            .normalize(&json!({"email": "not-an-email", "project_id": "p1", "roles": []}))
            .expect_err("payload should be rejected");
        assert_eq!(errors.len(), 2);

        let data = schema
            .normalize(&json!({"email": "a@example.com", "project_id": "p1", "roles": ["_member_", "_member_"]}))
            .expect("valid payload");
        assert_eq!(data["roles"], json!(["_member_"]));
    }
}
