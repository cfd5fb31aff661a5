//! Request, policy and decision types exchanged with the decision point.
//!
//! Wire field names are camelCase.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::PdpError;

// =============================================================================
// Permission Check
// =============================================================================

/// The subject asking for access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Subject identifier. Must be non-empty.
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

/// The resource being accessed: either a bare name or a typed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resource {
    /// A resource referenced by name only.
    Name(String),

    /// A typed resource with an optional identifier and free-form attributes.
    Object {
        #[serde(rename = "type", default)]
        resource_type: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,

        #[serde(flatten)]
        attributes: Map<String, Value>,
    },
}

impl Resource {
    /// Creates a typed resource with no id or attributes.
    #[must_use]
    pub fn typed(resource_type: impl Into<String>) -> Self {
        Self::Object {
            resource_type: resource_type.into(),
            id: None,
            attributes: Map::new(),
        }
    }

    /// The name used for policy selection: the string itself, or the object's `type`.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Object { resource_type, .. } => resource_type,
        }
    }
}

/// One authorization question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default)]
    pub subject: Subject,

    #[serde(default)]
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,

    #[serde(default)]
    pub context: Map<String, Value>,
}

impl PermissionCheck {
    /// Creates a check with an empty context and no tenant.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, action: impl Into<String>, resource: Resource) -> Self {
        Self {
            tenant_id: None,
            subject: Subject {
                id: subject_id.into(),
                ..Subject::default()
            },
            action: action.into(),
            resource: Some(resource),
            context: Map::new(),
        }
    }

    /// Checks that the request is complete enough to evaluate.
    ///
    /// # Errors
    ///
    /// Returns `PdpError::Validation` if the action or resource is missing or
    /// empty, or the subject id is empty.
    pub fn validate(&self) -> Result<&Resource, PdpError> {
        let resource = match &self.resource {
            Some(resource) if !self.action.trim().is_empty() && !resource.name().is_empty() => {
                resource
            }
            _ => {
                return Err(PdpError::validation(
                    "Action and resource are required for permission check.",
                ));
            }
        };

        if self.subject.id.trim().is_empty() {
            return Err(PdpError::validation(
                "Subject id is required for permission check.",
            ));
        }

        Ok(resource)
    }

    /// Builds the document handed to the evaluation engine.
    ///
    /// `tenantId` is omitted when absent.
    #[must_use]
    pub fn to_input(&self) -> Value {
        let mut input = Map::new();
        if let Some(tenant_id) = &self.tenant_id {
            input.insert("tenantId".to_string(), Value::String(tenant_id.clone()));
        }
        input.insert(
            "subject".to_string(),
            serde_json::to_value(&self.subject).unwrap_or(Value::Null),
        );
        input.insert("action".to_string(), Value::String(self.action.clone()));
        input.insert(
            "resource".to_string(),
            serde_json::to_value(&self.resource).unwrap_or(Value::Null),
        );
        input.insert("context".to_string(), Value::Object(self.context.clone()));
        Value::Object(input)
    }
}

// =============================================================================
// Policy
// =============================================================================

/// A stored authorization rule set, as fetched from the policy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    #[serde(alias = "name")]
    pub policy_name: String,

    #[serde(alias = "policy")]
    pub policy_definition: String,

    #[serde(default = "default_language")]
    pub policy_language: String,

    #[serde(default = "default_version")]
    pub version: i64,
}

fn default_language() -> String {
    "rego".to_string()
}

fn default_version() -> i64 {
    1
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {other}"
        ))),
    }
}

impl Policy {
    /// Parses and checks one record from the policy source.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a required field is missing,
    /// has the wrong type, or is empty.
    pub fn from_record(record: &Value) -> Result<Self, String> {
        let policy: Self = serde_json::from_value(record.clone()).map_err(|e| e.to_string())?;

        if policy.id.trim().is_empty() {
            return Err("policy id is empty".to_string());
        }
        if policy.policy_name.trim().is_empty() {
            return Err(format!("policy '{}' has an empty name", policy.id));
        }
        if policy.policy_definition.trim().is_empty() {
            return Err(format!(
                "policy '{}' has an empty definition",
                policy.policy_name
            ));
        }
        Ok(policy)
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDecision {
    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obligations: Option<Value>,
}

impl AuthorizationDecision {
    /// A deny decision with the given reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            obligations: None,
        }
    }
}
