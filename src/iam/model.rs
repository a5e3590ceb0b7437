use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default policy document version.
pub const POLICY_VERSION: &str = "2023-01-01";

/// A directory member. Authentication happens elsewhere; this is what the caller is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Member {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

impl Member {
    pub fn anonymous() -> Self {
        Member { id: 0, username: "anonymous".to_string(), is_admin: false, is_staff: false, is_superuser: false }
    }

    pub fn is_anonymous(&self) -> bool { self.id == 0 }

    /// Admins and superusers bypass policy checks.
    pub fn bypasses_policies(&self) -> bool { self.is_admin || self.is_superuser }
}

/// Fields accepted when creating or updating a member.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemberSpec {
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

/// Either a single string or a list of strings, as policy authors write both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn items(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => vec![s.as_str()],
            OneOrMany::Many(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self { OneOrMany::Many(Vec::new()) }
}

impl From<&str> for OneOrMany {
    fn from(s: &str) -> Self { OneOrMany::One(s.to_string()) }
}

impl From<Vec<String>> for OneOrMany {
    fn from(v: Vec<String>) -> Self { OneOrMany::Many(v) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statement {
    #[serde(rename = "Effect", alias = "effect")]
    pub effect: Effect,
    #[serde(rename = "Principal", alias = "principal")]
    pub principal: OneOrMany,
    #[serde(rename = "Action", alias = "action")]
    pub action: OneOrMany,
    /// Absent means every resource
    #[serde(rename = "Resource", alias = "resource", default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(rename = "Condition", alias = "condition", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<OneOrMany>,
    #[serde(rename = "ConditionExpression", alias = "condition_expression", default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<OneOrMany>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDocument {
    #[serde(rename = "Version", alias = "version", default = "default_version")]
    pub version: String,
    #[serde(rename = "Statement", alias = "statement")]
    pub statement: Vec<Statement>,
}

fn default_version() -> String { POLICY_VERSION.to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessPolicy {
    pub user_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub configuration_code: String,
    pub policy: PolicyDocument,
    /// Usernames the policy applies to directly
    #[serde(default)]
    pub members: Vec<String>,
    /// Drawn from a store-wide counter on every write; compiled forms are cached per revision
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySpec {
    pub user_code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub configuration_code: Option<String>,
    pub policy: Option<PolicyDocument>,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    pub user_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub configuration_code: String,
    #[serde(default)]
    pub members: Vec<String>,
    /// Policy user codes
    #[serde(default)]
    pub access_policies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub user_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub configuration_code: String,
    #[serde(default)]
    pub members: Vec<String>,
    /// Role user codes
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub access_policies: Vec<String>,
}

/// Create/update payload shared by roles and groups; `roles` is ignored for roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub user_code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub configuration_code: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub access_policies: Vec<String>,
}

/// The caller as the evaluator sees it: the member plus the groups it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub member: Member,
    /// Names and user codes of the member's groups
    pub groups: Vec<String>,
}

impl Subject {
    pub fn anonymous() -> Self {
        Subject { member: Member::anonymous(), groups: Vec::new() }
    }

    pub fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }
}

/// A reference to the object a request targets, in `frn:` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRef {
    /// e.g. `explorer` or `explorer:storageobject`
    pub content_type: String,
    pub user_code: String,
    /// Resource groups the object is tagged with
    pub resource_groups: Vec<String>,
}

impl ResourceRef {
    pub fn new(content_type: impl Into<String>, user_code: impl Into<String>) -> Self {
        ResourceRef { content_type: content_type.into(), user_code: user_code.into(), resource_groups: Vec::new() }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.resource_groups = groups;
        self
    }

    pub fn frn(&self, service: &str) -> String {
        format!("frn:{}:{}:{}", service, self.content_type, self.user_code)
    }
}

/// One question put to the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub service: String,
    /// Lower-case viewset name, e.g. `explorer`, `storageobject`
    pub viewset: String,
    /// Viewset action, e.g. `list`, `create_folder`, `retrieve`
    pub action: String,
    /// Upper-case HTTP method
    pub method: String,
    pub resource: Option<ResourceRef>,
}

impl AccessRequest {
    pub fn new(service: &str, viewset: &str, action: &str, method: &str) -> Self {
        AccessRequest {
            service: service.to_string(),
            viewset: viewset.to_lowercase(),
            action: action.to_string(),
            method: method.to_uppercase(),
            resource: None,
        }
    }

    pub fn on(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Action string in `service:viewset:action` form, used for audit records.
    pub fn action_string(&self) -> String {
        format!("{}:{}:{}", self.service, self.viewset, self.action)
    }
}
