//! Path access gate: "may member M read/write path P?"
//!
//! Access to a node is granted by a policy whose `user_code` is the node's canonical
//! code for the access level and whose members include M. Grants on a directory
//! are inherited by everything below it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::iam::model::POLICY_VERSION;
use crate::iam::{AccessPolicy, Iam, Member, PolicyDocument, PolicySpec, Statement};
use crate::iam::model::{Effect, OneOrMany};
use crate::index::{PathIndex, StorageNode};
use crate::paths;

/// Owner recorded on policies created through the gate.
pub const BOT_MEMBER: &str = "finmars_bot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            other => Err(AppError::validation("access".to_string(), format!("access: '{}' is not one of read, write", other))),
        }
    }
}

/// `<configuration_code>:<service>:explorer:<path>-<access>`
pub fn canonical_user_code(configuration_code: &str, service: &str, path: &str, access: AccessLevel) -> String {
    format!("{}:{}:explorer:{}-{}", configuration_code, service, path, access.as_str())
}

#[derive(Clone)]
pub struct AccessGate {
    index: PathIndex,
    iam: Iam,
}

impl AccessGate {
    pub fn new(index: PathIndex, iam: Iam) -> Self {
        Self { index, iam }
    }

    pub fn user_code(&self, path: &str, access: AccessLevel) -> String {
        canonical_user_code(self.iam.directory().configuration_code(), self.iam.service(), path, access)
    }

    fn granted(&self, member: &Member, path: &str, access: AccessLevel) -> AppResult<bool> {
        let code = self.user_code(path, access);
        Ok(self.iam.directory().get_policy(&code)?.map(|p| p.members.iter().any(|m| *m == member.username)).unwrap_or(false))
    }

    /// Direct grant first, then any ancestor root-first.
    pub fn has_access(&self, member: &Member, node: &StorageNode, access: AccessLevel) -> AppResult<bool> {
        if self.granted(member, &node.path, access)? {
            return Ok(true);
        }
        if node.parent.is_none() {
            return Ok(false);
        }
        for anc in self.index.ancestors(node, true)? {
            if self.granted(member, &anc.path, access)? {
                debug!(target: "fileplane::gate", member = %member.username, path = %node.path, via = %anc.path, access = access.as_str(), "inherited grant");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve `path` (file, or directory in any form) first; an unindexed path is denied.
    pub fn has_access_to_path(&self, member: &Member, path: &str, access: AccessLevel) -> AppResult<bool> {
        match self.index.resolve(path)? {
            Some(node) => self.has_access(member, &node, access),
            None => Ok(false),
        }
    }

    /// For paths that may not exist yet: check the path if indexed, else its deepest indexed ancestor.
    pub fn check_new_path(&self, member: &Member, path: &str, access: AccessLevel) -> AppResult<bool> {
        if let Some(node) = self.index.resolve(path)? {
            return self.has_access(member, &node, access);
        }
        for anc in paths::ancestor_paths(&paths::normalize(path)?).iter().rev() {
            if let Some(node) = self.index.get_by_path(anc)? {
                return self.has_access(member, &node, access);
            }
        }
        Ok(false)
    }

    /// Boundary form: admins pass; a denial is PERMISSION_DENIED; a missing node is
    /// NOT_FOUND only for callers that could write into its parent.
    pub fn require(&self, member: &Member, path: &str, access: AccessLevel) -> AppResult<StorageNode> {
        let Some(node) = self.index.resolve(path)? else {
            let parent_writable = member.bypasses_policies()
                || match paths::parent_of(&paths::normalize(path)?) {
                    Some(parent) => self.check_new_path(member, &parent, AccessLevel::Write)?,
                    None => false,
                };
            return Err(if parent_writable {
                AppError::not_found("path_not_found".to_string(), format!("'{}' does not exist", path))
            } else {
                self.denied(member, path, access)
            });
        };
        if member.bypasses_policies() || self.has_access(member, &node, access)? {
            return Ok(node);
        }
        Err(self.denied(member, path, access))
    }

    /// Boundary form of [`AccessGate::check_new_path`].
    pub fn require_new(&self, member: &Member, path: &str, access: AccessLevel) -> AppResult<()> {
        if member.bypasses_policies() || self.check_new_path(member, path, access)? {
            return Ok(());
        }
        Err(self.denied(member, path, access))
    }

    fn denied(&self, member: &Member, path: &str, access: AccessLevel) -> AppError {
        info!(target: "fileplane::gate", member = %member.username, path, access = access.as_str(), "access denied");
        AppError::permission_denied(
            "path_access_denied".to_string(),
            format!("{} has no {} access to '{}'", member.username, access.as_str(), path),
        )
    }

    pub fn policy_template(&self, path: &str, access: AccessLevel) -> PolicyDocument {
        let svc = self.iam.service();
        let mut actions = vec![format!("{}:explorer:read", svc)];
        if access == AccessLevel::Write {
            actions.push(format!("{}:explorer:write", svc));
        }
        PolicyDocument {
            version: POLICY_VERSION.to_string(),
            statement: vec![Statement {
                effect: Effect::Allow,
                principal: OneOrMany::from("*"),
                action: OneOrMany::from(actions),
                resource: Some(OneOrMany::One(format!("frn:{}:explorer:{}", svc, path))),
                condition: None,
                condition_expression: None,
            }],
        }
    }

    /// Get or create the canonical policy for `path`/`access` and add the member to it.
    pub fn grant(&self, path: &str, access: AccessLevel, username: &str) -> AppResult<AccessPolicy> {
        let path = paths::normalize(path)?;
        let code = self.user_code(&path, access);
        self.iam.directory().get_or_create_policy(&code, || PolicySpec {
            user_code: code.clone(),
            name: Some(path.clone()),
            description: Some(format!("{} : {} access policy", path, access.as_str())),
            owner: Some(BOT_MEMBER.to_string()),
            configuration_code: None,
            policy: Some(self.policy_template(&path, access)),
            members: Vec::new(),
        })?;
        let p = self.iam.directory().add_policy_member(&code, username)?;
        info!(target: "fileplane::gate", member = username, path = %path, access = access.as_str(), "access granted");
        Ok(p)
    }

    /// Remove the member from the canonical policy; absent policies are ignored.
    pub fn revoke(&self, path: &str, access: AccessLevel, username: &str) -> AppResult<()> {
        let path = paths::normalize(path)?;
        let code = self.user_code(&path, access);
        if self.iam.directory().get_policy(&code)?.is_some() {
            self.iam.directory().remove_policy_member(&code, username)?;
            info!(target: "fileplane::gate", member = username, path = %path, access = access.as_str(), "access revoked");
        }
        Ok(())
    }
}
