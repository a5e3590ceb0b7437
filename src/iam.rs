//! Attribute-based access policies.
//!
//! `Iam` ties the persistent [`Directory`] to the per-member [`PolicyCache`] and the
//! statement [`evaluator`]. Admins and superusers bypass evaluation entirely.

pub mod model;
pub mod condition;
pub mod statement;
pub mod evaluator;
pub mod directory;
pub mod cache;

use std::sync::Arc;

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::storage::SharedStore;

pub use cache::PolicyCache;
pub use condition::ConditionRegistry;
pub use directory::{Directory, IamEvent};
pub use evaluator::Decision;
pub use model::{AccessPolicy, AccessRequest, ContainerSpec, Effect, Member, MemberSpec, PolicyDocument, PolicySpec, ResourceRef, Statement, Subject};
pub use statement::CompiledPolicy;

#[derive(Clone)]
pub struct Iam {
    directory: Directory,
    cache: Arc<PolicyCache>,
    conditions: Arc<ConditionRegistry>,
    service: String,
}

impl Iam {
    pub fn open(store: &SharedStore, space: &str, configuration_code: &str, service: &str) -> Self {
        let directory = Directory::open(store, space, configuration_code);
        let cache = Arc::new(PolicyCache::new(directory.subscribe()));
        Self { directory, cache, conditions: Arc::new(ConditionRegistry::builtin()), service: service.to_string() }
    }

    /// Replace the condition registry, e.g. to add deployment-specific conditions.
    pub fn with_conditions(mut self, reg: ConditionRegistry) -> Self {
        self.conditions = Arc::new(reg);
        self
    }

    pub fn directory(&self) -> &Directory { &self.directory }
    pub fn cache(&self) -> &PolicyCache { &self.cache }
    pub fn service(&self) -> &str { &self.service }

    pub fn request(&self, viewset: &str, action: &str, method: &str) -> AccessRequest {
        AccessRequest::new(&self.service, viewset, action, method)
    }

    pub fn effective_policies(&self, member: &Member) -> AppResult<Vec<Arc<CompiledPolicy>>> {
        if member.is_anonymous() {
            return Ok(Vec::new());
        }
        let dir = &self.directory;
        self.cache.get_or_load(&member.username, &self.conditions, || dir.effective_policies(&member.username))
    }

    pub fn evaluate(&self, member: &Member, req: &AccessRequest) -> AppResult<Decision> {
        if member.bypasses_policies() {
            return Ok(Decision::allow("admin"));
        }
        let policies = self.effective_policies(member)?;
        let subject = self.directory.subject(member);
        let d = evaluator::evaluate(&policies, &subject, req, &self.conditions)?;
        debug!(target: "fileplane::iam", member = %member.username, action = %req.action_string(), allow = d.allow, reason = ?d.reason, "policy decision");
        Ok(d)
    }

    /// Like [`Iam::evaluate`] but a denial becomes `POLICY_DENY`.
    pub fn authorize(&self, member: &Member, req: &AccessRequest) -> AppResult<()> {
        let d = self.evaluate(member, req)?;
        if d.allow {
            return Ok(());
        }
        Err(AppError::policy_deny(
            d.reason.unwrap_or_else(|| "policy_deny".to_string()),
            format!("{} may not perform {}", member.username, req.action_string()),
        ))
    }

    /// Keep the resources `member` may act on with `req`; the request's own resource is ignored.
    pub fn filter_permitted<T>(
        &self,
        member: &Member,
        req: &AccessRequest,
        items: Vec<T>,
        to_ref: impl Fn(&T) -> ResourceRef,
    ) -> AppResult<Vec<T>> {
        if member.bypasses_policies() {
            return Ok(items);
        }
        let policies = self.effective_policies(member)?;
        let subject = self.directory.subject(member);
        let mut out = Vec::with_capacity(items.len());
        for it in items {
            let r = req.clone().on(to_ref(&it));
            if evaluator::evaluate(&policies, &subject, &r, &self.conditions)?.allow {
                out.push(it);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod iam_tests;
