//! Statement evaluation with deny precedence.

use tracing::debug;

use crate::error::AppResult;

use super::condition::{ConditionContext, ConditionRegistry};
use super::model::{AccessRequest, Effect, Subject};
use super::statement::{CompiledPolicy, CompiledStatement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self { Decision { allow: true, reason: Some(reason.into()) } }
    pub fn deny(reason: impl Into<String>) -> Self { Decision { allow: false, reason: Some(reason.into()) } }
}

fn conditions_hold(st: &CompiledStatement, reg: &ConditionRegistry, ctx: &ConditionContext<'_>) -> AppResult<bool> {
    for atom in st.conditions.iter() {
        if !reg.call(atom, ctx)? {
            return Ok(false);
        }
    }
    for expr in st.expressions.iter() {
        if !expr.eval(reg, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Allowed iff some Allow statement matches and no Deny statement does.
/// Unknown condition methods abort with an error rather than a denial.
pub fn evaluate(
    policies: &[std::sync::Arc<CompiledPolicy>],
    subject: &Subject,
    req: &AccessRequest,
    reg: &ConditionRegistry,
) -> AppResult<Decision> {
    let ctx = ConditionContext { subject, method: &req.method, action: &req.action };
    let mut allowed_by: Option<&str> = None;
    for p in policies.iter() {
        for st in p.statements.iter() {
            if !st.applies_to(subject, req) || !conditions_hold(st, reg, &ctx)? {
                continue;
            }
            match st.effect {
                Effect::Deny => {
                    debug!(target: "fileplane::iam", policy = %p.user_code, member = %subject.member.username, action = %req.action_string(), "explicit deny");
                    return Ok(Decision::deny(format!("denied_by:{}", p.user_code)));
                }
                Effect::Allow => {
                    if allowed_by.is_none() {
                        allowed_by = Some(p.user_code.as_str());
                    }
                }
            }
        }
    }
    Ok(match allowed_by {
        Some(code) => Decision::allow(format!("allowed_by:{}", code)),
        None => Decision::deny("no_matching_statement"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::model::{Member, PolicyDocument, ResourceRef};
    use std::sync::Arc;

    fn policy(code: &str, json: serde_json::Value) -> Arc<CompiledPolicy> {
        let doc: PolicyDocument = serde_json::from_value(json).unwrap();
        Arc::new(CompiledPolicy::compile(code, 1, &doc).unwrap())
    }

    fn bob() -> Subject {
        Subject {
            member: Member { id: 5, username: "bob".into(), is_admin: false, is_staff: true, is_superuser: false },
            groups: vec![],
        }
    }

    fn read(path: &str) -> AccessRequest {
        AccessRequest::new("finmars", "explorer", "read", "GET").on(ResourceRef::new("explorer", path))
    }

    #[test]
    fn empty_set_denies() {
        let d = evaluate(&[], &bob(), &read("space00000/a.txt"), &ConditionRegistry::builtin()).unwrap();
        assert!(!d.allow);
    }

    #[test]
    fn explicit_deny_wins() {
        let allow = policy("allow-all", serde_json::json!({
            "Version": "2023-01-01",
            "Statement": [{"Effect": "Allow", "Principal": "*", "Action": ["finmars:explorer:*"], "Resource": "frn:finmars:explorer:*"}]
        }));
        let deny = policy("deny-secret", serde_json::json!({
            "Statement": [{"Effect": "Deny", "Principal": ["authenticated"], "Action": "finmars:explorer:read", "Resource": ["frn:finmars:explorer:space00000/secret/*"]}]
        }));
        let reg = ConditionRegistry::builtin();
        let both = vec![allow.clone(), deny];
        assert!(evaluate(&both, &bob(), &read("space00000/open.txt"), &reg).unwrap().allow);
        let d = evaluate(&both, &bob(), &read("space00000/secret/x.txt"), &reg).unwrap();
        assert!(!d.allow);
        assert_eq!(d.reason.as_deref(), Some("denied_by:deny-secret"));
        assert_eq!(evaluate(&[allow], &bob(), &read("space00000/secret/x.txt"), &reg).unwrap().reason.as_deref(), Some("allowed_by:allow-all"));
    }

    #[test]
    fn conditions_gate_statements() {
        let p = policy("staff-writes", serde_json::json!({
            "Statement": [{
                "Effect": "Allow", "Principal": "*", "Action": "finmars:explorer:*",
                "Condition": ["is_staff"],
                "ConditionExpression": "is_method:POST or is_method:GET"
            }]
        }));
        let reg = ConditionRegistry::builtin();
        assert!(evaluate(&[p.clone()], &bob(), &read("space00000/a"), &reg).unwrap().allow);
        let del = AccessRequest::new("finmars", "explorer", "delete", "DELETE");
        assert!(!evaluate(&[p.clone()], &bob(), &del, &reg).unwrap().allow);
        assert!(!evaluate(&[p], &Subject::anonymous(), &read("space00000/a"), &reg).unwrap().allow);
    }

    #[test]
    fn unknown_condition_surfaces_as_error() {
        let p = policy("odd", serde_json::json!({
            "Statement": [{"Effect": "Allow", "Principal": "*", "Action": "finmars:explorer:*", "Condition": "is_full_moon"}]
        }));
        let err = evaluate(&[p], &bob(), &read("space00000/a"), &ConditionRegistry::builtin()).unwrap_err();
        assert_eq!(err.error_key(), "policy_unknown_condition");
    }

    #[test]
    fn missing_resource_means_every_resource() {
        let p = policy("any", serde_json::json!({
            "Statement": [{"Effect": "Allow", "Principal": "id:5", "Action": "finmars:explorer:read"}]
        }));
        assert!(evaluate(&[p], &bob(), &read("anything/at/all"), &ConditionRegistry::builtin()).unwrap().allow);
    }
}
