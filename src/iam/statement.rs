//! Compiled statement parts: principals, action patterns, resource patterns.

use crate::error::{AppError, AppResult};

use super::condition::{parse_expression, Atom, ConditionRegistry, Expr};
use super::model::{AccessRequest, Effect, PolicyDocument, ResourceRef, Statement, Subject};

pub const SAFE_METHODS: [&str; 3] = ["GET", "HEAD", "OPTIONS"];
const RESOURCE_GROUP_TYPE: &str = "iam:resourcegroup:";

fn parse_err(code: &str, msg: String) -> AppError {
    AppError::policy_parse(code.to_string(), msg)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalPattern {
    Any,
    Admin,
    Staff,
    Authenticated,
    Anonymous,
    Id(u64),
    Group(String),
}

impl PrincipalPattern {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        let p = match raw {
            "*" => PrincipalPattern::Any,
            "admin" => PrincipalPattern::Admin,
            "staff" => PrincipalPattern::Staff,
            "authenticated" => PrincipalPattern::Authenticated,
            "anonymous" => PrincipalPattern::Anonymous,
            _ => {
                if let Some(pk) = raw.strip_prefix("id:") {
                    let id = pk.parse().map_err(|_| parse_err("bad_principal", format!("invalid principal id '{}'", raw)))?;
                    PrincipalPattern::Id(id)
                } else if let Some(g) = raw.strip_prefix("group:") {
                    if g.is_empty() {
                        return Err(parse_err("bad_principal", "empty group principal".to_string()));
                    }
                    PrincipalPattern::Group(g.to_string())
                } else {
                    return Err(parse_err("bad_principal", format!("unknown principal '{}'", raw)));
                }
            }
        };
        Ok(p)
    }

    pub fn matches(&self, s: &Subject) -> bool {
        match self {
            PrincipalPattern::Any => true,
            PrincipalPattern::Admin => s.member.is_admin || s.member.is_superuser,
            PrincipalPattern::Staff => s.member.is_staff,
            PrincipalPattern::Authenticated => !s.member.is_anonymous(),
            PrincipalPattern::Anonymous => s.member.is_anonymous(),
            PrincipalPattern::Id(id) => !s.member.is_anonymous() && s.member.id == *id,
            PrincipalPattern::Group(g) => s.in_group(g),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Any,
    Literal(String),
    Method(String),
    SafeMethods,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPattern {
    pub service: String,
    /// Lower-case viewset, or `*`
    pub viewset: String,
    pub verb: Verb,
}

impl ActionPattern {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(ActionPattern { service: "*".into(), viewset: "*".into(), verb: Verb::Any });
        }
        let parts: Vec<&str> = raw.splitn(3, ':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(parse_err("bad_action", format!("action '{}' is not service:resource:verb", raw)));
        }
        let verb = match parts[2] {
            "*" => Verb::Any,
            "<safe_methods>" => Verb::SafeMethods,
            v if v.starts_with("<method:") && v.ends_with('>') => {
                let m = &v["<method:".len()..v.len() - 1];
                if !["get", "post", "put", "patch", "delete", "head", "options"].contains(&m.to_lowercase().as_str()) {
                    return Err(parse_err("bad_action", format!("unknown method in action '{}'", raw)));
                }
                Verb::Method(m.to_uppercase())
            }
            v if v.starts_with('<') => return Err(parse_err("bad_action", format!("unknown verb form in action '{}'", raw))),
            v => Verb::Literal(v.to_string()),
        };
        Ok(ActionPattern { service: parts[0].to_lowercase(), viewset: parts[1].to_lowercase(), verb })
    }

    pub fn matches(&self, req: &AccessRequest) -> bool {
        if self.service != "*" && !self.service.eq_ignore_ascii_case(&req.service) {
            return false;
        }
        if self.viewset != "*" && self.viewset != req.viewset {
            return false;
        }
        match &self.verb {
            Verb::Any => true,
            Verb::Literal(v) => *v == req.action,
            Verb::Method(m) => *m == req.method,
            Verb::SafeMethods => SAFE_METHODS.contains(&req.method.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePattern {
    Any,
    /// `frn:<service>:` plus a lower-cased `<content_type>:<user_code>` body; `prefix` when it ended in `*`
    Name { service: String, body: String, prefix: bool },
    /// `frn:<service>:iam:resourcegroup:<code>`, matching objects tagged with the group
    Group { service: String, code: String },
}

impl ResourcePattern {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(ResourcePattern::Any);
        }
        let bad = || parse_err("bad_resource", format!("resource '{}' is not frn:<service>:<type>:<code>", raw));
        let rest = raw.strip_prefix("frn:").ok_or_else(bad)?;
        let (service, body) = rest.split_once(':').ok_or_else(bad)?;
        if service.is_empty() || body.is_empty() {
            return Err(bad());
        }
        let service = service.to_lowercase();
        if let Some(code) = body.strip_prefix(RESOURCE_GROUP_TYPE) {
            return Ok(ResourcePattern::Group { service, code: code.to_string() });
        }
        if body != "*" && !body.contains(':') {
            return Err(bad());
        }
        let (body, prefix) = match body.strip_suffix('*') {
            Some(b) => (b, true),
            None => (body, false),
        };
        Ok(ResourcePattern::Name { service, body: body.to_lowercase(), prefix })
    }

    pub fn matches(&self, service: &str, res: &ResourceRef) -> bool {
        match self {
            ResourcePattern::Any => true,
            ResourcePattern::Name { service: s, body, prefix } => {
                if s != "*" && !s.eq_ignore_ascii_case(service) {
                    return false;
                }
                let target = format!("{}:{}", res.content_type, res.user_code).to_lowercase();
                if *prefix { target.starts_with(body.as_str()) } else { target == *body }
            }
            ResourcePattern::Group { service: s, code } => {
                (s == "*" || s.eq_ignore_ascii_case(service)) && res.resource_groups.iter().any(|g| g == code)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledStatement {
    pub effect: Effect,
    pub principals: Vec<PrincipalPattern>,
    pub actions: Vec<ActionPattern>,
    pub resources: Vec<ResourcePattern>,
    pub conditions: Vec<Atom>,
    pub expressions: Vec<Expr>,
}

impl CompiledStatement {
    pub fn compile(st: &Statement) -> AppResult<Self> {
        let principals = st.principal.items().into_iter().map(PrincipalPattern::parse).collect::<AppResult<Vec<_>>>()?;
        let actions = st.action.items().into_iter().map(ActionPattern::parse).collect::<AppResult<Vec<_>>>()?;
        let resources = match &st.resource {
            None => vec![ResourcePattern::Any],
            Some(r) => r.items().into_iter().map(ResourcePattern::parse).collect::<AppResult<Vec<_>>>()?,
        };
        let conditions = match &st.condition {
            None => Vec::new(),
            Some(c) => c.items().into_iter().map(Atom::parse).collect::<AppResult<Vec<_>>>()?,
        };
        let expressions = match &st.condition_expression {
            None => Vec::new(),
            Some(c) => c.items().into_iter().map(parse_expression).collect::<AppResult<Vec<_>>>()?,
        };
        if principals.is_empty() || actions.is_empty() {
            return Err(parse_err("bad_statement", "statement needs at least one principal and one action".to_string()));
        }
        Ok(CompiledStatement { effect: st.effect, principals, actions, resources, conditions, expressions })
    }

    /// Principal, action and resource all match; conditions are checked by the evaluator.
    pub fn applies_to(&self, subject: &Subject, req: &AccessRequest) -> bool {
        if !self.principals.iter().any(|p| p.matches(subject)) {
            return false;
        }
        if !self.actions.iter().any(|a| a.matches(req)) {
            return false;
        }
        match &req.resource {
            None => true,
            Some(res) => self.resources.iter().any(|r| r.matches(&req.service, res)),
        }
    }
}

/// A policy document ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub user_code: String,
    pub revision: u64,
    pub statements: Vec<CompiledStatement>,
}

impl CompiledPolicy {
    pub fn compile(user_code: &str, revision: u64, doc: &PolicyDocument) -> AppResult<Self> {
        let statements = doc
            .statement
            .iter()
            .map(CompiledStatement::compile)
            .collect::<AppResult<Vec<_>>>()
            .map_err(|e| match e {
                AppError::PolicyParse { code, message } => {
                    AppError::PolicyParse { code, message: format!("policy '{}': {}", user_code, message) }
                }
                other => other,
            })?;
        Ok(CompiledPolicy { user_code: user_code.to_string(), revision, statements })
    }

    /// Every condition atom, including those inside expressions, must be registered.
    /// Evaluation short-circuits, so this is the only place all of them are seen.
    pub fn check_conditions(&self, reg: &ConditionRegistry) -> AppResult<()> {
        for st in self.statements.iter() {
            let atoms = st.conditions.iter().chain(st.expressions.iter().flat_map(|e| e.atoms()));
            for atom in atoms {
                reg.require(atom).map_err(|e| match e {
                    AppError::PolicyUnknownCondition { code, message } => AppError::PolicyUnknownCondition {
                        code,
                        message: format!("policy '{}': {}", self.user_code, message),
                    },
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}
