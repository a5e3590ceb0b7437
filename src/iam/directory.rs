//! Persistent IAM directory: members, access policies, roles and groups.
//!
//! Every write that can change somebody's effective policy set publishes an
//! [`IamEvent`] naming the affected members, so caches never depend on the
//! write path remembering to clear them.

use std::collections::BTreeSet;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::storage::{KvStore, SharedStore};

use super::model::{AccessPolicy, ContainerSpec, Group, Member, MemberSpec, PolicySpec, Role, Subject};
use super::statement::CompiledPolicy;

pub const STORE_NAME: &str = "iam";

/// Invalidation signal for per-member caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamEvent {
    /// Effective policies of these usernames may have changed
    Members(Vec<String>),
    /// These policies were removed; their compiled forms are stale
    Policies(Vec<String>),
    All,
}

pub struct Keys;

impl Keys {
    pub fn member(username: &str) -> String { format!("iam.member::{}", username) }
    pub fn member_prefix() -> &'static str { "iam.member::" }
    pub fn member_seq() -> &'static str { "iam.member.seq" }
    pub fn policy(code: &str) -> String { format!("iam.policy::{}", code) }
    pub fn policy_prefix() -> &'static str { "iam.policy::" }
    /// Store-wide policy revision counter; never reused, even across delete and recreate
    pub fn policy_revision_seq() -> &'static str { "iam.policy.revision" }
    pub fn role(code: &str) -> String { format!("iam.role::{}", code) }
    pub fn role_prefix() -> &'static str { "iam.role::" }
    pub fn group(code: &str) -> String { format!("iam.group::{}", code) }
    pub fn group_prefix() -> &'static str { "iam.group::" }
}

fn internal(e: anyhow::Error) -> AppError {
    AppError::internal("iam_store".to_string(), e.to_string())
}

fn required(field: &str, value: &str) -> AppResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(AppError::validation(field.to_string(), format!("{}: this field is required", field)));
    }
    Ok(v.to_string())
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

#[derive(Clone)]
pub struct Directory {
    kv: KvStore,
    configuration_code: String,
    events: broadcast::Sender<IamEvent>,
}

impl Directory {
    pub fn open(store: &SharedStore, space: &str, configuration_code: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { kv: store.kv_store(space, STORE_NAME), configuration_code: configuration_code.to_string(), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IamEvent> { self.events.subscribe() }

    pub fn configuration_code(&self) -> &str { &self.configuration_code }

    fn publish(&self, ev: IamEvent) {
        if matches!(&ev, IamEvent::Members(m) if m.is_empty()) {
            return;
        }
        // No subscribers is fine
        let _ = self.events.send(ev);
    }

    // ---- members ----

    /// Create the member or update its flags; the id is assigned once.
    pub fn upsert_member(&self, spec: MemberSpec) -> AppResult<Member> {
        let username = required("username", &spec.username)?;
        let member = self.kv.transaction(|txn| -> AppResult<Member> {
            let existing = txn.get_json::<Member>(&Keys::member(&username)).map_err(internal)?;
            let id = match existing {
                Some(m) => m.id,
                None => txn.incr(Keys::member_seq(), 1) as u64,
            };
            let m = Member {
                id,
                username: username.clone(),
                is_admin: spec.is_admin,
                is_staff: spec.is_staff,
                is_superuser: spec.is_superuser,
            };
            txn.set_json(Keys::member(&username), &m).map_err(internal)?;
            Ok(m)
        })?;
        self.publish(IamEvent::Members(vec![username]));
        Ok(member)
    }

    /// Fetch or create a plain member.
    pub fn ensure_member(&self, username: &str) -> AppResult<Member> {
        match self.get_member(username)? {
            Some(m) => Ok(m),
            None => self.upsert_member(MemberSpec { username: username.to_string(), ..MemberSpec::default() }),
        }
    }

    pub fn get_member(&self, username: &str) -> AppResult<Option<Member>> {
        self.kv.get_json(&Keys::member(username)).map_err(internal)
    }

    pub fn list_members(&self) -> Vec<Member> {
        let mut out: Vec<Member> = self.kv.scan_json(Keys::member_prefix());
        out.sort_by_key(|m| m.id);
        out
    }

    /// Remove the member and every membership it had.
    pub fn delete_member(&self, username: &str) -> AppResult<()> {
        if self.get_member(username)?.is_none() {
            return Err(AppError::not_found("member_not_found".to_string(), format!("member '{}' does not exist", username)));
        }
        self.kv.transaction(|txn| -> AppResult<()> {
            txn.delete(&Keys::member(username));
            for (k, mut p) in txn.scan_json::<AccessPolicy>(Keys::policy_prefix()) {
                if p.members.iter().any(|m| m == username) {
                    p.members.retain(|m| m != username);
                    p.revision = txn.incr(Keys::policy_revision_seq(), 1) as u64;
                    txn.set_json(k, &p).map_err(internal)?;
                }
            }
            for (k, mut r) in txn.scan_json::<Role>(Keys::role_prefix()) {
                if r.members.iter().any(|m| m == username) {
                    r.members.retain(|m| m != username);
                    txn.set_json(k, &r).map_err(internal)?;
                }
            }
            for (k, mut g) in txn.scan_json::<Group>(Keys::group_prefix()) {
                if g.members.iter().any(|m| m == username) {
                    g.members.retain(|m| m != username);
                    txn.set_json(k, &g).map_err(internal)?;
                }
            }
            Ok(())
        })?;
        self.publish(IamEvent::Members(vec![username.to_string()]));
        Ok(())
    }

    // ---- access policies ----

    pub fn get_policy(&self, code: &str) -> AppResult<Option<AccessPolicy>> {
        self.kv.get_json(&Keys::policy(code)).map_err(internal)
    }

    pub fn require_policy(&self, code: &str) -> AppResult<AccessPolicy> {
        self.get_policy(code)?
            .ok_or_else(|| AppError::not_found("policy_not_found".to_string(), format!("access policy '{}' does not exist", code)))
    }

    pub fn list_policies(&self) -> Vec<AccessPolicy> {
        self.kv.scan_json(Keys::policy_prefix())
    }

    pub fn create_policy(&self, spec: PolicySpec) -> AppResult<AccessPolicy> {
        let code = required("user_code", &spec.user_code)?;
        let doc = spec
            .policy
            .ok_or_else(|| AppError::validation("policy".to_string(), "policy: this field is required".to_string()))?;
        CompiledPolicy::compile(&code, 0, &doc)?;
        let now = Utc::now();
        let mut policy = AccessPolicy {
            name: spec.name.unwrap_or_else(|| code.clone()),
            description: spec.description.unwrap_or_default(),
            owner: spec.owner,
            configuration_code: spec.configuration_code.unwrap_or_else(|| self.configuration_code.clone()),
            policy: doc,
            members: dedup(spec.members),
            revision: 0,
            created_at: now,
            modified_at: now,
            user_code: code.clone(),
        };
        self.kv.transaction(|txn| -> AppResult<()> {
            if txn.get(&Keys::policy(&code)).is_some() {
                return Err(AppError::conflict("policy_exists".to_string(), format!("access policy '{}' already exists", code)));
            }
            policy.revision = txn.incr(Keys::policy_revision_seq(), 1) as u64;
            txn.set_json(Keys::policy(&code), &policy).map_err(internal)
        })?;
        info!(target: "fileplane::iam", code = %code, members = policy.members.len(), "access policy created");
        self.publish(IamEvent::Members(policy.members.clone()));
        Ok(policy)
    }

    /// Fields left `None` keep their value; the member list is always replaced.
    pub fn update_policy(&self, code: &str, spec: PolicySpec) -> AppResult<AccessPolicy> {
        if let Some(doc) = spec.policy.as_ref() {
            CompiledPolicy::compile(code, 0, doc)?;
        }
        let before = self.affected_by_policy(code);
        let updated = self.mutate_policy(code, |p| {
            if let Some(n) = spec.name { p.name = n; }
            if let Some(d) = spec.description { p.description = d; }
            if let Some(o) = spec.owner { p.owner = Some(o); }
            if let Some(doc) = spec.policy { p.policy = doc; }
            p.members = dedup(spec.members);
        })?;
        let mut affected = before;
        affected.extend(updated.members.iter().cloned());
        self.publish(IamEvent::Members(dedup(affected)));
        Ok(updated)
    }

    pub fn add_policy_member(&self, code: &str, username: &str) -> AppResult<AccessPolicy> {
        let p = self.mutate_policy(code, |p| {
            if !p.members.iter().any(|m| m == username) {
                p.members.push(username.to_string());
            }
        })?;
        self.publish(IamEvent::Members(vec![username.to_string()]));
        Ok(p)
    }

    pub fn remove_policy_member(&self, code: &str, username: &str) -> AppResult<AccessPolicy> {
        let p = self.mutate_policy(code, |p| p.members.retain(|m| m != username))?;
        self.publish(IamEvent::Members(vec![username.to_string()]));
        Ok(p)
    }

    /// Return the policy with `code`, creating it from `make` when absent.
    pub fn get_or_create_policy(&self, code: &str, make: impl FnOnce() -> PolicySpec) -> AppResult<AccessPolicy> {
        if let Some(p) = self.get_policy(code)? {
            return Ok(p);
        }
        match self.create_policy(make()) {
            Err(AppError::Conflict { .. }) => self.require_policy(code),
            other => other,
        }
    }

    pub fn delete_policy(&self, code: &str) -> AppResult<()> {
        let affected = self.affected_by_policy(code);
        self.require_policy(code)?;
        self.kv.transaction(|txn| -> AppResult<()> {
            txn.delete(&Keys::policy(code));
            for (k, mut r) in txn.scan_json::<Role>(Keys::role_prefix()) {
                if r.access_policies.iter().any(|c| c == code) {
                    r.access_policies.retain(|c| c != code);
                    txn.set_json(k, &r).map_err(internal)?;
                }
            }
            for (k, mut g) in txn.scan_json::<Group>(Keys::group_prefix()) {
                if g.access_policies.iter().any(|c| c == code) {
                    g.access_policies.retain(|c| c != code);
                    txn.set_json(k, &g).map_err(internal)?;
                }
            }
            Ok(())
        })?;
        info!(target: "fileplane::iam", code, "access policy deleted");
        self.publish(IamEvent::Policies(vec![code.to_string()]));
        self.publish(IamEvent::Members(affected));
        Ok(())
    }

    fn mutate_policy(&self, code: &str, f: impl FnOnce(&mut AccessPolicy)) -> AppResult<AccessPolicy> {
        self.kv.transaction(|txn| -> AppResult<AccessPolicy> {
            let Some(mut p) = txn.get_json::<AccessPolicy>(&Keys::policy(code)).map_err(internal)? else {
                return Err(AppError::not_found("policy_not_found".to_string(), format!("access policy '{}' does not exist", code)));
            };
            f(&mut p);
            p.revision = txn.incr(Keys::policy_revision_seq(), 1) as u64;
            p.modified_at = Utc::now();
            txn.set_json(Keys::policy(code), &p).map_err(internal)?;
            Ok(p)
        })
    }

    fn check_policies_exist(&self, codes: &[String]) -> AppResult<()> {
        let missing: Vec<&str> = codes.iter().filter(|c| self.kv.get(&Keys::policy(c)).is_none()).map(|c| c.as_str()).collect();
        if !missing.is_empty() {
            return Err(AppError::validation(
                "access_policies".to_string(),
                format!("access_policies: unknown access policy(ies) {}", missing.join(", ")),
            ));
        }
        Ok(())
    }

    // ---- roles ----

    pub fn get_role(&self, code: &str) -> AppResult<Option<Role>> {
        self.kv.get_json(&Keys::role(code)).map_err(internal)
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.kv.scan_json(Keys::role_prefix())
    }

    pub fn create_role(&self, spec: ContainerSpec) -> AppResult<Role> {
        let code = required("user_code", &spec.user_code)?;
        self.check_policies_exist(&spec.access_policies)?;
        let role = Role {
            name: spec.name.unwrap_or_else(|| code.clone()),
            description: spec.description.unwrap_or_default(),
            configuration_code: spec.configuration_code.unwrap_or_else(|| self.configuration_code.clone()),
            members: dedup(spec.members),
            access_policies: dedup(spec.access_policies),
            user_code: code.clone(),
        };
        self.put_new(Keys::role(&code), &role, "role", &code)?;
        let affected = self.affected_by_role(&code);
        self.publish(IamEvent::Members(affected));
        Ok(role)
    }

    pub fn update_role(&self, code: &str, spec: ContainerSpec) -> AppResult<Role> {
        self.check_policies_exist(&spec.access_policies)?;
        let before = self.affected_by_role(code);
        let role = self.kv.transaction(|txn| -> AppResult<Role> {
            let Some(mut r) = txn.get_json::<Role>(&Keys::role(code)).map_err(internal)? else {
                return Err(AppError::not_found("role_not_found".to_string(), format!("role '{}' does not exist", code)));
            };
            if let Some(n) = spec.name { r.name = n; }
            if let Some(d) = spec.description { r.description = d; }
            r.members = dedup(spec.members);
            r.access_policies = dedup(spec.access_policies);
            txn.set_json(Keys::role(code), &r).map_err(internal)?;
            Ok(r)
        })?;
        let mut affected = before;
        affected.extend(self.affected_by_role(code));
        self.publish(IamEvent::Members(dedup(affected)));
        Ok(role)
    }

    pub fn delete_role(&self, code: &str) -> AppResult<()> {
        let affected = self.affected_by_role(code);
        if self.get_role(code)?.is_none() {
            return Err(AppError::not_found("role_not_found".to_string(), format!("role '{}' does not exist", code)));
        }
        self.kv.transaction(|txn| -> AppResult<()> {
            txn.delete(&Keys::role(code));
            for (k, mut g) in txn.scan_json::<Group>(Keys::group_prefix()) {
                if g.roles.iter().any(|r| r == code) {
                    g.roles.retain(|r| r != code);
                    txn.set_json(k, &g).map_err(internal)?;
                }
            }
            Ok(())
        })?;
        self.publish(IamEvent::Members(affected));
        Ok(())
    }

    // ---- groups ----

    pub fn get_group(&self, code: &str) -> AppResult<Option<Group>> {
        self.kv.get_json(&Keys::group(code)).map_err(internal)
    }

    pub fn list_groups(&self) -> Vec<Group> {
        self.kv.scan_json(Keys::group_prefix())
    }

    fn check_roles_exist(&self, codes: &[String]) -> AppResult<()> {
        let missing: Vec<&str> = codes.iter().filter(|c| self.kv.get(&Keys::role(c)).is_none()).map(|c| c.as_str()).collect();
        if !missing.is_empty() {
            return Err(AppError::validation("roles".to_string(), format!("roles: unknown role(s) {}", missing.join(", "))));
        }
        Ok(())
    }

    pub fn create_group(&self, spec: ContainerSpec) -> AppResult<Group> {
        let code = required("user_code", &spec.user_code)?;
        self.check_policies_exist(&spec.access_policies)?;
        self.check_roles_exist(&spec.roles)?;
        let group = Group {
            name: spec.name.unwrap_or_else(|| code.clone()),
            description: spec.description.unwrap_or_default(),
            configuration_code: spec.configuration_code.unwrap_or_else(|| self.configuration_code.clone()),
            members: dedup(spec.members),
            roles: dedup(spec.roles),
            access_policies: dedup(spec.access_policies),
            user_code: code.clone(),
        };
        self.put_new(Keys::group(&code), &group, "group", &code)?;
        self.publish(IamEvent::Members(group.members.clone()));
        Ok(group)
    }

    pub fn update_group(&self, code: &str, spec: ContainerSpec) -> AppResult<Group> {
        self.check_policies_exist(&spec.access_policies)?;
        self.check_roles_exist(&spec.roles)?;
        let mut affected = self.get_group(code)?.map(|g| g.members).unwrap_or_default();
        let group = self.kv.transaction(|txn| -> AppResult<Group> {
            let Some(mut g) = txn.get_json::<Group>(&Keys::group(code)).map_err(internal)? else {
                return Err(AppError::not_found("group_not_found".to_string(), format!("group '{}' does not exist", code)));
            };
            if let Some(n) = spec.name { g.name = n; }
            if let Some(d) = spec.description { g.description = d; }
            g.members = dedup(spec.members);
            g.roles = dedup(spec.roles);
            g.access_policies = dedup(spec.access_policies);
            txn.set_json(Keys::group(code), &g).map_err(internal)?;
            Ok(g)
        })?;
        affected.extend(group.members.iter().cloned());
        self.publish(IamEvent::Members(dedup(affected)));
        Ok(group)
    }

    pub fn delete_group(&self, code: &str) -> AppResult<()> {
        let Some(g) = self.get_group(code)? else {
            return Err(AppError::not_found("group_not_found".to_string(), format!("group '{}' does not exist", code)));
        };
        self.kv.delete(&Keys::group(code));
        self.publish(IamEvent::Members(g.members));
        Ok(())
    }

    fn put_new<T: serde::Serialize>(&self, key: String, value: &T, what: &str, code: &str) -> AppResult<()> {
        self.kv.transaction(|txn| -> AppResult<()> {
            if txn.get(&key).is_some() {
                return Err(AppError::conflict(format!("{}_exists", what), format!("{} '{}' already exists", what, code)));
            }
            txn.set_json(key.clone(), value).map_err(internal)
        })?;
        info!(target: "fileplane::iam", kind = what, code, "created");
        Ok(())
    }

    // ---- resolution ----

    pub fn groups_of(&self, username: &str) -> Vec<Group> {
        self.list_groups().into_iter().filter(|g| g.members.iter().any(|m| m == username)).collect()
    }

    pub fn subject(&self, member: &Member) -> Subject {
        if member.is_anonymous() {
            return Subject::anonymous();
        }
        let mut groups = Vec::new();
        for g in self.groups_of(&member.username) {
            groups.push(g.name.clone());
            if g.user_code != g.name {
                groups.push(g.user_code);
            }
        }
        Subject { member: member.clone(), groups }
    }

    /// Direct, role-mediated and group-mediated policy codes, without duplicates.
    pub fn effective_policy_codes(&self, username: &str) -> Vec<String> {
        let mut codes: Vec<String> = self
            .list_policies()
            .into_iter()
            .filter(|p| p.members.iter().any(|m| m == username))
            .map(|p| p.user_code)
            .collect();
        let roles = self.list_roles();
        for r in roles.iter().filter(|r| r.members.iter().any(|m| m == username)) {
            codes.extend(r.access_policies.iter().cloned());
        }
        for g in self.groups_of(username) {
            codes.extend(g.access_policies.iter().cloned());
            for r in roles.iter().filter(|r| g.roles.contains(&r.user_code)) {
                codes.extend(r.access_policies.iter().cloned());
            }
        }
        dedup(codes)
    }

    pub fn effective_policies(&self, username: &str) -> AppResult<Vec<AccessPolicy>> {
        let mut out = Vec::new();
        for code in self.effective_policy_codes(username) {
            if let Some(p) = self.get_policy(&code)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// Everybody whose effective set includes the policy.
    pub fn affected_by_policy(&self, code: &str) -> Vec<String> {
        let mut out: Vec<String> = self.get_policy(code).ok().flatten().map(|p| p.members).unwrap_or_default();
        let roles = self.list_roles();
        let holding_roles: Vec<&Role> = roles.iter().filter(|r| r.access_policies.iter().any(|c| c == code)).collect();
        for r in holding_roles.iter() {
            out.extend(r.members.iter().cloned());
        }
        for g in self.list_groups() {
            let direct = g.access_policies.iter().any(|c| c == code);
            let via_role = holding_roles.iter().any(|r| g.roles.contains(&r.user_code));
            if direct || via_role {
                out.extend(g.members.iter().cloned());
            }
        }
        dedup(out)
    }

    pub fn affected_by_role(&self, code: &str) -> Vec<String> {
        let mut out: Vec<String> = self.get_role(code).ok().flatten().map(|r| r.members).unwrap_or_default();
        for g in self.list_groups().into_iter().filter(|g| g.roles.iter().any(|r| r == code)) {
            out.extend(g.members);
        }
        dedup(out)
    }
}
