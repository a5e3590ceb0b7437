use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::iam::Member;

use super::Principal;

/// One access decision taken while serving a request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccessEnforcement {
    pub action: String,
    pub resource: String,
    pub allowed: bool,
}

#[derive(Debug)]
pub struct RequestContext {
    pub principal: Principal,
    pub member: Member,
    pub request_id: String,
    pub space_code: String,
    enforcements: Mutex<Vec<AccessEnforcement>>,
}

impl RequestContext {
    pub fn new(principal: Principal, member: Member, space_code: &str) -> Self {
        let request_id = principal
            .attrs
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self { principal, member, request_id, space_code: space_code.to_string(), enforcements: Mutex::new(Vec::new()) }
    }

    /// Record a decision and emit it as an audit event.
    pub fn record(&self, action: &str, resource: &str, allowed: bool) {
        info!(
            target: "fileplane::audit",
            request_id = %self.request_id,
            member = %self.member.username,
            action,
            resource,
            allowed,
            "access enforcement"
        );
        self.enforcements.lock().push(AccessEnforcement { action: action.to_string(), resource: resource.to_string(), allowed });
    }

    pub fn enforcements(&self) -> Vec<AccessEnforcement> {
        self.enforcements.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_and_generates_request_ids() {
        let ctx = RequestContext::new(Principal::default(), Member::anonymous(), "space00000");
        assert!(!ctx.request_id.is_empty());
        ctx.record("explorer:read", "space00000/a.txt", true);
        ctx.record("explorer:write", "space00000/a.txt", false);
        let seen = ctx.enforcements();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].allowed && !seen[1].allowed);
    }
}
