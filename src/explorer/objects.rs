//! Index nodes as addressable objects: sharing, resource groups and the
//! storage-object endpoints.

use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::gate::AccessLevel;
use crate::groups::STORAGE_OBJECT;
use crate::iam::{AccessPolicy, ResourceRef};
use crate::identity::RequestContext;
use crate::index::StorageNode;

use super::listing::{self, PageRequest, Paged};
use super::{client_path, Explorer};

const VIEWSET: &str = "storageobject";

/// The only writable field of a storage object.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageObjectPatch {
    resource_groups: Vec<String>,
}

fn object_ref(node: &StorageNode) -> ResourceRef {
    ResourceRef::new(STORAGE_OBJECT, node.path.clone()).with_groups(node.resource_groups.clone())
}

impl Explorer {
    fn in_space(&self, node: &StorageNode) -> bool {
        node.tree_id == self.space_code
    }

    /// The indexed node at a client path, gated for `access`.
    fn gated_node(&self, ctx: &RequestContext, action: &str, path: &str, access: AccessLevel) -> AppResult<StorageNode> {
        let rel = client_path(path, "path", true)?;
        let full = self.full(&rel);
        let Some(node) = self.index.resolve(&full)? else {
            ctx.record(action, &full, false);
            return Err(AppError::not_found("path_not_found".to_string(), format!("'{}' does not exist", rel)));
        };
        let res = self.gate.require(&ctx.member, &node.path, access);
        ctx.record(action, &node.path, res.is_ok());
        res
    }

    /// Add `username` to the canonical policy of a path. Sharing needs WRITE.
    pub fn set_access_policy(&self, ctx: &RequestContext, path: &str, access: &str, username: &str) -> AppResult<AccessPolicy> {
        let access = AccessLevel::parse(access)?;
        let node = self.gated_node(ctx, "explorer:set_access_policy", path, AccessLevel::Write)?;
        if self.iam.directory().get_member(username)?.is_none() {
            return Err(AppError::not_found("member_not_found".to_string(), format!("member '{}' does not exist", username)));
        }
        let policy = self.gate.grant(&node.path, access, username)?;
        info!(target: "fileplane::explorer", by = %ctx.member.username, member = username, path = %node.path, access = access.as_str(), "access policy set");
        Ok(policy)
    }

    /// Replace a node's resource groups; an empty list clears them.
    pub fn set_resource_group(&self, ctx: &RequestContext, path: &str, groups: &[String]) -> AppResult<StorageNode> {
        let node = self.gated_node(ctx, "explorer:set_resource_group", path, AccessLevel::Write)?;
        let node = self.groups.set_groups(&node, groups)?;
        info!(target: "fileplane::explorer", path = %node.path, groups = ?node.resource_groups, "resource groups set");
        Ok(node)
    }

    /// Index nodes of the space under an optional path prefix, limited to what the
    /// caller's statements permit.
    pub fn list_storage_objects(&self, ctx: &RequestContext, prefix: Option<&str>, page: PageRequest) -> AppResult<Paged<StorageNode>> {
        let scope = match prefix {
            Some(p) => self.full(&client_path(p, "path", true)?),
            None => format!("{}/", self.space_code),
        };
        let nodes: Vec<StorageNode> = self.index.list_nodes(&scope).into_iter().filter(|n| self.in_space(n)).collect();
        let req = self.iam.request(VIEWSET, "list", "GET");
        let permitted = self.iam.filter_permitted(&ctx.member, &req, nodes, object_ref)?;
        ctx.record(&req.action_string(), &scope, true);
        listing::paginate(permitted, page)
    }

    fn object_for(&self, ctx: &RequestContext, id: u64, action: &str, method: &str) -> AppResult<StorageNode> {
        let node = self
            .index
            .get_by_id(id)?
            .filter(|n| self.in_space(n))
            .ok_or_else(|| AppError::not_found("storage_object_not_found".to_string(), format!("storage object {} does not exist", id)))?;
        let req = self.iam.request(VIEWSET, action, method).on(object_ref(&node));
        let res = self.iam.authorize(&ctx.member, &req);
        ctx.record(&req.action_string(), &node.path, res.is_ok());
        res.map(|_| node)
    }

    pub fn get_storage_object(&self, ctx: &RequestContext, id: u64) -> AppResult<StorageNode> {
        self.object_for(ctx, id, "retrieve", "GET")
    }

    /// Only `resource_groups` may change; `path` is immutable.
    pub fn patch_storage_object(&self, ctx: &RequestContext, id: u64, body: serde_json::Value) -> AppResult<StorageNode> {
        if body.get("path").is_some() {
            return Err(AppError::validation("path", "path: field is immutable"));
        }
        let patch: StorageObjectPatch = serde_json::from_value(body)
            .map_err(|e| AppError::validation("resource_groups".to_string(), format!("resource_groups: {}", e)))?;
        let node = self.object_for(ctx, id, "partial_update", "PATCH")?;
        self.groups.set_groups(&node, &patch.resource_groups)
    }
}
