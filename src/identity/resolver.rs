use tracing::debug;

use crate::error::AppResult;
use crate::iam::{Directory, Member};

use super::Principal;

/// Turns a principal into a directory member. Unknown names are anonymous.
#[derive(Clone)]
pub struct MemberResolver {
    directory: Directory,
}

impl MemberResolver {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }

    pub fn resolve(&self, principal: &Principal) -> AppResult<Member> {
        if !principal.is_named() {
            return Ok(Member::anonymous());
        }
        match self.directory.get_member(&principal.username)? {
            Some(m) => Ok(m),
            None => {
                debug!(target: "fileplane::identity", username = %principal.username, "unknown member, treating as anonymous");
                Ok(Member::anonymous())
            }
        }
    }
}
