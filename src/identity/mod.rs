//! Caller identity for HTTP requests.
//! Authentication happens upstream; the member is named by a header and resolved in the
//! IAM member directory. Each request carries a context that records its access checks.

mod principal;
mod request_context;
mod resolver;

pub use principal::{Attrs, Principal, MEMBER_HEADER, REQUEST_ID_HEADER};
pub use request_context::{AccessEnforcement, RequestContext};
pub use resolver::MemberResolver;
