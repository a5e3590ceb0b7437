use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::identity::{Principal, RequestContext};

use super::AppState;

/// The calling member, resolved from the identity headers.
pub struct Caller(pub RequestContext);

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = Principal::from_headers(&parts.headers);
        let member = state.resolver.resolve(&principal)?;
        Ok(Caller(RequestContext::new(principal, member, state.explorer.space_code())))
    }
}
